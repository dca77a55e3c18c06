//! Dense allocation bitmap, one bit per block, least significant bit first.
use crate::error::{Error, Result};

/// Bit `i` set means block `i` is allocated and must be preserved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockBitmap {
    total_blocks: u64,
    bits: Vec<u8>,
}

/// Number of bytes needed to hold `total_blocks` bits.
pub fn bitmap_len(total_blocks: u64) -> usize {
    total_blocks.div_ceil(8) as usize
}

impl BlockBitmap {
    /// Creates a zero-filled bitmap.
    ///
    /// The backing storage is reserved fallibly so that a huge device maps to
    /// [`Error::InsufficientMemory`] instead of an allocator abort.
    pub fn create(total_blocks: u64) -> Result<Self> {
        let len = bitmap_len(total_blocks);
        let mut bits = Vec::new();
        bits.try_reserve_exact(len)
            .map_err(|_| Error::InsufficientMemory {
                needed: len as u64,
                available: 0,
            })?;
        bits.resize(len, 0);
        Ok(Self { total_blocks, bits })
    }

    /// Wraps raw bitmap bytes. Padding bits past `total_blocks` are cleared.
    pub fn from_bytes(total_blocks: u64, mut bits: Vec<u8>) -> Result<Self> {
        let expected = bitmap_len(total_blocks);
        if bits.len() != expected {
            return Err(Error::Format(format!(
                "bitmap is {} bytes, expected {} for {} blocks",
                bits.len(),
                expected,
                total_blocks
            )));
        }
        let tail = (total_blocks % 8) as u32;
        if tail != 0 {
            if let Some(last) = bits.last_mut() {
                *last &= (1u8 << tail) - 1;
            }
        }
        Ok(Self { total_blocks, bits })
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    fn check(&self, index: u64) -> Result<()> {
        if index >= self.total_blocks {
            return Err(Error::OutOfRange {
                index,
                total: self.total_blocks,
            });
        }
        Ok(())
    }

    pub fn get(&self, index: u64) -> Result<bool> {
        self.check(index)?;
        Ok(self.bit(index))
    }

    pub fn set(&mut self, index: u64) -> Result<()> {
        self.check(index)?;
        self.bits[(index / 8) as usize] |= 1 << (index % 8);
        Ok(())
    }

    pub fn clear(&mut self, index: u64) -> Result<()> {
        self.check(index)?;
        self.bits[(index / 8) as usize] &= !(1 << (index % 8));
        Ok(())
    }

    /// Marks every block allocated.
    pub fn set_all(&mut self) {
        self.bits.fill(0xFF);
        let tail = (self.total_blocks % 8) as u32;
        if tail != 0 {
            if let Some(last) = self.bits.last_mut() {
                *last = (1u8 << tail) - 1;
            }
        }
    }

    /// Counts allocated blocks with a full scan. Padding bits never count.
    pub fn count_set(&self) -> u64 {
        let full = (self.total_blocks / 8) as usize;
        let mut count: u64 = self.bits[..full]
            .iter()
            .map(|b| u64::from(b.count_ones()))
            .sum();
        for index in (full as u64 * 8)..self.total_blocks {
            if self.bit(index) {
                count += 1;
            }
        }
        count
    }

    /// First allocated block at or after `from`, if any.
    pub fn next_set(&self, from: u64) -> Option<u64> {
        let mut index = from;
        while index < self.total_blocks {
            let byte = self.bits[(index / 8) as usize];
            if index % 8 == 0 && byte == 0 {
                index += 8;
                continue;
            }
            if self.bit(index) {
                return Some(index);
            }
            index += 1;
        }
        None
    }

    /// Length of the run of allocated blocks starting at `from`, capped at `max`.
    pub fn run_len(&self, from: u64, max: u64) -> u64 {
        let mut len = 0;
        while len < max && from + len < self.total_blocks && self.bit(from + len) {
            len += 1;
        }
        len
    }

    /// Iterator over `(first_block, block_count)` chunks of contiguous
    /// allocated blocks, each at most `capacity` blocks long.
    pub fn chunks(&self, capacity: u64) -> Chunks<'_> {
        Chunks {
            bitmap: self,
            cursor: 0,
            capacity: capacity.max(1),
        }
    }

    #[inline]
    fn bit(&self, index: u64) -> bool {
        self.bits[(index / 8) as usize] & (1 << (index % 8)) != 0
    }
}

/// Produced by [`BlockBitmap::chunks`].
pub struct Chunks<'a> {
    bitmap: &'a BlockBitmap,
    cursor: u64,
    capacity: u64,
}

impl Iterator for Chunks<'_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.bitmap.next_set(self.cursor)?;
        let len = self.bitmap.run_len(start, self.capacity);
        self.cursor = start + len;
        Some((start, len))
    }
}
