//! Per-block checksum accumulation for the image data stream.
//!
//! A [`ChecksumStream`] folds every block into a running CRC register and,
//! after each checksum group, hands out the register as a little-endian tag.
//! The algorithm lives in the stream itself; there is no process-wide mode.
use std::fmt;

/// Seed of every CRC register, and the value it returns to on reseed.
pub const CRC_SEED: u32 = 0xFFFF_FFFF;

const POLY: u32 = 0xEDB8_8320;

const fn make_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC_TABLE: [u32; 256] = make_table();

/// Checksum algorithm recorded in the image options. The discriminants are
/// the on-disk codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u16)]
pub enum ChecksumAlgorithm {
    None = 0x00,
    #[default]
    Crc32 = 0x20,
    /// Historical CRC that folds the first input byte over and over instead
    /// of walking the buffer. Only ever read, never written.
    Crc32Legacy = 0xFF,
}

impl ChecksumAlgorithm {
    /// Size in bytes of one checksum tag.
    pub const fn size(self) -> usize {
        match self {
            ChecksumAlgorithm::None => 0,
            ChecksumAlgorithm::Crc32 | ChecksumAlgorithm::Crc32Legacy => 4,
        }
    }

    pub const fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x00 => Some(ChecksumAlgorithm::None),
            0x20 => Some(ChecksumAlgorithm::Crc32),
            0xFF => Some(ChecksumAlgorithm::Crc32Legacy),
            _ => None,
        }
    }

    pub fn is_legacy(self) -> bool {
        self == ChecksumAlgorithm::Crc32Legacy
    }

    /// Folds `bytes` into the register `acc` and returns the new register.
    pub fn fold(self, acc: u32, bytes: &[u8]) -> u32 {
        match self {
            ChecksumAlgorithm::None => acc,
            ChecksumAlgorithm::Crc32 => {
                // crc32fast keeps the complemented register; undo that on both
                // ends so the raw register (no final xor) is what gets stored.
                let mut hasher = crc32fast::Hasher::new_with_initial(!acc);
                hasher.update(bytes);
                !hasher.finalize()
            }
            ChecksumAlgorithm::Crc32Legacy => {
                let Some(&first) = bytes.first() else {
                    return acc;
                };
                let mut crc = acc;
                for _ in 0..bytes.len() {
                    crc = CRC_TABLE[((crc ^ u32::from(first)) & 0xFF) as usize] ^ (crc >> 8);
                }
                crc
            }
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumAlgorithm::None => f.write_str("none"),
            ChecksumAlgorithm::Crc32 => f.write_str("crc32"),
            ChecksumAlgorithm::Crc32Legacy => f.write_str("crc32-legacy"),
        }
    }
}

/// CRC over `bytes` from a fresh seed, as used by the header and bitmap guards.
pub fn crc32(bytes: &[u8]) -> u32 {
    ChecksumAlgorithm::Crc32.fold(CRC_SEED, bytes)
}

/// Running checksum over the blocks of one transfer session.
#[derive(Clone, Debug)]
pub struct ChecksumStream {
    algorithm: ChecksumAlgorithm,
    seed: u32,
    value: u32,
}

impl ChecksumStream {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        Self::with_seed(algorithm, CRC_SEED)
    }

    pub fn with_seed(algorithm: ChecksumAlgorithm, seed: u32) -> Self {
        Self {
            algorithm,
            seed,
            value: seed,
        }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn size(&self) -> usize {
        self.algorithm.size()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.value = self.algorithm.fold(self.value, bytes);
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    /// Puts the register back to its seed.
    pub fn reset(&mut self) {
        self.value = self.seed;
    }

    /// Appends the current tag (`size()` bytes) to `out`.
    pub fn append_tag(&self, out: &mut Vec<u8>) {
        let bytes = self.value.to_le_bytes();
        out.extend_from_slice(&bytes[..self.size()]);
    }

    /// Decodes a stored tag. Returns `None` for the zero-sized algorithm.
    pub fn decode_tag(&self, tag: &[u8]) -> Option<u32> {
        match self.size() {
            4 => Some(u32::from_le_bytes([tag[0], tag[1], tag[2], tag[3]])),
            _ => None,
        }
    }
}
