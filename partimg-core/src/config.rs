//! Runtime knobs for a transfer session.
use crate::checksum::ChecksumAlgorithm;
use crate::error::{Error, Result};

/// Default I/O buffer: 1 MiB.
pub const DEFAULT_IO_BUFFER_SIZE: usize = 1024 * 1024;
pub const DEFAULT_BLOCKS_PER_CHECKSUM: u32 = 64;
pub const DEFAULT_PROGRESS_CAPACITY: usize = 32;
/// Granularity of rescue-mode retries.
pub const SECTOR_SIZE: usize = 512;

/// Which way a session moves data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    CloneToImage,
    CloneToPartition,
    RestoreFromImage,
}

#[derive(Clone, Debug)]
pub struct TransferConfig {
    /// Bytes moved per I/O cycle; rounded down to whole blocks, minimum one.
    pub io_buffer_size: usize,
    /// Algorithm for newly written images.
    pub checksum: ChecksumAlgorithm,
    /// Blocks covered by each checksum tag; 0 writes no tags.
    pub blocks_per_checksum: u32,
    /// Restart the checksum register after every tag.
    pub reseed: bool,
    /// Zero-fill unreadable sectors instead of failing.
    pub rescue: bool,
    /// Log and continue on destination write errors (partition copy only).
    pub skip_write_errors: bool,
    /// Consume checksum tags on restore without comparing them.
    pub ignore_checksum: bool,
    /// Compare source and destination after a partition copy.
    pub verify: bool,
    /// Capacity of the worker's progress channel.
    pub progress_capacity: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            io_buffer_size: DEFAULT_IO_BUFFER_SIZE,
            checksum: ChecksumAlgorithm::Crc32,
            blocks_per_checksum: DEFAULT_BLOCKS_PER_CHECKSUM,
            reseed: true,
            rescue: false,
            skip_write_errors: false,
            ignore_checksum: false,
            verify: false,
            progress_capacity: DEFAULT_PROGRESS_CAPACITY,
        }
    }
}

impl TransferConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn io_buffer_size(mut self, size: usize) -> Self {
        self.io_buffer_size = size;
        self
    }

    pub fn checksum(mut self, algorithm: ChecksumAlgorithm, blocks_per_checksum: u32) -> Self {
        self.checksum = algorithm;
        self.blocks_per_checksum = blocks_per_checksum;
        self
    }

    pub fn reseed(mut self, reseed: bool) -> Self {
        self.reseed = reseed;
        self
    }

    pub fn rescue(mut self, rescue: bool) -> Self {
        self.rescue = rescue;
        self
    }

    pub fn skip_write_errors(mut self, skip: bool) -> Self {
        self.skip_write_errors = skip;
        self
    }

    pub fn ignore_checksum(mut self, ignore: bool) -> Self {
        self.ignore_checksum = ignore;
        self
    }

    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Blocks per I/O cycle for the given block size.
    pub fn chunk_capacity(&self, block_size: u32) -> u64 {
        (self.io_buffer_size as u64 / u64::from(block_size.max(1))).max(1)
    }

    pub fn validate(&self, direction: Direction) -> Result<()> {
        if self.io_buffer_size == 0 {
            return Err(Error::InvalidConfig("I/O buffer size must be non-zero".into()));
        }
        if direction == Direction::CloneToImage && self.checksum.is_legacy() {
            return Err(Error::InvalidConfig(
                "the legacy CRC can only be read, not written".into(),
            ));
        }
        if self.skip_write_errors && direction != Direction::CloneToPartition {
            return Err(Error::InvalidConfig(
                "skipping write errors is only allowed for partition copies".into(),
            ));
        }
        Ok(())
    }
}
