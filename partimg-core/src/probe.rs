//! The filesystem capability the engine depends on.
//!
//! Filesystem-specific code (ext2/3/4 group bitmaps, FAT chains, XFS free
//! space trees) lives outside this crate and plugs in through
//! [`FilesystemProbe`]. The engine only ever sees a [`BlockBitmap`] and a
//! [`FilesystemDescriptor`].
use std::io::SeekFrom;

use tracing::warn;

use crate::bitmap::BlockBitmap;
use crate::device::ReadSeek;
use crate::error::{Error, Result};
use crate::image::FilesystemDescriptor;

pub const DEFAULT_RAW_BLOCK_SIZE: u32 = 4096;

pub trait FilesystemProbe {
    /// Short name used in logs.
    fn name(&self) -> &str;

    fn probe_filesystem(&self, device: &mut dyn ReadSeek) -> Result<FilesystemDescriptor>;

    fn read_allocation_bitmap(
        &self,
        device: &mut dyn ReadSeek,
        descriptor: &FilesystemDescriptor,
    ) -> Result<BlockBitmap>;
}

/// Treats every block of the device as allocated.
#[derive(Clone, Debug)]
pub struct RawProbe {
    block_size: u32,
}

impl RawProbe {
    pub fn new(block_size: u32) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::InvalidConfig("raw block size must be non-zero".into()));
        }
        Ok(Self { block_size })
    }
}

impl Default for RawProbe {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_RAW_BLOCK_SIZE,
        }
    }
}

impl FilesystemProbe for RawProbe {
    fn name(&self) -> &str {
        "raw"
    }

    fn probe_filesystem(&self, device: &mut dyn ReadSeek) -> Result<FilesystemDescriptor> {
        let size = device.seek(SeekFrom::End(0))?;
        device.seek(SeekFrom::Start(0))?;
        let block_size = u64::from(self.block_size);
        let total_blocks = size / block_size;
        if size % block_size != 0 {
            warn!(
                size,
                block_size,
                tail = size % block_size,
                "device size is not a multiple of the block size, the tail is not imaged"
            );
        }
        Ok(FilesystemDescriptor::new(
            "RAW",
            self.block_size,
            total_blocks,
            total_blocks,
        ))
    }

    fn read_allocation_bitmap(
        &self,
        _device: &mut dyn ReadSeek,
        descriptor: &FilesystemDescriptor,
    ) -> Result<BlockBitmap> {
        let mut bitmap = BlockBitmap::create(descriptor.total_blocks)?;
        bitmap.set_all();
        Ok(bitmap)
    }
}
