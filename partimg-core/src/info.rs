//! Read-only image metadata queries.
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::bitmap::BlockBitmap;
use crate::error::{Error, Result};
use crate::image::{self, ImageHead};

#[derive(Debug)]
pub struct ImageInfo {
    pub head: ImageHead,
    pub bitmap: BlockBitmap,
    /// Set when the bitmap CRC failed and corruption was tolerated.
    pub bitmap_corruption: Option<Error>,
    /// Allocated blocks counted from the bitmap.
    pub used_blocks_counted: u64,
    /// Size the complete image should have on disk.
    pub expected_size: u64,
}

impl ImageInfo {
    pub fn used_blocks_mismatch(&self) -> bool {
        self.head.descriptor.used_blocks != self.used_blocks_counted
    }
}

/// Parses the head and bitmap of an image.
///
/// With `tolerate_bitmap_corruption`, a bitmap CRC mismatch is returned in
/// [`ImageInfo::bitmap_corruption`] instead of failing the query. Header
/// errors always fail.
pub fn read_image_info<R: Read + ?Sized>(
    stream: &mut R,
    tolerate_bitmap_corruption: bool,
) -> Result<ImageInfo> {
    let head = image::read_header(stream)?;
    let lenient = image::read_bitmap_lenient(
        stream,
        head.descriptor.total_blocks,
        head.options.bitmap_encoding,
    )?;
    if let Some(err) = lenient.corruption {
        if !tolerate_bitmap_corruption {
            return Err(err);
        }
        return Ok(build(head, lenient.bitmap, Some(err)));
    }
    Ok(build(head, lenient.bitmap, None))
}

fn build(head: ImageHead, bitmap: BlockBitmap, bitmap_corruption: Option<Error>) -> ImageInfo {
    let used_blocks_counted = bitmap.count_set();
    let mut descriptor = head.descriptor.clone();
    descriptor.used_blocks_verified = used_blocks_counted;
    let expected_size = image::image_size(&descriptor, &head.options);
    ImageInfo {
        head,
        bitmap,
        bitmap_corruption,
        used_blocks_counted,
        expected_size,
    }
}

pub fn image_info(path: &Path, tolerate_bitmap_corruption: bool) -> Result<ImageInfo> {
    let mut reader = BufReader::new(File::open(path)?);
    read_image_info(&mut reader, tolerate_bitmap_corruption)
}
