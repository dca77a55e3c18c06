//! Reconstructing a device from an image.
//!
//! The image is consumed strictly sequentially. Decoded blocks are scattered
//! back to the offsets their bitmap bits name, so the destination ends up
//! with the original sparse layout and untouched holes.
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::bitmap::BlockBitmap;
use crate::checksum::ChecksumStream;
use crate::clone::prepare_target;
use crate::config::{Direction, TransferConfig};
use crate::device::{self, NullDevice, SyncTarget};
use crate::engine::{EngineState, TransferEngine, TransferSummary, alloc_buffer};
use crate::error::{Error, Result};
use crate::image::{self, ImageHead};
use crate::preflight;
use crate::progress::{ProgressEvent, ProgressTracker};

impl TransferEngine {
    /// Reads the image head and bitmap from the front of `source`.
    ///
    /// The bitmap is re-counted and that count replaces the descriptor's
    /// `used_blocks_verified` for the rest of the session.
    pub fn read_image<R: Read + ?Sized>(
        &mut self,
        source: &mut R,
    ) -> Result<(ImageHead, BlockBitmap)> {
        self.transition(EngineState::Probing);
        let read = image::read_header(source).and_then(|head| {
            let bitmap = image::read_bitmap(
                source,
                head.descriptor.total_blocks,
                head.options.bitmap_encoding,
            )?;
            Ok((head, bitmap))
        });
        match read {
            Ok((mut head, bitmap)) => {
                let verified = bitmap.count_set();
                self.record_used_blocks(head.descriptor.used_blocks, verified);
                head.descriptor.used_blocks_verified = verified;
                info!(
                    fs = %head.descriptor.fs_name(),
                    block_size = head.descriptor.block_size,
                    total_blocks = head.descriptor.total_blocks,
                    used_blocks = verified,
                    checksum = %head.options.checksum,
                    blocks_per_checksum = head.options.blocks_per_checksum,
                    "image opened"
                );
                Ok((head, bitmap))
            }
            Err(err) => self.fail(err),
        }
    }

    /// Decodes the data stream that follows the bitmap, verifying every
    /// checksum group, and writes each block at its original offset.
    pub fn restore_blocks<R, W>(
        &mut self,
        source: &mut R,
        target: &mut W,
        head: &ImageHead,
        bitmap: &BlockBitmap,
        on_progress: &mut dyn FnMut(&ProgressEvent),
    ) -> Result<TransferSummary>
    where
        R: Read + ?Sized,
        W: SyncTarget + Seek + ?Sized,
    {
        let result = self.restore_inner(source, target, head, bitmap, on_progress);
        self.conclude(result, target)
    }

    fn restore_inner<R, W>(
        &mut self,
        source: &mut R,
        target: &mut W,
        head: &ImageHead,
        bitmap: &BlockBitmap,
        on_progress: &mut dyn FnMut(&ProgressEvent),
    ) -> Result<()>
    where
        R: Read + ?Sized,
        W: Write + Seek + ?Sized,
    {
        let descriptor = &head.descriptor;
        let options = &head.options;
        let block_size = descriptor.block_size as usize;
        let capacity = self.config().chunk_capacity(descriptor.block_size);
        let total = descriptor.used_blocks_verified;

        let mut stream = ChecksumStream::new(options.checksum);
        let tag_size = stream.size();
        let per_group = u64::from(options.blocks_per_checksum);
        let tagging = per_group > 0 && tag_size > 0;

        let max_tags = if tagging { capacity / per_group + 2 } else { 0 };
        let mut read_buf =
            alloc_buffer(capacity as usize * block_size + max_tags as usize * tag_size)?;
        let mut block_buf = alloc_buffer(capacity as usize * block_size)?;

        self.transition(EngineState::Transferring);
        let mut tracker =
            ProgressTracker::init(Instant::now(), total, total * block_size as u64);
        let mut offset = image::data_offset(descriptor.total_blocks, options.bitmap_encoding);
        let mut in_group = 0u64;
        let mut done = 0u64;
        let mut cursor = 0u64;

        while done < total {
            self.check_running()?;
            let count = capacity.min(total - done);
            // Size the read so it ends right after any tag its last block
            // completes, including the final tag of a partial group.
            let tags = if tagging {
                let completed = (in_group + count) / per_group;
                let trailing = done + count == total && (in_group + count) % per_group != 0;
                completed + u64::from(trailing)
            } else {
                0
            };
            let len = count as usize * block_size + tags as usize * tag_size;
            debug!(done, count, tags, "restore chunk");
            source
                .read_exact(&mut read_buf[..len])
                .map_err(|e| Error::read(offset, e))?;
            offset += len as u64;

            block_buf.clear();
            let mut pos = 0;
            for i in 0..count {
                let block = &read_buf[pos..pos + block_size];
                pos += block_size;
                block_buf.extend_from_slice(block);
                if !tagging {
                    continue;
                }
                stream.update(block);
                in_group += 1;
                let last = done + i + 1 == total;
                if in_group == per_group || last {
                    self.check_tag(&stream, &read_buf[pos..pos + tag_size], done + i)?;
                    pos += tag_size;
                    self.summary.checksum_tags += 1;
                    in_group = 0;
                    if options.reseed {
                        stream.reset();
                    }
                }
            }
            debug_assert_eq!(pos, len);

            cursor = scatter(target, bitmap, cursor, &block_buf, block_size)?;
            done += count;
            self.summary.blocks_transferred += count;
            self.summary.bytes_transferred += block_buf.len() as u64;
            self.progress(&mut tracker, cursor, on_progress);
        }
        Ok(())
    }

    fn check_tag(&self, stream: &ChecksumStream, tag: &[u8], block: u64) -> Result<()> {
        if self.config().ignore_checksum {
            return Ok(());
        }
        let Some(stored) = stream.decode_tag(tag) else {
            return Ok(());
        };
        let computed = stream.value();
        if stored == computed {
            return Ok(());
        }
        let algorithm = stream.algorithm();
        if algorithm.is_legacy() {
            warn!(
                block,
                "legacy checksum mismatch; images of this kind may carry the historical CRC defect"
            );
        }
        Err(Error::ChecksumMismatch {
            block,
            algorithm,
            stored,
            computed,
            legacy: algorithm.is_legacy(),
        })
    }
}

/// Writes `blocks` to the allocated offsets at or after bitmap position
/// `cursor`, seeking over unallocated blocks. Returns the new cursor.
fn scatter<W: Write + Seek + ?Sized>(
    target: &mut W,
    bitmap: &BlockBitmap,
    mut cursor: u64,
    blocks: &[u8],
    block_size: usize,
) -> Result<u64> {
    let mut remaining = (blocks.len() / block_size) as u64;
    let mut pos = 0;
    while remaining > 0 {
        let first = bitmap.next_set(cursor).ok_or_else(|| {
            Error::Format("image holds more blocks than its bitmap marks".into())
        })?;
        let run = bitmap.run_len(first, remaining);
        let offset = first * block_size as u64;
        let len = run as usize * block_size;
        target
            .seek(SeekFrom::Start(offset))
            .and_then(|_| target.write_all(&blocks[pos..pos + len]))
            .map_err(|e| Error::write(offset, e))?;
        pos += len;
        remaining -= run;
        cursor = first + run;
    }
    Ok(cursor)
}

/// Restores `source_image` onto `target`.
///
/// # Errors
///
/// Header, bitmap and group checksum failures abort the session. Space and
/// memory problems are reported before `target` is opened; after that, a
/// failure leaves the blocks restored so far in place.
pub fn restore<F>(
    source_image: &Path,
    target: &Path,
    overwrite: bool,
    config: &TransferConfig,
    running: Arc<AtomicBool>,
    mut on_progress: F,
) -> Result<TransferSummary>
where
    F: FnMut(&ProgressEvent),
{
    let mut engine = TransferEngine::new(Direction::RestoreFromImage, config.clone(), running)?;
    let mut image = BufReader::new(device::open_source(source_image)?);
    let (head, bitmap) = engine.read_image(&mut image)?;

    let descriptor = &head.descriptor;
    let chunk =
        config.chunk_capacity(descriptor.block_size) as usize * descriptor.block_size as usize;
    let data_bytes = descriptor.used_blocks_verified * u64::from(descriptor.block_size);
    let prepared = device::check_overwrite(target, overwrite)
        .and_then(|()| {
            preflight::ensure_memory(preflight::session_memory(
                bitmap.as_bytes().len(),
                chunk,
                chunk,
            ))
        })
        .and_then(|()| prepare_target(target, descriptor.device_size, data_bytes));
    let mut target_file = match prepared {
        Ok(file) => file,
        Err(err) => return engine.fail(err),
    };

    info!(image = %source_image.display(), target = %target.display(), "restoring image");
    let summary = engine.restore_blocks(
        &mut image,
        &mut target_file,
        &head,
        &bitmap,
        &mut on_progress,
    )?;
    if summary.used_blocks_mismatch() {
        warn!(
            reported = summary.used_blocks_reported,
            verified = summary.used_blocks_verified,
            "image used-block count was corrected from its bitmap"
        );
    }
    Ok(summary)
}

/// Decodes a whole image and verifies every checksum group without writing
/// anything.
pub fn check_image<F>(
    source_image: &Path,
    config: &TransferConfig,
    running: Arc<AtomicBool>,
    mut on_progress: F,
) -> Result<TransferSummary>
where
    F: FnMut(&ProgressEvent),
{
    let mut engine = TransferEngine::new(Direction::RestoreFromImage, config.clone(), running)?;
    let mut image = BufReader::new(device::open_source(source_image)?);
    let (head, bitmap) = engine.read_image(&mut image)?;
    engine.restore_blocks(
        &mut image,
        &mut NullDevice::default(),
        &head,
        &bitmap,
        &mut on_progress,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumAlgorithm;
    use crate::image::FilesystemDescriptor;
    use std::io::Cursor;

    const BS: usize = 512;

    fn build_image(total: u64, used: &[u64], config: &TransferConfig) -> (Vec<u8>, Vec<u8>) {
        let mut src = vec![0u8; total as usize * BS];
        for (i, block) in src.chunks_exact_mut(BS).enumerate() {
            block.fill((i * 7 + 3) as u8);
        }
        let mut bitmap = BlockBitmap::create(total).unwrap();
        for &b in used {
            bitmap.set(b).unwrap();
        }
        let mut desc = FilesystemDescriptor::new("TEST", BS as u32, total, used.len() as u64);
        desc.used_blocks_verified = bitmap.count_set();
        let mut engine = TransferEngine::new(
            Direction::CloneToImage,
            config.clone(),
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap();
        let mut out = Vec::new();
        engine
            .write_image(&mut Cursor::new(src.clone()), &mut out, &desc, &bitmap, &mut |_| {})
            .unwrap();
        (src, out)
    }

    fn restore_into(
        image: &[u8],
        target: &mut Cursor<Vec<u8>>,
        config: TransferConfig,
    ) -> (TransferEngine, Result<TransferSummary>) {
        let mut engine = TransferEngine::new(
            Direction::RestoreFromImage,
            config,
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap();
        let mut source = Cursor::new(image);
        let result = engine
            .read_image(&mut source)
            .and_then(|(head, bitmap)| {
                engine.restore_blocks(&mut source, target, &head, &bitmap, &mut |_| {})
            });
        (engine, result)
    }

    #[test]
    fn sparse_round_trip_across_chunk_and_group_boundaries() {
        let used = [0, 1, 2, 5, 6, 7, 8, 9, 13, 20, 21, 22, 23, 24, 30];
        let config = TransferConfig::new()
            .io_buffer_size(3 * BS)
            .checksum(ChecksumAlgorithm::Crc32, 4);
        let (src, image) = build_image(32, &used, &config);

        let mut target = Cursor::new(vec![0xCCu8; 32 * BS]);
        let (engine, result) = restore_into(&image, &mut target, config);
        let summary = result.unwrap();
        assert_eq!(engine.state(), EngineState::Done);
        assert_eq!(summary.blocks_transferred, used.len() as u64);
        assert_eq!(summary.checksum_tags, 4);

        let out = target.into_inner();
        for block in 0..32usize {
            let range = block * BS..(block + 1) * BS;
            if used.contains(&(block as u64)) {
                assert_eq!(out[range.clone()], src[range], "block {block}");
            } else {
                assert!(out[range].iter().all(|&b| b == 0xCC), "hole {block}");
            }
        }
    }

    #[test]
    fn flipped_bit_fails_at_its_group() {
        let used: Vec<u64> = (0..12).collect();
        let config = TransferConfig::new().checksum(ChecksumAlgorithm::Crc32, 4);
        let (_, mut image) = build_image(12, &used, &config);
        let data_start = image::data_offset(12, image::BitmapEncoding::Bit) as usize;
        // Block 5 sits in the second group (blocks 4..8), after one tag.
        image[data_start + 5 * BS + 4 + 17] ^= 0x08;

        let mut target = Cursor::new(vec![0u8; 12 * BS]);
        let (engine, result) = restore_into(&image, &mut target, config);
        match result {
            Err(Error::ChecksumMismatch { block, legacy, .. }) => {
                assert_eq!(block, 7);
                assert!(!legacy);
            }
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
        assert_eq!(engine.state(), EngineState::Failed);
    }

    #[test]
    fn ignore_checksum_consumes_tags() {
        let used: Vec<u64> = (0..6).collect();
        let config = TransferConfig::new().checksum(ChecksumAlgorithm::Crc32, 4);
        let (src, mut image) = build_image(6, &used, &config);
        let data_start = image::data_offset(6, image::BitmapEncoding::Bit) as usize;
        image[data_start] ^= 0xFF;

        let mut target = Cursor::new(vec![0u8; 6 * BS]);
        let (_, result) = restore_into(&image, &mut target, config.ignore_checksum(true));
        result.unwrap();
        let out = target.into_inner();
        assert_eq!(out[BS..], src[BS..]);
    }

    #[test]
    fn no_checksum_round_trip() {
        let used = [1, 3, 4];
        let config = TransferConfig::new().checksum(ChecksumAlgorithm::None, 4);
        let (src, image) = build_image(8, &used, &config);
        let mut target = Cursor::new(vec![0u8; 8 * BS]);
        let (_, result) = restore_into(&image, &mut target, config);
        assert_eq!(result.unwrap().checksum_tags, 0);
        let out = target.into_inner();
        assert_eq!(out[3 * BS..5 * BS], src[3 * BS..5 * BS]);
    }

    #[test]
    fn truncated_stream_is_read_error() {
        let used: Vec<u64> = (0..8).collect();
        let config = TransferConfig::new();
        let (_, image) = build_image(8, &used, &config);
        let cut = &image[..image.len() - 100];
        let mut target = Cursor::new(vec![0u8; 8 * BS]);
        let (_, result) = restore_into(cut, &mut target, config);
        assert!(matches!(result, Err(Error::Read { .. })));
    }

    #[test]
    fn stored_used_count_is_superseded_by_bitmap() {
        let used = [0, 1, 2];
        let config = TransferConfig::new();
        let (_, mut image) = build_image(8, &used, &config);
        // Patch the reported used_blocks (descriptor offset 25 + 15 + 16) and
        // re-seal the header CRC.
        let field = image::HEADER_SIZE + 15 + 16;
        image[field..field + 8].copy_from_slice(&99u64.to_le_bytes());
        let head_len = image::IMAGE_HEAD_SIZE;
        let crc = crate::checksum::crc32(&image[..head_len]);
        image[head_len..head_len + 4].copy_from_slice(&crc.to_le_bytes());

        let mut target = Cursor::new(vec![0u8; 8 * BS]);
        let (_, result) = restore_into(&image, &mut target, config);
        let summary = result.unwrap();
        assert_eq!(summary.used_blocks_reported, 99);
        assert_eq!(summary.used_blocks_verified, 3);
        assert!(summary.used_blocks_mismatch());
    }
}
