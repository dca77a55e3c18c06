//! Reading the allocated blocks of a device, into an image or onto another
//! partition.
//!
//! Both directions walk the bitmap with the same scan-skip-batch loop: skip
//! unallocated blocks, gather up to `chunk_capacity` contiguous allocated
//! blocks, read them with one positioned read, and hand them to the sink.
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::bitmap::BlockBitmap;
use crate::checksum::ChecksumStream;
use crate::config::{Direction, TransferConfig};
use crate::device::{self, SyncTarget};
use crate::engine::{EngineState, TransferEngine, TransferSummary, alloc_buffer};
use crate::error::{Error, Result};
use crate::image::{self, FilesystemDescriptor, ImageOptions};
use crate::platform;
use crate::preflight;
use crate::probe::FilesystemProbe;
use crate::progress::{ProgressEvent, ProgressTracker};

impl TransferEngine {
    /// Writes a complete image (head, bitmap, data stream) to `target`.
    ///
    /// `target` is only ever appended to. Every `blocks_per_checksum` blocks
    /// the current checksum is inserted after the group; a trailing partial
    /// group gets one final tag.
    pub fn write_image<R, W>(
        &mut self,
        source: &mut R,
        target: &mut W,
        descriptor: &FilesystemDescriptor,
        bitmap: &BlockBitmap,
        on_progress: &mut dyn FnMut(&ProgressEvent),
    ) -> Result<TransferSummary>
    where
        R: Read + Seek,
        W: SyncTarget + ?Sized,
    {
        let result = self.write_image_inner(source, target, descriptor, bitmap, on_progress);
        self.conclude(result, target)
    }

    fn write_image_inner<R, W>(
        &mut self,
        source: &mut R,
        target: &mut W,
        descriptor: &FilesystemDescriptor,
        bitmap: &BlockBitmap,
        on_progress: &mut dyn FnMut(&ProgressEvent),
    ) -> Result<()>
    where
        R: Read + Seek,
        W: Write + ?Sized,
    {
        let options = ImageOptions::new(
            self.config().checksum,
            self.config().blocks_per_checksum,
            self.config().reseed,
        );
        let block_size = descriptor.block_size as usize;
        let capacity = self.config().chunk_capacity(descriptor.block_size);
        let mut stream = ChecksumStream::new(options.checksum);
        let tag_size = stream.size();
        let per_group = u64::from(options.blocks_per_checksum);
        let tagging = per_group > 0 && tag_size > 0;

        let max_tags = if tagging { capacity / per_group + 1 } else { 0 };
        let mut read_buf = alloc_buffer(capacity as usize * block_size)?;
        let mut write_buf =
            alloc_buffer(capacity as usize * block_size + max_tags as usize * tag_size)?;

        image::write_header(target, descriptor, &options)?;
        image::write_bitmap(target, bitmap)?;
        let mut written = image::data_offset(descriptor.total_blocks, options.bitmap_encoding);

        self.transition(EngineState::Transferring);
        let mut tracker = ProgressTracker::init(
            Instant::now(),
            descriptor.used_blocks_verified,
            descriptor.used_blocks_verified * block_size as u64,
        );
        let mut in_group = 0u64;

        for (first, count) in bitmap.chunks(capacity) {
            self.check_running()?;
            let len = count as usize * block_size;
            debug!(first, count, "image chunk");
            self.read_at(source, first * block_size as u64, &mut read_buf[..len])?;

            write_buf.clear();
            for block in read_buf[..len].chunks_exact(block_size) {
                write_buf.extend_from_slice(block);
                if !tagging {
                    continue;
                }
                stream.update(block);
                in_group += 1;
                if in_group == per_group {
                    stream.append_tag(&mut write_buf);
                    self.summary.checksum_tags += 1;
                    in_group = 0;
                    if options.reseed {
                        stream.reset();
                    }
                }
            }
            target
                .write_all(&write_buf)
                .map_err(|e| Error::write(written, e))?;
            written += write_buf.len() as u64;

            self.summary.blocks_transferred += count;
            self.summary.bytes_transferred += len as u64;
            self.progress(&mut tracker, first + count, on_progress);
        }

        if tagging && in_group > 0 {
            write_buf.clear();
            stream.append_tag(&mut write_buf);
            target
                .write_all(&write_buf)
                .map_err(|e| Error::write(written, e))?;
            self.summary.checksum_tags += 1;
        }
        Ok(())
    }

    /// Copies every allocated block to the same offset on `target`, leaving
    /// unallocated regions of the target untouched.
    pub fn copy_partition<R, W>(
        &mut self,
        source: &mut R,
        target: &mut W,
        descriptor: &FilesystemDescriptor,
        bitmap: &BlockBitmap,
        on_progress: &mut dyn FnMut(&ProgressEvent),
    ) -> Result<TransferSummary>
    where
        R: Read + Seek,
        W: SyncTarget + Seek + ?Sized,
    {
        let result = self.copy_partition_inner(source, target, descriptor, bitmap, on_progress);
        self.conclude(result, target)
    }

    fn copy_partition_inner<R, W>(
        &mut self,
        source: &mut R,
        target: &mut W,
        descriptor: &FilesystemDescriptor,
        bitmap: &BlockBitmap,
        on_progress: &mut dyn FnMut(&ProgressEvent),
    ) -> Result<()>
    where
        R: Read + Seek,
        W: Write + Seek + ?Sized,
    {
        let block_size = descriptor.block_size as usize;
        let capacity = self.config().chunk_capacity(descriptor.block_size);
        let mut buf = alloc_buffer(capacity as usize * block_size)?;

        self.transition(EngineState::Transferring);
        let mut tracker = ProgressTracker::init(
            Instant::now(),
            descriptor.used_blocks_verified,
            descriptor.used_blocks_verified * block_size as u64,
        );

        for (first, count) in bitmap.chunks(capacity) {
            self.check_running()?;
            let len = count as usize * block_size;
            let offset = first * block_size as u64;
            self.read_at(source, offset, &mut buf[..len])?;

            let written = target
                .seek(SeekFrom::Start(offset))
                .and_then(|_| target.write_all(&buf[..len]));
            match written {
                Ok(()) => {}
                Err(e) if self.config().skip_write_errors => {
                    self.summary.skipped_write_errors += count;
                    warn!(
                        offset,
                        blocks = count,
                        error = %e,
                        "write error skipped, target blocks left undefined"
                    );
                }
                Err(e) => return Err(Error::write(offset, e)),
            }

            self.summary.blocks_transferred += count;
            self.summary.bytes_transferred += len as u64;
            self.progress(&mut tracker, first + count, on_progress);
        }
        Ok(())
    }

    /// Re-reads every allocated chunk from both sides and compares SHA-256
    /// digests.
    pub fn verify_partition<R1, R2>(
        &mut self,
        source: &mut R1,
        target: &mut R2,
        descriptor: &FilesystemDescriptor,
        bitmap: &BlockBitmap,
    ) -> Result<()>
    where
        R1: Read + Seek,
        R2: Read + Seek,
    {
        self.transition(EngineState::Finalizing);
        let block_size = descriptor.block_size as usize;
        let capacity = self.config().chunk_capacity(descriptor.block_size);
        let buf_len = capacity as usize * block_size;
        let buffers = alloc_buffer(buf_len).and_then(|a| alloc_buffer(buf_len).map(|b| (a, b)));
        let (mut source_buf, mut target_buf) = match buffers {
            Ok(pair) => pair,
            Err(err) => return self.fail(err),
        };

        for (first, count) in bitmap.chunks(capacity) {
            if let Err(err) = self.check_running() {
                return self.fail(err);
            }
            let len = count as usize * block_size;
            let offset = first * block_size as u64;
            if let Err(err) = self.read_at(source, offset, &mut source_buf[..len]) {
                return self.fail(err);
            }
            let read = target
                .seek(SeekFrom::Start(offset))
                .and_then(|_| target.read_exact(&mut target_buf[..len]));
            if let Err(e) = read {
                return self.fail(Error::read(offset, e));
            }

            if Sha256::digest(&source_buf[..len]) != Sha256::digest(&target_buf[..len]) {
                return self.fail(Error::VerifyMismatch { block: first });
            }
        }
        info!(blocks = descriptor.used_blocks_verified, "verification successful");
        self.transition(EngineState::Done);
        Ok(())
    }
}

/// Images the allocated blocks of `source` into a new image file.
///
/// # Errors
///
/// Fails before `target` is created when it already exists without
/// `overwrite`, or when memory or free space are short. Once the transfer has
/// started, a failure leaves the partial image in place.
pub fn clone_to_image<P, F>(
    probe: &P,
    source: &Path,
    target: &Path,
    overwrite: bool,
    config: &TransferConfig,
    running: Arc<AtomicBool>,
    mut on_progress: F,
) -> Result<TransferSummary>
where
    P: FilesystemProbe + ?Sized,
    F: FnMut(&ProgressEvent),
{
    let mut engine = TransferEngine::new(Direction::CloneToImage, config.clone(), running)?;
    let mut source_file = device::open_source(source)?;
    let (descriptor, bitmap) = engine.probe(probe, &mut source_file)?;

    let options = ImageOptions::new(config.checksum, config.blocks_per_checksum, config.reseed);
    let image_size = image::image_size(&descriptor, &options);
    if let Err(err) = preflight_clone(&descriptor, &bitmap, config, target, overwrite)
        .and_then(|()| preflight::ensure_free_space(target, image_size))
    {
        return engine.fail(err);
    }

    let mut image_file = match device::create_image(target, overwrite) {
        Ok(file) => file,
        Err(err) => return engine.fail(err),
    };
    info!(source = %source.display(), target = %target.display(), "cloning to image");
    engine.write_image(
        &mut source_file,
        &mut image_file,
        &descriptor,
        &bitmap,
        &mut on_progress,
    )
}

/// Copies the allocated blocks of `source` onto `target` at identical offsets.
pub fn clone_to_partition<P, F>(
    probe: &P,
    source: &Path,
    target: &Path,
    overwrite: bool,
    config: &TransferConfig,
    running: Arc<AtomicBool>,
    mut on_progress: F,
) -> Result<TransferSummary>
where
    P: FilesystemProbe + ?Sized,
    F: FnMut(&ProgressEvent),
{
    let mut engine = TransferEngine::new(Direction::CloneToPartition, config.clone(), running)?;
    let mut source_file = device::open_source(source)?;
    let (descriptor, bitmap) = engine.probe(probe, &mut source_file)?;

    let data_bytes = descriptor.used_blocks_verified * u64::from(descriptor.block_size);
    let prepared = preflight_clone(&descriptor, &bitmap, config, target, overwrite)
        .and_then(|()| prepare_target(target, descriptor.device_size, data_bytes));
    let mut target_file = match prepared {
        Ok(file) => file,
        Err(err) => return engine.fail(err),
    };

    info!(source = %source.display(), target = %target.display(), "copying partition");
    let summary = engine.copy_partition(
        &mut source_file,
        &mut target_file,
        &descriptor,
        &bitmap,
        &mut on_progress,
    )?;
    drop(target_file);

    if config.verify {
        let mut source_file = device::open_source(source)?;
        let mut target_file = device::open_source(target)?;
        engine.verify_partition(&mut source_file, &mut target_file, &descriptor, &bitmap)?;
    }
    Ok(summary)
}

fn preflight_clone(
    descriptor: &FilesystemDescriptor,
    bitmap: &BlockBitmap,
    config: &TransferConfig,
    target: &Path,
    overwrite: bool,
) -> Result<()> {
    device::check_overwrite(target, overwrite)?;
    let chunk =
        config.chunk_capacity(descriptor.block_size) as usize * descriptor.block_size as usize;
    preflight::ensure_memory(preflight::session_memory(
        bitmap.as_bytes().len(),
        chunk,
        chunk,
    ))
}

/// Opens a positioned-write target that must hold `device_size` bytes.
///
/// Block devices must already be large enough. Regular files are extended
/// (sparsely) after checking that the filesystem can take `data_bytes`.
pub(crate) fn prepare_target(
    target: &Path,
    device_size: u64,
    data_bytes: u64,
) -> Result<std::fs::File> {
    match device::inspect(target) {
        Ok(info) if info.is_block_device => {
            preflight::ensure_target_size(info.size, device_size)?;
            device::open_target(target)
        }
        Ok(info) => {
            if info.size < device_size {
                preflight::ensure_free_space(target, data_bytes)?;
            }
            let file = device::open_target(target)?;
            if platform::device_size(&file)? < device_size {
                file.set_len(device_size)?;
            }
            Ok(file)
        }
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            preflight::ensure_free_space(target, data_bytes)?;
            let file = device::open_target(target)?;
            file.set_len(device_size)?;
            Ok(file)
        }
        Err(err) => Err(err),
    }
}
