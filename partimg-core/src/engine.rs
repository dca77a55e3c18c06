//! The transfer session: state machine, counters and the I/O primitives the
//! three directions share.
//!
//! A [`TransferEngine`] is created per invocation and exclusively owns its
//! configuration, cancellation flag and counters. It moves through
//! `Idle → Probing → Transferring → Finalizing → {Done, Failed}`; the
//! direction-specific loops live in [`crate::clone`] and [`crate::restore`].
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::bitmap::BlockBitmap;
use crate::config::{Direction, SECTOR_SIZE, TransferConfig};
use crate::device::{ReadSeek, SyncTarget};
use crate::error::{Error, Result};
use crate::image::FilesystemDescriptor;
use crate::probe::FilesystemProbe;
use crate::progress::{ProgressEvent, ProgressTracker};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Probing,
    Transferring,
    Finalizing,
    Done,
    Failed,
}

/// Outcome of a finished session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub blocks_transferred: u64,
    pub bytes_transferred: u64,
    /// Checksum tags written (clone) or consumed (restore).
    pub checksum_tags: u64,
    /// Sectors zero-filled by rescue mode.
    pub bad_sectors: u64,
    /// Blocks whose destination write failed and was skipped on request.
    pub skipped_write_errors: u64,
    /// `used_blocks` as stored by the probe or image.
    pub used_blocks_reported: u64,
    /// `used_blocks` as counted from the bitmap; this is what was moved.
    pub used_blocks_verified: u64,
    pub elapsed: Duration,
}

impl TransferSummary {
    /// True when the stored used-block count disagreed with the bitmap.
    pub fn used_blocks_mismatch(&self) -> bool {
        self.used_blocks_reported != self.used_blocks_verified
    }
}

pub struct TransferEngine {
    direction: Direction,
    config: TransferConfig,
    running: Arc<AtomicBool>,
    state: EngineState,
    started: Instant,
    pub(crate) summary: TransferSummary,
}

impl TransferEngine {
    /// Starts an idle session. `running` is the shared cancellation flag:
    /// clearing it stops the session at the next chunk boundary.
    pub fn new(
        direction: Direction,
        config: TransferConfig,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        config.validate(direction)?;
        Ok(Self {
            direction,
            config,
            running,
            state: EngineState::Idle,
            started: Instant::now(),
            summary: TransferSummary::default(),
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub(crate) fn transition(&mut self, next: EngineState) {
        debug!(direction = ?self.direction, from = ?self.state, to = ?next, "engine state");
        self.state = next;
    }

    /// Cancellation is only ever observed between chunks.
    pub(crate) fn check_running(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Records a failure and hands the error back.
    pub(crate) fn fail<T>(&mut self, err: Error) -> Result<T> {
        warn!(
            direction = ?self.direction,
            category = err.category(),
            error = %err,
            "transfer failed"
        );
        self.transition(EngineState::Failed);
        Err(err)
    }

    /// Asks the probe for geometry and bitmap, then re-counts the bitmap.
    ///
    /// The counted value is stored as `used_blocks_verified` and is what the
    /// transfer will move.
    pub fn probe<P: FilesystemProbe + ?Sized>(
        &mut self,
        probe: &P,
        device: &mut dyn ReadSeek,
    ) -> Result<(FilesystemDescriptor, BlockBitmap)> {
        self.transition(EngineState::Probing);
        let probed = probe.probe_filesystem(device).and_then(|mut descriptor| {
            let bitmap = probe.read_allocation_bitmap(device, &descriptor)?;
            descriptor.validate()?;
            if bitmap.total_blocks() != descriptor.total_blocks {
                return Err(Error::Format(format!(
                    "{} probe returned a bitmap of {} blocks for {} total blocks",
                    probe.name(),
                    bitmap.total_blocks(),
                    descriptor.total_blocks
                )));
            }
            descriptor.used_blocks_verified = bitmap.count_set();
            Ok((descriptor, bitmap))
        });
        match probed {
            Ok((descriptor, bitmap)) => {
                self.record_used_blocks(descriptor.used_blocks, descriptor.used_blocks_verified);
                info!(
                    probe = probe.name(),
                    block_size = descriptor.block_size,
                    total_blocks = descriptor.total_blocks,
                    used_blocks = descriptor.used_blocks_verified,
                    "filesystem probed"
                );
                Ok((descriptor, bitmap))
            }
            Err(err) => self.fail(err),
        }
    }

    pub(crate) fn record_used_blocks(&mut self, reported: u64, verified: u64) {
        self.summary.used_blocks_reported = reported;
        self.summary.used_blocks_verified = verified;
        if reported != verified {
            warn!(
                reported,
                verified, "stored used-block count differs from the bitmap, using the bitmap count"
            );
        }
    }

    /// Reads `buf.len()` bytes at `offset`. Under rescue mode a failed read is
    /// retried sector by sector and unreadable sectors are left zeroed.
    pub(crate) fn read_at<R: Read + Seek>(
        &mut self,
        source: &mut R,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let attempt = source
            .seek(SeekFrom::Start(offset))
            .and_then(|_| source.read_exact(buf));
        match attempt {
            Ok(()) => Ok(()),
            Err(e) if self.config.rescue => {
                warn!(
                    offset,
                    len = buf.len(),
                    error = %e,
                    "chunk read failed, retrying per sector"
                );
                self.rescue_read(source, offset, buf);
                Ok(())
            }
            Err(e) => Err(Error::read(offset, e)),
        }
    }

    fn rescue_read<R: Read + Seek>(&mut self, source: &mut R, offset: u64, buf: &mut [u8]) {
        buf.fill(0);
        for (i, sector) in buf.chunks_mut(SECTOR_SIZE).enumerate() {
            let at = offset + (i * SECTOR_SIZE) as u64;
            let attempt = source
                .seek(SeekFrom::Start(at))
                .and_then(|_| source.read_exact(sector));
            if let Err(e) = attempt {
                sector.fill(0);
                self.summary.bad_sectors += 1;
                warn!(offset = at, error = %e, "unreadable sector zero-filled");
            }
        }
    }

    pub(crate) fn progress(
        &mut self,
        tracker: &mut ProgressTracker,
        position: u64,
        on_progress: &mut dyn FnMut(&ProgressEvent),
    ) {
        let units_done = self.summary.blocks_transferred;
        on_progress(&ProgressEvent {
            units_done,
            total_units: tracker.total_units(),
            position,
            report: tracker.update(units_done),
        });
    }

    /// Flushes and syncs `target` whatever the outcome, then settles the
    /// final state.
    pub(crate) fn conclude<W: SyncTarget + ?Sized>(
        &mut self,
        result: Result<()>,
        target: &mut W,
    ) -> Result<TransferSummary> {
        if result.is_ok() {
            self.transition(EngineState::Finalizing);
        }
        let synced = target.sync().map_err(|e| Error::write(0, e));
        match result.and(synced) {
            Ok(()) => {
                self.summary.elapsed = self.started.elapsed();
                self.transition(EngineState::Done);
                info!(
                    direction = ?self.direction,
                    blocks = self.summary.blocks_transferred,
                    bytes = self.summary.bytes_transferred,
                    bad_sectors = self.summary.bad_sectors,
                    elapsed = ?self.summary.elapsed,
                    "transfer complete"
                );
                Ok(self.summary.clone())
            }
            Err(err) => self.fail(err),
        }
    }
}

/// Allocates a zeroed working buffer, mapping allocation failure to
/// [`Error::InsufficientMemory`].
pub(crate) fn alloc_buffer(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| Error::InsufficientMemory {
            needed: len as u64,
            available: 0,
        })?;
    buf.resize(len, 0);
    Ok(buf)
}
