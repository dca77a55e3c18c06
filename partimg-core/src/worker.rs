//! Running a session on a dedicated thread.
//!
//! The caller keeps a [`SessionHandle`] to poll progress and cancel. Progress
//! travels over a bounded channel; when the caller falls behind, events are
//! dropped rather than stalling the transfer loop.
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, TrySendError, bounded};

use crate::engine::TransferSummary;
use crate::error::{Error, Result};
use crate::progress::ProgressEvent;

pub struct SessionHandle {
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    progress: Receiver<ProgressEvent>,
    thread: JoinHandle<Result<TransferSummary>>,
}

impl SessionHandle {
    /// Requests cancellation; the session stops at its next chunk boundary.
    pub fn cancel(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn progress(&self) -> &Receiver<ProgressEvent> {
        &self.progress
    }

    /// Most recent progress event currently queued, discarding older ones.
    pub fn latest(&self) -> Option<ProgressEvent> {
        self.progress.try_iter().last()
    }

    /// Events dropped because the channel was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Waits for the session to end and returns its outcome.
    pub fn join(self) -> Result<TransferSummary> {
        self.thread
            .join()
            .map_err(|_| Error::Io(io::Error::other("transfer worker panicked")))?
    }
}

/// Spawns `job` on a worker thread.
///
/// `job` receives the shared running flag and a progress sink to pass into
/// one of the transfer entry points, e.g.
/// `spawn(32, move |running, progress| restore(&img, &dev, true, &cfg, running, progress))`.
pub fn spawn<J>(capacity: usize, job: J) -> Result<SessionHandle>
where
    J: FnOnce(Arc<AtomicBool>, &mut dyn FnMut(&ProgressEvent)) -> Result<TransferSummary>
        + Send
        + 'static,
{
    let running = Arc::new(AtomicBool::new(true));
    let dropped = Arc::new(AtomicU64::new(0));
    let (tx, rx) = bounded(capacity.max(1));

    let flag = running.clone();
    let drop_count = dropped.clone();
    let thread = thread::Builder::new()
        .name("partimg-transfer".into())
        .spawn(move || {
            let mut notify = |event: &ProgressEvent| {
                if let Err(TrySendError::Full(_)) = tx.try_send(event.clone()) {
                    drop_count.fetch_add(1, Ordering::Relaxed);
                }
            };
            job(flag, &mut notify)
        })?;

    Ok(SessionHandle {
        running,
        dropped,
        progress: rx,
        thread,
    })
}
