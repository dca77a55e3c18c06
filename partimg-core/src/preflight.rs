//! Capacity checks that run once, before any output is created or truncated.
use std::path::Path;

use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tracing::debug;

use crate::error::{Error, Result};
use crate::platform;

/// Working memory a session needs: bitmap plus read and write buffers.
pub fn session_memory(bitmap_bytes: usize, read_buffer: usize, write_buffer: usize) -> u64 {
    (bitmap_bytes + read_buffer + write_buffer) as u64
}

/// Fails with [`Error::InsufficientMemory`] when the system reports less
/// available memory than `needed`. Platforms that report nothing pass.
pub fn ensure_memory(needed: u64) -> Result<()> {
    let system = System::new_with_specifics(
        RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
    );
    let available = system.available_memory();
    debug!(needed, available, "memory pre-flight");
    if available != 0 && needed > available {
        return Err(Error::InsufficientMemory { needed, available });
    }
    Ok(())
}

/// Fails with [`Error::InsufficientSpace`] when the filesystem that will
/// hold `path` has less than `needed` bytes free.
pub fn ensure_free_space(path: &Path, needed: u64) -> Result<()> {
    let available = platform::available_space(path)?;
    debug!(path = %path.display(), needed, available, "space pre-flight");
    if needed > available {
        return Err(Error::InsufficientSpace { needed, available });
    }
    Ok(())
}

/// Fails when a fixed-size target cannot hold a device of `needed` bytes.
pub fn ensure_target_size(target_size: u64, needed: u64) -> Result<()> {
    if target_size < needed {
        return Err(Error::InsufficientSpace {
            needed,
            available: target_size,
        });
    }
    Ok(())
}
