use nix::ioctl_read;
use nix::sys::statvfs::statvfs;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Size in bytes of an open block device or regular file.
///
/// Block devices report a zero length through `metadata`, so their size
/// comes from the `BLKGETSIZE64` ioctl instead.
pub fn device_size(file: &File) -> io::Result<u64> {
    let metadata = file.metadata()?;
    if !metadata.file_type().is_block_device() {
        return Ok(metadata.len());
    }
    let mut size_bytes: u64 = 0;
    // SAFETY: the fd is owned by `file` for the duration of the call and
    // `size_bytes` is a valid u64 for the kernel to fill in.
    unsafe {
        blkgetsize64(file.as_raw_fd(), &mut size_bytes)?;
    }
    Ok(size_bytes)
}

pub fn is_block_device(file: &File) -> io::Result<bool> {
    Ok(file.metadata()?.file_type().is_block_device())
}

/// Like [`is_block_device`], without opening `path`.
pub fn is_block_device_path(path: &Path) -> io::Result<bool> {
    Ok(std::fs::metadata(path)?.file_type().is_block_device())
}

/// Bytes available to unprivileged writers on the filesystem holding `path`.
///
/// `path` itself may not exist yet; the nearest existing ancestor is queried.
pub fn available_space(path: &Path) -> io::Result<u64> {
    let dir = path
        .ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .unwrap_or(Path::new("."));
    let stats = statvfs(dir)?;
    Ok(stats.blocks_available() as u64 * stats.fragment_size() as u64)
}
