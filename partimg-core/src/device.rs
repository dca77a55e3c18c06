//! Opening sources and targets in the minimal mode each direction needs.
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::platform;

/// Object-safe `Read + Seek`, used where a probe needs a device handle.
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek + ?Sized> ReadSeek for T {}

/// A write target that can force its data to stable storage.
///
/// Files are `fsync`ed; in-memory targets only flush.
pub trait SyncTarget: Write {
    fn sync(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl SyncTarget for File {
    fn sync(&mut self) -> io::Result<()> {
        self.flush()?;
        self.sync_all()
    }
}

impl SyncTarget for Vec<u8> {}
impl SyncTarget for io::Cursor<Vec<u8>> {}
impl SyncTarget for io::Cursor<&mut Vec<u8>> {}
impl SyncTarget for io::Cursor<&mut [u8]> {}
impl SyncTarget for NullDevice {}

impl<T: SyncTarget + ?Sized> SyncTarget for &mut T {
    fn sync(&mut self) -> io::Result<()> {
        (**self).sync()
    }
}

/// A device or file the engine is about to touch.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub path: PathBuf,
    /// Size in bytes; for block devices this comes from the kernel.
    pub size: u64,
    pub is_block_device: bool,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_block_device {
            "[Block device]"
        } else {
            "[File]"
        };
        write!(
            f,
            "{:<15} {:.1} GB {}",
            self.path.display(),
            self.size as f64 / (1024.0 * 1024.0 * 1024.0),
            kind
        )
    }
}

/// Describes `path` without opening it for writing.
pub fn inspect(path: &Path) -> Result<DeviceInfo> {
    let file = File::open(path)?;
    Ok(DeviceInfo {
        path: path.to_path_buf(),
        size: platform::device_size(&file)?,
        is_block_device: platform::is_block_device(&file)?,
    })
}

/// Opens a source read-only.
pub fn open_source(path: &Path) -> Result<File> {
    Ok(File::open(path)?)
}

/// Refuses to touch an existing regular file unless overwriting was
/// requested. Block devices always exist, so they pass.
pub fn check_overwrite(path: &Path, overwrite: bool) -> Result<()> {
    if overwrite || !path.exists() || platform::is_block_device_path(path)? {
        return Ok(());
    }
    Err(Error::TargetExists(path.to_path_buf()))
}

/// Creates (or truncates, when allowed) an image file for sequential writing.
pub fn create_image(path: &Path, overwrite: bool) -> Result<File> {
    let mut options = OpenOptions::new();
    options.write(true);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    options.open(path).map_err(|e| {
        if e.kind() == io::ErrorKind::AlreadyExists {
            Error::TargetExists(path.to_path_buf())
        } else {
            Error::Io(e)
        }
    })
}

/// Opens an existing target for positioned writes without truncating it.
/// A missing regular-file target is created.
pub fn open_target(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().write(true).create(true).open(path)?)
}

/// A write target that discards everything, for checking an image without
/// restoring it.
#[derive(Debug, Default)]
pub struct NullDevice {
    pos: u64,
    len: u64,
}

impl Write for NullDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pos += buf.len() as u64;
        self.len = self.len.max(self.pos);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for NullDevice {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let next = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
            SeekFrom::End(d) => self.len.checked_add_signed(d),
        };
        self.pos = next.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of device")
        })?;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_target_needs_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.img");
        check_overwrite(&path, false).unwrap();
        create_image(&path, false).unwrap();
        assert!(matches!(
            check_overwrite(&path, false),
            Err(Error::TargetExists(_))
        ));
        assert!(matches!(
            create_image(&path, false),
            Err(Error::TargetExists(_))
        ));
        create_image(&path, true).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn block_devices_skip_the_overwrite_guard() {
        use std::os::unix::fs::FileTypeExt;

        let Ok(entries) = std::fs::read_dir("/dev") else {
            return;
        };
        let block_device = entries.flatten().map(|e| e.path()).find(|p| {
            std::fs::metadata(p).is_ok_and(|m| m.file_type().is_block_device())
        });
        // Containers may expose no block devices at all.
        let Some(path) = block_device else {
            return;
        };
        check_overwrite(&path, false).unwrap();
    }

    #[test]
    fn inspect_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.bin");
        std::fs::write(&path, vec![0u8; 8192]).unwrap();
        let info = inspect(&path).unwrap();
        assert_eq!(info.size, 8192);
        assert!(!info.is_block_device);
    }

    #[test]
    fn null_device_tracks_position() {
        let mut dev = NullDevice::default();
        dev.seek(SeekFrom::Start(100)).unwrap();
        dev.write_all(&[0u8; 28]).unwrap();
        assert_eq!(dev.seek(SeekFrom::Current(0)).unwrap(), 128);
        assert!(dev.seek(SeekFrom::Current(-200)).is_err());
    }
}
