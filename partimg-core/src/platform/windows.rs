use std::fs::File;
use std::io;
use std::path::Path;

/// Size in bytes of an open device or regular file.
pub fn device_size(file: &File) -> io::Result<u64> {
    Ok(file.metadata()?.len())
}

pub fn is_block_device(_file: &File) -> io::Result<bool> {
    // TODO: detect `\\.\PhysicalDriveN` handles via IOCTL_DISK_GET_LENGTH_INFO.
    Ok(false)
}

pub fn is_block_device_path(_path: &Path) -> io::Result<bool> {
    Ok(false)
}

/// Bytes available on the volume holding `path`, looked up through `sysinfo`.
pub fn available_space(path: &Path) -> io::Result<u64> {
    let absolute = std::path::absolute(path)?;
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| absolute.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
        .ok_or_else(|| io::Error::other("no volume found for target path"))
}
