//! Provides platform-specific functionality.
//!
//! Each submodule exposes the same API: the byte size of an open device or
//! file, and the free space of the filesystem that would hold a new file.
//! The rest of the library uses them without caring about the OS.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use self::windows::*;
