//! The core, UI-agnostic library for the `partimg` partition imaging utility.
//!
//! `partimg-core` copies only the blocks a filesystem actually uses. It can be
//! driven by any front-end: the `partimg` command line tool, or a graphical
//! application polling a [`worker::SessionHandle`]. It handles the image format,
//! block bitmaps, interleaved checksums, sparse restore and the pre-flight
//! checks that run before anything is written.
//!
//! The library is structured into several key modules:
//! - [`bitmap`]: The per-block allocation bitmap.
//! - [`checksum`]: Running CRC32 over block data, including the legacy variant
//!   found in older images.
//! - [`image`]: Encoding and decoding of the image header, options and bitmap.
//! - [`probe`]: The [`FilesystemProbe`] seam and the whole-device [`RawProbe`].
//! - [`engine`]: The [`TransferEngine`] shared by every transfer direction.
//! - [`mod@clone`] and [`mod@restore`]: The three transfer directions.
//! - [`info`]: Read-only image inspection.
//! - [`worker`]: Running a session on its own thread.
//!
//! The primary entry points are [`clone_to_image`], [`clone_to_partition`],
//! [`restore`] and [`check_image`]. All of them take a shared running flag for
//! cancellation and report progress through a callback.
//!
//! ## Example: Imaging a Partition with Progress Reporting
//!
//! ```rust,no_run
//! use partimg_core::{RawProbe, TransferConfig, clone_to_image};
//! use std::path::Path;
//! use std::sync::{Arc, atomic::AtomicBool};
//!
//! fn main() -> partimg_core::Result<()> {
//!     let running = Arc::new(AtomicBool::new(true));
//!     let config = TransferConfig::new();
//!
//!     let summary = clone_to_image(
//!         &RawProbe::default(),
//!         Path::new("/dev/sdb1"),
//!         Path::new("backup.img"),
//!         false, // Refuse to replace an existing image
//!         &config,
//!         running.clone(),
//!         |event| {
//!             if let Some(report) = &event.report {
//!                 println!("{:.2}%", report.percent);
//!             }
//!         },
//!     )?;
//!
//!     println!("{} blocks imaged", summary.blocks_transferred);
//!     Ok(())
//! }
//! ```

pub mod bitmap;
pub mod checksum;
pub mod clone;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod image;
pub mod info;
pub mod platform;
pub mod preflight;
pub mod probe;
pub mod progress;
pub mod restore;
pub mod worker;

pub use bitmap::BlockBitmap;
pub use checksum::{ChecksumAlgorithm, ChecksumStream};
pub use clone::{clone_to_image, clone_to_partition};
pub use config::{Direction, TransferConfig};
pub use engine::{EngineState, TransferEngine, TransferSummary};
pub use error::{Error, ImageSection, Result};
pub use image::{FilesystemDescriptor, ImageHead, ImageOptions};
pub use info::{ImageInfo, image_info};
pub use probe::{FilesystemProbe, RawProbe};
pub use progress::{ProgressEvent, ProgressReport, ProgressTracker};
pub use restore::{check_image, restore};
