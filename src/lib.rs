//! snapdisk - isolated, disposable working copies of OS media.
//!
//! A [`Disk`] classifies a medium (image file, block device or the host
//! root), layers a copy-on-write snapshot over it with loop devices and
//! device-mapper (or a qcow2 overlay for non-raw images), and unwinds
//! every resource it allocated in reverse order on teardown, including
//! when interrupted by a signal.

pub mod cleanup;
pub mod config;
pub mod disk;
pub mod error;
pub mod extract;
pub mod host;
pub mod image;
pub mod medium;
pub mod output;
pub mod process;
pub mod snapshot;
pub mod tmpdir;

pub use disk::{Disk, DiskContext, ShutdownHandle, ShutdownReport};
pub use error::{Error, Result};
