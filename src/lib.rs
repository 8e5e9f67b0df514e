//! A small single-volume file system on top of a sector device.
//!
//! The volume keeps an allocation table (one 16-bit entry per 4 KiB
//! cluster, linking the clusters of each file into a chain) and a flat
//! directory of 128 entries. Both live in memory and are written back
//! to the device after every mutating call.
pub mod device;
pub mod fs;

pub use device::{BlockDevice, ImageFile, MemDevice};
pub use fs::{FileHandle, FsError, Mode, Volume};
