//! Block devices a volume can live on.
//! A device only knows about fixed size
//! sectors; clusters are a file system
//! concept layered on top by `fs::geometry`.

mod image;

pub use image::ImageFile;

use thiserror::Error;

/// Size of a single sector. Every device
/// exposes sectors of exactly this size.
pub const SECTOR_SIZE: usize = 512;

/// Trait that abstracts out a block device.
pub trait BlockDevice {
    /// Error type returned from the IO methods
    type IoError: std::error::Error + Send + Sync + 'static;
    /// The total amount of sectors available
    /// to do IO
    fn sector_count(&self) -> u64;
    /// Read the sector at `sector` (starting at 0) into `buf`,
    /// which must be exactly `SECTOR_SIZE` long.
    fn read_sector(&mut self, sector: u64, buf: &mut [u8]) -> Result<(), Self::IoError>;
    /// Write `buf` to the sector at `sector` (starting at 0).
    /// `buf` must be exactly `SECTOR_SIZE` long.
    fn write_sector(&mut self, sector: u64, buf: &[u8]) -> Result<(), Self::IoError>;
}

impl<D: BlockDevice + ?Sized> BlockDevice for &mut D {
    type IoError = D::IoError;

    fn sector_count(&self) -> u64 {
        (**self).sector_count()
    }

    fn read_sector(&mut self, sector: u64, buf: &mut [u8]) -> Result<(), Self::IoError> {
        (**self).read_sector(sector, buf)
    }

    fn write_sector(&mut self, sector: u64, buf: &[u8]) -> Result<(), Self::IoError> {
        (**self).write_sector(sector, buf)
    }
}

#[derive(Error, Debug)]
pub enum MemDeviceError {
    #[error("sector {sector} is out of range (device has {count} sectors)")]
    OutOfRange { sector: u64, count: u64 },
    #[error("buffer of {0} bytes is not a sector")]
    BadBuffer(usize),
}

/// A zero-filled device held in memory.
#[derive(Debug, Clone)]
pub struct MemDevice {
    data: Vec<u8>,
}

impl MemDevice {
    pub fn new(sectors: u64) -> Self {
        Self {
            data: vec![0; sectors as usize * SECTOR_SIZE],
        }
    }

    /// A device of `mib` mebibytes.
    pub fn with_mib(mib: u64) -> Self {
        Self::new(mib * 1024 * 1024 / SECTOR_SIZE as u64)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn range(&self, sector: u64, len: usize) -> Result<std::ops::Range<usize>, MemDeviceError> {
        if len != SECTOR_SIZE {
            return Err(MemDeviceError::BadBuffer(len));
        }
        let count = self.sector_count();
        if sector >= count {
            return Err(MemDeviceError::OutOfRange { sector, count });
        }
        let start = sector as usize * SECTOR_SIZE;
        Ok(start..start + SECTOR_SIZE)
    }
}

impl BlockDevice for MemDevice {
    type IoError = MemDeviceError;

    fn sector_count(&self) -> u64 {
        (self.data.len() / SECTOR_SIZE) as u64
    }

    fn read_sector(&mut self, sector: u64, buf: &mut [u8]) -> Result<(), Self::IoError> {
        let range = self.range(sector, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_sector(&mut self, sector: u64, buf: &[u8]) -> Result<(), Self::IoError> {
        let range = self.range(sector, buf.len())?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }
}

#[test]
fn test_mem_device_read_write() {
    let mut device = MemDevice::new(4);
    assert_eq!(device.sector_count(), 4);
    let block = [0xAB; SECTOR_SIZE];
    device.write_sector(2, &block).unwrap();
    let mut out = [0; SECTOR_SIZE];
    device.read_sector(2, &mut out).unwrap();
    assert_eq!(out, block);
    device.read_sector(1, &mut out).unwrap();
    assert_eq!(out, [0; SECTOR_SIZE]);
}

#[test]
fn test_mem_device_out_of_range() {
    let mut device = MemDevice::new(4);
    let mut out = [0; SECTOR_SIZE];
    assert!(matches!(
        device.read_sector(4, &mut out),
        Err(MemDeviceError::OutOfRange { sector: 4, count: 4 })
    ));
    assert!(matches!(
        device.write_sector(0, &out[..10]),
        Err(MemDeviceError::BadBuffer(10))
    ));
}
