use super::{BlockDevice, SECTOR_SIZE};
use std::ffi::c_void;
use std::fs::{self, File};
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::IntoRawFd;
use std::path::Path;
use tracing::{debug, trace};

/// A disk image on the host file system,
/// mapped into memory and exposed sector
/// by sector.
#[derive(Debug)]
pub struct ImageFile {
    fd: libc::c_int,
    data_addr: *mut u8,
    data_size: usize,
}

impl ImageFile {
    fn stat_file_size(fd: libc::c_int) -> io::Result<usize> {
        let mut stat = MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let stat = unsafe { stat.assume_init() };
        trace!("Stat'ed image size: {}", stat.st_size);
        Ok(stat.st_size as usize)
    }

    fn mmap_image_file(fd: libc::c_int, size: usize) -> io::Result<*mut u8> {
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(addr as *mut u8)
    }

    fn map(image: File) -> io::Result<Self> {
        let fd = image.into_raw_fd();
        let size = match Self::stat_file_size(fd) {
            Ok(size) if size > 0 && size % SECTOR_SIZE == 0 => size,
            Ok(size) => {
                unsafe { libc::close(fd) };
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("image size {size} is not a non-zero multiple of {SECTOR_SIZE}"),
                ));
            }
            Err(err) => {
                unsafe { libc::close(fd) };
                return Err(err);
            }
        };
        let data_addr = match Self::mmap_image_file(fd, size) {
            Ok(addr) => addr,
            Err(err) => {
                unsafe { libc::close(fd) };
                return Err(err);
            }
        };
        Ok(Self {
            fd,
            data_addr,
            data_size: size,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().canonicalize()?;
        debug!("Opening image at {:?}", path);
        let image = File::options().read(true).write(true).open(path)?;
        Self::map(image)
    }

    /// Create a new zero-filled image of `sectors` sectors
    /// and map it. Fails if `path` already exists.
    pub fn create(path: impl AsRef<Path>, sectors: u64) -> io::Result<Self> {
        let path = path.as_ref();
        debug!("Creating image at {path:?} with {sectors} sectors");
        if sectors == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "an image needs at least one sector",
            ));
        }
        let image = fs::OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;
        image.set_len(sectors * SECTOR_SIZE as u64)?;
        Self::map(image)
    }

    /// Flush the mapping back to the image file.
    pub fn sync(&mut self) -> io::Result<()> {
        let err = unsafe {
            libc::msync(
                self.data_addr as *mut c_void,
                self.data_size,
                libc::MS_SYNC,
            )
        };
        if err != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn sector_offset(&self, sector: u64, len: usize) -> io::Result<usize> {
        if len != SECTOR_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("buffer of {len} bytes is not a sector"),
            ));
        }
        if sector >= self.sector_count() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("sector {sector} out of range"),
            ));
        }
        Ok(sector as usize * SECTOR_SIZE)
    }
}

impl BlockDevice for ImageFile {
    type IoError = io::Error;

    fn sector_count(&self) -> u64 {
        (self.data_size / SECTOR_SIZE) as u64
    }

    fn read_sector(&mut self, sector: u64, buf: &mut [u8]) -> io::Result<()> {
        let offset = self.sector_offset(sector, buf.len())?;
        let addr = self.data_addr.wrapping_add(offset);
        let data = unsafe { std::slice::from_raw_parts(addr, SECTOR_SIZE) };
        buf.copy_from_slice(data);
        Ok(())
    }

    fn write_sector(&mut self, sector: u64, buf: &[u8]) -> io::Result<()> {
        let offset = self.sector_offset(sector, buf.len())?;
        let addr = self.data_addr.wrapping_add(offset);
        let data = unsafe { std::slice::from_raw_parts_mut(addr, SECTOR_SIZE) };
        data.copy_from_slice(buf);
        Ok(())
    }
}

impl Drop for ImageFile {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.data_addr as *mut c_void, self.data_size);
            libc::close(self.fd);
        }
    }
}

#[test]
fn test_image_create_and_reopen() {
    let path = std::env::temp_dir().join(format!("rsfs-image-{}.img", std::process::id()));
    let _ = fs::remove_file(&path);
    {
        let mut image = ImageFile::create(&path, 16).unwrap();
        assert_eq!(image.sector_count(), 16);
        image.write_sector(15, &[7; SECTOR_SIZE]).unwrap();
        image.sync().unwrap();
    }
    assert!(ImageFile::create(&path, 16).is_err());
    {
        let mut image = ImageFile::open(&path).unwrap();
        let mut buf = [0; SECTOR_SIZE];
        image.read_sector(15, &mut buf).unwrap();
        assert_eq!(buf, [7; SECTOR_SIZE]);
        assert!(image.read_sector(16, &mut buf).is_err());
    }
    fs::remove_file(&path).unwrap();
}
