use std::fmt::Write;
use thiserror::Error;
use tracing::debug;

pub mod dir;
pub mod fat;
pub mod file;
pub mod geometry;

use crate::device::BlockDevice;
use dir::{Directory, EntryState};
use fat::AllocationTable;
use geometry::{Geometry, CLUSTER_SIZE};

pub use file::{FileHandle, Mode};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FsError {
    #[error("Device IO failed at sector {sector}")]
    DeviceIo {
        sector: u64,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("The volume is not formatted")]
    NotFormatted,
    #[error("A file named {0:?} already exists")]
    DuplicateName(String),
    #[error("No closed file named {0:?}")]
    NotFound(String),
    #[error("The directory has no free entry left")]
    DirectoryFull,
    #[error("Not enough free clusters for operation")]
    DeviceFull,
    #[error("Handle {0} does not refer to an open file")]
    InvalidHandle(FileHandle),
    #[error("Handle {handle} is not open for {expected}")]
    InvalidMode { handle: FileHandle, expected: Mode },
    #[error("Invalid file name {0:?} (1 to 24 bytes, no NUL)")]
    InvalidName(String),
    #[error("File {0:?} is currently open")]
    Busy(String),
    #[error("The allocation chain is broken at cluster {cluster}. This indicates a corrupted volume")]
    CorruptChain { cluster: u16 },
    #[error("Directory slot {slot} is malformed. This indicates a corrupted volume")]
    CorruptDirectory { slot: usize },
    #[error("The device has {sectors} sectors, too few to hold a volume")]
    DeviceTooSmall { sectors: u64 },
    #[error("The device has {clusters} clusters, at most 65536 can be addressed")]
    DeviceTooLarge { clusters: u64 },
}

pub type Result<T> = std::result::Result<T, FsError>;

/// A mounted volume. Owns the device together with the
/// in-memory copies of the allocation table and the directory;
/// every mutating call writes both back before returning.
#[derive(Debug)]
pub struct Volume<Device: BlockDevice> {
    device: Device,
    geometry: Geometry,
    fat: AllocationTable,
    dir: Directory,
    /// Read cursor per directory slot, only meaningful while open for read.
    cursors: Vec<usize>,
    /// Bumped whenever a slot is opened, closed or formatted away,
    /// so handles from an earlier opening no longer match.
    generations: Vec<u32>,
    formatted: bool,
}

impl<Device: BlockDevice> Volume<Device> {
    /// Load the allocation table and directory from `device`.
    /// Succeeds on an unformatted device, see [`Volume::is_formatted`].
    pub fn init(mut device: Device) -> Result<Self> {
        let geometry = Geometry::new(device.sector_count())?;
        let mut table = vec![0; geometry.table_clusters() * CLUSTER_SIZE];
        for (cluster, chunk) in table.chunks_exact_mut(CLUSTER_SIZE).enumerate() {
            geometry.read_cluster(&mut device, cluster as u16, chunk)?;
        }
        let fat = AllocationTable::decode(&geometry, &table);
        let mut formatted = fat.is_formatted(&geometry);
        let dir = if formatted {
            let mut buf = vec![0; CLUSTER_SIZE];
            geometry.read_cluster(&mut device, geometry.dir_cluster(), &mut buf)?;
            match Directory::decode(&buf) {
                Ok(mut dir) => {
                    dir.close_all();
                    dir
                }
                // e.g. a format interrupted between table and directory
                Err(err) => {
                    debug!("Treating device as unformatted: {err}");
                    formatted = false;
                    Directory::new()
                }
            }
        } else {
            debug!("Device is not formatted");
            Directory::new()
        };
        debug!(
            "Mounted volume: {} clusters, {} free",
            geometry.total_clusters(),
            fat.free_count()
        );
        Ok(Self {
            device,
            geometry,
            fat,
            cursors: vec![0; dir.capacity()],
            generations: vec![0; dir.capacity()],
            dir,
            formatted,
        })
    }

    pub fn is_formatted(&self) -> bool {
        self.formatted
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn into_device(self) -> Device {
        self.device
    }

    /// Reset the allocation table and directory to an empty volume.
    pub fn format(&mut self) -> Result<()> {
        debug!(
            "Formatting volume: {} table clusters, directory at cluster {}",
            self.geometry.table_clusters(),
            self.geometry.dir_cluster()
        );
        self.fat = AllocationTable::format(&self.geometry);
        self.dir = Directory::new();
        self.cursors.fill(0);
        for generation in &mut self.generations {
            *generation = generation.wrapping_add(1);
        }
        self.formatted = true;
        self.flush()
    }

    /// Free space in bytes.
    pub fn free_space(&self) -> Result<u64> {
        self.ensure_formatted()?;
        Ok((self.fat.free_count() * CLUSTER_SIZE) as u64)
    }

    /// One `name\t\tsize bytes` line per file, in directory order.
    pub fn list(&self) -> Result<String> {
        self.ensure_formatted()?;
        let mut listing = String::new();
        for (name, size) in self.dir.entries() {
            // writing into a String can't fail
            let _ = writeln!(listing, "{name}\t\t{size} bytes");
        }
        Ok(listing)
    }

    /// `(name, size)` of every file, in directory order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, u32)> {
        self.dir.entries()
    }

    pub fn create(&mut self, name: &str) -> Result<()> {
        self.ensure_formatted()?;
        let slot = self.dir.allocate_slot(name)?;
        debug!("Created {name:?} in slot {slot}");
        self.flush()
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        self.ensure_formatted()?;
        let slot = self
            .dir
            .find_by_name(name)
            .ok_or_else(|| FsError::NotFound(name.to_owned()))?;
        self.release(slot)?;
        debug!("Removed {name:?} from slot {slot}");
        self.flush()
    }

    /// Clusters of `name` in chain order.
    pub fn chain_of(&self, name: &str) -> Result<Vec<u16>> {
        self.ensure_formatted()?;
        let slot = self
            .dir
            .find_by_name(name)
            .ok_or_else(|| FsError::NotFound(name.to_owned()))?;
        match self.dir.entry(slot).first_block {
            Some(head) => self.fat.chain(head),
            None => Ok(Vec::new()),
        }
    }

    /// Free the chain and slot of a closed file, without flushing.
    fn release(&mut self, slot: usize) -> Result<()> {
        let entry = self.dir.entry(slot);
        if entry.state != EntryState::InUse {
            return Err(FsError::Busy(entry.name.clone()));
        }
        if let Some(head) = entry.first_block {
            self.fat.release_chain(head)?;
        }
        self.dir.release_slot(slot);
        Ok(())
    }

    fn ensure_formatted(&self) -> Result<()> {
        if self.formatted {
            Ok(())
        } else {
            Err(FsError::NotFormatted)
        }
    }

    /// Write the allocation table, then the directory, back to the device.
    fn flush(&mut self) -> Result<()> {
        let table = self.fat.encode(&self.geometry);
        for (cluster, chunk) in table.chunks_exact(CLUSTER_SIZE).enumerate() {
            self.geometry
                .write_cluster(&mut self.device, cluster as u16, chunk)?;
        }
        let dir = self.dir.encode();
        self.geometry
            .write_cluster(&mut self.device, self.geometry.dir_cluster(), &dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn formatted(mib: u64) -> Volume<MemDevice> {
        let mut volume = Volume::init(MemDevice::with_mib(mib)).unwrap();
        volume.format().unwrap();
        volume
    }

    #[test]
    fn test_fresh_device_is_unformatted() {
        let mut volume = Volume::init(MemDevice::with_mib(2)).unwrap();
        assert!(!volume.is_formatted());
        assert!(matches!(volume.free_space(), Err(FsError::NotFormatted)));
        assert!(matches!(volume.create("a"), Err(FsError::NotFormatted)));
        volume.format().unwrap();
        assert!(volume.is_formatted());
    }

    #[test]
    fn test_format_survives_remount() {
        let mut volume = formatted(2);
        volume.create("kept").unwrap();
        let volume = Volume::init(volume.into_device()).unwrap();
        assert!(volume.is_formatted());
        assert_eq!(volume.entries().collect::<Vec<_>>(), vec![("kept", 0)]);
    }

    #[test]
    fn test_free_space_after_format() {
        let volume = formatted(2);
        // 512 clusters, clusters 0..5 are never handed out
        assert_eq!(volume.free_space().unwrap(), (512 - 5) * 4096);
    }

    #[test]
    fn test_create_duplicate_and_remove() {
        let mut volume = formatted(2);
        volume.create("a.txt").unwrap();
        assert!(matches!(
            volume.create("a.txt"),
            Err(FsError::DuplicateName(name)) if name == "a.txt"
        ));
        volume.remove("a.txt").unwrap();
        assert!(matches!(volume.remove("a.txt"), Err(FsError::NotFound(_))));
        volume.create("a.txt").unwrap();
    }

    #[test]
    fn test_list_format() {
        let mut volume = formatted(2);
        volume.create("one").unwrap();
        volume.create("two").unwrap();
        let handle = volume.open("two", Mode::Write).unwrap();
        volume.write(handle, b"hello").unwrap();
        volume.close(handle).unwrap();
        assert_eq!(
            volume.list().unwrap(),
            "one\t\t0 bytes\ntwo\t\t5 bytes\n"
        );
    }

    #[test]
    fn test_remove_open_file_is_busy() {
        let mut volume = formatted(2);
        let handle = volume.open("busy", Mode::Write).unwrap();
        assert!(matches!(volume.remove("busy"), Err(FsError::Busy(_))));
        volume.close(handle).unwrap();
        volume.remove("busy").unwrap();
    }

    #[test]
    fn test_device_too_small() {
        assert!(matches!(
            Volume::init(MemDevice::new(40)),
            Err(FsError::DeviceTooSmall { sectors: 40 })
        ));
    }
}
