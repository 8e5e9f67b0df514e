//! Translates clusters, the allocation unit
//! of the volume, into runs of device sectors.

use super::{FsError, Result};
use crate::device::{BlockDevice, SECTOR_SIZE};
use std::ops::Range;
use tracing::trace;

pub const CLUSTER_SIZE: usize = 4096;
pub const SECTORS_PER_CLUSTER: u64 = (CLUSTER_SIZE / SECTOR_SIZE) as u64;
/// Allocation table entries are 16 bit wide.
pub const ENTRY_SIZE: usize = 2;
pub const ENTRIES_PER_CLUSTER: usize = CLUSTER_SIZE / ENTRY_SIZE;
pub const MAX_CLUSTERS: u64 = 1 << 16;
/// Indices below this collide with the marker values of the
/// allocation table and are never used for file data.
pub const MIN_DATA_CLUSTER: u16 = 5;

/// Volume layout derived from the device size:
/// `[0, table_clusters)` hold the allocation table,
/// the cluster right after holds the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    total_clusters: usize,
    table_clusters: usize,
}

impl Geometry {
    pub fn new(sector_count: u64) -> Result<Self> {
        let clusters = sector_count / SECTORS_PER_CLUSTER;
        if clusters > MAX_CLUSTERS {
            return Err(FsError::DeviceTooLarge { clusters });
        }
        let total_clusters = clusters as usize;
        let geometry = Self {
            total_clusters,
            table_clusters: total_clusters.div_ceil(ENTRIES_PER_CLUSTER),
        };
        if geometry.first_data_cluster() as usize >= total_clusters {
            return Err(FsError::DeviceTooSmall {
                sectors: sector_count,
            });
        }
        Ok(geometry)
    }

    pub fn total_clusters(&self) -> usize {
        self.total_clusters
    }

    pub fn table_clusters(&self) -> usize {
        self.table_clusters
    }

    pub fn dir_cluster(&self) -> u16 {
        self.table_clusters as u16
    }

    pub fn first_data_cluster(&self) -> u16 {
        (self.dir_cluster() + 1).max(MIN_DATA_CLUSTER)
    }

    pub fn sectors_of(&self, cluster: u16) -> Range<u64> {
        let start = cluster as u64 * SECTORS_PER_CLUSTER;
        start..start + SECTORS_PER_CLUSTER
    }

    pub fn cluster_of(&self, sector: u64) -> u16 {
        (sector / SECTORS_PER_CLUSTER) as u16
    }

    pub fn read_cluster<D: BlockDevice>(
        &self,
        device: &mut D,
        cluster: u16,
        buf: &mut [u8],
    ) -> Result<()> {
        assert_eq!(buf.len(), CLUSTER_SIZE, "cluster buffer has the wrong size");
        trace!("Reading cluster {cluster}");
        for (sector, chunk) in self.sectors_of(cluster).zip(buf.chunks_exact_mut(SECTOR_SIZE)) {
            device
                .read_sector(sector, chunk)
                .map_err(|err| device_io(sector, err))?;
        }
        Ok(())
    }

    pub fn write_cluster<D: BlockDevice>(
        &self,
        device: &mut D,
        cluster: u16,
        buf: &[u8],
    ) -> Result<()> {
        assert_eq!(buf.len(), CLUSTER_SIZE, "cluster buffer has the wrong size");
        trace!("Writing cluster {cluster}");
        for (sector, chunk) in self.sectors_of(cluster).zip(buf.chunks_exact(SECTOR_SIZE)) {
            device
                .write_sector(sector, chunk)
                .map_err(|err| device_io(sector, err))?;
        }
        Ok(())
    }
}

fn device_io<E: std::error::Error + Send + Sync + 'static>(sector: u64, err: E) -> FsError {
    FsError::DeviceIo {
        sector,
        source: Box::new(err),
    }
}

#[test]
fn test_geometry_two_mib() {
    let geometry = Geometry::new(4096).unwrap();
    assert_eq!(geometry.total_clusters(), 512);
    assert_eq!(geometry.table_clusters(), 1);
    assert_eq!(geometry.dir_cluster(), 1);
    assert_eq!(geometry.first_data_cluster(), MIN_DATA_CLUSTER);
}

#[test]
fn test_geometry_largest_device() {
    let geometry = Geometry::new(MAX_CLUSTERS * SECTORS_PER_CLUSTER).unwrap();
    assert_eq!(geometry.table_clusters(), 32);
    assert_eq!(geometry.dir_cluster(), 32);
    assert_eq!(geometry.first_data_cluster(), 33);
    assert!(matches!(
        Geometry::new((MAX_CLUSTERS + 1) * SECTORS_PER_CLUSTER),
        Err(FsError::DeviceTooLarge { clusters }) if clusters == MAX_CLUSTERS + 1
    ));
}

#[test]
fn test_cluster_sector_translation() {
    let geometry = Geometry::new(4096).unwrap();
    assert_eq!(geometry.sectors_of(3), 24..32);
    assert_eq!(geometry.cluster_of(24), 3);
    assert_eq!(geometry.cluster_of(31), 3);
    assert_eq!(geometry.cluster_of(32), 4);
}

#[test]
fn test_cluster_io_spans_sectors() {
    use crate::device::MemDevice;
    let geometry = Geometry::new(64).unwrap();
    let mut device = MemDevice::new(64);
    let cluster: Vec<u8> = (0..CLUSTER_SIZE).map(|i| (i / SECTOR_SIZE) as u8).collect();
    geometry.write_cluster(&mut device, 6, &cluster).unwrap();
    let mut sector = [0; SECTOR_SIZE];
    device.read_sector(6 * 8 + 7, &mut sector).unwrap();
    assert_eq!(sector, [7; SECTOR_SIZE]);
    let mut back = vec![0; CLUSTER_SIZE];
    geometry.read_cluster(&mut device, 6, &mut back).unwrap();
    assert_eq!(back, cluster);
}
