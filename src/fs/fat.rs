//! The allocation table: one entry per cluster,
//! describing whether the cluster is free, holds
//! metadata, or belongs to a file's chain.

use super::geometry::{Geometry, CLUSTER_SIZE, ENTRY_SIZE};
use super::{FsError, Result};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatEntry {
    /// Never handed out.
    Reserved,
    Free,
    EndOfChain,
    /// Holds part of the allocation table.
    Table,
    /// Holds the directory.
    Directory,
    /// Index of the next cluster of the chain.
    Next(u16),
}

impl FatEntry {
    pub const fn to_raw(self) -> u16 {
        match self {
            FatEntry::Reserved => 0,
            FatEntry::Free => 1,
            FatEntry::EndOfChain => 2,
            FatEntry::Table => 3,
            FatEntry::Directory => 4,
            FatEntry::Next(next) => next,
        }
    }

    pub const fn from_raw(raw: u16) -> Self {
        match raw {
            0 => FatEntry::Reserved,
            1 => FatEntry::Free,
            2 => FatEntry::EndOfChain,
            3 => FatEntry::Table,
            4 => FatEntry::Directory,
            next => FatEntry::Next(next),
        }
    }
}

#[derive(Debug)]
pub struct AllocationTable {
    entries: Vec<FatEntry>,
    first_data: u16,
}

impl AllocationTable {
    /// A table with every data cluster free.
    pub fn format(geometry: &Geometry) -> Self {
        let table = geometry.table_clusters();
        let first_data = geometry.first_data_cluster() as usize;
        let entries = (0..geometry.total_clusters())
            .map(|cluster| match cluster {
                c if c < table => FatEntry::Table,
                c if c == table => FatEntry::Directory,
                c if c < first_data => FatEntry::Reserved,
                _ => FatEntry::Free,
            })
            .collect();
        Self {
            entries,
            first_data: first_data as u16,
        }
    }

    /// Parse the on-disk table. `bytes` covers all table clusters,
    /// entries past the last cluster of the device are ignored.
    pub fn decode(geometry: &Geometry, bytes: &[u8]) -> Self {
        let entries = bytes
            .chunks_exact(ENTRY_SIZE)
            .take(geometry.total_clusters())
            .map(|raw| FatEntry::from_raw(u16::from_le_bytes([raw[0], raw[1]])))
            .collect();
        Self {
            entries,
            first_data: geometry.first_data_cluster(),
        }
    }

    pub fn encode(&self, geometry: &Geometry) -> Vec<u8> {
        let mut bytes = vec![0; geometry.table_clusters() * CLUSTER_SIZE];
        for (raw, entry) in bytes.chunks_exact_mut(ENTRY_SIZE).zip(&self.entries) {
            raw.copy_from_slice(&entry.to_raw().to_le_bytes());
        }
        bytes
    }

    /// Whether the metadata clusters carry their reservation markers.
    pub fn is_formatted(&self, geometry: &Geometry) -> bool {
        let table = geometry.table_clusters();
        self.entries[..table].iter().all(|e| *e == FatEntry::Table)
            && self.entries[table] == FatEntry::Directory
    }

    pub fn get(&self, cluster: u16) -> FatEntry {
        self.entries[cluster as usize]
    }

    /// True for clusters holding the table or the directory.
    pub fn is_reserved(&self, cluster: u16) -> bool {
        matches!(self.get(cluster), FatEntry::Table | FatEntry::Directory)
    }

    pub fn free_count(&self) -> usize {
        self.entries.iter().filter(|e| **e == FatEntry::Free).count()
    }

    /// First-fit search upward from `min_index`. The found cluster
    /// becomes a one-cluster chain.
    pub fn reserve_first_free(&mut self, min_index: u16) -> Result<u16> {
        let start = min_index.max(self.first_data) as usize;
        let cluster = self
            .entries
            .get(start..)
            .unwrap_or_default()
            .iter()
            .position(|e| *e == FatEntry::Free)
            .map(|offset| (start + offset) as u16)
            .ok_or(FsError::DeviceFull)?;
        self.entries[cluster as usize] = FatEntry::EndOfChain;
        trace!("Reserved cluster {cluster}");
        Ok(cluster)
    }

    /// Append a free cluster after `tail`, which must end its chain.
    pub fn extend_chain(&mut self, tail: u16) -> Result<u16> {
        if self.next(tail)?.is_some() {
            return Err(FsError::CorruptChain { cluster: tail });
        }
        let cluster = self.reserve_first_free(self.first_data)?;
        self.entries[tail as usize] = FatEntry::Next(cluster);
        trace!("Extended chain {tail} -> {cluster}");
        Ok(cluster)
    }

    /// Mark every cluster of the chain starting at `head` free.
    /// The chain is validated first, so a corrupt chain is left untouched.
    pub fn release_chain(&mut self, head: u16) -> Result<usize> {
        let chain = self.chain(head)?;
        for cluster in &chain {
            self.entries[*cluster as usize] = FatEntry::Free;
        }
        trace!("Released {} clusters starting at {head}", chain.len());
        Ok(chain.len())
    }

    /// The cluster following `cluster`, or `None` at the end of its chain.
    pub fn next(&self, cluster: u16) -> Result<Option<u16>> {
        let corrupt = FsError::CorruptChain { cluster };
        if cluster < self.first_data || cluster as usize >= self.entries.len() {
            return Err(corrupt);
        }
        match self.get(cluster) {
            FatEntry::EndOfChain => Ok(None),
            FatEntry::Next(next) => Ok(Some(next)),
            _ => Err(corrupt),
        }
    }

    /// The cluster `hops` links after `head`.
    pub fn nth(&self, head: u16, hops: usize) -> Result<u16> {
        let mut cluster = head;
        for _ in 0..hops {
            cluster = self
                .next(cluster)?
                .ok_or(FsError::CorruptChain { cluster })?;
        }
        Ok(cluster)
    }

    /// The last cluster of the chain starting at `head`.
    pub fn tail(&self, head: u16) -> Result<u16> {
        self.chain(head)?
            .last()
            .copied()
            .ok_or(FsError::CorruptChain { cluster: head })
    }

    /// All clusters of the chain starting at `head`, in order.
    /// A chain can't be longer than the table, so a longer
    /// walk means there is a cycle.
    pub fn chain(&self, head: u16) -> Result<Vec<u16>> {
        let mut chain = vec![head];
        let mut cluster = head;
        while let Some(next) = self.next(cluster)? {
            if chain.len() >= self.entries.len() {
                return Err(FsError::CorruptChain { cluster: next });
            }
            chain.push(next);
            cluster = next;
        }
        Ok(chain)
    }
}

#[cfg(test)]
fn two_mib() -> (Geometry, AllocationTable) {
    let geometry = Geometry::new(4096).unwrap();
    let fat = AllocationTable::format(&geometry);
    (geometry, fat)
}

#[test]
fn test_raw_roundtrip_of_markers() {
    for raw in [0, 1, 2, 3, 4, 5, 511, u16::MAX] {
        assert_eq!(FatEntry::from_raw(raw).to_raw(), raw);
    }
    assert_eq!(FatEntry::from_raw(7), FatEntry::Next(7));
}

#[test]
fn test_format_layout() {
    let (geometry, fat) = two_mib();
    assert!(fat.is_formatted(&geometry));
    assert_eq!(fat.get(0), FatEntry::Table);
    assert_eq!(fat.get(1), FatEntry::Directory);
    assert_eq!(fat.get(2), FatEntry::Reserved);
    assert_eq!(fat.get(4), FatEntry::Reserved);
    assert_eq!(fat.get(5), FatEntry::Free);
    assert!(fat.is_reserved(0) && fat.is_reserved(1));
    assert!(!fat.is_reserved(2) && !fat.is_reserved(5));
    assert_eq!(fat.free_count(), 512 - 5);
}

#[test]
fn test_encode_decode_on_disk_bytes() {
    let (geometry, mut fat) = two_mib();
    let head = fat.reserve_first_free(0).unwrap();
    fat.extend_chain(head).unwrap();
    let bytes = fat.encode(&geometry);
    assert_eq!(bytes.len(), 4096);
    assert_eq!(
        &bytes[..16],
        &hex_literal::hex!("0300 0400 0000 0000 0000 0600 0200 0100")
    );
    let decoded = AllocationTable::decode(&geometry, &bytes);
    assert_eq!(decoded.entries, fat.entries);
}

#[test]
fn test_first_fit_allocation() {
    let (_, mut fat) = two_mib();
    assert_eq!(fat.reserve_first_free(0).unwrap(), 5);
    assert_eq!(fat.reserve_first_free(0).unwrap(), 6);
    assert_eq!(fat.reserve_first_free(100).unwrap(), 100);
    fat.release_chain(5).unwrap();
    assert_eq!(fat.reserve_first_free(0).unwrap(), 5);
}

#[test]
fn test_extend_and_release_chain() {
    let (_, mut fat) = two_mib();
    let head = fat.reserve_first_free(0).unwrap();
    let other = fat.reserve_first_free(0).unwrap();
    let second = fat.extend_chain(head).unwrap();
    let third = fat.extend_chain(second).unwrap();
    assert_eq!(fat.chain(head).unwrap(), vec![head, second, third]);
    assert_eq!(fat.tail(head).unwrap(), third);
    assert_eq!(fat.nth(head, 2).unwrap(), third);
    assert!(fat.nth(head, 3).is_err());
    assert!(matches!(
        fat.extend_chain(head),
        Err(FsError::CorruptChain { cluster }) if cluster == head
    ));
    let free = fat.free_count();
    assert_eq!(fat.release_chain(head).unwrap(), 3);
    assert_eq!(fat.free_count(), free + 3);
    assert_eq!(fat.get(other), FatEntry::EndOfChain);
}

#[test]
fn test_device_full() {
    let (_, mut fat) = two_mib();
    for _ in 0..fat.free_count() {
        fat.reserve_first_free(0).unwrap();
    }
    assert!(matches!(fat.reserve_first_free(0), Err(FsError::DeviceFull)));
}

#[test]
fn test_cycle_is_rejected() {
    let (_, mut fat) = two_mib();
    let head = fat.reserve_first_free(0).unwrap();
    let tail = fat.extend_chain(head).unwrap();
    fat.entries[tail as usize] = FatEntry::Next(head);
    assert!(matches!(fat.chain(head), Err(FsError::CorruptChain { .. })));
    assert!(fat.release_chain(head).is_err());
    assert_eq!(fat.get(head), FatEntry::Next(tail));
}

#[test]
fn test_pointer_into_metadata_is_rejected() {
    let (_, mut fat) = two_mib();
    let head = fat.reserve_first_free(0).unwrap();
    fat.entries[head as usize] = FatEntry::Next(1);
    assert!(matches!(
        fat.chain(head),
        Err(FsError::CorruptChain { cluster: 1 })
    ));
}
