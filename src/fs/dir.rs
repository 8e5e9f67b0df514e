//! The directory: a fixed table of file entries
//! stored in a single cluster right after the
//! allocation table.

use super::geometry::CLUSTER_SIZE;
use super::{FsError, Result};
use packed_struct::prelude::*;

pub const DIR_CAPACITY: usize = 128;
/// On-disk name field, NUL padded.
pub const NAME_LEN: usize = 25;
pub const MAX_NAME_LEN: usize = NAME_LEN - 1;
pub const RECORD_SIZE: usize = 32;

const _: () = assert!(DIR_CAPACITY * RECORD_SIZE <= CLUSTER_SIZE);

/// On disk `first_block` value of a file that owns no cluster yet.
const NO_CLUSTER: u16 = 0;

#[derive(PrimitiveEnum_u8, Clone, Copy, PartialEq, Eq, Debug)]
pub enum EntryState {
    /// 'N'
    Free = 0x4E,
    /// 'U'
    InUse = 0x55,
    /// 'R'
    OpenForRead = 0x52,
    /// 'W'
    OpenForWrite = 0x57,
}

#[derive(PackedStruct, Debug)]
#[packed_struct(endian = "lsb")]
pub struct DirRecord {
    #[packed_field(element_size_bytes = "1", ty = "enum")]
    pub state: EntryState,
    pub name: [u8; 25],
    pub first_block: u16,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub state: EntryState,
    pub name: String,
    pub first_block: Option<u16>,
    /// Bytes of valid data in the chain.
    pub size: u32,
}

impl DirEntry {
    fn free() -> Self {
        Self {
            state: EntryState::Free,
            name: String::new(),
            first_block: None,
            size: 0,
        }
    }

    fn is_free(&self) -> bool {
        self.state == EntryState::Free
    }

    fn to_record(&self) -> DirRecord {
        let mut name = [0; NAME_LEN];
        name[..self.name.len()].copy_from_slice(self.name.as_bytes());
        DirRecord {
            state: self.state,
            name,
            first_block: self.first_block.unwrap_or(NO_CLUSTER),
            size: self.size,
        }
    }

    fn from_record(record: DirRecord, slot: usize) -> Result<Self> {
        if record.state == EntryState::Free {
            return Ok(Self::free());
        }
        let len = record
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(NAME_LEN);
        let name = std::str::from_utf8(&record.name[..len])
            .ok()
            .filter(|name| validate_name(name).is_ok())
            .ok_or(FsError::CorruptDirectory { slot })?;
        Ok(Self {
            state: record.state,
            name: name.to_owned(),
            first_block: match record.first_block {
                NO_CLUSTER => None,
                cluster => Some(cluster),
            },
            size: record.size,
        })
    }
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains('\0') {
        Err(FsError::InvalidName(name.to_owned()))
    } else {
        Ok(())
    }
}

#[derive(Debug)]
pub struct Directory {
    slots: Vec<DirEntry>,
}

impl Directory {
    pub fn new() -> Self {
        Self {
            slots: vec![DirEntry::free(); DIR_CAPACITY],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let slots = bytes
            .chunks_exact(RECORD_SIZE)
            .take(DIR_CAPACITY)
            .enumerate()
            .map(|(slot, raw)| {
                let record = DirRecord::unpack_from_slice(raw)
                    .map_err(|_| FsError::CorruptDirectory { slot })?;
                DirEntry::from_record(record, slot)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { slots })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![0; CLUSTER_SIZE];
        for (raw, entry) in bytes.chunks_exact_mut(RECORD_SIZE).zip(&self.slots) {
            // Packing a record of plain integers and byte arrays can't fail
            entry.to_record().pack_to_slice(raw).unwrap();
        }
        bytes
    }

    pub fn entry(&self, slot: usize) -> &DirEntry {
        &self.slots[slot]
    }

    pub fn entry_mut(&mut self, slot: usize) -> &mut DirEntry {
        &mut self.slots[slot]
    }

    /// Slot of the non-free entry called `name`.
    pub fn find_by_name(&self, name: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|entry| !entry.is_free() && entry.name == name)
    }

    /// Claim the first free slot for a new, empty, closed file.
    pub fn allocate_slot(&mut self, name: &str) -> Result<usize> {
        validate_name(name)?;
        if self.find_by_name(name).is_some() {
            return Err(FsError::DuplicateName(name.to_owned()));
        }
        let slot = self
            .slots
            .iter()
            .position(DirEntry::is_free)
            .ok_or(FsError::DirectoryFull)?;
        self.slots[slot] = DirEntry {
            state: EntryState::InUse,
            name: name.to_owned(),
            first_block: None,
            size: 0,
        };
        Ok(slot)
    }

    /// The caller must have released the entry's chain already.
    pub fn release_slot(&mut self, slot: usize) {
        self.slots[slot] = DirEntry::free();
    }

    /// Open states don't outlive the process that opened the file.
    pub fn close_all(&mut self) {
        for entry in self.slots.iter_mut().filter(|entry| !entry.is_free()) {
            entry.state = EntryState::InUse;
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, u32)> {
        self.slots
            .iter()
            .filter(|entry| !entry.is_free())
            .map(|entry| (entry.name.as_str(), entry.size))
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
fn test_record_layout() {
    let entry = DirEntry {
        state: EntryState::InUse,
        name: "a.txt".to_owned(),
        first_block: Some(5),
        size: 5000,
    };
    let packed = entry.to_record().pack().unwrap();
    assert_eq!(packed.len(), RECORD_SIZE);
    assert_eq!(
        packed,
        hex_literal::hex!(
            "55 612e747874 0000000000000000000000000000000000000000"
            "0500 88130000"
        )
    );
}

#[test]
fn test_encode_decode_directory() {
    let mut dir = Directory::new();
    let slot = dir.allocate_slot("notes").unwrap();
    dir.entry_mut(slot).first_block = Some(42);
    dir.entry_mut(slot).size = 9000;
    dir.entry_mut(slot).state = EntryState::OpenForRead;
    let bytes = dir.encode();
    assert_eq!(bytes.len(), CLUSTER_SIZE);
    let mut decoded = Directory::decode(&bytes).unwrap();
    assert_eq!(decoded.entry(slot).state, EntryState::OpenForRead);
    decoded.close_all();
    assert_eq!(
        decoded.entry(slot),
        &DirEntry {
            state: EntryState::InUse,
            name: "notes".to_owned(),
            first_block: Some(42),
            size: 9000,
        }
    );
    assert_eq!(decoded.entries().count(), 1);
}

#[test]
fn test_decode_rejects_unknown_state() {
    let mut bytes = Directory::new().encode();
    bytes[RECORD_SIZE * 3] = b'X';
    assert!(matches!(
        Directory::decode(&bytes),
        Err(FsError::CorruptDirectory { slot: 3 })
    ));
}

#[test]
fn test_allocate_slot_rules() {
    let mut dir = Directory::new();
    assert_eq!(dir.allocate_slot("a").unwrap(), 0);
    assert_eq!(dir.allocate_slot("b").unwrap(), 1);
    assert!(matches!(dir.allocate_slot("a"), Err(FsError::DuplicateName(_))));
    dir.entry_mut(0).state = EntryState::OpenForWrite;
    assert!(matches!(dir.allocate_slot("a"), Err(FsError::DuplicateName(_))));
    dir.entry_mut(0).state = EntryState::InUse;
    dir.release_slot(0);
    assert_eq!(dir.find_by_name("a"), None);
    assert_eq!(dir.allocate_slot("c").unwrap(), 0);
    assert!(matches!(dir.allocate_slot(""), Err(FsError::InvalidName(_))));
    assert!(matches!(
        dir.allocate_slot(&"x".repeat(MAX_NAME_LEN + 1)),
        Err(FsError::InvalidName(_))
    ));
    dir.allocate_slot(&"x".repeat(MAX_NAME_LEN)).unwrap();
}

#[test]
fn test_directory_full() {
    let mut dir = Directory::new();
    for i in 0..DIR_CAPACITY {
        dir.allocate_slot(&format!("f{i}")).unwrap();
    }
    assert!(matches!(dir.allocate_slot("one-more"), Err(FsError::DirectoryFull)));
}
