//! Open files and the cross-cluster read/write paths.
//!
//! Files only ever grow by appending, or are dropped wholesale.
//! Writing appends at the current size, filling the tail cluster
//! before extending the chain; reading walks the chain from the
//! head to the cluster under the handle's cursor and copies across
//! as many cluster boundaries as the request spans.

use super::dir::EntryState;
use super::geometry::CLUSTER_SIZE;
use super::{FsError, Result, Volume};
use crate::device::BlockDevice;
use std::fmt;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

impl Mode {
    fn open_state(self) -> EntryState {
        match self {
            Mode::Read => EntryState::OpenForRead,
            Mode::Write => EntryState::OpenForWrite,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Read => f.write_str("reading"),
            Mode::Write => f.write_str("writing"),
        }
    }
}

/// Refers to one opening of a file: its directory slot plus
/// the slot's generation at the time it was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle {
    slot: usize,
    generation: u32,
}

impl FileHandle {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.slot, self.generation)
    }
}

/// Clusters needed to hold `size` bytes.
fn clusters_for(size: usize) -> usize {
    size.div_ceil(CLUSTER_SIZE)
}

impl<Device: BlockDevice> Volume<Device> {
    /// Open `name`. Opening for write truncates: an existing file is
    /// removed together with its chain and created again, empty.
    pub fn open(&mut self, name: &str, mode: Mode) -> Result<FileHandle> {
        self.ensure_formatted()?;
        let slot = match mode {
            Mode::Read => self
                .dir
                .find_by_name(name)
                .filter(|slot| self.dir.entry(*slot).state == EntryState::InUse)
                .ok_or_else(|| FsError::NotFound(name.to_owned()))?,
            Mode::Write => {
                if let Some(slot) = self.dir.find_by_name(name) {
                    self.release(slot)?;
                }
                self.dir.allocate_slot(name)?
            }
        };
        self.dir.entry_mut(slot).state = mode.open_state();
        self.cursors[slot] = 0;
        let generation = self.generations[slot].wrapping_add(1);
        self.generations[slot] = generation;
        debug!("Opened {name:?} for {mode} in slot {slot}");
        self.flush()?;
        Ok(FileHandle { slot, generation })
    }

    pub fn close(&mut self, handle: FileHandle) -> Result<()> {
        let slot = self.check_handle(handle)?;
        let entry = self.dir.entry_mut(slot);
        match entry.state {
            EntryState::OpenForRead | EntryState::OpenForWrite => {
                entry.state = EntryState::InUse;
            }
            _ => return Err(FsError::InvalidHandle(handle)),
        }
        self.cursors[slot] = 0;
        self.generations[slot] = self.generations[slot].wrapping_add(1);
        trace!("Closed {handle}");
        self.flush()
    }

    /// Append `buf` to the file open for writing behind `handle`.
    /// Fails with `DeviceFull` without touching the volume when the
    /// data doesn't fit.
    pub fn write(&mut self, handle: FileHandle, buf: &[u8]) -> Result<usize> {
        let slot = self.open_slot(handle, Mode::Write)?;
        if buf.is_empty() {
            self.flush()?;
            return Ok(0);
        }
        let entry = self.dir.entry(slot);
        let size = entry.size as usize;
        let first_block = entry.first_block;
        let new_size = size
            .checked_add(buf.len())
            .filter(|new_size| *new_size <= u32::MAX as usize)
            .ok_or(FsError::DeviceFull)?;
        let needed = clusters_for(new_size) - clusters_for(size);
        if needed > self.fat.free_count() {
            return Err(FsError::DeviceFull);
        }

        let mut cluster_buf = vec![0; CLUSTER_SIZE];
        let (mut cluster, mut offset) = match first_block {
            None => {
                let head = self
                    .fat
                    .reserve_first_free(self.geometry.first_data_cluster())?;
                self.dir.entry_mut(slot).first_block = Some(head);
                (head, 0)
            }
            Some(head) if size == 0 => (head, 0),
            Some(head) => {
                let tail = self.fat.tail(head)?;
                match size % CLUSTER_SIZE {
                    // the tail is full, start a fresh cluster
                    0 => (self.fat.extend_chain(tail)?, 0),
                    offset => {
                        self.geometry
                            .read_cluster(&mut self.device, tail, &mut cluster_buf)?;
                        (tail, offset)
                    }
                }
            }
        };

        let mut written = 0;
        loop {
            let n = (CLUSTER_SIZE - offset).min(buf.len() - written);
            cluster_buf[offset..offset + n].copy_from_slice(&buf[written..written + n]);
            self.geometry
                .write_cluster(&mut self.device, cluster, &cluster_buf)?;
            trace!("Wrote {n} bytes at offset {offset} of cluster {cluster}");
            written += n;
            if written == buf.len() {
                break;
            }
            cluster = self.fat.extend_chain(cluster)?;
            offset = 0;
            cluster_buf.fill(0);
        }

        self.dir.entry_mut(slot).size = new_size as u32;
        self.flush()?;
        Ok(written)
    }

    /// Copy up to `buf.len()` bytes from the handle's cursor on.
    /// Returns 0 at the end of the file.
    pub fn read(&mut self, handle: FileHandle, buf: &mut [u8]) -> Result<usize> {
        let slot = self.open_slot(handle, Mode::Read)?;
        let entry = self.dir.entry(slot);
        let cursor = self.cursors[slot];
        let to_read = buf.len().min((entry.size as usize).saturating_sub(cursor));
        if to_read == 0 {
            return Ok(0);
        }
        let head = entry
            .first_block
            .ok_or(FsError::CorruptDirectory { slot })?;

        let mut cluster = self.fat.nth(head, cursor / CLUSTER_SIZE)?;
        let mut offset = cursor % CLUSTER_SIZE;
        let mut cluster_buf = vec![0; CLUSTER_SIZE];
        let mut copied = 0;
        loop {
            self.geometry
                .read_cluster(&mut self.device, cluster, &mut cluster_buf)?;
            let n = (CLUSTER_SIZE - offset).min(to_read - copied);
            buf[copied..copied + n].copy_from_slice(&cluster_buf[offset..offset + n]);
            trace!("Read {n} bytes at offset {offset} of cluster {cluster}");
            copied += n;
            if copied == to_read {
                break;
            }
            cluster = self
                .fat
                .next(cluster)?
                .ok_or(FsError::CorruptChain { cluster })?;
            offset = 0;
        }

        self.cursors[slot] += to_read;
        Ok(to_read)
    }

    /// Slot of `handle` if it belongs to the slot's current opening.
    fn check_handle(&self, handle: FileHandle) -> Result<usize> {
        match self.generations.get(handle.slot) {
            Some(generation) if *generation == handle.generation => Ok(handle.slot),
            _ => Err(FsError::InvalidHandle(handle)),
        }
    }

    /// Slot behind `handle`, which must be open in `mode`.
    fn open_slot(&self, handle: FileHandle, mode: Mode) -> Result<usize> {
        let slot = self.check_handle(handle)?;
        match self.dir.entry(slot).state {
            state if state == mode.open_state() => Ok(slot),
            EntryState::OpenForRead | EntryState::OpenForWrite => Err(FsError::InvalidMode {
                handle,
                expected: mode,
            }),
            _ => Err(FsError::InvalidHandle(handle)),
        }
    }
}
