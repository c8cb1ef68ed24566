#![forbid(unsafe_code)]
//! Lock coordinator and process registry.
//!
//! Every open database file is represented in-process by one [`SharedFile`],
//! handed out by an injected [`Registry`]. Connections take named lock slots
//! through a per-connection [`Locker`]. Slot ownership is tracked with
//! in-process counters; in multi-process mode the first in-process holder of
//! a slot also takes a byte-range lock on the `-shm` file so other processes
//! see it.

pub mod shm;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::primitives::io::{sibling_path, FileIo, LockMode, Vfs};
use crate::types::{BtError, Result};

pub use shm::{Shm, SHM_CHUNK};

/// Number of reader slots.
pub const N_READER: usize = 16;

/// Byte offset of the first lock byte in the `-shm` file. Far beyond any
/// content so mandatory-locking platforms never block index reads.
const LOCK_BASE: u64 = 1 << 32;

/// Offset of the reader table inside the shared-memory region.
pub const READER_TABLE_OFFSET: usize = 1024;
const READER_ENTRY_LEN: usize = 16;
/// Bytes reserved for the reader table.
pub const READER_TABLE_LEN: usize = N_READER * READER_ENTRY_LEN;

const MAX_READER_ATTEMPTS: u32 = 100;
const BLOCKING_POLL: Duration = Duration::from_millis(1);
const BLOCKING_ATTEMPTS: u32 = 10_000;

/// Named lock slots.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum LockSlot {
    /// Serialises connect/disconnect.
    Discover1,
    /// Held shared by every connected connection.
    Discover2,
    /// Single global writer.
    Writer,
    /// Single checkpointer; also guards the merge-schedule page.
    Checkpointer,
    /// Readers whose snapshot lives entirely in the database file.
    ReaderDbOnly,
    /// Reader slot `i`, recording the frame range the reader depends on.
    Reader(usize),
}

impl LockSlot {
    /// Total number of slots.
    pub const COUNT: usize = 5 + N_READER;

    fn index(self) -> usize {
        match self {
            LockSlot::Discover1 => 0,
            LockSlot::Discover2 => 1,
            LockSlot::Writer => 2,
            LockSlot::Checkpointer => 3,
            LockSlot::ReaderDbOnly => 4,
            LockSlot::Reader(i) => 5 + i,
        }
    }
}

/// Range of log sequence numbers a reader depends on.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ReaderRange {
    /// First frame the reader may need from the log.
    pub first: u64,
    /// Last committed frame of the reader's snapshot.
    pub last: u64,
}

/// Result of scanning the reader slots.
#[derive(Copy, Clone, Default, Debug)]
pub struct ReaderScan {
    /// A database-only reader is live; nothing may be copied into the database.
    pub db_only: bool,
    /// Smallest `first` of any live reader.
    pub min_first: Option<u64>,
    /// Smallest `last` of any live reader.
    pub min_last: Option<u64>,
}

#[derive(Default, Debug, Clone, Copy)]
struct SlotState {
    shared: u32,
    exclusive: bool,
}

/// Per-file state shared by every connection in this process.
pub struct SharedFile {
    path: PathBuf,
    db: Arc<dyn FileIo>,
    wal: Arc<dyn FileIo>,
    shm: Shm,
    lock_file: Option<Arc<dyn FileIo>>,
    slots: Mutex<[SlotState; LockSlot::COUNT]>,
    multi_process: bool,
}

impl SharedFile {
    /// Canonical database path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Database file handle.
    pub fn db(&self) -> &Arc<dyn FileIo> {
        &self.db
    }

    /// Log file handle.
    pub fn wal(&self) -> &Arc<dyn FileIo> {
        &self.wal
    }

    /// Shared-memory region.
    pub fn shm(&self) -> &Shm {
        &self.shm
    }

    /// Whether other processes are coordinated through OS locks.
    pub fn multi_process(&self) -> bool {
        self.multi_process
    }

    fn try_lock(&self, slot: LockSlot, mode: LockMode) -> Result<bool> {
        let idx = slot.index();
        let mut slots = self.slots.lock();
        let state = slots[idx];
        match mode {
            LockMode::Exclusive => {
                if state.exclusive || state.shared > 0 {
                    return Ok(false);
                }
                if !self.os_lock(idx, LockMode::Exclusive)? {
                    return Ok(false);
                }
                slots[idx].exclusive = true;
            }
            LockMode::Shared => {
                if state.exclusive {
                    return Ok(false);
                }
                if state.shared == 0 && !self.os_lock(idx, LockMode::Shared)? {
                    return Ok(false);
                }
                slots[idx].shared += 1;
            }
        }
        Ok(true)
    }

    fn release(&self, slot: LockSlot, mode: LockMode) -> Result<()> {
        let idx = slot.index();
        let mut slots = self.slots.lock();
        match mode {
            LockMode::Exclusive => slots[idx].exclusive = false,
            LockMode::Shared => slots[idx].shared = slots[idx].shared.saturating_sub(1),
        }
        if !slots[idx].exclusive && slots[idx].shared == 0 {
            if let Some(file) = &self.lock_file {
                file.unlock(LOCK_BASE + idx as u64, 1)?;
            }
        }
        Ok(())
    }

    fn downgrade(&self, slot: LockSlot) -> Result<bool> {
        let idx = slot.index();
        let mut slots = self.slots.lock();
        debug_assert!(slots[idx].exclusive, "downgrade without exclusive hold");
        if let Some(file) = &self.lock_file {
            #[cfg(windows)]
            file.unlock(LOCK_BASE + idx as u64, 1)?;
            if !file.lock(LOCK_BASE + idx as u64, 1, LockMode::Shared, false)? {
                slots[idx].exclusive = false;
                return Ok(false);
            }
        }
        slots[idx].exclusive = false;
        slots[idx].shared = 1;
        Ok(true)
    }

    fn os_lock(&self, idx: usize, mode: LockMode) -> Result<bool> {
        match &self.lock_file {
            Some(file) => file.lock(LOCK_BASE + idx as u64, 1, mode, false),
            None => Ok(true),
        }
    }

    fn reader_entry(&self, i: usize) -> Result<ReaderRange> {
        let mut buf = [0u8; READER_ENTRY_LEN];
        self.shm.read(READER_TABLE_OFFSET + i * READER_ENTRY_LEN, &mut buf)?;
        let mut first = [0u8; 8];
        let mut last = [0u8; 8];
        first.copy_from_slice(&buf[..8]);
        last.copy_from_slice(&buf[8..]);
        Ok(ReaderRange {
            first: u64::from_be_bytes(first),
            last: u64::from_be_bytes(last),
        })
    }

    fn set_reader_entry(&self, i: usize, range: ReaderRange) -> Result<()> {
        let mut buf = [0u8; READER_ENTRY_LEN];
        buf[..8].copy_from_slice(&range.first.to_be_bytes());
        buf[8..].copy_from_slice(&range.last.to_be_bytes());
        self.shm.write(READER_TABLE_OFFSET + i * READER_ENTRY_LEN, &buf)
    }

    /// Clears the reader table. Only called by recovery.
    pub fn clear_reader_table(&self) -> Result<()> {
        self.shm.zero(READER_TABLE_OFFSET, READER_TABLE_LEN)
    }
}

struct RegistryEntry {
    file: Arc<SharedFile>,
    refs: usize,
}

/// Process-local registry of open database files, keyed by canonical path.
///
/// Construct one per process and share it by `Arc`. Two registries never see
/// each other's in-process lock state, so a second registry behaves like a
/// second process.
#[derive(Default)]
pub struct Registry {
    files: Mutex<HashMap<PathBuf, RegistryEntry>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the shared state for `path`, creating it on first use.
    pub fn connect(
        &self,
        vfs: &dyn Vfs,
        path: &Path,
        multi_process: bool,
    ) -> Result<Arc<SharedFile>> {
        let canonical = vfs.canonical(path)?;
        let mut files = self.files.lock();
        if let Some(entry) = files.get_mut(&canonical) {
            if entry.file.multi_process != multi_process {
                return Err(BtError::Misuse("multi-process mode differs from open connections"));
            }
            entry.refs += 1;
            return Ok(Arc::clone(&entry.file));
        }
        let db = vfs.open(&canonical)?;
        let wal = vfs.open(&sibling_path(&canonical, "-wal"))?;
        let (shm, lock_file) = if multi_process {
            let file = vfs.open(&sibling_path(&canonical, "-shm"))?;
            (Shm::file(Arc::clone(&file)), Some(file))
        } else {
            (Shm::heap(), None)
        };
        let file = Arc::new(SharedFile {
            path: canonical.clone(),
            db,
            wal,
            shm,
            lock_file,
            slots: Mutex::new([SlotState::default(); LockSlot::COUNT]),
            multi_process,
        });
        debug!(path = %canonical.display(), multi_process, "registry.connect.new");
        files.insert(
            canonical,
            RegistryEntry {
                file: Arc::clone(&file),
                refs: 1,
            },
        );
        Ok(file)
    }

    /// Drops one reference; the last one frees the shared state.
    pub fn disconnect(&self, file: &Arc<SharedFile>) {
        let _ = self.disconnect_with(file, |_| Ok(()));
    }

    /// Drops one reference. When it was the last, `on_last` runs while the
    /// registry is still locked, so no connection can reopen the file until
    /// it returns. Returns whether the shared state was freed.
    pub fn disconnect_with(
        &self,
        file: &Arc<SharedFile>,
        on_last: impl FnOnce(&SharedFile) -> Result<()>,
    ) -> Result<bool> {
        let mut files = self.files.lock();
        let remove = match files.get_mut(file.path()) {
            Some(entry) => {
                entry.refs -= 1;
                entry.refs == 0
            }
            None => false,
        };
        if !remove {
            return Ok(false);
        }
        files.remove(file.path());
        debug!(path = %file.path().display(), "registry.disconnect.last");
        on_last(file)?;
        Ok(true)
    }

    /// Number of files currently registered.
    pub fn open_files(&self) -> usize {
        self.files.lock().len()
    }
}

/// Lock slots held by one connection. Everything still held is released on drop.
pub struct Locker {
    shared: Arc<SharedFile>,
    held: [Option<LockMode>; LockSlot::COUNT],
}

impl Locker {
    /// Creates a locker holding nothing.
    pub fn new(shared: Arc<SharedFile>) -> Self {
        Self {
            shared,
            held: [None; LockSlot::COUNT],
        }
    }

    /// Shared file this locker coordinates.
    pub fn shared(&self) -> &Arc<SharedFile> {
        &self.shared
    }

    /// Mode this connection holds on `slot`, if any.
    pub fn held(&self, slot: LockSlot) -> Option<LockMode> {
        self.held[slot.index()]
    }

    /// Takes `slot` in `mode`. Non-blocking attempts return `Ok(false)` on conflict;
    /// blocking attempts poll until the slot frees up or report [`BtError::Busy`].
    pub fn lock(&mut self, slot: LockSlot, mode: LockMode, blocking: bool) -> Result<bool> {
        if let Some(current) = self.held[slot.index()] {
            if current == mode || current == LockMode::Exclusive {
                return Ok(true);
            }
            return Err(BtError::Misuse("lock upgrade is not supported"));
        }
        let mut attempts = 0;
        loop {
            if self.shared.try_lock(slot, mode)? {
                self.held[slot.index()] = Some(mode);
                trace!(?slot, ?mode, "lock.acquired");
                return Ok(true);
            }
            if !blocking {
                return Ok(false);
            }
            attempts += 1;
            if attempts >= BLOCKING_ATTEMPTS {
                return Err(BtError::Busy);
            }
            std::thread::sleep(BLOCKING_POLL);
        }
    }

    /// Releases `slot` if held.
    pub fn unlock(&mut self, slot: LockSlot) -> Result<()> {
        if let Some(mode) = self.held[slot.index()].take() {
            self.shared.release(slot, mode)?;
            trace!(?slot, "lock.released");
        }
        Ok(())
    }

    /// Admits a reader whose snapshot needs `range` of the log, or only the
    /// database file when `range` is `None`. Returns the slot now held shared.
    pub fn acquire_reader(&mut self, range: Option<ReaderRange>) -> Result<LockSlot> {
        for attempt in 0..MAX_READER_ATTEMPTS {
            if let Some(slot) = self.try_acquire_reader(range)? {
                return Ok(slot);
            }
            std::thread::sleep(Duration::from_millis(u64::from(attempt.min(10)) + 1));
        }
        debug!(?range, "lock.acquire_reader.busy");
        Err(BtError::Busy)
    }

    fn try_acquire_reader(&mut self, range: Option<ReaderRange>) -> Result<Option<LockSlot>> {
        let Some(want) = range else {
            let slot = LockSlot::ReaderDbOnly;
            return Ok(self.lock(slot, LockMode::Shared, false)?.then_some(slot));
        };
        for i in 0..N_READER {
            let slot = LockSlot::Reader(i);
            if self.held(slot).is_some() {
                continue;
            }
            let existing = self.shared.reader_entry(i)?;
            // a slot's entry is never refreshed, so only an identical range
            // may be shared; an older `last` would hold checkpoints back
            if existing.last == 0 || existing != want {
                continue;
            }
            if self.lock(slot, LockMode::Shared, false)? {
                if self.shared.reader_entry(i)? == existing {
                    return Ok(Some(slot));
                }
                self.unlock(slot)?;
            }
        }
        for i in 0..N_READER {
            let slot = LockSlot::Reader(i);
            if self.held(slot).is_some() {
                continue;
            }
            if self.lock(slot, LockMode::Exclusive, false)? {
                self.shared.set_reader_entry(i, want)?;
                self.held[slot.index()] = None;
                if self.shared.downgrade(slot)? {
                    self.held[slot.index()] = Some(LockMode::Shared);
                    if self.shared.reader_entry(i)? == want {
                        return Ok(Some(slot));
                    }
                    self.unlock(slot)?;
                }
            }
        }
        Ok(None)
    }

    /// Scans every reader slot with non-blocking exclusive probes.
    pub fn query_readers(&mut self) -> Result<ReaderScan> {
        let mut scan = ReaderScan::default();
        if self.probe(LockSlot::ReaderDbOnly)? {
            scan.db_only = true;
        }
        for i in 0..N_READER {
            if !self.probe(LockSlot::Reader(i))? {
                continue;
            }
            let entry = self.shared.reader_entry(i)?;
            if entry.last == 0 {
                continue;
            }
            scan.min_first = Some(scan.min_first.map_or(entry.first, |m| m.min(entry.first)));
            scan.min_last = Some(scan.min_last.map_or(entry.last, |m| m.min(entry.last)));
        }
        Ok(scan)
    }

    /// True when `slot` is in use by anyone, including this connection.
    fn probe(&mut self, slot: LockSlot) -> Result<bool> {
        if self.held(slot).is_some() {
            return Ok(true);
        }
        if self.lock(slot, LockMode::Exclusive, false)? {
            self.unlock(slot)?;
            return Ok(false);
        }
        Ok(true)
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        for idx in 0..LockSlot::COUNT {
            if let Some(mode) = self.held[idx].take() {
                let slot = match idx {
                    0 => LockSlot::Discover1,
                    1 => LockSlot::Discover2,
                    2 => LockSlot::Writer,
                    3 => LockSlot::Checkpointer,
                    4 => LockSlot::ReaderDbOnly,
                    i => LockSlot::Reader(i - 5),
                };
                let _ = self.shared.release(slot, mode);
            }
        }
    }
}
