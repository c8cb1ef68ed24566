#![forbid(unsafe_code)]
//! Page cache, transaction levels and page/block allocation on top of the log.
//!
//! Pages are cached as reference-counted images. Readers receive [`PageRef`]
//! clones; writers mutate through [`Pager::page_mut`], which copies an image
//! on write whenever anything else still holds it. Every open write scope
//! keeps the pre-images of the pages it touched so it can be rolled back.

mod freelist;
mod header;
mod txn;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use lru::LruCache;
use tracing::{debug, trace};

use crate::primitives::concurrency::{LockSlot, SharedFile};
use crate::primitives::io::{FileIo, LockMode};
use crate::primitives::wal::{
    CheckpointHook, CheckpointStats, NoMerge, Safety, Wal, WalStats, DB_HEADER_BYTES,
};
use crate::types::{BtError, PageNo, Result};

pub use freelist::FreeListDump;
pub use header::{validate_sizes, DatabaseHeader, MAX_PAGE_SIZE, MIN_PAGE_SIZE};

/// Settings the pager is opened with.
#[derive(Clone, Debug)]
pub struct PagerOptions {
    /// Page size for a new database.
    pub page_size: usize,
    /// Block size for a new database.
    pub block_size: usize,
    /// Clean pages kept cached.
    pub cache_pages: usize,
    /// Durability level.
    pub safety: Safety,
    /// Checkpoint once this many frames are waiting; zero disables.
    pub auto_checkpoint: u64,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: 4096,
            block_size: 1 << 20,
            cache_pages: 1000,
            safety: Safety::Normal,
            auto_checkpoint: 1000,
        }
    }
}

/// Shared, read-only handle to a cached page image.
#[derive(Clone)]
pub struct PageRef {
    pgno: PageNo,
    data: Arc<Vec<u8>>,
}

impl PageRef {
    /// Wraps an image read outside the cache.
    pub fn detached(pgno: PageNo, data: Vec<u8>) -> Self {
        Self {
            pgno,
            data: Arc::new(data),
        }
    }

    /// Page number.
    pub fn pgno(&self) -> PageNo {
        self.pgno
    }

    /// Page bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for PageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageRef").field("pgno", &self.pgno).finish()
    }
}

struct CachedPage {
    data: Arc<Vec<u8>>,
    dirty: bool,
}

/// Image of a page as it was when a scope first wrote it.
struct Backup {
    data: Arc<Vec<u8>>,
    dirty: bool,
}

/// One write scope: the transaction itself (level 2) or a savepoint.
struct Scope {
    backups: HashMap<PageNo, Backup>,
    header: Option<DatabaseHeader>,
}

/// Cache and transaction counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PagerStats {
    /// Page requests served from the cache.
    pub hits: u64,
    /// Page requests that read the log or the database file.
    pub misses: u64,
    /// Clean pages dropped to stay within the cache limit.
    pub evictions: u64,
    /// Write transactions committed.
    pub commits: u64,
    /// Rollbacks of a write scope.
    pub rollbacks: u64,
    /// Times the cache was dropped because another connection changed the database.
    pub invalidations: u64,
}

impl fmt::Display for PagerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} evictions={} commits={} rollbacks={} invalidations={}",
            self.hits, self.misses, self.evictions, self.commits, self.rollbacks, self.invalidations
        )
    }
}

/// Page cache and transaction state of one connection.
pub struct Pager {
    wal: Wal,
    db: Arc<dyn FileIo>,
    page_size: usize,
    block_size: usize,
    cache: LruCache<PageNo, CachedPage>,
    cache_limit: usize,
    /// Snapshot identity (header change counter, merge count) the cache is valid for.
    cache_key: Option<(u32, u32)>,
    dirty: BTreeSet<PageNo>,
    level: u32,
    header: Option<DatabaseHeader>,
    committed: Option<DatabaseHeader>,
    scopes: Vec<Scope>,
    epoch: u64,
    auto_checkpoint: u64,
    checkpoint_due: bool,
    hook: Box<dyn CheckpointHook + Send>,
    holds_checkpointer: bool,
    stats: PagerStats,
}

impl Pager {
    /// Opens the pager for `shared`, creating the initial layout if the
    /// database is empty.
    pub fn open(shared: Arc<SharedFile>, options: &PagerOptions) -> Result<Pager> {
        let db = Arc::clone(shared.db());
        let mut raw = [0u8; DB_HEADER_BYTES];
        db.read_zeroed(0, &mut raw)?;
        let existing = DatabaseHeader::decode(&raw);
        let (page_size, block_size) = match &existing {
            Some(h) => (h.page_size as usize, h.block_size as usize),
            None => (options.page_size, options.block_size),
        };
        validate_sizes(page_size, block_size)?;
        let wal = Wal::connect(shared, page_size, options.safety)?;
        let page_size = wal.page_size();
        let mut pager = Pager {
            wal,
            db,
            page_size,
            block_size,
            cache: LruCache::unbounded(),
            cache_limit: options.cache_pages.max(16),
            cache_key: None,
            dirty: BTreeSet::new(),
            level: 0,
            header: None,
            committed: None,
            scopes: Vec::new(),
            epoch: 0,
            auto_checkpoint: options.auto_checkpoint,
            checkpoint_due: false,
            hook: Box::new(NoMerge),
            holds_checkpointer: false,
            stats: PagerStats::default(),
        };
        pager.initialise()?;
        debug!(page_size, block_size = pager.block_size, "pager.open");
        Ok(pager)
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Current transaction level.
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Bumped whenever a page image or the cache changes; cursors holding
    /// page references reseek when it moves.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Cache and transaction counters.
    pub fn stats(&self) -> PagerStats {
        self.stats
    }

    /// Log counters.
    pub fn wal_stats(&self) -> WalStats {
        self.wal.stats()
    }

    /// Changes the durability level.
    pub fn set_safety(&mut self, safety: Safety) {
        self.wal.set_safety(safety);
    }

    /// Current durability level.
    pub fn safety(&self) -> Safety {
        self.wal.safety()
    }

    /// Sets the auto-checkpoint threshold in frames; zero disables.
    pub fn set_auto_checkpoint(&mut self, frames: u64) {
        self.auto_checkpoint = frames;
    }

    /// Installs the work checkpoints run after copying the schedule page.
    pub fn set_checkpoint_hook(&mut self, hook: Box<dyn CheckpointHook + Send>) {
        self.hook = hook;
    }

    /// Database file handle.
    pub fn db_file(&self) -> &Arc<dyn FileIo> {
        &self.db
    }

    /// Header of the open snapshot or transaction.
    pub fn header(&self) -> Result<&DatabaseHeader> {
        if self.level == 0 {
            return Err(BtError::Misuse("no transaction is open"));
        }
        self.header
            .as_ref()
            .ok_or(BtError::Misuse("database is not initialised"))
    }

    /// Mutable header; requires a write transaction.
    pub fn header_mut(&mut self) -> Result<&mut DatabaseHeader> {
        if self.level < 2 {
            return Err(BtError::Misuse("header change outside a write transaction"));
        }
        self.epoch += 1;
        self.header
            .as_mut()
            .ok_or(BtError::Misuse("database is not initialised"))
    }

    /// Returns `pgno`, reading it from the log or the database file on a miss.
    pub fn page(&mut self, pgno: PageNo) -> Result<PageRef> {
        if self.level == 0 {
            return Err(BtError::Misuse("page read outside a transaction"));
        }
        if let Some(hdr) = &self.header {
            if pgno.is_none() || pgno.0 > hdr.n_page {
                return Err(BtError::Corruption("page number out of range"));
            }
        }
        self.load(pgno)
    }

    fn load(&mut self, pgno: PageNo) -> Result<PageRef> {
        if let Some(entry) = self.cache.get(&pgno) {
            self.stats.hits += 1;
            return Ok(PageRef {
                pgno,
                data: Arc::clone(&entry.data),
            });
        }
        self.stats.misses += 1;
        let data = Arc::new(self.read_through(pgno)?);
        self.cache.put(
            pgno,
            CachedPage {
                data: Arc::clone(&data),
                dirty: false,
            },
        );
        self.evict();
        Ok(PageRef { pgno, data })
    }

    fn read_through(&self, pgno: PageNo) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.page_size];
        if !self.wal.read_page(pgno, &mut buf)? {
            self.db.read_zeroed(pgno.offset(self.page_size), &mut buf)?;
        }
        Ok(buf)
    }

    /// Re-reads `pgno` bypassing the cache, unless this transaction changed it.
    pub fn page_uncached(&mut self, pgno: PageNo) -> Result<PageRef> {
        if !self.dirty.contains(&pgno) {
            self.cache.pop(&pgno);
        }
        self.page(pgno)
    }

    /// Writable image of `pgno`. The first write in each scope saves the
    /// previous image for rollback.
    pub fn page_mut(&mut self, pgno: PageNo) -> Result<&mut [u8]> {
        if self.level < 2 {
            return Err(BtError::Misuse("page write outside a write transaction"));
        }
        if pgno.is_none() {
            return Err(BtError::Misuse("page 0 does not exist"));
        }
        if !self.cache.contains(&pgno) {
            self.load(pgno)?;
        }
        let scope = self
            .scopes
            .last_mut()
            .ok_or(BtError::Misuse("write transaction without a scope"))?;
        let entry = self
            .cache
            .get_mut(&pgno)
            .ok_or(BtError::Corruption("page vanished from cache"))?;
        scope.backups.entry(pgno).or_insert_with(|| Backup {
            data: Arc::clone(&entry.data),
            dirty: entry.dirty,
        });
        entry.dirty = true;
        self.dirty.insert(pgno);
        self.epoch += 1;
        Ok(Arc::make_mut(&mut entry.data).as_mut_slice())
    }

    /// Drops least-recently-used clean pages nobody references until the cache fits.
    fn evict(&mut self) {
        let excess = self.cache.len().saturating_sub(self.cache_limit);
        if excess == 0 {
            return;
        }
        let victims: Vec<PageNo> = self
            .cache
            .iter()
            .rev()
            .filter(|(_, page)| !page.dirty && Arc::strong_count(&page.data) == 1)
            .map(|(pgno, _)| *pgno)
            .take(excess)
            .collect();
        for pgno in victims {
            self.cache.pop(&pgno);
            self.stats.evictions += 1;
        }
    }

    fn drop_cache(&mut self) {
        self.cache.clear();
        self.epoch += 1;
        self.stats.invalidations += 1;
        trace!("pager.cache.invalidated");
    }

    /// Page references held outside the pager's own bookkeeping.
    pub fn outstanding_page_refs(&self) -> usize {
        let mut total = 0;
        for (pgno, page) in self.cache.iter() {
            let backups = self
                .scopes
                .iter()
                .filter_map(|s| s.backups.get(pgno))
                .filter(|b| Arc::ptr_eq(&b.data, &page.data))
                .count();
            total += Arc::strong_count(&page.data).saturating_sub(1 + backups);
        }
        total
    }

    /// Takes the checkpointer lock for the rest of this write transaction so
    /// the merge-schedule page can be read and rewritten safely.
    pub fn lock_checkpointer(&mut self) -> Result<()> {
        if self.level < 2 {
            return Err(BtError::Misuse("checkpointer lock outside a write transaction"));
        }
        if !self.holds_checkpointer {
            self.wal
                .locker()
                .lock(LockSlot::Checkpointer, LockMode::Exclusive, true)?;
            self.holds_checkpointer = true;
        }
        Ok(())
    }

    fn release_checkpointer(&mut self) -> Result<()> {
        if self.holds_checkpointer {
            self.holds_checkpointer = false;
            self.wal.locker().unlock(LockSlot::Checkpointer)?;
        }
        Ok(())
    }

    /// Copies logged pages into the database file. Requires level 0.
    pub fn checkpoint(&mut self, leave: u64) -> Result<CheckpointStats> {
        if self.level != 0 {
            return Err(BtError::Misuse("checkpoint inside a transaction"));
        }
        let stats = self.wal.checkpoint(leave, self.hook.as_mut())?;
        self.checkpoint_due = false;
        Ok(stats)
    }

    /// Committed frames still waiting for a checkpoint.
    pub fn frames_since_checkpoint(&self) -> Result<u64> {
        self.wal.frames_since_checkpoint()
    }

    /// Closes the connection. Returns `true` when this was the last
    /// connection and the log is empty.
    pub fn close(mut self, checkpoint_on_close: bool) -> Result<bool> {
        let rolled_back = if self.level > 0 { self.rollback(0) } else { Ok(()) };
        let Pager { wal, mut hook, .. } = self;
        let clean = wal.disconnect(hook.as_mut(), checkpoint_on_close)?;
        rolled_back?;
        Ok(clean)
    }
}

#[cfg(test)]
mod tests;
