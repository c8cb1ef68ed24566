#![forbid(unsafe_code)]

//! Database connections.
//!
//! A [`Db`] owns one pager and exposes transactions, point access, cursors,
//! maintenance and diagnostics. Calls made with no transaction open run in a
//! transaction of their own.

mod cursor;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use tracing::{debug, info, warn};

use crate::primitives::concurrency::{Registry, SharedFile};
use crate::primitives::io::{sibling_path, StdVfs, Vfs};
use crate::primitives::pager::{Pager, PagerOptions, PagerStats};
use crate::primitives::wal::{CheckpointStats, Safety, WalStats};
use crate::storage::btree::overflow::{build_cell, free_cell, full_value};
use crate::storage::btree::{self, BTreeStats, BTreeStatsSnapshot, Node, Tree};
use crate::storage::fastinsert::{self, Level, MergeHook, MergePolicy, MergeReport, MultiCursor};
use crate::storage::verify::{audit, PageAudit};
use crate::types::{BtError, PageNo, Result};

pub use crate::storage::btree::SeekResult;
pub use crate::storage::fastinsert::SeekMode;
pub use cursor::Cursor;

/// Settings for [`Db::open`].
#[derive(Clone, Debug)]
pub struct DbOptions {
    /// Page size for a new database; an existing one keeps its own.
    pub page_size: usize,
    /// Block size for a new database; a multiple of the page size.
    pub block_size: usize,
    /// Clean pages kept cached.
    pub cache_pages: usize,
    /// Durability level.
    pub safety: Safety,
    /// Checkpoint after a commit once this many frames wait; zero disables.
    pub auto_checkpoint: u64,
    /// Coordinate with other processes through lock files and shared memory.
    pub multi_process: bool,
    /// Sealed fast-insert levels of one age before they are merged.
    pub fast_merge_levels: u32,
    /// Output blocks a merge receives up front and per extension.
    pub merge_blocks: u32,
    /// Checkpoint when the last connection closes.
    pub checkpoint_on_close: bool,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            page_size: 4096,
            block_size: 1 << 20,
            cache_pages: 1000,
            safety: Safety::Normal,
            auto_checkpoint: 1000,
            multi_process: true,
            fast_merge_levels: 4,
            merge_blocks: 4,
            checkpoint_on_close: true,
        }
    }
}

impl DbOptions {
    fn pager_options(&self) -> PagerOptions {
        PagerOptions {
            page_size: self.page_size,
            block_size: self.block_size,
            cache_pages: self.cache_pages,
            safety: self.safety,
            auto_checkpoint: self.auto_checkpoint,
        }
    }

    fn merge_policy(&self) -> MergePolicy {
        MergePolicy {
            min_levels: self.fast_merge_levels,
            blocks_per_round: self.merge_blocks,
        }
    }
}

/// Which structure a write goes to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Target {
    /// The main tree. Routed to fast-insert while fast-insert holds data,
    /// so that newer main writes are not shadowed by older fast ones.
    #[default]
    Main,
    /// The current fast-insert level.
    FastInsert,
}

/// Counters of one connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DbStats {
    /// Cache and transaction counters.
    pub pager: PagerStats,
    /// Log counters.
    pub wal: WalStats,
    /// Tree counters.
    pub btree: BTreeStatsSnapshot,
}

impl fmt::Display for DbStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "pager: {}", self.pager)?;
        writeln!(
            f,
            "wal: frames_written={} commits={} checkpoints={} frames_copied={} wraps={} recoveries={}",
            self.wal.frames_written,
            self.wal.commits,
            self.wal.checkpoints,
            self.wal.frames_copied,
            self.wal.wraps,
            self.wal.recoveries
        )?;
        write!(f, "btree: {}", self.btree)
    }
}

/// One connection to a database file.
pub struct Db {
    registry: Arc<Registry>,
    vfs: Arc<dyn Vfs>,
    shared: Arc<SharedFile>,
    pager: Option<Pager>,
    options: DbOptions,
    policy: MergePolicy,
    stats: BTreeStats,
    /// Bumped whenever the data a cursor could have cached may have changed.
    generation: u64,
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db")
            .field("path", &self.shared.path())
            .field("open", &self.pager.is_some())
            .field("options", &self.options)
            .finish()
    }
}

fn default_registry() -> Arc<Registry> {
    static DEFAULT: OnceLock<Arc<Registry>> = OnceLock::new();
    Arc::clone(DEFAULT.get_or_init(Registry::new))
}

impl Db {
    /// Opens `path` through `vfs`, creating the database if the file is
    /// empty. Connections sharing `registry` coordinate in-process.
    pub fn open(
        registry: Arc<Registry>,
        vfs: Arc<dyn Vfs>,
        path: impl AsRef<Path>,
        options: DbOptions,
    ) -> Result<Db> {
        let path = path.as_ref();
        let shared = registry.connect(vfs.as_ref(), path, options.multi_process)?;
        let pager = match Self::open_pager(&shared, &options) {
            Ok(pager) => pager,
            Err(err) => {
                registry.disconnect(&shared);
                return Err(err);
            }
        };
        debug!(path = %path.display(), page_size = pager.page_size(), "db.open");
        Ok(Db {
            registry,
            vfs,
            shared,
            pager: Some(pager),
            policy: options.merge_policy(),
            options,
            stats: BTreeStats::default(),
            generation: 0,
        })
    }

    fn open_pager(shared: &Arc<SharedFile>, options: &DbOptions) -> Result<Pager> {
        let mut pager = Pager::open(Arc::clone(shared), &options.pager_options())?;
        pager.begin(1)?;
        let layout = pager.header().map(|h| (h.schedule, h.block_pages()));
        pager.commit(0)?;
        let (schedule, block_pages) = layout?;
        pager.set_checkpoint_hook(Box::new(MergeHook::new(schedule, block_pages)));
        Ok(pager)
    }

    /// Opens `path` on the local file system with default options, sharing
    /// a process-wide registry with every other `open_default` call.
    pub fn open_default(path: impl AsRef<Path>) -> Result<Db> {
        Db::open(default_registry(), Arc::new(StdVfs), path, DbOptions::default())
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        self.shared.path()
    }

    fn pager(&mut self) -> Result<&mut Pager> {
        self.pager.as_mut().ok_or(BtError::Misuse("database is closed"))
    }

    fn pager_ref(&self) -> Result<&Pager> {
        self.pager.as_ref().ok_or(BtError::Misuse("database is closed"))
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    fn touch(&mut self) {
        self.generation += 1;
    }

    /// Runs `f` in a read transaction, opening one if none is open.
    pub(crate) fn read<T>(&mut self, f: impl FnOnce(&mut Db) -> Result<T>) -> Result<T> {
        if self.pager()?.level() >= 1 {
            return f(self);
        }
        self.pager()?.begin(1)?;
        let out = f(self);
        // the snapshot ends here; nothing decoded under it stays valid
        self.touch();
        let pager = self.pager()?;
        match out {
            Ok(value) => {
                pager.commit(0)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rb) = pager.rollback(0) {
                    warn!(error = %rb, "db.read.rollback_failed");
                }
                Err(err)
            }
        }
    }

    /// Runs `f` in a write transaction, opening one if none is open. Inside
    /// a caller's transaction a failing `f` is undone on its own.
    pub(crate) fn write<T>(&mut self, f: impl FnOnce(&mut Pager, &MergePolicy, &BTreeStats) -> Result<T>) -> Result<T> {
        self.touch();
        let Db { pager, policy, stats, .. } = self;
        let pager = pager.as_mut().ok_or(BtError::Misuse("database is closed"))?;
        let start = pager.level();
        if start >= 2 {
            return pager.scoped(|p| f(p, policy, stats));
        }
        pager.begin(2)?;
        let out = f(pager, policy, stats).and_then(|value| pager.commit(start).map(|()| value));
        if out.is_err() {
            if let Err(rb) = pager.rollback(start) {
                warn!(error = %rb, "db.write.rollback_failed");
            }
        }
        out
    }

    /// Current transaction level: 0 none, 1 reading, 2 writing, 3 and up
    /// nested savepoints.
    pub fn transaction_level(&self) -> u32 {
        self.pager.as_ref().map_or(0, Pager::level)
    }

    /// Raises the transaction level to `level`.
    pub fn begin(&mut self, level: u32) -> Result<()> {
        self.touch();
        self.pager()?.begin(level)
    }

    /// Lowers the transaction level to `level`, keeping changes.
    pub fn commit(&mut self, level: u32) -> Result<()> {
        self.touch();
        self.pager()?.commit(level)
    }

    /// Lowers the transaction level to `level`, undoing changes.
    pub fn rollback(&mut self, level: u32) -> Result<()> {
        self.touch();
        self.pager()?.rollback(level)
    }

    /// Writes `value` under `key`, or deletes `key` when `value` is `None`.
    pub fn replace(&mut self, key: &[u8], value: Option<&[u8]>, target: Target) -> Result<()> {
        self.write(|pager, policy, stats| {
            if target == Target::FastInsert || fastinsert::is_active(pager)? {
                return fastinsert::write(pager, key, value, policy, stats);
            }
            if key.len() > btree::max_key_len(pager.page_size()) {
                return Err(BtError::TooBig);
            }
            let main = Tree::new(pager.header()?.main_root);
            let old = match value {
                Some(value) => {
                    let cell = build_cell(pager, key, value)?;
                    main.upsert(pager, cell, stats)?
                }
                None => main.remove(pager, key, stats)?,
            };
            if let Some(old) = old {
                free_cell(pager, &old)?;
            }
            Ok(())
        })
    }

    /// Value stored under `key`, looking through every fast-insert level and
    /// the main tree.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.read(|db| {
            let mut cursor = db.view()?;
            let pager = db.pager()?;
            match cursor.seek(pager, key, SeekMode::Eq)? {
                SeekResult::Exact => match cursor.cell() {
                    Some(cell) => {
                        let cell = cell.clone();
                        Ok(Some(full_value(pager, &cell)?))
                    }
                    None => Ok(None),
                },
                _ => Ok(None),
            }
        })
    }

    /// A merged cursor over the current snapshot. Needs a transaction.
    pub(crate) fn view(&mut self) -> Result<MultiCursor> {
        let pager = self.pager()?;
        let levels = fastinsert::load_levels(pager)?;
        let main = pager.header()?.main_root;
        Ok(MultiCursor::over(&levels, Some(main), false))
    }

    pub(crate) fn pager_mut(&mut self) -> Result<&mut Pager> {
        self.pager()
    }

    /// Unpositioned cursor.
    pub fn cursor(&self) -> Cursor {
        Cursor::new()
    }

    /// Application cookie, typically a schema version.
    pub fn cookie(&mut self) -> Result<u32> {
        self.read(|db| Ok(db.pager()?.header()?.cookie))
    }

    /// Sets the application cookie.
    pub fn set_cookie(&mut self, cookie: u32) -> Result<()> {
        self.write(|pager, _, _| {
            pager.header_mut()?.cookie = cookie;
            Ok(())
        })
    }

    /// Page size of the open database.
    pub fn page_size(&self) -> Result<usize> {
        Ok(self.pager_ref()?.page_size())
    }

    /// Block size of the open database.
    pub fn block_size(&self) -> Result<usize> {
        Ok(self.pager_ref()?.block_size())
    }

    /// Changes the durability level for later commits.
    pub fn set_safety(&mut self, safety: Safety) -> Result<()> {
        self.options.safety = safety;
        self.pager()?.set_safety(safety);
        Ok(())
    }

    /// Changes the auto-checkpoint threshold; zero disables it.
    pub fn set_auto_checkpoint(&mut self, frames: u64) -> Result<()> {
        self.options.auto_checkpoint = frames;
        self.pager()?.set_auto_checkpoint(frames);
        Ok(())
    }

    /// Copies logged pages into the database file, leaving the newest
    /// `leave` frames in the log. Runs a merge round when one is due.
    pub fn checkpoint(&mut self, leave: u64) -> Result<CheckpointStats> {
        self.touch();
        let stats = self.pager()?.checkpoint(leave)?;
        debug!(copied = stats.pages_copied, merged = stats.merged, "db.checkpoint");
        Ok(stats)
    }

    /// Runs scheduled fast-insert merges until none is left. Needs no open
    /// transaction.
    pub fn fast_merge(&mut self) -> Result<MergeReport> {
        self.touch();
        let Db { pager, policy, stats, .. } = self;
        let pager = pager.as_mut().ok_or(BtError::Misuse("database is closed"))?;
        let out = fastinsert::run_merges(pager, policy, stats);
        let report = out?;
        info!(rounds = report.rounds, integrated = report.integrated, "db.fast_merge");
        Ok(report)
    }

    /// Moves all fast-insert data into the main tree. Returns the number of
    /// entries applied.
    pub fn fast_flush(&mut self) -> Result<u64> {
        self.write(|pager, _, stats| fastinsert::flush(pager, stats))
    }

    /// Registered fast-insert levels, youngest age first and newest level
    /// first within an age.
    pub fn fast_levels(&mut self) -> Result<Vec<Level>> {
        self.read(|db| fastinsert::load_levels(db.pager()?))
    }

    /// Counters of this connection.
    pub fn stats(&self) -> Result<DbStats> {
        let pager = self.pager_ref()?;
        Ok(DbStats {
            pager: pager.stats(),
            wal: pager.wal_stats(),
            btree: self.stats.snapshot(),
        })
    }

    /// Database header of the current snapshot, formatted for humans.
    pub fn dump_header(&mut self) -> Result<String> {
        self.read(|db| Ok(db.pager()?.header()?.to_string()))
    }

    /// One page: its decoded node if it is a tree page, then a hex dump.
    pub fn dump_page(&mut self, pgno: PageNo) -> Result<String> {
        self.read(|db| {
            let page = db.pager()?.page(pgno)?;
            let mut out = format!("page {pgno}\n");
            match Node::decode(page.data()) {
                Ok(Node::Leaf(cells)) => {
                    out.push_str(&format!("leaf, {} cells\n", cells.len()));
                    for cell in &cells {
                        out.push_str(&format!(
                            "  {} ({} bytes){}\n",
                            hex::encode(cell.key()),
                            cell.value_len(),
                            if cell.is_tombstone() { " deleted" } else { "" }
                        ));
                    }
                }
                Ok(Node::Internal { keys, children }) => {
                    out.push_str(&format!("internal, {} children\n", children.len()));
                    for (i, child) in children.iter().enumerate() {
                        out.push_str(&format!("  -> {child}\n"));
                        if let Some(key) = keys.get(i) {
                            out.push_str(&format!("  {}\n", hex::encode(key)));
                        }
                    }
                }
                Err(_) => out.push_str("not a tree page\n"),
            }
            for (i, row) in page.data().chunks(32).enumerate() {
                if row.iter().any(|&b| b != 0) {
                    out.push_str(&format!("{:06x}  {}\n", i * 32, hex::encode(row)));
                }
            }
            Ok(out)
        })
    }

    /// Both free lists, formatted for humans.
    pub fn dump_freelist(&mut self) -> Result<String> {
        self.read(|db| {
            let lists = db.pager()?.free_lists()?;
            let join = |pages: &[PageNo]| pages.iter().map(PageNo::to_string).collect::<Vec<_>>().join(" ");
            Ok(format!(
                "{lists}\npages: {}\nblocks: {}\nblock trunks: {}",
                join(&lists.pages),
                join(&lists.blocks),
                join(&lists.block_trunks)
            ))
        })
    }

    /// Page references handed out and not yet dropped.
    pub fn outstanding_page_refs(&self) -> usize {
        self.pager.as_ref().map_or(0, Pager::outstanding_page_refs)
    }

    /// Full page accounting of the current snapshot.
    pub fn audit(&mut self) -> Result<PageAudit> {
        self.read(|db| audit(db.pager()?))
    }

    /// Pages neither reachable nor free.
    pub fn leaked_pages(&mut self) -> Result<Vec<PageNo>> {
        let report = self.audit()?;
        if report.leaked_count > report.leaked.len() {
            warn!(leaked = report.leaked_count, "db.leaked_pages.truncated");
        }
        Ok(report.leaked)
    }

    /// Closes the connection, rolling back any open transaction. The last
    /// connection checkpoints (per [`DbOptions::checkpoint_on_close`]) and
    /// removes the log and shared-memory files.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(pager) = self.pager.take() else {
            return Ok(());
        };
        let closed = pager.close(self.options.checkpoint_on_close);
        let vfs = Arc::clone(&self.vfs);
        let clean = matches!(closed, Ok(true));
        self.registry.disconnect_with(&self.shared, |file| {
            if clean {
                remove_if_present(vfs.as_ref(), sibling_path(file.path(), "-wal"))?;
                remove_if_present(vfs.as_ref(), sibling_path(file.path(), "-shm"))?;
            }
            Ok(())
        })?;
        debug!(path = %self.shared.path().display(), clean, "db.close");
        closed.map(|_| ())
    }
}

fn remove_if_present(vfs: &dyn Vfs, path: PathBuf) -> Result<()> {
    if vfs.exists(&path)? {
        vfs.delete(&path)?;
    }
    Ok(())
}

impl Drop for Db {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "db.drop.close_failed");
        }
    }
}

#[cfg(test)]
mod tests;
