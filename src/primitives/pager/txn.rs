//! Transaction levels: 0 closed, 1 read snapshot, 2 write transaction,
//! 3 and up nested savepoints.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::{CachedPage, DatabaseHeader, Pager, Scope};
use crate::primitives::wal::CommitInfo;
use crate::types::{BtError, PageNo, Result};

const INIT_ATTEMPTS: usize = 100;

impl Pager {
    /// Raises the transaction level to `level`, opening a snapshot, the
    /// write transaction and savepoints as needed.
    pub fn begin(&mut self, level: u32) -> Result<()> {
        if level <= self.level {
            return Ok(());
        }
        let opened = self.level == 0;
        if opened {
            self.open_read()?;
        }
        if level >= 2 && self.level == 1 {
            let started = if self.header.is_some() {
                self.open_write()
            } else {
                Err(BtError::Misuse("database is not initialised"))
            };
            if let Err(err) = started {
                // a snapshot opened by this call does not outlive it
                if opened {
                    self.level = 0;
                    if let Err(end) = self.wal.end_read() {
                        warn!(error = %end, "pager.begin.end_read");
                    }
                }
                return Err(err);
            }
        }
        while self.level < level {
            self.scopes.push(Scope {
                backups: HashMap::new(),
                header: self.header.clone(),
            });
            self.level += 1;
        }
        Ok(())
    }

    fn open_read(&mut self) -> Result<()> {
        self.wal.begin_read()?;
        if let Err(err) = self.load_snapshot() {
            if let Err(end) = self.wal.end_read() {
                warn!(error = %end, "pager.open_read.end_read");
            }
            return Err(err);
        }
        self.level = 1;
        Ok(())
    }

    /// Validates the cache against the new snapshot and loads its header.
    fn load_snapshot(&mut self) -> Result<()> {
        let (change, n_page, cached) = match self.wal.header() {
            Some(h) => (h.change, h.n_page, h.db_header),
            None => return Err(BtError::Misuse("snapshot without a header")),
        };
        let key = (change, self.wal.merges()?);
        if self.cache_key != Some(key) {
            if self.cache_key.is_some() {
                self.drop_cache();
            }
            self.cache_key = Some(key);
        }
        let header = if n_page != 0 {
            Some(DatabaseHeader::decode(&cached).ok_or(BtError::Corruption("database header in log index"))?)
        } else {
            let page1 = self.load(PageNo::HEADER)?;
            match DatabaseHeader::decode(page1.data()) {
                Some(h) => Some(h),
                None if self.db.is_empty()? => None,
                None => return Err(BtError::NotADatabase),
            }
        };
        if let Some(h) = &header {
            if h.page_size as usize != self.page_size {
                return Err(BtError::Corruption("page size differs from the log"));
            }
            self.block_size = h.block_size as usize;
        }
        self.committed = header.clone();
        self.header = header;
        Ok(())
    }

    fn open_write(&mut self) -> Result<()> {
        self.wal.begin_write()?;
        self.level = 2;
        self.scopes.push(Scope {
            backups: HashMap::new(),
            header: self.header.clone(),
        });
        trace!("pager.begin_write");
        Ok(())
    }

    /// Lowers the level to `level`, keeping changes. Dropping below 2 commits
    /// the write transaction; if that fails the level is unchanged.
    pub fn commit(&mut self, level: u32) -> Result<()> {
        if level >= self.level {
            return Ok(());
        }
        if self.level >= 2 {
            if level >= 2 {
                self.fold_scopes(level);
                self.level = level;
                return Ok(());
            }
            self.write_commit()?;
            self.scopes.clear();
            self.level = 1;
            self.release_checkpointer()?;
            self.wal.end_write()?;
            self.checkpoint_due = self.auto_checkpoint > 0;
        }
        if level == 0 && self.level == 1 {
            self.wal.end_read()?;
            self.level = 0;
            self.maybe_auto_checkpoint()?;
        }
        Ok(())
    }

    /// Runs `f` inside a savepoint one level above the current one. The
    /// savepoint is folded in on success and undone on failure; either way
    /// the level is back where it started. Needs a write transaction.
    pub fn scoped<T>(&mut self, f: impl FnOnce(&mut Pager) -> Result<T>) -> Result<T> {
        let level = self.level;
        if level < 2 {
            return Err(BtError::Misuse("savepoint outside a write transaction"));
        }
        self.begin(level + 1)?;
        match f(self) {
            Ok(value) => {
                self.commit(level)?;
                Ok(value)
            }
            Err(err) => {
                self.rollback(level + 1)?;
                self.commit(level)?;
                Err(err)
            }
        }
    }

    /// Merges savepoints above `level` into the scope of `level`.
    fn fold_scopes(&mut self, level: u32) {
        let keep = (level - 1) as usize;
        let inner = self.scopes.split_off(keep);
        if let Some(target) = self.scopes.last_mut() {
            for scope in inner {
                for (pgno, backup) in scope.backups {
                    target.backups.entry(pgno).or_insert(backup);
                }
            }
        }
    }

    fn write_commit(&mut self) -> Result<()> {
        let header = self
            .header
            .clone()
            .ok_or(BtError::Misuse("commit without a header"))?;
        if Some(&header) != self.committed.as_ref() {
            let enc = header.encode();
            self.page_mut(PageNo::HEADER)?[..enc.len()].copy_from_slice(&enc);
        }
        if self.dirty.is_empty() {
            return Ok(());
        }
        let mut images: Vec<(PageNo, Arc<Vec<u8>>)> = Vec::with_capacity(self.dirty.len());
        for pgno in &self.dirty {
            let page = self
                .cache
                .peek(pgno)
                .ok_or(BtError::Corruption("dirty page missing from cache"))?;
            images.push((*pgno, Arc::clone(&page.data)));
        }
        let frames: Vec<(PageNo, &[u8])> = images.iter().map(|(p, d)| (*p, d.as_slice())).collect();
        let enc = header.encode();
        self.wal.write_frames(
            &frames,
            CommitInfo {
                n_page: header.n_page,
                db_header: &enc,
            },
        )?;
        for pgno in std::mem::take(&mut self.dirty) {
            if let Some(page) = self.cache.peek_mut(&pgno) {
                page.dirty = false;
            }
        }
        if let Some(h) = self.wal.header() {
            self.cache_key = Some((h.change, self.wal.merges()?));
        }
        self.stats.commits += 1;
        debug!(pages = frames.len(), n_page = header.n_page, "pager.commit");
        self.committed = Some(header);
        Ok(())
    }

    fn maybe_auto_checkpoint(&mut self) -> Result<()> {
        if !self.checkpoint_due {
            return Ok(());
        }
        self.checkpoint_due = false;
        if self.wal.frames_since_checkpoint()? < self.auto_checkpoint {
            return Ok(());
        }
        match self.checkpoint(0) {
            Ok(_) | Err(BtError::Busy) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Lowers the level to `level`, undoing changes. Rolling back to 2 or
    /// above undoes the savepoint at `level` but keeps it open. Errors from
    /// releasing locks are reported after the state has been rolled back.
    pub fn rollback(&mut self, level: u32) -> Result<()> {
        if level > self.level || (level == self.level && level < 2) {
            return Ok(());
        }
        let mut outcome = Ok(());
        if self.level >= 2 {
            let target = level.max(2);
            while self.scopes.len() > (target - 1) as usize {
                if let Some(scope) = self.scopes.pop() {
                    self.restore(scope);
                }
            }
            if let Some(scope) = self.scopes.last_mut() {
                let backups = std::mem::take(&mut scope.backups);
                let header = scope.header.clone();
                self.restore(Scope { backups, header });
            }
            self.level = target;
            self.stats.rollbacks += 1;
            self.epoch += 1;
            if level >= 2 {
                return Ok(());
            }
            self.scopes.clear();
            self.dirty.clear();
            self.header = self.committed.clone();
            self.level = 1;
            outcome = self.release_checkpointer().and(self.wal.end_write());
        }
        if level == 0 && self.level == 1 {
            self.level = 0;
            if let Err(err) = self.wal.end_read() {
                warn!(error = %err, "pager.rollback.end_read");
                outcome = outcome.and(Err(err));
            }
        }
        outcome
    }

    /// Puts back every image `scope` saved, and its header.
    fn restore(&mut self, scope: Scope) {
        for (pgno, backup) in scope.backups {
            if backup.dirty {
                self.dirty.insert(pgno);
            } else {
                self.dirty.remove(&pgno);
            }
            self.cache.put(
                pgno,
                CachedPage {
                    data: backup.data,
                    dirty: backup.dirty,
                },
            );
        }
        self.header = scope.header;
    }

    /// Opens the database, writing the initial layout when it is empty.
    pub(super) fn initialise(&mut self) -> Result<()> {
        for _ in 0..INIT_ATTEMPTS {
            self.begin(1)?;
            if self.header.is_some() {
                return self.commit(0);
            }
            match self.create() {
                Ok(()) => return self.commit(0),
                Err(err) if err.is_retryable() => {
                    self.rollback(0)?;
                    std::thread::yield_now();
                }
                Err(err) => {
                    if let Err(rb) = self.rollback(0) {
                        warn!(error = %rb, "pager.initialise.rollback_failed");
                    }
                    return Err(err);
                }
            }
        }
        Err(BtError::Busy)
    }

    /// Writes pages 1 through 4. Zeroed pages are valid empty tree roots and
    /// an idle merge schedule.
    fn create(&mut self) -> Result<()> {
        self.wal.begin_write()?;
        self.level = 2;
        self.scopes.push(Scope {
            backups: HashMap::new(),
            header: None,
        });
        let header = DatabaseHeader::initial(self.page_size as u32, self.block_size as u32);
        for pgno in 2..=header.n_page {
            self.page_mut(PageNo(pgno))?.fill(0);
        }
        self.header = Some(header);
        self.write_commit()?;
        self.scopes.clear();
        self.level = 1;
        self.wal.end_write()?;
        debug!(page_size = self.page_size, block_size = self.block_size, "pager.create");
        Ok(())
    }
}
