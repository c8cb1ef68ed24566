//! Copying committed frames back into the database file.

use std::sync::Arc;

use tracing::{debug, info};

use super::format::{CheckpointRecord, FrameHeader, LogHeader};
use super::index::Index;
use super::{Safety, Wal, DB_HEADER_BYTES, FRAME_HEADER_LEN};
use crate::primitives::concurrency::LockSlot;
use crate::primitives::io::{FileIo, LockMode};
use crate::types::checksum::verify_record;
use crate::types::{BtError, PageNo, Result};

/// Work a checkpoint runs after copying the page that holds the merge schedule.
pub trait CheckpointHook {
    /// Page holding the merge schedule, if the database has one.
    fn schedule_page(&self) -> Option<PageNo>;

    /// Runs pending merge work directly against the database file. Returns
    /// `true` when the file was modified.
    fn merge(&mut self, db: &Arc<dyn FileIo>, page_size: usize) -> Result<bool>;
}

/// Hook for databases without merge work.
pub struct NoMerge;

impl CheckpointHook for NoMerge {
    fn schedule_page(&self) -> Option<PageNo> {
        None
    }

    fn merge(&mut self, _db: &Arc<dyn FileIo>, _page_size: usize) -> Result<bool> {
        Ok(false)
    }
}

/// Outcome of one checkpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    /// Distinct pages copied into the database file.
    pub pages_copied: usize,
    /// Highest sequence number now in the database file; zero when nothing moved.
    pub bound: u64,
    /// A merge step ran.
    pub merged: bool,
    /// Committed frames still waiting in the log.
    pub remaining: u64,
}

impl Wal {
    /// Copies committed frames into the database file, leaving the newest
    /// `leave` frames in the log. Fails with [`BtError::Busy`] if another
    /// connection is checkpointing.
    pub fn checkpoint(&mut self, leave: u64, hook: &mut dyn CheckpointHook) -> Result<CheckpointStats> {
        if self.snapshot.is_some() {
            return Err(BtError::Misuse("checkpoint inside a transaction"));
        }
        if !self.locker.lock(LockSlot::Checkpointer, LockMode::Exclusive, false)? {
            return Err(BtError::Busy);
        }
        let result = self.checkpoint_locked(leave, hook);
        self.locker.unlock(LockSlot::Checkpointer)?;
        result
    }

    fn checkpoint_locked(&mut self, leave: u64, hook: &mut dyn CheckpointHook) -> Result<CheckpointStats> {
        self.begin_read()?;
        let result = self.copy_frames(leave, hook);
        let ended = self.end_read();
        let stats = result?;
        ended?;
        Ok(stats)
    }

    fn copy_frames(&mut self, leave: u64, hook: &mut dyn CheckpointHook) -> Result<CheckpointStats> {
        let hdr = match &self.snapshot {
            Some(snap) => snap.hdr.clone(),
            None => return Err(BtError::Misuse("checkpoint without a snapshot")),
        };
        let ckpt = self.load_checkpoint()?;
        let scan = self.locker.query_readers()?;
        let mut stats = CheckpointStats {
            remaining: (hdr.last_seq + 1).saturating_sub(ckpt.first_read),
            ..CheckpointStats::default()
        };
        if scan.db_only {
            debug!("wal.checkpoint.db_only_reader");
            return Ok(stats);
        }
        let mut bound = hdr.last_seq.saturating_sub(leave);
        if let Some(min_last) = scan.min_last {
            bound = bound.min(min_last);
        }
        if bound < ckpt.first_read {
            return Ok(stats);
        }

        let shared = Arc::clone(&self.shared);
        let index = Index::new(shared.shm());
        let mut pgnos = Vec::new();
        for region in hdr.live() {
            if let Some((lo, hi)) = region.clip(ckpt.first_read, bound) {
                for frame in lo..=hi {
                    pgnos.push(index.pgno(hdr.side, frame)?);
                }
            }
        }
        pgnos.sort_unstable();
        pgnos.dedup();

        self.sync_log()?;
        let db = shared.db();
        let schedule = hook.schedule_page();
        let mut schedule_copied = false;
        let mut page = vec![0u8; self.page_size];
        for &pgno in &pgnos {
            let pgno = PageNo(pgno);
            let (frame, _) = self
                .find_frame(&hdr, pgno, ckpt.first_read, bound)?
                .ok_or(BtError::Corruption("checkpoint frame missing from index"))?;
            self.read_frame_page(frame, &mut page)?;
            if pgno == PageNo::HEADER && !verify_record(&page[..DB_HEADER_BYTES]) {
                return Err(BtError::Corruption("database header in log"));
            }
            db.write_at(pgno.offset(self.page_size), &page)?;
            schedule_copied |= Some(pgno) == schedule;
        }
        if self.safety != Safety::Off {
            db.sync_all()?;
        }

        let mut merges = ckpt.merges;
        if schedule_copied && hook.merge(db, self.page_size)? {
            merges = merges.wrapping_add(1);
            stats.merged = true;
            if self.safety != Safety::Off {
                db.sync_all()?;
            }
        }

        let bound_frame = hdr
            .live()
            .find_map(|r| r.frame_of(bound))
            .ok_or(BtError::Corruption("checkpoint bound outside the log"))?;
        let mut head = [0u8; FRAME_HEADER_LEN];
        shared.wal().read_at(self.frame_offset(bound_frame), &mut head)?;
        let fh = FrameHeader::decode(&head);
        let log = LogHeader {
            generation: 0,
            page_size: self.page_size as u32,
            recover_frame: fh.next,
            recover_seq: bound + 1,
            recover_cksum: fh.cksum,
        };
        self.advance_log_header(log.clone())?;
        self.sync_log()?;
        self.store_checkpoint(&CheckpointRecord {
            first_read: bound + 1,
            recover_frame: log.recover_frame,
            recover_seq: log.recover_seq,
            recover_cksum: log.recover_cksum,
            merges,
            checkpoints: ckpt.checkpoints.wrapping_add(1),
        })?;

        stats.pages_copied = pgnos.len();
        stats.bound = bound;
        stats.remaining = hdr.last_seq - bound;
        self.stats.checkpoints += 1;
        self.stats.frames_copied += bound + 1 - ckpt.first_read;
        info!(
            pages = stats.pages_copied,
            bound,
            remaining = stats.remaining,
            merged = stats.merged,
            "wal.checkpoint.done"
        );
        Ok(stats)
    }
}
