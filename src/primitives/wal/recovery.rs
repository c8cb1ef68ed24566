//! Rebuilding the shared index from the log file.
//!
//! Recovery never writes the database file, so running it again after a
//! crash in the middle of it produces the same state.

use std::sync::Arc;

use tracing::{debug, info};

use super::format::{CheckpointRecord, FrameHeader, LogHeader, Region, WalHeader};
use super::index::Index;
use super::{fresh_seed, Wal, DB_HEADER_BYTES, FRAME_HEADER_LEN, LOG_FRAMES_START, LOG_SECTOR};
use crate::primitives::concurrency::LockSlot;
use crate::primitives::io::{FileIo, LockMode};
use crate::types::checksum::Rolling;
use crate::types::{BtError, Result};

/// State as of the last commit frame seen while walking the log.
struct Committed {
    regions: Vec<Region>,
    last_seq: u64,
    cksum: Rolling,
    next: u32,
    n_page: u32,
    page1: Option<u32>,
}

impl Wal {
    /// Recovery for a connection that found both shared headers torn while
    /// other connections are live.
    pub(super) fn recover_in_session(&mut self) -> Result<()> {
        if !self.locker.lock(LockSlot::Writer, LockMode::Exclusive, false)? {
            return Err(BtError::Busy);
        }
        let result = match self.load_header() {
            Ok(Some(_)) => Ok(()),
            Ok(None) => self.recover(self.page_size, false),
            Err(err) => Err(err),
        };
        self.locker.unlock(LockSlot::Writer)?;
        result
    }

    fn write_log_header(&self, slot: usize, log: &LogHeader) -> Result<()> {
        self.shared
            .wal()
            .write_at(slot as u64 * LOG_SECTOR, &log.encode())
    }

    /// Reads both log headers and returns the newest valid one with its slot.
    pub(super) fn read_log_header(&self) -> Result<Option<(usize, LogHeader)>> {
        let mut sectors = vec![0u8; LOG_FRAMES_START as usize];
        self.shared.wal().read_zeroed(0, &mut sectors)?;
        let sector = LOG_SECTOR as usize;
        Ok(LogHeader::newest(
            LogHeader::decode(&sectors[..sector]),
            LogHeader::decode(&sectors[sector..]),
        ))
    }

    /// Writes `log` over the older of the two header slots.
    pub(super) fn advance_log_header(&self, mut log: LogHeader) -> Result<()> {
        let slot = match self.read_log_header()? {
            Some((slot, current)) => {
                log.generation = (current.generation + 1) % 3;
                1 - slot
            }
            None => {
                log.generation = 0;
                0
            }
        };
        self.write_log_header(slot, &log)
    }

    /// Rebuilds the shared header and index side 0 from the log. `first` is
    /// set for the first connection, which also resets shared memory and the
    /// checkpoint record.
    pub(super) fn recover(&mut self, page_size: usize, first: bool) -> Result<()> {
        let log = match self.read_log_header()? {
            Some((_, log)) => log,
            None => {
                let log = LogHeader {
                    generation: 0,
                    page_size: page_size as u32,
                    recover_frame: 1,
                    recover_seq: 1,
                    recover_cksum: fresh_seed(),
                };
                self.shared.wal().truncate(0)?;
                self.write_log_header(0, &log)?;
                self.sync_log()?;
                debug!(page_size, "wal.recover.fresh_log");
                log
            }
        };
        self.page_size = log.page_size as usize;
        if first {
            self.shm().reset()?;
        }

        let shared = Arc::clone(&self.shared);
        let index = Index::new(shared.shm());
        let wal = shared.wal();
        let frame_size = FRAME_HEADER_LEN + self.page_size;
        let max_frames = wal.len()?.saturating_sub(LOG_FRAMES_START) / frame_size as u64;

        let mut buf = vec![0u8; frame_size];
        let mut regions: Vec<Region> = Vec::new();
        let mut committed: Option<Committed> = None;
        let mut page1 = None;
        let mut hwm = 0u32;
        let mut frame = log.recover_frame;
        let mut seq = log.recover_seq;
        let mut prev = log.recover_cksum;
        let mut walked = 0u64;
        while frame != 0 && u64::from(frame) <= max_frames && walked < max_frames {
            wal.read_at(self.frame_offset(frame), &mut buf)?;
            let (head, page) = buf.split_at(FRAME_HEADER_LEN);
            if !FrameHeader::verify(head, prev, page) {
                break;
            }
            let fh = FrameHeader::decode(head);
            let extends = matches!(regions.last(), Some(r) if r.last + 1 == frame);
            if extends {
                if let Some(r) = regions.last_mut() {
                    r.last = frame;
                }
            } else if regions.len() < 3 {
                regions.push(Region::starting_at(frame, seq));
            } else {
                break;
            }
            index.insert(0, frame, fh.pgno)?;
            hwm = hwm.max(frame);
            if fh.pgno == 1 {
                page1 = Some(frame);
            }
            prev = fh.cksum;
            if fh.is_commit() {
                committed = Some(Committed {
                    regions: regions.clone(),
                    last_seq: seq,
                    cksum: prev,
                    next: fh.next,
                    n_page: fh.commit_pages,
                    page1,
                });
            }
            seq += 1;
            walked += 1;
            frame = fh.next;
        }

        let mut hdr = WalHeader::fresh(log.page_size, &log);
        hdr.change = if first { 0 } else { rand::random() };
        hdr.hwm = hwm;
        if let Some(c) = &committed {
            for (slot, r) in hdr.regions.iter_mut().zip(&c.regions) {
                *slot = *r;
            }
            hdr.last_seq = c.last_seq;
            hdr.last_cksum = c.cksum;
            hdr.next_frame = c.next;
            hdr.n_page = c.n_page;
        }
        let page1 = committed.as_ref().and_then(|c| c.page1);
        match page1 {
            Some(frame) => wal.read_at(
                self.frame_offset(frame) + FRAME_HEADER_LEN as u64,
                &mut hdr.db_header,
            )?,
            None => shared.db().read_zeroed(0, &mut hdr.db_header[..DB_HEADER_BYTES])?,
        }

        let keep_record = !first && self.load_checkpoint().is_ok();
        if !keep_record {
            self.store_checkpoint(&CheckpointRecord {
                first_read: log.recover_seq,
                recover_frame: log.recover_frame,
                recover_seq: log.recover_seq,
                recover_cksum: log.recover_cksum,
                merges: 0,
                checkpoints: 0,
            })?;
        }
        if first {
            shared.clear_reader_table()?;
        }
        self.publish(&hdr)?;
        self.stats.recoveries += 1;
        info!(
            frames = hdr.last_seq + 1 - log.recover_seq,
            walked,
            regions = hdr.live_count(),
            next = hdr.next_frame,
            "wal.recover.done"
        );
        Ok(())
    }
}
