#![forbid(unsafe_code)]
//! Write-ahead log with a shared-memory frame index.
//!
//! Committed page images are appended to the `-wal` file as checksummed
//! frames. Frames are addressed physically (1-based) and ordered logically by
//! a 64-bit sequence number. The live part of the log is described by at most
//! three physically contiguous regions, which lets a writer restart at frame 1
//! while older frames are still waiting for a checkpoint.
//!
//! Shared-memory layout:
//!
//! | offset | content |
//! |--------|---------|
//! | 0      | [`WalHeader`] copy A |
//! | 192    | [`WalHeader`] copy B |
//! | 384    | [`CheckpointRecord`] |
//! | 1024   | reader table |
//! | chunk 1.. | hash index segments, two sides each |

mod checkpoint;
mod format;
mod index;
mod recovery;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::primitives::concurrency::{LockSlot, Locker, ReaderRange, SharedFile, Shm};
use crate::primitives::io::{FileIo, LockMode};
use crate::types::checksum::Rolling;
use crate::types::{BtError, PageNo, Result};

pub use checkpoint::{CheckpointHook, CheckpointStats, NoMerge};
pub use format::{
    CheckpointRecord, FrameHeader, LogHeader, Region, WalHeader, CHECKPOINT_RECORD_LEN,
    DB_HEADER_BYTES, FRAME_HEADER_LEN, LOG_FRAMES_START, LOG_SECTOR, WAL_HEADER_LEN,
};
pub use index::{Index, SEGMENT_FRAMES};

const SHM_HEADER_A: usize = 0;
const SHM_HEADER_B: usize = WAL_HEADER_LEN;
const SHM_CHECKPOINT: usize = 2 * WAL_HEADER_LEN;

/// A commit that would restart the log at frame 1 needs at least this many
/// free frames in front of the surviving region.
pub const WRAP_MIN_FRAMES: u32 = 32;

const SNAPSHOT_ATTEMPTS: u32 = 100;
const HEADER_READ_ATTEMPTS: u32 = 16;

/// Durability level for commits and checkpoints.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum Safety {
    /// Never sync.
    Off,
    /// Sync the log before checkpoints and the database after them.
    #[default]
    Normal,
    /// Additionally sync the log on every commit.
    Full,
}

impl Safety {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Safety::Off => "off",
            Safety::Normal => "normal",
            Safety::Full => "full",
        }
    }
}

impl fmt::Display for Safety {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Safety {
    type Err = BtError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "off" => Ok(Safety::Off),
            "normal" => Ok(Safety::Normal),
            "full" => Ok(Safety::Full),
            _ => Err(BtError::Misuse("unknown safety level")),
        }
    }
}

/// Log counters for this connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WalStats {
    /// Frames appended.
    pub frames_written: u64,
    /// Commits published.
    pub commits: u64,
    /// Checkpoints that copied at least one frame.
    pub checkpoints: u64,
    /// Frames copied into the database file.
    pub frames_copied: u64,
    /// Times a writer restarted the log at frame 1.
    pub wraps: u64,
    /// Recoveries run by this connection.
    pub recoveries: u64,
}

/// Database size and header bytes a commit publishes.
#[derive(Clone, Copy, Debug)]
pub struct CommitInfo<'a> {
    /// Database size in pages after the commit.
    pub n_page: u32,
    /// Encoded database header, as stored at the start of page 1.
    pub db_header: &'a [u8; DB_HEADER_BYTES],
}

#[derive(Clone, Debug)]
struct Snapshot {
    hdr: WalHeader,
    /// First sequence number this snapshot may read from the log.
    first: u64,
    slot: LockSlot,
}

/// One connection's view of the log.
pub struct Wal {
    shared: Arc<SharedFile>,
    locker: Locker,
    page_size: usize,
    safety: Safety,
    snapshot: Option<Snapshot>,
    writing: bool,
    stats: WalStats,
}

impl Wal {
    /// Connects to the log of `shared`, running recovery when this is the
    /// first connection. `page_size` is used only when the log is new.
    pub fn connect(shared: Arc<SharedFile>, page_size: usize, safety: Safety) -> Result<Wal> {
        let mut wal = Wal {
            locker: Locker::new(Arc::clone(&shared)),
            shared,
            page_size,
            safety,
            snapshot: None,
            writing: false,
            stats: WalStats::default(),
        };
        wal.locker.lock(LockSlot::Discover1, LockMode::Exclusive, true)?;
        let joined = wal.join(page_size);
        wal.locker.unlock(LockSlot::Discover1)?;
        joined?;
        Ok(wal)
    }

    fn join(&mut self, page_size: usize) -> Result<()> {
        if self.locker.lock(LockSlot::Discover2, LockMode::Exclusive, false)? {
            let recovered = self.recover(page_size, true);
            self.locker.unlock(LockSlot::Discover2)?;
            recovered?;
        }
        self.locker.lock(LockSlot::Discover2, LockMode::Shared, true)?;
        match self.load_header()? {
            Some(hdr) => self.page_size = hdr.page_size as usize,
            None => self.recover_in_session()?,
        }
        Ok(())
    }

    /// Page size of every frame.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Sets the durability level.
    pub fn set_safety(&mut self, safety: Safety) {
        self.safety = safety;
    }

    /// Current durability level.
    pub fn safety(&self) -> Safety {
        self.safety
    }

    /// Counters for this connection.
    pub fn stats(&self) -> WalStats {
        self.stats
    }

    /// Shared state this log belongs to.
    pub fn shared(&self) -> &Arc<SharedFile> {
        &self.shared
    }

    /// Lock coordinator for this connection.
    pub fn locker(&mut self) -> &mut Locker {
        &mut self.locker
    }

    fn shm(&self) -> &Shm {
        self.shared.shm()
    }

    fn frame_size(&self) -> usize {
        FRAME_HEADER_LEN + self.page_size
    }

    fn frame_offset(&self, frame: u32) -> u64 {
        LOG_FRAMES_START + u64::from(frame - 1) * self.frame_size() as u64
    }

    /// Reads the published header, preferring copy A.
    fn load_header(&self) -> Result<Option<WalHeader>> {
        let mut buf = [0u8; 2 * WAL_HEADER_LEN];
        for attempt in 0..HEADER_READ_ATTEMPTS {
            self.shm().read(SHM_HEADER_A, &mut buf)?;
            if let Some(a) = WalHeader::decode(&buf[..WAL_HEADER_LEN]) {
                return Ok(Some(a));
            }
            if let Some(b) = WalHeader::decode(&buf[WAL_HEADER_LEN..]) {
                return Ok(Some(b));
            }
            trace!(attempt, "wal.header.torn");
            std::thread::yield_now();
        }
        Ok(None)
    }

    fn publish(&self, hdr: &WalHeader) -> Result<()> {
        let enc = hdr.encode();
        self.shm().write(SHM_HEADER_A, &enc)?;
        self.shm().write(SHM_HEADER_B, &enc)
    }

    fn load_checkpoint(&self) -> Result<CheckpointRecord> {
        let mut buf = [0u8; CHECKPOINT_RECORD_LEN];
        for _ in 0..HEADER_READ_ATTEMPTS {
            self.shm().read(SHM_CHECKPOINT, &mut buf)?;
            if let Some(rec) = CheckpointRecord::decode(&buf) {
                return Ok(rec);
            }
            std::thread::yield_now();
        }
        Err(BtError::Corruption("checkpoint record"))
    }

    fn store_checkpoint(&self, rec: &CheckpointRecord) -> Result<()> {
        self.shm().write(SHM_CHECKPOINT, &rec.encode())
    }

    fn sync_log(&self) -> Result<()> {
        if self.safety == Safety::Off {
            return Ok(());
        }
        self.shared.wal().sync_all()
    }

    /// Header of the newest commit, recovering it if both shared copies are torn.
    fn current_header(&mut self) -> Result<WalHeader> {
        if let Some(hdr) = self.load_header()? {
            return Ok(hdr);
        }
        warn!("wal.header.invalid");
        self.recover_in_session()?;
        self.load_header()?
            .ok_or(BtError::Corruption("wal index header"))
    }

    /// Opens a read snapshot.
    pub fn begin_read(&mut self) -> Result<()> {
        if self.snapshot.is_some() {
            return Err(BtError::Misuse("read snapshot already open"));
        }
        for _ in 0..SNAPSHOT_ATTEMPTS {
            let hdr = self.current_header()?;
            let ckpt = self.load_checkpoint()?;
            let range = (ckpt.first_read <= hdr.last_seq).then_some(ReaderRange {
                first: ckpt.first_read,
                last: hdr.last_seq,
            });
            let slot = self.locker.acquire_reader(range)?;
            if self.load_header()?.map(|h| h.change) == Some(hdr.change) {
                let first = range.map_or(hdr.last_seq + 1, |r| r.first);
                trace!(change = hdr.change, first, last = hdr.last_seq, "wal.begin_read");
                self.snapshot = Some(Snapshot { hdr, first, slot });
                return Ok(());
            }
            self.locker.unlock(slot)?;
        }
        Err(BtError::Busy)
    }

    /// Closes the read snapshot.
    pub fn end_read(&mut self) -> Result<()> {
        if self.writing {
            return Err(BtError::Misuse("end_read while writing"));
        }
        if let Some(snap) = self.snapshot.take() {
            self.locker.unlock(snap.slot)?;
        }
        Ok(())
    }

    /// True while a read snapshot is open.
    pub fn in_read(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Header of the open snapshot.
    pub fn header(&self) -> Option<&WalHeader> {
        self.snapshot.as_ref().map(|s| &s.hdr)
    }

    /// Upgrades the open snapshot to a write snapshot.
    pub fn begin_write(&mut self) -> Result<()> {
        let change = match &self.snapshot {
            Some(snap) => snap.hdr.change,
            None => return Err(BtError::Misuse("begin_write without a read snapshot")),
        };
        if self.writing {
            return Ok(());
        }
        if !self.locker.lock(LockSlot::Writer, LockMode::Exclusive, false)? {
            return Err(BtError::Busy);
        }
        if self.load_header()?.map(|h| h.change) != Some(change) {
            self.locker.unlock(LockSlot::Writer)?;
            return Err(BtError::BusySnapshot);
        }
        self.writing = true;
        Ok(())
    }

    /// Drops the writer lock, keeping the read snapshot.
    pub fn end_write(&mut self) -> Result<()> {
        if self.writing {
            self.writing = false;
            self.locker.unlock(LockSlot::Writer)?;
        }
        Ok(())
    }

    /// True while this connection holds the writer lock.
    pub fn in_write(&self) -> bool {
        self.writing
    }

    /// Newest frame at or below sequence `hi` holding `pgno`, with its sequence number.
    fn find_frame(&self, hdr: &WalHeader, pgno: PageNo, lo: u64, hi: u64) -> Result<Option<(u32, u64)>> {
        let index = Index::new(self.shm());
        for region in hdr.live().rev() {
            let Some((lo_f, hi_f)) = region.clip(lo, hi) else {
                continue;
            };
            if let Some(frame) = index.lookup(hdr.side, pgno.0, lo_f, hi_f)? {
                let seq = region.seq + u64::from(frame - region.first);
                return Ok(Some((frame, seq)));
            }
        }
        Ok(None)
    }

    fn read_frame_page(&self, frame: u32, dst: &mut [u8]) -> Result<()> {
        self.shared
            .wal()
            .read_at(self.frame_offset(frame) + FRAME_HEADER_LEN as u64, dst)
    }

    /// Copies the snapshot's image of `pgno` into `dst` if the log holds it.
    /// Returns `false` when the database file is current for that page.
    pub fn read_page(&self, pgno: PageNo, dst: &mut [u8]) -> Result<bool> {
        let snap = self
            .snapshot
            .as_ref()
            .ok_or(BtError::Misuse("read_page without a snapshot"))?;
        if snap.first > snap.hdr.last_seq {
            return Ok(false);
        }
        let Some((frame, seq)) = self.find_frame(&snap.hdr, pgno, snap.first, snap.hdr.last_seq)? else {
            return Ok(false);
        };
        if seq < self.load_checkpoint()?.first_read {
            return Ok(false);
        }
        self.read_frame_page(frame, dst)?;
        Ok(true)
    }

    /// Number of merge steps checkpoints have applied to the database file.
    pub fn merges(&self) -> Result<u32> {
        Ok(self.load_checkpoint()?.merges)
    }

    /// Committed frames not yet copied into the database file.
    pub fn frames_since_checkpoint(&self) -> Result<u64> {
        let Some(hdr) = self.load_header()? else {
            return Ok(0);
        };
        let ckpt = self.load_checkpoint()?;
        Ok((hdr.last_seq + 1).saturating_sub(ckpt.first_read))
    }

    /// Appends `pages` as one transaction and publishes it. The last frame
    /// written carries the commit marker.
    pub fn write_frames(&mut self, pages: &[(PageNo, &[u8])], commit: CommitInfo<'_>) -> Result<()> {
        if !self.writing {
            return Err(BtError::Misuse("write_frames without the writer lock"));
        }
        let published = match &self.snapshot {
            Some(snap) => snap.hdr.clone(),
            None => return Err(BtError::Misuse("write_frames without a snapshot")),
        };
        if pages.iter().any(|(_, data)| data.len() != self.page_size) {
            return Err(BtError::Misuse("page image has the wrong size"));
        }
        let mut hdr = published.clone();
        let ckpt = self.load_checkpoint()?;
        let scan = self.locker.query_readers()?;
        let needed = scan.min_first.map_or(ckpt.first_read, |m| m.min(ckpt.first_read));
        trim_regions(&mut hdr, needed);

        let page1 = self.forced_page1(&hdr, pages, &commit)?;
        let mut list: Vec<(PageNo, &[u8])> = pages.to_vec();
        if let Some(buf) = page1.as_deref() {
            let at = list.len().saturating_sub(1);
            list.insert(at, (PageNo::HEADER, buf));
        }
        if list.is_empty() {
            return Ok(());
        }

        if hdr.next_frame == 1 && hdr.hwm > 0 {
            self.switch_sides(&mut hdr)?;
        }
        let first_frame = hdr.next_frame;
        let mut written = self.append(&mut hdr, &list, &commit);
        if written.is_ok() && self.safety == Safety::Full {
            written = self.shared.wal().sync_all();
        }
        if let Err(err) = written {
            if hdr.side == published.side {
                self.purge_uncommitted(&published, first_frame, hdr.hwm)?;
            }
            return Err(err);
        }
        hdr.change = hdr.change.wrapping_add(1);
        hdr.n_page = commit.n_page;
        hdr.db_header = *commit.db_header;
        self.publish(&hdr)?;
        self.stats.commits += 1;
        debug!(
            frames = list.len(),
            last_seq = hdr.last_seq,
            next = hdr.next_frame,
            regions = hdr.live_count(),
            "wal.commit"
        );
        if let Some(snap) = self.snapshot.as_mut() {
            snap.hdr = hdr;
        }
        Ok(())
    }

    /// A fresh page-1 image when the database size changes and page 1 is not
    /// already part of the transaction.
    fn forced_page1(
        &self,
        hdr: &WalHeader,
        pages: &[(PageNo, &[u8])],
        commit: &CommitInfo<'_>,
    ) -> Result<Option<Vec<u8>>> {
        if commit.n_page == hdr.n_page || pages.iter().any(|(p, _)| *p == PageNo::HEADER) {
            return Ok(None);
        }
        let mut buf = vec![0u8; self.page_size];
        if !self.read_page(PageNo::HEADER, &mut buf)? {
            self.shared.db().read_zeroed(0, &mut buf)?;
        }
        buf[..DB_HEADER_BYTES].copy_from_slice(commit.db_header);
        Ok(Some(buf))
    }

    fn append(&mut self, hdr: &mut WalHeader, list: &[(PageNo, &[u8])], commit: &CommitInfo<'_>) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let index = Index::new(shared.shm());
        let wal = shared.wal();
        let mut frame = hdr.next_frame;
        let mut seq = hdr.last_seq + 1;
        let mut prev = hdr.last_cksum;
        let mut buf = vec![0u8; self.frame_size()];
        for (i, (pgno, data)) in list.iter().enumerate() {
            place_frame(hdr, frame, seq)?;
            let is_commit = i + 1 == list.len();
            let next = if is_commit {
                commit_next(hdr, frame)
            } else {
                next_after(hdr, frame)
            };
            let pages = if is_commit { commit.n_page } else { 0 };
            let (fh, enc) = FrameHeader::seal(pgno.0, next, pages, prev, data);
            buf[..FRAME_HEADER_LEN].copy_from_slice(&enc);
            buf[FRAME_HEADER_LEN..].copy_from_slice(data);
            wal.write_at(self.frame_offset(frame), &buf)?;
            index.insert(hdr.side, frame, pgno.0)?;
            hdr.hwm = hdr.hwm.max(frame);
            self.stats.frames_written += 1;
            prev = fh.cksum;
            seq += 1;
            frame = next;
        }
        hdr.last_seq = seq - 1;
        hdr.last_cksum = prev;
        hdr.next_frame = frame;
        Ok(())
    }

    /// Rebuilds the unused index side from the live frames and switches to it.
    fn switch_sides(&mut self, hdr: &mut WalHeader) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let index = Index::new(shared.shm());
        let side = hdr.side ^ 1;
        index.clear_side(side, hdr.hwm)?;
        for region in hdr.live() {
            for frame in region.first..=region.last {
                index.insert(side, frame, index.pgno(hdr.side, frame)?)?;
            }
        }
        hdr.side = side;
        hdr.hwm = hdr.live().map(|r| r.last).max().unwrap_or(0);
        self.stats.wraps += 1;
        debug!(side, live = hdr.live_count(), "wal.wrap");
        Ok(())
    }

    /// Drops index entries for frames a failed transaction wrote.
    fn purge_uncommitted(&self, published: &WalHeader, first: u32, hwm: u32) -> Result<()> {
        let index = Index::new(self.shm());
        let last = hwm.max(first);
        for segment in Index::segment(first)..=Index::segment(last) {
            index.rebuild_segment(published.side, segment, |f| published.seq_of(f).is_some())?;
        }
        warn!(first, "wal.write.purged");
        Ok(())
    }

    /// Releases this connection. Returns `true` when it was the last one and
    /// the log was fully checkpointed, in which case the log has been emptied.
    pub fn disconnect(mut self, hook: &mut dyn CheckpointHook, checkpoint_on_close: bool) -> Result<bool> {
        self.writing = false;
        self.locker.unlock(LockSlot::Writer)?;
        self.end_read()?;
        self.locker.lock(LockSlot::Discover1, LockMode::Exclusive, true)?;
        self.locker.unlock(LockSlot::Discover2)?;
        if !self.locker.lock(LockSlot::Discover2, LockMode::Exclusive, false)? {
            return Ok(false);
        }
        if checkpoint_on_close {
            self.checkpoint(0, hook)?;
        }
        if self.frames_since_checkpoint()? > 0 {
            return Ok(false);
        }
        self.shared.wal().truncate(0)?;
        self.sync_log()?;
        self.shm().reset()?;
        debug!(path = %self.shared.path().display(), "wal.disconnect.last");
        Ok(true)
    }
}

/// Forgets regions whose frames are all older than `needed`.
fn trim_regions(hdr: &mut WalHeader, needed: u64) {
    for region in hdr.regions.iter_mut() {
        if !region.is_empty() && region.last_seq() < needed {
            *region = Region::default();
        }
    }
    hdr.compact_regions();
}

/// Adds `frame` with sequence `seq` to the newest region or opens a new one.
fn place_frame(hdr: &mut WalHeader, frame: u32, seq: u64) -> Result<()> {
    let count = hdr.live_count();
    if count > 0 {
        let newest = &mut hdr.regions[count - 1];
        if newest.last + 1 == frame && newest.last_seq() + 1 == seq {
            newest.last = frame;
            return Ok(());
        }
    }
    if count == hdr.regions.len() {
        return Err(BtError::Corruption("wal regions exhausted"));
    }
    hdr.regions[count] = Region::starting_at(frame, seq);
    Ok(())
}

/// Frame following `frame`, jumping over live regions in the way.
fn next_after(hdr: &WalHeader, frame: u32) -> u32 {
    let mut next = frame + 1;
    while let Some(region) = hdr.live().find(|r| r.first == next) {
        next = region.last + 1;
    }
    next
}

/// Where the transaction after a commit at `frame` starts.
fn commit_next(hdr: &WalHeader, frame: u32) -> u32 {
    if hdr.live_count() == 1 {
        if let Some(only) = hdr.newest() {
            if only.first > 1 && only.first - 1 >= WRAP_MIN_FRAMES {
                return 1;
            }
        }
    }
    next_after(hdr, frame)
}

/// Rolling checksum value for an empty log.
fn fresh_seed() -> Rolling {
    Rolling([rand::random(), rand::random()])
}
