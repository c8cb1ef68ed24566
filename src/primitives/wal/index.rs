//! Paged hash index mapping page numbers to log frames.
//!
//! Segment `g` covers physical frames `g * SEGMENT_FRAMES + 1 ..= (g + 1) * SEGMENT_FRAMES`
//! and occupies one shared-memory chunk per side: a page-number array followed
//! by an open-addressed table of frame offsets. Entries are never deleted
//! in place; a lookup confirms every hit against the page-number array, so
//! entries left behind by reused frames simply fail to match. A writer that
//! restarts the log at frame 1 rebuilds the other side from the live frames
//! and switches sides when it publishes.

use crate::primitives::concurrency::{Shm, SHM_CHUNK};
use crate::types::{BtError, Result};

/// Frames covered by one segment.
pub const SEGMENT_FRAMES: u32 = 4096;
const HASH_SLOTS: u32 = SEGMENT_FRAMES * 2;
const PGNO_ARRAY_LEN: usize = SEGMENT_FRAMES as usize * 4;

const _: () = assert!(PGNO_ARRAY_LEN + HASH_SLOTS as usize * 4 == SHM_CHUNK);

fn segment_of(frame: u32) -> u32 {
    (frame - 1) / SEGMENT_FRAMES
}

fn chunk_base(segment: u32, side: u32) -> usize {
    (1 + segment as usize * 2 + side as usize) * SHM_CHUNK
}

fn hash_key(pgno: u32) -> u32 {
    pgno.wrapping_mul(383) % HASH_SLOTS
}

/// Index operations over one shared-memory region.
pub struct Index<'a> {
    shm: &'a Shm,
}

impl<'a> Index<'a> {
    /// Wraps `shm`.
    pub fn new(shm: &'a Shm) -> Self {
        Self { shm }
    }

    /// Page number recorded for `frame` on `side`.
    pub fn pgno(&self, side: u32, frame: u32) -> Result<u32> {
        let seg = segment_of(frame);
        let idx = (frame - 1) % SEGMENT_FRAMES;
        self.shm.read_u32(chunk_base(seg, side) + idx as usize * 4)
    }

    /// Records that `frame` holds `pgno`.
    pub fn insert(&self, side: u32, frame: u32, pgno: u32) -> Result<()> {
        let seg = segment_of(frame);
        let base = chunk_base(seg, side);
        let idx = (frame - 1) % SEGMENT_FRAMES;
        self.shm.write_u32(base + idx as usize * 4, pgno)?;
        let mut slot = hash_key(pgno);
        for _ in 0..HASH_SLOTS {
            let off = base + PGNO_ARRAY_LEN + slot as usize * 4;
            let v = self.shm.read_u32(off)?;
            if v == 0 || v == idx + 1 {
                return self.shm.write_u32(off, idx + 1);
            }
            slot = (slot + 1) % HASH_SLOTS;
        }
        Err(BtError::Corruption("wal hash segment full"))
    }

    /// Newest frame in `[lo, hi]` holding `pgno` on `side`.
    pub fn lookup(&self, side: u32, pgno: u32, lo: u32, hi: u32) -> Result<Option<u32>> {
        if lo > hi || lo == 0 {
            return Ok(None);
        }
        let mut seg = segment_of(hi) as i64;
        let first_seg = segment_of(lo) as i64;
        while seg >= first_seg {
            let base = chunk_base(seg as u32, side);
            let seg_first = seg as u32 * SEGMENT_FRAMES + 1;
            let mut best: Option<u32> = None;
            let mut slot = hash_key(pgno);
            for _ in 0..HASH_SLOTS {
                let v = self.shm.read_u32(base + PGNO_ARRAY_LEN + slot as usize * 4)?;
                if v == 0 {
                    break;
                }
                let frame = seg_first + (v - 1);
                if frame >= lo && frame <= hi && best.map_or(true, |b| frame > b) {
                    let recorded = self.shm.read_u32(base + (v as usize - 1) * 4)?;
                    if recorded == pgno {
                        best = Some(frame);
                    }
                }
                slot = (slot + 1) % HASH_SLOTS;
            }
            if best.is_some() {
                return Ok(best);
            }
            seg -= 1;
        }
        Ok(None)
    }

    /// Zeroes every segment of `side` up to and including the one holding `hwm`.
    pub fn clear_side(&self, side: u32, hwm: u32) -> Result<()> {
        if hwm == 0 {
            return Ok(());
        }
        for seg in 0..=segment_of(hwm) {
            self.shm.zero(chunk_base(seg, side), SHM_CHUNK)?;
        }
        Ok(())
    }

    /// Rebuilds the hash table of one segment from its page-number array,
    /// keeping only frames accepted by `keep`.
    pub fn rebuild_segment(&self, side: u32, segment: u32, keep: impl Fn(u32) -> bool) -> Result<()> {
        let base = chunk_base(segment, side);
        self.shm.zero(base + PGNO_ARRAY_LEN, HASH_SLOTS as usize * 4)?;
        for idx in 0..SEGMENT_FRAMES {
            let frame = segment * SEGMENT_FRAMES + idx + 1;
            if !keep(frame) {
                continue;
            }
            let pgno = self.shm.read_u32(base + idx as usize * 4)?;
            if pgno != 0 {
                self.insert(side, frame, pgno)?;
            }
        }
        Ok(())
    }

    /// Segment index of `frame`.
    pub fn segment(frame: u32) -> u32 {
        segment_of(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_returns_newest_matching_frame() -> Result<()> {
        let shm = Shm::heap();
        let idx = Index::new(&shm);
        idx.insert(0, 1, 7)?;
        idx.insert(0, 2, 8)?;
        idx.insert(0, 3, 7)?;
        assert_eq!(idx.lookup(0, 7, 1, 3)?, Some(3));
        assert_eq!(idx.lookup(0, 7, 1, 2)?, Some(1));
        assert_eq!(idx.lookup(0, 9, 1, 3)?, None);
        assert_eq!(idx.lookup(1, 7, 1, 3)?, None, "other side is independent");
        Ok(())
    }

    #[test]
    fn reused_frames_shadow_stale_entries() -> Result<()> {
        let shm = Shm::heap();
        let idx = Index::new(&shm);
        idx.insert(0, 5, 11)?;
        idx.insert(0, 5, 12)?;
        assert_eq!(idx.lookup(0, 11, 1, 10)?, None);
        assert_eq!(idx.lookup(0, 12, 1, 10)?, Some(5));
        Ok(())
    }

    #[test]
    fn lookups_span_segments() -> Result<()> {
        let shm = Shm::heap();
        let idx = Index::new(&shm);
        let far = SEGMENT_FRAMES + 10;
        idx.insert(0, 2, 3)?;
        idx.insert(0, far, 3)?;
        assert_eq!(idx.lookup(0, 3, 1, far)?, Some(far));
        assert_eq!(idx.lookup(0, 3, 1, far - 1)?, Some(2));
        idx.rebuild_segment(0, 1, |_| false)?;
        assert_eq!(idx.lookup(0, 3, 1, far)?, Some(2));
        Ok(())
    }
}
