//! On-disk and shared-memory record layouts used by the log.

use crate::primitives::bytes::buf::{Reader, Writer};
use crate::primitives::bytes::ord;
use crate::types::checksum::{seal_record, verify_record, Rolling};
use crate::types::{BtError, Result};

/// Magic bytes at the start of each log header.
pub const LOG_MAGIC: [u8; 4] = *b"BTWL";
/// Log format version.
pub const LOG_VERSION: u32 = 1;
/// Each log header owns one sector at the head of the file.
pub const LOG_SECTOR: u64 = 512;
/// Frames start after the two header sectors.
pub const LOG_FRAMES_START: u64 = 2 * LOG_SECTOR;
/// Encoded log header length, including the trailing CRC.
pub const LOG_HEADER_LEN: usize = 44;
/// Frame header length.
pub const FRAME_HEADER_LEN: usize = 24;
/// Bytes of frame header covered by the rolling checksum.
pub const FRAME_CHECKED_LEN: usize = 16;
/// Bytes at the start of page 1 that hold the database header. The log
/// caches them in shared memory and treats them as opaque.
pub const DB_HEADER_BYTES: usize = 96;

/// Redundant header stored twice at the head of the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogHeader {
    /// Generation counter cycling 0, 1, 2; the newer of two valid headers is
    /// the one whose generation follows the other's.
    pub generation: u32,
    /// Page size of every frame.
    pub page_size: u32,
    /// First frame recovery reads.
    pub recover_frame: u32,
    /// Sequence number of `recover_frame`.
    pub recover_seq: u64,
    /// Checksum chain value preceding `recover_frame`.
    pub recover_cksum: Rolling,
}

impl LogHeader {
    /// Encodes into a fixed-size record with trailing CRC.
    pub fn encode(&self) -> [u8; LOG_HEADER_LEN] {
        let mut w = Writer::with_capacity(LOG_HEADER_LEN);
        w.bytes(&LOG_MAGIC)
            .u32(LOG_VERSION)
            .u32(self.page_size)
            .u32(self.generation)
            .u32(self.recover_frame)
            .u64(self.recover_seq)
            .bytes(&self.recover_cksum.to_bytes())
            .pad_to(LOG_HEADER_LEN);
        let mut out = [0u8; LOG_HEADER_LEN];
        out.copy_from_slice(&w.finish());
        seal_record(&mut out);
        out
    }

    /// Decodes a header. `None` when the record fails validation.
    pub fn decode(src: &[u8]) -> Option<LogHeader> {
        let rec = src.get(..LOG_HEADER_LEN)?;
        if !verify_record(rec) || rec[..4] != LOG_MAGIC {
            return None;
        }
        let mut r = Reader::new(&rec[4..], "log header");
        let version = r.u32().ok()?;
        if version != LOG_VERSION {
            return None;
        }
        let page_size = r.u32().ok()?;
        let generation = r.u32().ok()?;
        let recover_frame = r.u32().ok()?;
        let recover_seq = r.u64().ok()?;
        let recover_cksum = Rolling::from_bytes(r.take(8).ok()?);
        if generation > 2 || recover_frame == 0 {
            return None;
        }
        Some(LogHeader {
            generation,
            page_size,
            recover_frame,
            recover_seq,
            recover_cksum,
        })
    }

    /// Picks the newest of two possibly-invalid headers and its slot index.
    pub fn newest(a: Option<LogHeader>, b: Option<LogHeader>) -> Option<(usize, LogHeader)> {
        match (a, b) {
            (Some(a), Some(b)) => {
                if (a.generation + 1) % 3 == b.generation {
                    Some((1, b))
                } else {
                    Some((0, a))
                }
            }
            (Some(a), None) => Some((0, a)),
            (None, Some(b)) => Some((1, b)),
            (None, None) => None,
        }
    }
}

/// Per-frame header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    /// Page this frame holds an image of.
    pub pgno: u32,
    /// Physical frame that follows this one in log order.
    pub next: u32,
    /// Database size in pages after the commit; zero on non-commit frames.
    pub commit_pages: u32,
    /// Rolling checksum through this frame.
    pub cksum: Rolling,
}

impl FrameHeader {
    /// Computes the chained checksum and returns the encoded header.
    pub fn seal(
        pgno: u32,
        next: u32,
        commit_pages: u32,
        prev: Rolling,
        page: &[u8],
    ) -> (FrameHeader, [u8; FRAME_HEADER_LEN]) {
        let mut out = [0u8; FRAME_HEADER_LEN];
        ord::put_u32(&mut out, 0, pgno);
        ord::put_u32(&mut out, 4, next);
        ord::put_u32(&mut out, 8, commit_pages);
        let cksum = prev.extend(&out[..FRAME_CHECKED_LEN]).extend(page);
        out[FRAME_CHECKED_LEN..].copy_from_slice(&cksum.to_bytes());
        (
            FrameHeader {
                pgno,
                next,
                commit_pages,
                cksum,
            },
            out,
        )
    }

    /// Decodes a header without validating it.
    pub fn decode(src: &[u8]) -> FrameHeader {
        FrameHeader {
            pgno: ord::get_u32(src, 0),
            next: ord::get_u32(src, 4),
            commit_pages: ord::get_u32(src, 8),
            cksum: Rolling::from_bytes(&src[FRAME_CHECKED_LEN..FRAME_HEADER_LEN]),
        }
    }

    /// True when the stored checksum continues `prev` over this header and `page`.
    pub fn verify(src: &[u8], prev: Rolling, page: &[u8]) -> bool {
        let hdr = FrameHeader::decode(src);
        let expect = prev.extend(&src[..FRAME_CHECKED_LEN]).extend(page);
        hdr.pgno != 0 && hdr.cksum == expect
    }

    /// True on commit frames.
    pub fn is_commit(&self) -> bool {
        self.commit_pages != 0
    }
}

/// A run of physically contiguous frames. `seq` numbers the first one;
/// sequence numbers grow by one per frame in log order.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct Region {
    /// First physical frame; zero when the region is unused.
    pub first: u32,
    /// Last physical frame, inclusive.
    pub last: u32,
    /// Sequence number of `first`.
    pub seq: u64,
}

impl Region {
    /// Region holding the single frame `frame`.
    pub fn starting_at(frame: u32, seq: u64) -> Region {
        Region {
            first: frame,
            last: frame,
            seq,
        }
    }

    /// True for an unused region slot.
    pub fn is_empty(&self) -> bool {
        self.first == 0
    }

    /// Sequence number of the last frame.
    pub fn last_seq(&self) -> u64 {
        self.seq + u64::from(self.last - self.first)
    }

    /// Physical frame holding sequence number `seq`, if inside this region.
    pub fn frame_of(&self, seq: u64) -> Option<u32> {
        if self.is_empty() || seq < self.seq || seq > self.last_seq() {
            return None;
        }
        Some(self.first + (seq - self.seq) as u32)
    }

    /// Sequence number of physical frame `frame`, if inside this region.
    pub fn seq_of(&self, frame: u32) -> Option<u64> {
        if self.is_empty() || frame < self.first || frame > self.last {
            return None;
        }
        Some(self.seq + u64::from(frame - self.first))
    }

    /// Physical frames whose sequence numbers fall in `[lo, hi]`.
    pub fn clip(&self, lo: u64, hi: u64) -> Option<(u32, u32)> {
        if self.is_empty() {
            return None;
        }
        let lo = lo.max(self.seq);
        let hi = hi.min(self.last_seq());
        if lo > hi {
            return None;
        }
        Some((self.first + (lo - self.seq) as u32, self.first + (hi - self.seq) as u32))
    }
}

/// Snapshot header published in shared memory after every commit.
///
/// Two copies are kept. Writers update copy A then copy B; readers accept a
/// copy only if its CRC validates, preferring A.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalHeader {
    /// Bumped on every publish.
    pub change: u32,
    /// Up to three live regions, oldest first, unused slots last.
    pub regions: [Region; 3],
    /// Frame where the next transaction starts writing.
    pub next_frame: u32,
    /// Sequence number of the last committed frame.
    pub last_seq: u64,
    /// Checksum chain value after the last committed frame.
    pub last_cksum: Rolling,
    /// Hash index side readers of this snapshot use.
    pub side: u32,
    /// Highest physical frame ever indexed since the region was built.
    pub hwm: u32,
    /// Page size.
    pub page_size: u32,
    /// Database size in pages as of the last commit; zero if no commit is logged.
    pub n_page: u32,
    /// Cached copy of the database header bytes from page 1.
    pub db_header: [u8; DB_HEADER_BYTES],
}

/// Encoded length of [`WalHeader`].
pub const WAL_HEADER_LEN: usize = 192;

impl WalHeader {
    /// Empty header for a log starting at `recover_frame`.
    pub fn fresh(page_size: u32, log: &LogHeader) -> WalHeader {
        WalHeader {
            change: 0,
            regions: [Region::default(); 3],
            next_frame: log.recover_frame,
            last_seq: log.recover_seq - 1,
            last_cksum: log.recover_cksum,
            side: 0,
            hwm: 0,
            page_size,
            n_page: 0,
            db_header: [0u8; DB_HEADER_BYTES],
        }
    }

    /// Live regions, oldest first.
    pub fn live(&self) -> impl DoubleEndedIterator<Item = &Region> {
        self.regions.iter().filter(|r| !r.is_empty())
    }

    /// Number of live regions.
    pub fn live_count(&self) -> usize {
        self.live().count()
    }

    /// Newest live region.
    pub fn newest(&self) -> Option<&Region> {
        self.live().next_back()
    }

    /// Sequence number of the region holding `frame`.
    pub fn seq_of(&self, frame: u32) -> Option<u64> {
        self.live().find_map(|r| r.seq_of(frame))
    }

    /// Packs live regions to the front, preserving order.
    pub fn compact_regions(&mut self) {
        let live: Vec<Region> = self.live().copied().collect();
        self.regions = [Region::default(); 3];
        for (slot, r) in self.regions.iter_mut().zip(live) {
            *slot = r;
        }
    }

    /// Encodes into a fixed-size record with trailing CRC.
    pub fn encode(&self) -> [u8; WAL_HEADER_LEN] {
        let mut w = Writer::with_capacity(WAL_HEADER_LEN);
        w.u32(self.change);
        for r in &self.regions {
            w.u32(r.first).u32(r.last).u64(r.seq);
        }
        w.u32(self.next_frame)
            .u64(self.last_seq)
            .bytes(&self.last_cksum.to_bytes())
            .u32(self.side)
            .u32(self.hwm)
            .u32(self.page_size)
            .u32(self.n_page)
            .bytes(&self.db_header)
            .pad_to(WAL_HEADER_LEN);
        let mut out = [0u8; WAL_HEADER_LEN];
        out.copy_from_slice(&w.finish());
        seal_record(&mut out);
        out
    }

    /// Decodes a header. `None` when the CRC does not validate or the record is empty.
    pub fn decode(src: &[u8]) -> Option<WalHeader> {
        if src.len() < WAL_HEADER_LEN
            || !verify_record(&src[..WAL_HEADER_LEN])
            || src[..WAL_HEADER_LEN].iter().all(|b| *b == 0)
        {
            return None;
        }
        Self::decode_fields(src).ok()
    }

    fn decode_fields(src: &[u8]) -> Result<WalHeader> {
        let mut r = Reader::new(src, "wal index header");
        let change = r.u32()?;
        let mut regions = [Region::default(); 3];
        for region in &mut regions {
            region.first = r.u32()?;
            region.last = r.u32()?;
            region.seq = r.u64()?;
            if !region.is_empty() && region.last < region.first {
                return Err(BtError::Corruption("wal index region reversed"));
            }
        }
        let next_frame = r.u32()?;
        let last_seq = r.u64()?;
        let last_cksum = Rolling::from_bytes(r.take(8)?);
        let side = r.u32()?;
        let hwm = r.u32()?;
        let page_size = r.u32()?;
        let n_page = r.u32()?;
        let mut db_header = [0u8; DB_HEADER_BYTES];
        db_header.copy_from_slice(r.take(DB_HEADER_BYTES)?);
        Ok(WalHeader {
            change,
            regions,
            next_frame,
            last_seq,
            last_cksum,
            side,
            hwm,
            page_size,
            n_page,
            db_header,
        })
    }
}

/// Checkpoint progress, written only by the checkpointer.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct CheckpointRecord {
    /// First sequence number not yet copied into the database file.
    pub first_read: u64,
    /// Frame recovery starts from, mirroring the newest log header.
    pub recover_frame: u32,
    /// Sequence number of `recover_frame`.
    pub recover_seq: u64,
    /// Chain value preceding `recover_frame`.
    pub recover_cksum: Rolling,
    /// Number of merge steps that wrote directly into the database file.
    pub merges: u32,
    /// Completed checkpoints.
    pub checkpoints: u32,
}

/// Encoded length of [`CheckpointRecord`].
pub const CHECKPOINT_RECORD_LEN: usize = 48;

impl CheckpointRecord {
    /// Encodes into a fixed-size record with trailing CRC.
    pub fn encode(&self) -> [u8; CHECKPOINT_RECORD_LEN] {
        let mut w = Writer::with_capacity(CHECKPOINT_RECORD_LEN);
        w.u64(self.first_read)
            .u32(self.recover_frame)
            .u64(self.recover_seq)
            .bytes(&self.recover_cksum.to_bytes())
            .u32(self.merges)
            .u32(self.checkpoints)
            .pad_to(CHECKPOINT_RECORD_LEN);
        let mut out = [0u8; CHECKPOINT_RECORD_LEN];
        out.copy_from_slice(&w.finish());
        seal_record(&mut out);
        out
    }

    /// Decodes a record. `None` when the CRC does not validate.
    pub fn decode(src: &[u8]) -> Option<CheckpointRecord> {
        if src.len() < CHECKPOINT_RECORD_LEN || !verify_record(&src[..CHECKPOINT_RECORD_LEN]) {
            return None;
        }
        let mut r = Reader::new(src, "checkpoint record");
        Some(CheckpointRecord {
            first_read: r.u64().ok()?,
            recover_frame: r.u32().ok()?,
            recover_seq: r.u64().ok()?,
            recover_cksum: Rolling::from_bytes(r.take(8).ok()?),
            merges: r.u32().ok()?,
            checkpoints: r.u32().ok()?,
        })
    }
}
