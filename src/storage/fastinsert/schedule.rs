//! The merge schedule record.
//!
//! One record per database, in its own page. An all-zero page is an empty
//! schedule; anything else must carry a valid trailing CRC32. Layout:
//!
//! ```text
//! [state u8][starved u8][age u8][lo u32][hi u32][out_level u32][used u32]
//! [n varint]{level u32, root u32}      input sub-trees, newest first
//! [n varint]{first u32, blocks u32}    output extents as runs of blocks
//! [n varint]{prefix blob, root u32}    finished output sub-trees
//! [resume u8][key blob]?               where the next round starts
//! ... zero padding ... [crc32]
//! ```

use crate::primitives::bytes::buf::{Reader, Writer};
use crate::types::checksum::{seal_record, verify_record};
use crate::types::{BtError, PageNo, Result};

/// Where a schedule is in its life.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScheduleState {
    /// No merge scheduled.
    #[default]
    Empty,
    /// A merge is scheduled or part way through.
    Busy,
    /// The merge finished; its output waits to be integrated.
    Done,
}

impl ScheduleState {
    fn code(self) -> u8 {
        match self {
            ScheduleState::Empty => 0,
            ScheduleState::Busy => 1,
            ScheduleState::Done => 2,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(ScheduleState::Empty),
            1 => Ok(ScheduleState::Busy),
            2 => Ok(ScheduleState::Done),
            _ => Err(BtError::Corruption("schedule state")),
        }
    }
}

/// A run of consecutive blocks allocated to a merge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    /// First page of the first block.
    pub first: PageNo,
    /// Number of consecutive blocks.
    pub blocks: u32,
}

/// Page at position `index` across `extents`, in allocation order.
pub fn extent_page(extents: &[Extent], index: u64, block_pages: u32) -> Option<PageNo> {
    let mut rest = index;
    for extent in extents {
        let pages = u64::from(extent.blocks) * u64::from(block_pages);
        if rest < pages {
            return Some(PageNo(extent.first.0 + rest as u32));
        }
        rest -= pages;
    }
    None
}

/// Merge input: one sub-tree of one level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputTree {
    /// Level the sub-tree belongs to.
    pub level: u32,
    /// Its root.
    pub root: PageNo,
}

/// Finished output sub-tree covering keys from `prefix` on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputTree {
    /// First key of the range.
    pub prefix: Vec<u8>,
    /// Root page inside the extents.
    pub root: PageNo,
}

/// Persistent state of one merge.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Schedule {
    /// Lifecycle state.
    pub state: ScheduleState,
    /// The last round ran out of extent pages.
    pub starved: bool,
    /// Age of the input levels.
    pub age: u8,
    /// Oldest input level.
    pub lo: u32,
    /// Newest input level.
    pub hi: u32,
    /// Level the output is registered as, in age `age + 1`.
    pub out_level: u32,
    /// Input sub-trees, newest level first.
    pub inputs: Vec<InputTree>,
    /// Output space.
    pub extents: Vec<Extent>,
    /// Extent pages consumed so far.
    pub used: u32,
    /// Output sub-trees written so far.
    pub outputs: Vec<OutputTree>,
    /// Key the next round starts at; `None` before the first round.
    pub resume: Option<Vec<u8>>,
}

impl Schedule {
    /// Total pages across all extents.
    pub fn capacity(&self, block_pages: u32) -> u64 {
        self.extents
            .iter()
            .map(|e| u64::from(e.blocks) * u64::from(block_pages))
            .sum()
    }

    /// Page at position `index` across the extents, in allocation order.
    pub fn page_at(&self, index: u64, block_pages: u32) -> Option<PageNo> {
        extent_page(&self.extents, index, block_pages)
    }

    /// First page of every block, in allocation order.
    pub fn blocks(&self, block_pages: u32) -> Vec<PageNo> {
        self.extents
            .iter()
            .flat_map(|e| (0..e.blocks).map(move |i| PageNo(e.first.0 + i * block_pages)))
            .collect()
    }

    /// Appends a block, extending the last run when it is adjacent.
    pub fn add_block(&mut self, first: PageNo, block_pages: u32) {
        if let Some(last) = self.extents.last_mut() {
            if last.first.0 + last.blocks * block_pages == first.0 {
                last.blocks += 1;
                return;
            }
        }
        self.extents.push(Extent { first, blocks: 1 });
    }

    /// Serialises into a page image.
    pub fn encode(&self, page_size: usize) -> Result<Vec<u8>> {
        if self.state == ScheduleState::Empty {
            return Ok(vec![0u8; page_size]);
        }
        let mut w = Writer::with_capacity(page_size);
        w.u8(self.state.code())
            .u8(u8::from(self.starved))
            .u8(self.age)
            .u32(self.lo)
            .u32(self.hi)
            .u32(self.out_level)
            .u32(self.used)
            .varint(self.inputs.len() as u64);
        for input in &self.inputs {
            w.u32(input.level).u32(input.root.0);
        }
        w.varint(self.extents.len() as u64);
        for extent in &self.extents {
            w.u32(extent.first.0).u32(extent.blocks);
        }
        w.varint(self.outputs.len() as u64);
        for output in &self.outputs {
            w.blob(&output.prefix).u32(output.root.0);
        }
        match &self.resume {
            Some(key) => w.u8(1).blob(key),
            None => w.u8(0),
        };
        if w.len() + 4 > page_size {
            return Err(BtError::TooBig);
        }
        w.pad_to(page_size);
        let mut page = w.finish();
        seal_record(&mut page);
        Ok(page)
    }

    /// Parses a page image.
    pub fn decode(page: &[u8]) -> Result<Schedule> {
        if page.iter().all(|&b| b == 0) {
            return Ok(Schedule::default());
        }
        if !verify_record(page) {
            return Err(BtError::Corruption("schedule checksum"));
        }
        let mut r = Reader::new(&page[..page.len() - 4], "schedule record");
        let state = ScheduleState::from_code(r.u8()?)?;
        let starved = r.u8()? != 0;
        let age = r.u8()?;
        let lo = r.u32()?;
        let hi = r.u32()?;
        let out_level = r.u32()?;
        let used = r.u32()?;
        let n = r.len_prefix()?;
        let mut inputs = Vec::with_capacity(n);
        for _ in 0..n {
            inputs.push(InputTree {
                level: r.u32()?,
                root: PageNo(r.u32()?),
            });
        }
        let n = r.len_prefix()?;
        let mut extents = Vec::with_capacity(n);
        for _ in 0..n {
            extents.push(Extent {
                first: PageNo(r.u32()?),
                blocks: r.u32()?,
            });
        }
        let n = r.len_prefix()?;
        let mut outputs = Vec::with_capacity(n);
        for _ in 0..n {
            outputs.push(OutputTree {
                prefix: r.blob()?.to_vec(),
                root: PageNo(r.u32()?),
            });
        }
        let resume = match r.u8()? {
            0 => None,
            _ => Some(r.blob()?.to_vec()),
        };
        Ok(Schedule {
            state,
            starved,
            age,
            lo,
            hi,
            out_level,
            inputs,
            extents,
            used,
            outputs,
            resume,
        })
    }
}
