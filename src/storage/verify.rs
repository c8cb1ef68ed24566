//! Page accounting.
//!
//! Every page of a database belongs to exactly one owner: the header, the
//! schedule page, a tree, a fast-insert block, a merge extent or a free
//! list. The audit walks all owners and reports pages claimed by none or by
//! more than one.

use std::collections::HashMap;
use std::fmt;

use crate::primitives::pager::Pager;
use crate::storage::btree::Tree;
use crate::storage::fastinsert::{load_levels, Schedule};
use crate::types::{PageNo, Result};

const MAX_FINDINGS: usize = 32;

/// Result of [`audit`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PageAudit {
    /// Pages in the file.
    pub n_page: u32,
    /// Pages in use by trees, levels, extents and bookkeeping.
    pub in_use: usize,
    /// Pages on the free lists, free blocks included.
    pub free: usize,
    /// Pages nothing refers to; at most a few are listed.
    pub leaked: Vec<PageNo>,
    /// Pages claimed more than once; at most a few are listed.
    pub doubled: Vec<PageNo>,
    /// Count of leaked pages.
    pub leaked_count: usize,
}

impl PageAudit {
    /// True when every page has exactly one owner.
    pub fn is_clean(&self) -> bool {
        self.leaked_count == 0 && self.doubled.is_empty()
    }
}

impl fmt::Display for PageAudit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pages={} in_use={} free={} leaked={} doubled={}",
            self.n_page,
            self.in_use,
            self.free,
            self.leaked_count,
            self.doubled.len()
        )
    }
}

fn claim_block(owners: &mut Vec<PageNo>, first: PageNo, block_pages: u32) {
    owners.extend((0..block_pages).map(|i| PageNo(first.0 + i)));
}

/// Accounts for every page. Needs at least a read transaction.
pub fn audit(pager: &mut Pager) -> Result<PageAudit> {
    let header = pager.header()?.clone();
    let bp = header.block_pages();

    let mut in_use = vec![PageNo::HEADER, header.schedule];
    Tree::new(header.main_root).collect_pages(pager, &mut in_use)?;
    Tree::new(header.meta_root).collect_pages(pager, &mut in_use)?;
    for level in load_levels(pager)? {
        for block in level.blocks() {
            claim_block(&mut in_use, block, bp);
        }
    }
    let sched = Schedule::decode(pager.page_uncached(header.schedule)?.data())?;
    for block in sched.blocks(bp) {
        claim_block(&mut in_use, block, bp);
    }

    let lists = pager.free_lists()?;
    let mut free = lists.pages.clone();
    free.extend(lists.block_trunks.iter().copied());
    for &block in &lists.blocks {
        claim_block(&mut free, block, bp);
    }

    let mut claims: HashMap<PageNo, u32> = HashMap::new();
    for &pgno in in_use.iter().chain(free.iter()) {
        *claims.entry(pgno).or_default() += 1;
    }
    let mut report = PageAudit {
        n_page: header.n_page,
        in_use: in_use.len(),
        free: free.len(),
        ..PageAudit::default()
    };
    let mut doubled: Vec<PageNo> = claims.iter().filter(|(_, &n)| n > 1).map(|(&p, _)| p).collect();
    doubled.sort();
    doubled.truncate(MAX_FINDINGS);
    report.doubled = doubled;
    for pgno in (1..=header.n_page).map(PageNo) {
        if !claims.contains_key(&pgno) {
            report.leaked_count += 1;
            if report.leaked.len() < MAX_FINDINGS {
                report.leaked.push(pgno);
            }
        }
    }
    Ok(report)
}
