use crate::types::{BtError, PageNo, Result};

use super::balance::{descend, rebalance};
use super::cell::Cell;
use super::node::Node;
use super::overflow::cell_page_list;
use super::stats::BTreeStats;
use super::{PageSource, PageStore};

/// A B-tree identified by its root page, which stays put for the tree's life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tree {
    root: PageNo,
}

impl Tree {
    /// Tree rooted at `root`. A zeroed root page is an empty tree.
    pub fn new(root: PageNo) -> Self {
        Self { root }
    }

    /// Root page.
    pub fn root(&self) -> PageNo {
        self.root
    }

    /// Cell stored under `key`.
    pub fn get<S: PageSource + ?Sized>(&self, src: &mut S, key: &[u8]) -> Result<Option<Cell>> {
        let (_, _, cells) = descend(src, self.root, key, None)?;
        Ok(cells
            .binary_search_by(|c| c.key().cmp(key))
            .ok()
            .map(|i| cells[i].clone()))
    }

    /// Inserts or replaces the cell for `cell.key()`, returning the replaced
    /// cell so the caller can release its overflow pages.
    pub fn upsert<S: PageStore + ?Sized>(
        &self,
        store: &mut S,
        cell: Cell,
        stats: &BTreeStats,
    ) -> Result<Option<Cell>> {
        let (path, pgno, mut cells) = descend(store, self.root, cell.key(), Some(stats))?;
        let old = match cells.binary_search_by(|c| c.key().cmp(cell.key())) {
            Ok(i) => Some(std::mem::replace(&mut cells[i], cell)),
            Err(i) => {
                cells.insert(i, cell);
                None
            }
        };
        rebalance(store, path, pgno, Node::Leaf(cells), stats)?;
        Ok(old)
    }

    /// Removes `key`, returning its cell. Nothing is written when the key is absent.
    pub fn remove<S: PageStore + ?Sized>(
        &self,
        store: &mut S,
        key: &[u8],
        stats: &BTreeStats,
    ) -> Result<Option<Cell>> {
        let (path, pgno, mut cells) = descend(store, self.root, key, Some(stats))?;
        let Ok(i) = cells.binary_search_by(|c| c.key().cmp(key)) else {
            return Ok(None);
        };
        let old = cells.remove(i);
        rebalance(store, path, pgno, Node::Leaf(cells), stats)?;
        Ok(Some(old))
    }

    /// True when the tree holds no cells.
    pub fn is_empty<S: PageSource + ?Sized>(&self, src: &mut S) -> Result<bool> {
        let page = src.read_page(self.root)?;
        Ok(match Node::decode(page.data())? {
            Node::Leaf(cells) => cells.is_empty(),
            Node::Internal { .. } => false,
        })
    }

    /// Every page the tree uses, overflow pages included. The root is the first entry.
    pub fn collect_pages<S: PageSource + ?Sized>(&self, src: &mut S, out: &mut Vec<PageNo>) -> Result<()> {
        let mut stack = vec![self.root];
        while let Some(pgno) = stack.pop() {
            out.push(pgno);
            let page = src.read_page(pgno)?;
            match Node::decode(page.data())? {
                Node::Leaf(cells) => {
                    for cell in &cells {
                        out.extend(cell_page_list(src, cell)?);
                    }
                }
                Node::Internal { children, .. } => stack.extend(children.into_iter().rev()),
            }
        }
        Ok(())
    }

    /// Walks the whole tree checking key order, separator bounds and uniform
    /// leaf depth. Returns the number of cells.
    pub fn check<S: PageSource + ?Sized>(&self, src: &mut S) -> Result<usize> {
        let mut count = 0;
        let mut leaf_depth = None;
        // (page, depth, lower bound, upper bound)
        let mut stack: Vec<(PageNo, usize, Option<Vec<u8>>, Option<Vec<u8>>)> =
            vec![(self.root, 0, None, None)];
        while let Some((pgno, depth, lower, upper)) = stack.pop() {
            let page = src.read_page(pgno)?;
            let node = Node::decode(page.data())?;
            let keys: Vec<&[u8]> = match &node {
                Node::Leaf(cells) => cells.iter().map(Cell::key).collect(),
                Node::Internal { keys, .. } => keys.iter().map(Vec::as_slice).collect(),
            };
            if keys.windows(2).any(|w| w[0] >= w[1]) {
                return Err(BtError::Corruption("keys out of order"));
            }
            let in_bounds = |k: &&[u8]| {
                lower.as_deref().map_or(true, |lo| *k >= lo) && upper.as_deref().map_or(true, |hi| *k < hi)
            };
            if !keys.iter().all(in_bounds) {
                return Err(BtError::Corruption("key outside its parent's bounds"));
            }
            match node {
                Node::Leaf(cells) => {
                    if *leaf_depth.get_or_insert(depth) != depth {
                        return Err(BtError::Corruption("leaves at different depths"));
                    }
                    count += cells.len();
                }
                Node::Internal { keys, children } => {
                    for (i, child) in children.into_iter().enumerate() {
                        let lo = if i == 0 { lower.clone() } else { Some(keys[i - 1].clone()) };
                        let hi = keys.get(i).cloned().or_else(|| upper.clone());
                        stack.push((child, depth + 1, lo, hi));
                    }
                }
            }
        }
        Ok(count)
    }
}
