//! Descent and rebalancing.
//!
//! A modified node is written back as-is while it fits and is not underfull.
//! Otherwise it is redistributed with up to two neighbours: their cells are
//! gathered and cut into evenly filled pages, reusing the old page numbers,
//! and the parent is spliced. The parent is then handled the same way. The
//! root page number never changes: an overfull root moves its content into
//! new children, and an internal root left with a single child absorbs it.

use std::ops::Range;

use crate::primitives::bytes::separator;
use crate::types::{BtError, PageNo, Result};

use super::cell::{internal_cell_len, usable, Cell};
use super::node::Node;
use super::stats::BTreeStats;
use super::{PageSource, PageStore};

/// Deepest tree a descent accepts before declaring a cycle.
pub(crate) const MAX_DEPTH: usize = 40;

/// One internal node on the way down.
#[derive(Debug)]
pub(crate) struct Frame {
    pub pgno: PageNo,
    pub node: Node,
    /// Child taken.
    pub idx: usize,
}

/// Index of the child covering `key`.
pub(crate) fn child_index(keys: &[Vec<u8>], key: &[u8]) -> usize {
    keys.partition_point(|k| k.as_slice() <= key)
}

/// Walks from `root` to the leaf covering `key`.
pub(crate) fn descend<S: PageSource + ?Sized>(
    src: &mut S,
    root: PageNo,
    key: &[u8],
    stats: Option<&BTreeStats>,
) -> Result<(Vec<Frame>, PageNo, Vec<Cell>)> {
    if let Some(stats) = stats {
        stats.inc_searches();
    }
    let mut path = Vec::new();
    let mut pgno = root;
    for _ in 0..MAX_DEPTH {
        let page = src.read_page(pgno)?;
        match Node::decode(page.data())? {
            Node::Leaf(cells) => return Ok((path, pgno, cells)),
            Node::Internal { keys, children } => {
                let idx = child_index(&keys, key);
                let child = children[idx];
                path.push(Frame {
                    pgno,
                    node: Node::Internal { keys, children },
                    idx,
                });
                pgno = child;
            }
        }
    }
    Err(BtError::Corruption("tree deeper than any valid tree"))
}

fn write<S: PageStore + ?Sized>(store: &mut S, pgno: PageNo, node: &Node) -> Result<()> {
    let image = node.encode(store.page_size())?;
    store.write_page(pgno, &image)
}

fn underfull(node: &Node, page_size: usize) -> bool {
    node.content_len() < usable(page_size) / 4
}

/// Writes back a modified node found at the end of `path` and restores the
/// size bounds on the way up.
pub(crate) fn rebalance<S: PageStore + ?Sized>(
    store: &mut S,
    mut path: Vec<Frame>,
    mut pgno: PageNo,
    mut node: Node,
    stats: &BTreeStats,
) -> Result<()> {
    let ps = store.page_size();
    while let Some(mut parent) = path.pop() {
        if node.fits(ps) && !underfull(&node, ps) {
            return write(store, pgno, &node);
        }
        redistribute(store, &mut parent, node, stats)?;
        pgno = parent.pgno;
        node = parent.node;
    }
    finish_root(store, pgno, node, stats)
}

fn finish_root<S: PageStore + ?Sized>(
    store: &mut S,
    root: PageNo,
    mut node: Node,
    stats: &BTreeStats,
) -> Result<()> {
    let ps = store.page_size();
    loop {
        if !node.fits(ps) {
            let (nodes, keys) = regroup(node, ps);
            let mut children = Vec::with_capacity(nodes.len());
            for child in &nodes {
                let pgno = store.alloc_page()?;
                write(store, pgno, child)?;
                children.push(pgno);
            }
            stats.inc_root_splits();
            stats.inc_splits(1);
            node = Node::Internal { keys, children };
            continue;
        }
        match &node {
            Node::Internal { keys, children } if keys.is_empty() => {
                let child = children[0];
                let page = store.read_page(child)?;
                let inner = Node::decode(page.data())?;
                drop(page);
                store.free_page(child)?;
                stats.inc_root_collapses();
                node = inner;
            }
            _ => return write(store, root, &node),
        }
    }
}

/// Cuts `costs` into consecutive groups of at most `cap`, each close to the
/// average fill. Always returns at least one group.
pub(crate) fn split_even(costs: &[usize], cap: usize) -> Vec<Range<usize>> {
    let total: usize = costs.iter().sum();
    let n = total.div_ceil(cap.max(1)).max(1);
    let mut groups = Vec::with_capacity(n);
    let mut start = 0;
    let mut size = 0;
    let mut acc = 0;
    for (i, &cost) in costs.iter().enumerate() {
        if i > start && size + cost > cap {
            groups.push(start..i);
            start = i;
            size = 0;
        }
        size += cost;
        acc += cost;
        let boundary = (groups.len() + 1) * total;
        if groups.len() + 1 < n && acc * n >= boundary && size * 2 * n >= total {
            groups.push(start..i + 1);
            start = i + 1;
            size = 0;
        }
    }
    if start < costs.len() || groups.is_empty() {
        groups.push(start..costs.len());
    }
    groups
}

/// Splits an overfull node's content into nodes that fit, returning them with
/// the separators between them.
fn regroup(node: Node, page_size: usize) -> (Vec<Node>, Vec<Vec<u8>>) {
    match node {
        Node::Leaf(cells) => leaf_groups(cells, page_size),
        Node::Internal { keys, children } => internal_groups(keys, children, page_size),
    }
}

fn leaf_groups(cells: Vec<Cell>, page_size: usize) -> (Vec<Node>, Vec<Vec<u8>>) {
    let costs: Vec<usize> = cells.iter().map(Cell::encoded_len).collect();
    let ranges = split_even(&costs, usable(page_size));
    let mut seps = Vec::with_capacity(ranges.len().saturating_sub(1));
    for pair in ranges.windows(2) {
        let left = cells[pair[0].end - 1].key();
        let right = cells[pair[1].start].key();
        seps.push(separator(left, right));
    }
    let mut cells = cells.into_iter();
    let nodes = ranges
        .iter()
        .map(|r| Node::Leaf(cells.by_ref().take(r.len()).collect()))
        .collect();
    (nodes, seps)
}

/// `keys.len() + 1 == children.len()`; `keys[i]` follows `children[i]`.
fn internal_groups(
    keys: Vec<Vec<u8>>,
    children: Vec<PageNo>,
    page_size: usize,
) -> (Vec<Node>, Vec<Vec<u8>>) {
    let costs: Vec<usize> = (0..children.len())
        .map(|i| keys.get(i).map_or(0, |k| internal_cell_len(k)))
        .collect();
    let mut ranges = split_even(&costs, usable(page_size));
    // a lone child would leave a keyless internal node behind
    let n = ranges.len();
    if n > 1 && ranges[n - 1].len() == 1 && ranges[n - 2].len() > 2 {
        ranges[n - 2].end -= 1;
        ranges[n - 1].start -= 1;
    }
    let mut nodes = Vec::with_capacity(ranges.len());
    let mut seps = Vec::with_capacity(ranges.len().saturating_sub(1));
    for (g, range) in ranges.iter().enumerate() {
        let group_keys = keys[range.start..range.end - 1].to_vec();
        nodes.push(Node::Internal {
            keys: group_keys,
            children: children[range.clone()].to_vec(),
        });
        if g + 1 < ranges.len() {
            seps.push(keys[range.end - 1].clone());
        }
    }
    (nodes, seps)
}

/// Rebalances `node`, child `parent.idx` of `parent`, together with its
/// neighbours and splices the result into `parent.node`.
fn redistribute<S: PageStore + ?Sized>(
    store: &mut S,
    parent: &mut Frame,
    node: Node,
    stats: &BTreeStats,
) -> Result<()> {
    let ps = store.page_size();
    let idx = parent.idx;
    let Node::Internal { keys, children } = &mut parent.node else {
        return Err(BtError::Corruption("parent is not an internal node"));
    };
    let lo = idx.saturating_sub(1);
    let hi = (idx + 1).min(children.len() - 1);
    let old_pages = children[lo..=hi].to_vec();

    let mut node = Some(node);
    let mut window = Vec::with_capacity(old_pages.len());
    for (i, &pgno) in old_pages.iter().enumerate() {
        if lo + i == idx {
            window.push(node.take().ok_or(BtError::Corruption("sibling window"))?);
        } else {
            let page = store.read_page(pgno)?;
            window.push(Node::decode(page.data())?);
        }
    }

    let (nodes, seps) = if window[0].is_leaf() {
        let mut cells = Vec::new();
        for node in window {
            match node {
                Node::Leaf(c) => cells.extend(c),
                Node::Internal { .. } => return Err(BtError::Corruption("mixed sibling levels")),
            }
        }
        if cells.is_empty() && (lo > 0 || hi + 1 < children.len()) {
            for pgno in &old_pages {
                store.free_page(*pgno)?;
            }
            children.drain(lo..=hi);
            if hi + 1 < keys.len() + 1 {
                keys.drain(lo..=hi);
            } else {
                keys.drain(lo - 1..hi);
            }
            stats.inc_merges(old_pages.len() as u64);
            return Ok(());
        }
        leaf_groups(cells, ps)
    } else {
        let mut all_keys = Vec::new();
        let mut all_children = Vec::new();
        for (i, node) in window.into_iter().enumerate() {
            match node {
                Node::Internal { keys: k, children: c } => {
                    if i > 0 {
                        all_keys.push(keys[lo + i - 1].clone());
                    }
                    all_keys.extend(k);
                    all_children.extend(c);
                }
                Node::Leaf(_) => return Err(BtError::Corruption("mixed sibling levels")),
            }
        }
        internal_groups(all_keys, all_children, ps)
    };

    let mut pages = Vec::with_capacity(nodes.len());
    for (i, node) in nodes.iter().enumerate() {
        let pgno = match old_pages.get(i) {
            Some(&pgno) => pgno,
            None => store.alloc_page()?,
        };
        write(store, pgno, node)?;
        pages.push(pgno);
    }
    for &pgno in old_pages.iter().skip(nodes.len()) {
        store.free_page(pgno)?;
    }
    match nodes.len().cmp(&old_pages.len()) {
        std::cmp::Ordering::Greater => stats.inc_splits((nodes.len() - old_pages.len()) as u64),
        std::cmp::Ordering::Less => stats.inc_merges((old_pages.len() - nodes.len()) as u64),
        std::cmp::Ordering::Equal => {}
    }
    children.splice(lo..=hi, pages);
    keys.splice(lo..hi, seps);
    Ok(())
}
