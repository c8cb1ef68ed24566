use std::collections::HashMap;
use std::path::Path;
use std::sync::Once;

use proptest::prelude::*;
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

use super::*;
use crate::primitives::concurrency::Registry;
use crate::primitives::io::{FileIo, MemVfs, StdVfs, Vfs};

const PS: usize = 512;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("bt::primitives::pager=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn options() -> PagerOptions {
    PagerOptions {
        page_size: PS,
        block_size: PS * 8,
        cache_pages: 64,
        safety: Safety::Full,
        auto_checkpoint: 0,
    }
}

fn open_with(vfs: &dyn Vfs, registry: &Arc<Registry>, path: &Path, options: &PagerOptions) -> Result<Pager> {
    let shared = registry.connect(vfs, path, false)?;
    Pager::open(shared, options)
}

fn open(vfs: &MemVfs, registry: &Arc<Registry>) -> Result<Pager> {
    open_with(vfs, registry, Path::new("p.db"), &options())
}

fn first_byte(pager: &mut Pager, pgno: u32) -> Result<u8> {
    Ok(pager.page(PageNo(pgno))?.data()[0])
}

/// Allocates `n` pages in one transaction and returns them.
fn allocate(pager: &mut Pager, n: usize) -> Result<Vec<PageNo>> {
    pager.begin(2)?;
    let pages = (0..n).map(|_| pager.alloc_page()).collect::<Result<Vec<_>>>()?;
    pager.commit(0)?;
    Ok(pages)
}

#[test]
fn new_database_gets_the_initial_layout() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("layout.db");
    let registry = Registry::new();
    let mut pager = open_with(&StdVfs, &registry, &path, &options())?;
    pager.begin(1)?;
    assert_eq!(pager.header()?, &DatabaseHeader::initial(PS as u32, (PS * 8) as u32));
    pager.commit(0)?;
    pager.checkpoint(0)?;
    drop(pager);

    let raw = std::fs::read(&path)?;
    assert!(raw.len() >= 4 * PS);
    assert_eq!(DatabaseHeader::decode(&raw).map(|h| h.n_page), Some(4));
    Ok(())
}

#[test]
fn garbage_file_is_not_a_database() -> Result<()> {
    init_tracing();
    let vfs = MemVfs::new();
    let registry = Registry::new();
    let file = vfs.open(Path::new("p.db"))?;
    file.write_at(0, &[0x42; 2 * PS])?;
    assert!(matches!(open(&vfs, &registry), Err(BtError::NotADatabase)));

    // the failed open leaves no snapshot behind to hold back the log
    file.truncate(0)?;
    let mut pager = open(&vfs, &registry)?;
    allocate(&mut pager, 3)?;
    assert_eq!(pager.checkpoint(0)?.remaining, 0);
    Ok(())
}

#[test]
fn commit_is_visible_and_rollback_is_not() -> Result<()> {
    let vfs = MemVfs::new();
    let registry = Registry::new();
    let mut pager = open(&vfs, &registry)?;
    let pages = allocate(&mut pager, 2)?;

    pager.begin(2)?;
    pager.page_mut(pages[0])?[0] = 7;
    pager.commit(0)?;

    pager.begin(2)?;
    pager.page_mut(pages[1])?[0] = 9;
    pager.rollback(0)?;
    assert_eq!(pager.level(), 0);

    let mut other = open(&vfs, &registry)?;
    other.begin(1)?;
    assert_eq!(first_byte(&mut other, pages[0].0)?, 7);
    assert_eq!(first_byte(&mut other, pages[1].0)?, 0);
    other.commit(0)?;
    Ok(())
}

#[test]
fn savepoint_rollback_keeps_outer_changes() -> Result<()> {
    let vfs = MemVfs::new();
    let mut pager = open(&vfs, &Registry::new())?;
    let pages = allocate(&mut pager, 2)?;

    pager.begin(2)?;
    pager.page_mut(pages[0])?[0] = 1;
    pager.begin(3)?;
    pager.page_mut(pages[0])?[0] = 2;
    pager.page_mut(pages[1])?[0] = 3;
    pager.header_mut()?.cookie = 99;
    pager.rollback(3)?;
    assert_eq!(pager.level(), 3, "the savepoint stays open");
    assert_eq!(first_byte(&mut pager, pages[0].0)?, 1);
    assert_eq!(first_byte(&mut pager, pages[1].0)?, 0);
    assert_eq!(pager.header()?.cookie, 0);

    pager.page_mut(pages[1])?[0] = 4;
    pager.commit(2)?;
    pager.commit(0)?;

    pager.begin(1)?;
    assert_eq!(first_byte(&mut pager, pages[0].0)?, 1);
    assert_eq!(first_byte(&mut pager, pages[1].0)?, 4);
    pager.commit(0)?;
    assert_eq!(pager.outstanding_page_refs(), 0);
    Ok(())
}

#[test]
fn scoped_failures_undo_only_their_own_changes() -> Result<()> {
    let vfs = MemVfs::new();
    let mut pager = open(&vfs, &Registry::new())?;
    let pages = allocate(&mut pager, 1)?;

    assert!(matches!(pager.scoped(|_| Ok(())), Err(BtError::Misuse(_))));
    pager.begin(2)?;
    pager.page_mut(pages[0])?[0] = 5;
    let failed: Result<()> = pager.scoped(|p| {
        p.page_mut(pages[0])?[0] = 6;
        p.header_mut()?.cookie = 7;
        Err(BtError::Full)
    });
    assert!(matches!(failed, Err(BtError::Full)));
    assert_eq!(pager.level(), 2);
    assert_eq!(first_byte(&mut pager, pages[0].0)?, 5);
    assert_eq!(pager.header()?.cookie, 0);

    pager.scoped(|p| {
        p.header_mut()?.cookie = 8;
        Ok(())
    })?;
    assert_eq!(pager.level(), 2);
    pager.commit(0)?;
    pager.begin(1)?;
    assert_eq!(pager.header()?.cookie, 8);
    pager.commit(0)
}

#[test]
fn other_connections_commits_invalidate_the_cache() -> Result<()> {
    let vfs = MemVfs::new();
    let registry = Registry::new();
    let mut a = open(&vfs, &registry)?;
    let mut b = open(&vfs, &registry)?;
    let pages = allocate(&mut a, 1)?;

    b.begin(1)?;
    assert_eq!(first_byte(&mut b, pages[0].0)?, 0);
    b.commit(0)?;

    a.begin(2)?;
    a.page_mut(pages[0])?[0] = 5;
    a.commit(0)?;

    b.begin(1)?;
    assert_eq!(first_byte(&mut b, pages[0].0)?, 5);
    b.commit(0)?;
    assert!(b.stats().invalidations >= 1);
    Ok(())
}

#[test]
fn clean_pages_are_evicted_past_the_limit() -> Result<()> {
    let vfs = MemVfs::new();
    let registry = Registry::new();
    let mut writer = open(&vfs, &registry)?;
    let pages = allocate(&mut writer, 64)?;
    writer.checkpoint(0)?;

    let small = PagerOptions {
        cache_pages: 16,
        ..options()
    };
    let mut reader = open_with(&vfs, &registry, Path::new("p.db"), &small)?;
    reader.begin(1)?;
    for pgno in &pages {
        reader.page(*pgno)?;
    }
    reader.commit(0)?;
    assert!(reader.stats().evictions > 0);
    assert!(reader.cache.len() <= 16);
    Ok(())
}

#[test]
fn failed_commit_keeps_the_transaction_open() -> Result<()> {
    let vfs = MemVfs::new();
    let mut pager = open(&vfs, &Registry::new())?;
    let pages = allocate(&mut pager, 1)?;

    pager.begin(2)?;
    pager.page_mut(pages[0])?[0] = 3;
    vfs.fail_writes_after(Some(0));
    assert!(pager.commit(0).is_err());
    assert_eq!(pager.level(), 2);
    vfs.fail_writes_after(None);
    pager.commit(0)?;

    pager.begin(1)?;
    assert_eq!(first_byte(&mut pager, pages[0].0)?, 3);
    pager.commit(0)?;
    Ok(())
}

#[test]
fn freed_pages_are_reused() -> Result<()> {
    let vfs = MemVfs::new();
    let mut pager = open(&vfs, &Registry::new())?;
    let pages = allocate(&mut pager, 200)?;

    pager.begin(2)?;
    for pgno in &pages {
        pager.free_page(*pgno)?;
    }
    let dump = pager.free_lists()?;
    assert_eq!(dump.pages.len(), 200);
    assert_eq!(pager.header()?.free_pages, 200);
    let n_page = pager.header()?.n_page;
    let again = (0..200).map(|_| pager.alloc_page()).collect::<Result<Vec<_>>>()?;
    assert_eq!(pager.header()?.n_page, n_page);
    assert_eq!(pager.header()?.free_pages, 0);
    let mut sorted = again.clone();
    sorted.sort();
    let mut expected = pages.clone();
    expected.sort();
    assert_eq!(sorted, expected);
    pager.commit(0)?;
    Ok(())
}

#[test]
fn blocks_are_aligned_and_reused() -> Result<()> {
    let vfs = MemVfs::new();
    let mut pager = open(&vfs, &Registry::new())?;
    pager.begin(2)?;
    let first = pager.alloc_block()?;
    assert_eq!(first, PageNo(9), "pages 5..=8 pad the first block");
    assert_eq!(pager.header()?.n_page, 16);
    assert_eq!(pager.free_lists()?.pages.len(), 4);

    let second = pager.alloc_block()?;
    assert_eq!(second, PageNo(17));
    pager.free_block(first)?;
    assert_eq!(pager.free_lists()?.blocks, vec![first]);
    assert_eq!(pager.alloc_block()?, first);
    assert_eq!(pager.header()?.free_blocks, 0);
    pager.commit(0)?;
    Ok(())
}

#[derive(Clone, Debug)]
enum Op {
    Begin(u32),
    Write(u32, u8),
    Commit(u32),
    Rollback(u32),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u32..6).prop_map(Op::Begin),
        (0u32..4, any::<u8>()).prop_map(|(p, v)| Op::Write(p, v)),
        (0u32..5).prop_map(Op::Commit),
        (0u32..5).prop_map(Op::Rollback),
    ]
}

/// Committed state plus the visible state at the start of every open write scope.
struct Model {
    level: u32,
    committed: HashMap<u32, u8>,
    current: HashMap<u32, u8>,
    scopes: Vec<HashMap<u32, u8>>,
}

impl Model {
    fn apply(&mut self, op: &Op) {
        match *op {
            Op::Begin(l) => {
                for _ in self.level.max(1)..l {
                    self.scopes.push(self.current.clone());
                }
                self.level = self.level.max(l);
            }
            Op::Write(p, v) => {
                if self.level >= 2 {
                    self.current.insert(p, v);
                }
            }
            Op::Commit(l) => {
                if l >= self.level {
                    return;
                }
                if l >= 2 {
                    self.scopes.truncate((l - 1) as usize);
                } else {
                    self.committed = self.current.clone();
                    self.scopes.clear();
                }
                self.level = l;
            }
            Op::Rollback(l) => {
                if l > self.level || (l == self.level && l < 2) {
                    return;
                }
                if self.level >= 2 {
                    let target = l.max(2);
                    self.scopes.truncate((target - 1) as usize);
                    if let Some(top) = self.scopes.last() {
                        self.current = top.clone();
                    }
                    if l < 2 {
                        self.scopes.clear();
                        self.current = self.committed.clone();
                    }
                }
                self.level = l;
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn nested_levels_match_a_model(ops in proptest::collection::vec(op(), 1..60)) {
        let vfs = MemVfs::new();
        let mut pager = open(&vfs, &Registry::new()).map_err(|e| TestCaseError::fail(e.to_string()))?;
        let pages = allocate(&mut pager, 4).map_err(|e| TestCaseError::fail(e.to_string()))?;
        let mut model = Model { level: 0, committed: HashMap::new(), current: HashMap::new(), scopes: Vec::new() };

        for op in &ops {
            let result = match *op {
                Op::Begin(l) => pager.begin(l),
                Op::Write(p, v) if pager.level() >= 2 => pager.page_mut(pages[p as usize]).map(|d| d[0] = v),
                Op::Write(..) => Ok(()),
                Op::Commit(l) => pager.commit(l),
                Op::Rollback(l) => pager.rollback(l),
            };
            prop_assert!(result.is_ok(), "{:?} failed: {:?}", op, result);
            model.apply(op);
            prop_assert_eq!(pager.level(), model.level);
            if pager.level() >= 1 {
                for (i, pgno) in pages.iter().enumerate() {
                    let seen = pager.page(*pgno).map_err(|e| TestCaseError::fail(e.to_string()))?.data()[0];
                    prop_assert_eq!(seen, model.current.get(&(i as u32)).copied().unwrap_or(0));
                }
            }
        }
        pager.rollback(0).map_err(|e| TestCaseError::fail(e.to_string()))?;
        pager.begin(1).map_err(|e| TestCaseError::fail(e.to_string()))?;
        for (i, pgno) in pages.iter().enumerate() {
            let seen = pager.page(*pgno).map_err(|e| TestCaseError::fail(e.to_string()))?.data()[0];
            prop_assert_eq!(seen, model.committed.get(&(i as u32)).copied().unwrap_or(0));
        }
    }
}
