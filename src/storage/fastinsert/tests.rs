use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Once};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing_subscriber::EnvFilter;

use super::*;
use crate::primitives::concurrency::Registry;
use crate::primitives::io::MemVfs;
use crate::primitives::pager::PagerOptions;
use crate::primitives::wal::Safety;
use crate::storage::btree::overflow::full_value;
use crate::storage::btree::SeekResult;
use crate::storage::verify::audit;

const PS: usize = 512;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn open_pager() -> Result<(MemVfs, Arc<Registry>, Pager)> {
    init_tracing();
    let vfs = MemVfs::new();
    let registry = Registry::new();
    let shared = registry.connect(&vfs, Path::new("fast.db"), false)?;
    let options = PagerOptions {
        page_size: PS,
        block_size: PS * 8,
        cache_pages: 256,
        safety: Safety::Off,
        auto_checkpoint: 0,
    };
    let mut pager = Pager::open(shared, &options)?;
    pager.begin(1)?;
    let (schedule, block_pages) = {
        let hdr = pager.header()?;
        (hdr.schedule, hdr.block_pages())
    };
    pager.commit(0)?;
    pager.set_checkpoint_hook(Box::new(MergeHook::new(schedule, block_pages)));
    Ok((vfs, registry, pager))
}

fn key(i: u32) -> Vec<u8> {
    format!("fk-{i:06}").into_bytes()
}

fn value(i: u32, round: u32) -> Vec<u8> {
    format!("value-{i}-{round}-{}", "x".repeat((i % 40) as usize)).into_bytes()
}

/// Applies `writes` in one transaction.
fn apply(
    pager: &mut Pager,
    policy: &MergePolicy,
    stats: &BTreeStats,
    writes: &[(Vec<u8>, Option<Vec<u8>>)],
) -> Result<()> {
    pager.begin(2)?;
    for (k, v) in writes {
        write(pager, k, v.as_deref(), policy, stats)?;
    }
    pager.commit(0)
}

fn lookup(pager: &mut Pager, k: &[u8]) -> Result<Option<Vec<u8>>> {
    pager.begin(1)?;
    let levels = load_levels(pager)?;
    let main = pager.header()?.main_root;
    let mut cursor = MultiCursor::over(&levels, Some(main), false);
    let found = match cursor.seek(pager, k, SeekMode::Eq)? {
        SeekResult::Exact => {
            let cell = cursor.cell().cloned().ok_or(BtError::Corruption("cursor"))?;
            Some(full_value(pager, &cell)?)
        }
        _ => None,
    };
    pager.commit(0)?;
    Ok(found)
}

fn contents(pager: &mut Pager) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
    pager.begin(1)?;
    let levels = load_levels(pager)?;
    let main = pager.header()?.main_root;
    let mut cursor = MultiCursor::over(&levels, Some(main), false);
    let mut out = BTreeMap::new();
    let mut more = cursor.first(pager)?;
    while more {
        let cell = cursor.cell().cloned().ok_or(BtError::Corruption("cursor"))?;
        out.insert(cell.key().to_vec(), full_value(pager, &cell)?);
        more = cursor.next(pager)?;
    }
    pager.commit(0)?;
    Ok(out)
}

fn assert_clean(pager: &mut Pager) -> Result<()> {
    pager.begin(1)?;
    let report = audit(pager)?;
    pager.commit(0)?;
    assert!(report.is_clean(), "{report}: leaked {:?} doubled {:?}", report.leaked, report.doubled);
    Ok(())
}

#[test]
fn levels_roll_over_when_a_block_fills() -> Result<()> {
    let (_vfs, _registry, mut pager) = open_pager()?;
    let stats = BTreeStats::default();
    let policy = MergePolicy {
        min_levels: 100,
        blocks_per_round: 1,
    };
    let writes: Vec<_> = (0..300).map(|i| (key(i), Some(value(i, 0)))).collect();
    apply(&mut pager, &policy, &stats, &writes)?;

    pager.begin(1)?;
    let levels = load_levels(&mut pager)?;
    let summary = read_summary(&mut pager)?;
    pager.commit(0)?;
    assert!(levels.len() > 2, "only {} levels", levels.len());
    assert!(levels.iter().all(|l| l.age == 0));
    assert!(levels.windows(2).all(|w| w[0].level > w[1].level), "newest first");
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].max, levels[0].level);
    assert_eq!(summary[0].merging, 0);

    for i in (0..300).step_by(17) {
        assert_eq!(lookup(&mut pager, &key(i))?, Some(value(i, 0)));
    }
    assert_clean(&mut pager)
}

#[test]
fn newest_version_wins_and_deletes_hide_older_ones() -> Result<()> {
    let (_vfs, _registry, mut pager) = open_pager()?;
    let stats = BTreeStats::default();
    let policy = MergePolicy {
        min_levels: 100,
        blocks_per_round: 1,
    };
    let first: Vec<_> = (0..120).map(|i| (key(i), Some(value(i, 0)))).collect();
    apply(&mut pager, &policy, &stats, &first)?;
    let second: Vec<_> = (0..120)
        .filter(|i| i % 3 == 0)
        .map(|i| {
            let v = if i % 2 == 0 { Some(value(i, 1)) } else { None };
            (key(i), v)
        })
        .collect();
    apply(&mut pager, &policy, &stats, &second)?;

    let all = contents(&mut pager)?;
    for i in 0..120 {
        let expected = match (i % 3, i % 2) {
            (0, 0) => Some(value(i, 1)),
            (0, _) => None,
            _ => Some(value(i, 0)),
        };
        assert_eq!(lookup(&mut pager, &key(i))?, expected, "key {i}");
        assert_eq!(all.get(&key(i)).cloned(), expected, "scan of key {i}");
    }
    Ok(())
}

#[test]
fn a_failed_write_leaves_the_transaction_untouched() -> Result<()> {
    let (_vfs, _registry, mut pager) = open_pager()?;
    let stats = BTreeStats::default();
    let policy = MergePolicy::default();
    pager.begin(2)?;
    write(&mut pager, b"a", Some(b"1"), &policy, &stats)?;
    let before = pager.header()?.clone();
    let long = vec![b'k'; max_key_len(PS) + 1];
    assert!(matches!(write(&mut pager, &long, Some(b"v"), &policy, &stats), Err(BtError::TooBig)));
    assert_eq!(pager.header()?, &before);
    assert_eq!(pager.level(), 2);
    pager.commit(0)?;
    assert_eq!(lookup(&mut pager, b"a")?, Some(b"1".to_vec()));
    Ok(())
}

#[test]
fn merges_run_in_checkpoints_and_resume_when_starved() -> Result<()> {
    let (_vfs, _registry, mut pager) = open_pager()?;
    let stats = BTreeStats::default();
    let policy = MergePolicy {
        min_levels: 2,
        blocks_per_round: 1,
    };
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let mut model = BTreeMap::new();
    for round in 0..6 {
        let mut writes = Vec::new();
        for _ in 0..80 {
            let i = rng.gen_range(0..400);
            let v = if rng.gen_bool(0.2) { None } else { Some(value(i, round)) };
            match &v {
                Some(v) => model.insert(key(i), v.clone()),
                None => model.remove(&key(i)),
            };
            writes.push((key(i), v));
        }
        apply(&mut pager, &policy, &stats, &writes)?;
    }

    let report = run_merges(&mut pager, &policy, &stats)?;
    assert!(report.integrated >= 1);
    assert!(report.rounds > report.integrated, "no merge was starved: {report:?}");

    pager.begin(1)?;
    let summary = read_summary(&mut pager)?;
    pager.commit(0)?;
    assert!(summary.iter().any(|a| a.age >= 1), "{summary:?}");
    assert!(summary.iter().all(|a| a.merging == 0));
    assert_eq!(contents(&mut pager)?, model);
    assert_clean(&mut pager)
}

#[test]
fn flush_moves_everything_into_the_main_tree() -> Result<()> {
    let (_vfs, _registry, mut pager) = open_pager()?;
    let stats = BTreeStats::default();
    let policy = MergePolicy {
        min_levels: 2,
        blocks_per_round: 1,
    };

    pager.begin(2)?;
    let main = Tree::new(pager.header()?.main_root);
    for i in 0..50 {
        let cell = build_cell(&mut pager, &key(i), b"main")?;
        main.upsert(&mut pager, cell, &stats)?;
    }
    pager.commit(0)?;

    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = (0..50).map(|i| (key(i), b"main".to_vec())).collect();
    let writes: Vec<_> = (25..200)
        .map(|i| {
            if i < 40 {
                model.remove(&key(i));
                (key(i), None)
            } else {
                model.insert(key(i), value(i, 2));
                (key(i), Some(value(i, 2)))
            }
        })
        .collect();
    apply(&mut pager, &policy, &stats, &writes)?;
    assert_eq!(contents(&mut pager)?, model);

    pager.begin(2)?;
    assert!(is_active(&mut pager)?);
    let applied = flush(&mut pager, &stats)?;
    assert_eq!(applied, 175);
    assert!(!is_active(&mut pager)?);
    assert!(pager.header()?.fi_block.is_none());
    pager.commit(0)?;

    assert_eq!(contents(&mut pager)?, model);
    pager.begin(1)?;
    let levels = load_levels(&mut pager)?;
    let cells = Tree::new(pager.header()?.main_root).check(&mut pager)?;
    pager.commit(0)?;
    assert!(levels.is_empty());
    assert_eq!(cells, model.len());
    assert_clean(&mut pager)
}

#[test]
fn writes_outside_a_write_transaction_are_refused() -> Result<()> {
    let (_vfs, _registry, mut pager) = open_pager()?;
    let stats = BTreeStats::default();
    pager.begin(1)?;
    let err = write(&mut pager, b"k", Some(b"v"), &MergePolicy::default(), &stats);
    assert!(matches!(err, Err(BtError::Misuse(_))));
    pager.commit(0)?;
    assert!(matches!(run_merges(&mut pager, &MergePolicy::default(), &stats), Ok(r) if r == MergeReport::default()));
    Ok(())
}
