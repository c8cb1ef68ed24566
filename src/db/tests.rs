use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Once};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing_subscriber::EnvFilter;

use super::*;
use crate::primitives::io::MemVfs;

const PS: usize = 512;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bt=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

fn options() -> DbOptions {
    DbOptions {
        page_size: PS,
        block_size: PS * 8,
        cache_pages: 128,
        safety: Safety::Normal,
        auto_checkpoint: 0,
        multi_process: false,
        fast_merge_levels: 2,
        merge_blocks: 1,
        checkpoint_on_close: true,
    }
}

fn open(vfs: &MemVfs, registry: &Arc<Registry>) -> Result<Db> {
    init_tracing();
    Db::open(Arc::clone(registry), Arc::new(vfs.clone()), "t.db", options())
}

fn key(i: u32) -> Vec<u8> {
    format!("k{i:05}").into_bytes()
}

fn sealed_age0(db: &mut Db) -> Result<usize> {
    Ok(db.fast_levels()?.iter().filter(|l| l.age == 0).count().saturating_sub(1))
}

fn scan(db: &mut Db) -> Result<Vec<Vec<u8>>> {
    let mut cursor = db.cursor();
    let mut keys = Vec::new();
    let mut more = cursor.first(db)?;
    while more {
        keys.extend(cursor.key().map(<[u8]>::to_vec));
        more = cursor.next(db)?;
    }
    Ok(keys)
}

#[test]
fn replace_get_and_delete() -> Result<()> {
    let vfs = MemVfs::new();
    let mut db = open(&vfs, &Registry::new())?;
    db.replace(b"alpha", Some(b"1"), Target::Main)?;
    db.replace(b"beta", Some(b"2"), Target::Main)?;
    assert_eq!(db.get(b"alpha")?, Some(b"1".to_vec()));
    db.replace(b"alpha", Some(b"one"), Target::Main)?;
    assert_eq!(db.get(b"alpha")?, Some(b"one".to_vec()));
    db.replace(b"beta", None, Target::Main)?;
    assert_eq!(db.get(b"beta")?, None);
    assert_eq!(db.get(b"gamma")?, None);
    assert_eq!(db.transaction_level(), 0);
    assert!(db.leaked_pages()?.is_empty());
    assert_eq!(db.outstanding_page_refs(), 0);
    db.close()
}

#[test]
fn rollback_discards_writes_and_savepoints_nest() -> Result<()> {
    let vfs = MemVfs::new();
    let mut db = open(&vfs, &Registry::new())?;
    db.begin(2)?;
    db.replace(b"kept", Some(b"v"), Target::Main)?;
    db.begin(3)?;
    db.replace(b"dropped", Some(b"v"), Target::Main)?;
    db.rollback(3)?;
    assert_eq!(db.transaction_level(), 3);
    assert_eq!(db.get(b"dropped")?, None);
    db.commit(0)?;
    assert_eq!(db.get(b"kept")?, Some(b"v".to_vec()));

    db.begin(2)?;
    db.replace(b"gone", Some(b"v"), Target::Main)?;
    db.rollback(0)?;
    assert_eq!(db.get(b"gone")?, None);
    assert_eq!(db.transaction_level(), 0);
    Ok(())
}

#[test]
fn cursors_walk_both_ways_and_survive_deletes() -> Result<()> {
    let vfs = MemVfs::new();
    let mut db = open(&vfs, &Registry::new())?;
    db.begin(2)?;
    for i in 0..300 {
        db.replace(&key(i * 2), Some(format!("v{i}").as_bytes()), Target::Main)?;
    }
    db.commit(0)?;

    let mut cursor = db.cursor();
    assert_eq!(cursor.seek(&mut db, &key(101), SeekMode::Ge)?, SeekResult::Inexact);
    assert_eq!(cursor.key(), Some(key(102).as_slice()));
    assert_eq!(cursor.seek(&mut db, &key(101), SeekMode::Le)?, SeekResult::Inexact);
    assert_eq!(cursor.key(), Some(key(100).as_slice()));
    assert_eq!(cursor.seek(&mut db, &key(100), SeekMode::Eq)?, SeekResult::Exact);
    assert_eq!(cursor.value(&mut db)?, b"v50".to_vec());
    assert_eq!(cursor.seek(&mut db, &key(101), SeekMode::Eq)?, SeekResult::NotFound);
    assert!(!cursor.valid());

    assert_eq!(cursor.seek(&mut db, &key(301), SeekMode::LeFast)?, SeekResult::Inexact);
    assert_eq!(cursor.key(), Some(key(300).as_slice()));
    assert!(cursor.next(&mut db)?);
    assert_eq!(cursor.key(), Some(key(302).as_slice()));

    cursor.delete(&mut db)?;
    assert_eq!(db.get(&key(302))?, None);
    assert!(cursor.next(&mut db)?);
    assert_eq!(cursor.key(), Some(key(304).as_slice()));
    assert!(cursor.prev(&mut db)?);
    assert_eq!(cursor.key(), Some(key(300).as_slice()));

    assert!(cursor.last(&mut db)?);
    assert_eq!(cursor.key(), Some(key(598).as_slice()));
    assert!(!cursor.next(&mut db)?);
    cursor.close();

    let keys = scan(&mut db)?;
    assert_eq!(keys.len(), 299);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    Ok(())
}

#[test]
fn partial_reads_of_large_values() -> Result<()> {
    let vfs = MemVfs::new();
    let mut db = open(&vfs, &Registry::new())?;
    let value: Vec<u8> = (0..PS * 40).map(|i| (i % 251) as u8).collect();
    db.replace(b"big", Some(&value), Target::Main)?;
    let mut cursor = db.cursor();
    assert_eq!(cursor.seek(&mut db, b"big", SeekMode::Eq)?, SeekResult::Exact);
    assert_eq!(cursor.data(&mut db, 1000, 64)?, value[1000..1064].to_vec());
    assert_eq!(cursor.data(&mut db, (PS * 40 - 10) as u64, 64)?, value[PS * 40 - 10..].to_vec());
    assert_eq!(cursor.value(&mut db)?, value);
    db.replace(b"big", None, Target::Main)?;
    assert!(db.leaked_pages()?.is_empty());
    Ok(())
}

#[test]
fn fast_insert_reads_through_merges_and_flushes() -> Result<()> {
    let vfs = MemVfs::new();
    let mut db = open(&vfs, &Registry::new())?;
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let mut model = BTreeMap::new();
    for i in 0..40 {
        db.replace(&key(i), Some(b"main"), Target::Main)?;
        model.insert(key(i), b"main".to_vec());
    }
    // keep writing until two age-0 levels are sealed and a merge is due
    let mut round = 0;
    while sealed_age0(&mut db)? < 2 {
        assert!(round < 100, "levels never sealed: {:?}", db.fast_levels()?);
        db.begin(2)?;
        for _ in 0..60 {
            let i = rng.gen_range(0..200);
            if rng.gen_bool(0.25) {
                db.replace(&key(i), None, Target::FastInsert)?;
                model.remove(&key(i));
            } else {
                let v = format!("r{round}-{i}-{}", "x".repeat(40)).into_bytes();
                db.replace(&key(i), Some(&v), Target::FastInsert)?;
                model.insert(key(i), v);
            }
        }
        db.commit(0)?;
        round += 1;
    }
    // main-target writes now land above the fast-insert data
    db.replace(&key(7), Some(b"late"), Target::Main)?;
    model.insert(key(7), b"late".to_vec());

    let expected: Vec<Vec<u8>> = model.keys().cloned().collect();
    assert_eq!(scan(&mut db)?, expected);
    for (k, v) in &model {
        assert_eq!(db.get(k)?.as_ref(), Some(v));
    }

    let report = db.fast_merge()?;
    assert!(report.integrated >= 1, "{report:?}");
    assert!(db.fast_levels()?.iter().any(|l| l.age == 1));
    assert_eq!(scan(&mut db)?, expected);
    for (k, v) in &model {
        assert_eq!(db.get(k)?.as_ref(), Some(v));
    }
    assert!(db.leaked_pages()?.is_empty());

    let applied = db.fast_flush()?;
    assert!(applied > 0);
    assert_eq!(scan(&mut db)?, expected);
    for (k, v) in &model {
        assert_eq!(db.get(k)?.as_ref(), Some(v));
    }
    assert!(db.leaked_pages()?.is_empty());
    assert!(db.dump_header()?.contains("fi_block        0"));
    Ok(())
}

#[test]
fn cookie_and_sizes_persist_across_reopen() -> Result<()> {
    let vfs = MemVfs::new();
    let registry = Registry::new();
    let mut db = open(&vfs, &registry)?;
    db.set_cookie(42)?;
    db.replace(b"k", Some(b"v"), Target::Main)?;
    db.close()?;

    let mut other = options();
    other.page_size = 4096;
    other.block_size = 4096 * 8;
    let mut db = Db::open(Arc::clone(&registry), Arc::new(vfs.clone()), "t.db", other)?;
    assert_eq!(db.page_size()?, PS);
    assert_eq!(db.block_size()?, PS * 8);
    assert_eq!(db.cookie()?, 42);
    assert_eq!(db.get(b"k")?, Some(b"v".to_vec()));
    Ok(())
}

#[test]
fn last_close_removes_the_log_and_shared_memory() -> Result<()> {
    init_tracing();
    let vfs = MemVfs::new();
    let registry = Registry::new();
    let mut shared = options();
    shared.multi_process = true;
    let mut a = Db::open(Arc::clone(&registry), Arc::new(vfs.clone()), "t.db", shared.clone())?;
    let b = Db::open(Arc::clone(&registry), Arc::new(vfs.clone()), "t.db", shared)?;
    a.replace(b"k", Some(b"v"), Target::Main)?;
    b.close()?;
    assert!(vfs.exists(Path::new("t.db-wal"))?);
    a.close()?;
    assert!(!vfs.exists(Path::new("t.db-wal"))?);
    assert!(!vfs.exists(Path::new("t.db-shm"))?);
    assert!(vfs.exists(Path::new("t.db"))?);
    assert_eq!(registry.open_files(), 0);
    Ok(())
}

#[test]
fn diagnostics_describe_pages_and_free_lists() -> Result<()> {
    let vfs = MemVfs::new();
    let mut db = open(&vfs, &Registry::new())?;
    for i in 0..50 {
        db.replace(&key(i), Some(&[b'x'; 40]), Target::Main)?;
    }
    for i in 0..50 {
        db.replace(&key(i), None, Target::Main)?;
    }
    let header = db.dump_header()?;
    assert!(header.contains("page_size       512"));
    let freelist = db.dump_freelist()?;
    assert!(freelist.starts_with("free_pages="));
    let root = db.dump_page(PageNo(2))?;
    assert!(root.starts_with("page 2"));
    assert!(db.dump_page(PageNo(100_000)).is_err());
    let stats = db.stats()?;
    assert!(stats.pager.commits >= 100);
    assert!(stats.btree.searches > 0);
    Ok(())
}

#[test]
fn oversized_keys_and_closed_handles_are_rejected() -> Result<()> {
    let vfs = MemVfs::new();
    let mut db = open(&vfs, &Registry::new())?;
    let long = vec![b'k'; PS];
    assert!(matches!(db.replace(&long, Some(b"v"), Target::Main), Err(BtError::TooBig)));
    assert!(matches!(db.replace(&long, Some(b"v"), Target::FastInsert), Err(BtError::TooBig)));
    assert!(matches!(db.checkpoint(0), Ok(_)));
    db.begin(1)?;
    assert!(matches!(db.checkpoint(0), Err(BtError::Misuse(_))));
    db.commit(0)?;
    Ok(())
}
