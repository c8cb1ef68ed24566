#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;

use bt::{BtError, Db, DbOptions, MemVfs, Registry, Result, Safety, Target};

fn options() -> DbOptions {
    DbOptions {
        page_size: 1024,
        block_size: 1024 * 16,
        safety: Safety::Full,
        auto_checkpoint: 0,
        multi_process: false,
        ..DbOptions::default()
    }
}

fn open(vfs: &MemVfs) -> Result<Db> {
    Db::open(Registry::new(), Arc::new(vfs.clone()), "f.db", options())
}

fn key(i: u32) -> Vec<u8> {
    format!("key-{i:05}").into_bytes()
}

fn contents(db: &mut Db) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
    let mut cursor = db.cursor();
    let mut out = BTreeMap::new();
    let mut more = cursor.first(db)?;
    while more {
        if let Some(k) = cursor.key().map(<[u8]>::to_vec) {
            out.insert(k, cursor.value(db)?);
        }
        more = cursor.next(db)?;
    }
    Ok(out)
}

fn seed(db: &mut Db, model: &mut BTreeMap<Vec<u8>, Vec<u8>>) -> Result<()> {
    db.begin(2)?;
    for i in 0..100 {
        db.replace(&key(i), Some(b"base"), Target::Main)?;
        model.insert(key(i), b"base".to_vec());
    }
    db.commit(0)
}

#[test]
fn failed_sync_leaves_the_transaction_open_for_rollback() -> Result<()> {
    let vfs = MemVfs::new();
    let mut model = BTreeMap::new();
    let mut db = open(&vfs)?;
    seed(&mut db, &mut model)?;

    db.begin(2)?;
    for i in 0..100 {
        db.replace(&key(i), Some(b"changed"), Target::Main)?;
    }
    vfs.set_fail_syncs(true);
    assert!(matches!(db.commit(0), Err(BtError::Io(_))));
    assert_eq!(db.transaction_level(), 2);
    vfs.set_fail_syncs(false);
    db.rollback(0)?;
    assert_eq!(db.transaction_level(), 0);
    assert_eq!(contents(&mut db)?, model);

    db.replace(b"after", Some(b"ok"), Target::Main)?;
    model.insert(b"after".to_vec(), b"ok".to_vec());
    std::mem::forget(db);
    vfs.crash();

    let mut db = open(&vfs)?;
    assert_eq!(contents(&mut db)?, model);
    assert!(db.leaked_pages()?.is_empty());
    db.close()
}

#[test]
fn failed_log_writes_abort_the_commit() -> Result<()> {
    let vfs = MemVfs::new();
    let mut model = BTreeMap::new();
    let mut db = open(&vfs)?;
    seed(&mut db, &mut model)?;

    for (round, budget) in [0u64, 1, 2, 5, 1000].into_iter().enumerate() {
        let value = format!("round-{round}").into_bytes();
        db.begin(2)?;
        for i in (round as u32 * 7..100).step_by(3) {
            db.replace(&key(i), Some(&value), Target::Main)?;
        }
        vfs.fail_writes_after(Some(budget));
        let committed = db.commit(0);
        vfs.fail_writes_after(None);
        match committed {
            Ok(()) => {
                for i in (round as u32 * 7..100).step_by(3) {
                    model.insert(key(i), value.clone());
                }
            }
            Err(BtError::Io(_)) => {
                assert_eq!(db.transaction_level(), 2);
                db.rollback(0)?;
            }
            Err(err) => return Err(err),
        }
        assert_eq!(contents(&mut db)?, model, "after round {round}");
    }

    std::mem::forget(db);
    vfs.crash();
    let mut db = open(&vfs)?;
    assert_eq!(contents(&mut db)?, model);
    db.close()
}

#[test]
fn failed_checkpoint_can_be_retried() -> Result<()> {
    let vfs = MemVfs::new();
    let mut model = BTreeMap::new();
    let mut db = open(&vfs)?;
    seed(&mut db, &mut model)?;

    vfs.fail_writes_after(Some(2));
    assert!(matches!(db.checkpoint(0), Err(BtError::Io(_))));
    vfs.fail_writes_after(None);
    assert_eq!(contents(&mut db)?, model);

    let stats = db.checkpoint(0)?;
    assert!(stats.pages_copied > 0);
    assert_eq!(stats.remaining, 0);
    assert_eq!(contents(&mut db)?, model);

    std::mem::forget(db);
    vfs.crash();
    let mut db = open(&vfs)?;
    assert_eq!(contents(&mut db)?, model);
    assert!(db.leaked_pages()?.is_empty());
    db.close()
}
