#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::process::{abort, Command};
use std::sync::Arc;

use bt::{Db, DbOptions, MemVfs, Registry, Result, Safety, SeekMode, StdVfs, Target, Vfs};
use tempfile::tempdir;

const KEYS: u32 = 10_000;

fn key(i: u32) -> Vec<u8> {
    format!("key-{i:08}").into_bytes()
}

fn value(i: u32) -> Vec<u8> {
    format!("value-{}", i * 7).into_bytes()
}

fn options() -> DbOptions {
    DbOptions {
        page_size: 1024,
        block_size: 1024 * 16,
        multi_process: false,
        auto_checkpoint: 0,
        ..DbOptions::default()
    }
}

fn write_all(db: &mut Db) -> Result<()> {
    db.begin(2)?;
    for i in 0..KEYS {
        db.replace(&key(i), Some(&value(i)), Target::Main)?;
    }
    db.commit(0)
}

fn check_all(db: &mut Db) -> Result<()> {
    let mut cursor = db.cursor();
    let mut seen = 0u32;
    let mut more = cursor.first(db)?;
    while more {
        assert_eq!(cursor.key(), Some(key(seen).as_slice()), "unexpected key after {seen}");
        assert_eq!(cursor.value(db)?, value(seen));
        seen += 1;
        more = cursor.next(db)?;
    }
    assert_eq!(seen, KEYS);
    assert!(db.leaked_pages()?.is_empty());
    Ok(())
}

#[test]
fn kill_after_commit_keeps_every_key() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("crash-harness.db");

    let child_status = Command::new(std::env::current_exe()?)
        .env("BT_CRASH_DB_PATH", &db_path)
        .arg("--nocapture")
        .arg("--ignored")
        .arg("crash_child_abort_after_commit")
        .status()?;
    assert!(!child_status.success(), "child should abort");
    assert!(db_path.with_file_name("crash-harness.db-wal").exists(), "the log was left behind");

    let mut db = Db::open(Registry::new(), Arc::new(StdVfs), &db_path, options())?;
    check_all(&mut db)?;
    db.close()
}

#[test]
#[ignore]
fn crash_child_abort_after_commit() -> Result<()> {
    let Ok(path) = std::env::var("BT_CRASH_DB_PATH") else {
        return Ok(());
    };
    let mut db = Db::open(Registry::new(), Arc::new(StdVfs), PathBuf::from(path), options())?;
    write_all(&mut db)?;
    abort();
}

#[test]
fn power_cut_keeps_synced_commits_only() -> Result<()> {
    let vfs = MemVfs::new();
    let mut opts = options();
    opts.safety = Safety::Full;

    let mut db = Db::open(Registry::new(), Arc::new(vfs.clone()), "p.db", opts.clone())?;
    write_all(&mut db)?;
    db.set_safety(Safety::Off)?;
    db.replace(b"unsynced", Some(b"lost"), Target::Main)?;
    std::mem::forget(db);
    vfs.crash();

    let mut db = Db::open(Registry::new(), Arc::new(vfs.clone()), "p.db", opts)?;
    check_all(&mut db)?;
    assert_eq!(db.get(b"unsynced")?, None);
    db.close()
}

#[test]
fn recovering_twice_changes_nothing() -> Result<()> {
    let vfs = MemVfs::new();
    let mut opts = options();
    opts.safety = Safety::Full;

    let mut db = Db::open(Registry::new(), Arc::new(vfs.clone()), "r.db", opts.clone())?;
    write_all(&mut db)?;
    db.checkpoint(0)?;
    db.replace(&key(5), Some(b"after checkpoint"), Target::Main)?;
    std::mem::forget(db);
    vfs.crash();

    let mut first = Db::open(Registry::new(), Arc::new(vfs.clone()), "r.db", opts.clone())?;
    let header_once = first.dump_header()?;
    let file_once = vfs.snapshot(Path::new("r.db"));
    std::mem::forget(first);
    vfs.crash();

    let mut second = Db::open(Registry::new(), Arc::new(vfs.clone()), "r.db", opts)?;
    assert_eq!(second.dump_header()?, header_once);
    assert_eq!(vfs.snapshot(Path::new("r.db")), file_once);
    assert_eq!(second.get(&key(5))?, Some(b"after checkpoint".to_vec()));
    second.close()
}

#[test]
fn damaged_log_tail_ends_the_log() -> Result<()> {
    let vfs = MemVfs::new();
    let mut opts = options();
    opts.safety = Safety::Full;

    let mut db = Db::open(Registry::new(), Arc::new(vfs.clone()), "d.db", opts.clone())?;
    db.replace(b"first", Some(b"1"), Target::Main)?;
    let wal_len = vfs.snapshot(Path::new("d.db-wal")).map_or(0, |w| w.len());
    db.replace(b"second", Some(b"2"), Target::Main)?;
    std::mem::forget(db);

    // flip a byte inside the second commit's frame
    let wal = vfs.snapshot(Path::new("d.db-wal")).unwrap_or_default();
    assert!(wal.len() > wal_len + 64);
    let off = wal_len + 40;
    vfs.poke(Path::new("d.db-wal"), off, &[wal[off] ^ 0x01]);

    let mut db = Db::open(Registry::new(), Arc::new(vfs.clone()), "d.db", opts)?;
    assert_eq!(db.get(b"first")?, Some(b"1".to_vec()));
    assert_eq!(db.get(b"second")?, None);
    let mut cursor = db.cursor();
    assert_eq!(cursor.seek(&mut db, b"s", SeekMode::Ge)?, bt::SeekResult::NotFound);
    assert!(vfs.exists(Path::new("d.db"))?);
    db.close()
}
