#![allow(missing_docs)]

use std::sync::Arc;

use bt::{BtError, Db, DbOptions, MemVfs, Registry, Result, Target};

fn options() -> DbOptions {
    DbOptions {
        page_size: 1024,
        block_size: 1024 * 16,
        auto_checkpoint: 0,
        multi_process: false,
        ..DbOptions::default()
    }
}

fn pair() -> Result<(Db, Db)> {
    let vfs = Arc::new(MemVfs::new());
    let registry = Registry::new();
    let a = Db::open(Arc::clone(&registry), vfs.clone(), "iso.db", options())?;
    let b = Db::open(registry, vfs, "iso.db", options())?;
    Ok((a, b))
}

#[test]
fn readers_keep_their_snapshot_across_commits_and_checkpoints() -> Result<()> {
    let (mut writer, mut reader) = pair()?;
    writer.begin(2)?;
    for i in 0..200u32 {
        writer.replace(format!("k{i:04}").as_bytes(), Some(b"v1"), Target::Main)?;
    }
    writer.commit(0)?;

    reader.begin(1)?;
    assert_eq!(reader.get(b"k0007")?, Some(b"v1".to_vec()));

    writer.begin(2)?;
    for i in 0..200u32 {
        writer.replace(format!("k{i:04}").as_bytes(), Some(b"v2"), Target::Main)?;
    }
    writer.replace(b"fresh", Some(b"x"), Target::Main)?;
    writer.commit(0)?;

    // the checkpoint may not pass the reader's snapshot
    let stats = writer.checkpoint(0)?;
    assert!(stats.remaining > 0, "{stats:?}");

    assert_eq!(reader.get(b"k0007")?, Some(b"v1".to_vec()));
    assert_eq!(reader.get(b"fresh")?, None);
    let mut cursor = reader.cursor();
    let mut seen = 0;
    let mut more = cursor.first(&mut reader)?;
    while more {
        assert_eq!(cursor.value(&mut reader)?, b"v1".to_vec());
        seen += 1;
        more = cursor.next(&mut reader)?;
    }
    assert_eq!(seen, 200);

    // a stale snapshot cannot become a writer
    assert!(matches!(reader.begin(2), Err(BtError::BusySnapshot)));
    assert_eq!(reader.transaction_level(), 1);
    reader.commit(0)?;

    assert_eq!(reader.get(b"k0007")?, Some(b"v2".to_vec()));
    assert_eq!(reader.get(b"fresh")?, Some(b"x".to_vec()));
    assert_eq!(writer.checkpoint(0)?.remaining, 0);
    reader.close()?;
    writer.close()
}

#[test]
fn one_writer_at_a_time() -> Result<()> {
    let (mut a, mut b) = pair()?;
    a.begin(2)?;
    a.replace(b"k", Some(b"a"), Target::Main)?;
    assert!(matches!(b.begin(2), Err(BtError::Busy)));
    assert!(matches!(b.replace(b"k", Some(b"b"), Target::Main), Err(BtError::Busy)));
    assert_eq!(b.transaction_level(), 0);
    assert_eq!(b.get(b"k")?, None);
    a.commit(0)?;

    b.replace(b"k", Some(b"b"), Target::Main)?;
    assert_eq!(a.get(b"k")?, Some(b"b".to_vec()));
    a.close()?;
    b.close()
}

#[test]
fn readers_see_fast_insert_levels_committed_by_others() -> Result<()> {
    let (mut a, mut b) = pair()?;
    a.begin(2)?;
    for i in 0..50u32 {
        a.replace(format!("f{i:03}").as_bytes(), Some(b"fast"), Target::FastInsert)?;
    }
    a.commit(0)?;
    assert_eq!(b.get(b"f010")?, Some(b"fast".to_vec()));
    assert!(!b.fast_levels()?.is_empty());
    b.replace(b"f010", None, Target::Main)?;
    assert_eq!(a.get(b"f010")?, None);
    a.close()?;
    b.close()
}
