#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bt::{Db, DbOptions, MemVfs, Registry, Result, Target};

const PS: usize = 512;

fn options() -> DbOptions {
    DbOptions {
        page_size: PS,
        block_size: PS * 8,
        cache_pages: 256,
        multi_process: false,
        auto_checkpoint: 0,
        fast_merge_levels: 3,
        merge_blocks: 1,
        ..DbOptions::default()
    }
}

fn key(i: u32) -> Vec<u8> {
    format!("m{i:06}").into_bytes()
}

fn scatter(i: u32) -> u32 {
    i * 7919 % 100_000
}

fn sealed_age0(db: &mut Db) -> Result<usize> {
    Ok(db.fast_levels()?.iter().filter(|l| l.age == 0).count().saturating_sub(1))
}

fn live_keys(db: &mut Db) -> Result<BTreeSet<Vec<u8>>> {
    let mut cursor = db.cursor();
    let mut keys = BTreeSet::new();
    let mut more = cursor.first(db)?;
    while more {
        keys.extend(cursor.key().map(<[u8]>::to_vec));
        more = cursor.next(db)?;
    }
    Ok(keys)
}

#[test]
fn three_level_merge_resumes_twice() -> Result<()> {
    let vfs = MemVfs::new();
    let mut db = Db::open(Registry::new(), Arc::new(vfs), "merge.db", options())?;
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

    // fill blocks in scattered key order until three age-0 levels are
    // sealed; every tenth write deletes a key written earlier
    let mut i = 0u32;
    db.begin(2)?;
    while sealed_age0(&mut db)? < 3 {
        if i % 10 == 9 {
            let victim = key(scatter(i / 2));
            db.replace(&victim, None, Target::FastInsert)?;
            model.remove(&victim);
        } else {
            let value = format!("value-{i}-{}", "v".repeat((i % 17) as usize)).into_bytes();
            db.replace(&key(scatter(i)), Some(&value), Target::FastInsert)?;
            model.insert(key(scatter(i)), value);
        }
        i += 1;
    }
    db.commit(0)?;

    let before = db.fast_levels()?;
    let inputs: Vec<u32> = before.iter().filter(|l| l.age == 0).skip(1).map(|l| l.level).collect();
    assert_eq!(inputs.len(), 3, "{before:?}");

    let report = db.fast_merge()?;
    assert_eq!(report.integrated, 1, "{report:?}");
    assert!(report.rounds >= 3, "expected two resumptions, got {report:?}");

    let after = db.fast_levels()?;
    let outputs: Vec<_> = after.iter().filter(|l| l.age == 1).collect();
    assert_eq!(outputs.len(), 1, "{after:?}");
    assert!(outputs[0].trees.len() >= 3, "one sub-tree per round: {:?}", outputs[0]);
    assert!(
        after.iter().filter(|l| l.age == 0).all(|l| !inputs.contains(&l.level)),
        "inputs were released"
    );

    let expected: BTreeSet<Vec<u8>> = model.keys().cloned().collect();
    assert_eq!(live_keys(&mut db)?, expected);
    for (k, v) in &model {
        assert_eq!(db.get(k)?.as_ref(), Some(v));
    }
    assert!(db.leaked_pages()?.is_empty());
    db.close()
}

#[test]
fn merged_data_survives_reopen_and_flush() -> Result<()> {
    let vfs = MemVfs::new();
    let registry = Registry::new();
    let mut model = BTreeMap::new();
    {
        let mut db = Db::open(Arc::clone(&registry), Arc::new(vfs.clone()), "flush.db", options())?;
        // write until at least one merge has been integrated
        let mut round = 0u32;
        let mut integrated = 0;
        while integrated == 0 {
            assert!(round < 200, "no merge after {round} rounds: {:?}", db.fast_levels()?);
            db.begin(2)?;
            for j in 0..50u32 {
                let k = key((round * 37 + j * 11) % 300);
                let v = format!("r{round}j{j}-{}", "p".repeat(24)).into_bytes();
                db.replace(&k, Some(&v), Target::FastInsert)?;
                model.insert(k, v);
            }
            db.commit(0)?;
            integrated += db.fast_merge()?.integrated;
            round += 1;
        }
        assert!(db.fast_levels()?.iter().any(|l| l.age == 1));
        db.close()?;
    }

    let mut db = Db::open(registry, Arc::new(vfs), "flush.db", options())?;
    assert!(db.fast_levels()?.iter().any(|l| l.age >= 1));
    let expected: BTreeSet<Vec<u8>> = model.keys().cloned().collect();
    assert_eq!(live_keys(&mut db)?, expected);
    db.fast_flush()?;
    assert!(db.fast_levels()?.is_empty());
    assert_eq!(live_keys(&mut db)?, expected);
    for (k, v) in &model {
        assert_eq!(db.get(k)?.as_ref(), Some(v));
    }
    assert!(db.leaked_pages()?.is_empty());
    db.close()
}
