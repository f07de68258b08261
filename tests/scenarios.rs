//! End-to-end scenarios a conforming engine must satisfy, one test per
//! concrete case.

mod support;

use std::path::{Path, PathBuf};

use hamsterkv::device::{Device, FileDevice};
use hamsterkv::journal::Journal;
use hamsterkv::{Collision, CreateConfig, DbConfig, DbFlags, EnvFlags, Environment, Error, Found, OpenConfig};

fn journal_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".jrn");
    PathBuf::from(p)
}

/// 1. Create env page_size=1024, cachesize=64 KiB; create_db("db1",
/// keysize=16); insert ("alpha", "1"); commit; close; reopen; find.
#[test]
fn create_insert_close_reopen_find() {
    support::init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("env1.db");

    let env = Environment::create(
        &path,
        CreateConfig {
            page_size: 1024,
            cache_size: 64 * 1024,
            ..CreateConfig::default()
        },
    )
    .unwrap();
    let db = env
        .create_db(
            "db1",
            DbConfig {
                key_size: 16,
                ..DbConfig::default()
            },
        )
        .unwrap();
    env.insert(db, b"alpha", b"1", None).unwrap();
    env.close().unwrap();

    let env = Environment::open(&path, OpenConfig::default()).unwrap();
    let db = env.open_db("db1").unwrap();
    match env.find(db, b"alpha").unwrap() {
        Found::Single(v) => assert_eq!(v, b"1"),
        Found::Duplicates(_) => panic!("expected a single record"),
    }
}

/// 2. A committed transaction whose journal record reached disk but
/// whose page writes never did (the process died in between) is fully
/// visible again after reopening with auto-recovery. The crash is
/// simulated by writing the journal record directly, bypassing
/// `Environment` for that one transaction, so the main file genuinely
/// never saw the 1000 inserts.
#[test]
fn crash_between_journal_commit_and_page_flush_recovers_fully() {
    support::init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("env2.db");
    let page_size = 4096;

    let env = Environment::create(
        &path,
        CreateConfig {
            page_size,
            flags: EnvFlags::ENABLE_RECOVERY,
            ..CreateConfig::default()
        },
    )
    .unwrap();
    let db = env.create_db("db1", DbConfig::default()).unwrap();
    assert_eq!(db, 1);
    env.close().unwrap();

    {
        let device = FileDevice::open(journal_path(&path), page_size).unwrap();
        let mut journal = Journal::open(Box::new(device)).unwrap();
        let txn_id = 1u64;
        journal.append_begin(txn_id).unwrap();
        for i in 0..1000u32 {
            let key = format!("k{:06}", i).into_bytes();
            let value = i.to_le_bytes().to_vec();
            journal.append_insert(txn_id, db, &key, &value).unwrap();
        }
        journal.append_commit(txn_id).unwrap();
    }

    let env = Environment::open(
        &path,
        OpenConfig {
            flags: EnvFlags::ENABLE_RECOVERY | EnvFlags::AUTO_RECOVERY,
            ..OpenConfig::default()
        },
    )
    .unwrap();
    for i in 0..1000u32 {
        let key = format!("k{:06}", i).into_bytes();
        match env.find(db, &key).unwrap() {
            Found::Single(v) => assert_eq!(v, i.to_le_bytes()),
            Found::Duplicates(_) => panic!("expected a single record"),
        }
    }
}

/// 3. A 1 MiB blob round-trips exactly, and a partial overwrite only
/// touches the bytes it targets.
#[test]
fn blob_roundtrip_and_partial_overwrite() {
    support::init();
    let env = Environment::create(
        "env3",
        CreateConfig {
            page_size: 4096,
            flags: EnvFlags::IN_MEMORY,
            ..CreateConfig::default()
        },
    )
    .unwrap();
    let db = env.create_db("blobs", DbConfig::default()).unwrap();

    let original: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 256) as u8).collect();
    env.insert(db, b"big", &original, None).unwrap();
    match env.find(db, b"big").unwrap() {
        Found::Single(v) => assert_eq!(v, original),
        Found::Duplicates(_) => panic!("expected a single record"),
    }

    let mut overwritten = original.clone();
    for b in &mut overwritten[100..300] {
        *b = 0xAA;
    }
    env.insert(db, b"big", &overwritten, Some(Collision::Overwrite)).unwrap();

    match env.find(db, b"big").unwrap() {
        Found::Single(v) => {
            assert_eq!(&v[..100], &original[..100]);
            assert!(v[100..300].iter().all(|&b| b == 0xAA));
            assert_eq!(&v[300..], &original[300..]);
        }
        Found::Duplicates(_) => panic!("expected a single record"),
    }
}

/// 4. A duplicate-key database keeps its entries in non-decreasing byte
/// order regardless of insertion order.
#[test]
fn duplicate_table_enumeration_yields_sorted_order() {
    support::init();
    let env = Environment::create(
        "env4",
        CreateConfig {
            flags: EnvFlags::IN_MEMORY,
            ..CreateConfig::default()
        },
    )
    .unwrap();
    let db = env
        .create_db(
            "dupes",
            DbConfig {
                flags: DbFlags::ENABLE_DUPLICATES,
                ..DbConfig::default()
            },
        )
        .unwrap();

    env.insert(db, b"k", b"a", None).unwrap();
    env.insert(db, b"k", b"c", Some(Collision::SortedDuplicate)).unwrap();
    env.insert(db, b"k", b"b", Some(Collision::SortedDuplicate)).unwrap();

    let table = match env.find(db, b"k").unwrap() {
        Found::Duplicates(id) => id,
        Found::Single(_) => panic!("expected a duplicate table"),
    };
    let count = env.count_duplicates(db, table).unwrap();
    assert_eq!(count, 3);
    let values: Vec<Vec<u8>> = (0..count)
        .map(|i| env.get_duplicate(db, table, i as usize).unwrap())
        .collect();
    assert_eq!(values, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
}

/// 4b. Inserting into a database that was never created with
/// `ENABLE_DUPLICATES` rejects a duplicate collision outright.
#[test]
fn duplicate_insert_rejected_without_the_flag() {
    support::init();
    let env = Environment::create(
        "env4b",
        CreateConfig {
            flags: EnvFlags::IN_MEMORY,
            ..CreateConfig::default()
        },
    )
    .unwrap();
    let db = env.create_db("plain", DbConfig::default()).unwrap();
    env.insert(db, b"k", b"a", None).unwrap();
    assert!(matches!(
        env.insert(db, b"k", b"b", Some(Collision::SortedDuplicate)),
        Err(Error::InvalidParameter(_))
    ));
}

/// 5. A second transaction touching a key still held by a first,
/// uncommitted one is rejected with a conflict; the first transaction's
/// writes stay invisible to readers until it commits.
#[test]
fn concurrent_txns_conflict_on_the_same_key() {
    support::init();
    let env = Environment::create(
        "env5",
        CreateConfig {
            flags: EnvFlags::IN_MEMORY,
            ..CreateConfig::default()
        },
    )
    .unwrap();
    let db = env.create_db("widgets", DbConfig::default()).unwrap();

    let t1 = env.txn_begin().unwrap();
    env.txn_insert(t1, db, b"x", b"1").unwrap();

    assert!(matches!(env.find(db, b"x"), Err(Error::KeyNotFound)));

    let t2 = env.txn_begin().unwrap();
    assert!(matches!(
        env.txn_insert(t2, db, b"x", b"2"),
        Err(Error::TxnConflict)
    ));
}

/// 6. A freshly created file truncated to 300 bytes fails to open with
/// `invalid_file_header`, with no partial side effects.
#[test]
fn truncated_file_fails_to_open_with_invalid_header() {
    support::init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("env6.db");

    {
        let env = Environment::create(&path, CreateConfig::default()).unwrap();
        env.create_db("db1", DbConfig::default()).unwrap();
        env.close().unwrap();
    }

    {
        let mut device = FileDevice::open(&path, 4096).unwrap();
        device.truncate(300).unwrap();
    }

    let result = Environment::open(&path, OpenConfig::default());
    assert!(matches!(result, Err(Error::InvalidFileHeader)));
}
