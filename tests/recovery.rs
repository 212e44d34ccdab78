use bytes::Bytes;
use stratadb::{Db, DbOptions, ReadOptions, WriteBatch, WriteOptions};
use tempfile::TempDir;

fn sync_write() -> WriteOptions {
    WriteOptions { sync: true }
}

#[test]
fn put_survives_reopen() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let db = Db::open(dir.path(), DbOptions::default())?;
        db.put(sync_write(), b"a", b"1")?;
        db.put(sync_write(), b"b", b"2")?;
    }

    let db = Db::open(dir.path(), DbOptions::default())?;
    assert_eq!(db.get(ReadOptions::default(), b"a")?, Some(Bytes::from("1")));
    assert_eq!(db.get(ReadOptions::default(), b"b")?, Some(Bytes::from("2")));
    Ok(())
}

#[test]
fn delete_survives_reopen() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let db = Db::open(dir.path(), DbOptions::default())?;
        db.put(sync_write(), b"k", b"v")?;
        db.delete(sync_write(), b"k")?;
        assert_eq!(db.get(ReadOptions::default(), b"k")?, None);
    }

    let db = Db::open(dir.path(), DbOptions::default())?;
    assert_eq!(db.get(ReadOptions::default(), b"k")?, None);
    Ok(())
}

#[test]
fn batches_replay_atomically() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let db = Db::open(dir.path(), DbOptions::default())?;
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.put(b"b", b"2");
        batch.delete(b"a");
        db.write(sync_write(), batch)?;
    }

    let db = Db::open(dir.path(), DbOptions::default())?;
    assert_eq!(db.get(ReadOptions::default(), b"a")?, None);
    assert_eq!(db.get(ReadOptions::default(), b"b")?, Some(Bytes::from("2")));
    Ok(())
}

#[test]
fn empty_batch_is_accepted() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), DbOptions::default())?;
    db.write(sync_write(), WriteBatch::new())?;
    db.put(sync_write(), b"k", b"v")?;
    assert_eq!(db.get(ReadOptions::default(), b"k")?, Some(Bytes::from("v")));
    Ok(())
}

#[test]
fn writes_overwrite_across_reopens() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    for round in 0..3u32 {
        let db = Db::open(dir.path(), DbOptions::default())?;
        db.put(sync_write(), b"counter", round.to_string().as_bytes())?;
        drop(db);

        let db = Db::open(dir.path(), DbOptions::default())?;
        assert_eq!(
            db.get(ReadOptions::default(), b"counter")?,
            Some(Bytes::from(round.to_string()))
        );
    }
    Ok(())
}

#[test]
fn recovery_replays_unflushed_writes_from_the_wal() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        // Large write buffer: nothing gets flushed, recovery must come
        // entirely from the log.
        let db = Db::open(dir.path(), DbOptions::default())?;
        for i in 0..100u32 {
            db.put(sync_write(), format!("key{i:03}"), format!("value{i}"))?;
        }
        assert_eq!(db.property("stratadb.num-files-at-level0"), Some("0".to_owned()));
    }

    let db = Db::open(dir.path(), DbOptions::default())?;
    for i in 0..100u32 {
        assert_eq!(
            db.get(ReadOptions::default(), format!("key{i:03}"))?,
            Some(Bytes::from(format!("value{i}"))),
            "key{i:03} lost in recovery"
        );
    }
    Ok(())
}

#[test]
fn open_fails_without_create_if_missing() {
    let dir = TempDir::new().unwrap();
    let options = DbOptions {
        create_if_missing: false,
        ..DbOptions::default()
    };
    assert!(Db::open(dir.path().join("nope"), options).is_err());
}

#[test]
fn open_fails_with_error_if_exists() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    drop(Db::open(dir.path(), DbOptions::default())?);

    let options = DbOptions {
        error_if_exists: true,
        ..DbOptions::default()
    };
    assert!(Db::open(dir.path(), options).is_err());
    Ok(())
}

#[test]
fn second_open_of_live_database_fails() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let _db = Db::open(dir.path(), DbOptions::default())?;
    assert!(Db::open(dir.path(), DbOptions::default()).is_err());
    Ok(())
}

#[test]
fn directory_keeps_only_expected_file_kinds() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let db = Db::open(dir.path(), DbOptions::default())?;
        db.put(sync_write(), b"a", b"1")?;
        db.compact_range(None, None)?;
    }
    drop(Db::open(dir.path(), DbOptions::default())?);

    for entry in std::fs::read_dir(dir.path())? {
        let name = entry?.file_name();
        let name = name.to_string_lossy().into_owned();
        let recognized = name == "CURRENT"
            || name == "LOCK"
            || name == "LOG"
            || name == "LOG.old"
            || name.starts_with("MANIFEST-")
            || name.ends_with(".log")
            || name.ends_with(".ldb");
        assert!(recognized, "unexpected file in db dir: {name}");
    }
    Ok(())
}

#[test]
fn flushed_data_survives_without_its_wal() -> anyhow::Result<()> {
    let small = DbOptions {
        write_buffer_size: 4 * 1024,
        ..DbOptions::default()
    };
    let dir = TempDir::new()?;
    {
        let db = Db::open(dir.path(), small.clone())?;
        for i in 0..200u32 {
            db.put(sync_write(), format!("key{i:04}"), vec![b'x'; 100])?;
        }
        // Rotation happened; at least one level-0 table exists.
        db.compact_range(None, None)?;
    }

    let db = Db::open(dir.path(), small)?;
    for i in 0..200u32 {
        assert_eq!(
            db.get(ReadOptions::default(), format!("key{i:04}"))?,
            Some(Bytes::from(vec![b'x'; 100]))
        );
    }
    Ok(())
}
