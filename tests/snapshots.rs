use bytes::Bytes;
use stratadb::{Db, DbOptions, ReadOptions, WriteOptions};
use tempfile::TempDir;

fn read_at(snapshot: stratadb::SnapshotId) -> ReadOptions {
    ReadOptions {
        snapshot: Some(snapshot),
        ..ReadOptions::default()
    }
}

#[test]
fn snapshot_isolates_later_writes() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), DbOptions::default())?;

    db.put(WriteOptions::default(), b"x", b"v1")?;
    let snapshot = db.create_snapshot();
    db.put(WriteOptions::default(), b"x", b"v2")?;

    assert_eq!(db.get(ReadOptions::default(), b"x")?, Some(Bytes::from("v2")));
    assert_eq!(db.get(read_at(snapshot), b"x")?, Some(Bytes::from("v1")));

    db.release_snapshot(snapshot);
    assert!(db.get(read_at(snapshot), b"x").is_err());
    Ok(())
}

#[test]
fn snapshot_sees_through_deletes() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), DbOptions::default())?;

    db.put(WriteOptions::default(), b"k", b"v")?;
    let snapshot = db.create_snapshot();
    db.delete(WriteOptions::default(), b"k")?;

    assert_eq!(db.get(ReadOptions::default(), b"k")?, None);
    assert_eq!(db.get(read_at(snapshot), b"k")?, Some(Bytes::from("v")));
    db.release_snapshot(snapshot);
    Ok(())
}

#[test]
fn snapshot_taken_before_any_write_of_a_key_reads_absent() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), DbOptions::default())?;

    let snapshot = db.create_snapshot();
    db.put(WriteOptions::default(), b"later", b"v")?;

    assert_eq!(db.get(read_at(snapshot), b"later")?, None);
    assert_eq!(
        db.get(ReadOptions::default(), b"later")?,
        Some(Bytes::from("v"))
    );
    db.release_snapshot(snapshot);
    Ok(())
}

#[test]
fn compaction_preserves_entries_pinned_by_snapshots() -> anyhow::Result<()> {
    let options = DbOptions {
        write_buffer_size: 4 * 1024,
        ..DbOptions::default()
    };
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), options)?;

    db.put(WriteOptions::default(), b"pinned", b"old")?;
    let snapshot = db.create_snapshot();

    // Overwrite, then churn enough data through compaction that the old
    // version would be dropped were it not pinned.
    db.put(WriteOptions::default(), b"pinned", b"new")?;
    for i in 0..300u32 {
        db.put(WriteOptions::default(), format!("fill{i:04}"), vec![b'f'; 64])?;
    }
    db.compact_range(None, None)?;

    assert_eq!(db.get(read_at(snapshot), b"pinned")?, Some(Bytes::from("old")));
    assert_eq!(
        db.get(ReadOptions::default(), b"pinned")?,
        Some(Bytes::from("new"))
    );

    db.release_snapshot(snapshot);

    // With the pin gone a full compaction may drop the old version; the
    // latest one must remain.
    db.compact_range(None, None)?;
    assert_eq!(
        db.get(ReadOptions::default(), b"pinned")?,
        Some(Bytes::from("new"))
    );
    Ok(())
}

#[test]
fn iterator_respects_its_snapshot() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), DbOptions::default())?;

    db.put(WriteOptions::default(), b"a", b"1")?;
    db.put(WriteOptions::default(), b"b", b"2")?;
    let snapshot = db.create_snapshot();
    db.put(WriteOptions::default(), b"b", b"changed")?;
    db.put(WriteOptions::default(), b"c", b"3")?;
    db.delete(WriteOptions::default(), b"a")?;

    let mut iter = db.iter(read_at(snapshot))?;
    iter.seek_to_first();
    let mut seen = Vec::new();
    while let Some(next) = iter.next() {
        let (key, value) = next?;
        seen.push((key, value));
    }
    assert_eq!(
        seen,
        vec![
            (Bytes::from("a"), Bytes::from("1")),
            (Bytes::from("b"), Bytes::from("2")),
        ]
    );
    db.release_snapshot(snapshot);
    Ok(())
}
