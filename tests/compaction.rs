use bytes::Bytes;
use stratadb::{Db, DbOptions, ReadOptions, WriteOptions};
use tempfile::TempDir;

fn small_options() -> DbOptions {
    DbOptions {
        write_buffer_size: 16 * 1024,
        max_file_size: 32 * 1024,
        block_size: 1024,
        ..DbOptions::default()
    }
}

fn num_files_at(db: &Db, level: usize) -> usize {
    db.property(&format!("stratadb.num-files-at-level{level}"))
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

fn total_table_files(db: &Db) -> usize {
    (0..7).map(|level| num_files_at(db, level)).sum()
}

#[test]
fn overwrites_resolve_to_latest_after_full_compaction() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), small_options())?;

    for i in 0..2000u32 {
        db.put(WriteOptions::default(), format!("k{i:04}"), format!("k{i:04}"))?;
    }
    db.compact_range(None, None)?;

    for i in 0..2000u32 {
        db.put(
            WriteOptions::default(),
            format!("k{i:04}"),
            format!("k{i:04}!"),
        )?;
    }
    db.compact_range(None, None)?;
    db.compact_range(None, None)?;

    // Everything lives below level 0 now.
    assert_eq!(num_files_at(&db, 0), 0);
    assert!(total_table_files(&db) > 0);

    for i in 0..2000u32 {
        assert_eq!(
            db.get(ReadOptions::default(), format!("k{i:04}"))?,
            Some(Bytes::from(format!("k{i:04}!"))),
            "wrong value for k{i:04}"
        );
    }

    // A full scan visits each key exactly once, in order.
    let mut iter = db.iter(ReadOptions::default())?;
    iter.seek_to_first();
    let mut count = 0u32;
    let mut last: Option<Bytes> = None;
    while let Some(next) = iter.next() {
        let (key, value) = next?;
        if let Some(previous) = &last {
            assert!(*previous < key, "scan out of order");
        }
        assert_eq!(value, Bytes::from(format!("{}!", String::from_utf8_lossy(&key))));
        last = Some(key);
        count += 1;
    }
    assert_eq!(count, 2000);
    Ok(())
}

#[test]
fn manual_compaction_clears_level0() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), small_options())?;

    // Several flushes worth of data spread over distinct ranges.
    for chunk in 0..4u32 {
        for i in 0..300u32 {
            let key = format!("c{chunk}-{i:04}");
            db.put(WriteOptions::default(), &key, vec![b'v'; 64])?;
        }
        // Force a memtable rotation between chunks.
        db.compact_range(Some(b"zzz".as_slice()), Some(b"zzzz".as_slice()))?;
    }

    db.compact_range(None, None)?;
    assert_eq!(num_files_at(&db, 0), 0);

    for chunk in 0..4u32 {
        for i in 0..300u32 {
            let key = format!("c{chunk}-{i:04}");
            assert_eq!(
                db.get(ReadOptions::default(), &key)?,
                Some(Bytes::from(vec![b'v'; 64])),
                "missing {key}"
            );
        }
    }
    Ok(())
}

#[test]
fn background_compaction_bounds_level0() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), small_options())?;

    for i in 0..5000u32 {
        db.put(WriteOptions::default(), format!("key{i:06}"), vec![b'x'; 100])?;
    }
    // Writes are throttled at the slowdown trigger and stalled at the stop
    // trigger, so level 0 can never grow without bound.
    assert!(num_files_at(&db, 0) <= 12);

    // Spot-check reads while compactions churn.
    for i in (0..5000u32).step_by(613) {
        assert_eq!(
            db.get(ReadOptions::default(), format!("key{i:06}"))?,
            Some(Bytes::from(vec![b'x'; 100]))
        );
    }
    Ok(())
}

#[test]
fn deleted_range_stays_dead_through_compaction() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), small_options())?;

    for i in 0..500u32 {
        db.put(WriteOptions::default(), format!("d{i:04}"), b"payload")?;
    }
    db.compact_range(None, None)?;

    for i in 0..500u32 {
        db.delete(WriteOptions::default(), format!("d{i:04}"))?;
    }
    db.compact_range(None, None)?;

    for i in 0..500u32 {
        assert_eq!(db.get(ReadOptions::default(), format!("d{i:04}"))?, None);
    }

    let mut iter = db.iter(ReadOptions::default())?;
    iter.seek_to_first();
    assert!(iter.next().is_none());
    Ok(())
}

#[test]
fn stats_property_reports_activity() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), small_options())?;

    for i in 0..1000u32 {
        db.put(WriteOptions::default(), format!("s{i:04}"), vec![b's'; 64])?;
    }
    db.compact_range(None, None)?;

    let stats = db.property("stratadb.stats").expect("stats property");
    assert!(stats.contains("Level"));
    assert!(db.property("stratadb.sstables").is_some());
    assert_eq!(db.property("stratadb.nonsense"), None);
    assert_eq!(db.property("unprefixed"), None);
    Ok(())
}

#[test]
fn compacted_database_reopens_with_same_shape() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let shape_before;
    {
        let db = Db::open(dir.path(), small_options())?;
        for i in 0..1500u32 {
            db.put(WriteOptions::default(), format!("r{i:05}"), vec![b'r'; 64])?;
        }
        db.compact_range(None, None)?;
        shape_before = (0..7).map(|level| num_files_at(&db, level)).collect::<Vec<_>>();
    }

    let db = Db::open(dir.path(), small_options())?;
    let shape_after = (0..7).map(|level| num_files_at(&db, level)).collect::<Vec<_>>();
    assert_eq!(shape_before, shape_after);
    Ok(())
}
