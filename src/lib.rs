//! `stratadb` is a log-structured merge-tree (LSM) key-value storage
//! engine embedded in a single process.
//!
//! Opinionated about correctness first:
//! - Internal keys are ordered by `(user_key ASC, sequence DESC, type)`.
//! - Reads are snapshot-safe (consistent reads at a sequence number).
//! - Deletes are tombstones; compaction drops them once nothing can see
//!   them.
//! - WAL, manifest, and `CURRENT` follow a strict fsync/rename discipline,
//!   so a crash at any instant leaves a recoverable database.
//!
//! Writes group-commit through a leader, land in a write-ahead log and a
//! skip-list memtable, and flow down a seven-level tree of sorted tables
//! via a single background compaction thread.

mod batch;
mod cache;
mod coding;
mod compaction;
pub mod db;
mod error;
mod filename;
mod flock;
mod infolog;
mod iterator;
pub mod key;
mod log;
mod memtable;
mod sst;
mod version;

pub use batch::WriteBatch;
pub use db::{Db, DbIterator, DbOptions, ReadOptions, SnapshotId, Value, WriteOptions};
pub use error::{Error, Result};
pub use key::{BytewiseComparator, Comparator};
