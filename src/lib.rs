//! EmberDB: an embedded ordered key-value storage engine built on a
//! log-structured merge tree.
//!
//! Keys and values are arbitrary byte strings. Writes land in a
//! multi-version skip-list memtable and migrate through a write-ahead log
//! and immutable sorted tables (SSTs) organized in levels. Reads are
//! versioned: every operation happens under a transaction id, and a read at
//! snapshot `T` sees exactly the writes with txn id `<= T`. Explicit
//! transactions offer read-uncommitted through serializable isolation with
//! write-write conflict detection.
//!
//! ```no_run
//! use emberdb::{IsolationLevel, Lsm};
//!
//! let db = Lsm::open("./data")?;
//! db.put(b"hello", b"world")?;
//! assert_eq!(db.get(b"hello")?, Some(b"world".to_vec()));
//!
//! let mut txn = db.begin_txn(IsolationLevel::RepeatableRead)?;
//! txn.put(b"hello", b"txn")?;
//! txn.commit()?;
//! # Ok::<(), emberdb::Error>(())
//! ```

pub mod block;
pub mod bloom;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod flock;
pub mod iterator;
pub mod memtable;
pub mod skiplist;
pub mod sst;
pub mod tmpfs;
pub mod txn;
pub mod wal;

pub use config::LsmConfig;
pub use engine::{prefix_predicate, Lsm};
pub use error::{Error, Result};
pub use txn::{IsolationLevel, TxnContext, TxnState};
