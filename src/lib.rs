//! # StratumDB
//!
//! An embeddable, persistent, **ordered** key-value storage engine built
//! on a leveled **Log-Structured Merge Tree (LSM-tree)**. Designed for
//! fast writes, crash-safe operation, and predictable reads.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                       Engine                           │
//! │  ┌────────────┐  ┌──────────────┐  ┌───────────────┐  │
//! │  │  Active     │  │  Immutable   │  │  SSTables     │  │
//! │  │  Memtable   │  │  Memtables   │  │  L0 L1 L2 …   │  │
//! │  │  + WAL      │  │  + WALs      │  │  (on disk)    │  │
//! │  └─────┬───────┘  └──────┬───────┘  └──────┬────────┘  │
//! │        │   rotate        │   flush         │           │
//! │        └─────────►       └────────►        │           │
//! │                                            │           │
//! │  ┌─────────────────────────────────────────┘           │
//! │  │  Leveled compaction (L0→L1, Lₙ→Lₙ₊₁)                │
//! │  └────────────────────────────────────────────────────┐│
//! │                                                        │
//! │  ┌──────────────────────────────────────────────────┐  │
//! │  │        MANIFEST (JSON catalog of levels)         │  │
//! │  └──────────────────────────────────────────────────┘  │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Core storage engine — open, read, write, iterate, flush, compact |
//! | [`memtable`] | In-memory ordered write buffer |
//! | [`wal`] | CRC-protected write-ahead log segments for crash recovery |
//! | [`sstable`] | Immutable sorted on-disk tables with bloom filters and block indices |
//! | [`manifest`] | Durable JSON catalog of levels and their files |
//! | [`bloom`] | Probabilistic membership filter embedded in each table |
//! | [`compaction`] | Leveled compaction pipeline |
//!
//! ## Key guarantees
//!
//! - **Durability** — every mutation is fsynced to the WAL before it is
//!   acknowledged; acknowledged writes survive process crashes.
//! - **Read-your-writes** — a successful put is immediately visible to
//!   subsequent gets on the same engine.
//! - **Ordered iteration** — the forward iterator emits each live key
//!   exactly once, in ascending byte order, newest version winning.
//! - **Atomic batches** — a batch is applied all-or-nothing and made
//!   durable with a single fsync.
//! - **Crash-safe catalog** — the manifest is replaced atomically and
//!   always persisted before obsolete files are deleted.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stratumdb::{Engine, EngineConfig};
//!
//! let engine = Engine::open("/tmp/my_db", EngineConfig::default()).unwrap();
//!
//! engine.put(b"hello".to_vec(), b"world".to_vec()).unwrap();
//! assert_eq!(engine.get(b"hello").unwrap(), b"world".to_vec());
//!
//! engine.delete(b"hello".to_vec()).unwrap();
//! assert!(engine.get(b"hello").is_err()); // NotFound
//!
//! // Atomic batch
//! let mut batch = engine.new_batch();
//! batch.put(b"a".to_vec(), b"1".to_vec());
//! batch.put(b"b".to_vec(), b"2".to_vec());
//! engine.apply_batch(&batch).unwrap();
//!
//! // Ordered iteration over live keys
//! for (key, value) in engine.iter().unwrap() {
//!     println!("{:?} => {:?}", key, value);
//! }
//!
//! engine.close().unwrap();
//! ```

pub mod bloom;
pub mod compaction;
pub mod engine;
pub mod manifest;
pub mod memtable;
pub mod sstable;
pub mod wal;

pub use engine::{
    Batch, Engine, EngineConfig, EngineError, EngineIterator, Item, KvIterator, MetricsSnapshot,
};
pub use manifest::{FileMetadata, Version};
