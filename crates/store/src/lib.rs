//! meowkey-store: a single-file event store for keystroke, clipboard and
//! window events.
//!
//! One file holds a fixed header region, a double-buffered client table and
//! an append-only data region of event records and tree nodes:
//!
//! - **Three event trees**: copy-on-write B+ trees keyed by
//!   `(client_hash, sequence)`, one per event kind
//! - **Single writer**: one write transaction at a time, lock-free snapshots
//! - **Checksummed nodes**: XXH3-64 (truncated) verification on every read
//! - **Staged header commit**: crash-safe publication without a WAL
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               EventStore API                │
//! │  (register, record_event, query, stats)     │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │             Transaction Layer               │
//! │ (Snapshot: captured header, WriteTxn: COW)  │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │     Event Trees          Client Table       │
//! │ (insert, scan, lookup)  (slots, counters)   │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │        Node Layer / Header Region           │
//! │ (allocator, cache, checksums, staged copy)  │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │             Storage Backend                 │
//! │      (FileBackend / InMemoryBackend)        │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use meowkey_store::{EventKind, EventStore};
//!
//! let store = EventStore::open_in_memory()?;
//! let client = store.register_client("001")?;
//!
//! let mut txn = store.begin_write()?;
//! for key in ["A", "B", "C"] {
//!     txn.record_event(EventKind::Keystroke, "001", key.as_bytes())?;
//! }
//! txn.commit()?;
//!
//! let snapshot = store.snapshot();
//! let typed: Vec<_> = snapshot
//!     .scan(EventKind::Keystroke, client.hash, 0, 2)?
//!     .collect::<Result<_, _>>()?;
//! assert_eq!(typed.len(), 3);
//! # Ok::<(), meowkey_store::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
// Fixed-layout codecs cast between on-disk widths and usize deliberately
#![allow(clippy::cast_possible_truncation)]
// Tree operations return split propagation tuples
#![allow(clippy::type_complexity)]

pub mod backend;
pub mod btree;
pub mod client;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod header;
pub mod integrity;
pub mod page;
pub mod record;
pub mod transaction;

// Re-export commonly used types
pub use backend::{FileBackend, InMemoryBackend, StorageBackend};
pub use btree::{Anomaly, EventScan, EventTree, InsertOutcome, NodeReader, NodeWriter};
pub use client::{ClientSlot, ClientTable, Registration, RegistrationOutcome, SlotState, client_hash};
pub use config::StoreConfig;
pub use db::{EventStore, StoreStats};
pub use error::{Error, Offset, Result};
pub use header::{FORMAT_VERSION, HEADER_SIZE, Header, HeaderDelta, HeaderSource, MAGIC};
pub use integrity::{IntegrityScrubber, ScrubError, ScrubResult};
pub use page::{Allocator, Node, NodeCache, NodeKind};
pub use record::{EventKind, EventRecord, IndexKey, IndexedRecord, PAYLOAD_CAPACITY, RECORD_SIZE};
pub use transaction::{ClientEvent, IngestReceipt, Snapshot, WriteTransaction};
