//! Per-node storage engine for a replicated append-only log service.
//! Entries arrive over a binary TCP protocol, are made durable through a
//! group-commit journal, then settle into entry logs with a paged per-ledger
//! index for reads.

pub mod bookie;
pub mod checkpoint;
pub mod config;
pub mod diskcheck;
pub mod dispatch;
pub mod entrylog;
pub mod errors;
pub mod gc;
pub mod index;
pub mod journal;
pub mod layout;
pub mod ledger;
pub mod net;
pub mod wire;

pub use bookie::{Bookie, BookieStartError};
pub use checkpoint::{FlushOrchestrator, TxnWatermark};
pub use config::{ConfigError, ServerConfig};
pub use diskcheck::{DiskChecker, ReadOnlyState};
pub use dispatch::{Dispatcher, Pipeline};
pub use entrylog::{make_payload, EntryLog};
pub use errors::{BookieError, ReturnCode};
pub use gc::{GarbageCollector, LedgerManifest, StaticManifest};
pub use index::LedgerIndexCache;
pub use journal::Journal;
pub use layout::{BookieLayout, LastMark};
pub use ledger::LedgerDescriptorTable;
pub use net::BookieClient;
pub use wire::{Request, Response};
