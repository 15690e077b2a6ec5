#![doc = r#"
tempora: embedded time-series storage core

An append-mostly store for `(series, timestamp, value)` triples with
late-write tolerance, columnar compressed chunks, and range queries over
a ring of memory-mapped volumes. The crate provides:

- a sliding-window write buffer that reorders out-of-window arrivals
  before they hit disk
- delta/zig-zag/run-length integer pipelines and a predictive float
  codec for on-disk chunks, each guarded by a CRC-32
- fixed-size pages with an interpolation-search index and a sampled
  timestamp histogram
- cursor-based range queries merging disk chunks and in-memory runs
  into one time-ordered stream

The ingestion protocol, query language and result formatting live in
front of this crate; everything here is the storage engine proper.
"#]

pub mod cache;
pub mod codec;
pub mod cursor;
pub mod error;
pub mod events;
pub mod metadata;
pub mod page;
pub mod sequencer;
pub mod series;
pub mod storage;
pub mod types;
pub mod volume;

/// Main entry point: the volume ring with its write and search paths.
pub use crate::storage::{Config, Durability, QueryKind, Storage, StorageStats};
/// Error type and the stable numeric codes it maps onto.
pub use crate::error::{Error, ErrorCode, Result};
/// Structured observability hook.
pub use crate::events::{Event, EventListener};
/// Query shape accepted by every search path.
pub use crate::page::{ParamFilter, ScanQuery, SearchStatsSnapshot};
/// Consumer side of a query.
pub use crate::cursor::CursorReader;
/// Core value types.
pub use crate::types::{Direction, ParamId, Sample, Timestamp, Value};
/// Series-name normalization.
pub use crate::series::to_normal_form;
