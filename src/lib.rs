//! # rangewalk - Concurrent Ordered Range-Scan Engine
//!
//! rangewalk walks an ordered index snapshot with a pool of workers, keeping
//! every observable effect in strict key order. The expensive part of a scan
//! (materializing and decoding values off storage) runs concurrently; the
//! ordered part (folding rows into aggregates, advancing resumption
//! watermarks, committing writes) is serialized by FIFO tickets so the result
//! is indistinguishable from a single-threaded scan.
//!
//! ## Quick Start
//!
//! ```ignore
//! use rangewalk::{
//!     traverse, Direction, Interruptor, KeyRange, MemIndex,
//!     RangeScanCallback, Terminal, TraversalConfig,
//! };
//!
//! let index = MemIndex::new();
//! // ... populate ...
//! let snapshot = index.snapshot();
//! let callback = RangeScanCallback::new(vec![], Terminal::Count, Direction::Forward);
//! let range = KeyRange::all();
//! let flow = traverse(
//!     &snapshot,
//!     &range,
//!     &callback,
//!     &TraversalConfig::forward(),
//!     &Interruptor::new(),
//! )?;
//! let result = callback.finish(flow, &range).finalize(&Terminal::Count)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  accum: grouped reducers, partials, unshard  │
//! ├──────────────────────────────────────────────┤
//! │  traverse: producer + worker pool, callbacks │
//! │  replace: ordered-commit write pipeline      │
//! ├──────────────────────────────────────────────┤
//! │  fifo: ticket ordering │ interrupt: cancel   │
//! ├────────────────────────┴─────────────────────┤
//! │  index: snapshot seam │ datum │ key ranges   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`fifo`]: ticket-based FIFO ordering, the core synchronization primitive
//! - [`traverse`]: producer/worker-pool traversal engine and its callbacks
//! - [`transform`]: per-row pipeline (map, filter, concat-map, group, zip)
//! - [`accum`]: grouped reducers, batch budgets, partial results, `unshard`
//! - [`replace`]: batched writes with ordered commits
//! - [`index`]: the storage seam ([`Snapshot`]) and its in-memory stand-in
//!
//! Sub-ranges of one logical range can be scanned independently (different
//! threads, different shards); their [`PartialResult`]s merge through
//! [`unshard`] into one result equivalent to a single scan of the whole
//! range.

pub mod accum;
pub mod datum;
pub mod errors;
pub mod fifo;
pub mod index;
pub mod interrupt;
pub mod key;
pub mod replace;
pub mod transform;
pub mod traverse;

pub use accum::{
    unshard, AccumState, BatchSpec, FinalResult, GroupedAccumulator, PartialResult, Terminal,
    TerminalKind,
};
pub use datum::Datum;
pub use errors::{ScanError, ScanResult};
pub use fifo::{FifoEnforcer, Ticket};
pub use index::{MemIndex, MemSnapshot, RawValue, Snapshot};
pub use interrupt::Interruptor;
pub use key::{Direction, Flow, KeyRange};
pub use replace::{batched_replace, ReplaceOutcome};
pub use transform::{Batch, BatchItem, FilterDefault, Transform, UserFn};
pub use traverse::{
    traverse, RangeScanCallback, ReleasePolicy, RowHandle, TraversalCallback, TraversalConfig,
};
