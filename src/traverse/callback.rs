//! # Traversal Callback Contract
//!
//! Every consumer of the traversal engine implements [`TraversalCallback`].
//! The engine hands each materialized pair to `handle_pair` together with
//! the entry's FIFO ticket; the callback decides whether it needs ordering
//! and, if so, calls `wait_interruptible` itself before performing any
//! ordered effect. A callback that needs no ordering skips the wait for
//! extra parallelism.
//!
//! Three implementations live here:
//!
//! - [`RangeScanCallback`]: the plain range scan, transform pipeline in the
//!   unordered phase, fold into the accumulator in the ordered phase;
//! - [`GeoCandidateCallback`]: same fold, but candidates known to lie
//!   inside the query region skip the expensive post-filter;
//! - [`PostConstructionCallback`]: re-derives secondary-index entries for
//!   each row and writes them; writes are order-independent, only the
//!   "rightmost key fully post-constructed" watermark needs the ticket.

use parking_lot::Mutex;
use smallvec::{smallvec, SmallVec};

use crate::accum::{GroupedAccumulator, PartialResult, Terminal};
use crate::datum::Datum;
use crate::errors::{ScanError, ScanResult};
use crate::fifo::Ticket;
use crate::index::MemIndex;
use crate::key::{truncate_key, Direction, Flow, KeyRange};
use crate::transform::{Batch, BatchItem, Transform, UserFn};

use super::RowHandle;

pub trait TraversalCallback: Send + Sync {
    /// Handle one `(key, value)` pair. May raise [`ScanError::Interrupted`].
    /// The row view is valid only for the duration of this call; copy it
    /// out with `extract` or drop it with `release` before returning.
    fn handle_pair(&self, key: &[u8], row: &mut RowHandle, ticket: &Ticket) -> ScanResult<Flow>;
}

/// Range-scan callback: decodes the row, runs it through the transform
/// pipeline (unordered), then waits on the ticket and folds the result into
/// the grouped accumulator (ordered).
pub struct RangeScanCallback {
    transforms: Vec<Transform>,
    lazy_group: Option<UserFn>,
    acc: Mutex<GroupedAccumulator>,
}

impl RangeScanCallback {
    pub fn new(transforms: Vec<Transform>, terminal: Terminal, direction: Direction) -> Self {
        Self {
            transforms,
            lazy_group: None,
            acc: Mutex::new(GroupedAccumulator::new(terminal, direction)),
        }
    }

    pub fn with_accumulator(transforms: Vec<Transform>, acc: GroupedAccumulator) -> Self {
        Self {
            transforms,
            lazy_group: None,
            acc: Mutex::new(acc),
        }
    }

    /// Group rows the pipeline left ungrouped through `f`, evaluated
    /// lazily per row.
    pub fn with_lazy_group(mut self, f: UserFn) -> Self {
        self.lazy_group = Some(f);
        self
    }

    pub fn watermark(&self) -> Option<Vec<u8>> {
        self.acc.lock().watermark().map(<[u8]>::to_vec)
    }

    /// Finalize the scan. `outcome` is the engine's continuation result:
    /// `Continue` means the range was exhausted.
    pub fn finish(self, outcome: Flow, range: &KeyRange) -> PartialResult {
        self.acc.into_inner().finish(outcome, range)
    }

    /// Transform in the unordered phase, fold in the ordered phase. Shared
    /// with the geo specialization; `row` of `None` only advances the
    /// watermark (the key was visited but filtered before the pipeline).
    fn fold_pair(&self, key: &[u8], row: Option<Datum>, ticket: &Ticket) -> ScanResult<Flow> {
        let mut batch: Batch = match row {
            Some(row) => smallvec![BatchItem::ungrouped(row)],
            None => Batch::new(),
        };
        for transform in &self.transforms {
            if batch.is_empty() {
                break;
            }
            if let Err(e) = transform.apply(&mut batch) {
                if e.is_interruption() {
                    return Err(e);
                }
                // Row errors are query data: record in key order, then stop
                // the scan without failing the traversal.
                ticket.wait_interruptible()?;
                self.acc.lock().record_error(e);
                return Ok(Flow::Abort);
            }
        }

        ticket.wait_interruptible()?;
        Ok(self
            .acc
            .lock()
            .accumulate(batch, key, self.lazy_group.as_ref()))
    }
}

impl TraversalCallback for RangeScanCallback {
    fn handle_pair(&self, key: &[u8], row: &mut RowHandle, ticket: &Ticket) -> ScanResult<Flow> {
        let row = row.extract()?;
        self.fold_pair(key, Some(row), ticket)
    }
}

/// Geospatial candidate callback. The covering step tells us which index
/// ranges lie *entirely* inside the query region; a candidate from one of
/// those definitely intersects and skips the exact post-filter.
pub struct GeoCandidateCallback {
    inner: RangeScanCallback,
    definite: Vec<KeyRange>,
    post_filter: UserFn,
}

impl GeoCandidateCallback {
    pub fn new(inner: RangeScanCallback, definite: Vec<KeyRange>, post_filter: UserFn) -> Self {
        Self {
            inner,
            definite,
            post_filter,
        }
    }

    pub fn finish(self, outcome: Flow, range: &KeyRange) -> PartialResult {
        self.inner.finish(outcome, range)
    }

    fn definitely_intersects(&self, key: &[u8]) -> bool {
        self.definite.iter().any(|range| range.contains(key))
    }
}

impl TraversalCallback for GeoCandidateCallback {
    fn handle_pair(&self, key: &[u8], row: &mut RowHandle, ticket: &Ticket) -> ScanResult<Flow> {
        let row = row.extract()?;
        if !self.definitely_intersects(key) {
            match (self.post_filter)(&row) {
                Ok(verdict) if !verdict.is_truthy() => {
                    // Rejected candidate: still advance the watermark in
                    // key order so resumption does not revisit it.
                    return self.inner.fold_pair(key, None, ticket);
                }
                Ok(_) => {}
                Err(e) if e.is_interruption() => return Err(e),
                Err(e) => {
                    ticket.wait_interruptible()?;
                    self.inner.acc.lock().record_error(e);
                    return Ok(Flow::Abort);
                }
            }
        }
        self.inner.fold_pair(key, Some(row), ticket)
    }
}

/// Secondary-index maintenance collaborator: derives the index entries a
/// row produces under one index definition. Not part of this engine; the
/// post-construction callback consumes it.
pub trait IndexKeyer: Send + Sync {
    fn compute_keys(
        &self,
        primary_key: &[u8],
        row: &Datum,
    ) -> ScanResult<SmallVec<[(Vec<u8>, Vec<u8>); 4]>>;
}

/// Sink for derived index entries. Writes may land in any order.
pub trait IndexWriter: Send + Sync {
    fn write_entries(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> ScanResult<()>;
}

impl<W: IndexWriter + ?Sized> IndexWriter for &W {
    fn write_entries(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> ScanResult<()> {
        (**self).write_entries(entries)
    }
}

impl IndexWriter for MemIndex {
    fn write_entries(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> ScanResult<()> {
        for (key, value) in entries {
            self.insert_raw(key.clone(), value.clone());
        }
        Ok(())
    }
}

/// Index post-construction: re-derive secondary-index entries for every row
/// in the range and write them. The writes themselves need no ordering; the
/// ticket only serializes advancement of the post-construction watermark.
pub struct PostConstructionCallback<K, W> {
    keyer: K,
    writer: W,
    direction: Direction,
    watermark: Mutex<Option<Vec<u8>>>,
}

impl<K: IndexKeyer, W: IndexWriter> PostConstructionCallback<K, W> {
    pub fn new(keyer: K, writer: W, direction: Direction) -> Self {
        Self {
            keyer,
            writer,
            direction,
            watermark: Mutex::new(None),
        }
    }

    /// Rightmost (leftmost for backward) key whose index entries are fully
    /// written, the resumption point for an interrupted build.
    pub fn watermark(&self) -> Option<Vec<u8>> {
        self.watermark.lock().clone()
    }
}

impl<K: IndexKeyer, W: IndexWriter> TraversalCallback for PostConstructionCallback<K, W> {
    fn handle_pair(&self, key: &[u8], row: &mut RowHandle, ticket: &Ticket) -> ScanResult<Flow> {
        // Borrowed view: the entries are derived and written before the
        // handle goes away, nothing is copied out.
        let entries = self.keyer.compute_keys(key, row.datum()?)?;
        self.writer.write_entries(&entries)?;
        row.release();

        ticket.wait_interruptible()?;
        let mut watermark = self.watermark.lock();
        let advanced = match (&*watermark, self.direction) {
            (None, _) => true,
            (Some(wm), Direction::Forward) => key > wm.as_slice(),
            (Some(wm), Direction::Backward) => key < wm.as_slice(),
        };
        if advanced {
            *watermark = Some(key.to_vec());
        }
        Ok(Flow::Continue)
    }
}

/// Single-field index keyer: index key is the truncated, order-preserving
/// encoding of one field followed by the primary key; the stored value is
/// the primary key for lookback.
pub struct FieldKeyer {
    field: String,
}

impl FieldKeyer {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl IndexKeyer for FieldKeyer {
    fn compute_keys(
        &self,
        primary_key: &[u8],
        row: &Datum,
    ) -> ScanResult<SmallVec<[(Vec<u8>, Vec<u8>); 4]>> {
        let value = match row.get_field(&self.field) {
            Ok(value) => value,
            // Rows without the field simply produce no index entries.
            Err(ScanError::MissingField(_)) => return Ok(SmallVec::new()),
            Err(e) => return Err(e),
        };
        let mut index_key = truncate_key(&value.group_key()).to_vec();
        index_key.push(0x00);
        index_key.extend_from_slice(primary_key);
        Ok(smallvec![(index_key, primary_key.to_vec())])
    }
}
