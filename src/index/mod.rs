//! # Index Collaborator Seam
//!
//! The on-disk node format, page cache, and write-ahead logging are external
//! collaborators. The traversal engine only needs two things from them:
//!
//! 1. an ordered walk over the leaf entries of a key range, handing out each
//!    entry's *raw* (still-encoded) value cheaply, and
//! 2. an expensive decode step it can run concurrently from worker tasks.
//!
//! [`Snapshot`] is that seam. The cheap walk is the ordered phase driven by
//! the producer; [`Snapshot::decode_value`] is the unordered phase, and
//! deserialization, decompression, and overflow-chain follow-through all
//! live behind it.
//!
//! [`MemIndex`] is the in-memory implementation: a `BTreeMap` of encoded
//! datums behind a `parking_lot::RwLock`, with immutable snapshot views. It
//! stands in for the real pager in tests and for the replace pipeline's
//! mutation lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::datum::Datum;
use crate::errors::{ScanError, ScanResult};
use crate::key::{Direction, Flow, KeyRange};

/// Encoded value bytes as stored in a leaf entry. Reference-counted so the
/// walk can hand them to worker tasks without copying.
pub type RawValue = Arc<[u8]>;

/// Read view of an index at a point in time.
///
/// The traversal engine exclusively owns the snapshot reference for the
/// duration of a walk; `release()` drops whatever backing resources the
/// implementation holds, after which further calls must fail.
pub trait Snapshot: Send + Sync {
    /// Walk qualifying leaf entries of `range` in key order for `dir`,
    /// calling `visit` for each. Stops early when `visit` returns
    /// [`Flow::Abort`].
    fn for_each_entry(
        &self,
        range: &KeyRange,
        dir: Direction,
        visit: &mut dyn FnMut(&[u8], RawValue) -> ScanResult<Flow>,
    ) -> ScanResult<Flow>;

    /// Materialize one entry's value. May block on I/O; safe to call from
    /// multiple worker tasks concurrently.
    fn decode_value(&self, raw: &RawValue) -> ScanResult<Datum>;

    /// Drop the backing storage reference. Honored by the traversal when
    /// its release policy is `ReleaseWhenDone`.
    fn release(&self);
}

/// Mutable in-memory ordered index of encoded datums.
#[derive(Debug, Default)]
pub struct MemIndex {
    tree: RwLock<BTreeMap<Vec<u8>, RawValue>>,
}

impl MemIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<Vec<u8>>, value: &Datum) {
        let raw: RawValue = value.to_bytes().into();
        self.tree.write().insert(key.into(), raw);
    }

    /// Insert an already-encoded value, as index builders produce them.
    pub fn insert_raw(&self, key: impl Into<Vec<u8>>, raw: impl Into<RawValue>) {
        self.tree.write().insert(key.into(), raw.into());
    }

    pub fn remove(&self, key: &[u8]) -> bool {
        self.tree.write().remove(key).is_some()
    }

    pub fn get(&self, key: &[u8]) -> ScanResult<Option<Datum>> {
        match self.tree.read().get(key) {
            Some(raw) => decode_raw(raw).map(Some),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.read().is_empty()
    }

    /// Commit a replace outcome under the index's write lock. `Null` deletes
    /// the key. Used by the batched-write pipeline after its FIFO turn.
    pub fn commit(&self, key: &[u8], value: &Datum) {
        match value {
            Datum::Null => {
                self.tree.write().remove(key);
            }
            other => {
                let raw: RawValue = other.to_bytes().into();
                self.tree.write().insert(key.to_vec(), raw);
            }
        }
    }

    /// Frozen view for one traversal. Cloning the tree stands in for the
    /// real pager's page-level snapshot; values are refcounted so the clone
    /// is shallow.
    pub fn snapshot(&self) -> MemSnapshot {
        MemSnapshot {
            tree: self.tree.read().clone(),
            released: AtomicBool::new(false),
        }
    }
}

/// Immutable point-in-time view over a [`MemIndex`].
#[derive(Debug)]
pub struct MemSnapshot {
    tree: BTreeMap<Vec<u8>, RawValue>,
    released: AtomicBool,
}

impl MemSnapshot {
    fn check_live(&self) -> ScanResult<()> {
        if self.released.load(Ordering::Acquire) {
            return Err(ScanError::Storage(
                "snapshot used after release".to_string(),
            ));
        }
        Ok(())
    }
}

impl Snapshot for MemSnapshot {
    fn for_each_entry(
        &self,
        range: &KeyRange,
        dir: Direction,
        visit: &mut dyn FnMut(&[u8], RawValue) -> ScanResult<Flow>,
    ) -> ScanResult<Flow> {
        self.check_live()?;
        let bounds = (range.start.clone(), range.end.clone());
        match dir {
            Direction::Forward => {
                for (key, raw) in self.tree.range(bounds) {
                    if visit(key, Arc::clone(raw))?.is_abort() {
                        return Ok(Flow::Abort);
                    }
                }
            }
            Direction::Backward => {
                for (key, raw) in self.tree.range(bounds).rev() {
                    if visit(key, Arc::clone(raw))?.is_abort() {
                        return Ok(Flow::Abort);
                    }
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn decode_value(&self, raw: &RawValue) -> ScanResult<Datum> {
        self.check_live()?;
        decode_raw(raw)
    }

    fn release(&self) {
        self.released.store(true, Ordering::Release);
    }
}

fn decode_raw(raw: &RawValue) -> ScanResult<Datum> {
    Datum::decode(raw).map_err(|e| ScanError::Storage(format!("{e:#}")))
}
