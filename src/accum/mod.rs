//! # Accumulator / Sharding Framework
//!
//! [`GroupedAccumulator`] owns the per-group reducer state for one logical
//! scan of one sub-range. The traversal callback folds transformed batches
//! into it in strict key order (the FIFO ticket contract is what makes the
//! concurrent calls safe); when the scan finishes or stops early the
//! accumulator finalizes into a [`PartialResult`], and partials from
//! independently scanned sub-ranges merge through
//! [`unshard`](partial::unshard).
//!
//! ## State Machine
//!
//! ```text
//! Accumulating --(batch full)--> BatchReady
//! BatchReady   --(caller resumes)--> Accumulating
//! Accumulating --(range exhausted | externally aborted)--> Finished
//! ```
//!
//! `BatchReady` signals the traversal to stop *without* being a query-level
//! abort: the caller drains the batch (or finalizes this accumulator and
//! starts a fresh one on [`KeyRange::resume_after`] of the watermark) and
//! continues the scan.
//!
//! ## Watermark
//!
//! The watermark records the furthest key, in scan direction, whose row has
//! been durably folded. It never moves backward. A scan that runs to
//! completion advances it to the range's far boundary; an early stop leaves
//! it at exactly the last folded key, which is the resumption point.

use hashbrown::HashMap;

use crate::datum::Datum;
use crate::errors::ScanError;
use crate::key::{Direction, Flow, KeyRange};
use crate::transform::{Batch, UserFn};

pub mod partial;
pub mod terminal;

pub use partial::{unshard, AppendRow, FinalResult, PartialResult, RegionRows};
pub use terminal::{NumSum, Terminal, TerminalKind, TerminalState};

/// Batch budget: the accumulator reports `BatchReady` when either limit is
/// exceeded. Both unlimited means the scan never batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSpec {
    pub max_rows: Option<usize>,
    pub max_bytes: Option<usize>,
}

impl Default for BatchSpec {
    fn default() -> Self {
        Self {
            max_rows: Some(1024),
            max_bytes: Some(1 << 20),
        }
    }
}

impl BatchSpec {
    pub fn unlimited() -> Self {
        Self {
            max_rows: None,
            max_bytes: None,
        }
    }

    pub fn rows(max_rows: usize) -> Self {
        Self {
            max_rows: Some(max_rows),
            max_bytes: None,
        }
    }

    pub fn bytes(max_bytes: usize) -> Self {
        Self {
            max_rows: None,
            max_bytes: Some(max_bytes),
        }
    }

    fn is_met(&self, rows: usize, bytes: usize) -> bool {
        self.max_rows.is_some_and(|limit| rows >= limit)
            || self.max_bytes.is_some_and(|limit| bytes >= limit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumState {
    Accumulating,
    BatchReady,
    Finished,
}

/// Per-scan accumulator. Owned by exactly one logical scan; concurrent
/// access goes through `accumulate`/`finish` under the ticket-ordering
/// contract, never through shared field mutation.
#[derive(Debug)]
pub struct GroupedAccumulator {
    terminal: Terminal,
    direction: Direction,
    spec: BatchSpec,
    groups: Vec<(Option<Datum>, TerminalState)>,
    by_key: HashMap<Vec<u8>, usize>,
    batch_rows: usize,
    batch_bytes: usize,
    state: AccumState,
    watermark: Option<Vec<u8>>,
    error: Option<ScanError>,
}

impl GroupedAccumulator {
    /// Budget comes from the terminal for `append`, otherwise unlimited.
    pub fn new(terminal: Terminal, direction: Direction) -> Self {
        let spec = terminal
            .batch_spec()
            .copied()
            .unwrap_or_else(BatchSpec::unlimited);
        Self::with_batch(terminal, direction, spec)
    }

    pub fn with_batch(terminal: Terminal, direction: Direction, spec: BatchSpec) -> Self {
        Self {
            terminal,
            direction,
            spec,
            groups: Vec::new(),
            by_key: HashMap::new(),
            batch_rows: 0,
            batch_bytes: 0,
            state: AccumState::Accumulating,
            watermark: None,
            error: None,
        }
    }

    pub fn state(&self) -> AccumState {
        self.state
    }

    pub fn terminal(&self) -> &Terminal {
        &self.terminal
    }

    pub fn watermark(&self) -> Option<&[u8]> {
        self.watermark.as_deref()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Record a query-level row error. First error wins; groups folded
    /// before it stay intact and ride along in the partial result.
    pub fn record_error(&mut self, error: ScanError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Fold one transformed batch, visited at `key`. Returns [`Flow::Abort`]
    /// when the scan should stop: batch budget met (`BatchReady`), a row
    /// error was recorded, or the accumulator is already finished. Must be
    /// called in key order; the watermark asserts monotonicity.
    pub fn accumulate(
        &mut self,
        batch: Batch,
        key: &[u8],
        lazy_group: Option<&UserFn>,
    ) -> Flow {
        if self.state == AccumState::Finished || self.error.is_some() {
            return Flow::Abort;
        }
        self.note_key(key);

        for item in batch {
            let group = match (item.group, lazy_group) {
                (Some(group), _) => Some(group),
                (None, Some(f)) => match f(&item.row) {
                    Ok(group) => Some(group),
                    Err(e) => {
                        self.record_error(e);
                        return Flow::Abort;
                    }
                },
                (None, None) => None,
            };

            let bytes = item.row.approx_size();
            let slot = self.group_slot(group);
            match self
                .terminal
                .accumulate(&mut self.groups[slot].1, key, item.row)
            {
                Ok(contributed) => {
                    if contributed {
                        self.batch_rows += 1;
                        self.batch_bytes += bytes;
                    }
                }
                Err(e) => {
                    self.record_error(e);
                    return Flow::Abort;
                }
            }
        }

        if self.spec.is_met(self.batch_rows, self.batch_bytes) {
            self.state = AccumState::BatchReady;
            return Flow::Abort;
        }
        Flow::Continue
    }

    /// `BatchReady -> Accumulating`: the caller drained the batch and wants
    /// this accumulator to keep folding.
    pub fn resume(&mut self) {
        if self.state == AccumState::BatchReady {
            self.state = AccumState::Accumulating;
            self.batch_rows = 0;
            self.batch_bytes = 0;
        }
    }

    /// Finalize into a partial result and enter `Finished`. With
    /// `Flow::Continue` (range exhausted) the watermark advances to the
    /// range's far boundary; with `Flow::Abort` it stays at exactly the last
    /// folded key. Call once.
    pub fn finish(&mut self, outcome: Flow, range: &KeyRange) -> PartialResult {
        self.state = AccumState::Finished;
        if outcome == Flow::Continue {
            if let Some(boundary) = range.far_boundary(self.direction) {
                self.note_key(&boundary.to_vec());
            }
        }

        let mut partial = PartialResult::empty(self.terminal.kind(), self.direction);
        partial.error = self.error.take();

        let groups = std::mem::take(&mut self.groups);
        self.by_key.clear();

        if self.terminal.kind() == TerminalKind::Append {
            let mut rows = Vec::new();
            for (group, state) in groups {
                if let TerminalState::Rows(buffered) = state {
                    for (key, row) in buffered {
                        rows.push(AppendRow {
                            key,
                            group: group.clone(),
                            row,
                        });
                    }
                }
            }
            match self.direction {
                Direction::Forward => rows.sort_by(|a, b| a.key.cmp(&b.key)),
                Direction::Backward => rows.sort_by(|a, b| b.key.cmp(&a.key)),
            }
            partial.regions.push(RegionRows {
                rows,
                watermark: self.watermark.clone(),
            });
        } else {
            partial.groups = groups;
        }
        partial
    }

    /// Advance the watermark; it never moves backward in scan direction.
    fn note_key(&mut self, key: &[u8]) {
        let moved_forward = match (&self.watermark, self.direction) {
            (None, _) => true,
            (Some(wm), Direction::Forward) => key > wm.as_slice(),
            (Some(wm), Direction::Backward) => key < wm.as_slice(),
        };
        if moved_forward {
            self.watermark = Some(key.to_vec());
        }
    }

    fn group_slot(&mut self, group: Option<Datum>) -> usize {
        let encoded = match &group {
            Some(datum) => datum.group_key(),
            None => Vec::new(),
        };
        match self.by_key.get(&encoded) {
            Some(&slot) => slot,
            None => {
                let slot = self.groups.len();
                self.by_key.insert(encoded, slot);
                self.groups.push((group, self.terminal.new_state()));
                slot
            }
        }
    }
}
