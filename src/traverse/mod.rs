//! # Concurrent Traversal Engine
//!
//! Walks an index snapshot over a key range, materializing values off
//! storage in parallel while guaranteeing that every ordered-phase effect
//! happens in strict key order, exactly as if the scan were
//! single-threaded.
//!
//! ## Pipeline
//!
//! ```text
//!  producer (key order)            bounded worker pool (any order)
//! ┌─────────────────────┐   jobs  ┌──────────────────────────────────┐
//! │ walk leaf entries   │ ──────► │ decode value (unordered phase)   │
//! │ issue FIFO ticket   │  queue  │ callback.handle_pair(key, row,   │
//! │ per entry, in order │         │   ticket), waits if it needs     │
//! └─────────────────────┘         │   ordering (ordered phase)       │
//!                                 └──────────────────────────────────┘
//! ```
//!
//! The ticket is issued *before* the entry enters the pool, so ticket order
//! equals key-visitation order. The engine never waits on the ticket itself:
//! a callback that needs no ordering (pure pre-filtering) skips the wait for
//! extra parallelism.
//!
//! ## Abort and Interruption
//!
//! `Abort` from a callback stops admission and triggers a traversal-local
//! drain interruptor: tickets still blocked in `wait_interruptible` raise
//! promptly and retire via `Drop`, so no ordered-phase effect lands past the
//! aborting key and no peer deadlocks. A caller-level interruption takes the
//! same path but is re-raised as [`ScanError::Interrupted`] after the pool
//! joins. Materialization errors are fatal to the traversal and surface the
//! same way, with all in-flight tickets retired first.
//!
//! ## Resource Bounds
//!
//! At most `concurrency` values are being materialized at any instant (one
//! per worker), with at most the same number of raw entries prefetched in
//! the queue, independent of range size.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::datum::Datum;
use crate::errors::{ScanError, ScanResult};
use crate::fifo::{FifoEnforcer, Ticket};
use crate::index::{RawValue, Snapshot};
use crate::interrupt::Interruptor;
use crate::key::{Direction, Flow, KeyRange};

mod callback;

pub use callback::{
    FieldKeyer, GeoCandidateCallback, IndexKeyer, IndexWriter, PostConstructionCallback,
    RangeScanCallback, TraversalCallback,
};

/// Default number of concurrently materializing values.
pub const DEFAULT_CONCURRENCY: usize = 8;

const QUEUE_POLL: Duration = Duration::from_millis(1);

/// Whether the traversal releases the snapshot itself or leaves it to the
/// caller (needed when several traversals run against the same write
/// transaction's snapshot in sequence).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleasePolicy {
    ReleaseWhenDone,
    Keep,
}

#[derive(Debug, Clone, Copy)]
pub struct TraversalConfig {
    pub direction: Direction,
    pub release: ReleasePolicy,
    /// Admission limit for the unordered phase; also the worker count.
    pub concurrency: usize,
}

impl TraversalConfig {
    pub fn forward() -> Self {
        Self {
            direction: Direction::Forward,
            release: ReleasePolicy::ReleaseWhenDone,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn backward() -> Self {
        Self {
            direction: Direction::Backward,
            ..Self::forward()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn keep_snapshot(mut self) -> Self {
        self.release = ReleasePolicy::Keep;
        self
    }
}

/// A lazily materialized row, exclusively owned by the traversal until the
/// callback copies it out or releases it.
///
/// The handle is a tagged state, not a shared pointer: a borrowed view
/// (`datum()`) is valid only until `handle_pair` returns, and `extract()`
/// converts to an owned copy, after which the backing reference is gone.
/// Referencing a released row is an error, never a dangling read.
#[derive(Debug)]
pub struct RowHandle {
    state: RowState,
}

#[derive(Debug)]
enum RowState {
    Loaded(Datum),
    Released,
}

impl RowHandle {
    pub(crate) fn loaded(datum: Datum) -> Self {
        Self {
            state: RowState::Loaded(datum),
        }
    }

    /// Borrowed view into the materialized row. Valid only for the duration
    /// of the callback invocation.
    pub fn datum(&self) -> ScanResult<&Datum> {
        match &self.state {
            RowState::Loaded(datum) => Ok(datum),
            RowState::Released => Err(ScanError::Storage("row referenced after release".into())),
        }
    }

    /// Take the row as an owned copy, releasing the backing reference.
    pub fn extract(&mut self) -> ScanResult<Datum> {
        match std::mem::replace(&mut self.state, RowState::Released) {
            RowState::Loaded(datum) => Ok(datum),
            RowState::Released => Err(ScanError::Storage("row extracted after release".into())),
        }
    }

    /// Drop the backing reference without copying the value out.
    pub fn release(&mut self) {
        self.state = RowState::Released;
    }

    pub fn is_released(&self) -> bool {
        matches!(self.state, RowState::Released)
    }
}

struct Job {
    key: Vec<u8>,
    raw: RawValue,
    ticket: Ticket,
}

struct QueueState {
    jobs: VecDeque<Job>,
    closed: bool,
}

/// Bounded admission queue between the ordered producer and the unordered
/// worker pool.
struct WorkQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl WorkQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Block until there is room, then enqueue. Returns false (dropping the
    /// job, which retires its ticket) once `stop` fires while waiting.
    fn push(&self, job: Job, stop: &Interruptor) -> bool {
        let mut state = self.state.lock();
        while state.jobs.len() >= self.capacity {
            if stop.is_triggered() {
                return false;
            }
            self.not_full.wait_for(&mut state, QUEUE_POLL);
        }
        state.jobs.push_back(job);
        drop(state);
        self.not_empty.notify_one();
        true
    }

    /// Dequeue the next job; `None` once the queue is closed and drained.
    fn pop(&self) -> Option<Job> {
        let mut state = self.state.lock();
        loop {
            if let Some(job) = state.jobs.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(job);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait_for(&mut state, QUEUE_POLL);
        }
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

/// Traversal entry point.
///
/// Walks qualifying leaf entries of `range` in `config.direction`, decoding
/// values on a bounded pool and invoking `callback` with a FIFO ticket per
/// entry. Returns the final continuation outcome, or the first error
/// recorded by the walk, the decode phase, or a callback, with every
/// admitted ticket retired on all paths.
pub fn traverse<S, C>(
    snapshot: &S,
    range: &KeyRange,
    callback: &C,
    config: &TraversalConfig,
    interruptor: &Interruptor,
) -> ScanResult<Flow>
where
    S: Snapshot + ?Sized,
    C: TraversalCallback + ?Sized,
{
    let concurrency = config.concurrency.max(1);
    let drain = interruptor.child();
    let fifo = FifoEnforcer::new(drain.clone());
    let queue = WorkQueue::new(concurrency);
    let aborted = AtomicBool::new(false);
    let failure: Mutex<Option<ScanError>> = Mutex::new(None);

    debug!(concurrency, direction = ?config.direction, "traversal start");

    let walk_flow = thread::scope(|scope| {
        for _ in 0..concurrency {
            scope.spawn(|| {
                worker_loop(
                    snapshot,
                    callback,
                    &queue,
                    &aborted,
                    &drain,
                    interruptor,
                    &failure,
                );
            });
        }

        let walked = snapshot.for_each_entry(range, config.direction, &mut |key, raw| {
            if aborted.load(Ordering::Acquire) || drain.is_triggered() {
                return Ok(Flow::Abort);
            }
            // Ticket before admission: ticket order == key order.
            let ticket = fifo.enter();
            let admitted = queue.push(
                Job {
                    key: key.to_vec(),
                    raw,
                    ticket,
                },
                &drain,
            );
            Ok(if admitted { Flow::Continue } else { Flow::Abort })
        });
        queue.close();

        match walked {
            Ok(flow) => flow,
            Err(e) => {
                record_failure(&failure, e);
                aborted.store(true, Ordering::Release);
                drain.trigger();
                Flow::Abort
            }
        }
    });

    if config.release == ReleasePolicy::ReleaseWhenDone {
        snapshot.release();
    }

    if let Some(error) = failure.into_inner() {
        debug!(%error, "traversal failed");
        return Err(error);
    }
    interruptor.check()?;

    let flow = if aborted.load(Ordering::Acquire) || walk_flow.is_abort() {
        Flow::Abort
    } else {
        Flow::Continue
    };
    debug!(tickets = fifo.issued(), outcome = ?flow, "traversal done");
    Ok(flow)
}

fn worker_loop<S, C>(
    snapshot: &S,
    callback: &C,
    queue: &WorkQueue,
    aborted: &AtomicBool,
    drain: &Interruptor,
    interruptor: &Interruptor,
    failure: &Mutex<Option<ScanError>>,
) where
    S: Snapshot + ?Sized,
    C: TraversalCallback + ?Sized,
{
    while let Some(job) = queue.pop() {
        let Job { key, raw, ticket } = job;

        if aborted.load(Ordering::Acquire) || drain.is_triggered() {
            // Retire the ticket without side effects; peers may be waiting
            // on its turn.
            drop(ticket);
            continue;
        }

        let datum = match snapshot.decode_value(&raw) {
            Ok(datum) => datum,
            Err(e) => {
                record_failure(failure, e);
                aborted.store(true, Ordering::Release);
                drain.trigger();
                drop(ticket);
                continue;
            }
        };

        let mut row = RowHandle::loaded(datum);
        let result = callback.handle_pair(&key, &mut row, &ticket);
        // The ticket must outlive the abort decision: the drain trigger has
        // to be visible before this ticket's turn is handed to its
        // successor, or the successor could slip one ordered effect past
        // the aborting key.
        match result {
            Ok(Flow::Continue) => {}
            Ok(Flow::Abort) => {
                aborted.store(true, Ordering::Release);
                drain.trigger();
            }
            Err(ScanError::Interrupted) => {
                if interruptor.is_triggered() {
                    record_failure(failure, ScanError::Interrupted);
                }
                // Otherwise this is the drain of an already-aborted
                // traversal; the pair was never folded.
            }
            Err(e) => {
                record_failure(failure, e);
                aborted.store(true, Ordering::Release);
                drain.trigger();
            }
        }
        drop(ticket);
    }
}

fn record_failure(failure: &Mutex<Option<ScanError>>, error: ScanError) {
    let mut slot = failure.lock();
    if slot.is_none() {
        *slot = Some(error);
    }
}
