//! # Key-Ordering FIFO Enforcer
//!
//! The single synchronization primitive that makes "concurrent loads, ordered
//! effects" possible. Every unit of work entering the ordered phase takes a
//! [`Ticket`] via [`FifoEnforcer::enter`] (non-blocking, strictly increasing
//! sequence). [`Ticket::wait_interruptible`] then blocks until every earlier
//! ticket has been retired, so ordered-phase effects happen in admission
//! order no matter how the unordered phase overlapped in time.
//!
//! ## Turn Protocol
//!
//! ```text
//! enter()          wait_interruptible()        Drop
//!   seq = N   ───►   block until turn == N ───►  retire N, advance turn
//! ```
//!
//! The turn advances on `Drop`, not on `wait` return: a holder performs its
//! ordered work between the two, and the next ticket's wait returns only
//! after the previous holder exited its ordered section. A ticket dropped
//! without ever waiting still retires its turn: out-of-order drops are
//! parked in a retired set and the turn is advanced over every contiguously
//! retired sequence number. Without this, one abandoned ticket would wedge
//! the whole pipeline.
//!
//! ## Interruption
//!
//! Waiters poll the interruptor on a bounded `Condvar::wait_for` interval, so
//! a trigger raises [`ScanError::Interrupted`](crate::errors::ScanError) within the poll interval even
//! when no ticket is being retired. The interrupted ticket's `Drop` still
//! releases the turn, letting later waiters observe the interruption instead
//! of hanging.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::errors::ScanResult;
use crate::interrupt::Interruptor;

/// Poll interval for interruption checks while blocked on the turn condvar.
const WAIT_POLL: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct TurnState {
    /// Sequence number whose holder currently owns the ordered section.
    turn: u64,
    /// Tickets retired ahead of their turn. Bounded by the number of
    /// concurrently outstanding tickets.
    retired: BTreeSet<u64>,
}

#[derive(Debug)]
struct FifoShared {
    state: Mutex<TurnState>,
    turn_ready: Condvar,
}

/// Issues strictly ordered admission tickets for one logical scan. Not
/// shared across scans; each traversal owns its own enforcer.
#[derive(Debug)]
pub struct FifoEnforcer {
    shared: Arc<FifoShared>,
    next_seq: AtomicU64,
    interruptor: Interruptor,
}

impl FifoEnforcer {
    pub fn new(interruptor: Interruptor) -> Self {
        Self {
            shared: Arc::new(FifoShared {
                state: Mutex::new(TurnState {
                    turn: 0,
                    retired: BTreeSet::new(),
                }),
                turn_ready: Condvar::new(),
            }),
            next_seq: AtomicU64::new(0),
            interruptor,
        }
    }

    /// Admit one unit of work. Never blocks, always succeeds.
    pub fn enter(&self) -> Ticket {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        Ticket {
            seq,
            shared: Arc::clone(&self.shared),
            interruptor: self.interruptor.clone(),
        }
    }

    /// Number of tickets issued so far.
    pub fn issued(&self) -> u64 {
        self.next_seq.load(Ordering::Relaxed)
    }
}

/// Single-use admission token. The holder's ordered section spans from
/// `wait_interruptible` returning until the ticket is dropped.
#[derive(Debug)]
pub struct Ticket {
    seq: u64,
    shared: Arc<FifoShared>,
    interruptor: Interruptor,
}

impl Ticket {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Block until every earlier ticket has been retired, then return with
    /// the turn held. Raises [`ScanError::Interrupted`](crate::errors::ScanError)
    /// if the interruptor fires while blocked; the turn is released by `Drop`
    /// either way.
    pub fn wait_interruptible(&self) -> ScanResult<()> {
        let mut state = self.shared.state.lock();
        loop {
            if state.turn == self.seq {
                // Interruption is re-checked while holding the turn lock:
                // a predecessor that aborted triggers the interruptor
                // before retiring its ticket, so its successor observes the
                // trigger no later than the turn hand-off.
                self.interruptor.check()?;
                return Ok(());
            }
            self.interruptor.check()?;
            self.shared.turn_ready.wait_for(&mut state, WAIT_POLL);
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.retired.insert(self.seq);
        let mut advanced = false;
        loop {
            let turn = state.turn;
            if !state.retired.remove(&turn) {
                break;
            }
            state.turn += 1;
            advanced = true;
        }
        if advanced {
            self.shared.turn_ready.notify_all();
        }
    }
}
