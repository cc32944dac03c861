//! # Cancellation Token
//!
//! `Interruptor` is the explicit cancellation token threaded through every
//! blocking call in the engine. Triggering it makes every blocked
//! `wait_interruptible` raise [`ScanError::Interrupted`](crate::ScanError)
//! promptly; in-flight tickets are still retired so no peer deadlocks.
//!
//! Tokens chain: `child()` produces a token that observes its parent. The
//! traversal engine uses this to drain its own pipeline on an internal abort
//! without touching the caller's token, while still observing a caller-level
//! cancel through the same handle.
//!
//! Timeouts are not native to this layer; a caller implements them by
//! triggering the interruptor from outside.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::{ScanError, ScanResult};

#[derive(Debug, Clone, Default)]
pub struct Interruptor {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<Interruptor>>,
}

impl Interruptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that fires when either it or `self` is triggered. Triggering
    /// the child never propagates upward.
    pub fn child(&self) -> Interruptor {
        Interruptor {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::new(self.clone())),
        }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        if self.flag.load(Ordering::Acquire) {
            return true;
        }
        match &self.parent {
            Some(parent) => parent.is_triggered(),
            None => false,
        }
    }

    /// Check-and-raise form used at every suspension point.
    pub fn check(&self) -> ScanResult<()> {
        if self.is_triggered() {
            Err(ScanError::Interrupted)
        } else {
            Ok(())
        }
    }
}
