//! # Batched Replace Pipeline
//!
//! Point-write counterpart of the traversal engine: a batch of keyed replace
//! requests evaluates its user function concurrently, but every commit takes
//! a FIFO ticket first, so writes land in the caller's request order: the
//! same "concurrent work, ordered effects" shape as a scan, pointed at the
//! mutation path instead of the read path.
//!
//! ```text
//!  requests (positional)       bounded pool              commits
//! ┌────────────────────┐ ──► evaluate f(old)  ──► wait ticket, commit
//! │ ticket per request │      (any order)          (request order)
//! └────────────────────┘
//! ```
//!
//! Per-request failures (row-eval errors, an f that returns something other
//! than an object or `Null`) are data: they become [`ReplaceOutcome::Error`]
//! at that position and do not disturb their neighbors. Interruption is
//! control flow: the whole batch returns `Err`, with every ticket retired.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use parking_lot::Mutex;
use tracing::trace;

use crate::datum::Datum;
use crate::errors::ScanError;
use crate::fifo::FifoEnforcer;
use crate::index::MemIndex;
use crate::interrupt::Interruptor;
use crate::transform::UserFn;

/// Per-request result, reported at the request's position in the batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplaceOutcome {
    /// The new value was committed (a `Null` result deletes the key).
    Replaced,
    /// f returned a value equal to the current one; nothing was written.
    Unchanged,
    /// This request failed; the rest of the batch is unaffected.
    Error(ScanError),
}

/// Apply `f` to the current value of each key (`Null` for absent keys) and
/// commit the results, at most `concurrency` evaluations in flight. Commits
/// observe the order of `keys` regardless of how evaluations interleave.
pub fn batched_replace(
    index: &MemIndex,
    keys: &[Vec<u8>],
    f: &UserFn,
    concurrency: usize,
    interruptor: &Interruptor,
) -> eyre::Result<Vec<ReplaceOutcome>> {
    run_batched_replace(index, keys, f, concurrency, interruptor, |_| {})
}

fn run_batched_replace(
    index: &MemIndex,
    keys: &[Vec<u8>],
    f: &UserFn,
    concurrency: usize,
    interruptor: &Interruptor,
    observe_commit: impl Fn(usize) + Sync,
) -> eyre::Result<Vec<ReplaceOutcome>> {
    let concurrency = concurrency.max(1).min(keys.len().max(1));
    let fifo = FifoEnforcer::new(interruptor.clone());
    // Tickets issued up front in request order; position i holds seq i.
    let tickets: Mutex<Vec<_>> = Mutex::new(
        keys.iter()
            .map(|_| Some(fifo.enter()))
            .collect(),
    );
    let cursor = AtomicUsize::new(0);
    let outcomes: Mutex<Vec<Option<ReplaceOutcome>>> = Mutex::new(vec![None; keys.len()]);

    thread::scope(|scope| {
        for _ in 0..concurrency {
            scope.spawn(|| loop {
                let pos = cursor.fetch_add(1, Ordering::Relaxed);
                if pos >= keys.len() {
                    return;
                }
                let ticket = match tickets.lock()[pos].take() {
                    Some(ticket) => ticket,
                    None => return,
                };
                if interruptor.is_triggered() {
                    // Retire the ticket so ordered peers are not wedged; the
                    // batch-level Err is raised after the join.
                    drop(ticket);
                    continue;
                }

                let outcome = match evaluate(index, &keys[pos], f) {
                    Ok(Some(new_value)) => match ticket.wait_interruptible() {
                        Ok(()) => {
                            index.commit(&keys[pos], &new_value);
                            observe_commit(pos);
                            trace!(position = pos, "replace committed");
                            ReplaceOutcome::Replaced
                        }
                        Err(_) => {
                            drop(ticket);
                            continue;
                        }
                    },
                    Ok(None) => ReplaceOutcome::Unchanged,
                    Err(e) if e.is_interruption() => {
                        drop(ticket);
                        continue;
                    }
                    Err(e) => ReplaceOutcome::Error(e),
                };
                outcomes.lock()[pos] = Some(outcome);
            });
        }
    });

    interruptor.check()?;

    let mut results = Vec::with_capacity(keys.len());
    for slot in outcomes.into_inner() {
        match slot {
            Some(outcome) => results.push(outcome),
            None => eyre::bail!("replace batch abandoned a request without an outcome"),
        }
    }
    Ok(results)
}

/// Evaluate one request. `Ok(Some(v))` means commit `v`, `Ok(None)` means the
/// value is unchanged, `Err` is the per-request failure.
fn evaluate(index: &MemIndex, key: &[u8], f: &UserFn) -> Result<Option<Datum>, ScanError> {
    let old = index.get(key)?.unwrap_or(Datum::Null);
    let new = f(&old)?;
    match &new {
        Datum::Object(_) | Datum::Null => {}
        other => {
            return Err(ScanError::row_eval(format!(
                "replace must produce an object or null, got {}",
                other.type_name()
            )))
        }
    }
    if new == old {
        return Ok(None);
    }
    Ok(Some(new))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn seeded() -> MemIndex {
        let index = MemIndex::new();
        for (key, v) in [("a", 1i64), ("b", 2), ("c", 3)] {
            index.insert(
                key.as_bytes().to_vec(),
                &Datum::object([("v", Datum::Int(v))]),
            );
        }
        index
    }

    #[test]
    fn replaces_deletes_and_reports_positionally() {
        let index = seeded();
        let f: UserFn = Arc::new(|old| match old.get_field("v")? {
            Datum::Int(1) => Ok(Datum::object([("v", Datum::Int(10))])),
            Datum::Int(2) => Ok(Datum::Null), // delete
            _ => Ok(old.clone()),             // unchanged
        });
        let keys = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        let outcomes =
            batched_replace(&index, &keys, &f, 3, &Interruptor::new()).unwrap();
        assert_eq!(
            outcomes,
            vec![
                ReplaceOutcome::Replaced,
                ReplaceOutcome::Replaced,
                ReplaceOutcome::Unchanged,
            ]
        );
        assert_eq!(
            index.get(b"a").unwrap(),
            Some(Datum::object([("v", Datum::Int(10))]))
        );
        assert_eq!(index.get(b"b").unwrap(), None);
    }

    #[test]
    fn bad_result_type_is_positional_not_fatal() {
        let index = seeded();
        let f: UserFn = Arc::new(|old| match old.get_field("v")? {
            Datum::Int(2) => Ok(Datum::Int(42)), // not an object
            _ => Ok(Datum::Null),
        });
        let keys = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        let outcomes =
            batched_replace(&index, &keys, &f, 2, &Interruptor::new()).unwrap();
        assert_eq!(outcomes[0], ReplaceOutcome::Replaced);
        assert!(matches!(outcomes[1], ReplaceOutcome::Error(ScanError::RowEval(_))));
        assert_eq!(outcomes[2], ReplaceOutcome::Replaced);
        // The failed request wrote nothing.
        assert!(index.get(b"b").unwrap().is_some());
    }

    #[test]
    fn absent_key_evaluates_from_null() {
        let index = MemIndex::new();
        let f: UserFn = Arc::new(|old| {
            assert_eq!(old, &Datum::Null);
            Ok(Datum::object([("v", Datum::Int(7))]))
        });
        let keys = vec![b"new".to_vec()];
        let outcomes =
            batched_replace(&index, &keys, &f, 1, &Interruptor::new()).unwrap();
        assert_eq!(outcomes, vec![ReplaceOutcome::Replaced]);
        assert_eq!(
            index.get(b"new").unwrap(),
            Some(Datum::object([("v", Datum::Int(7))]))
        );
    }

    #[test]
    fn commits_land_in_request_order_despite_slow_early_evals() {
        let count = 12usize;
        let index = MemIndex::new();
        let keys: Vec<Vec<u8>> = (0..count).map(|i| format!("k{i:02}").into_bytes()).collect();
        for (i, key) in keys.iter().enumerate() {
            index.insert(key.clone(), &Datum::object([("pos", Datum::Int(i as i64))]));
        }
        // Earlier requests evaluate slower, so the pool finishes them last;
        // the tickets must still serialize the commits back into order.
        let f: UserFn = Arc::new(move |old| {
            if let Datum::Int(pos) = old.get_field("pos")? {
                std::thread::sleep(Duration::from_millis((count as i64 - pos) as u64));
            }
            Ok(Datum::object([("done", Datum::Bool(true))]))
        });
        let order = Mutex::new(Vec::new());
        let outcomes = run_batched_replace(&index, &keys, &f, 4, &Interruptor::new(), |pos| {
            order.lock().push(pos)
        })
        .unwrap();
        assert!(outcomes.iter().all(|o| *o == ReplaceOutcome::Replaced));
        assert_eq!(order.into_inner(), (0..count).collect::<Vec<usize>>());
    }

    #[test]
    fn interruption_fails_the_batch() {
        let index = seeded();
        let interruptor = Interruptor::new();
        interruptor.trigger();
        let f: UserFn = Arc::new(|old| Ok(old.clone()));
        let keys = vec![b"a".to_vec(), b"b".to_vec()];
        let res = batched_replace(&index, &keys, &f, 2, &interruptor);
        assert!(res.is_err());
        // Nothing was committed.
        assert_eq!(
            index.get(b"a").unwrap(),
            Some(Datum::object([("v", Datum::Int(1))]))
        );
    }
}
