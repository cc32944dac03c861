//! # Terminal Reducers
//!
//! A terminal consumes the transformed row stream and folds it into one
//! per-group accumulator value. The set is closed and dispatched by `match`:
//! `count`, `sum`, `average`, `min`, `max`, `reduce(binary_fn)`, and the
//! row-buffering `append` terminal.
//!
//! Numeric sums track int and float contributions separately and collapse at
//! finalize, so an all-integer stream produces an integer result instead of
//! being widened through f64.
//!
//! Each terminal defines three operations:
//! - `accumulate(state, key, row)`: fold one row, ordered phase only;
//! - `merge(state, other)`: the associative/commutative unshard primitive;
//! - `finalize(state)`: produce the result, raising the empty-aggregate
//!   error where no identity element exists (`average`, `min`, `max`,
//!   `reduce`); `count` and `sum` finalize an empty stream to `0`.

use crate::datum::Datum;
use crate::errors::{ScanError, ScanResult};
use crate::transform::BinFn;

use super::BatchSpec;

#[derive(Clone)]
pub enum Terminal {
    Count,
    Sum,
    Average,
    Min,
    Max,
    Reduce(BinFn),
    /// Raw row buffering, bounded by the batch budget in
    /// [`GroupedAccumulator`](super::GroupedAccumulator).
    Append(BatchSpec),
}

impl std::fmt::Debug for Terminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind().name())
    }
}

/// Reducer kind tag carried by partial results so that merge compatibility
/// can be checked without the (unserializable) reduce function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    Count,
    Sum,
    Average,
    Min,
    Max,
    Reduce,
    Append,
}

impl TerminalKind {
    pub fn name(self) -> &'static str {
        match self {
            TerminalKind::Count => "count",
            TerminalKind::Sum => "sum",
            TerminalKind::Average => "average",
            TerminalKind::Min => "min",
            TerminalKind::Max => "max",
            TerminalKind::Reduce => "reduce",
            TerminalKind::Append => "append",
        }
    }
}

/// Int/float split accumulator for `sum` and `average`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NumSum {
    pub int: i64,
    pub float: f64,
    pub any_float: bool,
}

impl NumSum {
    fn fold(&mut self, row: &Datum) -> ScanResult<()> {
        match row {
            Datum::Int(v) => self.int += v,
            Datum::Float(v) => {
                self.float += v;
                self.any_float = true;
            }
            other => {
                return Err(ScanError::row_eval(format!(
                    "expected a number, got {}",
                    other.type_name()
                )))
            }
        }
        Ok(())
    }

    fn add(&mut self, other: &NumSum) {
        self.int += other.int;
        self.float += other.float;
        self.any_float |= other.any_float;
    }

    fn as_f64(&self) -> f64 {
        self.int as f64 + self.float
    }

    fn finalize(&self) -> Datum {
        if self.any_float {
            Datum::Float(self.as_f64())
        } else {
            Datum::Int(self.int)
        }
    }
}

/// Per-group accumulator value. Variant always matches the owning terminal's
/// kind; the engine never mixes them.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalState {
    Count(u64),
    Sum(NumSum),
    Average { sum: NumSum, count: u64 },
    /// Candidate optimum row for `min`/`max`.
    Optimum(Option<Datum>),
    /// Running combination for `reduce`.
    Reduced(Option<Datum>),
    /// Buffered `(primary_key, row)` pairs for `append`.
    Rows(Vec<(Vec<u8>, Datum)>),
}

impl Terminal {
    pub fn kind(&self) -> TerminalKind {
        match self {
            Terminal::Count => TerminalKind::Count,
            Terminal::Sum => TerminalKind::Sum,
            Terminal::Average => TerminalKind::Average,
            Terminal::Min => TerminalKind::Min,
            Terminal::Max => TerminalKind::Max,
            Terminal::Reduce(_) => TerminalKind::Reduce,
            Terminal::Append(_) => TerminalKind::Append,
        }
    }

    pub fn batch_spec(&self) -> Option<&BatchSpec> {
        match self {
            Terminal::Append(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn new_state(&self) -> TerminalState {
        match self {
            Terminal::Count => TerminalState::Count(0),
            Terminal::Sum => TerminalState::Sum(NumSum::default()),
            Terminal::Average => TerminalState::Average {
                sum: NumSum::default(),
                count: 0,
            },
            Terminal::Min | Terminal::Max => TerminalState::Optimum(None),
            Terminal::Reduce(_) => TerminalState::Reduced(None),
            Terminal::Append(_) => TerminalState::Rows(Vec::new()),
        }
    }

    /// Fold one row. Returns true when the row contributed to the state,
    /// which is what the batcher counts against its row budget.
    pub fn accumulate(
        &self,
        state: &mut TerminalState,
        key: &[u8],
        row: Datum,
    ) -> ScanResult<bool> {
        match (self, state) {
            (Terminal::Count, TerminalState::Count(n)) => {
                *n += 1;
                Ok(true)
            }
            (Terminal::Sum, TerminalState::Sum(sum)) => {
                sum.fold(&row)?;
                Ok(true)
            }
            (Terminal::Average, TerminalState::Average { sum, count }) => {
                sum.fold(&row)?;
                *count += 1;
                Ok(true)
            }
            (Terminal::Min, TerminalState::Optimum(best)) => {
                let better = match best {
                    Some(current) => row.total_cmp(current).is_lt(),
                    None => true,
                };
                if better {
                    *best = Some(row);
                }
                Ok(true)
            }
            (Terminal::Max, TerminalState::Optimum(best)) => {
                let better = match best {
                    Some(current) => row.total_cmp(current).is_gt(),
                    None => true,
                };
                if better {
                    *best = Some(row);
                }
                Ok(true)
            }
            (Terminal::Reduce(f), TerminalState::Reduced(acc)) => {
                *acc = match acc.take() {
                    Some(current) => Some(f(&current, &row)?),
                    None => Some(row),
                };
                Ok(true)
            }
            (Terminal::Append(_), TerminalState::Rows(rows)) => {
                rows.push((key.to_vec(), row));
                Ok(true)
            }
            _ => Err(ScanError::row_eval(
                "terminal state does not match terminal kind",
            )),
        }
    }

    /// Associative, commutative merge of two same-kind states. The unshard
    /// primitive for one group.
    pub fn merge(&self, state: &mut TerminalState, other: TerminalState) -> ScanResult<()> {
        match (self, state, other) {
            (Terminal::Count, TerminalState::Count(a), TerminalState::Count(b)) => {
                *a += b;
                Ok(())
            }
            (Terminal::Sum, TerminalState::Sum(a), TerminalState::Sum(b)) => {
                a.add(&b);
                Ok(())
            }
            (
                Terminal::Average,
                TerminalState::Average { sum, count },
                TerminalState::Average {
                    sum: other_sum,
                    count: other_count,
                },
            ) => {
                sum.add(&other_sum);
                *count += other_count;
                Ok(())
            }
            (Terminal::Min, TerminalState::Optimum(a), TerminalState::Optimum(b)) => {
                if let Some(candidate) = b {
                    let better = match a {
                        Some(current) => candidate.total_cmp(current).is_lt(),
                        None => true,
                    };
                    if better {
                        *a = Some(candidate);
                    }
                }
                Ok(())
            }
            (Terminal::Max, TerminalState::Optimum(a), TerminalState::Optimum(b)) => {
                if let Some(candidate) = b {
                    let better = match a {
                        Some(current) => candidate.total_cmp(current).is_gt(),
                        None => true,
                    };
                    if better {
                        *a = Some(candidate);
                    }
                }
                Ok(())
            }
            (Terminal::Reduce(f), TerminalState::Reduced(a), TerminalState::Reduced(b)) => {
                *a = match (a.take(), b) {
                    (Some(x), Some(y)) => Some(f(&x, &y)?),
                    (Some(x), None) => Some(x),
                    (None, y) => y,
                };
                Ok(())
            }
            (Terminal::Append(_), TerminalState::Rows(a), TerminalState::Rows(b)) => {
                a.extend(b);
                Ok(())
            }
            _ => Err(ScanError::row_eval(
                "cannot merge partial results of different kinds",
            )),
        }
    }

    pub fn finalize(&self, state: TerminalState) -> ScanResult<Datum> {
        match (self, state) {
            (Terminal::Count, TerminalState::Count(n)) => Ok(Datum::Int(n as i64)),
            (Terminal::Sum, TerminalState::Sum(sum)) => Ok(sum.finalize()),
            (Terminal::Average, TerminalState::Average { sum, count }) => {
                if count == 0 {
                    Err(ScanError::EmptyAggregate("average"))
                } else {
                    Ok(Datum::Float(sum.as_f64() / count as f64))
                }
            }
            (Terminal::Min, TerminalState::Optimum(best)) => {
                best.ok_or(ScanError::EmptyAggregate("min"))
            }
            (Terminal::Max, TerminalState::Optimum(best)) => {
                best.ok_or(ScanError::EmptyAggregate("max"))
            }
            (Terminal::Reduce(_), TerminalState::Reduced(acc)) => {
                acc.ok_or(ScanError::EmptyAggregate("reduce"))
            }
            (Terminal::Append(_), TerminalState::Rows(rows)) => {
                Ok(Datum::Array(rows.into_iter().map(|(_, row)| row).collect()))
            }
            _ => Err(ScanError::row_eval(
                "terminal state does not match terminal kind",
            )),
        }
    }
}
