//! # Error Taxonomy
//!
//! Typed errors for the scan engine. Four families matter to callers:
//!
//! | Variant | Meaning | Surfaces as |
//! |------------------|-----------------------------------------------|----------------------|
//! | `Interrupted` | Cooperative cancellation, not a data failure | "query cancelled" |
//! | `RowEval` | User-supplied function failed on a row | typed query error |
//! | `MissingField` | Row lacks a field a function required | typed query error |
//! | `EmptyAggregate` | Reducer with no identity saw zero rows | typed query error |
//! | `Storage` | Value materialization failed | internal error |
//!
//! `Interrupted` must unwind cleanly through every suspension point and is
//! never folded into accumulated state. `RowEval`/`MissingField` are recorded
//! into the partial result and stop the scan without corrupting groups that
//! were folded before the failure. `Storage` is always fatal to the current
//! traversal.
//!
//! Heterogeneous boundaries (index building, decode) use `eyre::Result`;
//! `ScanError` converts into `eyre::Report` via `std::error::Error`.

use std::fmt;

/// Engine-level result alias.
pub type ScanResult<T> = Result<T, ScanError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// The interruptor fired while this operation was blocked or about to
    /// block. Distinct from every failure mode.
    Interrupted,
    /// A user-supplied map/filter/reduce/replace function failed.
    RowEval(String),
    /// A row was missing a field a user function required. Kept separate
    /// from `RowEval` because `filter` treats it as a fallback condition
    /// rather than a failure.
    MissingField(String),
    /// `finalize` was called for a reducer with no identity element
    /// (`average`, `min`, `max`, `reduce`) on a group that saw zero rows.
    EmptyAggregate(&'static str),
    /// Value materialization failed at the storage layer. Fatal to the
    /// traversal, never skipped.
    Storage(String),
}

impl ScanError {
    pub fn row_eval(msg: impl Into<String>) -> Self {
        ScanError::RowEval(msg.into())
    }

    pub fn missing_field(name: impl Into<String>) -> Self {
        ScanError::MissingField(name.into())
    }

    pub fn is_interruption(&self) -> bool {
        matches!(self, ScanError::Interrupted)
    }
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::Interrupted => write!(f, "operation interrupted"),
            ScanError::RowEval(msg) => write!(f, "row evaluation failed: {msg}"),
            ScanError::MissingField(name) => {
                write!(f, "row has no field `{name}`")
            }
            ScanError::EmptyAggregate(kind) => {
                write!(f, "cannot compute `{kind}` of an empty stream")
            }
            ScanError::Storage(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl std::error::Error for ScanError {}
