//! # Transform Pipeline
//!
//! Per-row batch rewrites applied between decoding and terminal
//! accumulation. The op set is closed, so dispatch is a single `match` over
//! [`Transform`], with no virtual dispatch.
//!
//! Transforms are pure with respect to engine state: they run in the
//! traversal's *unordered* phase, before the callback waits on its ticket.
//! Only the fold into the accumulator needs ordering.
//!
//! | Op | Behavior |
//! |--------------|----------------------------------------------------------|
//! | `Map` | row := f(row) |
//! | `Filter` | keep rows where pred is truthy; missing-field fallback |
//! | `ConcatMap` | row := elements of f(row), flattened |
//! | `Distinct` | drop *adjacent* duplicates within the batch only |
//! | `Group` | re-key rows by computed group key(s) |
//! | `Zip` | merge a `{left, right}` join pair, preferring `right` |
//!
//! `Distinct` is deliberately not global: cross-batch distinctness is a
//! client concern layered on top of this engine.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::datum::Datum;
use crate::errors::{ScanError, ScanResult};

/// Opaque user-supplied row function. The expression-evaluation runtime
/// behind it is an external collaborator.
pub type UserFn = Arc<dyn Fn(&Datum) -> ScanResult<Datum> + Send + Sync>;

/// Opaque binary combiner for `reduce`.
pub type BinFn = Arc<dyn Fn(&Datum, &Datum) -> ScanResult<Datum> + Send + Sync>;

/// One row plus the group key the pipeline has assigned it (if any).
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    pub group: Option<Datum>,
    pub row: Datum,
}

impl BatchItem {
    pub fn ungrouped(row: Datum) -> Self {
        Self { group: None, row }
    }
}

/// Rows flowing between one traversal step and the accumulator. Small scans
/// stay off the heap.
pub type Batch = SmallVec<[BatchItem; 8]>;

/// ConcatMap drains each sub-sequence in chunks of this many rows so a huge
/// f(row) result cannot blow up the batch allocation in one extend.
const CONCAT_CHUNK: usize = 64;

/// What `filter` does when the predicate reports a missing field instead of
/// a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDefault {
    /// Treat the row as not matching (the common default).
    Skip,
    /// Treat the row as matching.
    Keep,
    /// Surface the missing field as a row-eval failure.
    Error,
}

#[derive(Clone)]
pub enum Transform {
    Map(UserFn),
    Filter {
        pred: UserFn,
        on_missing: FilterDefault,
    },
    ConcatMap(UserFn),
    /// Drops adjacent duplicates within one batch. A range scan folds each
    /// key as its own batch, so this dedups only within a single key's
    /// `ConcatMap`/`Group` fan-out; equal rows under adjacent keys both
    /// survive. Cross-batch and index-backed distinctness are layered on
    /// top by the caller.
    Distinct,
    Group {
        key_fns: Vec<UserFn>,
        /// Fan a row out under every element of an array-valued group key.
        multi: bool,
    },
    Zip,
}

impl std::fmt::Debug for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Transform::Map(_) => "Map",
            Transform::Filter { .. } => "Filter",
            Transform::ConcatMap(_) => "ConcatMap",
            Transform::Distinct => "Distinct",
            Transform::Group { .. } => "Group",
            Transform::Zip => "Zip",
        };
        f.write_str(name)
    }
}

impl Transform {
    /// Rewrite `batch` in place. Errors out of user functions propagate
    /// unchanged except for `Filter`'s missing-field fallback.
    pub fn apply(&self, batch: &mut Batch) -> ScanResult<()> {
        match self {
            Transform::Map(f) => {
                for item in batch.iter_mut() {
                    item.row = f(&item.row)?;
                }
                Ok(())
            }
            Transform::Filter { pred, on_missing } => {
                let mut kept = Batch::new();
                for item in batch.drain(..) {
                    let keep = match pred(&item.row) {
                        Ok(verdict) => verdict.is_truthy(),
                        Err(ScanError::MissingField(name)) => match on_missing {
                            FilterDefault::Skip => false,
                            FilterDefault::Keep => true,
                            FilterDefault::Error => {
                                return Err(ScanError::MissingField(name))
                            }
                        },
                        Err(e) => return Err(e),
                    };
                    if keep {
                        kept.push(item);
                    }
                }
                *batch = kept;
                Ok(())
            }
            Transform::ConcatMap(f) => {
                let mut flattened = Batch::new();
                for item in batch.drain(..) {
                    let produced = f(&item.row)?;
                    let elements = match produced {
                        Datum::Array(elements) => elements,
                        other => {
                            return Err(ScanError::row_eval(format!(
                                "concat_map expected an array, got {}",
                                other.type_name()
                            )))
                        }
                    };
                    let mut elements = elements.into_iter();
                    loop {
                        let chunk: SmallVec<[Datum; 8]> =
                            elements.by_ref().take(CONCAT_CHUNK).collect();
                        if chunk.is_empty() {
                            break;
                        }
                        flattened.reserve(chunk.len());
                        for row in chunk {
                            flattened.push(BatchItem {
                                group: item.group.clone(),
                                row,
                            });
                        }
                    }
                }
                *batch = flattened;
                Ok(())
            }
            Transform::Distinct => {
                batch.dedup_by(|a, b| {
                    a.row.total_cmp(&b.row).is_eq()
                        && match (&a.group, &b.group) {
                            (None, None) => true,
                            (Some(x), Some(y)) => x.total_cmp(y).is_eq(),
                            _ => false,
                        }
                });
                Ok(())
            }
            Transform::Group { key_fns, multi } => {
                let mut regrouped = Batch::new();
                for item in batch.drain(..) {
                    let key = compute_group_key(key_fns, &item.row)?;
                    match (key, *multi) {
                        (Datum::Array(elements), true) => {
                            for element in elements {
                                regrouped.push(BatchItem {
                                    group: Some(element),
                                    row: item.row.clone(),
                                });
                            }
                        }
                        (key, _) => regrouped.push(BatchItem {
                            group: Some(key),
                            row: item.row,
                        }),
                    }
                }
                *batch = regrouped;
                Ok(())
            }
            Transform::Zip => {
                for item in batch.iter_mut() {
                    item.row = zip_pair(&item.row)?;
                }
                Ok(())
            }
        }
    }
}

fn compute_group_key(key_fns: &[UserFn], row: &Datum) -> ScanResult<Datum> {
    match key_fns {
        [] => Err(ScanError::row_eval("group requires at least one key function")),
        [single] => single(row),
        many => {
            let mut parts = Vec::with_capacity(many.len());
            for f in many {
                parts.push(f(row)?);
            }
            Ok(Datum::Array(parts))
        }
    }
}

fn zip_pair(row: &Datum) -> ScanResult<Datum> {
    let left = row.get_field("left").ok();
    let right = row.get_field("right").ok();
    match (left, right) {
        (Some(Datum::Object(l)), Some(Datum::Object(r))) => {
            let mut merged = l.clone();
            for (name, value) in r {
                merged.insert(name.clone(), value.clone());
            }
            Ok(Datum::Object(merged))
        }
        (Some(only), None) | (None, Some(only)) => Ok(only.clone()),
        (Some(_), Some(_)) => Err(ScanError::row_eval(
            "zip requires object-valued left and right",
        )),
        (None, None) => Err(ScanError::row_eval(
            "zip requires a {left, right} join row",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn ints(values: &[i64]) -> Batch {
        values
            .iter()
            .map(|v| BatchItem::ungrouped(Datum::Int(*v)))
            .collect()
    }

    fn rows_of(batch: &Batch) -> Vec<Datum> {
        batch.iter().map(|i| i.row.clone()).collect()
    }

    #[test]
    fn distinct_removes_adjacent_duplicates_only() {
        let mut batch = ints(&[1, 1, 2, 2, 1]);
        Transform::Distinct.apply(&mut batch).unwrap();
        // Not globally distinct: the trailing 1 survives.
        assert_eq!(
            rows_of(&batch),
            vec![Datum::Int(1), Datum::Int(2), Datum::Int(1)]
        );
    }

    #[test]
    fn filter_missing_field_fallback() {
        let pred: UserFn = Arc::new(|row| row.get_field("flag").map(Datum::clone));
        let with_flag = Datum::object([("flag", Datum::Bool(true))]);
        let without = Datum::object([("other", Datum::Int(1))]);

        let mut batch: Batch = smallvec![
            BatchItem::ungrouped(with_flag.clone()),
            BatchItem::ungrouped(without.clone()),
        ];
        Transform::Filter {
            pred: pred.clone(),
            on_missing: FilterDefault::Skip,
        }
        .apply(&mut batch)
        .unwrap();
        assert_eq!(batch.len(), 1);

        let mut batch: Batch = smallvec![BatchItem::ungrouped(without.clone())];
        Transform::Filter {
            pred: pred.clone(),
            on_missing: FilterDefault::Keep,
        }
        .apply(&mut batch)
        .unwrap();
        assert_eq!(batch.len(), 1);

        let mut batch: Batch = smallvec![BatchItem::ungrouped(without)];
        let err = Transform::Filter {
            pred,
            on_missing: FilterDefault::Error,
        }
        .apply(&mut batch)
        .unwrap_err();
        assert_eq!(err, ScanError::missing_field("flag"));
    }

    #[test]
    fn concat_map_flattens_and_rejects_non_arrays() {
        let dup: UserFn =
            Arc::new(|row| Ok(Datum::Array(vec![row.clone(), row.clone()])));
        let mut batch = ints(&[1, 2]);
        Transform::ConcatMap(dup).apply(&mut batch).unwrap();
        assert_eq!(
            rows_of(&batch),
            vec![Datum::Int(1), Datum::Int(1), Datum::Int(2), Datum::Int(2)]
        );

        let bad: UserFn = Arc::new(|row| Ok(row.clone()));
        let mut batch = ints(&[1]);
        assert!(matches!(
            Transform::ConcatMap(bad).apply(&mut batch),
            Err(ScanError::RowEval(_))
        ));
    }

    #[test]
    fn group_multi_fans_out_array_keys() {
        let tags: UserFn = Arc::new(|row| row.get_field("tags").map(Datum::clone));
        let row = Datum::object([
            ("id", Datum::Int(1)),
            (
                "tags",
                Datum::Array(vec![Datum::text("x"), Datum::text("y")]),
            ),
        ]);
        let mut batch: Batch = smallvec![BatchItem::ungrouped(row)];
        Transform::Group {
            key_fns: vec![tags],
            multi: true,
        }
        .apply(&mut batch)
        .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].group, Some(Datum::text("x")));
        assert_eq!(batch[1].group, Some(Datum::text("y")));
        assert_eq!(batch[0].row, batch[1].row);
    }

    #[test]
    fn zip_prefers_right_fields() {
        let row = Datum::object([
            (
                "left",
                Datum::object([("a", Datum::Int(1)), ("b", Datum::Int(2))]),
            ),
            ("right", Datum::object([("b", Datum::Int(20))])),
        ]);
        let mut batch: Batch = smallvec![BatchItem::ungrouped(row)];
        Transform::Zip.apply(&mut batch).unwrap();
        assert_eq!(
            batch[0].row,
            Datum::object([("a", Datum::Int(1)), ("b", Datum::Int(20))])
        );
    }
}
