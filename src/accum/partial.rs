//! # Partial Results and Unsharding
//!
//! A [`PartialResult`] is the finalized form of one accumulator for one
//! sub-range: per-group reducer states tagged by [`TerminalKind`], plus, for
//! the `append` terminal, the buffered rows of each sub-region with that
//! region's trailing watermark. Partials produced by independent shards
//! of the same logical range merge through [`unshard`] into one result
//! logically equivalent to a single-accumulator scan.
//!
//! ## Merge Rules
//!
//! - numeric terminals: the terminal's associative, commutative merge,
//!   applied group-by-group;
//! - `min`/`max`/`reduce`: candidate rows compared/combined pairwise;
//! - `append`: a union of each sub-region's row buffer, each region keeping
//!   its own watermark; no cross-region interleaving is attempted here,
//!   ordering across regions is a client concern;
//! - errors: the first partial carrying an error short-circuits the merge
//!   and is returned untouched.

use hashbrown::HashMap;

use crate::datum::Datum;
use crate::errors::{ScanError, ScanResult};
use crate::key::Direction;

use super::terminal::{Terminal, TerminalKind, TerminalState};

/// One buffered row of an `append` result.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendRow {
    pub key: Vec<u8>,
    pub group: Option<Datum>,
    pub row: Datum,
}

/// The rows one sub-region contributed, with the rightmost (leftmost for
/// backward scans) key durably folded, which is the resumption point.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegionRows {
    pub rows: Vec<AppendRow>,
    pub watermark: Option<Vec<u8>>,
}

/// Finalized per-sub-range accumulator state.
#[derive(Debug, Clone)]
pub struct PartialResult {
    pub kind: TerminalKind,
    pub direction: Direction,
    /// Per-group reducer states. Empty for `append` (rows live in
    /// `regions`) and for scans that saw no rows.
    pub groups: Vec<(Option<Datum>, TerminalState)>,
    /// Sub-region row buffers; only populated for `append`.
    pub regions: Vec<RegionRows>,
    /// Query-level error recorded during accumulation. Poisons every later
    /// merge.
    pub error: Option<ScanError>,
}

impl PartialResult {
    pub fn empty(kind: TerminalKind, direction: Direction) -> Self {
        Self {
            kind,
            direction,
            groups: Vec::new(),
            regions: Vec::new(),
            error: None,
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// The resumption watermark across all regions: the furthest key in scan
    /// direction that is durably folded.
    pub fn watermark(&self) -> Option<&[u8]> {
        self.regions
            .iter()
            .filter_map(|r| r.watermark.as_deref())
            .max_by(|a, b| match self.direction {
                Direction::Forward => a.cmp(b),
                Direction::Backward => b.cmp(a),
            })
    }
}

/// Merge same-kind partial results keyed by group, as if the whole range had
/// been scanned by a single accumulator.
///
/// Mismatched reducer kinds are a caller bug and fail fast; an error carried
/// *inside* a partial is data and short-circuits instead.
pub fn unshard(terminal: &Terminal, partials: Vec<PartialResult>) -> eyre::Result<PartialResult> {
    eyre::ensure!(!partials.is_empty(), "unshard requires at least one partial result");
    let kind = terminal.kind();
    for partial in &partials {
        eyre::ensure!(
            partial.kind == kind,
            "cannot unshard `{}` partial into `{}` result",
            partial.kind.name(),
            kind.name()
        );
    }

    // Error short-circuit: propagate the first poisoned partial untouched.
    if let Some(pos) = partials.iter().position(PartialResult::has_error) {
        let mut partials = partials;
        return Ok(partials.swap_remove(pos));
    }

    let direction = partials[0].direction;
    let mut groups: Vec<(Option<Datum>, TerminalState)> = Vec::new();
    let mut by_key: HashMap<Vec<u8>, usize> = HashMap::new();
    let mut regions = Vec::new();

    for partial in partials {
        for (group, state) in partial.groups {
            let encoded = encode_group(&group);
            match by_key.get(&encoded) {
                Some(&slot) => {
                    terminal.merge(&mut groups[slot].1, state)?;
                }
                None => {
                    by_key.insert(encoded, groups.len());
                    groups.push((group, state));
                }
            }
        }
        regions.extend(partial.regions);
    }

    Ok(PartialResult {
        kind,
        direction,
        groups,
        regions,
        error: None,
    })
}

fn encode_group(group: &Option<Datum>) -> Vec<u8> {
    match group {
        Some(datum) => datum.group_key(),
        None => Vec::new(),
    }
}

/// Fully materialized query result, after all shards merged.
#[derive(Debug, Clone, PartialEq)]
pub enum FinalResult {
    /// Ungrouped reducer output.
    Atom(Datum),
    /// Grouped output, sorted by group key.
    Grouped(Vec<(Datum, Datum)>),
    /// Raw append rows per sub-region.
    Rows(Vec<RegionRows>),
}

impl PartialResult {
    /// Finalize into the caller-visible result. A recorded query error, or
    /// an empty-aggregate condition, surfaces here.
    pub fn finalize(self, terminal: &Terminal) -> ScanResult<FinalResult> {
        if let Some(error) = self.error {
            return Err(error);
        }
        if self.kind == TerminalKind::Append {
            return Ok(FinalResult::Rows(self.regions));
        }

        let grouped = self.groups.iter().any(|(g, _)| g.is_some());
        if !grouped {
            // Ungrouped scan: zero or one entry under the absent group key.
            // Zero rows finalize the terminal's identity (or fail for the
            // identity-free reducers).
            let state = self
                .groups
                .into_iter()
                .next()
                .map(|(_, state)| state)
                .unwrap_or_else(|| terminal.new_state());
            return Ok(FinalResult::Atom(terminal.finalize(state)?));
        }

        let mut entries = Vec::with_capacity(self.groups.len());
        for (group, state) in self.groups {
            let group = group.ok_or_else(|| {
                ScanError::row_eval("grouped result contains an ungrouped entry")
            })?;
            entries.push((group, terminal.finalize(state)?));
        }
        entries.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(FinalResult::Grouped(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum_partial(groups: Vec<(Option<Datum>, i64)>) -> PartialResult {
        PartialResult {
            kind: TerminalKind::Sum,
            direction: Direction::Forward,
            groups: groups
                .into_iter()
                .map(|(g, v)| {
                    let mut state = Terminal::Sum.new_state();
                    Terminal::Sum
                        .accumulate(&mut state, b"k", Datum::Int(v))
                        .unwrap();
                    (g, state)
                })
                .collect(),
            regions: Vec::new(),
            error: None,
        }
    }

    #[test]
    fn unshard_merges_by_group() {
        let a = sum_partial(vec![(Some(Datum::text("x")), 1), (Some(Datum::text("y")), 2)]);
        let b = sum_partial(vec![(Some(Datum::text("x")), 10)]);
        let merged = unshard(&Terminal::Sum, vec![a, b]).unwrap();
        let result = merged.finalize(&Terminal::Sum).unwrap();
        assert_eq!(
            result,
            FinalResult::Grouped(vec![
                (Datum::text("x"), Datum::Int(11)),
                (Datum::text("y"), Datum::Int(2)),
            ])
        );
    }

    #[test]
    fn unshard_error_short_circuits_untouched() {
        let ok = sum_partial(vec![(None, 1)]);
        let mut poisoned = sum_partial(vec![(None, 2)]);
        poisoned.error = Some(ScanError::row_eval("boom"));
        let merged = unshard(&Terminal::Sum, vec![ok, poisoned]).unwrap();
        assert_eq!(merged.error, Some(ScanError::row_eval("boom")));
        // The poisoned partial's own groups ride along unmerged.
        assert_eq!(merged.groups.len(), 1);
        assert_eq!(
            merged.finalize(&Terminal::Sum).unwrap_err(),
            ScanError::row_eval("boom")
        );
    }

    #[test]
    fn unshard_rejects_kind_mismatch() {
        let sum = sum_partial(vec![(None, 1)]);
        assert!(unshard(&Terminal::Count, vec![sum]).is_err());
    }

    #[test]
    fn append_union_keeps_regions_separate() {
        let region = |key: &[u8], wm: &[u8]| RegionRows {
            rows: vec![AppendRow {
                key: key.to_vec(),
                group: None,
                row: Datum::Int(1),
            }],
            watermark: Some(wm.to_vec()),
        };
        let mut a = PartialResult::empty(TerminalKind::Append, Direction::Forward);
        a.regions.push(region(b"a", b"b"));
        let mut b = PartialResult::empty(TerminalKind::Append, Direction::Forward);
        b.regions.push(region(b"c", b"z"));

        let spec = super::super::BatchSpec::unlimited();
        let merged = unshard(&Terminal::Append(spec), vec![a, b]).unwrap();
        assert_eq!(merged.regions.len(), 2);
        assert_eq!(merged.watermark(), Some(b"z".as_slice()));
    }
}
