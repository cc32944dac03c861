//! Shard-merge equivalence: scanning a range as one piece and scanning it as
//! several disjoint sub-ranges merged through `unshard` must be
//! indistinguishable, for every terminal and for grouped scans, under random
//! shard splits.

use std::ops::Bound;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rangewalk::{
    traverse, unshard, Datum, Direction, FinalResult, Interruptor, KeyRange, MemIndex,
    PartialResult, RangeScanCallback, ScanError, Terminal, Transform, TraversalConfig, UserFn,
};

fn scan_range(
    index: &MemIndex,
    range: &KeyRange,
    transforms: Vec<Transform>,
    terminal: &Terminal,
) -> PartialResult {
    let snapshot = index.snapshot();
    let callback = RangeScanCallback::new(transforms, terminal.clone(), Direction::Forward);
    let flow = traverse(
        &snapshot,
        range,
        &callback,
        &TraversalConfig::forward().with_concurrency(3),
        &Interruptor::new(),
    )
    .unwrap();
    callback.finish(flow, range)
}

/// Split the full key space into `n` contiguous shards at the given keys.
fn shards(split_keys: &[Vec<u8>]) -> Vec<KeyRange> {
    let mut ranges = Vec::new();
    let mut start = Bound::Unbounded;
    for key in split_keys {
        ranges.push(KeyRange::new(start.clone(), Bound::Excluded(key.clone())));
        start = Bound::Included(key.clone());
    }
    ranges.push(KeyRange::new(start, Bound::Unbounded));
    ranges
}

fn random_index(rng: &mut StdRng, count: usize) -> MemIndex {
    let index = MemIndex::new();
    for i in 0..count {
        // Halves are exactly representable, so float sums stay exact and
        // shard order cannot perturb them.
        let value = if rng.gen_bool(0.3) {
            Datum::Float(rng.gen_range(-50..50) as f64 + 0.5)
        } else {
            Datum::Int(rng.gen_range(-50..50))
        };
        index.insert(format!("row{i:04}").into_bytes(), &value);
    }
    index
}

#[test]
fn sharded_equals_unsharded_for_every_terminal() {
    let mut rng = StdRng::seed_from_u64(42);
    let index = random_index(&mut rng, 200);

    for terminal in [Terminal::Count, Terminal::Sum, Terminal::Average, Terminal::Min, Terminal::Max] {
        let whole = scan_range(&index, &KeyRange::all(), vec![], &terminal)
            .finalize(&terminal)
            .unwrap();

        // Random 3-way split.
        let mut splits: Vec<Vec<u8>> = (0..2)
            .map(|_| format!("row{:04}", rng.gen_range(0..200)).into_bytes())
            .collect();
        splits.sort();
        splits.dedup();

        let partials: Vec<PartialResult> = shards(&splits)
            .iter()
            .map(|range| scan_range(&index, range, vec![], &terminal))
            .collect();
        let merged = unshard(&terminal, partials)
            .unwrap()
            .finalize(&terminal)
            .unwrap();
        assert_eq!(merged, whole, "terminal {terminal:?}");
    }
}

#[test]
fn nested_unshard_merges_are_associative() {
    let mut rng = StdRng::seed_from_u64(7);
    let index = random_index(&mut rng, 150);
    let splits = [b"row0050".to_vec(), b"row0100".to_vec()];

    for terminal in [Terminal::Count, Terminal::Sum, Terminal::Average] {
        let whole = scan_range(&index, &KeyRange::all(), vec![], &terminal)
            .finalize(&terminal)
            .unwrap();

        let partials: Vec<PartialResult> = shards(&splits)
            .iter()
            .map(|range| scan_range(&index, range, vec![], &terminal))
            .collect();
        let [a, b, c] = <[PartialResult; 3]>::try_from(partials).unwrap();

        // Merging merged partials must agree with merging in the other
        // association, and with the single-accumulator scan.
        let ab = unshard(&terminal, vec![a.clone(), b.clone()]).unwrap();
        let left = unshard(&terminal, vec![ab, c.clone()])
            .unwrap()
            .finalize(&terminal)
            .unwrap();

        let bc = unshard(&terminal, vec![b, c]).unwrap();
        let right = unshard(&terminal, vec![a, bc])
            .unwrap()
            .finalize(&terminal)
            .unwrap();

        assert_eq!(left, right, "terminal {terminal:?}");
        assert_eq!(left, whole, "terminal {terminal:?}");
    }
}

#[test]
fn grouped_shards_merge_by_group() {
    let index = MemIndex::new();
    for i in 0..60i64 {
        index.insert(
            format!("row{i:04}").into_bytes(),
            &Datum::object([("bucket", Datum::Int(i % 3)), ("n", Datum::Int(i))]),
        );
    }
    let group: UserFn = Arc::new(|row| row.get_field("bucket").map(Datum::clone));
    let value: UserFn = Arc::new(|row| row.get_field("n").map(Datum::clone));
    let pipeline = || {
        vec![
            Transform::Group {
                key_fns: vec![Arc::clone(&group)],
                multi: false,
            },
            Transform::Map(Arc::clone(&value)),
        ]
    };

    let whole = scan_range(&index, &KeyRange::all(), pipeline(), &Terminal::Sum)
        .finalize(&Terminal::Sum)
        .unwrap();

    let partials: Vec<PartialResult> = shards(&[b"row0020".to_vec(), b"row0040".to_vec()])
        .iter()
        .map(|range| scan_range(&index, range, pipeline(), &Terminal::Sum))
        .collect();
    let merged = unshard(&Terminal::Sum, partials)
        .unwrap()
        .finalize(&Terminal::Sum)
        .unwrap();

    assert_eq!(merged, whole);
    let FinalResult::Grouped(groups) = merged else {
        panic!("expected grouped result");
    };
    assert_eq!(groups.len(), 3);
}

#[test]
fn poisoned_shard_short_circuits_the_merge() {
    let index = MemIndex::new();
    for i in 0..10i64 {
        index.insert(format!("row{i}").into_bytes(), &Datum::Int(i));
    }
    // This shard's pipeline fails on row5.
    let explode: UserFn = Arc::new(|row| {
        if row == &Datum::Int(5) {
            Err(ScanError::row_eval("boom at row5"))
        } else {
            Ok(row.clone())
        }
    });

    let clean = scan_range(
        &index,
        &KeyRange::half_open(*b"row0", *b"row5"),
        vec![],
        &Terminal::Sum,
    );
    let poisoned = scan_range(
        &index,
        &KeyRange::new(Bound::Included(b"row5".to_vec()), Bound::Unbounded),
        vec![Transform::Map(explode)],
        &Terminal::Sum,
    );
    assert!(poisoned.has_error());

    let merged = unshard(&Terminal::Sum, vec![clean, poisoned]).unwrap();
    assert!(merged.has_error());
    assert_eq!(
        merged.finalize(&Terminal::Sum).unwrap_err(),
        ScanError::row_eval("boom at row5")
    );
}

#[test]
fn unshard_rejects_mixed_kinds() {
    let index = MemIndex::new();
    index.insert(b"a".to_vec(), &Datum::Int(1));
    let count = scan_range(&index, &KeyRange::all(), vec![], &Terminal::Count);
    assert!(unshard(&Terminal::Sum, vec![count]).is_err());
}
