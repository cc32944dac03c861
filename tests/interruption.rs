//! Cancellation and early-stop behavior: an interruptor fired mid-scan must
//! surface as `Interrupted` with every worker joined, an `Abort` must leave
//! the watermark at the aborting key, and a `BatchReady` stop must resume
//! from the watermark with a fresh accumulator and lose nothing.

use std::time::Duration;

use parking_lot::Mutex;

use rangewalk::{
    traverse, unshard, BatchSpec, Datum, Direction, FinalResult, Flow, Interruptor, KeyRange,
    MemIndex, RangeScanCallback, RowHandle, ScanError, ScanResult, Terminal, Ticket,
    TraversalCallback, TraversalConfig,
};

fn numbered(count: i64) -> MemIndex {
    let index = MemIndex::new();
    for i in 0..count {
        index.insert(format!("key{i:04}").into_bytes(), &Datum::Int(i));
    }
    index
}

struct SlowProbe {
    seen: Mutex<Vec<Vec<u8>>>,
}

impl TraversalCallback for SlowProbe {
    fn handle_pair(&self, key: &[u8], row: &mut RowHandle, ticket: &Ticket) -> ScanResult<Flow> {
        row.release();
        std::thread::sleep(Duration::from_millis(2));
        ticket.wait_interruptible()?;
        self.seen.lock().push(key.to_vec());
        Ok(Flow::Continue)
    }
}

#[test]
fn trigger_mid_scan_raises_interrupted() {
    let index = numbered(500);
    let snap = index.snapshot();
    let probe = SlowProbe {
        seen: Mutex::new(Vec::new()),
    };
    let interruptor = Interruptor::new();

    let err = std::thread::scope(|s| {
        let trigger = interruptor.clone();
        s.spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            trigger.trigger();
        });
        traverse(
            &snap,
            &KeyRange::all(),
            &probe,
            &TraversalConfig::forward().with_concurrency(4),
            &interruptor,
        )
        .unwrap_err()
    });
    assert_eq!(err, ScanError::Interrupted);
    // The scan stopped well short of the full range.
    assert!(probe.seen.into_inner().len() < 500);
}

#[test]
fn abort_leaves_watermark_at_the_aborting_key() {
    let index = numbered(50);
    let snap = index.snapshot();
    // Append with a 10-row budget: the accumulator reports BatchReady after
    // the tenth row, which aborts the traversal.
    let callback = RangeScanCallback::new(
        vec![],
        Terminal::Append(BatchSpec::rows(10)),
        Direction::Forward,
    );
    let range = KeyRange::all();
    let flow = traverse(
        &snap,
        &range,
        &callback,
        &TraversalConfig::forward().with_concurrency(6),
        &Interruptor::new(),
    )
    .unwrap();
    assert_eq!(flow, Flow::Abort);

    let partial = callback.finish(flow, &range);
    assert_eq!(partial.watermark(), Some(b"key0009".as_slice()));
    assert_eq!(partial.regions[0].rows.len(), 10);
}

#[test]
fn batch_ready_resumes_from_the_watermark_without_loss() {
    let index = numbered(25);
    let terminal = Terminal::Append(BatchSpec::rows(10));
    let mut partials = Vec::new();
    let mut range = KeyRange::all();

    // Drive the scan to completion in watermark-resumed legs.
    for _ in 0..5 {
        let snap = index.snapshot();
        let callback = RangeScanCallback::new(vec![], terminal.clone(), Direction::Forward);
        let flow = traverse(
            &snap,
            &range,
            &callback,
            &TraversalConfig::forward().with_concurrency(3),
            &Interruptor::new(),
        )
        .unwrap();
        let partial = callback.finish(flow, &range);
        let watermark = partial.watermark().map(<[u8]>::to_vec);
        partials.push(partial);
        if flow == Flow::Continue {
            break;
        }
        let watermark = watermark.expect("aborted leg must carry a watermark");
        range = range.resume_after(&watermark, Direction::Forward);
    }

    assert_eq!(partials.len(), 3); // 10 + 10 + 5
    let merged = unshard(&terminal, partials).unwrap();
    let total: usize = merged.regions.iter().map(|r| r.rows.len()).sum();
    assert_eq!(total, 25);

    let result = merged.finalize(&terminal).unwrap();
    let FinalResult::Rows(regions) = result else {
        panic!("append must produce rows");
    };
    let mut keys: Vec<Vec<u8>> = regions
        .iter()
        .flat_map(|r| r.rows.iter().map(|row| row.key.clone()))
        .collect();
    let sorted = {
        let mut s = keys.clone();
        s.sort();
        s.dedup();
        s
    };
    keys.sort();
    // No key lost, none folded twice.
    assert_eq!(keys, sorted);
    assert_eq!(keys.len(), 25);
}

#[test]
fn child_scopes_do_not_leak_triggers_upward() {
    let parent = Interruptor::new();
    let child = parent.child();
    child.trigger();
    assert!(child.is_triggered());
    assert!(!parent.is_triggered());

    parent.trigger();
    assert!(parent.child().is_triggered());
}
