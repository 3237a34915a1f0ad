use std::collections::HashSet;
use std::sync::Arc;
use std::thread::scope;

use crate::test_support::FlakyStore;
use crate::{Error, MemoryCounterStore, Segment, SegmentEngine, StoreError};

fn engine(step: i64) -> (Arc<FlakyStore>, SegmentEngine<FlakyStore>) {
    let store = Arc::new(FlakyStore::new());
    let engine = SegmentEngine::new("order", step, Arc::clone(&store)).unwrap();
    (store, engine)
}

#[test]
fn construction_reserves_first_segment() {
    let (store, engine) = engine(100);
    assert_eq!(engine.key(), "order");
    assert_eq!(store.reservations(), 1);
    assert_eq!(
        engine.segment(),
        Segment {
            cur: 0,
            max: 100,
            step: 100
        }
    );
    assert_eq!(store.inner().row("order").unwrap().value, 100);
}

#[test]
fn fresh_key_issues_one_to_step_then_refills() {
    let (store, engine) = engine(100);

    for expected in 1..=100 {
        assert_eq!(engine.next().unwrap(), expected);
    }
    assert_eq!(store.reservations(), 1);
    assert!(engine.segment().is_exhausted());

    assert_eq!(engine.next().unwrap(), 101);
    assert_eq!(store.reservations(), 2);
    assert_eq!(store.inner().row("order").unwrap().value, 200);
}

#[test]
fn current_tracks_last_issued() {
    let (_store, engine) = engine(100);
    assert_eq!(engine.current(), 0);

    assert_eq!(engine.next().unwrap(), 1);
    assert_eq!(engine.current(), 1);

    for _ in 2..=101 {
        engine.next().unwrap();
    }
    assert_eq!(engine.current(), 101);
}

#[test]
fn current_is_idempotent() {
    let (_store, engine) = engine(10);
    engine.next().unwrap();
    engine.next().unwrap();
    let first = engine.current();
    for _ in 0..5 {
        assert_eq!(engine.current(), first);
    }
}

#[test]
fn failed_refill_leaves_segment_untouched_and_retries() {
    let (store, engine) = engine(2);
    assert_eq!(engine.next().unwrap(), 1);
    assert_eq!(engine.next().unwrap(), 2);

    store.set_unreachable(true);
    let before = engine.segment();
    let err = engine.next().unwrap_err();
    assert!(matches!(err, Error::Store(StoreError::Backend(_))));
    assert_eq!(engine.segment(), before);
    assert_eq!(engine.current(), 2);

    store.set_unreachable(false);
    assert_eq!(engine.next().unwrap(), 3);
    assert_eq!(engine.next().unwrap(), 4);
}

#[test]
fn rejects_non_positive_step() {
    let store = Arc::new(MemoryCounterStore::new());
    assert!(matches!(
        SegmentEngine::new("k", 0, Arc::clone(&store)),
        Err(Error::InvalidStep(0))
    ));
    assert!(matches!(
        SegmentEngine::new("k", -3, Arc::clone(&store)),
        Err(Error::InvalidStep(-3))
    ));
    assert!(store.is_empty());
}

#[test]
fn construction_failure_yields_no_engine() {
    let store = Arc::new(FlakyStore::new());
    store.set_unreachable(true);
    assert!(matches!(
        SegmentEngine::new("k", 10, Arc::clone(&store)),
        Err(Error::Store(_))
    ));
    assert!(store.inner().row("k").is_none());
}

#[test]
fn segment_bound_holds_throughout() {
    let (_store, engine) = engine(7);
    let mut issued = Vec::new();
    for _ in 0..100 {
        issued.push(engine.next().unwrap());
        let segment = engine.segment();
        assert!(segment.cur <= segment.max);
        assert!(segment.max - segment.cur <= segment.step);
        assert!(issued.iter().all(|&id| id <= segment.max));
    }
}

#[test]
fn concurrent_callers_get_unique_contiguous_ids() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 500;

    let (_store, engine) = engine(64);
    let engine = &engine;

    let all: Vec<i64> = scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(move || {
                    let mut ids = Vec::with_capacity(PER_THREAD);
                    for _ in 0..PER_THREAD {
                        ids.push(engine.next().unwrap());
                    }
                    // Each caller observes its own ids in increasing order.
                    assert!(ids.windows(2).all(|w| w[0] < w[1]));
                    ids
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    let unique: HashSet<i64> = all.iter().copied().collect();
    assert_eq!(unique.len(), THREADS * PER_THREAD);

    let mut sorted = all;
    sorted.sort_unstable();
    let expected: Vec<i64> = (1..=(THREADS * PER_THREAD) as i64).collect();
    assert_eq!(sorted, expected);
}

#[test]
fn engines_sharing_a_store_never_overlap() {
    let store = Arc::new(MemoryCounterStore::new());
    let a = SegmentEngine::new("order", 50, Arc::clone(&store)).unwrap();
    let b = SegmentEngine::new("order", 50, Arc::clone(&store)).unwrap();

    let mut seen = HashSet::new();
    for _ in 0..500 {
        assert!(seen.insert(a.next().unwrap()));
        assert!(seen.insert(b.next().unwrap()));
    }
    assert_eq!(seen.len(), 1000);
    assert!(seen.iter().all(|&id| id >= 1));
}
