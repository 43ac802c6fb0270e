//! Stress tests for the shared-memory SPSC ring.
//!
//! - Ordered, lossless delivery across threads for a range of capacities
//! - Exact full/empty boundaries at the largest supported capacity
//! - File-backed rings shared by two independent mappings

use std::thread;

use flash_feed::error::RingError;
use flash_feed::spsc::RetryPolicy;
use flash_feed::{ControlRecord, KillCommand, SnapshotRecord, SpscRing, WireMessage};
use flash_feed::event::Level;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

fn record(seq: u64) -> SnapshotRecord {
    SnapshotRecord {
        instrument: (seq % 7) as u32,
        seq,
        exch_ts: seq as i64 * 1_000,
        best_bid: Some(Level::new(2_000 + (seq % 50) as i64, 1 + (seq % 9) as i64)),
        best_ask: (seq % 3 != 0).then(|| Level::new(2_060, 4)),
        imbalance: None,
        stale: seq % 11 == 0,
    }
}

fn transfer(capacity: usize, count: u64, seed: u64) {
    let (mut producer, mut consumer) = SpscRing::anonymous(capacity).unwrap().split();

    let writer = thread::spawn(move || {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        for seq in 0..count {
            loop {
                match producer.push(&record(seq), RetryPolicy::Backoff { max_steps: 8 }) {
                    Ok(()) => break,
                    Err(RingError::Contention { .. }) => thread::yield_now(),
                    Err(e) => panic!("unexpected ring error: {e}"),
                }
            }
            // Occasional bursts keep the ring oscillating between full and empty
            if rng.gen_ratio(1, 64) {
                thread::yield_now();
            }
        }
    });

    let mut expected = 0u64;
    while expected < count {
        match consumer.pop::<SnapshotRecord>().unwrap() {
            Some(r) => {
                assert_eq!(r, record(expected), "capacity {capacity}");
                expected += 1;
            }
            None => std::hint::spin_loop(),
        }
    }
    writer.join().unwrap();
    assert!(consumer.pop::<SnapshotRecord>().unwrap().is_none());
}

#[test]
fn test_threaded_transfer_across_capacities() {
    for (i, exp) in [1u32, 2, 3, 5, 8, 12, 16].iter().enumerate() {
        let capacity = 1usize << exp;
        transfer(capacity, 20_000, i as u64);
    }
}

#[test]
fn test_largest_capacity_boundaries() {
    let capacity = 1usize << 20;
    let (mut producer, mut consumer) = SpscRing::anonymous(capacity).unwrap().split();
    for seq in 0..capacity as u64 {
        producer.push(&record(seq), RetryPolicy::TryOnce).unwrap();
    }
    assert_eq!(producer.len(), capacity);
    assert_eq!(
        producer.push(&record(0), RetryPolicy::Spin { max_retries: 3 }),
        Err(RingError::Contention { attempts: 4 })
    );

    for seq in 0..capacity as u64 {
        assert_eq!(consumer.pop::<SnapshotRecord>().unwrap(), Some(record(seq)));
    }
    assert_eq!(consumer.pop::<SnapshotRecord>().unwrap(), None);
    assert!(consumer.is_empty());
}

#[test]
fn test_file_backed_ring_between_mappings() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("control");
    let mut producer = SpscRing::create(&path, 64).unwrap().into_producer();
    let mut consumer = SpscRing::attach(&path).unwrap().into_consumer();

    let control = ControlRecord {
        kill: KillCommand::Engage,
        instrument: 3,
        rate_max_orders: 10,
        rate_window_ns: 1_000_000_000,
        issued_at: 42,
    };
    producer.push(&control, RetryPolicy::TryOnce).unwrap();
    producer.push(&record(1), RetryPolicy::TryOnce).unwrap();

    assert_eq!(consumer.pop_message().unwrap(), Some(WireMessage::Control(control)));
    assert_eq!(consumer.pop_message().unwrap(), Some(WireMessage::Snapshot(record(1))));
    assert_eq!(consumer.pop_message().unwrap(), None);
}

#[test]
fn test_consumer_decodes_wrong_kind_as_error() {
    let (mut producer, mut consumer) = SpscRing::anonymous(4).unwrap().split();
    producer.push(&record(5), RetryPolicy::TryOnce).unwrap();
    assert!(matches!(consumer.pop::<ControlRecord>(), Err(RingError::Wire(_))));
    // The bad slot is consumed, not retried forever
    assert_eq!(consumer.pop::<ControlRecord>().unwrap(), None);
}
