//! Property and golden-master tests for the LOB engine.
//!
//! Random (but seeded) event streams are fed to the engine and the book
//! invariants are checked after every event.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use flash_feed::event::MAX_DEPTH;
use flash_feed::{
    BidAskEvent, BookSide, FeedGap, Level, LobConfig, LobEngine, LobStatsEvent, MarketEvent, SideState, StatsEmission,
    TickEvent,
};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

const INSTRUMENTS: u32 = 4;

fn random_side(rng: &mut ChaCha8Rng, best: i64, descending: bool) -> BookSide {
    let mut side = BookSide::empty();
    let mut price = best;
    for _ in 0..rng.gen_range(0..=MAX_DEPTH) {
        side.push(Level::new(price, rng.gen_range(1..500)));
        let step = rng.gen_range(1..4);
        price = if descending { price - step } else { price + step };
    }
    side
}

/// Deterministic mixed stream: book updates, ticks, stale replays and gaps.
fn generate_events(seed: u64, count: usize) -> Vec<MarketEvent> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut seqs = [0u64; INSTRUMENTS as usize];
    let mut events = Vec::with_capacity(count);

    for i in 0..count {
        let instrument = rng.gen_range(0..INSTRUMENTS);
        let roll = rng.gen_range(0..100);
        if roll < 2 {
            events.push(MarketEvent::FeedGap(FeedGap {
                instrument: rng.gen_bool(0.5).then_some(instrument),
                ts: i as i64,
                reset_sequence: false,
            }));
            continue;
        }

        let slot = &mut seqs[instrument as usize];
        // 5% replay an old sequence
        let (seq, stale) = if roll < 7 && *slot > 0 {
            (rng.gen_range(0..=*slot), true)
        } else {
            *slot += 1;
            (*slot, false)
        };

        if roll < 25 {
            events.push(MarketEvent::Tick(TickEvent {
                instrument,
                seq,
                exch_ts: i as i64,
                local_ts: i as i64,
                price: rng.gen_range(9_000..11_000),
                size: rng.gen_range(1..10),
                total_volume: 0,
                simtrade: false,
                odd_lot: false,
                stale,
            }));
            continue;
        }

        let mid = rng.gen_range(9_000..11_000);
        let bids = rng.gen_bool(0.8).then(|| random_side(&mut rng, mid - 1, true));
        let asks = rng.gen_bool(0.8).then(|| random_side(&mut rng, mid + 1, false));
        events.push(MarketEvent::BidAsk(BidAskEvent {
            instrument,
            seq,
            exch_ts: i as i64,
            local_ts: i as i64,
            bids,
            asks,
            is_snapshot: false,
            synthesized: false,
            stale,
        }));
    }
    events
}

fn hash_stats(stats: &[LobStatsEvent]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for s in stats {
        s.instrument.hash(&mut hasher);
        s.seq.hash(&mut hasher);
        s.version.hash(&mut hasher);
        s.best_bid.map(|l| (l.price, l.size)).hash(&mut hasher);
        s.best_ask.map(|l| (l.price, l.size)).hash(&mut hasher);
        s.spread.hash(&mut hasher);
        s.mid_x2.hash(&mut hasher);
        s.imbalance.map(f64::to_bits).hash(&mut hasher);
        s.volatility.map(f64::to_bits).hash(&mut hasher);
        s.stale.hash(&mut hasher);
    }
    hasher.finish()
}

fn run(config: LobConfig, events: &[MarketEvent]) -> (LobEngine, Vec<LobStatsEvent>) {
    let mut engine = LobEngine::with_instruments(config, 0..INSTRUMENTS);
    let stats = events.iter().filter_map(|e| engine.apply(e)).collect();
    (engine, stats)
}

#[test]
fn test_determinism_golden_master() {
    let events = generate_events(42, 20_000);
    let (engine_a, stats_a) = run(LobConfig::default(), &events);
    let (engine_b, stats_b) = run(LobConfig::default(), &events);

    assert_eq!(engine_a.state_hash(), engine_b.state_hash());
    assert_eq!(hash_stats(&stats_a), hash_stats(&stats_b));
    assert_eq!(engine_a.counters(), engine_b.counters());
    assert!(!stats_a.is_empty());
}

#[test]
fn test_different_seeds_diverge() {
    let (a, _) = run(LobConfig::default(), &generate_events(1, 2_000));
    let (b, _) = run(LobConfig::default(), &generate_events(2, 2_000));
    assert_ne!(a.state_hash(), b.state_hash());
}

#[test]
fn test_invariants_hold_after_every_event() {
    let config = LobConfig::default();
    let mut engine = LobEngine::with_instruments(config, 0..INSTRUMENTS);
    let mut last_seq = [None::<u64>; INSTRUMENTS as usize];

    for event in generate_events(7, 10_000) {
        let before = event.instrument().and_then(|id| engine.book(id).cloned());
        let emitted = engine.apply(&event);

        for id in 0..INSTRUMENTS {
            let book = engine.book(id).unwrap();
            assert!(book.is_consistent(), "book {id} out of order after {event:?}");
            assert!(book.bids.len() <= config.depth && book.asks.len() <= config.depth);
        }

        match event {
            MarketEvent::BidAsk(update) => {
                let (Some(before), Some(after)) = (before, engine.book(update.instrument)) else {
                    unreachable!("instruments are pre-registered");
                };
                if update.stale {
                    // Stale updates change nothing and emit nothing
                    assert!(emitted.is_none());
                    assert_eq!(after.bids, before.bids);
                    assert_eq!(after.asks, before.asks);
                    continue;
                }
                // An absent side is left untouched
                if update.bids.is_none() {
                    assert_eq!(after.bids, before.bids);
                }
                if update.asks.is_none() {
                    assert_eq!(after.asks, before.asks);
                }
                if update.bids.is_some() {
                    assert_eq!(after.bids.state(), SideState::Live);
                }

                let slot = &mut last_seq[update.instrument as usize];
                assert!(slot.map_or(true, |last| update.seq > last));
                *slot = Some(update.seq);
                assert_eq!(after.last_seq, Some(update.seq));

                let stats = emitted.unwrap();
                match (stats.best_bid, stats.best_ask) {
                    (Some(b), Some(a)) => {
                        assert_eq!(stats.spread, Some(a.price - b.price));
                        assert_eq!(stats.mid_x2, Some(a.price + b.price));
                    }
                    _ => {
                        assert_eq!(stats.spread, None);
                        assert_eq!(stats.mid_x2, None);
                    }
                }
                if let Some(imb) = stats.imbalance {
                    assert!((-1.0..=1.0).contains(&imb));
                }
            }
            MarketEvent::Tick(tick) if !tick.stale => {
                let slot = &mut last_seq[tick.instrument as usize];
                *slot = Some(tick.seq);
                assert!(emitted.is_none());
            }
            MarketEvent::Tick(_) => assert!(emitted.is_none()),
            MarketEvent::FeedGap(gap) => {
                let stale_book = |id: u32| {
                    let book = engine.book(id).unwrap();
                    book.bids.state() != SideState::Live && book.asks.state() != SideState::Live
                };
                match gap.instrument {
                    Some(id) => assert!(stale_book(id)),
                    None => assert!((0..INSTRUMENTS).all(stale_book)),
                }
            }
        }
    }
}

#[test]
fn test_dead_band_emits_subset() {
    let events = generate_events(11, 5_000);
    let (_, every) = run(LobConfig::default(), &events);
    let dead_band = LobConfig {
        // Bands wider than any move in the stream: only state changes emit
        emission: StatsEmission::DeadBand {
            price_ticks: 10_000,
            imbalance: 2.0,
        },
        ..LobConfig::default()
    };
    let (engine, banded) = run(dead_band, &events);
    assert!(banded.len() < every.len());
    assert_eq!(
        engine.counters().emitted + engine.counters().suppressed,
        every.len() as u64
    );
}

#[test]
fn test_reapplying_one_sided_update_is_idempotent() {
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let mut engine = LobEngine::with_instruments(LobConfig::default(), [0]);
    let asks = random_side(&mut rng, 10_001, false);
    let bids = random_side(&mut rng, 9_999, true);
    let update = |seq: u64, bids: Option<BookSide>, asks: Option<BookSide>| {
        MarketEvent::BidAsk(BidAskEvent {
            instrument: 0,
            seq,
            exch_ts: 0,
            local_ts: 0,
            bids,
            asks,
            is_snapshot: false,
            synthesized: false,
            stale: false,
        })
    };

    engine.apply(&update(1, None, Some(asks)));
    let first = engine.apply(&update(2, Some(bids), None)).unwrap();
    let book_once = engine.book(0).cloned().unwrap();
    let second = engine.apply(&update(3, Some(bids), None)).unwrap();
    let book_twice = engine.book(0).unwrap();

    assert_eq!(book_twice.bids, book_once.bids);
    assert_eq!(book_twice.asks, book_once.asks);
    assert_eq!(second.best_bid, first.best_bid);
    assert_eq!(second.best_ask, first.best_ask);
    assert_eq!(second.spread, first.spread);
}
