//! LOB engine - per-instrument book state and stats emission.
//!
//! Single writer: one engine owns its instruments' states and is driven by
//! one thread. See `shard` for running several engines side by side.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::book::LobState;
use crate::error::ConfigError;
use crate::event::{BidAskEvent, FeedGap, InstrumentId, LobStatsEvent, MarketEvent, TickEvent, MAX_DEPTH};
use crate::stats::{self, StatsEmission, MAX_VOLATILITY_WINDOW};

/// Engine configuration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LobConfig {
    /// Levels kept per side (1..=MAX_DEPTH)
    pub depth: usize,
    pub emission: StatsEmission,
    /// Mid changes in the volatility estimate (1..=64)
    pub volatility_window: usize,
}

impl Default for LobConfig {
    fn default() -> Self {
        Self {
            depth: 5,
            emission: StatsEmission::EveryUpdate,
            volatility_window: 32,
        }
    }
}

impl LobConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.depth == 0 || self.depth > MAX_DEPTH {
            return Err(ConfigError::Invalid(format!(
                "lob depth {} outside 1..={MAX_DEPTH}",
                self.depth
            )));
        }
        if self.volatility_window == 0 || self.volatility_window > MAX_VOLATILITY_WINDOW {
            return Err(ConfigError::Invalid(format!(
                "volatility window {} outside 1..={MAX_VOLATILITY_WINDOW}",
                self.volatility_window
            )));
        }
        if let StatsEmission::DeadBand { price_ticks, imbalance } = self.emission {
            if price_ticks < 0 || !(0.0..=2.0).contains(&imbalance) {
                return Err(ConfigError::Invalid("dead band must be non-negative".into()));
            }
        }
        Ok(())
    }
}

/// Engine counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LobCounters {
    /// Book updates applied
    pub applied: u64,
    pub ticks: u64,
    /// Events discarded for a stale or non-increasing sequence
    pub stale_discarded: u64,
    pub gaps: u64,
    pub emitted: u64,
    /// Stats suppressed by the dead band
    pub suppressed: u64,
}

/// Book engine for a set of instruments.
pub struct LobEngine {
    books: FxHashMap<InstrumentId, LobState>,
    config: LobConfig,
    counters: LobCounters,
}

impl LobEngine {
    pub fn new(config: LobConfig) -> Self {
        Self {
            books: FxHashMap::default(),
            config,
            counters: LobCounters::default(),
        }
    }

    /// Pre-create states so the hot path never inserts into the map.
    pub fn with_instruments(config: LobConfig, instruments: impl IntoIterator<Item = InstrumentId>) -> Self {
        let mut engine = Self::new(config);
        for id in instruments {
            engine.books.insert(id, LobState::new(id, config.volatility_window));
        }
        engine
    }

    #[inline]
    pub fn config(&self) -> &LobConfig {
        &self.config
    }

    #[inline]
    pub fn counters(&self) -> LobCounters {
        self.counters
    }

    #[inline]
    pub fn book(&self, instrument: InstrumentId) -> Option<&LobState> {
        self.books.get(&instrument)
    }

    /// Current statistics regardless of the emission policy.
    pub fn stats(&self, instrument: InstrumentId) -> Option<LobStatsEvent> {
        self.books.get(&instrument).map(stats::compute)
    }

    #[inline]
    pub fn instrument_count(&self) -> usize {
        self.books.len()
    }

    /// Apply one market event; returns the stats event to publish, if any.
    #[inline]
    pub fn apply(&mut self, event: &MarketEvent) -> Option<LobStatsEvent> {
        match event {
            MarketEvent::Tick(tick) => {
                self.apply_tick(tick);
                None
            }
            MarketEvent::BidAsk(update) => self.apply_bidask(update),
            MarketEvent::FeedGap(gap) => self.apply_gap(gap),
        }
    }

    fn state_mut(&mut self, instrument: InstrumentId) -> &mut LobState {
        let window = self.config.volatility_window;
        self.books
            .entry(instrument)
            .or_insert_with(|| LobState::new(instrument, window))
    }

    fn discard_stale(&mut self, instrument: InstrumentId, seq: u64, last: Option<u64>) {
        self.counters.stale_discarded += 1;
        debug!(instrument, seq, last = ?last, "discarding stale event");
    }

    fn apply_tick(&mut self, tick: &TickEvent) {
        let state = self.state_mut(tick.instrument);
        if tick.stale || !state.accepts(tick.seq) {
            let last = state.last_seq;
            self.discard_stale(tick.instrument, tick.seq, last);
            return;
        }
        state.last_seq = Some(tick.seq);
        state.last_trade = Some(tick.price);
        self.counters.ticks += 1;
    }

    fn apply_bidask(&mut self, update: &BidAskEvent) -> Option<LobStatsEvent> {
        let depth = self.config.depth;
        let state = self.state_mut(update.instrument);
        if update.stale || !state.accepts(update.seq) {
            let last = state.last_seq;
            self.discard_stale(update.instrument, update.seq, last);
            return None;
        }

        // An absent side is unknown for this update, not empty
        if let Some(bids) = &update.bids {
            state.bids.replace(bids, depth);
        }
        if let Some(asks) = &update.asks {
            state.asks.replace(asks, depth);
        }
        state.last_seq = Some(update.seq);
        state.last_exch_ts = update.exch_ts;
        state.version += 1;

        let mid_x2 = match (state.bids.best(), state.asks.best()) {
            (Some(b), Some(a)) => Some(a.price + b.price),
            _ => None,
        };
        if let (Some(prev), Some(mid)) = (state.last_mid_x2, mid_x2) {
            state.volatility.push((mid - prev) as f64 / 2.0);
        }
        state.last_mid_x2 = mid_x2;

        self.counters.applied += 1;
        self.emit(update.instrument, false)
    }

    fn apply_gap(&mut self, gap: &FeedGap) -> Option<LobStatsEvent> {
        self.counters.gaps += 1;
        match gap.instrument {
            Some(id) => {
                let state = self.books.get_mut(&id)?;
                state.mark_stale();
                if gap.reset_sequence {
                    state.last_seq = None;
                }
                debug!(instrument = id, reset = gap.reset_sequence, "feed gap");
                self.emit(id, true)
            }
            None => {
                self.mark_stale_all(gap.reset_sequence);
                None
            }
        }
    }

    /// Mark every known book stale (connection-wide gap).
    pub fn mark_stale_all(&mut self, reset_sequence: bool) {
        for state in self.books.values_mut() {
            state.mark_stale();
            if reset_sequence {
                state.last_seq = None;
            }
        }
        debug!(instruments = self.books.len(), reset = reset_sequence, "feed gap on all instruments");
    }

    fn emit(&mut self, instrument: InstrumentId, force: bool) -> Option<LobStatsEvent> {
        let policy = self.config.emission;
        let state = self.books.get_mut(&instrument)?;
        let next = stats::compute(state);
        if force || stats::should_emit(policy, state.last_emitted.as_ref(), &next) {
            state.last_emitted = Some(next);
            self.counters.emitted += 1;
            Some(next)
        } else {
            self.counters.suppressed += 1;
            None
        }
    }

    /// Pre-create states and touch their memory before the hot loop.
    pub fn warm_up(&mut self, instruments: impl IntoIterator<Item = InstrumentId>) {
        let window = self.config.volatility_window;
        for id in instruments {
            self.books.entry(id).or_insert_with(|| LobState::new(id, window));
        }
        for state in self.books.values_mut() {
            // SAFETY: `state.version` is a valid, exclusively borrowed field
            unsafe {
                std::ptr::write_volatile(&mut state.version, state.version);
            }
        }
    }

    /// Compute a hash of all book states (for determinism testing).
    pub fn state_hash(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut ids: Vec<InstrumentId> = self.books.keys().copied().collect();
        ids.sort_unstable();

        let mut hasher = DefaultHasher::new();
        for id in ids {
            let state = &self.books[&id];
            id.hash(&mut hasher);
            state.bids.prices().hash(&mut hasher);
            state.bids.sizes().hash(&mut hasher);
            (state.bids.state() as u8).hash(&mut hasher);
            state.asks.prices().hash(&mut hasher);
            state.asks.sizes().hash(&mut hasher);
            (state.asks.state() as u8).hash(&mut hasher);
            state.last_seq.hash(&mut hasher);
            state.last_trade.hash(&mut hasher);
            state.version.hash(&mut hasher);
        }
        hasher.finish()
    }
}

impl Default for LobEngine {
    fn default() -> Self {
        Self::new(LobConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{BookSide, Level, SideState};

    fn side(levels: &[(i64, i64)]) -> Option<BookSide> {
        let levels: Vec<Level> = levels.iter().map(|&(p, s)| Level::new(p, s)).collect();
        Some(BookSide::from_levels(&levels))
    }

    fn update(seq: u64, bids: Option<BookSide>, asks: Option<BookSide>) -> MarketEvent {
        MarketEvent::BidAsk(BidAskEvent {
            instrument: 1,
            seq,
            exch_ts: seq as i64,
            local_ts: 0,
            bids,
            asks,
            is_snapshot: false,
            synthesized: false,
            stale: false,
        })
    }

    fn trade(seq: u64, price: i64) -> MarketEvent {
        MarketEvent::Tick(TickEvent {
            instrument: 1,
            seq,
            exch_ts: 0,
            local_ts: 0,
            price,
            size: 1,
            total_volume: 0,
            simtrade: false,
            odd_lot: false,
            stale: false,
        })
    }

    #[test]
    fn test_engine_creation() {
        let engine = LobEngine::default();
        assert_eq!(engine.instrument_count(), 0);
        assert_eq!(engine.stats(1), None);
    }

    #[test]
    fn test_bids_only_update() {
        let mut engine = LobEngine::default();
        let stats = engine.apply(&update(1, side(&[(2025, 100)]), None)).unwrap();
        assert_eq!(stats.best_bid, Some(Level::new(2025, 100)));
        assert_eq!(stats.best_ask, None);
        assert_eq!(stats.ask_state, SideState::Unknown);
        assert_eq!(stats.spread, None);
        assert_eq!(stats.mid_x2, None);
    }

    #[test]
    fn test_absent_side_untouched() {
        let mut engine = LobEngine::default();
        engine.apply(&update(1, side(&[(100, 5)]), side(&[(102, 7)])));
        let stats = engine.apply(&update(2, side(&[(101, 3)]), None)).unwrap();
        assert_eq!(stats.best_bid, Some(Level::new(101, 3)));
        assert_eq!(stats.best_ask, Some(Level::new(102, 7)));
        assert_eq!(stats.spread, Some(1));
        assert_eq!(stats.mid_x2, Some(203));
    }

    #[test]
    fn test_empty_side_clears() {
        let mut engine = LobEngine::default();
        engine.apply(&update(1, side(&[(100, 5)]), side(&[(102, 7)])));
        let stats = engine
            .apply(&update(2, None, Some(BookSide::empty())))
            .unwrap();
        assert_eq!(stats.best_ask, None);
        assert_eq!(stats.ask_state, SideState::Live);
        assert_eq!(stats.spread, None);
    }

    #[test]
    fn test_stale_discarded() {
        let mut engine = LobEngine::default();
        engine.apply(&update(5, side(&[(100, 5)]), side(&[(102, 7)])));
        let hash = engine.state_hash();
        assert_eq!(engine.apply(&update(5, side(&[(90, 1)]), None)), None);
        assert_eq!(engine.apply(&update(3, side(&[(90, 1)]), None)), None);
        let mut tagged = update(9, side(&[(90, 1)]), None);
        if let MarketEvent::BidAsk(b) = &mut tagged {
            b.stale = true;
        }
        assert_eq!(engine.apply(&tagged), None);
        assert_eq!(engine.state_hash(), hash);
        assert_eq!(engine.counters().stale_discarded, 3);
    }

    #[test]
    fn test_depth_eviction() {
        let config = LobConfig {
            depth: 2,
            ..Default::default()
        };
        let mut engine = LobEngine::new(config);
        let stats = engine
            .apply(&update(1, side(&[(100, 1), (99, 2), (98, 3)]), None))
            .unwrap();
        assert_eq!(stats.bid_depth, 3);
        assert_eq!(engine.book(1).unwrap().bids.prices(), &[100, 99]);
    }

    #[test]
    fn test_ticks_update_last_trade_only() {
        let mut engine = LobEngine::default();
        assert_eq!(engine.apply(&trade(1, 2026)), None);
        let stats = engine.apply(&update(2, side(&[(2025, 1)]), None)).unwrap();
        assert_eq!(stats.last_trade, Some(2026));
        assert_eq!(engine.counters().ticks, 1);
    }

    #[test]
    fn test_volatility() {
        let mut engine = LobEngine::default();
        engine.apply(&update(1, side(&[(100, 1)]), side(&[(102, 1)])));
        let s = engine.apply(&update(2, side(&[(101, 1)]), side(&[(103, 1)]))).unwrap();
        assert_eq!(s.volatility, None);
        let s = engine.apply(&update(3, side(&[(100, 1)]), side(&[(102, 1)]))).unwrap();
        // changes +1, -1 -> std dev 1
        assert_eq!(s.volatility, Some(1.0));
    }

    #[test]
    fn test_feed_gap_marks_stale() {
        let mut engine = LobEngine::default();
        engine.apply(&update(7, side(&[(100, 5)]), side(&[(102, 7)])));
        let gap = MarketEvent::FeedGap(FeedGap {
            instrument: Some(1),
            ts: 0,
            reset_sequence: true,
        });
        let stats = engine.apply(&gap).unwrap();
        assert!(stats.stale);
        assert_eq!(stats.bid_state, SideState::Stale);

        // Sequence restarts after the reset
        let stats = engine.apply(&update(1, side(&[(100, 5)]), None)).unwrap();
        assert_eq!(stats.bid_state, SideState::Live);
        assert_eq!(stats.ask_state, SideState::Stale);
        assert!(stats.stale);
        let stats = engine.apply(&update(2, None, side(&[(101, 1)]))).unwrap();
        assert!(!stats.stale);
    }

    #[test]
    fn test_global_gap() {
        let mut engine = LobEngine::default();
        engine.apply(&update(1, side(&[(100, 5)]), None));
        let gap = MarketEvent::FeedGap(FeedGap {
            instrument: None,
            ts: 0,
            reset_sequence: false,
        });
        assert_eq!(engine.apply(&gap), None);
        assert!(engine.book(1).unwrap().is_stale());
    }

    #[test]
    fn test_dead_band_suppresses() {
        let config = LobConfig {
            emission: StatsEmission::DeadBand {
                price_ticks: 1,
                imbalance: 0.5,
            },
            ..Default::default()
        };
        let mut engine = LobEngine::new(config);
        assert!(engine.apply(&update(1, side(&[(100, 10)]), side(&[(102, 10)]))).is_some());
        // Size-only change, small imbalance move
        assert!(engine.apply(&update(2, side(&[(100, 11)]), None)).is_none());
        assert!(engine.apply(&update(3, side(&[(101, 11)]), None)).is_some());
        assert_eq!(engine.counters().suppressed, 1);
        assert_eq!(engine.counters().applied, 3);
    }

    #[test]
    fn test_state_hash_determinism() {
        let mut a = LobEngine::default();
        let mut b = LobEngine::default();
        for seq in 1..50u64 {
            let p = 100 + (seq % 7) as i64;
            let ev = update(seq, side(&[(p, 1)]), side(&[(p + 2, 1)]));
            a.apply(&ev);
            b.apply(&ev);
        }
        assert_eq!(a.state_hash(), b.state_hash());
    }

    #[test]
    fn test_config_validate() {
        assert!(LobConfig::default().validate().is_ok());
        let bad = LobConfig {
            depth: MAX_DEPTH + 1,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_warm_up() {
        let mut engine = LobEngine::default();
        engine.warm_up([1, 2, 3]);
        assert_eq!(engine.instrument_count(), 3);
    }
}
