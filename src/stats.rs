//! Derived book statistics and the emission policy.

use serde::{Deserialize, Serialize};

use crate::book::LobState;
use crate::event::LobStatsEvent;

/// Largest supported volatility window.
pub const MAX_VOLATILITY_WINDOW: usize = 64;

/// Fixed ring of the last W mid changes (in ticks).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VolatilityWindow {
    changes: [f64; MAX_VOLATILITY_WINDOW],
    window: usize,
    head: usize,
    len: usize,
}

impl VolatilityWindow {
    /// `window` is clamped to `1..=MAX_VOLATILITY_WINDOW`.
    pub fn new(window: usize) -> Self {
        Self {
            changes: [0.0; MAX_VOLATILITY_WINDOW],
            window: window.clamp(1, MAX_VOLATILITY_WINDOW),
            head: 0,
            len: 0,
        }
    }

    #[inline]
    pub fn push(&mut self, change: f64) {
        self.changes[self.head] = change;
        self.head = (self.head + 1) % self.window;
        if self.len < self.window {
            self.len += 1;
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// Population standard deviation; `None` with fewer than two changes.
    pub fn std_dev(&self) -> Option<f64> {
        if self.len < 2 {
            return None;
        }
        let values = &self.changes[..self.len];
        let n = self.len as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
        Some(var.sqrt())
    }
}

/// When the engine hands out a stats event.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StatsEmission {
    /// One stats event per accepted book update
    EveryUpdate,
    /// Only on availability/stale changes or moves of at least the band
    DeadBand {
        /// Minimum move of best bid/ask, spread or mid (ticks)
        price_ticks: i64,
        /// Minimum imbalance move
        imbalance: f64,
    },
}

impl Default for StatsEmission {
    fn default() -> Self {
        StatsEmission::EveryUpdate
    }
}

/// Top-of-book imbalance `(bid - ask) / (bid + ask)`.
#[inline]
pub fn imbalance(bid_size: i64, ask_size: i64) -> Option<f64> {
    let total = bid_size + ask_size;
    if total <= 0 {
        return None;
    }
    Some((bid_size - ask_size) as f64 / total as f64)
}

/// Snapshot the current statistics of a book.
pub fn compute(state: &LobState) -> LobStatsEvent {
    let best_bid = state.bids.best();
    let best_ask = state.asks.best();
    let (spread, mid_x2, imb) = match (best_bid, best_ask) {
        (Some(b), Some(a)) => (
            Some(a.price - b.price),
            Some(a.price + b.price),
            imbalance(b.size, a.size),
        ),
        _ => (None, None, None),
    };
    LobStatsEvent {
        instrument: state.instrument,
        seq: state.last_seq.unwrap_or(0),
        exch_ts: state.last_exch_ts,
        version: state.version,
        best_bid,
        best_ask,
        bid_depth: state.bids.depth_total(),
        ask_depth: state.asks.depth_total(),
        bid_state: state.bids.state(),
        ask_state: state.asks.state(),
        spread,
        mid_x2,
        imbalance: imb,
        volatility: state.volatility.std_dev(),
        last_trade: state.last_trade,
        stale: state.is_stale(),
    }
}

#[inline]
fn moved(prev: Option<i64>, next: Option<i64>, band: i64) -> bool {
    match (prev, next) {
        (Some(p), Some(n)) => {
            let delta = (n - p).abs();
            delta > 0 && delta >= band
        }
        (None, None) => false,
        _ => true,
    }
}

/// Decide whether `next` is worth publishing given the last emitted event.
pub fn should_emit(policy: StatsEmission, prev: Option<&LobStatsEvent>, next: &LobStatsEvent) -> bool {
    let (price_band, imbalance_band) = match policy {
        StatsEmission::EveryUpdate => return true,
        StatsEmission::DeadBand { price_ticks, imbalance } => (price_ticks, imbalance),
    };
    let Some(prev) = prev else {
        return true;
    };
    if prev.stale != next.stale || prev.bid_state != next.bid_state || prev.ask_state != next.ask_state {
        return true;
    }
    let price = |l: Option<crate::event::Level>| l.map(|l| l.price);
    if moved(price(prev.best_bid), price(next.best_bid), price_band)
        || moved(price(prev.best_ask), price(next.best_ask), price_band)
        || moved(prev.spread, next.spread, price_band)
        // mid_x2 is in half ticks
        || moved(prev.mid_x2, next.mid_x2, price_band.saturating_mul(2))
    {
        return true;
    }
    match (prev.imbalance, next.imbalance) {
        (Some(p), Some(n)) => {
            let delta = (n - p).abs();
            delta > 0.0 && delta >= imbalance_band
        }
        (None, None) => false,
        _ => true,
    }
}
