//! Book state - top-N levels per side as parallel arrays.
//!
//! One `LobState` per instrument, owned by exactly one engine. Prices and
//! sizes live in separate fixed arrays so a scan over prices touches one
//! cache line.

use crate::event::{BookSide, InstrumentId, Level, LobStatsEvent, Side, SideState, MAX_DEPTH};
use crate::stats::VolatilityWindow;

/// Top-N levels of one side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SideLevels {
    /// Prices in ticks, best first
    prices: [i64; MAX_DEPTH],
    /// Sizes in lots, parallel to `prices`
    sizes: [i64; MAX_DEPTH],
    len: u8,
    state: SideState,
}

impl SideLevels {
    pub const fn new() -> Self {
        Self {
            prices: [0; MAX_DEPTH],
            sizes: [0; MAX_DEPTH],
            len: 0,
            state: SideState::Unknown,
        }
    }

    /// Replace the side with the first `depth` levels of `update`.
    ///
    /// Levels beyond `depth` are evicted, furthest first.
    pub fn replace(&mut self, update: &BookSide, depth: usize) {
        let depth = depth.min(MAX_DEPTH);
        let mut len = 0usize;
        for level in update.as_slice().iter().take(depth) {
            self.prices[len] = level.price;
            self.sizes[len] = level.size;
            len += 1;
        }
        // Zero the tail so state hashes do not see leftovers
        for i in len..MAX_DEPTH {
            self.prices[i] = 0;
            self.sizes[i] = 0;
        }
        self.len = len as u8;
        self.state = SideState::Live;
    }

    /// Live levels become stale. An unknown side stays unknown.
    #[inline]
    pub fn mark_stale(&mut self) {
        if self.state == SideState::Live {
            self.state = SideState::Stale;
        }
    }

    #[inline]
    pub fn state(&self) -> SideState {
        self.state
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn prices(&self) -> &[i64] {
        &self.prices[..self.len as usize]
    }

    #[inline]
    pub fn sizes(&self) -> &[i64] {
        &self.sizes[..self.len as usize]
    }

    #[inline]
    pub fn level(&self, index: usize) -> Option<Level> {
        if index < self.len as usize {
            Some(Level::new(self.prices[index], self.sizes[index]))
        } else {
            None
        }
    }

    #[inline]
    pub fn best(&self) -> Option<Level> {
        self.level(0)
    }

    /// Total size over the retained levels.
    #[inline]
    pub fn depth_total(&self) -> i64 {
        self.sizes().iter().sum()
    }

    /// Strictly monotonic in the side's direction.
    pub fn is_ordered(&self, side: Side) -> bool {
        self.prices().windows(2).all(|w| side.is_better(w[0], w[1]))
    }
}

impl Default for SideLevels {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the engine knows about one instrument.
#[derive(Clone, Debug)]
pub struct LobState {
    pub instrument: InstrumentId,
    pub bids: SideLevels,
    pub asks: SideLevels,
    /// Last applied sequence (`None` before the first update or after a reset)
    pub last_seq: Option<u64>,
    pub last_trade: Option<i64>,
    pub last_exch_ts: i64,
    /// Accepted book updates
    pub version: u64,
    /// Mid of the previous accepted update, for volatility
    pub last_mid_x2: Option<i64>,
    pub volatility: VolatilityWindow,
    /// Last stats event handed out (dead-band reference)
    pub last_emitted: Option<LobStatsEvent>,
}

impl LobState {
    pub fn new(instrument: InstrumentId, volatility_window: usize) -> Self {
        Self {
            instrument,
            bids: SideLevels::new(),
            asks: SideLevels::new(),
            last_seq: None,
            last_trade: None,
            last_exch_ts: 0,
            version: 0,
            last_mid_x2: None,
            volatility: VolatilityWindow::new(volatility_window),
            last_emitted: None,
        }
    }

    #[inline]
    pub fn side(&self, side: Side) -> &SideLevels {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }

    #[inline]
    pub fn side_mut(&mut self, side: Side) -> &mut SideLevels {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }

    /// True if `seq` is newer than anything applied so far.
    #[inline]
    pub fn accepts(&self, seq: u64) -> bool {
        self.last_seq.map_or(true, |last| seq > last)
    }

    /// At least one side holds levels from before a feed gap.
    #[inline]
    pub fn is_stale(&self) -> bool {
        self.bids.state() == SideState::Stale || self.asks.state() == SideState::Stale
    }

    pub fn mark_stale(&mut self) {
        self.bids.mark_stale();
        self.asks.mark_stale();
    }

    /// Book invariant: bids strictly descending, asks strictly ascending.
    pub fn is_consistent(&self) -> bool {
        self.bids.is_ordered(Side::Bid) && self.asks.is_ordered(Side::Ask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn side(levels: &[(i64, i64)]) -> BookSide {
        let levels: Vec<Level> = levels.iter().map(|&(p, s)| Level::new(p, s)).collect();
        BookSide::from_levels(&levels)
    }

    #[test]
    fn test_replace_truncates_to_depth() {
        let mut levels = SideLevels::new();
        levels.replace(&side(&[(105, 1), (104, 2), (103, 3), (102, 4)]), 2);
        assert_eq!(levels.prices(), &[105, 104]);
        assert_eq!(levels.sizes(), &[1, 2]);
        assert_eq!(levels.depth_total(), 3);
        assert_eq!(levels.state(), SideState::Live);
    }

    #[test]
    fn test_replace_clears_tail() {
        let mut levels = SideLevels::new();
        levels.replace(&side(&[(105, 1), (104, 2), (103, 3)]), MAX_DEPTH);
        levels.replace(&side(&[(110, 9)]), MAX_DEPTH);
        assert_eq!(levels.len(), 1);
        assert_eq!(levels.level(1), None);
        assert_eq!(levels, {
            let mut fresh = SideLevels::new();
            fresh.replace(&side(&[(110, 9)]), MAX_DEPTH);
            fresh
        });
    }

    #[test]
    fn test_known_empty_vs_unknown() {
        let mut levels = SideLevels::new();
        assert_eq!(levels.state(), SideState::Unknown);
        levels.replace(&BookSide::empty(), MAX_DEPTH);
        assert!(levels.is_empty());
        assert_eq!(levels.state(), SideState::Live);
    }

    #[test]
    fn test_mark_stale_only_live() {
        let mut state = LobState::new(0, 16);
        state.bids.replace(&side(&[(100, 1)]), MAX_DEPTH);
        state.mark_stale();
        assert_eq!(state.bids.state(), SideState::Stale);
        assert_eq!(state.asks.state(), SideState::Unknown);
        assert!(state.is_stale());
    }

    #[test]
    fn test_sequence_acceptance() {
        let mut state = LobState::new(0, 16);
        assert!(state.accepts(0));
        state.last_seq = Some(5);
        assert!(!state.accepts(5));
        assert!(!state.accepts(4));
        assert!(state.accepts(6));
    }
}
