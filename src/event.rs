//! Canonical event types.
//!
//! Everything here is `Copy` and fixed-size so events can live in
//! pre-allocated ring slots and cross thread boundaries without touching
//! the heap.

use std::fmt;

/// Dense instrument identifier assigned by the registry.
pub type InstrumentId = u32;

/// Maximum number of levels carried per side in a book event.
pub const MAX_DEPTH: usize = 10;

/// Book side (bid = buy, ask = sell)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Side {
    /// Buy side (bids)
    Bid = 0,
    /// Sell side (asks)
    Ask = 1,
}

impl Side {
    /// Returns the opposite side
    #[inline]
    pub const fn opposite(self) -> Self {
        match self {
            Side::Bid => Side::Ask,
            Side::Ask => Side::Bid,
        }
    }

    /// True if `a` is strictly better than `b` on this side.
    #[inline]
    pub const fn is_better(self, a: i64, b: i64) -> bool {
        match self {
            Side::Bid => a > b,
            Side::Ask => a < b,
        }
    }
}

/// One price level in fixed-point form.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Level {
    /// Price in ticks
    pub price: i64,
    /// Size in lots
    pub size: i64,
}

impl Level {
    #[inline]
    pub const fn new(price: i64, size: i64) -> Self {
        Self { price, size }
    }
}

/// Bounded, best-first sequence of levels for one side of a book event.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BookSide {
    levels: [Level; MAX_DEPTH],
    len: u8,
}

impl BookSide {
    /// A known side with no levels.
    #[inline]
    pub const fn empty() -> Self {
        Self {
            levels: [Level::new(0, 0); MAX_DEPTH],
            len: 0,
        }
    }

    /// Copy up to `MAX_DEPTH` levels; deeper ones are dropped.
    pub fn from_levels(levels: &[Level]) -> Self {
        let mut side = Self::empty();
        for level in levels.iter().take(MAX_DEPTH) {
            side.levels[side.len as usize] = *level;
            side.len += 1;
        }
        side
    }

    /// Append a level. Returns `false` once the side is full.
    #[inline]
    pub fn push(&mut self, level: Level) -> bool {
        if self.len as usize == MAX_DEPTH {
            return false;
        }
        self.levels[self.len as usize] = level;
        self.len += 1;
        true
    }

    #[inline]
    pub fn as_slice(&self) -> &[Level] {
        &self.levels[..self.len as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Best (first) level.
    #[inline]
    pub fn best(&self) -> Option<Level> {
        self.as_slice().first().copied()
    }

    /// Prices strictly monotonic in the side's direction and sizes positive.
    pub fn is_well_formed(&self, side: Side) -> bool {
        let levels = self.as_slice();
        levels.iter().all(|l| l.price > 0 && l.size > 0)
            && levels.windows(2).all(|w| side.is_better(w[0].price, w[1].price))
    }
}

impl Default for BookSide {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for BookSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.as_slice().iter().map(|l| (l.price, l.size)))
            .finish()
    }
}

/// A trade print.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickEvent {
    pub instrument: InstrumentId,
    /// Per-instrument sequence number
    pub seq: u64,
    /// Exchange timestamp (ns since epoch)
    pub exch_ts: i64,
    /// Ingest timestamp (ns since epoch)
    pub local_ts: i64,
    /// Trade price in ticks
    pub price: i64,
    /// Trade size in lots
    pub size: i64,
    /// Cumulative session volume in lots (0 if the feed omits it)
    pub total_volume: i64,
    pub simtrade: bool,
    pub odd_lot: bool,
    /// Sequence not newer than the last seen one
    pub stale: bool,
}

/// A top-of-book update. Either side may be absent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BidAskEvent {
    pub instrument: InstrumentId,
    pub seq: u64,
    pub exch_ts: i64,
    pub local_ts: i64,
    /// `None` = side not described by this update (unknown, not empty)
    pub bids: Option<BookSide>,
    pub asks: Option<BookSide>,
    pub is_snapshot: bool,
    /// A missing side was synthesized by configuration
    pub synthesized: bool,
    pub stale: bool,
}

impl BidAskEvent {
    #[inline]
    pub fn side(&self, side: Side) -> Option<&BookSide> {
        match side {
            Side::Bid => self.bids.as_ref(),
            Side::Ask => self.asks.as_ref(),
        }
    }
}

/// Gateway notification that the feed was interrupted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeedGap {
    /// `None` = every instrument
    pub instrument: Option<InstrumentId>,
    pub ts: i64,
    /// Upstream sequence numbers restart after the gap
    pub reset_sequence: bool,
}

/// Normalized market data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarketEvent {
    Tick(TickEvent),
    BidAsk(BidAskEvent),
    FeedGap(FeedGap),
}

impl MarketEvent {
    #[inline]
    pub fn instrument(&self) -> Option<InstrumentId> {
        match self {
            MarketEvent::Tick(t) => Some(t.instrument),
            MarketEvent::BidAsk(b) => Some(b.instrument),
            MarketEvent::FeedGap(g) => g.instrument,
        }
    }

    #[inline]
    pub fn seq(&self) -> Option<u64> {
        match self {
            MarketEvent::Tick(t) => Some(t.seq),
            MarketEvent::BidAsk(b) => Some(b.seq),
            MarketEvent::FeedGap(_) => None,
        }
    }

    #[inline]
    pub fn is_stale(&self) -> bool {
        match self {
            MarketEvent::Tick(t) => t.stale,
            MarketEvent::BidAsk(b) => b.stale,
            MarketEvent::FeedGap(_) => false,
        }
    }
}

/// What the engine currently knows about one side of a book.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum SideState {
    /// Never described by the feed
    #[default]
    Unknown = 0,
    /// Replaced by an accepted update since the last gap
    Live = 1,
    /// Levels kept from before a feed gap
    Stale = 2,
}

/// Derived book statistics. Unavailable values are `None`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LobStatsEvent {
    pub instrument: InstrumentId,
    /// Sequence of the update that produced these stats
    pub seq: u64,
    pub exch_ts: i64,
    /// Book version (accepted book updates so far)
    pub version: u64,
    pub best_bid: Option<Level>,
    pub best_ask: Option<Level>,
    /// Total size over the retained bid levels
    pub bid_depth: i64,
    pub ask_depth: i64,
    pub bid_state: SideState,
    pub ask_state: SideState,
    /// `best_ask - best_bid` in ticks
    pub spread: Option<i64>,
    /// `best_bid + best_ask` in ticks (mid without losing the half tick)
    pub mid_x2: Option<i64>,
    /// Top-of-book size imbalance in [-1, 1]
    pub imbalance: Option<f64>,
    /// Std-dev of recent mid changes, in ticks
    pub volatility: Option<f64>,
    pub last_trade: Option<i64>,
    /// At least one side is stale after a feed gap
    pub stale: bool,
}

impl LobStatsEvent {
    /// Mid price in ticks as a float (display and analytics only).
    #[inline]
    pub fn mid_ticks(&self) -> Option<f64> {
        self.mid_x2.map(|m| m as f64 / 2.0)
    }
}
