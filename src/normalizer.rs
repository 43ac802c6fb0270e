//! Normalizer - raw broker payloads to canonical fixed-point events.
//!
//! One payload in, zero or one event out. Malformed payloads are counted
//! and returned as [`NormalizeError::MalformedPayload`]; the caller drops
//! them and keeps going.

use arrayvec::ArrayVec;
use chrono::{DateTime, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MalformedReason, NormalizeError};
use crate::event::{BidAskEvent, BookSide, InstrumentId, Level, MarketEvent, Side, TickEvent};
use crate::price::{InstrumentRegistry, PriceCodec};

/// Levels kept per side while scanning one payload; the best ones win before
/// truncation to `MAX_DEPTH`.
pub const MAX_PAYLOAD_LEVELS: usize = 64;

const SKEW_LOG_COOLDOWN_NS: i64 = 60_000_000_000;

/// Timestamp as delivered by the gateway.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    /// Epoch integer; unit inferred from magnitude (s, ms, us or ns)
    Int(i64),
    /// Epoch seconds with fraction
    Float(f64),
    /// RFC 3339, or naive `YYYY-MM-DDTHH:MM:SS[.f]` taken as UTC
    Text(String),
}

impl RawTimestamp {
    /// Epoch nanoseconds.
    pub fn to_epoch_ns(&self) -> Result<i64, MalformedReason> {
        match self {
            RawTimestamp::Int(v) => Ok(coerce_epoch_ns(*v)),
            RawTimestamp::Float(v) if v.is_finite() => {
                let abs = v.abs();
                let ns = if abs < 1e11 {
                    v * 1e9
                } else if abs < 1e14 {
                    v * 1e6
                } else if abs < 1e17 {
                    v * 1e3
                } else {
                    *v
                };
                Ok(ns as i64)
            }
            RawTimestamp::Float(_) => Err(MalformedReason::BadTimestamp),
            RawTimestamp::Text(s) => {
                let parsed = DateTime::parse_from_rfc3339(s)
                    .map(|dt| dt.naive_utc())
                    .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
                    .map_err(|_| MalformedReason::BadTimestamp)?;
                parsed
                    .and_utc()
                    .timestamp_nanos_opt()
                    .ok_or(MalformedReason::BadTimestamp)
            }
        }
    }
}

/// Integer epoch timestamp of unknown unit -> nanoseconds.
pub fn coerce_epoch_ns(value: i64) -> i64 {
    let abs = value.unsigned_abs();
    if abs < 100_000_000_000 {
        value.saturating_mul(1_000_000_000)
    } else if abs < 100_000_000_000_000 {
        value.saturating_mul(1_000_000)
    } else if abs < 100_000_000_000_000_000 {
        value.saturating_mul(1_000)
    } else {
        value
    }
}

/// One record from the broker gateway.
///
/// Field names accept the common broker aliases (`code`, `close`,
/// `volume`, ...). A missing `bid_price`/`ask_price` array means the side is
/// not described; an empty array means the side is known to be empty.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawPayload {
    #[serde(default, alias = "type", alias = "topic")]
    pub kind: Option<String>,
    #[serde(default, alias = "code", alias = "Code")]
    pub symbol: Option<String>,
    #[serde(default)]
    pub seq: Option<u64>,
    #[serde(default, alias = "datetime")]
    pub ts: Option<RawTimestamp>,
    #[serde(default, alias = "close", alias = "Close")]
    pub price: Option<Decimal>,
    #[serde(default, alias = "volume", alias = "Volume")]
    pub size: Option<Decimal>,
    #[serde(default)]
    pub total_volume: Option<Decimal>,
    #[serde(default)]
    pub simtrade: bool,
    #[serde(default, alias = "intraday_odd")]
    pub odd_lot: bool,
    #[serde(default)]
    pub bid_price: Option<Vec<Decimal>>,
    #[serde(default)]
    pub bid_volume: Option<Vec<Decimal>>,
    #[serde(default)]
    pub ask_price: Option<Vec<Decimal>>,
    #[serde(default)]
    pub ask_volume: Option<Vec<Decimal>>,
    #[serde(default)]
    pub is_snapshot: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PayloadKind {
    Tick,
    BidAsk { snapshot: bool },
    Ignored,
}

impl RawPayload {
    fn classify(&self) -> PayloadKind {
        match self.kind.as_deref() {
            Some(k) if k.eq_ignore_ascii_case("tick") || k.eq_ignore_ascii_case("trade") => PayloadKind::Tick,
            Some(k) if k.eq_ignore_ascii_case("bidask") || k.eq_ignore_ascii_case("quote") => PayloadKind::BidAsk {
                snapshot: self.is_snapshot,
            },
            Some(k) if k.eq_ignore_ascii_case("snapshot") => PayloadKind::BidAsk { snapshot: true },
            Some(_) => PayloadKind::Ignored,
            None if self.has_book_fields() => PayloadKind::BidAsk {
                snapshot: self.is_snapshot,
            },
            None if self.price.is_some() => PayloadKind::Tick,
            None => PayloadKind::Ignored,
        }
    }

    fn has_book_fields(&self) -> bool {
        self.bid_price.is_some() || self.bid_volume.is_some() || self.ask_price.is_some() || self.ask_volume.is_some()
    }
}

/// Normalizer behaviour switches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Exchange timestamps further ahead of local time are clamped (0 = off)
    pub max_future_skew_ns: i64,
    /// Synthesize a missing side this many ticks away from the other best (off when `None`)
    pub synthetic_side_ticks: Option<u32>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            max_future_skew_ns: 5_000_000_000,
            synthetic_side_ticks: None,
        }
    }
}

/// Counters exposed to the metrics collaborator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NormalizerStats {
    pub ticks: u64,
    pub book_updates: u64,
    pub ignored: u64,
    pub malformed: u64,
    pub stale: u64,
    pub clamped_ts: u64,
    pub synthesized: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct SequenceCursor {
    last_seq: u64,
    seen: bool,
}

/// Stateful normalizer. Owned by the ingest thread.
pub struct Normalizer {
    registry: InstrumentRegistry,
    cursors: Vec<SequenceCursor>,
    config: NormalizerConfig,
    stats: NormalizerStats,
    last_skew_log_ns: i64,
}

impl Normalizer {
    pub fn new(registry: InstrumentRegistry, config: NormalizerConfig) -> Self {
        let cursors = vec![SequenceCursor::default(); registry.len()];
        Self {
            registry,
            cursors,
            config,
            stats: NormalizerStats::default(),
            last_skew_log_ns: i64::MIN,
        }
    }

    #[inline]
    pub fn registry(&self) -> &InstrumentRegistry {
        &self.registry
    }

    #[inline]
    pub fn stats(&self) -> NormalizerStats {
        self.stats
    }

    /// Last accepted sequence for an instrument, if any.
    pub fn last_seq(&self, instrument: InstrumentId) -> Option<u64> {
        self.cursors
            .get(instrument as usize)
            .filter(|c| c.seen)
            .map(|c| c.last_seq)
    }

    /// Forget sequence history after an upstream reconnect (`None` = all).
    pub fn reset_sequence(&mut self, instrument: Option<InstrumentId>) {
        match instrument {
            Some(id) => {
                if let Some(cursor) = self.cursors.get_mut(id as usize) {
                    *cursor = SequenceCursor::default();
                }
            }
            None => self.cursors.iter_mut().for_each(|c| *c = SequenceCursor::default()),
        }
    }

    /// Decode a JSON payload and normalize it.
    pub fn normalize_json(&mut self, bytes: &[u8], now_ns: i64) -> Result<Option<MarketEvent>, NormalizeError> {
        match serde_json::from_slice::<RawPayload>(bytes) {
            Ok(payload) => self.normalize(&payload, now_ns),
            Err(e) => {
                debug!(error = %e, "undecodable payload");
                Err(self.reject(MalformedReason::Unparsable, None))
            }
        }
    }

    /// Normalize one payload.
    pub fn normalize(&mut self, payload: &RawPayload, now_ns: i64) -> Result<Option<MarketEvent>, NormalizeError> {
        let kind = payload.classify();
        if kind == PayloadKind::Ignored {
            self.stats.ignored += 1;
            return Ok(None);
        }

        let symbol = match payload.symbol.as_deref() {
            Some(s) if !s.is_empty() => s,
            _ => return Err(self.reject(MalformedReason::MissingSymbol, None)),
        };
        let (instrument, codec) = match self.registry.lookup(symbol) {
            Some(id) => match self.registry.codec(id) {
                Some(codec) => (id, *codec),
                None => return Err(self.reject(MalformedReason::UnknownInstrument, Some(symbol))),
            },
            None => return Err(self.reject(MalformedReason::UnknownInstrument, Some(symbol))),
        };

        let exch_ts = match payload.ts.as_ref().map(RawTimestamp::to_epoch_ns).transpose() {
            Ok(ts) => self.clamp_future(ts.unwrap_or(0), now_ns, instrument),
            Err(reason) => return Err(self.reject(reason, Some(symbol))),
        };

        let event = match kind {
            PayloadKind::Tick => match self.build_tick(payload, &codec, instrument, exch_ts, now_ns) {
                Ok(tick) => MarketEvent::Tick(tick),
                Err(reason) => return Err(self.reject(reason, Some(symbol))),
            },
            PayloadKind::BidAsk { snapshot } => {
                match self.build_bidask(payload, &codec, instrument, exch_ts, now_ns, snapshot) {
                    Ok(book) => MarketEvent::BidAsk(book),
                    Err(reason) => return Err(self.reject(reason, Some(symbol))),
                }
            }
            PayloadKind::Ignored => return Ok(None),
        };

        Ok(Some(self.sequence(event, payload.seq)))
    }

    fn reject(&mut self, reason: MalformedReason, symbol: Option<&str>) -> NormalizeError {
        self.stats.malformed += 1;
        debug!(reason = %reason, symbol = symbol.unwrap_or(""), "dropping malformed payload");
        NormalizeError::MalformedPayload(reason)
    }

    fn clamp_future(&mut self, exch_ts: i64, now_ns: i64, instrument: InstrumentId) -> i64 {
        let max_skew = self.config.max_future_skew_ns;
        if exch_ts == 0 || max_skew <= 0 {
            return exch_ts;
        }
        let ahead = exch_ts.saturating_sub(now_ns);
        if ahead <= max_skew {
            return exch_ts;
        }
        self.stats.clamped_ts += 1;
        if now_ns.saturating_sub(self.last_skew_log_ns) >= SKEW_LOG_COOLDOWN_NS {
            warn!(instrument, ahead_ns = ahead, max_ns = max_skew, "exchange timestamp in future, clamping");
            self.last_skew_log_ns = now_ns;
        }
        now_ns
    }

    fn build_tick(
        &mut self,
        payload: &RawPayload,
        codec: &PriceCodec,
        instrument: InstrumentId,
        exch_ts: i64,
        now_ns: i64,
    ) -> Result<TickEvent, MalformedReason> {
        let price = payload.price.ok_or(MalformedReason::MissingPrice)?;
        let price = codec.price_to_ticks(price)?;
        if price == 0 {
            return Err(MalformedReason::MissingPrice);
        }
        let size = payload.size.map(|s| codec.size_to_lots(s)).transpose()?.unwrap_or(0);
        let total_volume = payload
            .total_volume
            .map(|v| codec.size_to_lots(v))
            .transpose()?
            .unwrap_or(0);

        self.stats.ticks += 1;
        Ok(TickEvent {
            instrument,
            seq: 0,
            exch_ts,
            local_ts: now_ns,
            price,
            size,
            total_volume,
            simtrade: payload.simtrade,
            odd_lot: payload.odd_lot,
            stale: false,
        })
    }

    fn build_bidask(
        &mut self,
        payload: &RawPayload,
        codec: &PriceCodec,
        instrument: InstrumentId,
        exch_ts: i64,
        now_ns: i64,
        is_snapshot: bool,
    ) -> Result<BidAskEvent, MalformedReason> {
        let mut bids = scale_side(
            codec,
            payload.bid_price.as_deref(),
            payload.bid_volume.as_deref(),
            Side::Bid,
        )?;
        let mut asks = scale_side(
            codec,
            payload.ask_price.as_deref(),
            payload.ask_volume.as_deref(),
            Side::Ask,
        )?;

        let mut synthesized = false;
        if let Some(ticks) = self.config.synthetic_side_ticks {
            synthesized = synthesize_missing(&mut bids, &mut asks, i64::from(ticks));
            if synthesized {
                self.stats.synthesized += 1;
            }
        }

        self.stats.book_updates += 1;
        Ok(BidAskEvent {
            instrument,
            seq: 0,
            exch_ts,
            local_ts: now_ns,
            bids,
            asks,
            is_snapshot,
            synthesized,
            stale: false,
        })
    }

    /// Assign the sequence number and tag stale events.
    fn sequence(&mut self, mut event: MarketEvent, payload_seq: Option<u64>) -> MarketEvent {
        let Some(instrument) = event.instrument() else {
            return event;
        };
        let Some(cursor) = self.cursors.get_mut(instrument as usize) else {
            return event;
        };
        let seq = payload_seq.unwrap_or_else(|| if cursor.seen { cursor.last_seq.saturating_add(1) } else { 1 });
        let stale = cursor.seen && seq <= cursor.last_seq;
        if stale {
            self.stats.stale += 1;
            debug!(instrument, seq, last = cursor.last_seq, "stale sequence");
        } else {
            cursor.last_seq = seq;
            cursor.seen = true;
        }
        match &mut event {
            MarketEvent::Tick(t) => {
                t.seq = seq;
                t.stale = stale;
            }
            MarketEvent::BidAsk(b) => {
                b.seq = seq;
                b.stale = stale;
            }
            MarketEvent::FeedGap(_) => {}
        }
        event
    }
}

/// Scale one side into canonical best-first order.
///
/// Zero prices are empty-slot placeholders and are skipped. At most the best
/// `MAX_PAYLOAD_LEVELS` are kept while scanning, and levels beyond
/// `MAX_DEPTH` are dropped after sorting.
fn scale_side(
    codec: &PriceCodec,
    prices: Option<&[Decimal]>,
    sizes: Option<&[Decimal]>,
    side: Side,
) -> Result<Option<BookSide>, MalformedReason> {
    if prices.is_none() && sizes.is_none() {
        return Ok(None);
    }
    let prices = prices.unwrap_or(&[]);
    let sizes = sizes.unwrap_or(&[]);
    if prices.len() != sizes.len() {
        return Err(MalformedReason::LevelMismatch);
    }

    let mut scratch: ArrayVec<Level, MAX_PAYLOAD_LEVELS> = ArrayVec::new();
    for (price, size) in prices.iter().zip(sizes.iter()) {
        let price = codec.price_to_ticks(*price)?;
        let size = codec.size_to_lots(*size)?;
        if price == 0 || size == 0 {
            continue;
        }
        let level = Level::new(price, size);
        if let Err(full) = scratch.try_push(level) {
            // Full: the new level evicts the current worst only if it is better
            let worse = |a: i64, b: i64| match side {
                Side::Bid => a < b,
                Side::Ask => a > b,
            };
            let Some((worst, kept)) = scratch
                .iter()
                .enumerate()
                .reduce(|acc, cur| if worse(cur.1.price, acc.1.price) { cur } else { acc })
            else {
                continue;
            };
            if kept.price == price {
                return Err(MalformedReason::DuplicateLevel);
            }
            if worse(kept.price, price) {
                scratch[worst] = full.element();
            }
        }
    }

    match side {
        Side::Bid => scratch.sort_unstable_by(|a, b| b.price.cmp(&a.price)),
        Side::Ask => scratch.sort_unstable_by(|a, b| a.price.cmp(&b.price)),
    }
    if scratch.windows(2).any(|w| w[0].price == w[1].price) {
        return Err(MalformedReason::DuplicateLevel);
    }
    Ok(Some(BookSide::from_levels(&scratch)))
}

/// Fill a missing or empty side with one level `ticks` away from the other best.
fn synthesize_missing(bids: &mut Option<BookSide>, asks: &mut Option<BookSide>, ticks: i64) -> bool {
    let best_bid = bids.as_ref().and_then(BookSide::best);
    let best_ask = asks.as_ref().and_then(BookSide::best);
    match (best_bid, best_ask) {
        (None, Some(ask)) => {
            let price = (ask.price - ticks).max(1);
            *bids = Some(BookSide::from_levels(&[Level::new(price, 1)]));
            true
        }
        (Some(bid), None) => {
            *asks = Some(BookSide::from_levels(&[Level::new(bid.price + ticks, 1)]));
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MAX_DEPTH;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn decs(values: &[&str]) -> Option<Vec<Decimal>> {
        Some(values.iter().map(|v| dec(v)).collect())
    }

    fn normalizer() -> Normalizer {
        let mut registry = InstrumentRegistry::new();
        registry.register("TXF", dec("0.05"), Decimal::ONE).unwrap();
        registry.register("2330", dec("0.5"), Decimal::ONE).unwrap();
        Normalizer::new(registry, NormalizerConfig::default())
    }

    fn tick(symbol: &str, price: &str, seq: Option<u64>) -> RawPayload {
        RawPayload {
            kind: Some("tick".into()),
            symbol: Some(symbol.into()),
            seq,
            price: Some(dec(price)),
            size: Some(dec("3")),
            ..Default::default()
        }
    }

    #[test]
    fn test_tick_fixed_point() {
        let mut n = normalizer();
        let event = n.normalize(&tick("TXF", "101.30", Some(1)), 0).unwrap().unwrap();
        match event {
            MarketEvent::Tick(t) => {
                assert_eq!(t.price, 2026);
                assert_eq!(t.size, 3);
                assert_eq!(t.seq, 1);
                assert!(!t.stale);
            }
            other => panic!("expected tick, got {:?}", other),
        }
        assert_eq!(n.stats().ticks, 1);
    }

    #[test]
    fn test_bids_only_keeps_ask_absent() {
        let mut n = normalizer();
        let payload = RawPayload {
            kind: Some("bidask".into()),
            symbol: Some("TXF".into()),
            bid_price: decs(&["101.25", "101.20"]),
            bid_volume: decs(&["100", "50"]),
            ..Default::default()
        };
        let event = n.normalize(&payload, 0).unwrap().unwrap();
        let MarketEvent::BidAsk(book) = event else {
            panic!("expected bidask");
        };
        assert_eq!(book.asks, None);
        let bids = book.bids.unwrap();
        assert_eq!(bids.as_slice(), &[Level::new(2025, 100), Level::new(2024, 50)]);
        assert!(!book.synthesized);
    }

    #[test]
    fn test_empty_array_is_known_empty_side() {
        let mut n = normalizer();
        let payload = RawPayload {
            kind: Some("bidask".into()),
            symbol: Some("TXF".into()),
            bid_price: decs(&["101.25"]),
            bid_volume: decs(&["1"]),
            ask_price: decs(&[]),
            ask_volume: decs(&[]),
            ..Default::default()
        };
        let Some(MarketEvent::BidAsk(book)) = n.normalize(&payload, 0).unwrap() else {
            panic!("expected bidask");
        };
        assert_eq!(book.asks, Some(BookSide::empty()));
    }

    #[test]
    fn test_zero_placeholders_skipped_and_sorted() {
        let mut n = normalizer();
        let payload = RawPayload {
            kind: Some("bidask".into()),
            symbol: Some("TXF".into()),
            ask_price: decs(&["101.40", "0", "101.35"]),
            ask_volume: decs(&["5", "0", "7"]),
            ..Default::default()
        };
        let Some(MarketEvent::BidAsk(book)) = n.normalize(&payload, 0).unwrap() else {
            panic!("expected bidask");
        };
        assert_eq!(
            book.asks.unwrap().as_slice(),
            &[Level::new(2027, 7), Level::new(2028, 5)]
        );
    }

    #[test]
    fn test_malformed_counted() {
        let mut n = normalizer();
        let off_tick = tick("TXF", "101.32", None);
        assert_eq!(
            n.normalize(&off_tick, 0),
            Err(NormalizeError::MalformedPayload(MalformedReason::OffTickPrice))
        );
        let unknown = tick("NOPE", "1", None);
        assert_eq!(
            n.normalize(&unknown, 0),
            Err(NormalizeError::MalformedPayload(MalformedReason::UnknownInstrument))
        );
        let mismatch = RawPayload {
            kind: Some("bidask".into()),
            symbol: Some("TXF".into()),
            bid_price: decs(&["101.25", "101.20"]),
            bid_volume: decs(&["1"]),
            ..Default::default()
        };
        assert_eq!(
            n.normalize(&mismatch, 0),
            Err(NormalizeError::MalformedPayload(MalformedReason::LevelMismatch))
        );
        assert_eq!(n.stats().malformed, 3);
        // Malformed payloads do not consume sequence numbers
        assert_eq!(n.last_seq(0), None);
    }

    #[test]
    fn test_duplicate_level_rejected() {
        let mut n = normalizer();
        let payload = RawPayload {
            kind: Some("bidask".into()),
            symbol: Some("TXF".into()),
            bid_price: decs(&["101.25", "101.25"]),
            bid_volume: decs(&["1", "2"]),
            ..Default::default()
        };
        assert_eq!(
            n.normalize(&payload, 0),
            Err(NormalizeError::MalformedPayload(MalformedReason::DuplicateLevel))
        );
    }

    #[test]
    fn test_stale_and_duplicate_sequence() {
        let mut n = normalizer();
        n.normalize(&tick("TXF", "100", Some(10)), 0).unwrap();
        let dup = n.normalize(&tick("TXF", "100", Some(10)), 0).unwrap().unwrap();
        let older = n.normalize(&tick("TXF", "100", Some(7)), 0).unwrap().unwrap();
        let newer = n.normalize(&tick("TXF", "100", Some(11)), 0).unwrap().unwrap();
        assert!(dup.is_stale());
        assert!(older.is_stale());
        assert!(!newer.is_stale());
        assert_eq!(n.stats().stale, 2);
        assert_eq!(n.last_seq(0), Some(11));
        // Other instruments have their own sequence space
        let other = n.normalize(&tick("2330", "600", Some(1)), 0).unwrap().unwrap();
        assert!(!other.is_stale());
    }

    #[test]
    fn test_implicit_sequence_and_reset() {
        let mut n = normalizer();
        let a = n.normalize(&tick("TXF", "100", None), 0).unwrap().unwrap();
        let b = n.normalize(&tick("TXF", "100", None), 0).unwrap().unwrap();
        assert_eq!((a.seq(), b.seq()), (Some(1), Some(2)));

        n.normalize(&tick("TXF", "100", Some(500)), 0).unwrap();
        n.reset_sequence(Some(0));
        let restarted = n.normalize(&tick("TXF", "100", Some(1)), 0).unwrap().unwrap();
        assert!(!restarted.is_stale());
    }

    #[test]
    fn test_deep_payload_keeps_best_levels() {
        let mut n = normalizer();
        // 70 bids listed worst first, 70 asks listed best first
        let bid_prices: Vec<Decimal> = (0..70).map(|i| Decimal::new(9_000 + 5 * i, 2)).collect();
        let ask_prices: Vec<Decimal> = (0..70).map(|i| Decimal::new(10_000 + 5 * i, 2)).collect();
        let payload = RawPayload {
            kind: Some("bidask".into()),
            symbol: Some("TXF".into()),
            bid_price: Some(bid_prices),
            bid_volume: Some(vec![Decimal::ONE; 70]),
            ask_price: Some(ask_prices),
            ask_volume: Some(vec![Decimal::TWO; 70]),
            ..Default::default()
        };
        let Some(MarketEvent::BidAsk(book)) = n.normalize(&payload, 0).unwrap() else {
            panic!("expected bidask");
        };
        let bids = book.bids.unwrap();
        let asks = book.asks.unwrap();
        assert_eq!(bids.len(), MAX_DEPTH);
        assert_eq!(asks.len(), MAX_DEPTH);
        assert_eq!(bids.best(), Some(Level::new(1_869, 1)));
        assert_eq!(asks.best(), Some(Level::new(2_000, 2)));
        assert_eq!(bids.as_slice()[MAX_DEPTH - 1].price, 1_869 - (MAX_DEPTH as i64 - 1));
        assert!(bids.is_well_formed(Side::Bid) && asks.is_well_formed(Side::Ask));
        assert_eq!(n.stats().malformed, 0);
    }

    #[test]
    fn test_duplicate_rejected_in_deep_payload() {
        let mut n = normalizer();
        let mut prices: Vec<Decimal> = (0..MAX_PAYLOAD_LEVELS as i64).map(|i| Decimal::new(9_000 + 5 * i, 2)).collect();
        prices.push(Decimal::new(9_000, 2));
        let payload = RawPayload {
            kind: Some("bidask".into()),
            symbol: Some("TXF".into()),
            bid_volume: Some(vec![Decimal::ONE; prices.len()]),
            bid_price: Some(prices),
            ..Default::default()
        };
        assert_eq!(
            n.normalize(&payload, 0),
            Err(NormalizeError::MalformedPayload(MalformedReason::DuplicateLevel))
        );
    }

    #[test]
    fn test_implicit_sequence_after_max_seq() {
        let mut n = normalizer();
        let last = n.normalize(&tick("TXF", "100", Some(u64::MAX)), 0).unwrap().unwrap();
        assert!(!last.is_stale());
        let next = n.normalize(&tick("TXF", "100", None), 0).unwrap().unwrap();
        assert_eq!(next.seq(), Some(u64::MAX));
        assert!(next.is_stale());
    }

    #[test]
    fn test_ignored_kind() {
        let mut n = normalizer();
        let hb = RawPayload {
            kind: Some("heartbeat".into()),
            ..Default::default()
        };
        assert_eq!(n.normalize(&hb, 0), Ok(None));
        assert_eq!(n.stats().ignored, 1);
    }

    #[test]
    fn test_future_timestamp_clamped() {
        let mut n = normalizer();
        let now = 1_700_000_000_000_000_000i64;
        let mut payload = tick("TXF", "100", None);
        payload.ts = Some(RawTimestamp::Int(now + 60_000_000_000));
        let Some(MarketEvent::Tick(t)) = n.normalize(&payload, now).unwrap() else {
            panic!("expected tick");
        };
        assert_eq!(t.exch_ts, now);
        assert_eq!(n.stats().clamped_ts, 1);
    }

    #[test]
    fn test_timestamp_units() {
        assert_eq!(coerce_epoch_ns(1_700_000_000), 1_700_000_000_000_000_000);
        assert_eq!(coerce_epoch_ns(1_700_000_000_000), 1_700_000_000_000_000_000);
        assert_eq!(coerce_epoch_ns(1_700_000_000_000_000_000), 1_700_000_000_000_000_000);
        let text = RawTimestamp::Text("2024-01-02T03:04:05.5Z".into());
        assert_eq!(text.to_epoch_ns(), Ok(1_704_164_645_500_000_000));
        let naive = RawTimestamp::Text("2024-01-02T03:04:05".into());
        assert_eq!(naive.to_epoch_ns(), Ok(1_704_164_645_000_000_000));
        assert!(RawTimestamp::Text("yesterday".into()).to_epoch_ns().is_err());
    }

    #[test]
    fn test_synthetic_side_when_configured() {
        let mut registry = InstrumentRegistry::new();
        registry.register("TXF", dec("0.05"), Decimal::ONE).unwrap();
        let config = NormalizerConfig {
            synthetic_side_ticks: Some(2),
            ..Default::default()
        };
        let mut n = Normalizer::new(registry, config);
        let payload = RawPayload {
            kind: Some("bidask".into()),
            symbol: Some("TXF".into()),
            bid_price: decs(&["101.25"]),
            bid_volume: decs(&["10"]),
            ..Default::default()
        };
        let Some(MarketEvent::BidAsk(book)) = n.normalize(&payload, 0).unwrap() else {
            panic!("expected bidask");
        };
        assert!(book.synthesized);
        assert_eq!(book.asks.unwrap().best(), Some(Level::new(2027, 1)));
        assert_eq!(n.stats().synthesized, 1);
    }

    #[test]
    fn test_json_payload() {
        let mut n = normalizer();
        let json = br#"{"type":"bidask","code":"TXF","seq":3,"ts":1700000000,
            "bid_price":["101.25","101.20"],"bid_volume":[100,50]}"#;
        let Some(MarketEvent::BidAsk(book)) = n.normalize_json(json, 1_700_000_000_000_000_000).unwrap() else {
            panic!("expected bidask");
        };
        assert_eq!(book.seq, 3);
        assert_eq!(book.exch_ts, 1_700_000_000_000_000_000);
        assert_eq!(book.bids.unwrap().best(), Some(Level::new(2025, 100)));

        assert_eq!(
            n.normalize_json(b"{not json", 0),
            Err(NormalizeError::MalformedPayload(MalformedReason::Unparsable))
        );
    }
}
