//! Wire format for ring slots.
//!
//! Every record is exactly one 64-byte slot, little-endian, starting with a
//! `u16` record kind.
//!
//! ## SnapshotRecord (kind 1)
//!
//! | offset | size | field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 2    | kind                                    |
//! | 2      | 2    | flags (has_bid, has_ask, stale, has_imb)|
//! | 4      | 4    | instrument                              |
//! | 8      | 8    | seq                                     |
//! | 16     | 8    | exch_ts (ns)                            |
//! | 24     | 8    | best bid (ticks)                        |
//! | 32     | 8    | best bid size (lots)                    |
//! | 40     | 8    | best ask (ticks)                        |
//! | 48     | 8    | best ask size (lots)                    |
//! | 56     | 8    | imbalance (f64 bits)                    |
//!
//! ## ControlRecord (kind 2)
//!
//! | offset | size | field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 2    | kind                                    |
//! | 2      | 2    | kill command (0 none, 1 engage, 2 reset)|
//! | 4      | 4    | instrument (`ALL_INSTRUMENTS` = all)    |
//! | 8      | 4    | rate limit max orders (0 = unchanged)   |
//! | 12     | 4    | reserved                                |
//! | 16     | 8    | rate limit window (ns)                  |
//! | 24     | 8    | issued at (ns)                          |
//! | 32     | 32   | reserved                                |

use byteorder::{ByteOrder, LittleEndian};

use crate::error::WireError;
use crate::event::{InstrumentId, Level, LobStatsEvent};

/// Bytes per ring slot.
pub const SLOT_SIZE: usize = 64;

/// Instrument id meaning "every instrument" in control records.
pub const ALL_INSTRUMENTS: InstrumentId = u32::MAX;

pub type Slot = [u8; SLOT_SIZE];

/// A fixed-size record that fits one slot.
pub trait WireRecord: Sized {
    const KIND: u16;

    /// Write the record, kind included. Unused bytes are zeroed.
    fn encode(&self, slot: &mut Slot);

    /// Decode a slot known to hold `Self::KIND`.
    fn decode_body(slot: &Slot) -> Self;

    /// Decode, checking the kind.
    fn decode(slot: &Slot) -> Result<Self, WireError> {
        let found = record_kind(slot);
        if found != Self::KIND {
            return Err(WireError::UnexpectedKind {
                expected: Self::KIND,
                found,
            });
        }
        Ok(Self::decode_body(slot))
    }
}

/// Kind tag of a slot.
#[inline]
pub fn record_kind(slot: &Slot) -> u16 {
    LittleEndian::read_u16(&slot[0..2])
}

const FLAG_HAS_BID: u16 = 1 << 0;
const FLAG_HAS_ASK: u16 = 1 << 1;
const FLAG_STALE: u16 = 1 << 2;
const FLAG_HAS_IMBALANCE: u16 = 1 << 3;

/// Top-of-book snapshot exported to the strategy process.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SnapshotRecord {
    pub instrument: InstrumentId,
    pub seq: u64,
    pub exch_ts: i64,
    pub best_bid: Option<Level>,
    pub best_ask: Option<Level>,
    pub imbalance: Option<f64>,
    pub stale: bool,
}

impl SnapshotRecord {
    pub fn from_stats(stats: &LobStatsEvent) -> Self {
        Self {
            instrument: stats.instrument,
            seq: stats.seq,
            exch_ts: stats.exch_ts,
            best_bid: stats.best_bid,
            best_ask: stats.best_ask,
            imbalance: stats.imbalance,
            stale: stats.stale,
        }
    }
}

impl WireRecord for SnapshotRecord {
    const KIND: u16 = 1;

    fn encode(&self, slot: &mut Slot) {
        slot.fill(0);
        let mut flags = 0u16;
        if self.best_bid.is_some() {
            flags |= FLAG_HAS_BID;
        }
        if self.best_ask.is_some() {
            flags |= FLAG_HAS_ASK;
        }
        if self.stale {
            flags |= FLAG_STALE;
        }
        if self.imbalance.is_some() {
            flags |= FLAG_HAS_IMBALANCE;
        }
        let bid = self.best_bid.unwrap_or_default();
        let ask = self.best_ask.unwrap_or_default();
        LittleEndian::write_u16(&mut slot[0..2], Self::KIND);
        LittleEndian::write_u16(&mut slot[2..4], flags);
        LittleEndian::write_u32(&mut slot[4..8], self.instrument);
        LittleEndian::write_u64(&mut slot[8..16], self.seq);
        LittleEndian::write_i64(&mut slot[16..24], self.exch_ts);
        LittleEndian::write_i64(&mut slot[24..32], bid.price);
        LittleEndian::write_i64(&mut slot[32..40], bid.size);
        LittleEndian::write_i64(&mut slot[40..48], ask.price);
        LittleEndian::write_i64(&mut slot[48..56], ask.size);
        LittleEndian::write_f64(&mut slot[56..64], self.imbalance.unwrap_or(0.0));
    }

    fn decode_body(slot: &Slot) -> Self {
        let flags = LittleEndian::read_u16(&slot[2..4]);
        let bid = Level::new(
            LittleEndian::read_i64(&slot[24..32]),
            LittleEndian::read_i64(&slot[32..40]),
        );
        let ask = Level::new(
            LittleEndian::read_i64(&slot[40..48]),
            LittleEndian::read_i64(&slot[48..56]),
        );
        Self {
            instrument: LittleEndian::read_u32(&slot[4..8]),
            seq: LittleEndian::read_u64(&slot[8..16]),
            exch_ts: LittleEndian::read_i64(&slot[16..24]),
            best_bid: (flags & FLAG_HAS_BID != 0).then_some(bid),
            best_ask: (flags & FLAG_HAS_ASK != 0).then_some(ask),
            imbalance: (flags & FLAG_HAS_IMBALANCE != 0).then(|| LittleEndian::read_f64(&slot[56..64])),
            stale: flags & FLAG_STALE != 0,
        }
    }
}

/// Kill-switch command carried by a control record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u16)]
pub enum KillCommand {
    #[default]
    None = 0,
    Engage = 1,
    Reset = 2,
}

/// Risk control message from the operator / risk process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ControlRecord {
    pub kill: KillCommand,
    /// Target of a rate-limit change (`ALL_INSTRUMENTS` = global window)
    pub instrument: InstrumentId,
    /// New max orders per window; 0 leaves the limit unchanged
    pub rate_max_orders: u32,
    pub rate_window_ns: i64,
    pub issued_at: i64,
}

impl WireRecord for ControlRecord {
    const KIND: u16 = 2;

    fn encode(&self, slot: &mut Slot) {
        slot.fill(0);
        LittleEndian::write_u16(&mut slot[0..2], Self::KIND);
        LittleEndian::write_u16(&mut slot[2..4], self.kill as u16);
        LittleEndian::write_u32(&mut slot[4..8], self.instrument);
        LittleEndian::write_u32(&mut slot[8..12], self.rate_max_orders);
        LittleEndian::write_i64(&mut slot[16..24], self.rate_window_ns);
        LittleEndian::write_i64(&mut slot[24..32], self.issued_at);
    }

    fn decode_body(slot: &Slot) -> Self {
        let kill = match LittleEndian::read_u16(&slot[2..4]) {
            1 => KillCommand::Engage,
            2 => KillCommand::Reset,
            _ => KillCommand::None,
        };
        Self {
            kill,
            instrument: LittleEndian::read_u32(&slot[4..8]),
            rate_max_orders: LittleEndian::read_u32(&slot[8..12]),
            rate_window_ns: LittleEndian::read_i64(&slot[16..24]),
            issued_at: LittleEndian::read_i64(&slot[24..32]),
        }
    }
}

/// Any record known to this build.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum WireMessage {
    Snapshot(SnapshotRecord),
    Control(ControlRecord),
}

impl WireMessage {
    pub fn decode(slot: &Slot) -> Result<Self, WireError> {
        match record_kind(slot) {
            SnapshotRecord::KIND => Ok(WireMessage::Snapshot(SnapshotRecord::decode_body(slot))),
            ControlRecord::KIND => Ok(WireMessage::Control(ControlRecord::decode_body(slot))),
            other => Err(WireError::UnknownKind(other)),
        }
    }

    pub fn encode(&self, slot: &mut Slot) {
        match self {
            WireMessage::Snapshot(r) => r.encode(slot),
            WireMessage::Control(r) => r.encode(slot),
        }
    }
}
