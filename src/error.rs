//! Error taxonomy for the pipeline.
//!
//! Hot-path errors are small `Copy` values so they can be returned without
//! allocating. Only startup-time errors (configuration, mapping shared
//! memory) carry owned strings or I/O errors.

use thiserror::Error;

use crate::event::InstrumentId;

/// Why a raw payload was rejected by the normalizer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MalformedReason {
    /// No instrument code in the payload
    MissingSymbol = 0,
    /// Instrument code not present in the registry
    UnknownInstrument = 1,
    /// Tick payload without a price
    MissingPrice = 2,
    /// Price is not an integer multiple of the tick size
    OffTickPrice = 3,
    /// Size is not an integer multiple of the lot size
    OffLotSize = 4,
    /// Negative price or size
    NegativeValue = 5,
    /// Value does not fit the fixed-point representation
    Overflow = 6,
    /// Price and size arrays have different lengths
    LevelMismatch = 7,
    /// Two levels with the same price on one side
    DuplicateLevel = 8,
    /// Payload could not be decoded at all
    Unparsable = 9,
    /// Timestamp field present but not understood
    BadTimestamp = 10,
}

impl MalformedReason {
    /// Stable short label for logs and metric labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            MalformedReason::MissingSymbol => "missing_symbol",
            MalformedReason::UnknownInstrument => "unknown_instrument",
            MalformedReason::MissingPrice => "missing_price",
            MalformedReason::OffTickPrice => "off_tick_price",
            MalformedReason::OffLotSize => "off_lot_size",
            MalformedReason::NegativeValue => "negative_value",
            MalformedReason::Overflow => "overflow",
            MalformedReason::LevelMismatch => "level_mismatch",
            MalformedReason::DuplicateLevel => "duplicate_level",
            MalformedReason::Unparsable => "unparsable",
            MalformedReason::BadTimestamp => "bad_timestamp",
        }
    }
}

impl std::fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalizer failure. The record is dropped and counted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("malformed payload: {0}")]
    MalformedPayload(MalformedReason),
}

/// Event bus failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum BusError {
    /// Topic full under the blocking policy and the timeout elapsed.
    #[error("topic `{topic}` is full")]
    Full { topic: &'static str },
    /// Every subscriber cursor of the topic is taken.
    #[error("topic `{topic}` has no free subscriber slot")]
    TooManySubscribers { topic: &'static str },
}

/// Wire record decoding failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("unknown record kind {0}")]
    UnknownKind(u16),
    #[error("record kind {found} where {expected} was expected")]
    UnexpectedKind { expected: u16, found: u16 },
}

/// IPC ring failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum RingError {
    /// Ring stayed full for the whole retry policy; try again later.
    #[error("ring buffer contention after {attempts} attempts")]
    Contention { attempts: u32 },
    /// Slot contents could not be decoded.
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Shared-memory mapping failure (startup only).
#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shared memory I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("region is {actual} bytes, layout needs {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("bad ring header: {0}")]
    BadHeader(&'static str),
    #[error("ring capacity {0} is not a power of two >= 2 that fits in memory")]
    BadCapacity(u64),
}

/// Configuration rejected at startup. Never produced at runtime.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration invalid: {0}")]
    Invalid(String),
    #[error("configuration unreadable: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("configuration file: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error for wiring code and binaries.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error("stale sequence {seq} for instrument {instrument} (last {last})")]
    StaleSequence {
        instrument: InstrumentId,
        seq: u64,
        last: u64,
    },
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error(transparent)]
    Shm(#[from] ShmError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
