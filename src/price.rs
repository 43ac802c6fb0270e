//! Fixed-point price codec and instrument registry.
//!
//! Prices are stored as integer multiples of the instrument tick size and
//! sizes as integer multiples of the lot size. Decimals only exist at the
//! boundary (payload in, display out).

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;

use crate::error::{ConfigError, MalformedReason};
use crate::event::InstrumentId;

/// Converts between decimal prices/sizes and fixed-point integers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PriceCodec {
    tick_size: Decimal,
    lot_size: Decimal,
}

impl PriceCodec {
    /// Create a codec. Both increments must be strictly positive.
    pub fn new(tick_size: Decimal, lot_size: Decimal) -> Result<Self, ConfigError> {
        if tick_size <= Decimal::ZERO {
            return Err(ConfigError::Invalid(format!("tick size {tick_size} must be positive")));
        }
        if lot_size <= Decimal::ZERO {
            return Err(ConfigError::Invalid(format!("lot size {lot_size} must be positive")));
        }
        Ok(Self { tick_size, lot_size })
    }

    #[inline]
    pub fn tick_size(&self) -> Decimal {
        self.tick_size
    }

    #[inline]
    pub fn lot_size(&self) -> Decimal {
        self.lot_size
    }

    /// Decimal price -> ticks. Off-tick prices are rejected, never rounded.
    #[inline]
    pub fn price_to_ticks(&self, price: Decimal) -> Result<i64, MalformedReason> {
        Self::to_units(price, self.tick_size, MalformedReason::OffTickPrice)
    }

    /// Decimal size -> lots. Fractional lots are rejected.
    #[inline]
    pub fn size_to_lots(&self, size: Decimal) -> Result<i64, MalformedReason> {
        Self::to_units(size, self.lot_size, MalformedReason::OffLotSize)
    }

    /// Ticks -> decimal price (exact).
    #[inline]
    pub fn ticks_to_price(&self, ticks: i64) -> Decimal {
        Decimal::from(ticks) * self.tick_size
    }

    /// Lots -> decimal size (exact).
    #[inline]
    pub fn lots_to_size(&self, lots: i64) -> Decimal {
        Decimal::from(lots) * self.lot_size
    }

    /// Mid expressed as `bid + ask` ticks -> decimal price (exact, may be a half tick).
    #[inline]
    pub fn mid_x2_to_price(&self, mid_x2: i64) -> Decimal {
        Decimal::from(mid_x2) * self.tick_size / Decimal::TWO
    }

    fn to_units(value: Decimal, increment: Decimal, off_grid: MalformedReason) -> Result<i64, MalformedReason> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(MalformedReason::NegativeValue);
        }
        let units = value.checked_div(increment).ok_or(MalformedReason::Overflow)?;
        if !units.fract().is_zero() {
            return Err(off_grid);
        }
        units.to_i64().ok_or(MalformedReason::Overflow)
    }
}

/// Static description of one tradable instrument.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstrumentSpec {
    pub id: InstrumentId,
    pub symbol: String,
    pub codec: PriceCodec,
}

/// Symbol -> instrument lookup. Ids are dense, assigned in registration order.
#[derive(Clone, Debug, Default)]
pub struct InstrumentRegistry {
    specs: Vec<InstrumentSpec>,
    by_symbol: FxHashMap<String, InstrumentId>,
}

impl InstrumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instrument and return its id.
    pub fn register(&mut self, symbol: &str, tick_size: Decimal, lot_size: Decimal) -> Result<InstrumentId, ConfigError> {
        if symbol.is_empty() {
            return Err(ConfigError::Invalid("empty instrument symbol".into()));
        }
        if self.by_symbol.contains_key(symbol) {
            return Err(ConfigError::Invalid(format!("instrument `{symbol}` registered twice")));
        }
        let codec = PriceCodec::new(tick_size, lot_size)?;
        let id = InstrumentId::try_from(self.specs.len())
            .map_err(|_| ConfigError::Invalid("too many instruments".into()))?;
        self.specs.push(InstrumentSpec {
            id,
            symbol: symbol.to_owned(),
            codec,
        });
        self.by_symbol.insert(symbol.to_owned(), id);
        Ok(id)
    }

    #[inline]
    pub fn lookup(&self, symbol: &str) -> Option<InstrumentId> {
        self.by_symbol.get(symbol).copied()
    }

    #[inline]
    pub fn get(&self, id: InstrumentId) -> Option<&InstrumentSpec> {
        self.specs.get(id as usize)
    }

    #[inline]
    pub fn codec(&self, id: InstrumentId) -> Option<&PriceCodec> {
        self.get(id).map(|s| &s.codec)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstrumentSpec> {
        self.specs.iter()
    }
}
