//! Risk fast gate - synchronous pre-trade check.
//!
//! Evaluation order is fixed:
//!
//! 1. kill switch (acquire load on every call)
//! 2. static limits: price, quantity, position, notional, order rate
//! 3. per-instrument policy rules
//!
//! Cancels only go through step 1. The gate never blocks, does no I/O and
//! does not log; decisions are plain values for the caller to record.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::event::{InstrumentId, LobStatsEvent};
use crate::kill_switch::KillSwitch;
use crate::rate::SlidingWindow;
use crate::wire::{ControlRecord, KillCommand, ALL_INSTRUMENTS};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OrderSide {
    Buy = 0,
    Sell = 1,
}

impl OrderSide {
    /// +1 for buys, -1 for sells.
    #[inline]
    pub const fn sign(self) -> i64 {
        match self {
            OrderSide::Buy => 1,
            OrderSide::Sell => -1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IntentKind {
    New = 0,
    Amend = 1,
    Cancel = 2,
}

/// An order the strategy wants to send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OrderIntent {
    pub instrument: InstrumentId,
    pub side: OrderSide,
    pub kind: IntentKind,
    /// Limit price in ticks
    pub price: i64,
    /// Quantity in lots
    pub qty: i64,
    pub strategy_id: u32,
    pub client_order_id: u64,
}

/// Policy rule that rejected an intent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PolicyRule {
    Halted = 0,
    ReduceOnly = 1,
    PriceBand = 2,
    MaxOrderQty = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RejectReason {
    KillSwitchEngaged,
    PriceInvalid,
    PriceLimit,
    QuantityLimit,
    QuantityInvalid,
    PositionLimit,
    NotionalLimit,
    RateLimit,
    PolicyViolation(PolicyRule),
}

impl RejectReason {
    /// Stable numeric reason code.
    pub const fn code(self) -> u8 {
        match self {
            RejectReason::KillSwitchEngaged => 1,
            RejectReason::PriceInvalid => 2,
            RejectReason::PriceLimit => 3,
            RejectReason::QuantityLimit => 4,
            RejectReason::QuantityInvalid => 5,
            RejectReason::PositionLimit => 6,
            RejectReason::NotionalLimit => 7,
            RejectReason::RateLimit => 8,
            RejectReason::PolicyViolation(_) => 9,
        }
    }
}

/// Coarse decision class for dashboards and the recorder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DecisionTag {
    Pass = 0,
    Reject = 1,
    Kill = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RiskDecision {
    Pass,
    Reject(RejectReason),
}

impl RiskDecision {
    #[inline]
    pub const fn is_pass(self) -> bool {
        matches!(self, RiskDecision::Pass)
    }

    pub const fn tag(self) -> DecisionTag {
        match self {
            RiskDecision::Pass => DecisionTag::Pass,
            RiskDecision::Reject(RejectReason::KillSwitchEngaged) => DecisionTag::Kill,
            RiskDecision::Reject(_) => DecisionTag::Reject,
        }
    }

    /// 0 for pass, otherwise the reject reason code.
    pub const fn code(self) -> u8 {
        match self {
            RiskDecision::Pass => 0,
            RiskDecision::Reject(reason) => reason.code(),
        }
    }
}

/// A decision with the intent it was made for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecisionRecord {
    pub intent: OrderIntent,
    pub decision: RiskDecision,
    pub ts: i64,
}

/// Static limits shared by every instrument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    /// Highest accepted price (ticks)
    pub max_price: i64,
    /// Largest accepted order quantity (lots)
    pub max_qty: i64,
    /// Largest absolute position after the order (lots)
    pub max_position: i64,
    /// Largest `price * qty` (tick-lots)
    pub max_notional: i64,
    /// Orders per instrument per window
    pub rate_max_orders: u32,
    pub rate_window_ns: i64,
    /// Orders across all instruments per window
    pub global_rate_max_orders: u32,
    pub global_rate_window_ns: i64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_price: 10_000_000,
            max_qty: 1_000,
            max_position: 10_000,
            max_notional: 1_000_000_000,
            rate_max_orders: 50,
            rate_window_ns: 1_000_000_000,
            global_rate_max_orders: 200,
            global_rate_window_ns: 1_000_000_000,
        }
    }
}

impl RiskLimits {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_price", self.max_price),
            ("max_qty", self.max_qty),
            ("max_position", self.max_position),
            ("max_notional", self.max_notional),
            ("rate_window_ns", self.rate_window_ns),
            ("global_rate_window_ns", self.global_rate_window_ns),
        ];
        for (name, value) in positive {
            if value <= 0 {
                return Err(ConfigError::Invalid(format!("risk limit {name} must be positive")));
            }
        }
        if self.rate_max_orders == 0 || self.global_rate_max_orders == 0 {
            return Err(ConfigError::Invalid("rate limits must admit at least one order".into()));
        }
        Ok(())
    }
}

/// Per-instrument rule evaluated after the static limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum InstrumentPolicy {
    /// No new orders at all
    Halted,
    /// Orders may only shrink the absolute position
    ReduceOnly,
    /// Limit price within `max_ticks` of the last book mid
    PriceBand { max_ticks: i64 },
    /// Tighter per-instrument quantity cap
    MaxOrderQty { max_qty: i64 },
}

#[derive(Clone, Debug)]
struct InstrumentRisk {
    position: i64,
    /// Last known `bid + ask` (ticks)
    mid_x2: Option<i64>,
    rate: SlidingWindow,
    policies: Vec<InstrumentPolicy>,
}

impl InstrumentRisk {
    fn new(limits: &RiskLimits) -> Self {
        Self {
            position: 0,
            mid_x2: None,
            rate: SlidingWindow::new(limits.rate_max_orders, limits.rate_window_ns),
            policies: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GateCounters {
    pub passed: u64,
    pub rejected: u64,
    pub killed: u64,
}

/// The gate. Owned by the order path thread.
pub struct FastGate {
    kill: KillSwitch,
    limits: RiskLimits,
    instruments: FxHashMap<InstrumentId, InstrumentRisk>,
    global_rate: SlidingWindow,
    counters: GateCounters,
}

impl FastGate {
    pub fn new(kill: KillSwitch, limits: RiskLimits) -> Self {
        Self {
            kill,
            global_rate: SlidingWindow::new(limits.global_rate_max_orders, limits.global_rate_window_ns),
            limits,
            instruments: FxHashMap::default(),
            counters: GateCounters::default(),
        }
    }

    /// Pre-create instrument state so `check` never inserts.
    pub fn register_instrument(&mut self, instrument: InstrumentId, policies: Vec<InstrumentPolicy>) {
        let limits = self.limits;
        self.instruments
            .entry(instrument)
            .or_insert_with(|| InstrumentRisk::new(&limits))
            .policies = policies;
    }

    #[inline]
    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill
    }

    #[inline]
    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    #[inline]
    pub fn counters(&self) -> GateCounters {
        self.counters
    }

    pub fn position(&self, instrument: InstrumentId) -> i64 {
        self.instruments.get(&instrument).map_or(0, |r| r.position)
    }

    /// Check one intent. Rate-window slots are only consumed on `Pass`.
    #[inline]
    pub fn check(&mut self, intent: &OrderIntent, now_ns: i64) -> RiskDecision {
        let decision = self.evaluate(intent, now_ns);
        match decision {
            RiskDecision::Pass => self.counters.passed += 1,
            RiskDecision::Reject(RejectReason::KillSwitchEngaged) => self.counters.killed += 1,
            RiskDecision::Reject(_) => self.counters.rejected += 1,
        }
        decision
    }

    fn evaluate(&mut self, intent: &OrderIntent, now_ns: i64) -> RiskDecision {
        if self.kill.is_engaged() {
            return RiskDecision::Reject(RejectReason::KillSwitchEngaged);
        }
        if intent.kind == IntentKind::Cancel {
            return RiskDecision::Pass;
        }

        let limits = self.limits;
        if intent.price <= 0 {
            return RiskDecision::Reject(RejectReason::PriceInvalid);
        }
        if intent.price > limits.max_price {
            return RiskDecision::Reject(RejectReason::PriceLimit);
        }
        if intent.qty <= 0 {
            return RiskDecision::Reject(RejectReason::QuantityInvalid);
        }
        if intent.qty > limits.max_qty {
            return RiskDecision::Reject(RejectReason::QuantityLimit);
        }

        let risk = self
            .instruments
            .entry(intent.instrument)
            .or_insert_with(|| InstrumentRisk::new(&limits));

        let projected = risk.position.saturating_add(intent.side.sign() * intent.qty);
        if projected.saturating_abs() > limits.max_position {
            return RiskDecision::Reject(RejectReason::PositionLimit);
        }
        match intent.price.checked_mul(intent.qty) {
            Some(notional) if notional <= limits.max_notional => {}
            _ => return RiskDecision::Reject(RejectReason::NotionalLimit),
        }
        if !risk.rate.would_admit(now_ns) || !self.global_rate.would_admit(now_ns) {
            return RiskDecision::Reject(RejectReason::RateLimit);
        }

        for policy in &risk.policies {
            if let Some(rule) = violates(policy, intent, risk.position, projected, risk.mid_x2) {
                return RiskDecision::Reject(RejectReason::PolicyViolation(rule));
            }
        }

        risk.rate.record(now_ns);
        self.global_rate.record(now_ns);
        RiskDecision::Pass
    }

    /// Apply an execution to the tracked position.
    pub fn on_fill(&mut self, instrument: InstrumentId, side: OrderSide, qty: i64) {
        let limits = self.limits;
        let risk = self
            .instruments
            .entry(instrument)
            .or_insert_with(|| InstrumentRisk::new(&limits));
        risk.position = risk.position.saturating_add(side.sign().saturating_mul(qty));
    }

    /// Track the book mid used by price-band policies. One-sided books keep the last mid.
    pub fn on_stats(&mut self, stats: &LobStatsEvent) {
        if let Some(mid_x2) = stats.mid_x2 {
            let limits = self.limits;
            self.instruments
                .entry(stats.instrument)
                .or_insert_with(|| InstrumentRisk::new(&limits))
                .mid_x2 = Some(mid_x2);
        }
    }

    /// Apply a control record from the risk process.
    pub fn apply_control(&mut self, control: &ControlRecord) {
        match control.kill {
            KillCommand::Engage => {
                self.kill.engage();
            }
            KillCommand::Reset => self.kill.reset(),
            KillCommand::None => {}
        }
        if control.rate_max_orders == 0 || control.rate_window_ns <= 0 {
            return;
        }
        if control.instrument == ALL_INSTRUMENTS {
            self.global_rate
                .set_limit(control.rate_max_orders, control.rate_window_ns);
        } else {
            let limits = self.limits;
            self.instruments
                .entry(control.instrument)
                .or_insert_with(|| InstrumentRisk::new(&limits))
                .rate
                .set_limit(control.rate_max_orders, control.rate_window_ns);
        }
    }
}

#[inline]
fn violates(
    policy: &InstrumentPolicy,
    intent: &OrderIntent,
    position: i64,
    projected: i64,
    mid_x2: Option<i64>,
) -> Option<PolicyRule> {
    match *policy {
        InstrumentPolicy::Halted => Some(PolicyRule::Halted),
        InstrumentPolicy::ReduceOnly => {
            let grows = projected.saturating_abs() > position.saturating_abs();
            let flips = position.signum() * projected.signum() < 0;
            (grows || flips).then_some(PolicyRule::ReduceOnly)
        }
        // No reference mid yet: the band cannot be evaluated
        InstrumentPolicy::PriceBand { max_ticks } => mid_x2.and_then(|mid_x2| {
            let distance_x2 = intent.price.saturating_mul(2).saturating_sub(mid_x2).saturating_abs();
            (distance_x2 > max_ticks.saturating_mul(2)).then_some(PolicyRule::PriceBand)
        }),
        InstrumentPolicy::MaxOrderQty { max_qty } => (intent.qty > max_qty).then_some(PolicyRule::MaxOrderQty),
    }
}
