//! Pipeline wiring - the ingest loop and the order path.
//!
//! ```text
//! payload -> Normalizer -> [MarketData] -> LobEngine -> [LobStats] -> snapshot ring
//!                \______________ [Recorder] ______________/
//!
//! intent -> FastGate -> [OrderControl] + [Recorder] -> OrderSink (pass only)
//!              ^
//!              +-- control ring, fills, LobStats
//! ```

use tracing::{debug, info, warn};

use crate::bus::{BusEvent, EventBus, TopicId};
use crate::config::PipelineConfig;
use crate::error::{BusError, PipelineError, RingError};
use crate::event::{FeedGap, InstrumentId, LobStatsEvent, MarketEvent};
use crate::gate::{DecisionRecord, FastGate, OrderIntent, OrderSide, RiskDecision};
use crate::kill_switch::KillSwitch;
use crate::lob::LobEngine;
use crate::normalizer::{Normalizer, RawPayload};
use crate::spsc::{self, RetryPolicy, SpscRing};
use crate::topic::Subscription;
use crate::wire::{SnapshotRecord, WireMessage};

/// Ingest-side counters not owned by a component.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestCounters {
    /// Publishes refused by a blocking topic
    pub bus_full: u64,
    /// Snapshots not exported because the ring stayed full
    pub snapshot_contention: u64,
    pub snapshots_exported: u64,
}

/// Normalizer -> bus -> LOB engine -> bus, for one shard of instruments.
pub struct Ingest {
    normalizer: Normalizer,
    engine: LobEngine,
    bus: EventBus,
    snapshots: Option<(spsc::Producer, RetryPolicy)>,
    counters: IngestCounters,
}

impl Ingest {
    pub fn new(normalizer: Normalizer, engine: LobEngine, bus: EventBus) -> Self {
        Self {
            normalizer,
            engine,
            bus,
            snapshots: None,
            counters: IngestCounters::default(),
        }
    }

    /// Build from configuration. Creates the snapshot ring if one is configured.
    pub fn from_config(config: &PipelineConfig, bus: EventBus) -> Result<Self, PipelineError> {
        config.validate()?;
        let registry = config.registry()?;
        let ids: Vec<InstrumentId> = registry.iter().map(|s| s.id).collect();
        let mut engine = LobEngine::with_instruments(config.lob, ids.iter().copied());
        engine.warm_up(ids);
        let normalizer = Normalizer::new(registry, config.normalizer);
        let mut ingest = Self::new(normalizer, engine, bus);
        if let Some(ring) = &config.snapshot_ring {
            let producer = SpscRing::create(ring.path(), ring.capacity)?.into_producer();
            ingest = ingest.with_snapshot_export(producer, ring.retry);
        }
        info!(
            instruments = ingest.normalizer.registry().len(),
            snapshot_export = ingest.snapshots.is_some(),
            "ingest ready"
        );
        Ok(ingest)
    }

    /// Export every emitted stats event as a `SnapshotRecord`.
    pub fn with_snapshot_export(mut self, producer: spsc::Producer, policy: RetryPolicy) -> Self {
        self.snapshots = Some((producer, policy));
        self
    }

    #[inline]
    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    #[inline]
    pub fn engine(&self) -> &LobEngine {
        &self.engine
    }

    #[inline]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    #[inline]
    pub fn counters(&self) -> IngestCounters {
        self.counters
    }

    /// Process one gateway payload.
    pub fn on_payload(&mut self, payload: &RawPayload, now_ns: i64) -> Result<Option<LobStatsEvent>, PipelineError> {
        match self.normalizer.normalize(payload, now_ns)? {
            Some(event) => self.on_event(event),
            None => Ok(None),
        }
    }

    /// Process one JSON-encoded gateway payload.
    pub fn on_json(&mut self, bytes: &[u8], now_ns: i64) -> Result<Option<LobStatsEvent>, PipelineError> {
        match self.normalizer.normalize_json(bytes, now_ns)? {
            Some(event) => self.on_event(event),
            None => Ok(None),
        }
    }

    /// Gateway reported an interruption (`None` = the whole connection).
    pub fn on_feed_gap(
        &mut self,
        instrument: Option<InstrumentId>,
        reset_sequence: bool,
        now_ns: i64,
    ) -> Result<Option<LobStatsEvent>, PipelineError> {
        warn!(instrument = ?instrument, reset_sequence, "feed gap");
        if reset_sequence {
            self.normalizer.reset_sequence(instrument);
        }
        self.on_event(MarketEvent::FeedGap(FeedGap {
            instrument,
            ts: now_ns,
            reset_sequence,
        }))
    }

    /// Fan out a normalized event and run it through the engine.
    pub fn on_event(&mut self, event: MarketEvent) -> Result<Option<LobStatsEvent>, PipelineError> {
        self.publish(TopicId::Recorder, BusEvent::Market(event));
        if event.is_stale() {
            let instrument = event.instrument().unwrap_or_default();
            let last = self.normalizer.last_seq(instrument).unwrap_or(0);
            return Err(PipelineError::StaleSequence {
                instrument,
                seq: event.seq().unwrap_or(0),
                last,
            });
        }
        self.publish(TopicId::MarketData, BusEvent::Market(event));

        let Some(stats) = self.engine.apply(&event) else {
            return Ok(None);
        };
        self.publish(TopicId::LobStats, BusEvent::Stats(stats));
        self.publish(TopicId::Recorder, BusEvent::Stats(stats));
        self.export(&stats);
        Ok(Some(stats))
    }

    fn publish(&mut self, topic: TopicId, event: BusEvent) {
        if let Err(e) = self.bus.publish(topic, event) {
            self.counters.bus_full += 1;
            debug!(error = %e, "publish refused");
        }
    }

    fn export(&mut self, stats: &LobStatsEvent) {
        let Some((producer, policy)) = self.snapshots.as_mut() else {
            return;
        };
        match producer.push(&SnapshotRecord::from_stats(stats), *policy) {
            Ok(()) => self.counters.snapshots_exported += 1,
            Err(e) => {
                self.counters.snapshot_contention += 1;
                debug!(error = %e, instrument = stats.instrument, "snapshot not exported");
            }
        }
    }

    /// Drive a batch of payloads. Errors are logged and counted, never fatal.
    pub fn run<I>(&mut self, payloads: I, mut clock: impl FnMut() -> i64) -> usize
    where
        I: IntoIterator<Item = RawPayload>,
    {
        let mut stats_emitted = 0;
        for payload in payloads {
            match self.on_payload(&payload, clock()) {
                Ok(Some(_)) => stats_emitted += 1,
                Ok(None) => {}
                Err(PipelineError::Normalize(_)) => {}
                Err(e @ PipelineError::StaleSequence { .. }) => debug!(error = %e, "stale payload"),
                Err(e) => warn!(error = %e, "ingest error"),
            }
        }
        stats_emitted
    }
}

/// Outbound order channel to the broker gateway.
pub trait OrderSink {
    /// Called only for intents the gate passed.
    fn submit(&mut self, intent: &OrderIntent);
}

impl<F: FnMut(&OrderIntent)> OrderSink for F {
    fn submit(&mut self, intent: &OrderIntent) {
        self(intent)
    }
}

/// Risk gate in front of an order sink.
pub struct OrderPath<S: OrderSink> {
    gate: FastGate,
    bus: EventBus,
    sink: S,
    control: Option<spsc::Consumer>,
    stats: Option<Subscription<BusEvent>>,
    bus_full: u64,
}

impl<S: OrderSink> OrderPath<S> {
    pub fn new(gate: FastGate, bus: EventBus, sink: S) -> Self {
        Self {
            gate,
            bus,
            sink,
            control: None,
            stats: None,
            bus_full: 0,
        }
    }

    /// Build from configuration: kill switch, limits, policies and control ring.
    pub fn from_config(config: &PipelineConfig, bus: EventBus, sink: S) -> Result<Self, PipelineError> {
        config.validate()?;
        let kill = match &config.kill_switch.name {
            Some(name) => KillSwitch::open_or_create(crate::shm::shm_path(name), config.kill_switch.engaged_at_start)?,
            None => KillSwitch::in_memory(config.kill_switch.engaged_at_start)?,
        };
        let registry = config.registry()?;
        let mut gate = FastGate::new(kill, config.risk);
        for (spec, instrument) in registry.iter().zip(&config.instruments) {
            gate.register_instrument(spec.id, instrument.policies.clone());
        }
        let mut path = Self::new(gate, bus, sink);
        if let Some(ring) = &config.control_ring {
            path.control = Some(SpscRing::attach(ring.path())?.into_consumer());
        }
        path.follow_stats()?;
        Ok(path)
    }

    /// Read control records from `consumer` in `poll_control`.
    pub fn with_control_ring(mut self, consumer: spsc::Consumer) -> Self {
        self.control = Some(consumer);
        self
    }

    /// Track book mids from the `LobStats` topic.
    pub fn follow_stats(&mut self) -> Result<(), BusError> {
        self.stats = Some(self.bus.subscribe(TopicId::LobStats)?);
        Ok(())
    }

    #[inline]
    pub fn gate(&self) -> &FastGate {
        &self.gate
    }

    #[inline]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    #[inline]
    pub fn bus_full(&self) -> u64 {
        self.bus_full
    }

    /// Check an intent, record the decision and forward it if it passed.
    pub fn submit(&mut self, intent: &OrderIntent, now_ns: i64) -> RiskDecision {
        let decision = self.gate.check(intent, now_ns);
        let record = BusEvent::Decision(DecisionRecord {
            intent: *intent,
            decision,
            ts: now_ns,
        });
        for topic in [TopicId::OrderControl, TopicId::Recorder] {
            if self.bus.publish(topic, record).is_err() {
                self.bus_full += 1;
            }
        }
        if decision.is_pass() {
            self.sink.submit(intent);
        } else {
            debug!(
                instrument = intent.instrument,
                code = decision.code(),
                reason = ?decision,
                "intent rejected"
            );
        }
        decision
    }

    pub fn on_fill(&mut self, instrument: InstrumentId, side: OrderSide, qty: i64) {
        self.gate.on_fill(instrument, side, qty);
    }

    /// Apply pending control records. Returns how many were applied.
    pub fn poll_control(&mut self) -> usize {
        let Some(consumer) = self.control.as_mut() else {
            return 0;
        };
        let mut applied = 0;
        loop {
            match consumer.pop_message() {
                Ok(Some(WireMessage::Control(control))) => {
                    info!(kill = ?control.kill, instrument = control.instrument, "control record");
                    self.gate.apply_control(&control);
                    applied += 1;
                }
                Ok(Some(WireMessage::Snapshot(_))) => warn!("snapshot record on control ring"),
                Ok(None) => break,
                Err(RingError::Wire(e)) => warn!(error = %e, "undecodable control slot"),
                Err(e) => {
                    warn!(error = %e, "control ring error");
                    break;
                }
            }
        }
        applied
    }

    /// Feed pending stats events to the gate. Returns how many were seen.
    pub fn poll_stats(&mut self) -> usize {
        let Some(sub) = self.stats.as_mut() else {
            return 0;
        };
        let gate = &mut self.gate;
        sub.drain(usize::MAX, |event| {
            if let BusEvent::Stats(stats) = event {
                gate.on_stats(&stats);
            }
        })
    }
}
