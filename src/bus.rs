//! Event bus - the fixed set of pipeline topics.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{BusError, ConfigError};
use crate::event::{LobStatsEvent, MarketEvent, Side};
use crate::gate::DecisionRecord;
use crate::topic::{BackpressurePolicy, BusMessage, Subscription, Topic, TopicStats};

/// Pipeline topics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TopicId {
    /// Normalized ticks, book updates and feed gaps
    MarketData,
    /// LOB statistics
    LobStats,
    /// Risk decisions on the order path
    OrderControl,
    /// Everything worth persisting, for the external recorder
    Recorder,
}

impl TopicId {
    pub const ALL: [TopicId; 4] = [
        TopicId::MarketData,
        TopicId::LobStats,
        TopicId::OrderControl,
        TopicId::Recorder,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            TopicId::MarketData => "market_data",
            TopicId::LobStats => "lob_stats",
            TopicId::OrderControl => "order_control",
            TopicId::Recorder => "recorder",
        }
    }
}

/// Envelope carried by every topic.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BusEvent {
    Market(MarketEvent),
    Stats(LobStatsEvent),
    Decision(DecisionRecord),
}

impl BusMessage for BusEvent {
    fn is_well_formed(&self) -> bool {
        match self {
            BusEvent::Market(MarketEvent::BidAsk(book)) => {
                book.bids.map_or(true, |s| s.is_well_formed(Side::Bid))
                    && book.asks.map_or(true, |s| s.is_well_formed(Side::Ask))
            }
            BusEvent::Market(MarketEvent::Tick(tick)) => tick.price > 0 && tick.size >= 0,
            BusEvent::Market(MarketEvent::FeedGap(_)) => true,
            BusEvent::Stats(stats) => stats.imbalance.map_or(true, |i| (-1.0..=1.0).contains(&i)),
            BusEvent::Decision(_) => true,
        }
    }
}

/// Sizing and policy of one topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    /// Slots (power of two)
    pub capacity: usize,
    pub policy: BackpressurePolicy,
    pub max_subscribers: usize,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            policy: BackpressurePolicy::DropOldest,
            max_subscribers: 8,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub market_data: TopicConfig,
    pub lob_stats: TopicConfig,
    pub order_control: TopicConfig,
    pub recorder: TopicConfig,
}

impl BusConfig {
    pub fn topic(&self, id: TopicId) -> &TopicConfig {
        match id {
            TopicId::MarketData => &self.market_data,
            TopicId::LobStats => &self.lob_stats,
            TopicId::OrderControl => &self.order_control,
            TopicId::Recorder => &self.recorder,
        }
    }
}

/// All pipeline topics. Cheap to clone; clones share the topics.
#[derive(Clone)]
pub struct EventBus {
    topics: [Arc<Topic<BusEvent>>; 4],
}

impl EventBus {
    pub fn new(config: &BusConfig) -> Result<Self, ConfigError> {
        let make = |id: TopicId| -> Result<Arc<Topic<BusEvent>>, ConfigError> {
            let c = config.topic(id);
            Ok(Arc::new(Topic::new(id.name(), c.capacity, c.policy, c.max_subscribers)?))
        };
        Ok(Self {
            topics: [
                make(TopicId::MarketData)?,
                make(TopicId::LobStats)?,
                make(TopicId::OrderControl)?,
                make(TopicId::Recorder)?,
            ],
        })
    }

    #[inline]
    pub fn topic(&self, id: TopicId) -> &Arc<Topic<BusEvent>> {
        &self.topics[id as usize]
    }

    #[inline]
    pub fn publish(&self, id: TopicId, event: BusEvent) -> Result<(), BusError> {
        self.topic(id).publish(event)
    }

    pub fn subscribe(&self, id: TopicId) -> Result<Subscription<BusEvent>, BusError> {
        self.topic(id).subscribe()
    }

    pub fn subscribe_from_oldest(&self, id: TopicId) -> Result<Subscription<BusEvent>, BusError> {
        self.topic(id).subscribe_from_oldest()
    }

    pub fn stats(&self, id: TopicId) -> TopicStats {
        self.topic(id).stats()
    }
}
