//! # Flash-Feed
//!
//! A low-latency market-data and pre-trade risk pipeline.
//!
//! ## Design Principles
//!
//! - **Fixed-Point**: Prices and sizes are integer ticks and lots after ingest
//! - **Single-Writer**: Each book is owned by one engine thread (no locks)
//! - **Pre-Allocated**: Topics, rings and top-N books never allocate per event
//! - **Explicit Absence**: A side the feed did not describe stays unknown, never empty
//!
//! ## Architecture
//!
//! ```text
//! [Gateway] --> [Normalizer] --> (market_data) --> [LOB Engine] --> (lob_stats) --> [Snapshot Ring] --> strategy
//!                                                                        |
//! [Strategy intents] --> [Fast Gate] <------------------------------------+
//!                            |   ^
//!                            |   +-- [Control Ring] / [Kill Switch] <-- risk process
//!                            v
//!                      (order_control) --> [Order Sink]
//! ```

pub mod error;
pub mod event;
pub mod price;
pub mod normalizer;
pub mod book;
pub mod stats;
pub mod lob;
pub mod shard;
pub mod topic;
pub mod bus;
pub mod shm;
pub mod wire;
pub mod spsc;
pub mod kill_switch;
pub mod rate;
pub mod gate;
pub mod config;
pub mod pipeline;

// Re-exports for convenience
pub use error::{BusError, ConfigError, MalformedReason, NormalizeError, PipelineError, RingError, ShmError, WireError};
pub use event::{BidAskEvent, BookSide, FeedGap, InstrumentId, Level, LobStatsEvent, MarketEvent, Side, SideState, TickEvent};
pub use price::{InstrumentRegistry, PriceCodec};
pub use normalizer::{Normalizer, NormalizerConfig, RawPayload};
pub use lob::{LobConfig, LobEngine};
pub use stats::StatsEmission;
pub use topic::{BackpressurePolicy, Subscription, Topic};
pub use bus::{BusEvent, EventBus, TopicId};
pub use spsc::{RetryPolicy, SpscRing};
pub use wire::{ControlRecord, KillCommand, SnapshotRecord, WireMessage};
pub use kill_switch::KillSwitch;
pub use gate::{FastGate, OrderIntent, OrderSide, RejectReason, RiskDecision, RiskLimits};
pub use config::PipelineConfig;
pub use pipeline::{Ingest, OrderPath, OrderSink};
