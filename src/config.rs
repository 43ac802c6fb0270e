//! Startup configuration (JSON).
//!
//! Everything is validated once by [`PipelineConfig::validate`]; nothing
//! here is consulted on the hot path.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::bus::{BusConfig, TopicId};
use crate::error::ConfigError;
use crate::gate::{InstrumentPolicy, RiskLimits};
use crate::lob::LobConfig;
use crate::normalizer::NormalizerConfig;
use crate::price::InstrumentRegistry;
use crate::shm::shm_path;
use crate::spsc::RetryPolicy;

fn one() -> Decimal {
    Decimal::ONE
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    pub symbol: String,
    pub tick_size: Decimal,
    #[serde(default = "one")]
    pub lot_size: Decimal,
    #[serde(default)]
    pub policies: Vec<InstrumentPolicy>,
}

/// A shared-memory ring between this process and a peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingConfig {
    /// Name under `/dev/shm` or an absolute path
    pub name: String,
    pub capacity: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl RingConfig {
    pub fn path(&self) -> PathBuf {
        shm_path(&self.name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSwitchConfig {
    /// Name under `/dev/shm` or an absolute path; process-local when unset
    pub name: Option<String>,
    /// Engage at startup; an already engaged shared switch is never cleared
    pub engaged_at_start: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub instruments: Vec<InstrumentConfig>,
    pub normalizer: NormalizerConfig,
    pub lob: LobConfig,
    pub bus: BusConfig,
    /// Top-of-book export to the strategy process
    pub snapshot_ring: Option<RingConfig>,
    /// Control records from the risk process
    pub control_ring: Option<RingConfig>,
    pub risk: RiskLimits,
    pub kill_switch: KillSwitchConfig,
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instruments.is_empty() {
            return Err(ConfigError::Invalid("no instruments configured".into()));
        }
        let mut seen = HashSet::new();
        for instrument in &self.instruments {
            if !seen.insert(instrument.symbol.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "instrument `{}` listed twice",
                    instrument.symbol
                )));
            }
        }
        // Tick and lot sizes are checked by the registry
        self.registry()?;

        if self.normalizer.max_future_skew_ns < 0 {
            return Err(ConfigError::Invalid("max_future_skew_ns must not be negative".into()));
        }
        if self.normalizer.synthetic_side_ticks == Some(0) {
            return Err(ConfigError::Invalid("synthetic_side_ticks must be at least 1".into()));
        }
        self.lob.validate()?;
        for id in TopicId::ALL {
            let topic = self.bus.topic(id);
            if topic.capacity < 2 || !topic.capacity.is_power_of_two() {
                return Err(ConfigError::Invalid(format!(
                    "topic `{}` capacity {} must be a power of two >= 2",
                    id.name(),
                    topic.capacity
                )));
            }
            if topic.max_subscribers == 0 {
                return Err(ConfigError::Invalid(format!("topic `{}` allows no subscribers", id.name())));
            }
        }
        for ring in [&self.snapshot_ring, &self.control_ring].into_iter().flatten() {
            if ring.capacity < 2 || !ring.capacity.is_power_of_two() {
                return Err(ConfigError::Invalid(format!(
                    "ring `{}` capacity {} must be a power of two >= 2",
                    ring.name, ring.capacity
                )));
            }
        }
        self.risk.validate()
    }

    /// Instrument registry in configuration order.
    pub fn registry(&self) -> Result<InstrumentRegistry, ConfigError> {
        let mut registry = InstrumentRegistry::new();
        for instrument in &self.instruments {
            registry.register(&instrument.symbol, instrument.tick_size, instrument.lot_size)?;
        }
        Ok(registry)
    }
}
