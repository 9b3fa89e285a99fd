// Simulation Configuration

use std::path::Path;

use indexmap::IndexSet;
use serde::Deserialize;

use crate::qn_faults::FaultPlan;
use crate::qn_generator::{GeneratorConfig, GeneratorMode};
use crate::qn_interface::{Priority, DEFAULT_PRIORITY};
use crate::qn_router::RouteConfig;
use crate::qn_seasonality::{SeasonalityError, SeasonalityTable};
use crate::qn_server::{DEFAULT_LATENCY_SCALE, DEFAULT_MEMORY_FACTOR};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("runtime must be positive and finite, got {0}")]
    InvalidRuntime(f64),

    #[error("no server pools configured")]
    NoPools,

    #[error("pool {0} has no servers")]
    ZeroSize(String),

    #[error("pool {0} has zero capacity")]
    ZeroCapacity(String),

    #[error("pool {0} is configured twice")]
    DuplicateKind(String),

    #[error("pool {kind}: {reason}")]
    InvalidPool { kind: String, reason: String },

    #[error("transaction has no server kinds")]
    EmptyRoute,

    #[error("{name} must be positive, got {value}")]
    InvalidTimeout { name: &'static str, value: f64 },

    #[error("max_volume must be positive and finite, got {0}")]
    InvalidVolume(f64),

    #[error("latency_jitter must be in [0, 1), got {0}")]
    InvalidJitter(f64),

    #[error("fault on {kind}: {reason}")]
    InvalidFault { kind: String, reason: String },

    #[error(transparent)]
    Seasonality(#[from] SeasonalityError),

    #[error("cannot parse scenario: {0}")]
    Yaml(String),

    #[error("cannot read {0}")]
    Io(String),
}

// ============================================================================
// Main Configuration
// ============================================================================

/// Main configuration for one simulation run
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimConfig {
    /// Virtual time horizon
    pub runtime: f64,

    /// Random seed for reproducibility (fresh one when absent)
    pub seed: Option<[u8; 32]>,

    /// Server pools, one per kind
    pub pools: Vec<PoolConfig>,

    /// Route and timing of every generated transaction
    pub transaction: TransactionConfig,

    /// Arrival rate over time
    pub seasonality: SeasonalityConfig,

    /// Scheduled outages
    pub faults: Vec<FaultConfig>,

    /// Relative latency perturbation drawn from the seeded rng (0 = off)
    pub latency_jitter: f64,

    /// Mirror every record into the log at info level
    pub enable_event_logging: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            runtime: 100.0,
            seed: None,
            pools: vec![
                PoolConfig {
                    size: 5,
                    ..PoolConfig::new("balance")
                },
                PoolConfig {
                    size: 5,
                    ..PoolConfig::new("credit")
                },
            ],
            transaction: TransactionConfig {
                kinds: vec!["balance".to_string(), "credit".to_string()],
                ..TransactionConfig::default()
            },
            seasonality: SeasonalityConfig::default(),
            faults: Vec::new(),
            latency_jitter: 0.0,
            enable_event_logging: false,
        }
    }
}

// ============================================================================
// Components
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    pub kind: String,
    pub size: usize,
    /// Concurrent holders per server
    pub capacity: usize,
    pub latency_scale: f64,
    pub memory_factor: f64,
}

impl PoolConfig {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            ..Self::default()
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            kind: "regular".to_string(),
            size: 10,
            capacity: 10,
            latency_scale: DEFAULT_LATENCY_SCALE,
            memory_factor: DEFAULT_MEMORY_FACTOR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransactionConfig {
    /// Server kinds visited in order; repeats loop back to the earlier server
    pub kinds: Vec<String>,

    pub priority: Priority,

    /// How long a single hop may wait for its grant
    pub hop_timeout: f64,

    /// Deadline for the whole transaction, enforced by the generator
    pub transaction_timeout: f64,

    pub mode: GeneratorMode,

    /// Retries of a hop whose server was taken away by preemption
    pub max_reroutes: usize,

    /// Stop generating after this many transactions
    pub max_transactions: Option<u64>,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            kinds: vec!["regular".to_string()],
            priority: DEFAULT_PRIORITY,
            hop_timeout: 1.0,
            transaction_timeout: 1.0,
            mode: GeneratorMode::Overlapping,
            max_reroutes: 1,
            max_transactions: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SeasonalityConfig {
    /// (time, scale) samples; ignored when `csv_path` is set
    pub samples: Vec<(f64, f64)>,

    /// `time;scaler_value` file
    pub csv_path: Option<String>,

    /// Arrivals per unit of time at scale 1.0
    pub max_volume: f64,
}

impl Default for SeasonalityConfig {
    fn default() -> Self {
        Self {
            samples: vec![(0.0, 1.0)],
            csv_path: None,
            max_volume: 1000.0,
        }
    }
}

impl SeasonalityConfig {
    pub fn table(&self) -> Result<SeasonalityTable, SeasonalityError> {
        match &self.csv_path {
            Some(path) => SeasonalityTable::from_csv_file(path),
            None => SeasonalityTable::new(self.samples.clone()),
        }
    }

    pub fn base_interval(&self) -> f64 {
        1.0 / self.max_volume
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FaultConfig {
    pub kind: String,

    #[serde(default)]
    pub server_index: usize,

    /// (min, max) quiet period before each outage
    pub wait: (f64, f64),

    /// (min, max) outage length
    pub duration: (f64, f64),

    #[serde(default)]
    pub slow_factor: Option<f64>,
}

impl FaultConfig {
    pub fn plan(&self) -> FaultPlan {
        FaultPlan {
            kind: self.kind.clone(),
            server_index: self.server_index,
            wait: self.wait,
            duration: self.duration,
            slow_factor: self.slow_factor,
        }
    }
}

// ============================================================================
// Loading and validation
// ============================================================================

impl SimConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SimConfig =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Yaml(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_yaml_str(&content)
    }

    /// Check every constraint a run relies on.
    ///
    /// Route kinds are not checked against the pools: an unknown kind fails
    /// the transactions that reach it, not the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.runtime.is_finite() && self.runtime > 0.0) {
            return Err(ConfigError::InvalidRuntime(self.runtime));
        }

        if self.pools.is_empty() {
            return Err(ConfigError::NoPools);
        }
        let mut kinds = IndexSet::new();
        for pool in &self.pools {
            if pool.size == 0 {
                return Err(ConfigError::ZeroSize(pool.kind.clone()));
            }
            if pool.capacity == 0 {
                return Err(ConfigError::ZeroCapacity(pool.kind.clone()));
            }
            if !(pool.latency_scale.is_finite() && pool.latency_scale >= 0.0) {
                return Err(ConfigError::InvalidPool {
                    kind: pool.kind.clone(),
                    reason: format!("latency_scale {}", pool.latency_scale),
                });
            }
            if !(pool.memory_factor.is_finite() && pool.memory_factor > 0.0) {
                return Err(ConfigError::InvalidPool {
                    kind: pool.kind.clone(),
                    reason: format!("memory_factor {}", pool.memory_factor),
                });
            }
            if !kinds.insert(pool.kind.as_str()) {
                return Err(ConfigError::DuplicateKind(pool.kind.clone()));
            }
        }

        let tx = &self.transaction;
        if tx.kinds.is_empty() {
            return Err(ConfigError::EmptyRoute);
        }
        for (name, value) in [
            ("hop_timeout", tx.hop_timeout),
            ("transaction_timeout", tx.transaction_timeout),
        ] {
            // infinite means no deadline
            if value.is_nan() || value <= 0.0 {
                return Err(ConfigError::InvalidTimeout { name, value });
            }
        }

        let volume = self.seasonality.max_volume;
        if !(volume.is_finite() && volume > 0.0) {
            return Err(ConfigError::InvalidVolume(volume));
        }
        if self.seasonality.csv_path.is_none() {
            SeasonalityTable::new(self.seasonality.samples.clone())?;
        }

        if !(0.0..1.0).contains(&self.latency_jitter) {
            return Err(ConfigError::InvalidJitter(self.latency_jitter));
        }

        for fault in &self.faults {
            let invalid = |reason: &str| ConfigError::InvalidFault {
                kind: fault.kind.clone(),
                reason: reason.to_string(),
            };
            for (min, max) in [fault.wait, fault.duration] {
                if !(min.is_finite() && max.is_finite() && min >= 0.0 && min <= max) {
                    return Err(invalid("ranges must be finite with 0 <= min <= max"));
                }
            }
            if fault.slow_factor.is_some_and(|f| !(f.is_finite() && f > 0.0)) {
                return Err(invalid("slow_factor must be positive"));
            }
        }

        Ok(())
    }

    pub fn route_config(&self) -> RouteConfig {
        RouteConfig {
            kinds: self.transaction.kinds.clone(),
            priority: self.transaction.priority,
            hop_timeout: self.transaction.hop_timeout,
            max_reroutes: self.transaction.max_reroutes,
            latency_jitter: self.latency_jitter,
        }
    }

    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig {
            base_interval: self.seasonality.base_interval(),
            transaction_timeout: self.transaction.transaction_timeout,
            mode: self.transaction.mode,
            max_arrivals: self.transaction.max_transactions,
        }
    }
}
