use crate::algorithms::{DistanceModel, SolverConfig};
use crate::core::{
    AnchorNode, CalibrationPoint, NodeId, Point2, ALLOCATION_BUDGET_SECS, AVG_NUM, AVG_TIMEOUT_SECS,
    DISCOVERY_DWELL, DISTANCE_COEFFICIENT, DISTANCE_EXPONENT, FUSION_STALENESS_SECS, NUM_CHANNELS,
};
use crate::hardware::SchedulerConfig;
use crate::validation::ValidationConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid parameter value
    #[error("invalid {parameter} = {value}: {reason}")]
    InvalidParameter {
        parameter: String,
        value: String,
        reason: String,
    },

    /// Two anchors claim the same node id
    #[error("anchor {node} is configured more than once")]
    AnchorConflict { node: NodeId },

    /// Configuration file I/O error
    #[error("failed to access config file '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error
    #[error("failed to parse config file '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl ConfigError {
    fn invalid(parameter: &str, value: impl ToString, reason: &str) -> Self {
        ConfigError::InvalidParameter {
            parameter: parameter.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Observation window settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum age of a reading used in a server-side solve (seconds)
    pub staleness_secs: u64,
    /// Readings kept per device-at-node smoothing window
    pub smoothing_capacity: usize,
    /// Maximum age of a reading in a smoothing window (seconds)
    pub smoothing_max_age_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            staleness_secs: FUSION_STALENESS_SECS,
            smoothing_capacity: AVG_NUM,
            smoothing_max_age_secs: AVG_TIMEOUT_SECS,
        }
    }
}

/// Path-loss fit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistanceConfig {
    pub coefficient: f64,
    pub exponent: f64,
}

impl Default for DistanceConfig {
    fn default() -> Self {
        Self {
            coefficient: DISTANCE_COEFFICIENT,
            exponent: DISTANCE_EXPONENT,
        }
    }
}

/// Channel scheduler settings as stored on disk
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub discovery_dwell_ms: u64,
    pub allocation_budget_secs: u64,
    pub channel_count: u8,
    pub single_channel: Option<u8>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            discovery_dwell_ms: DISCOVERY_DWELL.as_millis() as u64,
            allocation_budget_secs: ALLOCATION_BUDGET_SECS,
            channel_count: NUM_CHANNELS,
            single_channel: None,
        }
    }
}

/// Settings for one sniffing node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: NodeId,
    /// Wireless interface to capture on and retune
    pub interface: String,
    /// At most one outbound reading per device per interval (seconds)
    pub send_interval_secs: u64,
    /// The node's own position, attached to outbound readings when set
    pub position: Option<Point2>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            interface: "wlan0".to_string(),
            send_interval_secs: 1,
            position: None,
        }
    }
}

/// Complete configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WisnConfig {
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
    pub store: StoreConfig,
    pub distance: DistanceConfig,
    pub solver: SolverConfig,
    pub scheduler: ChannelConfig,
    pub node: NodeConfig,
    pub validation: ValidationConfig,
    /// Anchor positions served by the static anchor source
    pub anchors: Vec<AnchorNode>,
    /// Calibration points served by the static calibration source
    pub calibration: Vec<CalibrationPoint>,
}

impl Default for WisnConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            store: StoreConfig::default(),
            distance: DistanceConfig::default(),
            solver: SolverConfig::default(),
            scheduler: ChannelConfig::default(),
            node: NodeConfig::default(),
            validation: ValidationConfig::default(),
            anchors: Vec::new(),
            calibration: Vec::new(),
        }
    }
}

impl WisnConfig {
    /// Load and validate configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: WisnConfig = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks every parameter; the first problem found is returned
    pub fn validate(&self) -> Result<(), ConfigError> {
        let store = &self.store;
        if store.smoothing_capacity == 0 {
            return Err(ConfigError::invalid("store.smoothing_capacity", 0, "must be at least 1"));
        }
        if store.staleness_secs == 0 {
            return Err(ConfigError::invalid("store.staleness_secs", 0, "must be positive"));
        }
        if store.smoothing_max_age_secs == 0 {
            return Err(ConfigError::invalid("store.smoothing_max_age_secs", 0, "must be positive"));
        }

        let distance = &self.distance;
        if !(distance.coefficient.is_finite() && distance.coefficient > 0.0) {
            return Err(ConfigError::invalid("distance.coefficient", distance.coefficient, "must be positive"));
        }
        if !(distance.exponent.is_finite() && distance.exponent > 0.0) {
            return Err(ConfigError::invalid("distance.exponent", distance.exponent, "must be positive"));
        }

        let solver = &self.solver;
        if !(solver.min_coordinate.is_finite()
            && solver.max_coordinate.is_finite()
            && solver.min_coordinate < solver.max_coordinate)
        {
            return Err(ConfigError::invalid(
                "solver.max_coordinate",
                solver.max_coordinate,
                "must be finite and above solver.min_coordinate",
            ));
        }
        if !(solver.rank_tolerance.is_finite() && solver.rank_tolerance > 0.0) {
            return Err(ConfigError::invalid("solver.rank_tolerance", solver.rank_tolerance, "must be positive"));
        }

        let scheduler = &self.scheduler;
        if scheduler.discovery_dwell_ms == 0 {
            return Err(ConfigError::invalid("scheduler.discovery_dwell_ms", 0, "must be positive"));
        }
        if scheduler.channel_count == 0 || scheduler.channel_count > NUM_CHANNELS {
            return Err(ConfigError::invalid(
                "scheduler.channel_count",
                scheduler.channel_count,
                "must be within 1..=14",
            ));
        }
        if let Some(channel) = scheduler.single_channel {
            if channel == 0 || channel > scheduler.channel_count {
                return Err(ConfigError::invalid(
                    "scheduler.single_channel",
                    channel,
                    "must be within 1..=channel_count",
                ));
            }
        }

        if self.node.node_id == 0 {
            return Err(ConfigError::invalid("node.node_id", 0, "node id 0 is reserved"));
        }
        if self.node.interface.is_empty() {
            return Err(ConfigError::invalid("node.interface", "\"\"", "must name an interface"));
        }

        if !(self.validation.max_rssi.is_finite() && self.validation.max_rssi > 0.0) {
            return Err(ConfigError::invalid("validation.max_rssi", self.validation.max_rssi, "must be positive"));
        }

        let mut seen = HashSet::new();
        for anchor in &self.anchors {
            if anchor.node == 0 {
                return Err(ConfigError::invalid("anchors.node", 0, "node id 0 is reserved"));
            }
            if !seen.insert(anchor.node) {
                return Err(ConfigError::AnchorConflict { node: anchor.node });
            }
        }
        Ok(())
    }

    pub fn distance_model(&self) -> DistanceModel {
        DistanceModel::new(self.distance.coefficient, self.distance.exponent)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            discovery_dwell: Duration::from_millis(self.scheduler.discovery_dwell_ms),
            allocation_budget_secs: self.scheduler.allocation_budget_secs,
            channel_count: self.scheduler.channel_count,
            single_channel: self.scheduler.single_channel,
        }
    }
}
