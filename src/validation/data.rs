use crate::core::{Observation, Timestamp};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for observation validation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Largest RSSI magnitude accepted
    pub max_rssi: f64,
    /// How far in the future a capture timestamp may be (seconds)
    pub max_future_skew_secs: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_rssi: 255.0,
            max_future_skew_secs: 5,
        }
    }
}

/// Reasons a single observation is rejected
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ObservationError {
    #[error("RSSI {0} is not a finite number")]
    NonFiniteRssi(f64),

    #[error("RSSI {rssi} is outside (0, {max}]")]
    RssiOutOfRange { rssi: f64, max: f64 },

    #[error("node id 0 is reserved")]
    NodeZero,

    #[error("timestamp {timestamp} is {ahead}s ahead of now")]
    FutureTimestamp { timestamp: Timestamp, ahead: u64 },
}

/// RSSI magnitude from a signed dBm reading; 0 means no signal field
pub fn rssi_from_dbm(dbm: i8) -> f64 {
    -f64::from(dbm)
}

/// Gatekeeper in front of the stores: a record that fails here never reaches
/// a history, so one malformed tuple cannot corrupt a window.
#[derive(Debug, Clone, Default)]
pub struct ObservationValidator {
    config: ValidationConfig,
}

impl ObservationValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    pub fn validate(&self, obs: &Observation, now: Timestamp) -> Result<(), ObservationError> {
        let rssi = obs.rssi();
        if !rssi.is_finite() {
            return Err(ObservationError::NonFiniteRssi(rssi));
        }
        if rssi <= 0.0 || rssi > self.config.max_rssi {
            return Err(ObservationError::RssiOutOfRange {
                rssi,
                max: self.config.max_rssi,
            });
        }
        if obs.node() == 0 {
            return Err(ObservationError::NodeZero);
        }
        let ahead = obs.timestamp().saturating_sub(now);
        if ahead > self.config.max_future_skew_secs {
            return Err(ObservationError::FutureTimestamp {
                timestamp: obs.timestamp(),
                ahead,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MacAddress;

    fn obs(node: u16, rssi: f64, timestamp: Timestamp) -> Observation {
        Observation::new(MacAddress::new([2, 0, 0, 0, 0, 1]), node, rssi, timestamp)
    }

    #[test]
    fn test_accepts_valid_observation() {
        let validator = ObservationValidator::new();
        assert!(validator.validate(&obs(1, 60.0, 100), 100).is_ok());
        assert!(validator.validate(&obs(1, 60.0, 103), 100).is_ok());
    }

    #[test]
    fn test_rejects_bad_rssi() {
        let validator = ObservationValidator::new();
        assert_eq!(
            validator.validate(&obs(1, f64::NAN, 0), 0).unwrap_err().to_string(),
            "RSSI NaN is not a finite number"
        );
        assert!(matches!(
            validator.validate(&obs(1, 0.0, 0), 0),
            Err(ObservationError::RssiOutOfRange { .. })
        ));
        assert!(matches!(
            validator.validate(&obs(1, 300.0, 0), 0),
            Err(ObservationError::RssiOutOfRange { .. })
        ));
    }

    #[test]
    fn test_rejects_reserved_node_and_future_stamp() {
        let validator = ObservationValidator::new();
        assert_eq!(validator.validate(&obs(0, 60.0, 0), 0), Err(ObservationError::NodeZero));
        assert_eq!(
            validator.validate(&obs(1, 60.0, 200), 100),
            Err(ObservationError::FutureTimestamp { timestamp: 200, ahead: 100 })
        );
    }

    #[test]
    fn test_rssi_from_dbm() {
        assert_eq!(rssi_from_dbm(-60), 60.0);
        assert_eq!(rssi_from_dbm(0), 0.0);
    }
}
