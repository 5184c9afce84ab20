//! Power-law path-loss model mapping smoothed RSSI to distance

use crate::core::{DISTANCE_COEFFICIENT, DISTANCE_EXPONENT};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum DistanceError {
    #[error("RSSI {0} is outside the model's domain (must be finite and positive)")]
    InvalidRssi(f64),

    #[error("scale factor {0} must be finite and positive")]
    InvalidScale(f64),
}

/// `distance = coefficient * rssi^exponent * scale`
///
/// RSSI here is the magnitude reported by capture (larger means farther), and
/// `scale` is the calibration factor in coordinate units per meter, so the
/// result is in coordinate units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistanceModel {
    pub coefficient: f64,
    pub exponent: f64,
}

impl Default for DistanceModel {
    fn default() -> Self {
        Self {
            coefficient: DISTANCE_COEFFICIENT,
            exponent: DISTANCE_EXPONENT,
        }
    }
}

impl DistanceModel {
    pub fn new(coefficient: f64, exponent: f64) -> Self {
        Self { coefficient, exponent }
    }

    pub fn distance(&self, rssi: f64, scale: f64) -> Result<f64, DistanceError> {
        if !rssi.is_finite() || rssi <= 0.0 {
            return Err(DistanceError::InvalidRssi(rssi));
        }
        if !scale.is_finite() || scale <= 0.0 {
            return Err(DistanceError::InvalidScale(scale));
        }
        Ok(self.coefficient * rssi.powf(self.exponent) * scale)
    }

    /// Inverse of [`distance`](Self::distance), used to synthesise readings
    pub fn rssi_for_distance(&self, distance: f64, scale: f64) -> Result<f64, DistanceError> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(DistanceError::InvalidScale(scale));
        }
        Ok((distance.max(0.0) / (self.coefficient * scale)).powf(1.0 / self.exponent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_matches_power_law() {
        let model = DistanceModel::default();
        let d = model.distance(60.0, 1.0).unwrap();
        let expected = 0.0002 * 60f64.powf(2.9179);
        assert!((d - expected).abs() < 1e-9);
        assert!((model.distance(60.0, 2.0).unwrap() - 2.0 * expected).abs() < 1e-9);
    }

    #[test]
    fn test_distance_grows_with_rssi_magnitude() {
        let model = DistanceModel::default();
        assert!(model.distance(40.0, 1.0).unwrap() < model.distance(70.0, 1.0).unwrap());
    }

    #[test]
    fn test_invalid_rssi_is_rejected() {
        let model = DistanceModel::default();
        assert_eq!(model.distance(0.0, 1.0), Err(DistanceError::InvalidRssi(0.0)));
        assert_eq!(model.distance(-50.0, 1.0), Err(DistanceError::InvalidRssi(-50.0)));
        assert!(model.distance(f64::NAN, 1.0).is_err());
        assert!(model.distance(f64::INFINITY, 1.0).is_err());
        assert_eq!(model.distance(50.0, 0.0), Err(DistanceError::InvalidScale(0.0)));
    }

    #[test]
    fn test_inverse_recovers_rssi() {
        let model = DistanceModel::default();
        let d = model.distance(55.0, 1.5).unwrap();
        let rssi = model.rssi_for_distance(d, 1.5).unwrap();
        assert!((rssi - 55.0).abs() < 1e-9);
    }
}
