//! Core data types for the localisation pipeline

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifier of a sniffing node
pub type NodeId = u16;

/// Wall-clock time in whole seconds since the Unix epoch
pub type Timestamp = u64;

/// 48-bit IEEE 802 hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

/// Error returned when a MAC string is not 12 hex digits
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid MAC address '{0}'")]
pub struct MacParseError(pub String);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Packs the address into the low 48 bits of a `u64`
    pub fn to_u64(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
    }

    /// Takes the low 48 bits of `value`, most significant octet first
    pub fn from_u64(value: u64) -> Self {
        let mut octets = [0u8; 6];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = (value >> (8 * (5 - i))) as u8;
        }
        Self(octets)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl FromStr for MacAddress {
    type Err = MacParseError;

    /// Accepts `AABBCCDDEEFF` and the colon/dash separated forms
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(MacParseError(s.to_string()));
        }
        let value = u64::from_str_radix(&digits, 16).map_err(|_| MacParseError(s.to_string()))?;
        Ok(Self::from_u64(value))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = MacParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}

/// Planar coordinate in the deployed map space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: &Point2) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// One RSSI sighting of a device by a node.
///
/// Immutable once built. Copies are only made through an explicit `clone()`.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    timestamp: Timestamp,
    device: MacAddress,
    node: NodeId,
    rssi: f64,
    hint: Option<Point2>,
}

impl Observation {
    pub fn new(device: MacAddress, node: NodeId, rssi: f64, timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            device,
            node,
            rssi,
            hint: None,
        }
    }

    /// Attaches the reporting node's own position
    pub fn with_hint(mut self, hint: Point2) -> Self {
        self.hint = Some(hint);
        self
    }

    /// Copy of this observation carrying a different RSSI value
    pub fn with_rssi(&self, rssi: f64) -> Self {
        Self { rssi, ..self.clone() }
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn device(&self) -> MacAddress {
        self.device
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn rssi(&self) -> f64 {
        self.rssi
    }

    pub fn hint(&self) -> Option<Point2> {
        self.hint
    }

    /// Seconds elapsed between capture and `now`; zero for future stamps
    pub fn age(&self, now: Timestamp) -> u64 {
        now.saturating_sub(self.timestamp)
    }
}

/// Fixed sniffing node with a known position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnchorNode {
    pub node: NodeId,
    pub x: f64,
    pub y: f64,
    /// Height, only present for anchors surveyed in three dimensions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
}

impl AnchorNode {
    pub fn new(node: NodeId, x: f64, y: f64) -> Self {
        Self { node, x, y, z: None }
    }

    pub fn with_height(mut self, z: f64) -> Self {
        self.z = Some(z);
        self
    }

    pub fn position(&self) -> Point2 {
        Point2::new(self.x, self.y)
    }
}

/// Role of a calibration point within its pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationKind {
    Start,
    End,
}

/// Surveyed reference point with a known real-world separation from its partner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub name: String,
    pub x: f64,
    pub y: f64,
    /// Real-world distance between this point and its partner (meters)
    pub calibration_distance: f64,
    pub kind: CalibrationKind,
}

impl CalibrationPoint {
    pub fn new(name: impl Into<String>, x: f64, y: f64, calibration_distance: f64, kind: CalibrationKind) -> Self {
        Self {
            name: name.into(),
            x,
            y,
            calibration_distance,
            kind,
        }
    }

    /// Two points pair up when they share a distance and have opposite roles
    pub fn pairs_with(&self, other: &CalibrationPoint) -> bool {
        self.calibration_distance == other.calibration_distance && self.kind != other.kind
    }
}

/// How an estimate was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateMethod {
    /// Only one anchor heard the device; its position is reported
    SingleAnchor,
    /// Two anchors; the one with the shorter range wins
    NearestOfTwo,
    /// Least-squares solve over three or more anchors
    Multilateration,
}

/// Output of one solver invocation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
    pub method: EstimateMethod,
    pub anchors_used: usize,
    /// Euclidean norm of the linear-system residual, zero for the trivial cases
    pub residual: f64,
}

impl Estimate {
    pub fn point(&self) -> Point2 {
        Point2::new(self.x, self.y)
    }
}

/// Position result handed to persistence and publishing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionReport {
    pub device: MacAddress,
    pub x: f64,
    pub y: f64,
    pub method: EstimateMethod,
    pub timestamp: Timestamp,
}

/// Externally triggered refresh requests honoured before the next solve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    RefreshNodes,
    RefreshCalibration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_round_trip_through_u64() {
        let mac = MacAddress::new([0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03]);
        assert_eq!(mac.to_u64(), 0xAABBCC010203);
        assert_eq!(MacAddress::from_u64(0xAABBCC010203), mac);
    }

    #[test]
    fn test_mac_display_and_parse() {
        let mac: MacAddress = "aa:bb:cc:01:02:03".parse().unwrap();
        assert_eq!(mac.to_string(), "AABBCC010203");
        assert_eq!("AABBCC010203".parse::<MacAddress>().unwrap(), mac);
        assert!("AABBCC0102".parse::<MacAddress>().is_err());
        assert!("AABBCC01020Z".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_observation_age_saturates() {
        let obs = Observation::new(MacAddress::new([1; 6]), 1, 60.0, 100);
        assert_eq!(obs.age(160), 60);
        assert_eq!(obs.age(50), 0);
    }

    #[test]
    fn test_calibration_pairing() {
        let start = CalibrationPoint::new("start5", 0.0, 0.0, 5.0, CalibrationKind::Start);
        let end = CalibrationPoint::new("end5", 10.0, 0.0, 5.0, CalibrationKind::End);
        let other = CalibrationPoint::new("end7", 10.0, 0.0, 7.0, CalibrationKind::End);
        assert!(start.pairs_with(&end));
        assert!(!start.pairs_with(&start.clone()));
        assert!(!start.pairs_with(&other));
    }
}
