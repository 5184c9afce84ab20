//! JSON records exchanged with the transport and persistence collaborators
//!
//! Every inbound record is decoded through serde into a typed struct, so a
//! missing or mistyped field rejects the single record instead of leaving a
//! half-filled value behind.

use crate::core::{
    AnchorNode, CalibrationKind, CalibrationPoint, ControlEvent, MacAddress, NodeId, Observation, Point2,
    PositionReport, Timestamp,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Topic prefix shared by every node publication
pub const TOPIC_ROOT: &str = "wisn";
/// Control events from the management surface
pub const EVENTS_TOPIC: &str = "wisn/events";
/// Positions published by the server
pub const POSITIONS_TOPIC: &str = "wisn/positions";
/// Event payload requesting an anchor refresh
pub const EVENT_NODE_UPDATE: &str = "nodeUpdate";
/// Event payload requesting a calibration refresh
pub const EVENT_CALIBRATION_UPDATE: &str = "calibrationUpdate";

const NODE_NAME_PREFIX: &str = "wisn";
const CALIBRATION_START_PREFIX: &str = "start";
const CALIBRATION_END_PREFIX: &str = "end";

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed {record} record: {source}")]
    Malformed {
        record: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode {record} record: {source}")]
    Encode {
        record: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("node name '{0}' carries no node number")]
    BadNodeName(String),

    #[error("calibration name '{0}' must be start<distance> or end<distance>")]
    BadCalibrationName(String),

    #[error("unknown control event '{0}'")]
    UnknownEvent(String),
}

/// Observation as published by a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationMessage {
    pub node: NodeId,
    pub time: Timestamp,
    pub mac: MacAddress,
    pub rssi: f64,
    /// Reporting node's own position, sent by nodes that know it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
}

impl From<&Observation> for ObservationMessage {
    fn from(obs: &Observation) -> Self {
        let hint = obs.hint();
        Self {
            node: obs.node(),
            time: obs.timestamp(),
            mac: obs.device(),
            rssi: obs.rssi(),
            x: hint.map(|p| p.x),
            y: hint.map(|p| p.y),
        }
    }
}

impl From<ObservationMessage> for Observation {
    fn from(msg: ObservationMessage) -> Self {
        let obs = Observation::new(msg.mac, msg.node, msg.rssi, msg.time);
        match (msg.x, msg.y) {
            (Some(x), Some(y)) => obs.with_hint(Point2::new(x, y)),
            _ => obs,
        }
    }
}

/// Anchor node document from the node collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
}

impl TryFrom<NodeRecord> for AnchorNode {
    type Error = WireError;

    fn try_from(record: NodeRecord) -> Result<Self, Self::Error> {
        let node = node_id_from_name(&record.name)?;
        let anchor = AnchorNode::new(node, record.x, record.y);
        Ok(match record.z {
            Some(z) => anchor.with_height(z),
            None => anchor,
        })
    }
}

/// Calibration document; role and distance live in the name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub name: String,
    pub x: f64,
    pub y: f64,
}

impl TryFrom<CalibrationRecord> for CalibrationPoint {
    type Error = WireError;

    fn try_from(record: CalibrationRecord) -> Result<Self, Self::Error> {
        let (kind, distance) = parse_calibration_name(&record.name)?;
        Ok(CalibrationPoint::new(record.name, record.x, record.y, distance, kind))
    }
}

/// Position published for a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionMessage {
    pub mac: MacAddress,
    pub x: f64,
    pub y: f64,
}

impl From<&PositionReport> for PositionMessage {
    fn from(report: &PositionReport) -> Self {
        Self {
            mac: report.device,
            x: report.x,
            y: report.y,
        }
    }
}

/// What an inbound publication turned out to be
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Observation(Observation),
    Control(ControlEvent),
    /// Traffic the server itself produced
    Ignored,
}

/// Topic a node publishes its observations on
pub fn node_topic(node: NodeId) -> String {
    format!("{TOPIC_ROOT}/{NODE_NAME_PREFIX}{node:03}")
}

/// Routes a publication by topic and decodes its payload
pub fn decode_inbound(topic: &str, payload: &[u8]) -> Result<Inbound, WireError> {
    match topic {
        EVENTS_TOPIC => {
            let text = String::from_utf8_lossy(payload);
            decode_event(text.trim()).map(Inbound::Control)
        }
        POSITIONS_TOPIC => Ok(Inbound::Ignored),
        _ => decode_observation(payload).map(Inbound::Observation),
    }
}

pub fn decode_observation(payload: &[u8]) -> Result<Observation, WireError> {
    let msg: ObservationMessage = serde_json::from_slice(payload).map_err(|source| WireError::Malformed {
        record: "observation",
        source,
    })?;
    Ok(msg.into())
}

pub fn encode_observation(obs: &Observation) -> Result<String, WireError> {
    serde_json::to_string(&ObservationMessage::from(obs)).map_err(|source| WireError::Encode {
        record: "observation",
        source,
    })
}

pub fn decode_node(payload: &str) -> Result<AnchorNode, WireError> {
    let record: NodeRecord = serde_json::from_str(payload).map_err(|source| WireError::Malformed {
        record: "node",
        source,
    })?;
    record.try_into()
}

pub fn decode_calibration(payload: &str) -> Result<CalibrationPoint, WireError> {
    let record: CalibrationRecord = serde_json::from_str(payload).map_err(|source| WireError::Malformed {
        record: "calibration",
        source,
    })?;
    record.try_into()
}

pub fn encode_position(report: &PositionReport) -> Result<String, WireError> {
    serde_json::to_string(&PositionMessage::from(report)).map_err(|source| WireError::Encode {
        record: "position",
        source,
    })
}

pub fn decode_event(payload: &str) -> Result<ControlEvent, WireError> {
    match payload {
        EVENT_NODE_UPDATE => Ok(ControlEvent::RefreshNodes),
        EVENT_CALIBRATION_UPDATE => Ok(ControlEvent::RefreshCalibration),
        other => Err(WireError::UnknownEvent(other.to_string())),
    }
}

/// Node number from a name like `wisn007`: the first run of digits
pub fn node_id_from_name(name: &str) -> Result<NodeId, WireError> {
    let digits: String = name
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    match digits.parse::<NodeId>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(WireError::BadNodeName(name.to_string())),
    }
}

/// Role and known distance from a name like `start5` or `end2.5`
pub fn parse_calibration_name(name: &str) -> Result<(CalibrationKind, f64), WireError> {
    let (kind, rest) = if let Some(rest) = name.strip_prefix(CALIBRATION_START_PREFIX) {
        (CalibrationKind::Start, rest)
    } else if let Some(rest) = name.strip_prefix(CALIBRATION_END_PREFIX) {
        (CalibrationKind::End, rest)
    } else {
        return Err(WireError::BadCalibrationName(name.to_string()));
    };

    match rest.parse::<f64>() {
        Ok(distance) if distance.is_finite() && distance > 0.0 => Ok((kind, distance)),
        _ => Err(WireError::BadCalibrationName(name.to_string())),
    }
}
