//! In-process collaborators used by the simulator and the tests

use crate::api::{
    AnchorSource, CalibrationSource, ObservationPublisher, PositionSink, ServerPipeline, TransportError,
    TransportResult,
};
use crate::core::{AnchorNode, CalibrationPoint, MacAddress, Observation, PositionReport};
use crate::processing::wire::{decode_calibration, decode_node, encode_observation, encode_position, node_topic};
use crate::processing::WireError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{trace, warn};

/// Carries node publications straight into a server pipeline.
///
/// Every reading goes through the JSON encoding a broker would carry, so the
/// server sees exactly what it would see over the network.
pub struct LoopbackTransport {
    server: Arc<ServerPipeline>,
    online: AtomicBool,
    delivered: AtomicU64,
}

impl LoopbackTransport {
    pub fn new(server: Arc<ServerPipeline>) -> Self {
        Self {
            server,
            online: AtomicBool::new(true),
            delivered: AtomicU64::new(0),
        }
    }

    /// Simulates the broker going away and coming back
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl ObservationPublisher for LoopbackTransport {
    fn publish(&self, obs: &Observation) -> TransportResult<()> {
        if !self.online.load(Ordering::Acquire) {
            return Err(TransportError::Unavailable("loopback offline".to_string()));
        }
        let topic = node_topic(obs.node());
        let payload = encode_observation(obs)?;
        trace!(%topic, %payload, "loopback publish");
        self.server
            .handle_publication(&topic, payload.as_bytes())
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Keeps the latest position per device and the JSON that would be published
#[derive(Debug, Default)]
pub struct MemoryPositionSink {
    latest: Mutex<HashMap<MacAddress, PositionReport>>,
    published: Mutex<Vec<String>>,
}

impl MemoryPositionSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self, device: &MacAddress) -> Option<PositionReport> {
        lock(&self.latest).get(device).cloned()
    }

    pub fn positions(&self) -> Vec<PositionReport> {
        lock(&self.latest).values().cloned().collect()
    }

    /// Position messages in publish order
    pub fn published(&self) -> Vec<String> {
        lock(&self.published).clone()
    }
}

impl PositionSink for MemoryPositionSink {
    fn store_position(&self, report: &PositionReport) -> TransportResult<()> {
        let message = encode_position(report)?;
        lock(&self.latest).insert(report.device, report.clone());
        lock(&self.published).push(message);
        Ok(())
    }
}

/// Anchor list held in memory, replaceable at runtime
#[derive(Debug, Default)]
pub struct StaticAnchors {
    anchors: RwLock<Vec<AnchorNode>>,
}

impl StaticAnchors {
    pub fn new(anchors: Vec<AnchorNode>) -> Self {
        Self {
            anchors: RwLock::new(anchors),
        }
    }

    /// Builds the list from stored node documents
    pub fn from_documents<S: AsRef<str>>(documents: &[S]) -> Result<Self, WireError> {
        let anchors = documents
            .iter()
            .map(|doc| decode_node(doc.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(anchors))
    }

    pub fn set(&self, anchors: Vec<AnchorNode>) {
        *self.anchors.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = anchors;
    }
}

impl AnchorSource for StaticAnchors {
    fn load_anchors(&self) -> TransportResult<Vec<AnchorNode>> {
        Ok(self.anchors.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone())
    }
}

/// Calibration list held in memory, replaceable at runtime
#[derive(Debug, Default)]
pub struct StaticCalibration {
    points: RwLock<Vec<CalibrationPoint>>,
}

impl StaticCalibration {
    pub fn new(points: Vec<CalibrationPoint>) -> Self {
        Self {
            points: RwLock::new(points),
        }
    }

    /// Builds the list from stored calibration documents, keeping their order
    pub fn from_documents<S: AsRef<str>>(documents: &[S]) -> Result<Self, WireError> {
        let points = documents
            .iter()
            .map(|doc| decode_calibration(doc.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(points))
    }

    pub fn set(&self, points: Vec<CalibrationPoint>) {
        *self.points.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = points;
    }
}

impl CalibrationSource for StaticCalibration {
    fn load_calibration(&self) -> TransportResult<Vec<CalibrationPoint>> {
        Ok(self.points.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| {
        warn!("in-memory collaborator mutex poisoned; recovering");
        poisoned.into_inner()
    })
}
