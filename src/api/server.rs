//! Server-side pipeline: intake, fusion, ranging, solving and publishing

use crate::algorithms::{DistanceModel, Multilateration, RangeMeasurement};
use crate::api::{AnchorSource, CalibrationSource, PositionSink};
use crate::core::{AnchorNode, Clock, ControlEvent, MacAddress, NodeId, Observation, PositionReport, ShutdownSignal};
use crate::processing::wire::{decode_inbound, Inbound};
use crate::processing::{BoundedQueue, CalibrationEngine, ObservationStore};
use crate::utils::WisnConfig;
use crate::validation::{ErrorKind, ErrorReporter, ObservationValidator, WisnError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// External collaborators the server reads from and writes to
#[derive(Clone)]
pub struct ServerCollaborators {
    pub anchors: Arc<dyn AnchorSource>,
    pub calibration: Arc<dyn CalibrationSource>,
    pub sink: Arc<dyn PositionSink>,
}

/// Fuses readings from every node into device positions.
///
/// Anchors and calibration are loaded lazily: a refresh request only raises a
/// flag, and the flag is honoured before the next solve.
pub struct ServerPipeline {
    intake: BoundedQueue<Observation>,
    fusion: ObservationStore<MacAddress>,
    anchors: RwLock<HashMap<NodeId, AnchorNode>>,
    calibration: CalibrationEngine,
    distance: DistanceModel,
    solver: Multilateration,
    validator: ObservationValidator,
    refresh_nodes: AtomicBool,
    refresh_calibration: AtomicBool,
    collaborators: ServerCollaborators,
    clock: Arc<dyn Clock>,
    reporter: Arc<ErrorReporter>,
}

impl ServerPipeline {
    pub fn new(
        config: &WisnConfig,
        collaborators: ServerCollaborators,
        clock: Arc<dyn Clock>,
        reporter: Arc<ErrorReporter>,
    ) -> Self {
        Self {
            intake: BoundedQueue::new(),
            fusion: ObservationStore::fusion(config.store.staleness_secs),
            anchors: RwLock::new(HashMap::new()),
            calibration: CalibrationEngine::new(),
            distance: config.distance_model(),
            solver: Multilateration::new(config.solver),
            validator: ObservationValidator::with_config(config.validation),
            refresh_nodes: AtomicBool::new(true),
            refresh_calibration: AtomicBool::new(true),
            collaborators,
            clock,
            reporter,
        }
    }

    /// Queues a reading for the worker
    pub fn submit(&self, obs: Observation) {
        self.intake.push_tail(obs);
    }

    /// Entry point for the transport: routes one publication by topic
    pub fn handle_publication(&self, topic: &str, payload: &[u8]) -> Result<(), WisnError> {
        match decode_inbound(topic, payload) {
            Ok(Inbound::Observation(obs)) => {
                self.submit(obs);
                Ok(())
            }
            Ok(Inbound::Control(event)) => {
                self.handle_event(event);
                Ok(())
            }
            Ok(Inbound::Ignored) => Ok(()),
            Err(e) => {
                let err = WisnError::from(e);
                self.reporter.report("decode", &err);
                Err(err)
            }
        }
    }

    pub fn handle_event(&self, event: ControlEvent) {
        debug!(?event, "control event");
        match event {
            ControlEvent::RefreshNodes => self.refresh_nodes.store(true, Ordering::Release),
            ControlEvent::RefreshCalibration => self.refresh_calibration.store(true, Ordering::Release),
        }
    }

    /// Runs any refresh requested since the last solve. A failed refresh stays
    /// requested so the next pass tries again.
    pub fn apply_pending_refresh(&self) {
        if self.refresh_nodes.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.refresh_anchors() {
                self.reporter.report("refresh nodes", &e);
                self.refresh_nodes.store(true, Ordering::Release);
            }
        }
        if self.refresh_calibration.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.refresh_calibration() {
                self.reporter.report("refresh calibration", &e);
                self.refresh_calibration.store(true, Ordering::Release);
            }
        }
    }

    /// Replaces the anchor registry from the anchor source
    pub fn refresh_anchors(&self) -> Result<usize, WisnError> {
        let loaded = self.collaborators.anchors.load_anchors()?;
        let mut anchors = self.write_anchors();
        anchors.clear();
        for anchor in loaded {
            if anchors.insert(anchor.node, anchor).is_some() {
                warn!(node = anchor.node, "duplicate anchor, keeping the later one");
            }
        }
        info!(anchors = anchors.len(), "anchor registry refreshed");
        Ok(anchors.len())
    }

    /// Replaces the calibration list and returns the new scale
    pub fn refresh_calibration(&self) -> Result<f64, WisnError> {
        let points = self.collaborators.calibration.load_calibration()?;
        Ok(self.calibration.refresh(points))
    }

    pub fn anchor(&self, node: NodeId) -> Option<AnchorNode> {
        self.read_anchors().get(&node).copied()
    }

    pub fn scale(&self) -> f64 {
        self.calibration.scale()
    }

    pub fn known_devices(&self) -> Vec<MacAddress> {
        self.fusion.keys()
    }

    /// Fuses one reading and tries to place its device
    pub fn process(&self, obs: Observation) -> Option<PositionReport> {
        let now = self.clock.now();
        if let Err(e) = self.validator.validate(&obs, now) {
            self.reporter.report("intake", &e.into());
            return None;
        }
        self.apply_pending_refresh();

        let device = obs.device();
        self.fusion.insert(device, obs, now);
        self.report_outcome(device, self.localise(device))
    }

    /// Solves `device` from its fresh readings and hands the result to the sink
    pub fn localise(&self, device: MacAddress) -> Result<PositionReport, WisnError> {
        let now = self.clock.now();
        let snapshot = self.fusion.snapshot_for_solve(&device, now);
        let scale = self.calibration.scale();

        let mut measurements = Vec::with_capacity(snapshot.len());
        {
            let anchors = self.read_anchors();
            for (node, obs) in &snapshot {
                let anchor = anchors
                    .get(node)
                    .copied()
                    .or_else(|| obs.hint().map(|p| AnchorNode::new(*node, p.x, p.y)));
                let Some(anchor) = anchor else {
                    debug!(%device, node, "reading from unknown node skipped");
                    continue;
                };
                match self.distance.distance(obs.rssi(), scale) {
                    Ok(distance) => measurements.push(RangeMeasurement::new(anchor, distance)),
                    Err(e) => {
                        self.reporter.report("distance", &e.into());
                    }
                }
            }
        }

        let estimate = self.solver.try_solve(&measurements)?;
        let report = PositionReport {
            device,
            x: estimate.x,
            y: estimate.y,
            method: estimate.method,
            timestamp: now,
        };
        self.collaborators.sink.store_position(&report)?;
        debug!(%device, x = report.x, y = report.y, method = ?report.method, "position published");
        Ok(report)
    }

    /// Places every known device once. Returns how many got a position.
    pub fn sweep_all(&self) -> usize {
        self.apply_pending_refresh();
        let located = self
            .fusion
            .keys()
            .into_iter()
            .filter_map(|device| self.report_outcome(device, self.localise(device)))
            .count();
        let pruned = self.fusion.prune_empty();
        if pruned > 0 {
            debug!(pruned, "forgot devices with no fresh readings");
        }
        located
    }

    /// Consumes the intake queue until it is closed or shutdown is requested.
    /// A solve already running finishes; no new one starts after shutdown.
    pub fn run(&self, shutdown: &ShutdownSignal) -> u64 {
        info!("server worker started");
        let mut processed = 0u64;
        while let Some(obs) = self.intake.pop_head(true) {
            if shutdown.is_triggered() {
                break;
            }
            self.process(obs);
            processed += 1;
        }
        info!(processed, "server worker stopped");
        processed
    }

    /// Wakes the worker so it can observe shutdown
    pub fn close(&self) {
        self.intake.close();
    }

    pub fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }

    fn report_outcome(&self, device: MacAddress, outcome: Result<PositionReport, WisnError>) -> Option<PositionReport> {
        match outcome {
            Ok(report) => Some(report),
            Err(e) => {
                if self.reporter.report("localise", &e) == ErrorKind::Numerical {
                    debug!(%device, "no position this cycle");
                }
                None
            }
        }
    }

    fn read_anchors(&self) -> RwLockReadGuard<'_, HashMap<NodeId, AnchorNode>> {
        self.anchors.read().unwrap_or_else(|poisoned| {
            warn!("anchor registry lock poisoned; recovering");
            poisoned.into_inner()
        })
    }

    fn write_anchors(&self) -> RwLockWriteGuard<'_, HashMap<NodeId, AnchorNode>> {
        self.anchors.write().unwrap_or_else(|poisoned| {
            warn!("anchor registry lock poisoned; recovering");
            poisoned.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{MemoryPositionSink, StaticAnchors, StaticCalibration};
    use crate::core::{CalibrationKind, CalibrationPoint, EstimateMethod, ManualClock, Point2};
    use std::thread;

    const DEVICE: MacAddress = MacAddress::new([0x02, 0, 0, 0, 0, 0x42]);

    struct Fixture {
        server: Arc<ServerPipeline>,
        anchors: Arc<StaticAnchors>,
        calibration: Arc<StaticCalibration>,
        sink: Arc<MemoryPositionSink>,
        clock: Arc<ManualClock>,
    }

    fn fixture(staleness_secs: u64) -> Fixture {
        let mut config = WisnConfig::default();
        config.store.staleness_secs = staleness_secs;
        let anchors = Arc::new(StaticAnchors::new(vec![
            AnchorNode::new(1, 0.0, 0.0),
            AnchorNode::new(2, 10.0, 0.0),
            AnchorNode::new(3, 0.0, 10.0),
        ]));
        let calibration = Arc::new(StaticCalibration::new(Vec::new()));
        let sink = Arc::new(MemoryPositionSink::new());
        let clock = Arc::new(ManualClock::new(10_000));
        let server = Arc::new(ServerPipeline::new(
            &config,
            ServerCollaborators {
                anchors: anchors.clone(),
                calibration: calibration.clone(),
                sink: sink.clone(),
            },
            clock.clone(),
            Arc::new(ErrorReporter::new()),
        ));
        Fixture {
            server,
            anchors,
            calibration,
            sink,
            clock,
        }
    }

    /// Reading that the default model maps to `distance` at scale 1
    fn reading(node: NodeId, distance: f64, timestamp: u64) -> Observation {
        let rssi = DistanceModel::default().rssi_for_distance(distance, 1.0).unwrap();
        Observation::new(DEVICE, node, rssi, timestamp)
    }

    fn dist(a: (f64, f64), b: (f64, f64)) -> f64 {
        Point2::new(a.0, a.1).distance_to(&Point2::new(b.0, b.1))
    }

    #[test]
    fn test_three_nodes_locate_device() {
        let f = fixture(300);
        let target = (3.0, 3.0);
        assert!(f.server.process(reading(1, dist((0.0, 0.0), target), 10_000)).is_some());
        assert!(f.server.process(reading(2, dist((10.0, 0.0), target), 10_000)).is_some());
        let report = f.server.process(reading(3, dist((0.0, 10.0), target), 10_000)).unwrap();

        assert_eq!(report.method, EstimateMethod::Multilateration);
        assert!((report.x - 3.0).abs() < 1e-6);
        assert!((report.y - 3.0).abs() < 1e-6);
        assert_eq!(f.sink.latest(&DEVICE), Some(report));
        assert_eq!(f.sink.published().len(), 3);
    }

    #[test]
    fn test_stale_readings_are_dropped_at_solve_time() {
        let f = fixture(60);
        f.server.process(reading(1, 2.0, 10_000));
        f.server.process(reading(2, 9.0, 10_000));
        f.clock.advance(61);
        let report = f.server.process(reading(3, 5.0, 10_061)).unwrap();
        assert_eq!(report.method, EstimateMethod::SingleAnchor);
        assert_eq!((report.x, report.y), (0.0, 10.0));
    }

    #[test]
    fn test_two_readings_pick_nearer_anchor() {
        let f = fixture(300);
        f.server.process(reading(1, 8.0, 10_000));
        let report = f.server.process(reading(2, 3.0, 10_000)).unwrap();
        assert_eq!(report.method, EstimateMethod::NearestOfTwo);
        assert_eq!((report.x, report.y), (10.0, 0.0));
    }

    #[test]
    fn test_unknown_node_uses_position_hint() {
        let f = fixture(300);
        let obs = reading(9, 1.0, 10_000).with_hint(Point2::new(42.0, 24.0));
        let report = f.server.process(obs).unwrap();
        assert_eq!((report.x, report.y), (42.0, 24.0));

        let f = fixture(300);
        assert!(f.server.process(reading(9, 1.0, 10_000)).is_none());
    }

    #[test]
    fn test_refresh_flags_are_honoured_before_next_solve() {
        let f = fixture(300);
        f.server.process(reading(1, 1.0, 10_000));
        assert_eq!(f.server.anchor(1), Some(AnchorNode::new(1, 0.0, 0.0)));

        f.anchors.set(vec![AnchorNode::new(1, 50.0, 60.0)]);
        let report = f.server.process(reading(1, 1.0, 10_000)).unwrap();
        assert_eq!((report.x, report.y), (0.0, 0.0));

        f.server.handle_event(ControlEvent::RefreshNodes);
        let report = f.server.process(reading(1, 1.0, 10_000)).unwrap();
        assert_eq!((report.x, report.y), (50.0, 60.0));
        assert_eq!(f.server.anchor(2), None);
    }

    #[test]
    fn test_calibration_refresh_changes_scale() {
        let f = fixture(300);
        f.server.process(reading(1, 1.0, 10_000));
        assert_eq!(f.server.scale(), 1.0);

        f.calibration.set(vec![
            CalibrationPoint::new("start5", 0.0, 0.0, 5.0, CalibrationKind::Start),
            CalibrationPoint::new("end5", 10.0, 0.0, 5.0, CalibrationKind::End),
        ]);
        f.server
            .handle_publication(crate::processing::wire::EVENTS_TOPIC, b"calibrationUpdate")
            .unwrap();
        f.server.process(reading(1, 1.0, 10_000));
        assert_eq!(f.server.scale(), 2.0);
    }

    #[test]
    fn test_invalid_and_malformed_input_is_rejected() {
        let f = fixture(300);
        assert!(f.server.process(Observation::new(DEVICE, 1, -3.0, 10_000)).is_none());
        assert!(f.server.handle_publication("wisn/wisn001", b"{\"node\":1}").is_err());
        assert!(f.server.known_devices().is_empty());
        assert_eq!(f.server.reporter().summary().data, 2);
    }

    #[test]
    fn test_sweep_all_solves_every_device() {
        let f = fixture(300);
        let other = MacAddress::new([0x02, 0, 0, 0, 0, 0x43]);
        f.server.process(reading(1, 1.0, 10_000));
        f.server.process(Observation::new(other, 2, 40.0, 10_000));
        assert_eq!(f.server.sweep_all(), 2);

        f.clock.advance(1_000);
        assert_eq!(f.server.sweep_all(), 0);
        assert!(f.server.known_devices().is_empty());
    }

    #[test]
    fn test_worker_consumes_intake_until_closed() {
        let f = fixture(300);
        let shutdown = Arc::new(ShutdownSignal::new());
        let worker = {
            let server = Arc::clone(&f.server);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || server.run(&shutdown))
        };

        f.server
            .handle_publication(
                "wisn/wisn001",
                br#"{"node":1,"time":10000,"mac":"020000000042","rssi":40}"#,
            )
            .unwrap();
        f.server.submit(reading(2, 4.0, 10_000));
        f.server.close();
        assert_eq!(worker.join().unwrap(), 2);
        assert!(f.sink.latest(&DEVICE).is_some());
    }
}
