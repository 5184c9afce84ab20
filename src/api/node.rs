//! Node-side pipeline: capture, smoothing, rate limiting and sending

use crate::api::ObservationPublisher;
use crate::core::{Clock, MacAddress, NodeId, Observation, Point2, ShutdownSignal, Timestamp};
use crate::hardware::PacketCounters;
use crate::processing::{BoundedQueue, ObservationStore};
use crate::utils::WisnConfig;
use crate::validation::{ErrorKind, ErrorReporter, ObservationValidator, WisnError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// What happened to one captured frame
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    /// The averaged reading was queued for sending
    Queued(Observation),
    /// Averaged, but this device was already sent this interval
    Throttled { mean_rssi: f64 },
}

/// Everything one sniffing node does between the radio and the transport.
///
/// Capture threads call [`capture`](Self::capture); one sender thread runs
/// [`run_sender`](Self::run_sender).
pub struct NodePipeline {
    node: NodeId,
    position: Option<Point2>,
    send_interval_secs: u64,
    retry_delay: Duration,
    validator: ObservationValidator,
    smoothing: ObservationStore<(MacAddress, NodeId)>,
    last_sent: Mutex<HashMap<MacAddress, Timestamp>>,
    sweep_interval_secs: u64,
    last_sweep: AtomicU64,
    outbound: BoundedQueue<Observation>,
    counters: Option<Arc<PacketCounters>>,
    clock: Arc<dyn Clock>,
    reporter: Arc<ErrorReporter>,
}

impl NodePipeline {
    pub fn new(config: &WisnConfig, clock: Arc<dyn Clock>, reporter: Arc<ErrorReporter>) -> Self {
        Self {
            node: config.node.node_id,
            position: config.node.position,
            send_interval_secs: config.node.send_interval_secs,
            retry_delay: Duration::from_secs(1),
            validator: ObservationValidator::with_config(config.validation),
            smoothing: ObservationStore::smoothing(config.store.smoothing_capacity, config.store.smoothing_max_age_secs),
            last_sent: Mutex::new(HashMap::new()),
            sweep_interval_secs: config.store.smoothing_max_age_secs,
            last_sweep: AtomicU64::new(clock.now()),
            outbound: BoundedQueue::new(),
            counters: None,
            clock,
            reporter,
        }
    }

    /// Count every captured frame against the scheduler's current channel
    pub fn with_counters(mut self, counters: Arc<PacketCounters>) -> Self {
        self.counters = Some(counters);
        self
    }

    /// Pause between publish attempts after a failure
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Readings waiting for the sender
    pub fn pending(&self) -> usize {
        self.outbound.len()
    }

    /// Devices with a live smoothing window
    pub fn tracked_devices(&self) -> usize {
        self.smoothing.len()
    }

    /// Handles one frame heard from `device` at the current time
    pub fn capture(&self, device: MacAddress, rssi: f64) -> Result<CaptureOutcome, WisnError> {
        let obs = Observation::new(device, self.node, rssi, self.clock.now());
        self.ingest(obs)
    }

    /// Handles a reading built elsewhere, e.g. by a frame parser
    pub fn ingest(&self, obs: Observation) -> Result<CaptureOutcome, WisnError> {
        if let Some(counters) = &self.counters {
            counters.record_packet();
        }

        let now = self.clock.now();
        if let Err(e) = self.validator.validate(&obs, now) {
            let err = WisnError::from(e);
            self.reporter.report("capture", &err);
            return Err(err);
        }

        self.maybe_sweep(now);

        let device = obs.device();
        let key = (device, obs.node());
        let averaged_template = obs.clone();
        let report = self.smoothing.insert(key, obs, now);
        trace!(%device, len = report.len, mean = report.mean_rssi, "smoothed reading");

        if !self.should_send(device, now) {
            return Ok(CaptureOutcome::Throttled {
                mean_rssi: report.mean_rssi,
            });
        }

        let mut averaged = averaged_template.with_rssi(report.mean_rssi);
        if let Some(position) = self.position {
            averaged = averaged.with_hint(position);
        }
        if self.outbound.is_closed() {
            return Err(WisnError::Shutdown);
        }
        self.outbound.push_tail(averaged.clone());
        Ok(CaptureOutcome::Queued(averaged))
    }

    /// Marks `device` as sent if its interval has passed
    fn should_send(&self, device: MacAddress, now: Timestamp) -> bool {
        let mut last_sent = self.lock_last_sent();
        match last_sent.get(&device) {
            Some(&last) if now.saturating_sub(last) < self.send_interval_secs => false,
            _ => {
                last_sent.insert(device, now);
                true
            }
        }
    }

    /// Forgets devices not heard within the smoothing age bound and send
    /// marks older than the send interval. Returns how many devices went.
    pub fn sweep(&self, now: Timestamp) -> usize {
        let evicted = self.smoothing.evict_expired(now);
        let forgotten = self.smoothing.prune_empty();
        let marks = {
            let mut last_sent = self.lock_last_sent();
            let before = last_sent.len();
            last_sent.retain(|_, &mut last| now.saturating_sub(last) < self.send_interval_secs);
            before - last_sent.len()
        };
        debug!(node = self.node, evicted, forgotten, marks, "node sweep");
        forgotten
    }

    fn maybe_sweep(&self, now: Timestamp) {
        let last = self.last_sweep.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.sweep_interval_secs {
            return;
        }
        if self
            .last_sweep
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.sweep(now);
        }
    }

    /// Publishes queued readings until the queue is closed and drained.
    ///
    /// A reading that fails for a transient reason stays next in line and is
    /// retried after `retry_delay`; shutdown during that wait abandons it. A
    /// reading the far side rejects is dropped. A closed publisher stops the
    /// sender. Returns how many readings were delivered.
    pub fn run_sender(&self, publisher: &dyn ObservationPublisher, shutdown: &ShutdownSignal) -> u64 {
        info!(node = self.node, "sender started");
        let mut sent = 0u64;
        let mut retry: Option<Observation> = None;
        loop {
            let obs = match retry.take() {
                Some(obs) => obs,
                None => match self.outbound.pop_head(true) {
                    Some(obs) => obs,
                    None => break,
                },
            };

            match publisher.publish(&obs) {
                Ok(()) => {
                    sent += 1;
                    debug!(device = %obs.device(), rssi = obs.rssi(), "published");
                }
                Err(e) => match self.reporter.report("publish", &e.into()) {
                    ErrorKind::Transient => {
                        retry = Some(obs);
                        if shutdown.wait_timeout(self.retry_delay) {
                            warn!(node = self.node, "shutdown with unpublished reading");
                            break;
                        }
                    }
                    ErrorKind::Shutdown => {
                        warn!(node = self.node, pending = self.outbound.len(), "publisher closed");
                        self.outbound.close();
                        break;
                    }
                    _ => warn!(node = self.node, device = %obs.device(), "reading dropped"),
                },
            }
        }
        info!(node = self.node, sent, "sender stopped");
        sent
    }

    /// Stops accepting work for the sender; it exits once the queue drains
    pub fn close(&self) {
        self.outbound.close();
    }

    fn lock_last_sent(&self) -> MutexGuard<'_, HashMap<MacAddress, Timestamp>> {
        self.last_sent.lock().unwrap_or_else(|poisoned| {
            warn!("last-sent map poisoned; recovering");
            poisoned.into_inner()
        })
    }
}
