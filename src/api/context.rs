//! Runtimes owning the worker threads of a node and of the server

use crate::api::{NodePipeline, ObservationPublisher, ServerPipeline};
use crate::core::ShutdownSignal;
use crate::hardware::{ChannelScheduler, ChannelTuner, TunerError};
use crate::validation::WisnError;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

fn spawn_named<T, F>(name: String, f: F) -> Result<JoinHandle<T>, WisnError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|source| WisnError::ThreadSpawn { name, source })
}

/// A running sniffing node: sender thread plus optional channel scheduler
pub struct NodeRuntime {
    pipeline: Arc<NodePipeline>,
    shutdown: Arc<ShutdownSignal>,
    sender: Option<JoinHandle<u64>>,
    scheduler: Option<JoinHandle<Result<(), TunerError>>>,
}

impl NodeRuntime {
    pub fn start(
        pipeline: Arc<NodePipeline>,
        publisher: Arc<dyn ObservationPublisher>,
        scheduler: Option<(ChannelScheduler, Box<dyn ChannelTuner>)>,
    ) -> Result<Self, WisnError> {
        let shutdown = Arc::new(ShutdownSignal::new());
        let node = pipeline.node();

        let sender = {
            let pipeline = Arc::clone(&pipeline);
            let worker_shutdown = Arc::clone(&shutdown);
            spawn_named(format!("wisn{node:03}-sender"), move || {
                pipeline.run_sender(publisher.as_ref(), &worker_shutdown)
            })?
        };

        let scheduler = match scheduler {
            Some((mut scheduler, mut tuner)) => {
                let worker_shutdown = Arc::clone(&shutdown);
                let spawned = spawn_named(format!("wisn{node:03}-channels"), move || {
                    scheduler.run(tuner.as_mut(), &worker_shutdown)
                });
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        shutdown.trigger();
                        pipeline.close();
                        let _ = sender.join();
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        info!(node, "node runtime started");
        Ok(Self {
            pipeline,
            shutdown,
            sender: Some(sender),
            scheduler,
        })
    }

    pub fn pipeline(&self) -> &Arc<NodePipeline> {
        &self.pipeline
    }

    /// Stops both threads. Returns the number of readings the sender delivered.
    pub fn shutdown(mut self) -> u64 {
        self.stop()
    }

    fn stop(&mut self) -> u64 {
        self.shutdown.trigger();
        self.pipeline.close();

        let mut sent = 0;
        if let Some(handle) = self.sender.take() {
            match handle.join() {
                Ok(n) => sent = n,
                Err(_) => error!(node = self.pipeline.node(), "sender thread panicked"),
            }
        }
        if let Some(handle) = self.scheduler.take() {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(node = self.pipeline.node(), error = %e, "channel scheduler failed"),
                Err(_) => error!(node = self.pipeline.node(), "channel scheduler thread panicked"),
            }
        }
        sent
    }
}

impl Drop for NodeRuntime {
    fn drop(&mut self) {
        if self.sender.is_some() || self.scheduler.is_some() {
            self.stop();
        }
    }
}

/// A running server: one worker consuming the intake queue
pub struct ServerRuntime {
    pipeline: Arc<ServerPipeline>,
    shutdown: Arc<ShutdownSignal>,
    worker: Option<JoinHandle<u64>>,
}

impl ServerRuntime {
    pub fn start(pipeline: Arc<ServerPipeline>) -> Result<Self, WisnError> {
        let shutdown = Arc::new(ShutdownSignal::new());
        let worker = {
            let pipeline = Arc::clone(&pipeline);
            let worker_shutdown = Arc::clone(&shutdown);
            spawn_named("wisn-server".to_string(), move || pipeline.run(&worker_shutdown))?
        };
        info!("server runtime started");
        Ok(Self {
            pipeline,
            shutdown,
            worker: Some(worker),
        })
    }

    pub fn pipeline(&self) -> &Arc<ServerPipeline> {
        &self.pipeline
    }

    /// Lets the worker drain what is already queued, then stops it.
    /// Returns how many readings it processed.
    pub fn drain_and_stop(mut self) -> u64 {
        self.pipeline.close();
        self.join()
    }

    /// Stops the worker without starting any further solve
    pub fn shutdown(mut self) -> u64 {
        self.stop()
    }

    fn stop(&mut self) -> u64 {
        self.shutdown.trigger();
        self.pipeline.close();
        self.join()
    }

    fn join(&mut self) -> u64 {
        match self.worker.take().map(JoinHandle::join) {
            Some(Ok(n)) => n,
            Some(Err(_)) => {
                error!("server worker panicked");
                0
            }
            None => 0,
        }
    }
}

impl Drop for ServerRuntime {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{LoopbackTransport, MemoryPositionSink, ServerCollaborators, StaticAnchors, StaticCalibration};
    use crate::core::{AnchorNode, MacAddress, ManualClock};
    use crate::hardware::{MockTuner, SchedulerConfig};
    use crate::utils::WisnConfig;
    use crate::validation::ErrorReporter;
    use std::time::{Duration, Instant};

    #[test]
    fn test_node_to_server_end_to_end() {
        let clock = Arc::new(ManualClock::new(1_000));
        let reporter = Arc::new(ErrorReporter::new());
        let sink = Arc::new(MemoryPositionSink::new());
        let config = WisnConfig::default();

        let server = Arc::new(ServerPipeline::new(
            &config,
            ServerCollaborators {
                anchors: Arc::new(StaticAnchors::new(vec![AnchorNode::new(1, 20.0, 30.0)])),
                calibration: Arc::new(StaticCalibration::default()),
                sink: sink.clone(),
            },
            clock.clone(),
            Arc::clone(&reporter),
        ));
        let server_rt = ServerRuntime::start(Arc::clone(&server)).unwrap();

        let tuner = MockTuner::new("wlan0");
        let tuner_history = tuner.clone();
        let scheduler = ChannelScheduler::new(SchedulerConfig {
            discovery_dwell: Duration::from_millis(1),
            ..SchedulerConfig::default()
        });
        let node = Arc::new(
            NodePipeline::new(&config, clock.clone(), Arc::clone(&reporter)).with_counters(scheduler.counters()),
        );
        let transport = Arc::new(LoopbackTransport::new(Arc::clone(&server)));
        let tuner: Box<dyn ChannelTuner> = Box::new(tuner);
        let node_rt = NodeRuntime::start(Arc::clone(&node), transport, Some((scheduler, tuner))).unwrap();

        let device = MacAddress::new([0x02, 0, 0, 0, 0, 7]);
        node_rt.pipeline().capture(device, 45.0).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.latest(&device).is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(node_rt.shutdown(), 1);
        assert_eq!(server_rt.drain_and_stop(), 1);

        let report = sink.latest(&device).unwrap();
        assert_eq!((report.x, report.y), (20.0, 30.0));
        assert!(!tuner_history.history().is_empty());
        assert_eq!(reporter.summary().total(), 0);
    }

    #[test]
    fn test_server_shutdown_is_prompt_when_idle() {
        let server = Arc::new(ServerPipeline::new(
            &WisnConfig::default(),
            ServerCollaborators {
                anchors: Arc::new(StaticAnchors::default()),
                calibration: Arc::new(StaticCalibration::default()),
                sink: Arc::new(MemoryPositionSink::new()),
            },
            Arc::new(ManualClock::new(0)),
            Arc::new(ErrorReporter::new()),
        ));
        let runtime = ServerRuntime::start(server).unwrap();
        let started = Instant::now();
        assert_eq!(runtime.shutdown(), 0);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
