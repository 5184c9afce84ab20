//! wisn-sim: runs synthetic sniffing nodes and the server in one process.
//!
//! Run with: `cargo run --bin wisn-sim -- --steps 60 --noise 2.0`

use std::f64::consts::PI;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use wisn::api::{
    LoopbackTransport, MemoryPositionSink, NodePipeline, NodeRuntime, ServerCollaborators, ServerPipeline,
    ServerRuntime, StaticAnchors, StaticCalibration,
};
use wisn::core::{AnchorNode, Clock, MacAddress, ManualClock, Point2, SystemClock};
use wisn::hardware::{ChannelScheduler, ChannelTuner, MockTuner};
use wisn::utils::{init_logging, WisnConfig};
use wisn::validation::ErrorReporter;

/// Simulates a sniffer network tracking one moving device.
#[derive(Parser, Debug)]
#[command(name = "wisn-sim")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of nodes to place when the config lists no anchors.
    #[arg(short, long, default_value_t = 4)]
    nodes: u16,

    /// Side of the square area the nodes are placed around.
    #[arg(long, default_value_t = 100.0)]
    area: f64,

    /// Simulated seconds to run.
    #[arg(short, long, default_value_t = 30)]
    steps: u32,

    /// Uniform RSSI noise amplitude added to every capture.
    #[arg(long, default_value_t = 0.0)]
    noise: f64,

    /// Run a sweep over all devices every this many steps (0 disables).
    #[arg(long, default_value_t = 5)]
    sweep_every: u32,

    /// Discovery dwell per channel for the simulated radios, in milliseconds.
    #[arg(long, default_value_t = 5)]
    dwell_ms: u64,

    /// Seed for the noise generator.
    #[arg(long)]
    seed: Option<u64>,

    /// Log level when RUST_LOG is not set (overrides config).
    #[arg(short, long)]
    log_level: Option<String>,

    /// Write the effective configuration here and exit.
    #[arg(long)]
    save_config: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => WisnConfig::load_from_file(path)?,
        None => WisnConfig::default(),
    };
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    if config.anchors.is_empty() {
        config.anchors = ring_of_anchors(args.nodes, args.area);
    }
    config.scheduler.discovery_dwell_ms = args.dwell_ms;
    config.validate()?;

    if let Some(path) = &args.save_config {
        config.save_to_file(path)?;
        println!("Configuration written to {}", path.display());
        return Ok(());
    }

    init_logging(&config.log_level)?;
    info!(anchors = config.anchors.len(), steps = args.steps, "starting simulation");

    let clock = Arc::new(ManualClock::new(SystemClock.now()));
    let reporter = Arc::new(ErrorReporter::new());
    let sink = Arc::new(MemoryPositionSink::new());

    let server = Arc::new(ServerPipeline::new(
        &config,
        ServerCollaborators {
            anchors: Arc::new(StaticAnchors::new(config.anchors.clone())),
            calibration: Arc::new(StaticCalibration::new(config.calibration.clone())),
            sink: sink.clone(),
        },
        clock.clone(),
        Arc::clone(&reporter),
    ));
    let server_rt = ServerRuntime::start(Arc::clone(&server))?;
    let transport = Arc::new(LoopbackTransport::new(Arc::clone(&server)));

    let mut nodes = Vec::with_capacity(config.anchors.len());
    for anchor in &config.anchors {
        let mut node_config = config.clone();
        node_config.node.node_id = anchor.node;
        node_config.node.position = Some(anchor.position());
        node_config.node.interface = format!("sim{}", anchor.node);

        let scheduler = ChannelScheduler::new(node_config.scheduler_config());
        let pipeline = NodePipeline::new(&node_config, clock.clone(), Arc::clone(&reporter))
            .with_counters(scheduler.counters())
            .with_retry_delay(Duration::from_millis(50));
        let tuner: Box<dyn ChannelTuner> = Box::new(MockTuner::new(node_config.node.interface.clone()));
        let runtime = NodeRuntime::start(Arc::new(pipeline), transport.clone(), Some((scheduler, tuner)))?;
        nodes.push((*anchor, runtime));
    }

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let model = config.distance_model();
    let device = MacAddress::new([0x02, 0x00, 0x5E, 0x10, 0x00, 0x01]);
    let mut total_error = 0.0;
    let mut fixes = 0u32;

    for step in 0..args.steps {
        let truth = device_path(step, args.steps, args.area);
        let scale = server.scale();

        for (anchor, runtime) in &nodes {
            let range = truth.distance_to(&anchor.position());
            let rssi = match model.rssi_for_distance(range.max(0.1), scale) {
                Ok(rssi) => rssi,
                Err(e) => {
                    warn!(node = anchor.node, error = %e, "no rssi for range");
                    continue;
                }
            };
            let jitter = if args.noise > 0.0 {
                rng.random_range(-args.noise..=args.noise)
            } else {
                0.0
            };
            if let Err(e) = runtime.pipeline().capture(device, (rssi + jitter).max(1.0)) {
                warn!(node = anchor.node, error = %e, "capture rejected");
            }
        }

        // let the sender and server threads catch up before looking
        thread::sleep(Duration::from_millis(20));

        if args.sweep_every > 0 && step > 0 && step % args.sweep_every == 0 {
            let solved = server.sweep_all();
            info!(step, solved, "sweep");
        }

        if let Some(report) = sink.latest(&device) {
            let error = Point2::new(report.x, report.y).distance_to(&truth);
            total_error += error;
            fixes += 1;
            info!(
                step,
                true_x = format_args!("{:.1}", truth.x),
                true_y = format_args!("{:.1}", truth.y),
                est_x = format_args!("{:.1}", report.x),
                est_y = format_args!("{:.1}", report.y),
                method = ?report.method,
                error = format_args!("{:.2}", error),
                "position"
            );
        }

        clock.advance(1);
    }

    let mut sent = 0;
    for (_, runtime) in nodes {
        sent += runtime.shutdown();
    }
    let processed = server_rt.drain_and_stop();

    let summary = reporter.summary();
    info!(
        sent,
        processed,
        delivered = transport.delivered(),
        published = sink.published().len(),
        "simulation finished"
    );
    info!(
        transient = summary.transient,
        data = summary.data,
        numerical = summary.numerical,
        resource = summary.resource,
        shutdown = summary.shutdown,
        "error summary"
    );
    if fixes > 0 {
        println!(
            "{} fixes, mean error {:.2} over a {:.0}x{:.0} area",
            fixes,
            total_error / fixes as f64,
            args.area,
            args.area
        );
    } else {
        println!("No position fixes produced");
    }
    Ok(())
}

/// Places `count` anchors evenly on the circle inscribed in the area
fn ring_of_anchors(count: u16, area: f64) -> Vec<AnchorNode> {
    let half = area / 2.0;
    (0..count)
        .map(|i| {
            let angle = 2.0 * PI * i as f64 / count.max(1) as f64;
            AnchorNode::new(i + 1, half + half * angle.cos(), half + half * angle.sin())
        })
        .collect()
}

/// One lap of a smaller circle over the whole run
fn device_path(step: u32, steps: u32, area: f64) -> Point2 {
    let half = area / 2.0;
    let angle = 2.0 * PI * step as f64 / steps.max(1) as f64;
    Point2::new(half + half * 0.5 * angle.cos(), half + half * 0.5 * angle.sin())
}
