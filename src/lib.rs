//! Wireless indoor sniffer network
//!
//! Sniffing nodes capture Wi-Fi frames, smooth the signal strength per
//! device and publish it; a central server fuses recent readings from every
//! node and multilaterates each device's position.

pub mod core;
pub mod algorithms;
pub mod processing;
pub mod validation;
pub mod utils;
pub mod hardware;
pub mod api;

// Re-export commonly used types
pub use core::{AnchorNode, CalibrationPoint, Clock, MacAddress, Observation, Point2, PositionReport, ShutdownSignal};
pub use algorithms::{DistanceModel, Multilateration, SolverConfig};
pub use processing::{BoundedQueue, CalibrationEngine, ObservationStore};
pub use validation::{ErrorReporter, WisnError};
pub use utils::{init_logging, WisnConfig};
pub use hardware::{ChannelScheduler, ChannelTuner, CommandTuner, MockTuner};
pub use api::{NodePipeline, NodeRuntime, ServerPipeline, ServerRuntime};
