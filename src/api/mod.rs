//! Node and server pipelines and the collaborator interfaces around them
//!
//! Transports and databases plug in through the traits in [`types`]; the
//! [`memory`] module provides in-process implementations.

pub mod context;
pub mod memory;
pub mod node;
pub mod server;
pub mod types;

pub use context::{NodeRuntime, ServerRuntime};
pub use memory::{LoopbackTransport, MemoryPositionSink, StaticAnchors, StaticCalibration};
pub use node::{CaptureOutcome, NodePipeline};
pub use server::{ServerCollaborators, ServerPipeline};
pub use types::{
    AnchorSource, CalibrationSource, ObservationPublisher, PositionSink, TransportError, TransportResult,
};
