//! Collaborator interfaces at the edges of the pipelines

use crate::core::{AnchorNode, CalibrationPoint, Observation, PositionReport};
use crate::processing::WireError;
use thiserror::Error;

/// Failures reported by transport and persistence collaborators
#[derive(Debug, Error)]
pub enum TransportError {
    /// Broker, socket or database cannot be reached right now
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// The collaborator has been shut down
    #[error("transport closed")]
    Closed,

    /// The far side refused the message
    #[error("message rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Encode(#[from] WireError),
}

/// Result type for collaborator calls
pub type TransportResult<T> = Result<T, TransportError>;

/// Outbound delivery of averaged observations from a node
pub trait ObservationPublisher: Send + Sync {
    fn publish(&self, obs: &Observation) -> TransportResult<()>;
}

/// Persists and publishes computed positions
pub trait PositionSink: Send + Sync {
    fn store_position(&self, report: &PositionReport) -> TransportResult<()>;
}

/// Bulk source of anchor positions
pub trait AnchorSource: Send + Sync {
    fn load_anchors(&self) -> TransportResult<Vec<AnchorNode>>;
}

/// Bulk source of calibration points, in stored order
pub trait CalibrationSource: Send + Sync {
    fn load_calibration(&self) -> TransportResult<Vec<CalibrationPoint>>;
}
