//! Crate-level error taxonomy and the diagnostic sink

use crate::algorithms::{DistanceError, SolveError};
use crate::api::TransportError;
use crate::hardware::TunerError;
use crate::processing::WireError;
use crate::utils::config::ConfigError;
use crate::validation::ObservationError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Every error the pipelines can surface
#[derive(Debug, Error)]
pub enum WisnError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("tuner error: {0}")]
    Tuner(#[from] TunerError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("rejected observation: {0}")]
    Observation(#[from] ObservationError),

    #[error("distance model error: {0}")]
    Distance(#[from] DistanceError),

    #[error("no solution: {0}")]
    Solve(#[from] SolveError),

    #[error("failed to start thread '{name}': {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("resource exhausted: {0}")]
    Resource(String),

    #[error("shutdown requested")]
    Shutdown,
}

/// Handling class of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Contention or delivery failure; retried or skipped
    Transient,
    /// One bad record; it is dropped and the store is untouched
    Data,
    /// Degenerate geometry or out-of-bounds result; no position this cycle
    Numerical,
    /// Out of memory, threads or similar; terminates the process
    Resource,
    /// Orderly stop
    Shutdown,
}

impl WisnError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WisnError::Tuner(e) if !e.is_recoverable() => ErrorKind::Data,
            WisnError::Transport(TransportError::Rejected(_) | TransportError::Encode(_)) => ErrorKind::Data,
            WisnError::Transport(TransportError::Closed) => ErrorKind::Shutdown,
            WisnError::Tuner(_) | WisnError::Transport(TransportError::Unavailable(_)) => ErrorKind::Transient,
            WisnError::Config(_)
            | WisnError::Wire(_)
            | WisnError::Observation(_)
            | WisnError::Distance(_) => ErrorKind::Data,
            WisnError::Solve(_) => ErrorKind::Numerical,
            WisnError::ThreadSpawn { .. } | WisnError::Resource(_) => ErrorKind::Resource,
            WisnError::Shutdown => ErrorKind::Shutdown,
        }
    }

    /// Only resource exhaustion and shutdown end the process
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Resource | ErrorKind::Shutdown)
    }
}

/// Per-kind error counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub transient: u64,
    pub data: u64,
    pub numerical: u64,
    pub resource: u64,
    pub shutdown: u64,
}

impl ErrorSummary {
    pub fn total(&self) -> u64 {
        self.transient + self.data + self.numerical + self.resource + self.shutdown
    }
}

/// Diagnostic sink shared by the pipelines.
///
/// Absorbs recoverable errors at component boundaries: logs them at a level
/// matching their kind and keeps running counts.
#[derive(Debug, Default)]
pub struct ErrorReporter {
    transient: AtomicU64,
    data: AtomicU64,
    numerical: AtomicU64,
    resource: AtomicU64,
    shutdown: AtomicU64,
}

impl ErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs `err` with `context` and counts it. Returns its kind.
    pub fn report(&self, context: &str, err: &WisnError) -> ErrorKind {
        let kind = err.kind();
        let counter = match kind {
            ErrorKind::Transient => {
                warn!(context, error = %err, "transient failure");
                &self.transient
            }
            ErrorKind::Data => {
                warn!(context, error = %err, "rejected input");
                &self.data
            }
            ErrorKind::Numerical => {
                debug!(context, error = %err, "no position this cycle");
                &self.numerical
            }
            ErrorKind::Resource => {
                error!(context, error = %err, "resource exhausted");
                &self.resource
            }
            ErrorKind::Shutdown => {
                debug!(context, "shutdown observed");
                &self.shutdown
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
        kind
    }

    pub fn summary(&self) -> ErrorSummary {
        ErrorSummary {
            transient: self.transient.load(Ordering::Relaxed),
            data: self.data.load(Ordering::Relaxed),
            numerical: self.numerical.load(Ordering::Relaxed),
            resource: self.resource.load(Ordering::Relaxed),
            shutdown: self.shutdown.load(Ordering::Relaxed),
        }
    }
}
