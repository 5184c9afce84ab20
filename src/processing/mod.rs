//! Observation buffering, fusion windows, calibration and record decoding

pub mod calibration;
pub mod queue;
pub mod store;
pub mod wire;

pub use calibration::CalibrationEngine;
pub use queue::{BoundedQueue, Handle, QueueGuard};
pub use store::{InsertReport, ObservationStore, WindowPolicy};
pub use wire::{Inbound, WireError};
