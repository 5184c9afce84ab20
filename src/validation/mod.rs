//! Input validation and the error taxonomy

pub mod data;
pub mod error;

pub use data::{rssi_from_dbm, ObservationError, ObservationValidator, ValidationConfig};
pub use error::{ErrorKind, ErrorReporter, ErrorSummary, WisnError};
