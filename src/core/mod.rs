//! Core types and constants for the localisation pipeline

pub mod types;
pub mod constants;
pub mod clock;
pub mod shutdown;

pub use types::*;
pub use constants::*;
pub use clock::{Clock, ManualClock, SystemClock};
pub use shutdown::ShutdownSignal;
