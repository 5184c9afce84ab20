//! Range estimation and position solving

pub mod distance;
pub mod multilateration;

pub use distance::{DistanceError, DistanceModel};
pub use multilateration::{Multilateration, RangeMeasurement, SolveError, SolverConfig};
