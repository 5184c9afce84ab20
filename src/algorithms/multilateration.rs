//! Anchor-differenced linear least-squares multilateration
//!
//! Stateless: every call works only on the measurements passed in, so a
//! solver can be shared between threads freely.

use crate::core::{AnchorNode, Estimate, EstimateMethod, COORDINATE_MAX, COORDINATE_MIN};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// One anchor and the distance derived from its reading of the device
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeMeasurement {
    pub anchor: AnchorNode,
    pub distance: f64,
}

impl RangeMeasurement {
    pub fn new(anchor: AnchorNode, distance: f64) -> Self {
        Self { anchor, distance }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolveError {
    #[error("no anchors heard the device")]
    NoAnchors,

    #[error("anchor geometry is degenerate (rank {rank} < {required})")]
    RankDeficient { rank: usize, required: usize },

    #[error("solution ({x:.3}, {y:.3}) lies outside the coordinate space")]
    OutOfBounds { x: f64, y: f64 },

    #[error("solution is not a finite number")]
    NonFinite,
}

/// Acceptance bounds and numerical tolerance
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Smallest accepted x or y, inclusive
    pub min_coordinate: f64,
    /// Largest accepted x or y, inclusive
    pub max_coordinate: f64,
    /// Relative threshold on the R diagonal below which a column counts as dependent
    pub rank_tolerance: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            min_coordinate: COORDINATE_MIN,
            max_coordinate: COORDINATE_MAX,
            rank_tolerance: 1e-9,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Multilateration {
    pub config: SolverConfig,
}

impl Multilateration {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    /// Position estimate, or `None` when the inputs admit no acceptable one
    pub fn solve(&self, measurements: &[RangeMeasurement]) -> Option<Estimate> {
        match self.try_solve(measurements) {
            Ok(estimate) => Some(estimate),
            Err(err) => {
                debug!(anchors = measurements.len(), %err, "no position");
                None
            }
        }
    }

    /// Like [`solve`](Self::solve) but says why there is no position.
    ///
    /// - one anchor: that anchor's position
    /// - two anchors: the position of the nearer one, first wins a tie
    /// - three or more: least squares over the differenced range equations
    pub fn try_solve(&self, measurements: &[RangeMeasurement]) -> Result<Estimate, SolveError> {
        match measurements {
            [] => Err(SolveError::NoAnchors),
            [only] => Ok(Estimate {
                x: only.anchor.x,
                y: only.anchor.y,
                z: only.anchor.z,
                method: EstimateMethod::SingleAnchor,
                anchors_used: 1,
                residual: 0.0,
            }),
            [first, second] => {
                let nearer = if second.distance < first.distance { second } else { first };
                Ok(Estimate {
                    x: nearer.anchor.x,
                    y: nearer.anchor.y,
                    z: nearer.anchor.z,
                    method: EstimateMethod::NearestOfTwo,
                    anchors_used: 2,
                    residual: 0.0,
                })
            }
            _ => self.least_squares(measurements),
        }
    }

    fn least_squares(&self, measurements: &[RangeMeasurement]) -> Result<Estimate, SolveError> {
        let (a, b) = linearize(measurements);
        let (solution, residual) = solve_qr(&a, &b, self.config.rank_tolerance)?;

        let (x, y) = (solution[0], solution[1]);
        let z = (solution.len() > 2).then(|| solution[2]);
        if !x.is_finite() || !y.is_finite() {
            return Err(SolveError::NonFinite);
        }
        let bounds = self.config.min_coordinate..=self.config.max_coordinate;
        if !bounds.contains(&x) || !bounds.contains(&y) {
            return Err(SolveError::OutOfBounds { x, y });
        }

        Ok(Estimate {
            x,
            y,
            z,
            method: EstimateMethod::Multilateration,
            anchors_used: measurements.len(),
            residual,
        })
    }
}

/// Heights below this spread are treated as one mounting plane
const HEIGHT_SPREAD_TOLERANCE: f64 = 1e-6;

/// Whether a 3-D solve is possible: at least four anchors, every one with a
/// height, and the heights not all in one plane
fn uses_height(measurements: &[RangeMeasurement]) -> bool {
    if measurements.len() < 4 {
        return false;
    }
    let heights: Option<Vec<f64>> = measurements.iter().map(|m| m.anchor.z).collect();
    let Some(heights) = heights else {
        return false;
    };
    let (lo, hi) = heights
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &z| (lo.min(z), hi.max(z)));
    hi - lo > HEIGHT_SPREAD_TOLERANCE
}

/// Builds `A·p = b` by subtracting the reference anchor's range equation from
/// every other anchor's. Heights join in only when they can be solved for.
pub fn linearize(measurements: &[RangeMeasurement]) -> (DMatrix<f64>, DVector<f64>) {
    let reference = &measurements[0];
    let use_height = uses_height(measurements);
    let dims = if use_height { 3 } else { 2 };
    let rows = measurements.len().saturating_sub(1);

    let (xk, yk, zk) = (
        reference.anchor.x,
        reference.anchor.y,
        reference.anchor.z.unwrap_or(0.0),
    );
    let dk = reference.distance;

    let mut a = DMatrix::zeros(rows, dims);
    let mut b = DVector::zeros(rows);
    for (row, m) in measurements[1..].iter().enumerate() {
        let (xi, yi, zi) = (m.anchor.x, m.anchor.y, m.anchor.z.unwrap_or(0.0));
        let di = m.distance;

        a[(row, 0)] = 2.0 * (xk - xi);
        a[(row, 1)] = 2.0 * (yk - yi);
        b[row] = di.powi(2) - dk.powi(2) - xi.powi(2) - yi.powi(2) + xk.powi(2) + yk.powi(2);
        if use_height {
            a[(row, 2)] = 2.0 * (zk - zi);
            b[row] += zk.powi(2) - zi.powi(2);
        }
    }
    (a, b)
}

/// QR least squares with an explicit rank check on R's diagonal
fn solve_qr(a: &DMatrix<f64>, b: &DVector<f64>, tolerance: f64) -> Result<(DVector<f64>, f64), SolveError> {
    let required = a.ncols();
    if a.nrows() < required {
        return Err(SolveError::RankDeficient {
            rank: a.nrows(),
            required,
        });
    }

    let scale = a.amax();
    let qr = a.clone().qr();
    let r = qr.r();
    let rank = r.diagonal().iter().filter(|d| d.abs() > tolerance * scale).count();
    if scale == 0.0 || rank < required {
        return Err(SolveError::RankDeficient { rank, required });
    }

    let qt_b = qr.q().transpose() * b;
    let solution = r.solve_upper_triangular(&qt_b).ok_or(SolveError::RankDeficient {
        rank,
        required,
    })?;
    let residual = (a * &solution - b).norm();
    Ok((solution, residual))
}
