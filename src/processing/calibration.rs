//! Calibration engine: derives the coordinate-units-per-meter scale factor

use crate::core::CalibrationPoint;
use crate::processing::queue::BoundedQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Scale used when no calibration pair is known
pub const DEFAULT_SCALE: f64 = 1.0;

/// Owns the calibration point list and the scale derived from it.
///
/// The list is replaced wholesale on refresh. The scale is published through
/// an atomic so readers always see either the old or the new factor.
#[derive(Debug)]
pub struct CalibrationEngine {
    points: BoundedQueue<CalibrationPoint>,
    scale_bits: AtomicU64,
}

impl Default for CalibrationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CalibrationEngine {
    pub fn new() -> Self {
        Self {
            points: BoundedQueue::new(),
            scale_bits: AtomicU64::new(DEFAULT_SCALE.to_bits()),
        }
    }

    /// Builds an engine already loaded with `points`
    pub fn with_points(points: Vec<CalibrationPoint>) -> Self {
        let engine = Self::new();
        engine.refresh(points);
        engine
    }

    /// Replaces the calibration list and recomputes the scale. Returns the new scale.
    pub fn refresh(&self, points: Vec<CalibrationPoint>) -> f64 {
        let mut list = self.points.lock();
        list.drain();
        for point in points {
            list.push_tail(point);
        }

        let snapshot: Vec<&CalibrationPoint> = list.iter().map(|(_, p)| p).collect();
        let scale = derive_scale(&snapshot);
        let previous = f64::from_bits(self.scale_bits.swap(scale.to_bits(), Ordering::AcqRel));
        drop(list);

        if previous != scale {
            info!(previous, scale, "calibration scale updated");
        } else {
            debug!(scale, "calibration refreshed, scale unchanged");
        }
        scale
    }

    /// Current points-per-meter factor
    pub fn scale(&self) -> f64 {
        f64::from_bits(self.scale_bits.load(Ordering::Acquire))
    }

    pub fn points(&self) -> Vec<CalibrationPoint> {
        self.points.to_vec()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// First matching pair in list order.
///
/// For each point, later points are scanned for a partner with the same
/// distance and the opposite role. The first hit wins even when a later pair
/// would fit better.
pub fn find_pair<'a>(points: &[&'a CalibrationPoint]) -> Option<(&'a CalibrationPoint, &'a CalibrationPoint)> {
    points.iter().enumerate().find_map(|(i, p)| {
        points[i + 1..]
            .iter()
            .find(|q| p.pairs_with(q))
            .map(|q| (*p, *q))
    })
}

/// Larger axis span of the first pair over its known distance, or 1.0
pub fn derive_scale(points: &[&CalibrationPoint]) -> f64 {
    let Some((p, q)) = find_pair(points) else {
        debug!(points = points.len(), "no calibration pair, using default scale");
        return DEFAULT_SCALE;
    };

    let span = (p.x - q.x).abs().max((p.y - q.y).abs());
    let scale = span / p.calibration_distance;
    if !scale.is_finite() || scale <= 0.0 {
        warn!(
            start = %p.name,
            end = %q.name,
            span,
            distance = p.calibration_distance,
            "degenerate calibration pair, using default scale"
        );
        return DEFAULT_SCALE;
    }
    scale
}
