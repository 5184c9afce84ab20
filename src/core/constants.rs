//! Physical constants and system parameters

use std::time::Duration;

/// Number of 2.4 GHz channels a node cycles through
pub const NUM_CHANNELS: u8 = 14;

/// Maximum observations kept per device-at-node smoothing window
pub const AVG_NUM: usize = 32;

/// Maximum age of an observation in the smoothing window (seconds)
pub const AVG_TIMEOUT_SECS: u64 = 300;

/// Staleness bound for the JSON-fed multi-node server (seconds)
pub const FUSION_STALENESS_SECS: u64 = 300;

/// Power-law path-loss coefficient
pub const DISTANCE_COEFFICIENT: f64 = 0.0002;

/// Power-law path-loss exponent
pub const DISTANCE_EXPONENT: f64 = 2.9179;

/// Fixed dwell per channel during discovery
pub const DISCOVERY_DWELL: Duration = Duration::from_millis(21_500);

/// Seconds shared out between channels in one allocation phase
pub const ALLOCATION_BUDGET_SECS: u64 = 3600;

/// Deployed coordinate space, inclusive on both ends
pub const COORDINATE_MIN: f64 = 0.0;
pub const COORDINATE_MAX: f64 = 255.0;

/// Frequency of channel 14, the only channel off the 5 MHz grid (MHz)
pub const CHANNEL_14_FREQ_MHZ: u16 = 2484;
