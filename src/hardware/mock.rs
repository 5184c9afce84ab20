//! Mock tuner implementation for testing and simulation

use crate::core::NUM_CHANNELS;
use crate::hardware::{ChannelTuner, TunerError, TunerResult};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Records every channel change instead of touching hardware.
///
/// The history is shared, so a clone kept by a test still sees the changes
/// made after the tuner itself was moved into a scheduler thread.
#[derive(Debug, Clone)]
pub struct MockTuner {
    interface: String,
    history: Arc<Mutex<Vec<u8>>>,
    fail_on: Arc<Mutex<Vec<u8>>>,
    current: Option<u8>,
}

impl Default for MockTuner {
    fn default() -> Self {
        Self::new("mock0")
    }
}

impl MockTuner {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            history: Arc::new(Mutex::new(Vec::new())),
            fail_on: Arc::new(Mutex::new(Vec::new())),
            current: None,
        }
    }

    /// Make every attempt to tune to `channel` fail
    pub fn fail_channel(&self, channel: u8) {
        lock(&self.fail_on).push(channel);
    }

    /// Channels successfully tuned to, in order
    pub fn history(&self) -> Vec<u8> {
        lock(&self.history).clone()
    }

    pub fn clear_history(&self) {
        lock(&self.history).clear();
    }
}

impl ChannelTuner for MockTuner {
    fn set_channel(&mut self, channel: u8) -> TunerResult<()> {
        if channel == 0 || channel > NUM_CHANNELS {
            return Err(TunerError::InvalidChannel {
                channel,
                max: NUM_CHANNELS,
            });
        }
        if lock(&self.fail_on).contains(&channel) {
            return Err(TunerError::CommandFailed {
                command: format!("mock {} channel {}", self.interface, channel),
                status: Some(1),
                stderr: "simulated failure".to_string(),
            });
        }
        debug!(interface = %self.interface, channel, "mock channel change");
        lock(&self.history).push(channel);
        self.current = Some(channel);
        Ok(())
    }

    fn current_channel(&self) -> Option<u8> {
        self.current
    }

    fn interface(&self) -> &str {
        &self.interface
    }
}

fn lock(m: &Mutex<Vec<u8>>) -> MutexGuard<'_, Vec<u8>> {
    m.lock().unwrap_or_else(|poisoned| {
        warn!("mock tuner mutex poisoned; recovering");
        poisoned.into_inner()
    })
}
