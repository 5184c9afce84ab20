//! Radio tuner error types and handling

use thiserror::Error;

/// Failures while retuning a capture interface
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TunerError {
    /// Channel outside the band the tuner supports
    #[error("channel {channel} is outside 1..={max}")]
    InvalidChannel { channel: u8, max: u8 },

    /// Tuning command could not be started
    #[error("failed to run '{command}': {reason}")]
    Spawn { command: String, reason: String },

    /// Tuning command ran but reported failure
    #[error("'{command}' exited with status {status:?}: {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    /// Interface has gone away
    #[error("interface {interface} is unavailable")]
    Unavailable { interface: String },
}

/// Result type for tuner operations
pub type TunerResult<T> = Result<T, TunerError>;

/// Error recovery strategy for tuner failures
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecoveryStrategy {
    /// Keep the schedule going and try again on the next dwell
    SkipDwell,
    /// Give up on channel switching for this run
    Fail,
}

impl TunerError {
    /// Get the recommended recovery strategy for this error
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            TunerError::InvalidChannel { .. } => RecoveryStrategy::Fail,
            TunerError::Spawn { .. } => RecoveryStrategy::SkipDwell,
            TunerError::CommandFailed { .. } => RecoveryStrategy::SkipDwell,
            TunerError::Unavailable { .. } => RecoveryStrategy::SkipDwell,
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.recovery_strategy(), RecoveryStrategy::Fail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_strategies() {
        assert!(!TunerError::InvalidChannel { channel: 15, max: 14 }.is_recoverable());
        assert!(TunerError::CommandFailed {
            command: "iwconfig wlan0 channel 3".into(),
            status: Some(255),
            stderr: String::new(),
        }
        .is_recoverable());
    }

    #[test]
    fn test_messages() {
        let err = TunerError::InvalidChannel { channel: 0, max: 14 };
        assert_eq!(err.to_string(), "channel 0 is outside 1..=14");
    }
}
