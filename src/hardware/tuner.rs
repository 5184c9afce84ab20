//! Channel tuner interface and the command-line implementation

use crate::core::{CHANNEL_14_FREQ_MHZ, NUM_CHANNELS};
use crate::hardware::{TunerError, TunerResult};
use std::process::Command;
use tracing::{debug, info};

/// Hardware abstraction for a capture interface that can be retuned
pub trait ChannelTuner: Send {
    /// Tune to `channel` (1-based)
    fn set_channel(&mut self, channel: u8) -> TunerResult<()>;

    /// Last channel successfully tuned to, if any
    fn current_channel(&self) -> Option<u8>;

    /// Name of the underlying interface
    fn interface(&self) -> &str;
}

/// Retunes a wireless interface with `iwconfig <iface> channel <n>`
#[derive(Debug, Clone)]
pub struct CommandTuner {
    interface: String,
    program: String,
    max_channel: u8,
    current: Option<u8>,
}

impl CommandTuner {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            program: "iwconfig".to_string(),
            max_channel: NUM_CHANNELS,
            current: None,
        }
    }

    /// Use a different binary with the same argument layout
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Full command line for tuning to `channel`
    pub fn command_line(&self, channel: u8) -> String {
        format!("{} {} channel {}", self.program, self.interface, channel)
    }
}

impl ChannelTuner for CommandTuner {
    fn set_channel(&mut self, channel: u8) -> TunerResult<()> {
        if channel == 0 || channel > self.max_channel {
            return Err(TunerError::InvalidChannel {
                channel,
                max: self.max_channel,
            });
        }

        let command = self.command_line(channel);
        debug!(%command, "changing channel");
        let output = Command::new(&self.program)
            .arg(&self.interface)
            .arg("channel")
            .arg(channel.to_string())
            .output()
            .map_err(|e| TunerError::Spawn {
                command: command.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(TunerError::CommandFailed {
                command,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!(interface = %self.interface, channel, "channel changed");
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

/// 2.4 GHz channel for a centre frequency in MHz
pub fn frequency_to_channel(freq_mhz: u16) -> Option<u8> {
    match freq_mhz {
        CHANNEL_14_FREQ_MHZ => Some(14),
        f if (2412..CHANNEL_14_FREQ_MHZ).contains(&f) => u8::try_from((f - 2407) / 5).ok(),
        _ => None,
    }
}
