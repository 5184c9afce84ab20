//! Radio hardware abstraction for sniffing nodes
//!
//! Capture interfaces are retuned through the [`ChannelTuner`] trait, driven
//! by the [`ChannelScheduler`] on its own thread.

pub mod error;
pub mod mock;
pub mod scheduler;
pub mod tuner;

pub use error::{RecoveryStrategy, TunerError, TunerResult};
pub use mock::MockTuner;
pub use scheduler::{compute_time_slices, ChannelScheduler, PacketCounters, Phase, SchedulerConfig, Step};
pub use tuner::{frequency_to_channel, ChannelTuner, CommandTuner};
