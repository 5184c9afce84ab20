//! Adaptive channel-dwell scheduling
//!
//! A node alternates between two phases:
//! - discovery, a fixed dwell on every channel in turn while capture counts
//!   packets per channel;
//! - allocation, a dwell on each busy channel proportional to its share of the
//!   packets counted during discovery.

use crate::core::{ShutdownSignal, ALLOCATION_BUDGET_SECS, DISCOVERY_DWELL, NUM_CHANNELS};
use crate::hardware::{ChannelTuner, TunerError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Per-channel packet counters shared between capture and the scheduler
#[derive(Debug)]
pub struct PacketCounters {
    counts: Vec<AtomicU32>,
    active: AtomicUsize,
    counting: AtomicBool,
}

impl PacketCounters {
    pub fn new(channels: u8) -> Self {
        Self {
            counts: (0..channels).map(|_| AtomicU32::new(0)).collect(),
            active: AtomicUsize::new(0),
            counting: AtomicBool::new(false),
        }
    }

    /// Called by capture for every frame heard on the current channel
    pub fn record_packet(&self) {
        if !self.counting.load(Ordering::Acquire) {
            return;
        }
        let index = self.active.load(Ordering::Acquire);
        if let Some(count) = self.counts.get(index) {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn set_active(&self, channel: u8) {
        self.active.store(usize::from(channel.saturating_sub(1)), Ordering::Release);
        self.counting.store(true, Ordering::Release);
    }

    fn stop_counting(&self) {
        self.counting.store(false, Ordering::Release);
    }

    pub fn is_counting(&self) -> bool {
        self.counting.load(Ordering::Acquire)
    }

    /// Current counts, index 0 is channel 1
    pub fn snapshot(&self) -> Vec<u32> {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }

    /// Reads and zeroes every counter
    pub fn take_all(&self) -> Vec<u32> {
        self.counts.iter().map(|c| c.swap(0, Ordering::AcqRel)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub discovery_dwell: Duration,
    pub allocation_budget_secs: u64,
    pub channel_count: u8,
    /// Fixed channel; disables both phases when set
    pub single_channel: Option<u8>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            discovery_dwell: DISCOVERY_DWELL,
            allocation_budget_secs: ALLOCATION_BUDGET_SECS,
            channel_count: NUM_CHANNELS,
            single_channel: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Discovery,
    Allocation,
}

/// What the radio should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Tune to `channel` and listen for `duration`
    Dwell {
        channel: u8,
        duration: Duration,
        phase: Phase,
    },
    /// Tune once and stay there
    Hold { channel: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Discovery { next: u8 },
    /// Discovery finished on the last channel; slices are due
    SlicesDue,
    Allocation { slices: Vec<u64>, next: u8 },
}

/// `floor(budget * count[c] / total)` per channel, all zero when nothing was heard
pub fn compute_time_slices(counts: &[u32], budget_secs: u64) -> Vec<u64> {
    let total: u64 = counts.iter().map(|&c| u64::from(c)).sum();
    if total == 0 {
        return vec![0; counts.len()];
    }
    counts
        .iter()
        .map(|&c| budget_secs * u64::from(c) / total)
        .collect()
}

/// Per-node channel state machine
#[derive(Debug)]
pub struct ChannelScheduler {
    config: SchedulerConfig,
    counters: Arc<PacketCounters>,
    state: State,
}

impl ChannelScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let counters = Arc::new(PacketCounters::new(config.channel_count));
        Self::with_counters(config, counters)
    }

    pub fn with_counters(config: SchedulerConfig, counters: Arc<PacketCounters>) -> Self {
        Self {
            config,
            counters,
            state: State::Discovery { next: 1 },
        }
    }

    /// Counters to hand to the capture side
    pub fn counters(&self) -> Arc<PacketCounters> {
        Arc::clone(&self.counters)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        match self.state {
            State::Discovery { .. } => Phase::Discovery,
            State::SlicesDue | State::Allocation { .. } => Phase::Allocation,
        }
    }

    /// Advances the state machine by one dwell
    pub fn next_step(&mut self) -> Step {
        if let Some(channel) = self.config.single_channel {
            self.counters.stop_counting();
            return Step::Hold { channel };
        }

        let last = self.config.channel_count;
        loop {
            match &mut self.state {
                State::Discovery { next } => {
                    let channel = *next;
                    self.state = if channel >= last {
                        State::SlicesDue
                    } else {
                        State::Discovery { next: channel + 1 }
                    };
                    self.counters.set_active(channel);
                    return Step::Dwell {
                        channel,
                        duration: self.config.discovery_dwell,
                        phase: Phase::Discovery,
                    };
                }
                State::SlicesDue => {
                    self.counters.stop_counting();
                    let counts = self.counters.take_all();
                    let slices = compute_time_slices(&counts, self.config.allocation_budget_secs);
                    let total: u64 = counts.iter().map(|&c| u64::from(c)).sum();
                    info!(total, ?counts, ?slices, "computed channel time slices");
                    if slices.iter().all(|&s| s == 0) {
                        warn!("no traffic during discovery, repeating discovery");
                        self.state = State::Discovery { next: 1 };
                    } else {
                        self.state = State::Allocation { slices, next: 1 };
                    }
                }
                State::Allocation { slices, next } => {
                    let start = usize::from(*next).saturating_sub(1);
                    let busy = slices
                        .iter()
                        .enumerate()
                        .skip(start)
                        .find(|&(_, &slice)| slice > 0)
                        .map(|(index, &slice)| (index, slice));
                    match busy {
                        Some((index, slice)) => {
                            let channel = u8::try_from(index + 1).unwrap_or(last);
                            *next = channel.saturating_add(1);
                            return Step::Dwell {
                                channel,
                                duration: Duration::from_secs(slice),
                                phase: Phase::Allocation,
                            };
                        }
                        None => {
                            debug!("allocation pass complete");
                            self.state = State::Discovery { next: 1 };
                        }
                    }
                }
            }
        }
    }

    /// Drives `tuner` until `shutdown` fires. Dwells are interruptible.
    ///
    /// Failed channel changes are logged and the dwell still runs, so the
    /// schedule keeps its timing. Only a non-recoverable tuner error stops it.
    pub fn run(&mut self, tuner: &mut dyn ChannelTuner, shutdown: &ShutdownSignal) -> Result<(), TunerError> {
        info!(interface = tuner.interface(), "channel scheduler started");
        while !shutdown.is_triggered() {
            match self.next_step() {
                Step::Hold { channel } => {
                    tuner.set_channel(channel)?;
                    info!(channel, "holding single channel");
                    shutdown.wait();
                }
                Step::Dwell { channel, duration, phase } => {
                    if let Err(e) = tuner.set_channel(channel) {
                        if !e.is_recoverable() {
                            error!(channel, error = %e, "channel scheduler stopping");
                            return Err(e);
                        }
                        warn!(channel, error = %e, "channel change failed");
                    }
                    debug!(channel, ?phase, secs = duration.as_secs_f64(), "dwelling");
                    if shutdown.wait_timeout(duration) {
                        break;
                    }
                }
            }
        }
        self.counters.stop_counting();
        info!("channel scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::MockTuner;
    use std::thread;
    use std::time::Instant;

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            discovery_dwell: Duration::from_millis(1),
            ..SchedulerConfig::default()
        }
    }

    fn discovery_pass(scheduler: &mut ChannelScheduler) -> Vec<u8> {
        (0..14)
            .map(|_| match scheduler.next_step() {
                Step::Dwell {
                    channel,
                    phase: Phase::Discovery,
                    duration,
                } => {
                    assert_eq!(duration, scheduler.config().discovery_dwell);
                    channel
                }
                other => panic!("expected discovery dwell, got {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_time_slices() {
        let mut counts = vec![0u32; 14];
        counts[0] = 10;
        counts[5] = 30;
        counts[10] = 60;
        let slices = compute_time_slices(&counts, 3600);
        assert_eq!(slices[0], 360);
        assert_eq!(slices[5], 1080);
        assert_eq!(slices[10], 2160);
        assert_eq!(slices.iter().filter(|&&s| s == 0).count(), 11);

        assert_eq!(compute_time_slices(&[1, 1, 1], 100), vec![33, 33, 33]);
        assert_eq!(compute_time_slices(&[0, 0], 3600), vec![0, 0]);
    }

    #[test]
    fn test_discovery_visits_every_channel_in_order() {
        let mut scheduler = ChannelScheduler::new(SchedulerConfig::default());
        assert_eq!(discovery_pass(&mut scheduler), (1..=14).collect::<Vec<u8>>());
    }

    #[test]
    fn test_allocation_skips_quiet_channels() {
        let mut scheduler = ChannelScheduler::new(SchedulerConfig::default());
        let counters = scheduler.counters();

        for _ in 0..14 {
            let Step::Dwell { channel, .. } = scheduler.next_step() else {
                panic!("expected dwell");
            };
            let packets = match channel {
                1 => 10,
                6 => 30,
                11 => 60,
                _ => 0,
            };
            for _ in 0..packets {
                counters.record_packet();
            }
        }

        let mut allocation = Vec::new();
        for _ in 0..3 {
            match scheduler.next_step() {
                Step::Dwell {
                    channel,
                    duration,
                    phase: Phase::Allocation,
                } => allocation.push((channel, duration.as_secs())),
                other => panic!("expected allocation dwell, got {other:?}"),
            }
        }
        assert_eq!(allocation, vec![(1, 360), (6, 1080), (11, 2160)]);
        assert_eq!(counters.snapshot(), vec![0; 14]);

        // Back to discovery after the last busy channel
        assert_eq!(discovery_pass(&mut scheduler), (1..=14).collect::<Vec<u8>>());
    }

    #[test]
    fn test_packets_not_counted_during_allocation() {
        let mut scheduler = ChannelScheduler::new(SchedulerConfig::default());
        let counters = scheduler.counters();
        for _ in 0..14 {
            scheduler.next_step();
            counters.record_packet();
        }
        let step = scheduler.next_step();
        assert!(matches!(step, Step::Dwell { phase: Phase::Allocation, .. }));
        assert!(!counters.is_counting());
        counters.record_packet();
        assert_eq!(counters.snapshot(), vec![0; 14]);
    }

    #[test]
    fn test_silent_discovery_repeats() {
        let mut scheduler = ChannelScheduler::new(SchedulerConfig::default());
        discovery_pass(&mut scheduler);
        assert_eq!(discovery_pass(&mut scheduler), (1..=14).collect::<Vec<u8>>());
    }

    #[test]
    fn test_single_channel_holds() {
        let mut scheduler = ChannelScheduler::new(SchedulerConfig {
            single_channel: Some(6),
            ..SchedulerConfig::default()
        });
        assert_eq!(scheduler.next_step(), Step::Hold { channel: 6 });
        assert_eq!(scheduler.next_step(), Step::Hold { channel: 6 });
    }

    #[test]
    fn test_run_tunes_and_stops_promptly() {
        let tuner = MockTuner::new("wlan0");
        let observer = tuner.clone();
        let shutdown = Arc::new(ShutdownSignal::new());

        let worker_shutdown = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            let mut tuner = tuner;
            let mut scheduler = ChannelScheduler::new(fast_config());
            scheduler.run(&mut tuner, &worker_shutdown)
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while observer.history().len() < 14 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        shutdown.trigger();
        assert!(handle.join().unwrap().is_ok());

        let history = observer.history();
        assert!(history.len() >= 14);
        assert_eq!(&history[..14], &(1..=14).collect::<Vec<u8>>()[..]);
    }

    #[test]
    fn test_long_dwell_is_interrupted() {
        let shutdown = Arc::new(ShutdownSignal::new());
        let worker_shutdown = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            let mut tuner = MockTuner::default();
            let mut scheduler = ChannelScheduler::new(SchedulerConfig::default());
            scheduler.run(&mut tuner, &worker_shutdown)
        });

        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        shutdown.trigger();
        assert!(handle.join().unwrap().is_ok());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_failed_change_keeps_schedule() {
        let tuner = MockTuner::new("wlan0");
        tuner.fail_channel(3);
        let observer = tuner.clone();
        let shutdown = Arc::new(ShutdownSignal::new());
        let worker_shutdown = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            let mut tuner = tuner;
            ChannelScheduler::new(fast_config()).run(&mut tuner, &worker_shutdown)
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while observer.history().len() < 13 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        shutdown.trigger();
        assert!(handle.join().unwrap().is_ok());
        assert!(!observer.history().contains(&3));
        assert!(observer.history().contains(&4));
    }
}
