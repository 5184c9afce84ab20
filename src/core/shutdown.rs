//! Cooperative shutdown shared by worker threads

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::warn;

/// One-shot flag that sleeping threads can wait on.
///
/// `wait_timeout` is the interruptible sleep used between channel dwells and
/// publish retries: it returns early as soon as `trigger` is called.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    triggered: Mutex<bool>,
    cond: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        *self.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.lock()
    }

    /// Sleeps for up to `timeout`. Returns `true` if shutdown was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut triggered = self.lock();
        while !*triggered {
            let remaining = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(remaining) if !remaining.is_zero() => remaining,
                    _ => return false,
                },
                None => Duration::from_secs(3600),
            };
            triggered = match self.cond.wait_timeout(triggered, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => {
                    warn!("shutdown mutex poisoned while waiting; recovering");
                    poisoned.into_inner().0
                }
            };
        }
        true
    }

    /// Blocks until shutdown is requested
    pub fn wait(&self) {
        let mut triggered = self.lock();
        while !*triggered {
            triggered = self.cond.wait(triggered).unwrap_or_else(|poisoned| {
                warn!("shutdown mutex poisoned while waiting; recovering");
                poisoned.into_inner()
            });
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.triggered.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            warn!("shutdown mutex poisoned; recovering");
            poisoned.into_inner()
        })
    }
}
