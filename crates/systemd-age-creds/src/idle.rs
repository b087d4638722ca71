//! Restartable idle countdown.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{sleep, Instant, Sleep};

/// Fires once `timeout` passes without a [`reset`](IdleTimer::reset).
///
/// A disabled timer never fires. Only the accept loop owns one, so resets and
/// expiry are never raced by other tasks.
#[derive(Debug)]
pub struct IdleTimer {
    timeout: Option<Duration>,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl IdleTimer {
    /// Arm the countdown now. `None` disables it.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            sleep: timeout.map(|t| Box::pin(sleep(t))),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.timeout.is_some()
    }

    /// Restart the full interval from now.
    pub fn reset(&mut self) {
        if let (Some(timeout), Some(sleep)) = (self.timeout, self.sleep.as_mut()) {
            sleep.as_mut().reset(Instant::now() + timeout);
        }
    }

    /// Resolve when the countdown elapses. Cancel safe.
    pub async fn expired(&mut self) {
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().await,
            None => std::future::pending().await,
        }
    }
}
