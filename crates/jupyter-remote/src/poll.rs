//! Background polling with backoff on failure.

use std::future::Future;
use std::time::Duration;

use log::{debug, error, warn};
use tokio::task::JoinHandle;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay between successful ticks.
    pub interval: Duration,
    /// Ceiling for the delay after consecutive failures.
    pub max_interval: Duration,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_interval: Duration) -> Self {
        Self {
            interval,
            max_interval: max_interval.max(interval),
        }
    }

    fn backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_interval)
    }
}

/// Run `tick` every `policy.interval` until it fails fatally or the task is
/// aborted. Each failure doubles the delay up to `policy.max_interval`; a
/// success resets it.
pub fn spawn_poll<F, Fut>(name: &'static str, policy: PollPolicy, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut delay = policy.interval;
        loop {
            tokio::time::sleep(delay).await;
            match tick().await {
                Ok(()) => {
                    debug!("[{}] Poll ok", name);
                    delay = policy.interval;
                }
                Err(e) if e.is_fatal() => {
                    error!("[{}] Stopping poller: {}", name, e);
                    break;
                }
                Err(e) => {
                    delay = policy.backoff(delay);
                    warn!("[{}] Poll failed, next attempt in {:?}: {}", name, delay, e);
                }
            }
        }
    })
}
