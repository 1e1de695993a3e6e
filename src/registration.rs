//! Registration plane and watchdog (§4.I): a worker (or agent)
//! registers with its master (or worker) on startup, retrying with
//! backoff until the peer accepts it, then runs a heartbeat loop and
//! raises the shared [`SignalHandle`] if too many heartbeats are missed
//! in a row.
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::ServingError;
use crate::signal::SignalHandle;

/// Backoff schedule for the registration retry loop, grounded on the
/// teacher's TCP reconnect helper: a capped number of attempts, each
/// waiting longer than the last.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let millis = self.base_delay.as_millis() as u64 * 2u64.saturating_pow(attempt);
        Duration::from_millis(millis).min(self.max_delay)
    }
}

/// Repeatedly call `register` until it succeeds or the policy's attempt
/// budget is exhausted.
pub async fn register_with_retry<F, Fut>(
    policy: &RetryPolicy,
    mut register: F,
) -> Result<(), ServingError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), ServingError>>,
{
    for attempt in 0..=policy.max_retries {
        match register().await {
            Ok(()) => {
                info!(attempt, "registration succeeded");
                return Ok(());
            }
            Err(e) if attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(attempt, error = %e, delay_ms = delay.as_millis(), "registration attempt failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(ServingError::System(format!(
                    "registration failed after {} attempt(s): {e}",
                    attempt + 1
                )));
            }
        }
    }
    unreachable!()
}

/// Runs a heartbeat loop on an interval, calling `ping` each tick. Raises
/// `on_missed_limit` (expected to cancel the relevant [`SignalHandle`])
/// once `missed_limit` consecutive pings fail, and resets the miss
/// counter on any success.
pub async fn run_heartbeat<F, Fut>(
    interval: Duration,
    missed_limit: u32,
    signal: SignalHandle,
    mut ping: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), ServingError>>,
{
    let mut missed = 0u32;
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match ping().await {
                    Ok(()) => {
                        debug!("heartbeat ok");
                        missed = 0;
                    }
                    Err(e) => {
                        missed += 1;
                        warn!(missed, missed_limit, error = %e, "heartbeat missed");
                        if missed >= missed_limit {
                            warn!("heartbeat miss limit reached, raising shutdown signal");
                            signal.stop_worker();
                            return;
                        }
                    }
                }
            }
            _ = signal.worker_wait() => {
                return;
            }
        }
    }
}
