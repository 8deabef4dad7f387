//! Retry helpers shared by the etcd client and the recovery paths.

use std::time::Duration;

use anyhow::Result;
use tracing::warn;

/// Exponential backoff: starts at `initial`, doubles after every failed
/// attempt, never exceeds `cap`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub cap: Duration,
}

impl Backoff {
    /// The 1s → 8s ramp used for all control-plane RPC retries.
    pub fn standard() -> Self {
        Self {
            initial: Duration::from_secs(1),
            cap: Duration::from_secs(8),
        }
    }

    pub fn next(&self, current: Duration) -> Duration {
        std::cmp::min(current * 2, self.cap)
    }
}

/// Run `attempt` up to `attempts` times, sleeping with exponential backoff
/// between failures. The last error is returned once attempts are exhausted.
pub async fn retry_with_backoff<T, F, Fut>(
    attempts: u32,
    backoff: Backoff,
    description: &str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = backoff.initial;
    let mut last_err = None;
    for round in 1..=attempts {
        match attempt().await {
            Ok(val) => return Ok(val),
            Err(err) => {
                if round < attempts {
                    warn!(
                        attempt = round,
                        attempts,
                        delay_secs = delay.as_secs(),
                        error = %err,
                        "{} failed, backing off",
                        description,
                    );
                    tokio::time::sleep(delay).await;
                    delay = backoff.next(delay);
                }
                last_err = Some(err);
            }
        }
    }
    Err(last_err.expect("at least one attempt"))
}

/// Poll `attempt` until it succeeds or `timeout` elapses, backing off
/// exponentially between polls. Used where a wall-clock bound matters more
/// than an attempt count, e.g. waiting for a reseeded member to come up.
pub async fn poll_until_deadline<T, F, Fut>(
    timeout: Duration,
    backoff: Backoff,
    description: &str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut delay = backoff.initial;
    let mut last_err = None;
    loop {
        match attempt().await {
            Ok(val) => return Ok(val),
            Err(err) => {
                warn!(error = %err, "{} not ready yet", description);
                last_err = Some(err);
            }
        }
        if tokio::time::Instant::now() + delay > deadline {
            anyhow::bail!(
                "{} did not succeed within {:?}: {}",
                description,
                timeout,
                last_err
                    .map(|e| e.to_string())
                    .unwrap_or_default()
            );
        }
        tokio::time::sleep(delay).await;
        delay = backoff.next(delay);
    }
}
