use std::time::Duration;

use async_trait::async_trait;

const BASE_MS: u64 = 1_000;

/// `min(2^attempts seconds, cap)`; zero when nothing has failed yet.
pub fn exponential_backoff(attempts: u32, cap: Duration) -> Duration {
    if attempts == 0 {
        return Duration::ZERO;
    }
    let cap_ms = cap.as_millis().min(u64::MAX as u128) as u64;
    let multiplier = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
    Duration::from_millis(BASE_MS.saturating_mul(multiplier).min(cap_ms))
}

/// Where the retrieval loop sleeps between failed connection attempts.
#[async_trait]
pub trait SleepTimer: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleepTimer;

#[async_trait]
impl SleepTimer for TokioSleepTimer {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
#[path = "tests/backoff_tests.rs"]
mod tests;
