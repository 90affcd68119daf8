//! Backoff schedules
//!
//! Two shapes are used:
//! - [`RetryPolicy`]: per-attempt exponential backoff for dialing a peer.
//! - [`PollSchedule`]: a fixed list of waits with a hard total ceiling, used
//!   when polling for something another party has to do.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Exponential backoff: the delay doubles after every failed attempt and is
/// capped at `max_delay_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            initial_delay_ms,
            max_delay_ms,
        }
    }

    /// Single bounded attempt, used for reconnecting a dropped participant
    pub fn single(delay_ms: u64) -> Self {
        Self::new(1, delay_ms, delay_ms)
    }

    /// Delay applied after failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let delay = self
            .initial_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// The full sequence of delays for an all-failing run
    pub fn delays(&self) -> Vec<Duration> {
        (1..=self.max_retries).map(|a| self.delay_for(a)).collect()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 1000, 8000)
    }
}

/// Immediate check, then doubling waits, bounded by a total ceiling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSchedule {
    pub delays_ms: Vec<u64>,
    pub ceiling_ms: u64,
}

impl PollSchedule {
    pub fn new(delays_ms: Vec<u64>, ceiling_ms: u64) -> Self {
        Self {
            delays_ms,
            ceiling_ms,
        }
    }

    /// `[0, 1000, 2000, 4000, 8000]` ms, at most 15s in total
    pub fn confirmation() -> Self {
        Self::new(vec![0, 1000, 2000, 4000, 8000], 15_000)
    }

    /// Run `check` on the schedule until it yields `Some`.
    ///
    /// Returns `None` once the schedule or the ceiling is exhausted.
    pub async fn poll<F, Fut, T>(&self, mut check: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        let started = Instant::now();
        let ceiling = Duration::from_millis(self.ceiling_ms);

        for delay in &self.delays_ms {
            let delay = Duration::from_millis(*delay);
            let elapsed = started.elapsed();
            if elapsed + delay > ceiling {
                break;
            }
            if !delay.is_zero() {
                sleep(delay).await;
            }
            if let Some(value) = check().await {
                return Some(value);
            }
        }
        None
    }
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self::confirmation()
    }
}
