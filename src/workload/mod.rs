//! Simulated business work.
//!
//! Handlers await a [`Workload`] between resolving the trace context and
//! recording the outcome. The default is a uniformly random delay; tests
//! inject fixed or failing workloads.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;

use crate::config::WorkloadConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("workload failed: {0}")]
pub struct WorkloadError(pub String);

/// Unit of work performed once per request.
#[async_trait]
pub trait Workload: Send + Sync {
    async fn run(&self) -> Result<(), WorkloadError>;
}

/// Sleeps for a uniformly random duration in `[min, max]`.
///
/// Sleeping is asynchronous, so concurrent requests overlap instead of
/// queueing behind each other.
#[derive(Debug, Clone)]
pub struct SimulatedWorkload {
    min: Duration,
    max: Duration,
}

impl SimulatedWorkload {
    /// `min` greater than `max` is clamped to a fixed `min` delay.
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
        }
    }

    pub fn from_config(config: &WorkloadConfig) -> Self {
        Self::new(
            Duration::from_millis(config.min_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Draw the next delay.
    pub fn next_delay(&self) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..=self.max)
    }
}

#[async_trait]
impl Workload for SimulatedWorkload {
    async fn run(&self) -> Result<(), WorkloadError> {
        let delay = self.next_delay();
        tracing::trace!(delay_ms = delay.as_millis() as u64, "Running simulated workload");
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

/// Fixed delay. Zero makes handlers return immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedWorkload(pub Duration);

#[async_trait]
impl Workload for FixedWorkload {
    async fn run(&self) -> Result<(), WorkloadError> {
        if !self.0.is_zero() {
            tokio::time::sleep(self.0).await;
        }
        Ok(())
    }
}

/// Always fails after an optional delay.
#[derive(Debug, Clone)]
pub struct FailingWorkload {
    pub delay: Duration,
    pub reason: String,
}

impl FailingWorkload {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Workload for FailingWorkload {
    async fn run(&self) -> Result<(), WorkloadError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Err(WorkloadError(self.reason.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_delay_stays_in_range() {
        let workload = SimulatedWorkload::new(Duration::from_millis(100), Duration::from_millis(2_000));
        for _ in 0..1_000 {
            let delay = workload.next_delay();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(2_000));
        }
    }

    #[test]
    fn test_inverted_bounds_collapse_to_min() {
        let workload = SimulatedWorkload::new(Duration::from_millis(50), Duration::from_millis(10));
        assert_eq!(workload.next_delay(), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_concurrent_runs_overlap() {
        let workload = SimulatedWorkload::new(Duration::from_millis(200), Duration::from_millis(200));
        let started = Instant::now();

        let runs: Vec<_> = (0..10)
            .map(|_| {
                let workload = workload.clone();
                tokio::spawn(async move { workload.run().await })
            })
            .collect();
        for run in runs {
            run.await.unwrap().unwrap();
        }

        assert!(started.elapsed() < Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_failing_workload() {
        let err = FailingWorkload::new("boom").run().await.unwrap_err();
        assert_eq!(err, WorkloadError("boom".to_string()));
    }
}
