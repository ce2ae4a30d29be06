//! Configuration for a validation run.

use crate::retry::RetryPolicy;
use std::time::Duration;

/// Order in which verdicts reach the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// As soon as each task finishes.
    Completion,
    /// In input order; finished verdicts wait for their predecessors.
    Input,
}

/// Configuration for the scheduler and its tasks.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Maximum number of tasks dialing or probing at once.
    pub concurrency: usize,
    /// Budget for dialing plus probing one link.
    pub task_timeout: Duration,
    /// Latency at or above which a working link is still rejected.
    pub max_latency: Duration,
    /// URL fetched through each tunnel to measure latency.
    pub probe_url: String,
    /// Readiness polling used by dialers that support it.
    pub readiness: RetryPolicy,
    /// Order of verdict delivery.
    pub delivery: Delivery,
    /// Budget for the whole run, after which remaining tasks are cancelled.
    pub run_timeout: Option<Duration>,
    /// Maximum number of new dials started per second.
    pub max_dials_per_second: Option<f64>,
}

impl ValidatorConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ValidatorConfigBuilder {
        ValidatorConfigBuilder::new()
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        ValidatorConfigBuilder::new().build()
    }
}

/// Builder for `ValidatorConfig`.
pub struct ValidatorConfigBuilder {
    concurrency: Option<usize>,
    task_timeout: Option<Duration>,
    max_latency: Option<Duration>,
    probe_url: Option<String>,
    readiness: Option<RetryPolicy>,
    delivery: Option<Delivery>,
    run_timeout: Option<Duration>,
    max_dials_per_second: Option<f64>,
}

impl ValidatorConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            concurrency: None,
            task_timeout: None,
            max_latency: None,
            probe_url: None,
            readiness: None,
            delivery: None,
            run_timeout: None,
            max_dials_per_second: None,
        }
    }

    /// Set the number of concurrent workers. Zero is treated as one.
    pub fn concurrency(mut self, workers: usize) -> Self {
        self.concurrency = Some(workers);
        self
    }

    /// Set the per-link budget.
    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    /// Set the latency threshold.
    pub fn max_latency(mut self, latency: Duration) -> Self {
        self.max_latency = Some(latency);
        self
    }

    /// Set the URL used as latency beacon.
    pub fn probe_url(mut self, url: impl Into<String>) -> Self {
        self.probe_url = Some(url.into());
        self
    }

    /// Set the readiness polling policy.
    pub fn readiness(mut self, policy: RetryPolicy) -> Self {
        self.readiness = Some(policy);
        self
    }

    /// Set the delivery order.
    pub fn delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = Some(delivery);
        self
    }

    /// Set an overall budget for the run.
    pub fn run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    /// Limit how many dials start per second.
    pub fn max_dials_per_second(mut self, rate: f64) -> Self {
        self.max_dials_per_second = Some(rate);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ValidatorConfig {
        ValidatorConfig {
            concurrency: self.concurrency.unwrap_or(5).max(1),
            task_timeout: self.task_timeout.unwrap_or(Duration::from_secs(10)),
            max_latency: self.max_latency.unwrap_or(Duration::from_secs(10)),
            probe_url: self.probe_url.unwrap_or_else(|| "http://www.bing.com".to_string()),
            readiness: self.readiness.unwrap_or_default(),
            delivery: self.delivery.unwrap_or(Delivery::Completion),
            run_timeout: self.run_timeout,
            max_dials_per_second: self.max_dials_per_second.filter(|rate| *rate > 0.0),
        }
    }
}

impl Default for ValidatorConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ValidatorConfig::default();
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.task_timeout, Duration::from_secs(10));
        assert_eq!(config.max_latency, Duration::from_secs(10));
        assert_eq!(config.readiness.interval, Duration::from_millis(500));
        assert_eq!(config.delivery, Delivery::Completion);
        assert!(config.run_timeout.is_none());
    }

    #[test]
    fn zero_workers_and_rate_are_sanitized() {
        let config = ValidatorConfig::builder()
            .concurrency(0)
            .max_dials_per_second(0.0)
            .build();
        assert_eq!(config.concurrency, 1);
        assert!(config.max_dials_per_second.is_none());
    }
}
