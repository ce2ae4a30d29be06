//! Bounded fan-out of validation tasks over a list of links.

use crate::config::{Delivery, ValidatorConfig};
use crate::dialer::Dialer;
use crate::error::{FailureKind, TaskError, ValidatorError};
use crate::link;
use crate::probe::Probe;
use crate::sink::ResultSink;
use crate::task::{TaskPolicy, ValidationTask};
use crate::verdict::VerdictRecord;

use futures::stream::{self, StreamExt};
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::{info, warn};
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type DialLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Runs validation tasks with at most `concurrency` in flight.
pub struct Scheduler {
    dialer: Arc<dyn Dialer>,
    probe: Arc<dyn Probe>,
    /// Configuration for the run.
    pub config: ValidatorConfig,
    cancel: CancellationToken,
    limiter: Option<Arc<DialLimiter>>,
}

impl Scheduler {
    pub fn new(config: ValidatorConfig, dialer: Arc<dyn Dialer>, probe: Arc<dyn Probe>) -> Self {
        let limiter = config
            .max_dials_per_second
            .and_then(dial_quota)
            .map(|quota| Arc::new(RateLimiter::direct(quota)));
        Self {
            dialer,
            probe,
            config,
            cancel: CancellationToken::new(),
            limiter,
        }
    }

    /// Token that cancels every run of this scheduler, current and future.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Validate every link, feeding verdicts to `sink` as they are delivered.
    ///
    /// Returns one record per input link, in delivery order. Only a sink failure
    /// aborts the run; in-flight tasks are cancelled and drained first.
    ///
    /// Dropping the returned future cancels every task it started.
    pub async fn run<S>(
        &self,
        links: &[String],
        sink: &S,
    ) -> Result<Vec<VerdictRecord>, ValidatorError>
    where
        S: ResultSink + ?Sized,
    {
        let run_token = self.cancel.child_token();
        let _cancel_on_drop = run_token.clone().drop_guard();
        let watchdog = self.config.run_timeout.map(|budget| {
            let token = run_token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(budget) => {
                        warn!("Run budget of {:?} exhausted, cancelling remaining tasks", budget);
                        token.cancel();
                    }
                }
            })
        });

        let mut delivery = Reorder::new(self.config.delivery);
        let mut records = Vec::with_capacity(links.len());
        let mut sink_error = None;

        let mut jobs = Vec::new();
        for (idx, raw) in links.iter().enumerate() {
            match link::parse(raw) {
                Ok(descriptor) => jobs.push((idx, raw.clone(), descriptor)),
                Err(e) => {
                    warn!("FAIL {} ({})", raw, e);
                    delivery.push(idx, VerdictRecord::failed(raw.clone(), e));
                }
            }
        }
        info!(
            "Validating {} links ({} unparseable) with {} workers",
            links.len(),
            links.len() - jobs.len(),
            self.config.concurrency
        );
        Self::flush(&mut delivery, sink, &mut records, &mut sink_error);

        let policy = TaskPolicy {
            timeout: self.config.task_timeout,
            max_latency: self.config.max_latency,
        };
        let mut finished = stream::iter(jobs)
            .map(|(idx, raw, descriptor)| {
                let mut task = ValidationTask::new(
                    raw.clone(),
                    descriptor,
                    Arc::clone(&self.dialer),
                    Arc::clone(&self.probe),
                    policy,
                    run_token.child_token(),
                );
                let limiter = self.limiter.clone();
                let token = run_token.clone();
                let handle = tokio::spawn(async move {
                    if let Some(limiter) = limiter {
                        tokio::select! {
                            _ = token.cancelled() => {}
                            _ = limiter.until_ready() => {}
                        }
                    }
                    task.run().await
                });
                async move {
                    let record = handle.await.unwrap_or_else(|e| {
                        let reason = TaskError::Internal(format!("worker died: {}", e));
                        VerdictRecord::failed(raw, reason)
                    });
                    (idx, record)
                }
            })
            .buffer_unordered(self.config.concurrency);

        while let Some((idx, record)) = finished.next().await {
            delivery.push(idx, record);
            Self::flush(&mut delivery, sink, &mut records, &mut sink_error);
            if sink_error.is_some() && !run_token.is_cancelled() {
                run_token.cancel();
            }
        }

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        if let Some(e) = sink_error {
            return Err(ValidatorError::Sink(e));
        }

        let ok = records.iter().filter(|r| r.ok).count();
        info!("Validation finished: {}/{} links usable", ok, records.len());
        Ok(records)
    }

    fn flush<S: ResultSink + ?Sized>(
        delivery: &mut Reorder,
        sink: &S,
        records: &mut Vec<VerdictRecord>,
        sink_error: &mut Option<std::io::Error>,
    ) {
        for record in delivery.drain_ready() {
            if sink_error.is_none() {
                if let Err(e) = sink.on_verdict(&record) {
                    warn!("Sink rejected verdict for {}: {}", record.link, e);
                    *sink_error = Some(e);
                }
            }
            records.push(record);
        }
    }
}

/// Quota admitting `rate` dials per second. Rates below one become one dial per period.
fn dial_quota(rate: f64) -> Option<Quota> {
    if !rate.is_finite() || rate <= 0.0 {
        return None;
    }
    if rate < 1.0 {
        return Quota::with_period(Duration::from_secs_f64(1.0 / rate));
    }
    NonZeroU32::new(rate.round() as u32).map(Quota::per_second)
}

/// Holds finished verdicts until they may be delivered.
struct Reorder {
    mode: Delivery,
    next: usize,
    pending: BTreeMap<usize, VerdictRecord>,
}

impl Reorder {
    fn new(mode: Delivery) -> Self {
        Self {
            mode,
            next: 0,
            pending: BTreeMap::new(),
        }
    }

    fn push(&mut self, idx: usize, record: VerdictRecord) {
        self.pending.insert(idx, record);
    }

    fn drain_ready(&mut self) -> Vec<VerdictRecord> {
        match self.mode {
            Delivery::Completion => std::mem::take(&mut self.pending).into_values().collect(),
            Delivery::Input => {
                let mut ready = Vec::new();
                while let Some(record) = self.pending.remove(&self.next) {
                    ready.push(record);
                    self.next += 1;
                }
                ready
            }
        }
    }
}

/// Whether a record was produced by cancellation rather than by a real trial.
pub fn was_cancelled(record: &VerdictRecord) -> bool {
    matches!(record.failure_reason, Some(FailureKind::Task(TaskError::Cancelled)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reorder_releases_in_input_order() {
        let mut reorder = Reorder::new(Delivery::Input);
        reorder.push(2, VerdictRecord::succeeded("c", 1.0));
        reorder.push(1, VerdictRecord::succeeded("b", 1.0));
        assert!(reorder.drain_ready().is_empty());

        reorder.push(0, VerdictRecord::succeeded("a", 1.0));
        let links: Vec<_> = reorder.drain_ready().into_iter().map(|r| r.link).collect();
        assert_eq!(links, vec!["a", "b", "c"]);
    }

    #[test]
    fn fractional_dial_rates_stretch_the_period() {
        let slow = dial_quota(0.5).unwrap();
        assert_eq!(slow.replenish_interval(), Duration::from_secs(2));
        assert_eq!(slow.burst_size().get(), 1);

        let fast = dial_quota(2.0).unwrap();
        assert_eq!(fast.replenish_interval(), Duration::from_millis(500));
        assert_eq!(fast.burst_size().get(), 2);

        assert!(dial_quota(0.0).is_none());
        assert!(dial_quota(f64::NAN).is_none());
    }

    #[test]
    fn completion_mode_passes_through() {
        let mut reorder = Reorder::new(Delivery::Completion);
        reorder.push(5, VerdictRecord::succeeded("f", 1.0));
        assert_eq!(reorder.drain_ready().len(), 1);
        assert!(reorder.drain_ready().is_empty());
    }
}
