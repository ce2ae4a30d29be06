//! One validation attempt: dial, probe, judge, release.

use crate::dialer::{Dialer, TunnelHandle};
use crate::error::{DialError, FailureKind, TaskError};
use crate::link::ConnectionDescriptor;
use crate::probe::Probe;
use crate::verdict::VerdictRecord;

use futures::FutureExt;
use log::{debug, info, warn};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a [`ValidationTask`]. `Succeeded` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Dialing,
    Probing,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

/// Time budget and acceptance threshold for a task.
#[derive(Debug, Clone, Copy)]
pub struct TaskPolicy {
    /// Bound on dialing plus probing.
    pub timeout: Duration,
    /// Probe latency at or above this fails the link.
    pub max_latency: Duration,
}

/// Validates one descriptor. The tunnel it opens is owned by the task alone and is
/// closed exactly once, whichever way the task ends.
pub struct ValidationTask {
    link: String,
    descriptor: ConnectionDescriptor,
    dialer: Arc<dyn Dialer>,
    probe: Arc<dyn Probe>,
    policy: TaskPolicy,
    cancel: CancellationToken,
    state: TaskState,
}

impl ValidationTask {
    pub fn new(
        link: impl Into<String>,
        descriptor: ConnectionDescriptor,
        dialer: Arc<dyn Dialer>,
        probe: Arc<dyn Probe>,
        policy: TaskPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            link: link.into(),
            descriptor,
            dialer,
            probe,
            policy,
            cancel,
            state: TaskState::Created,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    fn transition(&mut self, next: TaskState) {
        debug!(
            "{} [{}]: {:?} -> {:?}",
            self.descriptor.kind(),
            self.descriptor.authority(),
            self.state,
            next
        );
        self.state = next;
    }

    /// Drive the task to a terminal state and produce its verdict.
    pub async fn run(&mut self) -> VerdictRecord {
        if self.state.is_terminal() {
            warn!("Task for {} already finished", self.link);
            let reason = TaskError::Internal("task already ran".into());
            return VerdictRecord::failed(self.link.clone(), reason);
        }
        if self.cancel.is_cancelled() {
            return self.finish(Err(TaskError::Cancelled.into()));
        }

        let cancel = self.cancel.clone();
        let timeout = self.policy.timeout;
        let started = Instant::now();
        let mut tunnel: Option<Box<dyn TunnelHandle>> = None;

        let outcome: Result<f64, FailureKind> = {
            let work = AssertUnwindSafe(self.drive(&mut tunnel, started)).catch_unwind();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TaskError::Cancelled.into()),
                res = tokio::time::timeout(timeout, work) => match res {
                    Err(_) => Err(TaskError::Timeout.into()),
                    Ok(Err(panic)) => Err(TaskError::Internal(panic_message(panic)).into()),
                    Ok(Ok(result)) => result,
                },
            }
        };

        if let Some(mut handle) = tunnel.take() {
            handle.close().await;
        }
        self.finish(outcome)
    }

    async fn drive(
        &mut self,
        tunnel: &mut Option<Box<dyn TunnelHandle>>,
        started: Instant,
    ) -> Result<f64, FailureKind> {
        self.transition(TaskState::Dialing);
        let budget = self.policy.timeout.saturating_sub(started.elapsed());
        let handle = tunnel.insert(self.dialer.dial(&self.descriptor, budget).await?);
        if !handle.ready().await {
            return Err(DialError::Refused("tunnel went down before probing".into()).into());
        }

        self.transition(TaskState::Probing);
        let budget = self.policy.timeout.saturating_sub(started.elapsed());
        let latency_ms = self.probe.probe(handle.local_addr(), budget).await?;

        let limit_ms = self.policy.max_latency.as_millis() as u64;
        if latency_ms >= limit_ms as f64 {
            return Err(FailureKind::LatencyExceeded { latency_ms, limit_ms });
        }
        Ok(latency_ms)
    }

    fn finish(&mut self, outcome: Result<f64, FailureKind>) -> VerdictRecord {
        match outcome {
            Ok(latency_ms) => {
                self.transition(TaskState::Succeeded);
                info!("OK {:.0}ms {}", latency_ms, self.link);
                VerdictRecord::succeeded(self.link.clone(), latency_ms)
            }
            Err(reason) => {
                self.transition(TaskState::Failed);
                warn!("FAIL {} ({})", self.link, reason);
                VerdictRecord::failed(self.link.clone(), reason)
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}
