//! Error types for the proxy-link-validator crate.
//!
//! Everything below [`ValidatorError`] is a per-link failure: it ends up inside a
//! [`VerdictRecord`](crate::verdict::VerdictRecord) and never aborts a run.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A link could not be turned into a connection descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The link does not start with `vmess://`, `vless://` or `trojan://`.
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
    /// The scheme is known but the payload is broken or incomplete.
    #[error("malformed link: {0}")]
    Malformed(String),
}

/// The dialer could not bring a tunnel up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DialError {
    /// The tunnel did not become ready in time.
    #[error("tunnel not ready in time")]
    Timeout,
    /// A local resource (port, temp file, process) could not be acquired.
    #[error("local resource unavailable: {0}")]
    ResourceUnavailable(String),
    /// The remote side or the engine rejected the connection.
    #[error("connection refused: {0}")]
    Refused(String),
}

/// The probe request through the tunnel failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("probe target unreachable: {0}")]
    Unreachable(String),
    #[error("probe timed out")]
    Timeout,
}

/// Failures owned by the task itself rather than by its collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The overall task budget ran out.
    #[error("task deadline exceeded")]
    Timeout,
    /// The run was cancelled before the task finished.
    #[error("task cancelled")]
    Cancelled,
    /// The task panicked or its worker died.
    #[error("internal failure: {0}")]
    Internal(String),
}

/// The named reason a link failed validation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FailureKind {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Task(#[from] TaskError),
    /// The probe worked but the tunnel is too slow to be useful.
    #[error("latency {latency_ms:.0}ms exceeds limit of {limit_ms}ms")]
    LatencyExceeded { latency_ms: f64, limit_ms: u64 },
}

impl FailureKind {
    /// Short stable label, used for summaries and reports.
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::Parse(ParseError::UnsupportedScheme(_)) => "unsupported_scheme",
            FailureKind::Parse(ParseError::Malformed(_)) => "malformed",
            FailureKind::Dial(DialError::Timeout) => "dial_timeout",
            FailureKind::Dial(DialError::ResourceUnavailable(_)) => "resource_unavailable",
            FailureKind::Dial(DialError::Refused(_)) => "refused",
            FailureKind::Probe(ProbeError::Unreachable(_)) => "unreachable",
            FailureKind::Probe(ProbeError::Timeout) => "probe_timeout",
            FailureKind::Task(TaskError::Timeout) => "timeout",
            FailureKind::Task(TaskError::Cancelled) => "cancelled",
            FailureKind::Task(TaskError::Internal(_)) => "internal",
            FailureKind::LatencyExceeded { .. } => "latency_exceeded",
        }
    }
}

/// Infrastructure failures. These abort the whole run.
#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("cannot read input file {}: {source}", path.display())]
    Input { path: PathBuf, source: io::Error },
    #[error("cannot open output file {}: {source}", path.display())]
    Output { path: PathBuf, source: io::Error },
    #[error("failed to record verdict: {0}")]
    Sink(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kind_wraps_component_errors() {
        let kind: FailureKind = ParseError::UnsupportedScheme("ss".into()).into();
        assert_eq!(kind.label(), "unsupported_scheme");
        assert_eq!(kind.to_string(), "unsupported scheme: ss");

        let kind: FailureKind = DialError::Timeout.into();
        assert_eq!(kind.label(), "dial_timeout");
    }

    #[test]
    fn latency_message_is_rounded() {
        let kind = FailureKind::LatencyExceeded { latency_ms: 12001.7, limit_ms: 10000 };
        assert_eq!(kind.to_string(), "latency 12002ms exceeds limit of 10000ms");
    }
}
