//! Per-link verdicts and run summaries.

use crate::error::FailureKind;

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

/// Final outcome for one input link. Exactly one is produced per link.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerdictRecord {
    pub link: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(serialize_with = "serialize_reason", skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureKind>,
}

fn serialize_reason<S: Serializer>(
    reason: &Option<FailureKind>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match reason {
        Some(kind) => serializer.collect_str(&format_args!("{}: {}", kind.label(), kind)),
        None => serializer.serialize_none(),
    }
}

impl VerdictRecord {
    pub fn succeeded(link: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            link: link.into(),
            ok: true,
            latency_ms: Some(latency_ms),
            failure_reason: None,
        }
    }

    pub fn failed(link: impl Into<String>, reason: impl Into<FailureKind>) -> Self {
        Self {
            link: link.into(),
            ok: false,
            latency_ms: None,
            failure_reason: Some(reason.into()),
        }
    }
}

/// Aggregate view over the verdicts of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Failure count per [`FailureKind::label`].
    pub failures: BTreeMap<&'static str, usize>,
    /// Successful links, fastest first.
    pub fastest: Vec<(String, f64)>,
}

impl RunSummary {
    /// Summarize `records`, keeping at most `top` entries in `fastest`.
    pub fn from_records(records: &[VerdictRecord], top: usize) -> Self {
        let mut summary = RunSummary {
            total: records.len(),
            ..Default::default()
        };
        for record in records {
            match (&record.failure_reason, record.latency_ms) {
                (None, Some(latency)) if record.ok => {
                    summary.succeeded += 1;
                    summary.fastest.push((record.link.clone(), latency));
                }
                (reason, _) => {
                    summary.failed += 1;
                    let label = reason.as_ref().map(FailureKind::label).unwrap_or("unknown");
                    *summary.failures.entry(label).or_insert(0) += 1;
                }
            }
        }
        summary.fastest.sort_by(|a, b| a.1.total_cmp(&b.1));
        summary.fastest.truncate(top);
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ParseError, TaskError};

    #[test]
    fn summary_counts_and_ranks() {
        let records = vec![
            VerdictRecord::succeeded("a", 300.0),
            VerdictRecord::failed("b", ParseError::UnsupportedScheme("x".into())),
            VerdictRecord::succeeded("c", 120.0),
            VerdictRecord::failed("d", TaskError::Timeout),
            VerdictRecord::failed("e", TaskError::Timeout),
        ];
        let summary = RunSummary::from_records(&records, 1);
        assert_eq!(summary.total, 5);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.failures.get("timeout"), Some(&2));
        assert_eq!(summary.failures.get("unsupported_scheme"), Some(&1));
        assert_eq!(summary.fastest, vec![("c".to_string(), 120.0)]);
    }

    #[test]
    fn record_serializes_reason_as_text() {
        let record =
            VerdictRecord::failed("not-a-link", ParseError::UnsupportedScheme("not-a-link".into()));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["failure_reason"], "unsupported_scheme: unsupported scheme: not-a-link");
        assert!(json.get("latency_ms").is_none());
    }
}
