//! Per-job span helpers.
//!
//! Every queue line that reaches the security gate is processed inside a
//! `job.process` span. Only identifiers, line numbers and outcomes are
//! recorded; job content never is.

use opentelemetry::KeyValue;
use tracing::Span;

use crate::model::ResultStatus;

/// Start a span for one job.
///
/// The `job.status` field is declared empty and filled in by
/// [`record_outcome`].
pub fn start_job_span(job_id: &str, line: usize) -> Span {
    tracing::info_span!(
        "job.process",
        "job.id" = job_id,
        "job.line" = line,
        "job.status" = tracing::field::Empty,
    )
}

/// Record the job's outcome on its span and bump the outcome counter.
pub fn record_outcome(span: &Span, status: ResultStatus) {
    span.record("job.status", tracing::field::display(status));
    span.in_scope(|| {
        tracing::info!(status = %status, "job_outcome");
    });
    super::metrics::jobs_processed().add(1, &[KeyValue::new("status", status.to_string())]);
}
