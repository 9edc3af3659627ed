//! Metric instrument factories for notes-queue.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"notes-queue"` meter. With
//! no OTLP endpoint configured the global provider is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("notes-queue")
}

/// Counter: jobs that reached an outcome.
/// Labels: `status` ("created" | "denied" | "error" | "skipped_duplicate").
pub fn jobs_processed() -> Counter<u64> {
    meter()
        .u64_counter("notes_queue.jobs.processed")
        .with_description("Number of jobs that produced a result record")
        .build()
}

/// Counter: queue lines skipped without a result.
/// Labels: `reason` ("unparsable" | "accounted").
pub fn lines_skipped() -> Counter<u64> {
    meter()
        .u64_counter("notes_queue.lines.skipped")
        .with_description("Queue lines skipped without a result record")
        .build()
}

/// Counter: conditional appends that lost a race and were retried.
/// Labels: `document`.
pub fn result_conflicts() -> Counter<u64> {
    meter()
        .u64_counter("notes_queue.results.conflicts")
        .with_description("Conditional appends rejected by a version mismatch")
        .build()
}

/// Counter: poll cycles that failed.
/// Labels: `stage` ("fetch" | "storage" | "append").
pub fn poll_errors() -> Counter<u64> {
    meter()
        .u64_counter("notes_queue.poll.errors")
        .with_description("Poll cycles that ended in an error")
        .build()
}

/// Histogram: poll cycle duration in milliseconds.
pub fn cycle_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("notes_queue.cycle.duration_ms")
        .with_description("Poll cycle duration in milliseconds")
        .with_unit("ms")
        .build()
}
