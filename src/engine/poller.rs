//! Queue poller: turns the queue document into an ordered list of jobs.

use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::document::{DocumentStore, DocumentVersion};
use crate::error::Result;
use crate::model::JobEnvelope;
use crate::telemetry::metrics;

/// A decoded job and the 1-based line it came from.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub line: usize,
    pub job: JobEnvelope,
}

/// Everything one poll produced.
#[derive(Debug, Default)]
pub struct PollBatch {
    /// Jobs in file order.
    pub jobs: Vec<QueuedJob>,
    /// Lines dropped because they did not decode to a job.
    pub unparsable: usize,
    /// Version of the queue document that was read, if it exists.
    pub version: Option<DocumentVersion>,
}

/// Split queue content into jobs.
///
/// Blank lines and lines whose first non-blank character is `#` are
/// ignored. Lines that do not decode are logged by number and length only.
pub fn parse_queue(content: &str) -> (Vec<QueuedJob>, usize) {
    let mut jobs = Vec::new();
    let mut unparsable = 0;

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match JobEnvelope::from_line(line) {
            Ok(job) => jobs.push(QueuedJob { line: idx + 1, job }),
            Err(e) => {
                unparsable += 1;
                warn!(line = idx + 1, length = line.len(), error = %e, "skipping unparsable queue line");
            }
        }
    }

    (jobs, unparsable)
}

/// Reads the queue document from the remote store.
pub struct QueuePoller {
    store: Arc<dyn DocumentStore>,
    document: String,
}

impl QueuePoller {
    pub fn new(store: Arc<dyn DocumentStore>, document: impl Into<String>) -> Self {
        Self {
            store,
            document: document.into(),
        }
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    /// Fetch and decode the queue. A missing document is an empty batch.
    pub async fn poll(&self) -> Result<PollBatch> {
        let Some(doc) = self.store.read(&self.document).await? else {
            warn!(document = %self.document, "queue document not found");
            return Ok(PollBatch::default());
        };

        let (jobs, unparsable) = parse_queue(&doc.content);
        if unparsable > 0 {
            metrics::lines_skipped()
                .add(unparsable as u64, &[KeyValue::new("reason", "unparsable")]);
        }
        debug!(
            document = %self.document,
            version = %doc.version,
            jobs = jobs.len(),
            unparsable,
            "polled queue"
        );

        Ok(PollBatch {
            jobs,
            unparsable,
            version: Some(doc.version),
        })
    }
}
