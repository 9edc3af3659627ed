//! Append-only writes to a shared document under optimistic concurrency.
//!
//! An append reads the document and its version, concatenates the pending
//! lines onto the existing content and writes back guarded by that version.
//! A lost race re-reads and re-applies the same lines, up to a bounded
//! number of attempts with exponential backoff. Existing lines are never
//! dropped; only [`ResultSink::clear`] replaces content wholesale.

use opentelemetry::KeyValue;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::document::{DocumentStore, WritePrecondition, WriteResult};
use crate::error::{Error, Result};
use crate::model::ResultRecord;
use crate::telemetry::metrics;

/// Bounded retry schedule for conditional writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Result of a single attempt inside [`retry_bounded`].
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    /// Lost a race; worth another try after backing off.
    Conflict,
}

/// Run `op` until it returns [`Attempt::Done`] or the policy's attempt
/// budget runs out. `Ok(None)` means every attempt conflicted. Errors end
/// the loop immediately.
pub async fn retry_bounded<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<Option<T>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Attempt<T>>>,
{
    for attempt in 1..=policy.max_attempts.max(1) {
        if attempt > 1 {
            tokio::time::sleep(policy.delay_for(attempt - 1)).await;
        }
        match op(attempt).await? {
            Attempt::Done(value) => return Ok(Some(value)),
            Attempt::Conflict => continue,
        }
    }
    Ok(None)
}

/// Append `lines` to document `name`, one per line.
///
/// A missing document is created. Exhausting the retry budget is a
/// [`Error::Transport`]: the caller keeps the lines and tries again later.
pub async fn append_lines(
    store: &dyn DocumentStore,
    name: &str,
    lines: &[String],
    policy: &RetryPolicy,
) -> Result<()> {
    if lines.is_empty() {
        return Ok(());
    }

    let appended = retry_bounded(policy, |attempt| async move {
        let current = store.read(name).await?;
        let precondition = WritePrecondition::from_read(current.as_ref());

        let mut content = current.map(|doc| doc.content).unwrap_or_default();
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        for line in lines {
            content.push_str(line);
            content.push('\n');
        }

        match store.write(name, content, precondition).await? {
            WriteResult::Success { version } => {
                debug!(document = name, attempt, %version, "append committed");
                Ok::<_, Error>(Attempt::Done(()))
            }
            WriteResult::PreconditionFailed { .. } => {
                metrics::result_conflicts().add(1, &[KeyValue::new("document", name.to_string())]);
                debug!(document = name, attempt, "append lost a race, retrying");
                Ok(Attempt::Conflict)
            }
        }
    })
    .await?;

    match appended {
        Some(()) => Ok(()),
        None => {
            warn!(
                document = name,
                attempts = policy.max_attempts,
                lines = lines.len(),
                "append retry budget exhausted"
            );
            Err(Error::Transport(format!(
                "append to {name} conflicted {} times",
                policy.max_attempts
            )))
        }
    }
}

/// Writes result records to the results document.
#[derive(Clone)]
pub struct ResultSink {
    store: Arc<dyn DocumentStore>,
    document: String,
    policy: RetryPolicy,
}

impl ResultSink {
    pub fn new(store: Arc<dyn DocumentStore>, document: impl Into<String>) -> Self {
        Self {
            store,
            document: document.into(),
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    /// Append records in order, one JSON line each.
    pub async fn append(&self, records: &[ResultRecord]) -> Result<()> {
        let lines = records
            .iter()
            .map(ResultRecord::to_line)
            .collect::<Result<Vec<_>>>()?;
        append_lines(self.store.as_ref(), &self.document, &lines, &self.policy).await
    }

    /// Replace the results document with empty content.
    pub async fn clear(&self) -> Result<()> {
        self.store
            .write(&self.document, String::new(), WritePrecondition::None)
            .await?;
        info!(document = %self.document, "results document cleared");
        Ok(())
    }
}
