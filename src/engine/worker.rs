//! Worker: one poll cycle at a time, until shut down.
//!
//! A cycle reads the queue, walks its jobs in file order through the
//! security gate and the executor, commits each outcome to the idempotency
//! store and finally appends the cycle's results in one conditional write.
//!
//! The queue document is never modified, so every cycle sees lines it has
//! already answered. Those are recognised by occurrence count: the k-th
//! line carrying a job id is already accounted for when the store says at
//! least k lines with that id were answered before. Such lines are skipped
//! silently, which is what keeps `skipped_duplicate` from repeating forever.
//!
//! Ordering per job is execute, commit locally, append remotely. A crash
//! after execution but before commit re-executes the job on restart if its
//! line is still in the queue and still fresh.

use opentelemetry::KeyValue;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, warn};

use super::clock::Clock;
use super::poller::{QueuePoller, QueuedJob};
use crate::document::DocumentStore;
use crate::error::Result;
use crate::executor::Executor;
use crate::gate::{GateDecision, SecurityGate};
use crate::model::{ResultRecord, ResultStatus};
use crate::sink::{ResultSink, RetryPolicy};
use crate::storage::IdempotencyStore;
use crate::telemetry::job::{record_outcome, start_job_span};
use crate::telemetry::metrics;

/// Settings for the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub queue_document: String,
    pub results_document: String,
    pub append_policy: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(crate::config::DEFAULT_POLL_SECONDS),
            queue_document: crate::config::DEFAULT_QUEUE_DOCUMENT.to_string(),
            results_document: crate::config::DEFAULT_RESULTS_DOCUMENT.to_string(),
            append_policy: RetryPolicy::default(),
        }
    }
}

/// Stops a running [`Worker::run`] between cycles.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<Notify>);

impl ShutdownHandle {
    /// Ask the loop to stop. Takes effect before the next cycle starts; a
    /// call made before the loop is waiting is remembered.
    pub fn shutdown(&self) {
        self.0.notify_one();
    }
}

/// What one cycle did.
#[derive(Debug, Default, Clone)]
pub struct CycleReport {
    /// Jobs decoded from the queue.
    pub jobs_read: usize,
    /// Lines that did not decode.
    pub unparsable: usize,
    /// Lines skipped because an earlier cycle already answered them.
    pub already_accounted: usize,
    /// Results produced this cycle, in queue order.
    pub results: Vec<ResultRecord>,
    /// Result lines written to the results document, including older ones.
    pub appended: usize,
    /// Result lines still waiting in the outbox.
    pub pending: usize,
    /// The queue holds more distinct job ids than the idempotency store
    /// keeps, so pruned ids will be evaluated again.
    pub over_capacity: bool,
}

impl CycleReport {
    pub fn count(&self, status: ResultStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

/// The worker context: every collaborator a cycle needs, owned in one place.
pub struct Worker {
    poller: QueuePoller,
    sink: ResultSink,
    gate: SecurityGate,
    store: IdempotencyStore,
    executor: Arc<dyn Executor>,
    clock: Arc<dyn Clock>,
    /// Results not yet appended, oldest first.
    outbox: Vec<ResultRecord>,
    poll_interval: Duration,
    shutdown: Arc<Notify>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        documents: Arc<dyn DocumentStore>,
        gate: SecurityGate,
        store: IdempotencyStore,
        executor: Arc<dyn Executor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            poller: QueuePoller::new(Arc::clone(&documents), config.queue_document),
            sink: ResultSink::new(documents, config.results_document)
                .with_policy(config.append_policy),
            gate,
            store,
            executor,
            clock,
            outbox: Vec::new(),
            poll_interval: config.poll_interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown))
    }

    pub fn store(&self) -> &IdempotencyStore {
        &self.store
    }

    /// Results waiting for a successful append.
    pub fn outbox(&self) -> &[ResultRecord] {
        &self.outbox
    }

    /// Run cycles every poll interval until [`ShutdownHandle::shutdown`].
    ///
    /// Cycle failures are logged and retried on the next tick; they never
    /// end the loop.
    pub async fn run(&mut self) -> Result<()> {
        let shutdown = Arc::clone(&self.shutdown);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            queue = self.poller.document(),
            results = self.sink.document(),
            poll_interval_s = self.poll_interval.as_secs(),
            "worker started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => {
                    info!(pending = self.outbox.len(), "worker shutting down");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            match self.run_cycle().await {
                Ok(report) if report.results.is_empty() && report.pending == 0 => {
                    debug!(jobs = report.jobs_read, "cycle idle");
                }
                Ok(report) => {
                    info!(
                        jobs = report.jobs_read,
                        results = report.results.len(),
                        appended = report.appended,
                        pending = report.pending,
                        "cycle complete"
                    );
                }
                Err(e) => {
                    error!(error = %e, transient = e.is_transient(), "poll cycle failed");
                }
            }
        }
    }

    /// One poll cycle.
    ///
    /// A fetch failure returns `Err` with nothing processed. A storage
    /// failure stops the cycle at that job; results produced before it are
    /// still appended, and the error is returned afterwards. An append
    /// failure is not an error: the lines stay in the outbox.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let started = Instant::now();
        let result = self.cycle().await;
        metrics::cycle_duration_ms().record(started.elapsed().as_secs_f64() * 1000.0, &[]);
        result
    }

    async fn cycle(&mut self) -> Result<CycleReport> {
        let batch = match self.poller.poll().await {
            Ok(batch) => batch,
            Err(e) => {
                metrics::poll_errors().add(1, &[KeyValue::new("stage", "fetch")]);
                warn!(error = %e, "queue fetch failed");
                return Err(e);
            }
        };

        let distinct = batch
            .jobs
            .iter()
            .map(|q| q.job.job_id.as_str())
            .collect::<HashSet<_>>()
            .len();
        let over_capacity = distinct > self.store.capacity();
        if over_capacity {
            warn!(
                distinct_jobs = distinct,
                capacity = self.store.capacity(),
                "queue holds more job ids than the idempotency store keeps; pruned ids will be re-evaluated"
            );
        }

        let mut report = CycleReport {
            jobs_read: batch.jobs.len(),
            unparsable: batch.unparsable,
            over_capacity,
            ..CycleReport::default()
        };

        // Lines with the same job id seen so far this cycle.
        let mut seen: HashMap<String, u32> = HashMap::new();
        let mut failure = None;

        for queued in &batch.jobs {
            let nth = seen.entry(queued.job.job_id.clone()).or_insert(0);
            *nth += 1;
            let nth = *nth;

            match self.process_line(queued, nth).await {
                Ok(Some(record)) => report.results.push(record),
                Ok(None) => report.already_accounted += 1,
                Err(e) => {
                    metrics::poll_errors().add(1, &[KeyValue::new("stage", "storage")]);
                    error!(line = queued.line, job_id = %queued.job.job_id, error = %e, "storage failure, abandoning cycle");
                    failure = Some(e);
                    break;
                }
            }
        }

        if report.already_accounted > 0 {
            metrics::lines_skipped().add(
                report.already_accounted as u64,
                &[KeyValue::new("reason", "accounted")],
            );
        }

        self.outbox.extend(report.results.iter().cloned());
        report.appended = self.flush_outbox().await;
        report.pending = self.outbox.len();

        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Decide and record the outcome of one queue line. `None` when the
    /// line was already answered by an earlier cycle.
    async fn process_line(&mut self, queued: &QueuedJob, nth: u32) -> Result<Option<ResultRecord>> {
        let job = &queued.job;

        if let Some(known) = self.store.lookup(&job.job_id)? {
            if nth <= known.occurrences {
                return Ok(None);
            }
        }

        let span = start_job_span(&job.job_id, queued.line);
        async {
            let decision = self.gate.evaluate(job, &self.store, self.clock.now())?;

            let record = match decision {
                GateDecision::Allow(request) => match self.executor.create(&request).await {
                    Ok(note) => {
                        ResultRecord::created(&job.job_id, self.clock.now(), note.location, note.reference)
                    }
                    Err(e) => {
                        warn!(error = %e, "executor failed");
                        ResultRecord::error(&job.job_id, self.clock.now(), e.0)
                    }
                },
                GateDecision::Deny { check, reason } => {
                    info!(check = %check, reason = %reason, "job denied");
                    ResultRecord::denied(&job.job_id, self.clock.now(), reason)
                }
                GateDecision::Duplicate(previous) => {
                    debug!(first_status = %previous.status, "job id already processed");
                    ResultRecord::skipped_duplicate(&job.job_id, self.clock.now())
                }
            };

            self.store
                .commit(&job.job_id, record.status, record.processed_at)?;
            record_outcome(&span, record.status);
            Ok(Some(record))
        }
        .instrument(span.clone())
        .await
    }

    /// Append everything in the outbox. Returns how many lines went out.
    async fn flush_outbox(&mut self) -> usize {
        if self.outbox.is_empty() {
            return 0;
        }
        match self.sink.append(&self.outbox).await {
            Ok(()) => {
                let n = self.outbox.len();
                self.outbox.clear();
                n
            }
            Err(e) => {
                metrics::poll_errors().add(1, &[KeyValue::new("stage", "append")]);
                warn!(error = %e, pending = self.outbox.len(), "result append failed, keeping results for next cycle");
                0
            }
        }
    }
}
