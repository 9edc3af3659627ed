//! Poll cycles against an in-memory document store and a recording executor.

mod common;

use chrono::Duration;
use common::{QUEUE, RecordingExecutor, SECRET, note_job, push_queue, results, signed_line, t0};
use notes_queue::codec;
use notes_queue::document::MemoryDocumentStore;
use async_trait::async_trait;
use notes_queue::engine::{ManualClock, Worker, WorkerConfig};
use notes_queue::executor::{CreatedNote, ExecutionError, Executor, NoteRequest};
use notes_queue::gate::{GateConfig, SecurityGate};
use notes_queue::model::ResultStatus;
use notes_queue::sink::RetryPolicy;
use notes_queue::storage::IdempotencyStore;
use secrecy::SecretString;
use serde_json::json;
use std::sync::Arc;

struct Harness {
    docs: MemoryDocumentStore,
    executor: Arc<RecordingExecutor>,
    clock: Arc<ManualClock>,
    worker: Worker,
}

fn harness_with(gate: GateConfig, executor: RecordingExecutor, config: WorkerConfig) -> Harness {
    harness_on(IdempotencyStore::in_memory(100).unwrap(), gate, executor, config)
}

fn harness_on(
    store: IdempotencyStore,
    gate: GateConfig,
    executor: RecordingExecutor,
    config: WorkerConfig,
) -> Harness {
    let docs = MemoryDocumentStore::new();
    let executor = Arc::new(executor);
    let clock = Arc::new(ManualClock::new(t0()));
    let worker = Worker::new(
        config,
        Arc::new(docs.clone()),
        SecurityGate::new(SecretString::from(SECRET), gate),
        store,
        executor.clone(),
        clock.clone(),
    );
    Harness {
        docs,
        executor,
        clock,
        worker,
    }
}

fn harness() -> Harness {
    harness_with(
        GateConfig::default(),
        RecordingExecutor::default(),
        WorkerConfig::default(),
    )
}

fn fresh_line(job_id: &str) -> String {
    signed_line(note_job(job_id, t0() - Duration::minutes(1)))
}

// ---------------------------------------------------------------------------
// Valid jobs are executed once and answered once
// ---------------------------------------------------------------------------

#[tokio::test]
async fn valid_job_is_created_exactly_once() {
    let mut h = harness();
    push_queue(&h.docs, &[fresh_line("job-a")]);

    let report = h.worker.run_cycle().await.unwrap();
    assert_eq!(report.count(ResultStatus::Created), 1);
    assert_eq!(report.appended, 1);

    let out = results(&h.docs);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].job_id, "job-a");
    assert_eq!(out[0].status, ResultStatus::Created);
    assert_eq!(out[0].processed_at, t0());
    let location = out[0].location.as_ref().unwrap();
    assert_eq!(location.folder, "MCP Inbox");
    assert_eq!(location.account, "iCloud");
    assert_eq!(out[0].reference.as_deref(), Some("x-coredata://note/1"));

    let requests = h.executor.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].title, "Test");
    assert_eq!(requests[0].body, "Test content");

    // Later polls re-read the same line and stay silent.
    for _ in 0..3 {
        let report = h.worker.run_cycle().await.unwrap();
        assert!(report.results.is_empty());
        assert_eq!(report.already_accounted, 1);
    }
    assert_eq!(h.executor.calls(), 1);
    assert_eq!(results(&h.docs).len(), 1);
}

// ---------------------------------------------------------------------------
// Bad signatures are denied without execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tampered_job_is_denied() {
    let mut h = harness();
    let mut tampered: serde_json::Value = serde_json::from_str(&fresh_line("job-b")).unwrap();
    tampered["args"]["title"] = json!("Something else");
    push_queue(&h.docs, &[tampered.to_string()]);

    h.worker.run_cycle().await.unwrap();
    h.worker.run_cycle().await.unwrap();

    let out = results(&h.docs);
    assert_eq!(out.len(), 1, "denial is reported once");
    assert_eq!(out[0].status, ResultStatus::Denied);
    assert_eq!(out[0].reason.as_deref(), Some("invalid signature"));
    assert!(out[0].location.is_none());
    assert_eq!(h.executor.calls(), 0);
}

#[tokio::test]
async fn job_signed_with_another_secret_is_denied() {
    let mut h = harness();
    let mut job = note_job("job-w", t0() - Duration::minutes(1));
    codec::sign_job(&mut job, b"other-secret").unwrap();
    push_queue(&h.docs, &[serde_json::to_string(&job).unwrap()]);

    let report = h.worker.run_cycle().await.unwrap();
    assert_eq!(report.count(ResultStatus::Denied), 1);

    let out = results(&h.docs);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].job_id, "job-w");
    assert_eq!(out[0].reason.as_deref(), Some("invalid signature"));
    assert_eq!(h.executor.calls(), 0);
}

// ---------------------------------------------------------------------------
// Re-submission of a processed job id
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resubmitted_job_is_skipped_once() {
    let mut h = harness();
    push_queue(&h.docs, &[fresh_line("job-c")]);
    h.worker.run_cycle().await.unwrap();

    // Producer appends the same job id again later.
    h.clock.advance(Duration::minutes(5));
    push_queue(&h.docs, &[fresh_line("job-c")]);

    let report = h.worker.run_cycle().await.unwrap();
    assert_eq!(report.count(ResultStatus::SkippedDuplicate), 1);
    assert_eq!(report.already_accounted, 1);

    h.worker.run_cycle().await.unwrap();

    let statuses: Vec<_> = results(&h.docs).into_iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![ResultStatus::Created, ResultStatus::SkippedDuplicate]
    );
    assert_eq!(h.executor.calls(), 1);

    let record = h.worker.store().lookup("job-c").unwrap().unwrap();
    assert_eq!(record.status, ResultStatus::Created);
    assert_eq!(record.processed_at, t0(), "duplicate did not overwrite the entry");
    assert_eq!(record.occurrences, 2);
}

#[tokio::test]
async fn duplicate_lines_in_one_poll() {
    let mut h = harness();
    let line = fresh_line("job-c");
    push_queue(&h.docs, &[line.clone(), line]);

    let report = h.worker.run_cycle().await.unwrap();
    let statuses: Vec<_> = report.results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![ResultStatus::Created, ResultStatus::SkippedDuplicate]
    );

    let report = h.worker.run_cycle().await.unwrap();
    assert!(report.results.is_empty());
    assert_eq!(report.already_accounted, 2);
    assert_eq!(h.executor.calls(), 1);
}

// ---------------------------------------------------------------------------
// Gate outcomes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stale_job_is_denied() {
    let mut h = harness();
    push_queue(
        &h.docs,
        &[signed_line(note_job("old", t0() - Duration::hours(48)))],
    );

    h.worker.run_cycle().await.unwrap();
    let out = results(&h.docs);
    assert_eq!(out[0].status, ResultStatus::Denied);
    assert!(out[0].reason.as_deref().unwrap().starts_with("job expired"));
    assert_eq!(h.executor.calls(), 0);
}

#[tokio::test]
async fn folder_outside_allowlist_is_denied() {
    let mut h = harness_with(
        GateConfig {
            allowed_folders: vec!["Work".to_string()],
            ..GateConfig::default()
        },
        RecordingExecutor::default(),
        WorkerConfig::default(),
    );
    let mut personal = note_job("personal", t0());
    personal["args"]["folder"] = json!("Personal");
    let mut work = note_job("work", t0());
    work["args"]["folder"] = json!("Work");
    push_queue(&h.docs, &[signed_line(personal), signed_line(work)]);

    h.worker.run_cycle().await.unwrap();
    let out = results(&h.docs);
    assert_eq!(out[0].status, ResultStatus::Denied);
    assert_eq!(
        out[0].reason.as_deref(),
        Some("Folder 'Personal' is not in the allowlist")
    );
    assert_eq!(out[1].status, ResultStatus::Created);
    assert_eq!(out[1].location.as_ref().unwrap().folder, "Work");
}

#[tokio::test]
async fn confirmation_required() {
    let mut h = harness_with(
        GateConfig {
            require_confirm: true,
            ..GateConfig::default()
        },
        RecordingExecutor::default(),
        WorkerConfig::default(),
    );
    let mut confirmed = note_job("yes", t0());
    confirmed["args"]["confirm"] = json!(true);
    push_queue(
        &h.docs,
        &[signed_line(note_job("no", t0())), signed_line(confirmed)],
    );

    let report = h.worker.run_cycle().await.unwrap();
    let statuses: Vec<_> = report.results.iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![ResultStatus::Denied, ResultStatus::Created]);
    assert_eq!(h.executor.calls(), 1);
}

#[tokio::test]
async fn executor_failure_is_final() {
    let mut h = harness_with(
        GateConfig::default(),
        RecordingExecutor::failing("AppleScript error: Notes got an error"),
        WorkerConfig::default(),
    );
    push_queue(&h.docs, &[fresh_line("job-e")]);

    h.worker.run_cycle().await.unwrap();
    h.worker.run_cycle().await.unwrap();

    let out = results(&h.docs);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].status, ResultStatus::Error);
    assert_eq!(
        out[0].reason.as_deref(),
        Some("AppleScript error: Notes got an error")
    );
    assert_eq!(h.executor.calls(), 1, "failed execution is not retried");
}

// ---------------------------------------------------------------------------
// Queue parsing and ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_and_comment_lines_produce_no_results() {
    let mut h = harness();
    push_queue(
        &h.docs,
        &[
            "# jobs below".to_string(),
            "{not json".to_string(),
            fresh_line("job-1"),
            String::new(),
            r#"{"tool":"notes.create"}"#.to_string(),
            fresh_line("job-2"),
        ],
    );

    let report = h.worker.run_cycle().await.unwrap();
    assert_eq!(report.unparsable, 2);
    assert_eq!(report.jobs_read, 2);

    let ids: Vec<_> = results(&h.docs).into_iter().map(|r| r.job_id).collect();
    assert_eq!(ids, vec!["job-1", "job-2"]);
}

#[tokio::test]
async fn results_follow_queue_order() {
    let mut h = harness();
    let mut stale = note_job("job-2", t0() - Duration::days(3));
    stale["args"]["title"] = json!("stale");
    push_queue(
        &h.docs,
        &[fresh_line("job-1"), signed_line(stale), fresh_line("job-3")],
    );

    h.worker.run_cycle().await.unwrap();
    let out = results(&h.docs);
    let ids: Vec<_> = out.iter().map(|r| r.job_id.as_str()).collect();
    assert_eq!(ids, vec!["job-1", "job-2", "job-3"]);
    assert_eq!(out[1].status, ResultStatus::Denied);
}

#[tokio::test]
async fn dry_run_executor_answers_without_creating() {
    use notes_queue::executor::{DRY_RUN_REFERENCE, DryRunExecutor};

    let docs = MemoryDocumentStore::new();
    let mut worker = Worker::new(
        WorkerConfig::default(),
        Arc::new(docs.clone()),
        SecurityGate::new(SecretString::from(SECRET), GateConfig::default()),
        IdempotencyStore::in_memory(100).unwrap(),
        Arc::new(DryRunExecutor),
        Arc::new(ManualClock::new(t0())),
    );
    push_queue(&docs, &[fresh_line("job-dry")]);

    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.count(ResultStatus::Created), 1);
    let out = results(&docs);
    assert_eq!(out[0].reference.as_deref(), Some(DRY_RUN_REFERENCE));
    assert_eq!(out[0].location.as_ref().unwrap().folder, "MCP Inbox");
}

#[tokio::test]
async fn missing_queue_document_is_an_idle_cycle() {
    let mut h = harness();
    let report = h.worker.run_cycle().await.unwrap();
    assert_eq!(report.jobs_read, 0);
    assert!(h.docs.content(common::RESULTS).unwrap().is_none());
}

#[tokio::test]
async fn results_never_carry_job_content_or_secret() {
    let mut h = harness();
    let mut job = note_job("job-s", t0());
    job["args"]["body"] = json!("very private body text");
    push_queue(&h.docs, &[signed_line(job)]);

    h.worker.run_cycle().await.unwrap();
    let content = h.docs.content(common::RESULTS).unwrap().unwrap();
    assert!(!content.contains("very private body text"));
    assert!(!content.contains(SECRET));
}

// ---------------------------------------------------------------------------
// Transport failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fetch_failure_is_retried_next_cycle() {
    let mut h = harness();
    push_queue(&h.docs, &[fresh_line("job-t")]);
    h.docs.set_unavailable(true).unwrap();

    let err = h.worker.run_cycle().await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(h.executor.calls(), 0);
    assert!(h.worker.store().lookup("job-t").unwrap().is_none());

    h.docs.set_unavailable(false).unwrap();
    let report = h.worker.run_cycle().await.unwrap();
    assert_eq!(report.count(ResultStatus::Created), 1);
    assert_eq!(results(&h.docs).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn lost_append_is_kept_and_sent_next_cycle() {
    let policy = RetryPolicy {
        max_attempts: 2,
        base_delay: std::time::Duration::from_millis(10),
        max_delay: std::time::Duration::from_millis(10),
    };
    let mut h = harness_with(
        GateConfig::default(),
        RecordingExecutor::default(),
        WorkerConfig {
            append_policy: policy,
            ..WorkerConfig::default()
        },
    );
    push_queue(&h.docs, &[fresh_line("job-1")]);
    h.docs.inject_conflicts(2).unwrap();

    let report = h.worker.run_cycle().await.unwrap();
    assert_eq!(report.appended, 0);
    assert_eq!(report.pending, 1);
    assert_eq!(h.worker.outbox().len(), 1);
    assert!(results(&h.docs).is_empty());

    push_queue(&h.docs, &[fresh_line("job-2")]);
    let report = h.worker.run_cycle().await.unwrap();
    assert_eq!(report.appended, 2);
    assert_eq!(report.pending, 0);

    let ids: Vec<_> = results(&h.docs).into_iter().map(|r| r.job_id).collect();
    assert_eq!(ids, vec!["job-1", "job-2"], "older results go first");
    assert_eq!(h.executor.calls(), 2);
}

// ---------------------------------------------------------------------------
// Idempotency store
// ---------------------------------------------------------------------------

#[tokio::test]
async fn jobs_recorded_by_an_older_worker_do_not_stall_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("worker.sqlite3");
    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE processed_jobs (
                job_id TEXT PRIMARY KEY,
                processed_at TEXT NOT NULL,
                status TEXT NOT NULL
            );
            INSERT INTO processed_jobs VALUES ('legacy', '2026-06-01T11:58:00.000000Z', 'ok');
            INSERT INTO processed_jobs VALUES ('garbled', 'not a time', 'finished');",
        )
        .unwrap();
    }

    let mut h = harness_on(
        IdempotencyStore::open(&path, 100).unwrap(),
        GateConfig::default(),
        RecordingExecutor::default(),
        WorkerConfig::default(),
    );
    push_queue(
        &h.docs,
        &[fresh_line("legacy"), fresh_line("garbled"), fresh_line("new-job")],
    );

    for _ in 0..3 {
        h.worker.run_cycle().await.unwrap();
    }

    let out = results(&h.docs);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].job_id, "new-job");
    assert_eq!(out[0].status, ResultStatus::Created);
    assert_eq!(h.executor.calls(), 1);
    assert_eq!(
        h.worker.store().lookup("legacy").unwrap().unwrap().status,
        ResultStatus::Created
    );
}

/// Renames the store's table away when asked to create its n-th note, so the
/// commit that follows fails.
struct TableHidingExecutor {
    inner: RecordingExecutor,
    db_path: std::path::PathBuf,
    hide_on_call: usize,
}

#[async_trait]
impl Executor for TableHidingExecutor {
    async fn create(&self, request: &NoteRequest) -> Result<CreatedNote, ExecutionError> {
        let created = self.inner.create(request).await;
        if self.inner.calls() == self.hide_on_call {
            rusqlite::Connection::open(&self.db_path)
                .unwrap()
                .execute_batch("ALTER TABLE processed_jobs RENAME TO processed_jobs_hidden;")
                .unwrap();
        }
        created
    }
}

#[tokio::test]
async fn storage_failure_keeps_earlier_results_and_resumes_next_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("worker.sqlite3");
    let executor = Arc::new(TableHidingExecutor {
        inner: RecordingExecutor::default(),
        db_path: path.clone(),
        hide_on_call: 2,
    });
    let docs = MemoryDocumentStore::new();
    let mut worker = Worker::new(
        WorkerConfig::default(),
        Arc::new(docs.clone()),
        SecurityGate::new(SecretString::from(SECRET), GateConfig::default()),
        IdempotencyStore::open(&path, 100).unwrap(),
        executor.clone(),
        Arc::new(ManualClock::new(t0())),
    );
    push_queue(
        &docs,
        &[fresh_line("job-1"), fresh_line("job-2"), fresh_line("job-3")],
    );

    assert!(worker.run_cycle().await.is_err());
    let ids: Vec<_> = results(&docs).into_iter().map(|r| r.job_id).collect();
    assert_eq!(ids, vec!["job-1"], "results before the failure are appended");
    assert_eq!(executor.inner.calls(), 2, "job-3 is not reached");

    rusqlite::Connection::open(&path)
        .unwrap()
        .execute_batch("ALTER TABLE processed_jobs_hidden RENAME TO processed_jobs;")
        .unwrap();

    let report = worker.run_cycle().await.unwrap();
    assert_eq!(report.already_accounted, 1);
    let ids: Vec<_> = results(&docs).into_iter().map(|r| r.job_id).collect();
    assert_eq!(ids, vec!["job-1", "job-2", "job-3"]);
    // job-2 ran before its commit failed, so it runs again.
    assert_eq!(executor.inner.calls(), 4);
}

#[tokio::test]
async fn queue_larger_than_store_capacity_is_flagged() {
    let mut h = harness_on(
        IdempotencyStore::in_memory(2).unwrap(),
        GateConfig::default(),
        RecordingExecutor::default(),
        WorkerConfig::default(),
    );
    push_queue(&h.docs, &[fresh_line("job-1"), fresh_line("job-1")]);
    let report = h.worker.run_cycle().await.unwrap();
    assert!(!report.over_capacity);

    push_queue(&h.docs, &[fresh_line("job-2"), fresh_line("job-3")]);
    let report = h.worker.run_cycle().await.unwrap();
    assert!(report.over_capacity);
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn loop_polls_until_shutdown() {
    let mut h = harness();
    push_queue(&h.docs, &[fresh_line("job-l")]);
    let handle = h.worker.shutdown_handle();
    let docs = h.docs.clone();

    let stop = async {
        // Ticks at 0s, 15s and 30s; the job line arriving after the first
        // tick is picked up by the second.
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        push_queue(&docs, &[fresh_line("job-late")]);
        tokio::time::sleep(std::time::Duration::from_secs(35)).await;
        handle.shutdown();
    };

    let (run, ()) = tokio::join!(h.worker.run(), stop);
    run.unwrap();

    let ids: Vec<_> = results(&h.docs).into_iter().map(|r| r.job_id).collect();
    assert_eq!(ids, vec!["job-l", "job-late"]);
    assert_eq!(h.executor.calls(), 2);
}

#[tokio::test]
async fn shutdown_before_run_returns_immediately() {
    let mut h = harness();
    h.worker.shutdown_handle().shutdown();
    h.worker.run().await.unwrap();
}
