//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use notes_queue::codec;
use notes_queue::document::MemoryDocumentStore;
use notes_queue::executor::{CreatedNote, ExecutionError, Executor, NoteRequest};
use notes_queue::model::{NoteLocation, ResultRecord};
use serde_json::{Map, Value, json};
use std::sync::Mutex;

pub const SECRET: &str = "test-secret";
pub const QUEUE: &str = "queue.jsonl";
pub const RESULTS: &str = "results.jsonl";

/// Fixed "now" for clock-driven tests.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
}

pub fn timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// An unsigned `notes.create` job object.
pub fn note_job(job_id: &str, created_at: DateTime<Utc>) -> Map<String, Value> {
    let Value::Object(map) = json!({
        "job_id": job_id,
        "created_at": timestamp(created_at),
        "tool": "notes.create",
        "args": {"title": "Test", "body": "Test content", "folder": "MCP Inbox"},
    }) else {
        unreachable!()
    };
    map
}

pub fn sign(mut job: Map<String, Value>) -> Map<String, Value> {
    codec::sign_job(&mut job, SECRET.as_bytes()).unwrap();
    job
}

/// A signed job rendered as one queue line.
pub fn signed_line(job: Map<String, Value>) -> String {
    serde_json::to_string(&sign(job)).unwrap()
}

/// Append lines to the queue document of a memory store.
pub fn push_queue(docs: &MemoryDocumentStore, lines: &[String]) {
    let mut content = docs.content(QUEUE).unwrap().unwrap_or_default();
    for line in lines {
        content.push_str(line);
        content.push('\n');
    }
    docs.insert(QUEUE, content).unwrap();
}

/// Parse every result line in the results document.
pub fn results(docs: &MemoryDocumentStore) -> Vec<ResultRecord> {
    docs.content(RESULTS)
        .unwrap()
        .unwrap_or_default()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

/// Executor that records every request and answers from a script.
#[derive(Default)]
pub struct RecordingExecutor {
    pub requests: Mutex<Vec<NoteRequest>>,
    pub failure: Mutex<Option<String>>,
}

impl RecordingExecutor {
    pub fn failing(reason: &str) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            failure: Mutex::new(Some(reason.to_string())),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Executor for RecordingExecutor {
    async fn create(&self, request: &NoteRequest) -> Result<CreatedNote, ExecutionError> {
        let n = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len()
        };
        if let Some(reason) = self.failure.lock().unwrap().clone() {
            return Err(ExecutionError(reason));
        }
        Ok(CreatedNote {
            location: NoteLocation {
                account: request.account.clone(),
                folder: request.folder.clone(),
            },
            reference: format!("x-coredata://note/{n}"),
        })
    }
}
