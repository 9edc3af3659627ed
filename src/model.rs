//! Core data model.
//!
//! A job is a signed request, appended by a producer to the queue document,
//! to perform one side-effecting action. The worker answers every job it
//! considers with exactly one result record.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Folder that is always allowed, and the default when a job names none.
pub const DEFAULT_FOLDER: &str = "MCP Inbox";

/// Account used when a job names none.
pub const DEFAULT_ACCOUNT: &str = "iCloud";

/// Accounts the note backend knows how to address.
pub const KNOWN_ACCOUNTS: [&str; 2] = ["iCloud", "On My Mac"];

/// Wire name of the note-creation tool.
pub const TOOL_CREATE_NOTE: &str = "notes.create";

// ---------------------------------------------------------------------------
// Job envelope (raw queue line)
// ---------------------------------------------------------------------------

/// Why a queue line could not be turned into a job envelope.
#[derive(Debug, Error)]
pub enum LineError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("job line is not a JSON object")]
    NotAnObject,

    #[error("job line has no usable job_id")]
    MissingJobId,
}

/// A queue line that decoded to a JSON object with a job id.
///
/// The raw object is kept as received: the signature covers exactly these
/// fields, including any this worker does not understand.
#[derive(Debug, Clone)]
pub struct JobEnvelope {
    pub job_id: String,
    pub raw: Map<String, Value>,
}

impl JobEnvelope {
    /// Decode one queue line.
    pub fn from_line(line: &str) -> Result<Self, LineError> {
        let value: Value = serde_json::from_str(line)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, LineError> {
        let Value::Object(raw) = value else {
            return Err(LineError::NotAnObject);
        };
        let job_id = match raw.get("job_id") {
            Some(Value::String(id)) if !id.trim().is_empty() => id.clone(),
            _ => return Err(LineError::MissingJobId),
        };
        Ok(Self { job_id, raw })
    }

    /// The raw `created_at` string, if present.
    pub fn created_at(&self) -> Option<&str> {
        self.raw.get("created_at").and_then(Value::as_str)
    }

    /// Decode `tool` + `args` into a typed action.
    pub fn action(&self) -> Result<JobAction, String> {
        let tool = self
            .raw
            .get("tool")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing required field: tool".to_string())?;
        let args = self
            .raw
            .get("args")
            .cloned()
            .ok_or_else(|| "missing required field: args".to_string())?;
        JobAction::decode(tool, args)
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Closed set of tools a job may request, keyed by the wire `tool` name.
#[derive(Debug, Clone, PartialEq)]
pub enum JobAction {
    CreateNote(CreateNoteArgs),
}

impl JobAction {
    pub fn decode(tool: &str, args: Value) -> Result<Self, String> {
        match tool {
            TOOL_CREATE_NOTE => serde_json::from_value(args)
                .map(JobAction::CreateNote)
                .map_err(|e| format!("invalid args for {TOOL_CREATE_NOTE}: {e}")),
            other => Err(format!("unsupported tool: {other}")),
        }
    }

    pub fn tool(&self) -> &'static str {
        match self {
            JobAction::CreateNote(_) => TOOL_CREATE_NOTE,
        }
    }
}

/// Arguments of `notes.create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateNoteArgs {
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl CreateNoteArgs {
    pub fn folder_or_default(&self) -> &str {
        self.folder.as_deref().unwrap_or(DEFAULT_FOLDER)
    }

    pub fn account_or_default(&self) -> &str {
        self.account.as_deref().unwrap_or(DEFAULT_ACCOUNT)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of considering one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Created,
    Denied,
    Error,
    SkippedDuplicate,
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResultStatus::Created => "created",
            ResultStatus::Denied => "denied",
            ResultStatus::Error => "error",
            ResultStatus::SkippedDuplicate => "skipped_duplicate",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ResultStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ResultStatus::Created),
            "denied" => Ok(ResultStatus::Denied),
            "error" => Ok(ResultStatus::Error),
            "skipped_duplicate" => Ok(ResultStatus::SkippedDuplicate),
            other => Err(crate::error::Error::Other(format!(
                "unknown result status: {other}"
            ))),
        }
    }
}

/// Where the executor put a note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteLocation {
    pub account: String,
    pub folder: String,
}

/// One line of the results document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub job_id: String,
    pub processed_at: DateTime<Utc>,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<NoteLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl ResultRecord {
    pub fn created(
        job_id: impl Into<String>,
        processed_at: DateTime<Utc>,
        location: NoteLocation,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            processed_at,
            status: ResultStatus::Created,
            reason: None,
            location: Some(location),
            reference: Some(reference.into()),
        }
    }

    pub fn denied(
        job_id: impl Into<String>,
        processed_at: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        Self::failure(job_id, processed_at, ResultStatus::Denied, reason)
    }

    pub fn error(
        job_id: impl Into<String>,
        processed_at: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        Self::failure(job_id, processed_at, ResultStatus::Error, reason)
    }

    pub fn skipped_duplicate(job_id: impl Into<String>, processed_at: DateTime<Utc>) -> Self {
        Self::failure(
            job_id,
            processed_at,
            ResultStatus::SkippedDuplicate,
            "job_id already processed",
        )
    }

    fn failure(
        job_id: impl Into<String>,
        processed_at: DateTime<Utc>,
        status: ResultStatus,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            processed_at,
            status,
            reason: Some(reason.into()),
            location: None,
            reference: None,
        }
    }

    /// Serialize as a single results-document line (no trailing newline).
    pub fn to_line(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Idempotency record
// ---------------------------------------------------------------------------

/// What the worker remembers about a job id it has considered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedJobRecord {
    pub job_id: String,
    pub processed_at: DateTime<Utc>,
    pub status: ResultStatus,
    /// Queue lines carrying this job id that have already been answered.
    pub occurrences: u32,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for unsigned job objects. The producer-side way to submit work.
pub struct NewJob {
    pub(crate) job_id: String,
    pub(crate) action: JobAction,
}

impl NewJob {
    pub fn create_note(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            action: JobAction::CreateNote(CreateNoteArgs {
                title: title.into(),
                body: body.into(),
                folder: None,
                account: None,
                confirm: None,
                tags: None,
            }),
        }
    }

    pub fn job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = job_id.into();
        self
    }

    pub fn folder(mut self, folder: impl Into<String>) -> Self {
        let JobAction::CreateNote(ref mut args) = self.action;
        args.folder = Some(folder.into());
        self
    }

    pub fn account(mut self, account: impl Into<String>) -> Self {
        let JobAction::CreateNote(ref mut args) = self.action;
        args.account = Some(account.into());
        self
    }

    pub fn confirm(mut self, confirm: bool) -> Self {
        let JobAction::CreateNote(ref mut args) = self.action;
        args.confirm = Some(confirm);
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        let JobAction::CreateNote(ref mut args) = self.action;
        args.tags = Some(tags);
        self
    }

    /// Render the unsigned wire object, stamped with `created_at`.
    pub fn to_value(&self, created_at: DateTime<Utc>) -> crate::error::Result<Value> {
        let args = match &self.action {
            JobAction::CreateNote(args) => serde_json::to_value(args)?,
        };
        Ok(serde_json::json!({
            "job_id": self.job_id,
            "created_at": created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            "tool": self.action.tool(),
            "args": args,
        }))
    }
}
