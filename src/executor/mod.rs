//! Executor: performs the side effect for a validated job.
//!
//! The worker only ever hands an executor a [`NoteRequest`] that already
//! passed the security gate. Values travel as discrete fields, never as a
//! pre-built command string.

pub mod osascript;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{CreateNoteArgs, NoteLocation};

/// Already validated, already length-bounded note arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteRequest {
    pub title: String,
    pub body: String,
    pub folder: String,
    pub account: String,
}

impl NoteRequest {
    /// Resolve folder/account defaults from gate-checked args.
    pub(crate) fn from_args(args: &CreateNoteArgs) -> Self {
        Self {
            title: args.title.clone(),
            body: args.body.clone(),
            folder: args.folder_or_default().to_string(),
            account: args.account_or_default().to_string(),
        }
    }
}

/// What the backend reports after creating a note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedNote {
    pub location: NoteLocation,
    pub reference: String,
}

/// Backend failure. Becomes an `error` result; the job is not retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ExecutionError(pub String);

#[async_trait]
pub trait Executor: Send + Sync {
    async fn create(&self, request: &NoteRequest) -> Result<CreatedNote, ExecutionError>;
}

/// Reports success without creating anything. Used by `once --dry-run`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunExecutor;

pub const DRY_RUN_REFERENCE: &str = "dry-run";

#[async_trait]
impl Executor for DryRunExecutor {
    async fn create(&self, request: &NoteRequest) -> Result<CreatedNote, ExecutionError> {
        tracing::info!(
            folder = %request.folder,
            account = %request.account,
            title_length = request.title.chars().count(),
            "dry run: note not created"
        );
        Ok(CreatedNote {
            location: NoteLocation {
                account: request.account.clone(),
                folder: request.folder.clone(),
            },
            reference: DRY_RUN_REFERENCE.to_string(),
        })
    }
}
