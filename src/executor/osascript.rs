//! Apple Notes backend via `osascript`.
//!
//! The AppleScript source is a fixed constant. Title, body, folder and
//! account are passed as separate argv entries and read inside the script
//! with `item n of argv`, so no job value is ever spliced into script text.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{CreatedNote, ExecutionError, Executor, NoteRequest};
use crate::model::NoteLocation;

const CREATE_NOTE_SCRIPT: &str = r#"
on run argv
    set titleText to item 1 of argv
    set bodyText to item 2 of argv
    set folderName to item 3 of argv
    set accountName to item 4 of argv
    tell application "Notes"
        set targetAccount to account accountName
        try
            set targetFolder to folder folderName of targetAccount
        on error
            set targetFolder to make new folder at targetAccount with properties {name:folderName}
        end try
        set newNote to make new note at targetFolder with properties {name:titleText, body:bodyText}
        return "SUCCESS|" & accountName & "|" & folderName & "|" & (id of newNote)
    end tell
end run
"#;

const SAFE_PATH: &str = "/usr/bin:/bin:/usr/local/bin";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates notes by running `osascript` with a fixed script.
#[derive(Debug, Clone)]
pub struct OsascriptExecutor {
    program: PathBuf,
    timeout: Duration,
}

impl Default for OsascriptExecutor {
    fn default() -> Self {
        Self {
            program: PathBuf::from("osascript"),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl OsascriptExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a different interpreter binary (same argv contract).
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Executor for OsascriptExecutor {
    async fn create(&self, request: &NoteRequest) -> Result<CreatedNote, ExecutionError> {
        let start = Instant::now();
        debug!(
            program = %self.program.display(),
            title_length = request.title.chars().count(),
            body_length = request.body.chars().count(),
            "running note script"
        );

        let child = Command::new(&self.program)
            .arg("-e")
            .arg(CREATE_NOTE_SCRIPT)
            .arg("--")
            .arg(&request.title)
            .arg(&request.body)
            .arg(&request.folder)
            .arg(&request.account)
            .env_clear()
            .env("PATH", SAFE_PATH)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutionError(format!("Failed to execute AppleScript: {e}")))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => {
                result.map_err(|e| ExecutionError(format!("Failed to execute AppleScript: {e}")))?
            }
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "note script timed out");
                return Err(ExecutionError("AppleScript execution timed out".to_string()));
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let detail = if stderr.is_empty() { stdout } else { stderr };
            debug!(duration_ms, code = output.status.code().unwrap_or(-1), "note script failed");
            return Err(ExecutionError(format!("AppleScript error: {detail}")));
        }

        debug!(duration_ms, "note script finished");
        parse_success(&stdout)
            .ok_or_else(|| ExecutionError(format!("Unexpected AppleScript output: {stdout}")))
    }
}

/// Parse `SUCCESS|account|folder|reference`. The reference may itself
/// contain `|`.
fn parse_success(output: &str) -> Option<CreatedNote> {
    let rest = output.strip_prefix("SUCCESS|")?;
    let mut parts = rest.splitn(3, '|');
    let account = parts.next()?;
    let folder = parts.next()?;
    let reference = parts.next()?;
    Some(CreatedNote {
        location: NoteLocation {
            account: account.to_string(),
            folder: folder.to_string(),
        },
        reference: reference.to_string(),
    })
}
