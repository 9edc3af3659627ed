//! Security gate: the ordered validators a job must pass before execution.
//!
//! The sequence is fixed and short-circuits on the first failure:
//!
//! 1. signature
//! 2. age
//! 3. idempotency
//! 4. field limits (including tool/args decoding and the account name)
//! 5. folder allowlist
//! 6. confirmation
//!
//! Denials are values, not errors. The only `Err` the gate returns comes
//! from reading the idempotency store.

use chrono::{DateTime, NaiveDateTime, Utc};
use secrecy::SecretString;
use std::time::Duration;

use crate::codec;
use crate::config::secrets::key_bytes;
use crate::error::Result;
use crate::executor::NoteRequest;
use crate::model::{
    CreateNoteArgs, DEFAULT_FOLDER, JobAction, JobEnvelope, KNOWN_ACCOUNTS, ProcessedJobRecord,
};
use crate::storage::IdempotencyStore;

pub const MAX_TITLE_CHARS: usize = 200;
pub const MAX_BODY_CHARS: usize = 50_000;
pub const MAX_FOLDER_CHARS: usize = 200;

/// How far in the future `created_at` may be before it counts as forged.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(5 * 60);

/// Settings the gate is evaluated against.
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub max_job_age: Duration,
    /// Folders a job may target in addition to [`DEFAULT_FOLDER`].
    pub allowed_folders: Vec<String>,
    pub require_confirm: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_job_age: Duration::from_secs(crate::config::DEFAULT_MAX_AGE_SECONDS),
            allowed_folders: Vec::new(),
            require_confirm: false,
        }
    }
}

/// Which validator produced a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    Signature,
    Age,
    FieldLimits,
    Allowlist,
    Confirmation,
}

impl std::fmt::Display for Check {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Check::Signature => "signature",
            Check::Age => "age",
            Check::FieldLimits => "field_limits",
            Check::Allowlist => "allowlist",
            Check::Confirmation => "confirmation",
        };
        write!(f, "{s}")
    }
}

/// Verdict for one job.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Every validator passed; the request is ready for the executor.
    Allow(NoteRequest),
    /// A validator rejected the job.
    Deny { check: Check, reason: String },
    /// The job id was already processed.
    Duplicate(ProcessedJobRecord),
}

/// The validator pipeline, holding the signing secret and gate settings.
pub struct SecurityGate {
    secret: SecretString,
    config: GateConfig,
}

impl SecurityGate {
    pub fn new(secret: SecretString, config: GateConfig) -> Self {
        Self { secret, config }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Run the full validator sequence against `job`.
    pub fn evaluate(
        &self,
        job: &JobEnvelope,
        store: &IdempotencyStore,
        now: DateTime<Utc>,
    ) -> Result<GateDecision> {
        if !codec::verify(&job.raw, key_bytes(&self.secret)) {
            return Ok(deny(Check::Signature, "invalid signature"));
        }

        if let Err(reason) = check_age(job.created_at(), now, self.config.max_job_age) {
            return Ok(deny(Check::Age, reason));
        }

        if let Some(record) = store.lookup(&job.job_id)? {
            return Ok(GateDecision::Duplicate(record));
        }

        let args = match job.action() {
            Ok(JobAction::CreateNote(args)) => args,
            Err(reason) => return Ok(deny(Check::FieldLimits, reason)),
        };
        if let Err(reason) = check_field_limits(&args) {
            return Ok(deny(Check::FieldLimits, reason));
        }

        if let Err(reason) = check_allowlist(args.folder_or_default(), &self.config.allowed_folders)
        {
            return Ok(deny(Check::Allowlist, reason));
        }

        if let Err(reason) = check_confirmation(&args, self.config.require_confirm) {
            return Ok(deny(Check::Confirmation, reason));
        }

        Ok(GateDecision::Allow(NoteRequest::from_args(&args)))
    }
}

fn deny(check: Check, reason: impl Into<String>) -> GateDecision {
    GateDecision::Deny {
        check,
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Individual validators
// ---------------------------------------------------------------------------

/// Parse a job timestamp. RFC 3339 first; a naive ISO-8601 timestamp
/// without offset is taken as UTC.
pub fn parse_created_at(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn check_age(
    created_at: Option<&str>,
    now: DateTime<Utc>,
    max_age: Duration,
) -> std::result::Result<(), String> {
    let raw = created_at.ok_or_else(|| "missing created_at".to_string())?;
    let created = parse_created_at(raw).ok_or_else(|| "unparsable created_at".to_string())?;

    match (now - created).to_std() {
        Ok(age) if age > max_age => Err(format!(
            "job expired: age {}s exceeds maximum {}s",
            age.as_secs(),
            max_age.as_secs()
        )),
        Ok(_) => Ok(()),
        // Negative age: created in the future.
        Err(_) => match (created - now).to_std() {
            Ok(ahead) if ahead > MAX_CLOCK_SKEW => Err("created_at is in the future".to_string()),
            _ => Ok(()),
        },
    }
}

pub fn check_field_limits(args: &CreateNoteArgs) -> std::result::Result<(), String> {
    check_text("Title", &args.title, MAX_TITLE_CHARS)?;
    check_text("Body", &args.body, MAX_BODY_CHARS)?;
    if let Some(folder) = &args.folder {
        check_text("Folder", folder, MAX_FOLDER_CHARS)?;
    }
    if let Some(account) = &args.account {
        if !KNOWN_ACCOUNTS.contains(&account.as_str()) {
            return Err(format!(
                "Invalid account: {account}. Must be 'iCloud' or 'On My Mac'"
            ));
        }
    }
    if args.tags.iter().flatten().any(|t| t.contains('\0')) {
        return Err("Tags contain null bytes".to_string());
    }
    Ok(())
}

fn check_text(field: &str, value: &str, max_chars: usize) -> std::result::Result<(), String> {
    if value.chars().count() > max_chars {
        return Err(format!(
            "{field} exceeds maximum length of {max_chars} characters"
        ));
    }
    if value.contains('\0') {
        return Err(format!("{field} contains null bytes"));
    }
    Ok(())
}

/// Exact, case-sensitive match against the allowlist. [`DEFAULT_FOLDER`]
/// is always allowed.
pub fn check_allowlist(folder: &str, allowed: &[String]) -> std::result::Result<(), String> {
    if folder == DEFAULT_FOLDER || allowed.iter().any(|f| f == folder) {
        Ok(())
    } else {
        Err(format!("Folder '{folder}' is not in the allowlist"))
    }
}

pub fn check_confirmation(
    args: &CreateNoteArgs,
    require_confirm: bool,
) -> std::result::Result<(), String> {
    if require_confirm && args.confirm != Some(true) {
        Err("Confirmation required (confirm=true) but not provided".to_string())
    } else {
        Ok(())
    }
}
