//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The signing secret and API token are wrapped in
//! secrecy::SecretString to prevent log leaks.

pub mod secrets;

use crate::engine::WorkerConfig;
use crate::error::{Error, Result};
use crate::gate::GateConfig;
use secrecy::SecretString;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_POLL_SECONDS: u64 = 15;
pub const DEFAULT_MAX_AGE_SECONDS: u64 = 24 * 60 * 60;
pub const DEFAULT_QUEUE_DOCUMENT: &str = "queue.jsonl";
pub const DEFAULT_RESULTS_DOCUMENT: &str = "results.jsonl";
pub const DEFAULT_STORE_CAPACITY: usize = 5000;

#[derive(Debug)]
pub struct Config {
    pub hmac_secret: SecretString,
    pub gist_id: Option<String>,
    pub github_token: Option<SecretString>,
    pub poll_interval: Duration,
    pub max_job_age: Duration,
    pub queue_document: String,
    pub results_document: String,
    pub db_path: PathBuf,
    pub store_capacity: usize,
    pub allowed_folders: Vec<String>,
    pub require_confirm: bool,
    pub otel_endpoint: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// Under launchd/systemd the service definition provides the vars.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let hmac_secret = var("NOTES_QUEUE_HMAC_SECRET")
            .or_else(|| var("NOTES_MCP_TOKEN"))
            .ok_or_else(|| {
                Error::Config(
                    "HMAC secret required (NOTES_QUEUE_HMAC_SECRET or NOTES_MCP_TOKEN)"
                        .to_string(),
                )
            })?;

        let poll_seconds = parse_var(&var, "NOTES_QUEUE_POLL_SECONDS", DEFAULT_POLL_SECONDS)?;
        if poll_seconds == 0 {
            return Err(Error::Config(
                "NOTES_QUEUE_POLL_SECONDS must be greater than zero".to_string(),
            ));
        }

        let store_capacity = parse_var(&var, "NOTES_QUEUE_STORE_CAPACITY", DEFAULT_STORE_CAPACITY)?;
        if store_capacity == 0 {
            return Err(Error::Config(
                "NOTES_QUEUE_STORE_CAPACITY must be greater than zero".to_string(),
            ));
        }

        let db_path = match var("NOTES_QUEUE_DB") {
            Some(path) => PathBuf::from(path),
            None => default_db_path(var("HOME")),
        };

        Ok(Self {
            hmac_secret: SecretString::from(hmac_secret),
            gist_id: var("NOTES_QUEUE_GIST_ID"),
            github_token: var("GITHUB_TOKEN").map(SecretString::from),
            poll_interval: Duration::from_secs(poll_seconds),
            max_job_age: Duration::from_secs(parse_var(
                &var,
                "NOTES_QUEUE_MAX_AGE_SECONDS",
                DEFAULT_MAX_AGE_SECONDS,
            )?),
            queue_document: var("NOTES_QUEUE_FILENAME")
                .unwrap_or_else(|| DEFAULT_QUEUE_DOCUMENT.to_string()),
            results_document: var("NOTES_RESULTS_FILENAME")
                .unwrap_or_else(|| DEFAULT_RESULTS_DOCUMENT.to_string()),
            db_path,
            store_capacity,
            allowed_folders: var("NOTES_MCP_ALLOWED_FOLDERS")
                .map(|s| parse_folder_list(&s))
                .unwrap_or_default(),
            require_confirm: var("NOTES_MCP_REQUIRE_CONFIRM")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("true")),
            otel_endpoint: var("OTEL_ENDPOINT"),
        })
    }

    /// Gist id and token, required by every command that touches the
    /// remote documents.
    pub fn gist_credentials(&self) -> Result<(&str, &SecretString)> {
        let gist_id = self.gist_id.as_deref().ok_or_else(|| {
            Error::Config("required environment variable NOTES_QUEUE_GIST_ID is not set".to_string())
        })?;
        let token = self.github_token.as_ref().ok_or_else(|| {
            Error::Config("required environment variable GITHUB_TOKEN is not set".to_string())
        })?;
        Ok((gist_id, token))
    }

    /// The subset of settings the security gate consumes.
    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            max_job_age: self.max_job_age,
            allowed_folders: self.allowed_folders.clone(),
            require_confirm: self.require_confirm,
        }
    }

    /// Loop settings for the worker.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: self.poll_interval,
            queue_document: self.queue_document.clone(),
            results_document: self.results_document.clone(),
            ..WorkerConfig::default()
        }
    }
}

fn parse_var<T, F>(var: &F, name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{name} must be a non-negative integer, got {raw:?}"))),
        None => Ok(default),
    }
}

/// Split a comma-separated folder list, dropping empty entries.
pub fn parse_folder_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_db_path(home: Option<String>) -> PathBuf {
    let base = home.map(PathBuf::from).unwrap_or_default();
    base.join(".notes-mcp-queue").join("worker.sqlite3")
}
