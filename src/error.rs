//! Error types for notes-queue.
//!
//! Gate denials and executor failures are not errors: they become result
//! records. Everything here is either fatal at startup (`Config`) or
//! absorbed by the poll loop and retried on the next tick.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for failures the poll loop should simply retry on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Http(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
