//! Remote document store abstraction.
//!
//! The queue and results documents live in a shared remote store. Every
//! read returns an opaque version token; conditional writes are guarded by
//! a [`WritePrecondition`] and report a lost race as a normal
//! [`WriteResult::PreconditionFailed`], never as an error.

pub mod gist;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// Opaque version token returned by a read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentVersion(pub String);

impl std::fmt::Display for DocumentVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A document's content and the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub content: String,
    pub version: DocumentVersion,
}

/// Precondition for conditional writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Write only if the document does not exist yet.
    DoesNotExist,
    /// Write only if the document is still at this version.
    MatchesVersion(DocumentVersion),
    /// Write unconditionally.
    None,
}

impl WritePrecondition {
    /// The precondition matching what a read returned.
    pub fn from_read(doc: Option<&Document>) -> Self {
        match doc {
            Some(doc) => WritePrecondition::MatchesVersion(doc.version.clone()),
            None => WritePrecondition::DoesNotExist,
        }
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Write succeeded; the document is now at `version`.
    Success { version: DocumentVersion },
    /// Someone else wrote first. `None` means the document is gone.
    PreconditionFailed {
        current_version: Option<DocumentVersion>,
    },
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read a document. `Ok(None)` if it does not exist.
    async fn read(&self, name: &str) -> Result<Option<Document>>;

    /// Write a document if `precondition` holds.
    async fn write(
        &self,
        name: &str,
        content: String,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryState {
    documents: HashMap<String, (String, u64)>,
    injected_conflicts: usize,
    writes: usize,
    unavailable: bool,
}

/// In-memory document store for tests and dry runs.
///
/// Versions are numeric counters exposed as strings. Reads yield to the
/// scheduler so concurrent appenders on one runtime genuinely interleave.
#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| Error::Other("lock poisoned".to_string()))
    }

    /// Seed or overwrite a document directly.
    pub fn insert(&self, name: &str, content: impl Into<String>) -> Result<()> {
        let mut state = self.lock()?;
        let version = state.documents.get(name).map_or(1, |(_, v)| v + 1);
        state
            .documents
            .insert(name.to_string(), (content.into(), version));
        Ok(())
    }

    /// Current content of a document, if any.
    pub fn content(&self, name: &str) -> Result<Option<String>> {
        Ok(self.lock()?.documents.get(name).map(|(c, _)| c.clone()))
    }

    /// Make the next `n` conditional writes fail as if another writer won.
    pub fn inject_conflicts(&self, n: usize) -> Result<()> {
        self.lock()?.injected_conflicts = n;
        Ok(())
    }

    /// Make every operation fail with a transport error until reset.
    pub fn set_unavailable(&self, unavailable: bool) -> Result<()> {
        self.lock()?.unavailable = unavailable;
        Ok(())
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> Result<usize> {
        Ok(self.lock()?.writes)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn read(&self, name: &str) -> Result<Option<Document>> {
        tokio::task::yield_now().await;
        let state = self.lock()?;
        if state.unavailable {
            return Err(Error::Transport("document store unavailable".to_string()));
        }
        Ok(state.documents.get(name).map(|(content, version)| Document {
            content: content.clone(),
            version: DocumentVersion(version.to_string()),
        }))
    }

    async fn write(
        &self,
        name: &str,
        content: String,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut state = self.lock()?;
        if state.unavailable {
            return Err(Error::Transport("document store unavailable".to_string()));
        }

        let current = state.documents.get(name).map(|(_, v)| *v);
        let current_version = current.map(|v| DocumentVersion(v.to_string()));

        if precondition != WritePrecondition::None && state.injected_conflicts > 0 {
            state.injected_conflicts -= 1;
            return Ok(WriteResult::PreconditionFailed { current_version });
        }

        let holds = match &precondition {
            WritePrecondition::DoesNotExist => current.is_none(),
            WritePrecondition::MatchesVersion(expected) => {
                current_version.as_ref() == Some(expected)
            }
            WritePrecondition::None => true,
        };
        if !holds {
            return Ok(WriteResult::PreconditionFailed { current_version });
        }

        let version = current.map_or(1, |v| v + 1);
        state.documents.insert(name.to_string(), (content, version));
        state.writes += 1;
        Ok(WriteResult::Success {
            version: DocumentVersion(version.to_string()),
        })
    }
}
