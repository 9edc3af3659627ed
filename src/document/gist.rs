//! GitHub Gist document store.
//!
//! Each document is one file of a single gist. The version token is the
//! gist's latest revision id (`history[0].version`), so a write to any file
//! of the gist moves every document's version. That costs an occasional
//! spurious conflict and nothing else.
//!
//! The Gist API has no server-side compare-and-swap. A conditional write
//! re-reads the revision and bails out on mismatch before patching, which
//! leaves a narrow window between check and patch where a concurrent writer
//! can still slip in.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::{Document, DocumentStore, DocumentVersion, WritePrecondition, WriteResult};
use crate::error::{Error, Result};

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct GistResponse {
    #[serde(default)]
    files: HashMap<String, Option<GistFile>>,
    #[serde(default)]
    history: Vec<GistRevision>,
}

#[derive(Debug, Deserialize)]
struct GistFile {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    truncated: bool,
    #[serde(default)]
    raw_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GistRevision {
    version: String,
}

/// Documents stored as files of one GitHub gist.
pub struct GistStore {
    client: reqwest::Client,
    api_base: String,
    gist_id: String,
    token: SecretString,
}

impl std::fmt::Debug for GistStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GistStore")
            .field("api_base", &self.api_base)
            .field("gist_id", &crate::config::secrets::mask(&self.gist_id))
            .finish_non_exhaustive()
    }
}

impl GistStore {
    pub fn new(gist_id: impl Into<String>, token: SecretString) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("notes-queue/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            api_base: DEFAULT_API_BASE.to_string(),
            gist_id: gist_id.into(),
            token,
        })
    }

    /// Point at a different API host (GitHub Enterprise, test servers).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self) -> String {
        format!("{}/gists/{}", self.api_base, self.gist_id)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header(
                reqwest::header::AUTHORIZATION,
                format!("token {}", self.token.expose_secret()),
            )
            .header(reqwest::header::ACCEPT, "application/vnd.github.v3+json")
    }

    async fn fetch(&self) -> Result<GistResponse> {
        let response = self
            .authorized(self.client.get(self.url()))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// Content and version of `name` from a fetched gist.
    async fn document_from(&self, gist: &GistResponse, name: &str) -> Result<Option<Document>> {
        let Some(Some(file)) = gist.files.get(name) else {
            return Ok(None);
        };
        let version = latest_version(gist)?;

        // Files over ~1 MB come back truncated; the full text is at raw_url.
        let content = match (&file.content, file.truncated, &file.raw_url) {
            (_, true, Some(raw_url)) => {
                debug!(document = name, "fetching truncated gist file");
                self.authorized(self.client.get(raw_url))
                    .send()
                    .await?
                    .error_for_status()?
                    .text()
                    .await?
            }
            (Some(content), _, _) => content.clone(),
            (None, _, _) => String::new(),
        };

        Ok(Some(Document { content, version }))
    }
}

fn latest_version(gist: &GistResponse) -> Result<DocumentVersion> {
    gist.history
        .first()
        .map(|rev| DocumentVersion(rev.version.clone()))
        .ok_or_else(|| Error::Transport("gist response carries no revision history".to_string()))
}

#[async_trait]
impl DocumentStore for GistStore {
    async fn read(&self, name: &str) -> Result<Option<Document>> {
        let gist = self.fetch().await?;
        self.document_from(&gist, name).await
    }

    async fn write(
        &self,
        name: &str,
        content: String,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        if precondition != WritePrecondition::None {
            let gist = self.fetch().await?;
            let exists = matches!(gist.files.get(name), Some(Some(_)));
            let current = latest_version(&gist)?;
            let holds = match &precondition {
                WritePrecondition::DoesNotExist => !exists,
                WritePrecondition::MatchesVersion(expected) => exists && *expected == current,
                WritePrecondition::None => true,
            };
            if !holds {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: exists.then_some(current),
                });
            }
        }

        // The API rejects empty files; a lone newline reads back as no lines.
        let content = if content.is_empty() {
            "\n".to_string()
        } else {
            content
        };
        let payload = serde_json::json!({ "files": { name: { "content": content } } });

        let response = self
            .authorized(self.client.patch(self.url()))
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        let gist: GistResponse = response.json().await?;

        Ok(WriteResult::Success {
            version: latest_version(&gist)?,
        })
    }
}
