//! Patch repositories
//!
//! A repository serves one document per title at `<location>/<serial>.xml`.

use crate::parser::{parse, ParseOutcome};
use cv_core::cancel::CancellationToken;
use cv_core::error::PatchError;
use cv_core::title::Serial;
use std::path::PathBuf;
use std::time::Duration;

/// Somewhere patch documents come from
pub trait PatchSource: Send + Sync {
    /// Repository name used to group stored definitions
    fn name(&self) -> &str;

    /// Human-readable location
    fn location(&self) -> String;

    /// Raw document text for a title
    fn fetch_document(&self, serial: &Serial) -> Result<String, PatchError>;

    /// Fetch and parse the document for a title
    ///
    /// Cancellation is checked before and after the transfer.
    fn fetch(&self, serial: &Serial, cancel: &CancellationToken) -> Result<ParseOutcome, PatchError> {
        if cancel.is_cancelled() {
            return Err(PatchError::Cancelled);
        }
        let text = self.fetch_document(serial)?;
        if cancel.is_cancelled() {
            return Err(PatchError::Cancelled);
        }
        Ok(parse(&text))
    }
}

/// Documents in a local directory
#[derive(Debug, Clone)]
pub struct LocalRepository {
    name: String,
    dir: PathBuf,
}

impl LocalRepository {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
        }
    }
}

impl PatchSource for LocalRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn location(&self) -> String {
        self.dir.display().to_string()
    }

    fn fetch_document(&self, serial: &Serial) -> Result<String, PatchError> {
        let path = self.dir.join(format!("{}.xml", serial));
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                tracing::debug!("Read patch document {}", path.display());
                Ok(text)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PatchError::NotFound(path.display().to_string()))
            }
            Err(e) => Err(PatchError::Io(e)),
        }
    }
}

/// Documents served over HTTP(S)
pub struct HttpRepository {
    name: String,
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpRepository {
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, PatchError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cellvault/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PatchError::Fetch {
                url: base_url.clone(),
                reason: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            name: name.into(),
            base_url,
            client,
        })
    }

    fn document_url(&self, serial: &Serial) -> String {
        format!("{}/{}.xml", self.base_url, serial)
    }
}

impl PatchSource for HttpRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn location(&self) -> String {
        self.base_url.clone()
    }

    fn fetch_document(&self, serial: &Serial) -> Result<String, PatchError> {
        let url = self.document_url(serial);
        tracing::info!("Fetching patches from {}", url);

        let response = self.client.get(&url).send().map_err(|e| PatchError::Fetch {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(PatchError::NotFound(url));
        }
        if !status.is_success() {
            return Err(PatchError::Fetch {
                url,
                reason: format!("HTTP status {}", status.as_u16()),
            });
        }

        response.text().map_err(|e| PatchError::Fetch {
            url,
            reason: format!("failed to read response body: {}", e),
        })
    }
}

/// Pick a repository implementation for a URL
///
/// `http://` and `https://` go over the network; `file://` URLs and plain
/// paths are read from disk.
pub fn repository_for_url(
    name: &str,
    url: &str,
    timeout: Duration,
) -> Result<Box<dyn PatchSource>, PatchError> {
    let url = url.trim();
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(Box::new(HttpRepository::new(name, url, timeout)?));
    }
    let path = url.strip_prefix("file://").unwrap_or(url);
    if path.is_empty() {
        return Err(PatchError::Fetch {
            url: url.to_string(),
            reason: "empty repository location".to_string(),
        });
    }
    Ok(Box::new(LocalRepository::new(name, path)))
}
