//! Notebook and file resources over the server's Contents API.
//!
//! Every model returned carries a revision tag, its `last_modified` time.
//! The server's `ETag` is a hash of each response body, so a metadata-only
//! fetch and a full fetch of the same file never agree on it; it is not
//! used. A save that names the revision it was based on is refused with
//! [`Error::Conflict`] when the server copy has moved on, and nothing is
//! written.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info, warn};
use reqwest::{Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::server_connection::{expect_status, read_json, ServerConnection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Notebook,
    File,
    Directory,
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentKind::Notebook => write!(f, "notebook"),
            ContentKind::File => write!(f, "file"),
            ContentKind::Directory => write!(f, "directory"),
        }
    }
}

/// A contents model as returned by `GET /api/contents/{path}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: ContentKind,
    #[serde(default)]
    pub writable: bool,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mimetype: Option<String>,
    /// `json`, `text` or `base64`; `None` when the content was not requested.
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub size: Option<u64>,
    /// Revision tag to pass back to [`ContentsManager::save`]. Derived from
    /// `last_modified`.
    #[serde(skip)]
    pub revision: Option<String>,
}

/// Body of a save.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentBody {
    #[serde(rename = "type")]
    pub kind: ContentKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    pub content: Value,
}

impl ContentBody {
    pub fn notebook(notebook: Value) -> Self {
        Self {
            kind: ContentKind::Notebook,
            format: Some("json".to_string()),
            content: notebook,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: ContentKind::File,
            format: Some("text".to_string()),
            content: Value::String(text.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetOptions {
    /// Include the body. `false` fetches metadata only.
    pub content: bool,
    pub kind: Option<ContentKind>,
    pub format: Option<String>,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            content: true,
            kind: None,
            format: None,
        }
    }
}

impl GetOptions {
    pub fn metadata_only() -> Self {
        Self {
            content: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub last_modified: DateTime<Utc>,
}

/// Change notifications for resources modified through this manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentsChange {
    Created { path: String },
    Saved { path: String, revision: Option<String> },
    Renamed { from: String, to: String },
    Deleted { path: String },
}

pub struct ContentsManager {
    server: Arc<ServerConnection>,
    events: broadcast::Sender<ContentsChange>,
}

impl ContentsManager {
    pub fn new(server: Arc<ServerConnection>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self { server, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContentsChange> {
        self.events.subscribe()
    }

    pub async fn get(&self, path: &str, options: &GetOptions) -> Result<Content> {
        let mut url = self.contents_url(path)?;
        {
            let mut query = url.query_pairs_mut();
            if !options.content {
                query.append_pair("content", "0");
            }
            if let Some(kind) = options.kind {
                query.append_pair("type", &kind.to_string());
            }
            if let Some(format) = &options.format {
                query.append_pair("format", format);
            }
        }
        let response = self.server.fetch::<()>(Method::GET, url, None).await?;
        let response = ok_or_not_found(response, path, &[StatusCode::OK]).await?;
        read_content(response).await
    }

    /// Current revision tag of `path`, without fetching the body.
    pub async fn revision(&self, path: &str) -> Result<Option<String>> {
        Ok(self.get(path, &GetOptions::metadata_only()).await?.revision)
    }

    /// Write `body` to `path`. With `revision`, the write only happens if
    /// the server copy still has that revision.
    pub async fn save(
        &self,
        path: &str,
        body: &ContentBody,
        revision: Option<&str>,
    ) -> Result<Content> {
        if let Some(expected) = revision {
            let actual = match self.revision(path).await {
                Ok(actual) => actual,
                Err(Error::NotFound(_)) => Some("<deleted>".to_string()),
                Err(e) => return Err(e),
            };
            match actual {
                Some(actual) if actual != expected => {
                    warn!(
                        "[contents] Not saving {}: based on {}, server has {}",
                        path, expected, actual
                    );
                    return Err(Error::Conflict {
                        path: path.to_string(),
                        expected: expected.to_string(),
                        actual,
                    });
                }
                Some(_) => {}
                None => debug!("[contents] {} has no revision tag to compare", path),
            }
        }

        let url = self.contents_url(path)?;
        let response = self.server.fetch(Method::PUT, url, Some(body)).await?;
        let response = expect_status(response, &[StatusCode::OK, StatusCode::CREATED]).await?;
        let saved = read_content(response).await?;

        info!("[contents] Saved {}", saved.path);
        self.emit(ContentsChange::Saved {
            path: saved.path.clone(),
            revision: saved.revision.clone(),
        });
        Ok(saved)
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<Content> {
        let url = self.contents_url(from)?;
        let response = self
            .server
            .fetch(Method::PATCH, url, Some(&json!({ "path": to })))
            .await?;
        let response = ok_or_not_found(response, from, &[StatusCode::OK]).await?;
        let renamed = read_content(response).await?;

        info!("[contents] Renamed {} to {}", from, renamed.path);
        self.emit(ContentsChange::Renamed {
            from: from.to_string(),
            to: renamed.path.clone(),
        });
        Ok(renamed)
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        let url = self.contents_url(path)?;
        let response = self.server.fetch::<()>(Method::DELETE, url, None).await?;
        ok_or_not_found(response, path, &[StatusCode::NO_CONTENT]).await?;

        info!("[contents] Deleted {}", path);
        self.emit(ContentsChange::Deleted {
            path: path.to_string(),
        });
        Ok(())
    }

    /// Create `Untitled…` in `dir`. The server picks the name.
    pub async fn new_untitled(
        &self,
        dir: &str,
        kind: ContentKind,
        ext: Option<&str>,
    ) -> Result<Content> {
        let mut body = json!({ "type": kind });
        if let Some(ext) = ext {
            body["ext"] = Value::String(ext.to_string());
        }
        self.create_in(dir, &body).await
    }

    /// Copy `from` into `to_dir`, as `name-Copy1.ext` and so on.
    pub async fn copy(&self, from: &str, to_dir: &str) -> Result<Content> {
        self.create_in(to_dir, &json!({ "copy_from": from })).await
    }

    pub async fn create_checkpoint(&self, path: &str) -> Result<Checkpoint> {
        let url = self.checkpoints_url(path, None)?;
        let response = self.server.fetch::<()>(Method::POST, url, None).await?;
        let response = ok_or_not_found(response, path, &[StatusCode::CREATED]).await?;
        let checkpoint: Checkpoint = read_json(response).await?;
        debug!("[contents] Checkpoint {} for {}", checkpoint.id, path);
        Ok(checkpoint)
    }

    pub async fn list_checkpoints(&self, path: &str) -> Result<Vec<Checkpoint>> {
        let url = self.checkpoints_url(path, None)?;
        let response = self.server.fetch::<()>(Method::GET, url, None).await?;
        let response = ok_or_not_found(response, path, &[StatusCode::OK]).await?;
        read_json(response).await
    }

    pub async fn restore_checkpoint(&self, path: &str, checkpoint_id: &str) -> Result<()> {
        let url = self.checkpoints_url(path, Some(checkpoint_id))?;
        let response = self.server.fetch::<()>(Method::POST, url, None).await?;
        ok_or_not_found(response, path, &[StatusCode::NO_CONTENT]).await?;
        info!("[contents] Restored {} to checkpoint {}", path, checkpoint_id);
        self.emit(ContentsChange::Saved {
            path: path.to_string(),
            revision: None,
        });
        Ok(())
    }

    pub async fn delete_checkpoint(&self, path: &str, checkpoint_id: &str) -> Result<()> {
        let url = self.checkpoints_url(path, Some(checkpoint_id))?;
        let response = self.server.fetch::<()>(Method::DELETE, url, None).await?;
        ok_or_not_found(response, path, &[StatusCode::NO_CONTENT]).await?;
        Ok(())
    }

    async fn create_in(&self, dir: &str, body: &Value) -> Result<Content> {
        let url = self.contents_url(dir)?;
        let response = self.server.fetch(Method::POST, url, Some(body)).await?;
        let response = ok_or_not_found(response, dir, &[StatusCode::CREATED]).await?;
        let created = read_content(response).await?;

        info!("[contents] Created {}", created.path);
        self.emit(ContentsChange::Created {
            path: created.path.clone(),
        });
        Ok(created)
    }

    fn contents_url(&self, path: &str) -> Result<url::Url> {
        self.server.build_url(&format!("api/contents/{}", path))
    }

    fn checkpoints_url(&self, path: &str, checkpoint_id: Option<&str>) -> Result<url::Url> {
        match checkpoint_id {
            Some(id) => self
                .server
                .build_url(&format!("api/contents/{}/checkpoints/{}", path, id)),
            None => self
                .server
                .build_url(&format!("api/contents/{}/checkpoints", path)),
        }
    }

    fn emit(&self, change: ContentsChange) {
        let _ = self.events.send(change);
    }
}

async fn ok_or_not_found(
    response: Response,
    path: &str,
    expected: &[StatusCode],
) -> Result<Response> {
    if response.status() == StatusCode::NOT_FOUND {
        return Err(Error::NotFound(path.to_string()));
    }
    expect_status(response, expected).await
}

async fn read_content(response: Response) -> Result<Content> {
    let mut content: Content = read_json(response).await?;
    content.revision = revision_tag(&content);
    Ok(content)
}

fn revision_tag(content: &Content) -> Option<String> {
    content
        .last_modified
        .map(|modified| modified.to_rfc3339_opts(SecondsFormat::Micros, true))
}
