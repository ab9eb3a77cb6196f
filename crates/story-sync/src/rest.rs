//! REST implementation of [`RepositoryBackend`].
//!
//! Routes:
//! - `GET  /api/git/content/{project}/{path}`
//! - `GET  /api/git/tree/{project}?path=`
//! - `GET  /api/git/history/{project}/{path}?limit=&skip=`
//! - `GET  /api/git/status/{project}`
//! - `GET  /api/git/branches/{project}`
//! - `PUT  /api/git/files/{project}/{path}` (falls back to `POST /api/git/files/{project}` for new files)
//! - `POST /api/git/commit/{project}`
//! - `PUT  /api/projects/{project}/locks/{component}`
//! - `POST /api/projects/{project}/locks/bulk` (unlock)

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use story_core::{
    BackendError, BranchInfo, CommitInfo, FileContent, HistoryPage, Lock, RepositoryBackend,
    RepositoryStatus, SaveReceipt, TreeEntry,
};
use tracing::{debug, warn};
use url::Url;

use crate::config::SyncConfig;

pub struct HttpBackend {
    client: Client,
    api_url: Url,
    token: String,
}

#[derive(Deserialize)]
struct ContentResponse {
    content: String,
    #[serde(default)]
    last_commit: Option<LastCommit>,
}

/// The server reports the last commit either as a bare hash or as an object.
#[derive(Deserialize)]
#[serde(untagged)]
enum LastCommit {
    Hash(String),
    Commit { sha: String },
}

impl From<ContentResponse> for FileContent {
    fn from(response: ContentResponse) -> Self {
        let last_commit = response.last_commit.map(|commit| match commit {
            LastCommit::Hash(hash) => hash,
            LastCommit::Commit { sha } => sha,
        });
        FileContent {
            content: response.content,
            last_commit,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HistoryResponse {
    Wrapped { history: Vec<HistoryEntry> },
    Bare(Vec<HistoryEntry>),
}

#[derive(Deserialize)]
struct HistoryEntry {
    sha: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    timestamp: Option<String>,
}

impl HistoryResponse {
    fn into_commits(self) -> Vec<CommitInfo> {
        let entries = match self {
            HistoryResponse::Wrapped { history } => history,
            HistoryResponse::Bare(entries) => entries,
        };
        entries
            .into_iter()
            .map(|entry| CommitInfo {
                hash: entry.sha,
                author: entry.author,
                message: entry.message,
                date: entry.timestamp,
            })
            .collect()
    }
}

#[derive(Serialize)]
struct CommitRequest<'a> {
    message: &'a str,
    files: [&'a str; 1],
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: String,
}

impl HttpBackend {
    pub fn new(api_url: Url, token: impl Into<String>) -> Result<Self, BackendError> {
        if api_url.cannot_be_a_base() {
            return Err(BackendError::Transport(format!(
                "{api_url} cannot be used as a base URL"
            )));
        }
        let client = Client::builder()
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            api_url,
            token: token.into(),
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, BackendError> {
        Self::new(config.api_url.clone(), config.token.clone())
    }

    /// `api_url` + `segments`, with `path` appended one segment per
    /// `/`-separated component.
    fn endpoint(&self, segments: &[&str], path: Option<&str>) -> Url {
        let mut url = self.api_url.clone();
        if let Ok(mut parts) = url.path_segments_mut() {
            parts.pop_if_empty().extend(segments);
            if let Some(path) = path {
                parts.extend(path.split('/').filter(|part| !part.is_empty()));
            }
        }
        url
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, BackendError> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let url = response.url().path().to_string();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|error| error.detail)
            .unwrap_or(body);
        debug!("{} {} -> {}", status, url, message);

        if status == StatusCode::NOT_FOUND {
            Err(BackendError::NotFound(url))
        } else {
            Err(BackendError::Rejected {
                status: status.as_u16(),
                message,
            })
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, BackendError> {
        self.execute(request)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RepositoryBackend for HttpBackend {
    async fn fetch_tree(&self, project_id: &str, path: &str) -> Result<Vec<TreeEntry>, BackendError> {
        let mut request = self
            .client
            .get(self.endpoint(&["api", "git", "tree", project_id], None));
        if !path.is_empty() {
            request = request.query(&[("path", path)]);
        }
        self.get_json(request).await
    }

    async fn fetch_file_content(
        &self,
        project_id: &str,
        path: &str,
    ) -> Result<FileContent, BackendError> {
        let url = self.endpoint(&["api", "git", "content", project_id], Some(path));
        let response: ContentResponse = self.get_json(self.client.get(url)).await?;
        Ok(response.into())
    }

    async fn fetch_file_history(
        &self,
        project_id: &str,
        path: &str,
        page: HistoryPage,
    ) -> Result<Vec<CommitInfo>, BackendError> {
        let url = self.endpoint(&["api", "git", "history", project_id], Some(path));
        let request = self
            .client
            .get(url)
            .query(&[("limit", page.limit), ("skip", page.skip)]);
        let response: HistoryResponse = self.get_json(request).await?;
        Ok(response.into_commits())
    }

    async fn fetch_status(&self, project_id: &str) -> Result<RepositoryStatus, BackendError> {
        let url = self.endpoint(&["api", "git", "status", project_id], None);
        self.get_json(self.client.get(url)).await
    }

    async fn fetch_branches(&self, project_id: &str) -> Result<Vec<BranchInfo>, BackendError> {
        let url = self.endpoint(&["api", "git", "branches", project_id], None);
        self.get_json(self.client.get(url)).await
    }

    async fn save_file(
        &self,
        project_id: &str,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<SaveReceipt, BackendError> {
        let update = self
            .client
            .put(self.endpoint(&["api", "git", "files", project_id], Some(path)))
            .json(&json!({ "content": content }));

        match self.execute(update).await {
            Ok(_) => {}
            Err(BackendError::NotFound(_)) => {
                debug!("{} does not exist yet; creating it", path);
                let create = self
                    .client
                    .post(self.endpoint(&["api", "git", "files", project_id], None))
                    .json(&json!({ "path": path, "content": content }));
                self.execute(create).await?;
            }
            Err(e) => return Err(e),
        }

        let commit = self
            .client
            .post(self.endpoint(&["api", "git", "commit", project_id], None))
            .json(&CommitRequest {
                message,
                files: [path],
            });
        let receipt: SaveReceipt = self.get_json(commit).await?;
        if receipt.commit_hash.is_none() {
            warn!("Commit of {} returned no hash", path);
        }
        Ok(receipt)
    }

    async fn put_lock(&self, project_id: &str, lock: &Lock) -> Result<(), BackendError> {
        let url = self.endpoint(
            &["api", "projects", project_id, "locks", lock.component_id.as_str()],
            None,
        );
        self.execute(self.client.put(url).json(lock)).await?;
        Ok(())
    }

    async fn delete_lock(&self, project_id: &str, component_id: &str) -> Result<(), BackendError> {
        let url = self.endpoint(&["api", "projects", project_id, "locks", "bulk"], None);
        let body = json!({
            "operations": [{
                "type": "unlock",
                "componentIds": [component_id],
                "reason": "released",
            }]
        });
        self.execute(self.client.post(url).json(&body)).await?;
        Ok(())
    }
}
