//! Repository backend seam and the resources it serves.
//!
//! The REST implementation lives in `story-sync`; tests use in-memory fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::locks::types::Lock;

/// File content as served by the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    pub content: String,
    /// Commit that last touched the file, used as its version marker.
    #[serde(default)]
    pub last_commit: Option<String>,
}

impl FileContent {
    pub fn new(content: impl Into<String>, last_commit: Option<&str>) -> Self {
        Self {
            content: content.into(),
            last_commit: last_commit.map(str::to_string),
        }
    }
}

/// One entry of a file's commit history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub hash: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub date: Option<String>,
}

/// `limit`/`skip` pagination for history reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HistoryPage {
    pub limit: u32,
    pub skip: u32,
}

impl Default for HistoryPage {
    fn default() -> Self {
        Self { limit: 10, skip: 0 }
    }
}

/// Entry of the project directory tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    #[serde(default)]
    pub name: String,
    /// `"file"` or `"directory"` as reported by the server.
    #[serde(rename = "type", default)]
    pub entry_type: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Working tree status of the project repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryStatus {
    pub modified: Vec<String>,
    pub added: Vec<String>,
    pub deleted: Vec<String>,
    pub renamed: Vec<String>,
    pub untracked: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    pub name: String,
    #[serde(default)]
    pub current: bool,
}

/// Result of writing and committing a file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveReceipt {
    #[serde(default)]
    pub commit_hash: Option<String>,
}

/// Anything the repository cache can hold.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedResource {
    FileContent(FileContent),
    History {
        page: HistoryPage,
        commits: Vec<CommitInfo>,
    },
    Tree(Vec<TreeEntry>),
    Status(RepositoryStatus),
    Branches(Vec<BranchInfo>),
}

/// Failures talking to the repository backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid response: {0}")]
    Decode(String),
}

/// REST surface consumed by the sync engine.
#[async_trait]
pub trait RepositoryBackend: Send + Sync {
    async fn fetch_tree(&self, project_id: &str, path: &str) -> Result<Vec<TreeEntry>, BackendError>;

    async fn fetch_file_content(
        &self,
        project_id: &str,
        path: &str,
    ) -> Result<FileContent, BackendError>;

    async fn fetch_file_history(
        &self,
        project_id: &str,
        path: &str,
        page: HistoryPage,
    ) -> Result<Vec<CommitInfo>, BackendError>;

    async fn fetch_status(&self, project_id: &str) -> Result<RepositoryStatus, BackendError>;

    async fn fetch_branches(&self, project_id: &str) -> Result<Vec<BranchInfo>, BackendError>;

    /// Write `content` to `path` and commit it.
    async fn save_file(
        &self,
        project_id: &str,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<SaveReceipt, BackendError>;

    async fn put_lock(&self, project_id: &str, lock: &Lock) -> Result<(), BackendError>;

    async fn delete_lock(&self, project_id: &str, component_id: &str) -> Result<(), BackendError>;
}
