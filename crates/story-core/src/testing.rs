//! In-memory backend for unit tests.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::backend::{
    BackendError, BranchInfo, CommitInfo, FileContent, HistoryPage, RepositoryBackend,
    RepositoryStatus, SaveReceipt, TreeEntry,
};
use crate::locks::types::Lock;

#[derive(Default)]
pub struct FakeBackend {
    files: Mutex<BTreeMap<String, FileContent>>,
    fetches: AtomicUsize,
    commits: AtomicUsize,
    failing: AtomicBool,
}

impl FakeBackend {
    pub fn with_file(path: &str, content: &str, commit: &str) -> Self {
        let backend = Self::default();
        backend.set_file(path, content, commit);
        backend
    }

    pub fn set_file(&self, path: &str, content: &str, commit: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), FileContent::new(content, Some(commit)));
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of backend reads served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn read(&self) -> Result<(), BackendError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.check()
    }

    fn check(&self) -> Result<(), BackendError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(BackendError::Transport("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RepositoryBackend for FakeBackend {
    async fn fetch_tree(&self, _project_id: &str, _path: &str) -> Result<Vec<TreeEntry>, BackendError> {
        self.read()?;
        Ok(self
            .files
            .lock()
            .unwrap()
            .keys()
            .map(|path| TreeEntry {
                path: path.clone(),
                name: path.rsplit('/').next().unwrap_or(path).to_string(),
                entry_type: "file".into(),
                size: None,
            })
            .collect())
    }

    async fn fetch_file_content(
        &self,
        _project_id: &str,
        path: &str,
    ) -> Result<FileContent, BackendError> {
        self.read()?;
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(path.to_string()))
    }

    async fn fetch_file_history(
        &self,
        _project_id: &str,
        path: &str,
        page: HistoryPage,
    ) -> Result<Vec<CommitInfo>, BackendError> {
        self.read()?;
        let files = self.files.lock().unwrap();
        let file = files
            .get(path)
            .ok_or_else(|| BackendError::NotFound(path.to_string()))?;
        Ok(file
            .last_commit
            .iter()
            .skip(page.skip as usize)
            .take(page.limit as usize)
            .map(|hash| CommitInfo {
                hash: hash.clone(),
                author: "alice".into(),
                message: format!("update {path}"),
                date: None,
            })
            .collect())
    }

    async fn fetch_status(&self, _project_id: &str) -> Result<RepositoryStatus, BackendError> {
        self.read()?;
        Ok(RepositoryStatus::default())
    }

    async fn fetch_branches(&self, _project_id: &str) -> Result<Vec<BranchInfo>, BackendError> {
        self.read()?;
        Ok(vec![BranchInfo {
            name: "main".into(),
            current: true,
        }])
    }

    async fn save_file(
        &self,
        _project_id: &str,
        path: &str,
        content: &str,
        _message: &str,
    ) -> Result<SaveReceipt, BackendError> {
        self.check()?;
        let n = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
        let hash = format!("local-{n}");
        self.set_file(path, content, &hash);
        Ok(SaveReceipt {
            commit_hash: Some(hash),
        })
    }

    async fn put_lock(&self, _project_id: &str, _lock: &Lock) -> Result<(), BackendError> {
        self.check()
    }

    async fn delete_lock(&self, _project_id: &str, _component_id: &str) -> Result<(), BackendError> {
        self.check()
    }
}
