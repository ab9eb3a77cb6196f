//! Read-through cache of repository resources.

use std::sync::Arc;
use tracing::debug;

use crate::backend::{
    BackendError, BranchInfo, CachedResource, CommitInfo, FileContent, HistoryPage,
    RepositoryBackend, RepositoryStatus, TreeEntry,
};
use crate::cache::{CacheCategory, CacheConfig, CacheKey, CacheStore, Clock, KeyPrefix, SystemClock};

/// [`CacheStore`] specialised to repository data, with per-category TTLs
/// and fetch-on-miss reads.
pub struct RepositoryCache {
    store: CacheStore<CachedResource>,
    config: CacheConfig,
}

impl RepositoryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: CacheStore::new(clock, config.capacity),
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &CacheStore<CachedResource> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut CacheStore<CachedResource> {
        &mut self.store
    }

    fn put(&mut self, key: CacheKey, value: CachedResource) {
        let ttl = self.config.ttl_for(key.category);
        self.store.set(key, value, ttl);
    }

    pub fn cached_file_content(&mut self, project_id: &str, path: &str) -> Option<FileContent> {
        match self
            .store
            .get(&CacheKey::file(project_id, CacheCategory::FileContent, path))
        {
            Some(CachedResource::FileContent(content)) => Some(content),
            _ => None,
        }
    }

    pub fn put_file_content(&mut self, project_id: &str, path: &str, content: FileContent) {
        self.put(
            CacheKey::file(project_id, CacheCategory::FileContent, path),
            CachedResource::FileContent(content),
        );
    }

    /// File content, fetched and cached on a miss.
    pub async fn file_content(
        &mut self,
        backend: &dyn RepositoryBackend,
        project_id: &str,
        path: &str,
    ) -> Result<FileContent, BackendError> {
        if let Some(content) = self.cached_file_content(project_id, path) {
            return Ok(content);
        }
        debug!("Cache miss for {}:{}", project_id, path);
        let content = backend.fetch_file_content(project_id, path).await?;
        self.put_file_content(project_id, path, content.clone());
        Ok(content)
    }

    /// One page of a file's history. A cached page other than `page` is a miss.
    pub async fn file_history(
        &mut self,
        backend: &dyn RepositoryBackend,
        project_id: &str,
        path: &str,
        page: HistoryPage,
    ) -> Result<Vec<CommitInfo>, BackendError> {
        let key = CacheKey::file(project_id, CacheCategory::FileHistory, path);
        if let Some(CachedResource::History {
            page: cached,
            commits,
        }) = self.store.get(&key)
        {
            if cached == page {
                return Ok(commits);
            }
        }
        let commits = backend.fetch_file_history(project_id, path, page).await?;
        self.put(
            key,
            CachedResource::History {
                page,
                commits: commits.clone(),
            },
        );
        Ok(commits)
    }

    pub async fn project_tree(
        &mut self,
        backend: &dyn RepositoryBackend,
        project_id: &str,
    ) -> Result<Vec<TreeEntry>, BackendError> {
        let key = CacheKey::project(project_id, CacheCategory::ProjectTree);
        if let Some(CachedResource::Tree(entries)) = self.store.get(&key) {
            return Ok(entries);
        }
        let entries = backend.fetch_tree(project_id, "").await?;
        self.put(key, CachedResource::Tree(entries.clone()));
        Ok(entries)
    }

    pub async fn repository_status(
        &mut self,
        backend: &dyn RepositoryBackend,
        project_id: &str,
    ) -> Result<RepositoryStatus, BackendError> {
        let key = CacheKey::project(project_id, CacheCategory::RepositoryStatus);
        if let Some(CachedResource::Status(status)) = self.store.get(&key) {
            return Ok(status);
        }
        let status = backend.fetch_status(project_id).await?;
        self.put(key, CachedResource::Status(status.clone()));
        Ok(status)
    }

    pub async fn branches(
        &mut self,
        backend: &dyn RepositoryBackend,
        project_id: &str,
    ) -> Result<Vec<BranchInfo>, BackendError> {
        let key = CacheKey::project(project_id, CacheCategory::ProjectBranches);
        if let Some(CachedResource::Branches(branches)) = self.store.get(&key) {
            return Ok(branches);
        }
        let branches = backend.fetch_branches(project_id).await?;
        self.put(key, CachedResource::Branches(branches.clone()));
        Ok(branches)
    }

    /// Drop the content and history entries of one file.
    pub fn invalidate_file(&mut self, project_id: &str, path: &str) -> usize {
        [CacheCategory::FileContent, CacheCategory::FileHistory]
            .into_iter()
            .filter(|category| self.store.invalidate(&CacheKey::file(project_id, *category, path)))
            .count()
    }

    /// Drop whole categories of a project.
    pub fn invalidate_project_views(&mut self, project_id: &str, categories: &[CacheCategory]) -> usize {
        categories
            .iter()
            .map(|category| {
                self.store
                    .invalidate_prefix(&KeyPrefix::category(project_id, *category))
            })
            .sum()
    }

    /// Drop everything cached for a project.
    pub fn invalidate_project(&mut self, project_id: &str) -> usize {
        self.store.invalidate_prefix(&KeyPrefix::project(project_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use crate::testing::FakeBackend;
    use std::time::Duration;

    fn cache() -> (RepositoryCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (
            RepositoryCache::with_clock(CacheConfig::default(), clock.clone()),
            clock,
        )
    }

    // ==================== Read-through ====================

    #[tokio::test]
    async fn test_file_content_fetches_once_then_hits() {
        let backend = FakeBackend::with_file("a.md", "hello", "c1");
        let (mut cache, _clock) = cache();

        let first = cache.file_content(&backend, "p1", "a.md").await.unwrap();
        let second = cache.file_content(&backend, "p1", "a.md").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.last_commit.as_deref(), Some("c1"));
        assert_eq!(backend.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_expired_content_is_refetched() {
        let backend = FakeBackend::with_file("a.md", "hello", "c1");
        let (mut cache, clock) = cache();

        cache.file_content(&backend, "p1", "a.md").await.unwrap();
        clock.advance(Duration::from_secs(5 * 60));
        cache.file_content(&backend, "p1", "a.md").await.unwrap();

        assert_eq!(backend.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_status_ttl_is_shorter_than_tree_ttl() {
        let backend = FakeBackend::default();
        let (mut cache, clock) = cache();

        cache.repository_status(&backend, "p1").await.unwrap();
        cache.project_tree(&backend, "p1").await.unwrap();
        clock.advance(Duration::from_secs(31));
        cache.repository_status(&backend, "p1").await.unwrap();
        cache.project_tree(&backend, "p1").await.unwrap();

        assert_eq!(backend.fetch_count(), 3);
    }

    #[tokio::test]
    async fn test_history_page_mismatch_is_a_miss() {
        let backend = FakeBackend::with_file("a.md", "hello", "c1");
        let (mut cache, _clock) = cache();

        cache
            .file_history(&backend, "p1", "a.md", HistoryPage::default())
            .await
            .unwrap();
        cache
            .file_history(&backend, "p1", "a.md", HistoryPage::default())
            .await
            .unwrap();
        let later = cache
            .file_history(&backend, "p1", "a.md", HistoryPage { limit: 10, skip: 10 })
            .await
            .unwrap();

        assert!(later.is_empty());
        assert_eq!(backend.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_fetch_failure_caches_nothing() {
        let backend = FakeBackend::with_file("a.md", "hello", "c1");
        backend.set_failing(true);
        let (mut cache, _clock) = cache();

        assert!(cache.file_content(&backend, "p1", "a.md").await.is_err());
        assert!(cache.cached_file_content("p1", "a.md").is_none());
    }

    // ==================== Invalidation ====================

    #[tokio::test]
    async fn test_invalidate_file_drops_content_and_history() {
        let backend = FakeBackend::with_file("a.md", "hello", "c1");
        let (mut cache, _clock) = cache();
        cache.file_content(&backend, "p1", "a.md").await.unwrap();
        cache
            .file_history(&backend, "p1", "a.md", HistoryPage::default())
            .await
            .unwrap();
        cache.branches(&backend, "p1").await.unwrap();

        assert_eq!(cache.invalidate_file("p1", "a.md"), 2);
        assert_eq!(cache.invalidate_file("p1", "a.md"), 0);
        assert_eq!(cache.store().len(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_project_views_and_project() {
        let backend = FakeBackend::with_file("a.md", "hello", "c1");
        let (mut cache, _clock) = cache();
        cache.file_content(&backend, "p1", "a.md").await.unwrap();
        cache.project_tree(&backend, "p1").await.unwrap();
        cache.repository_status(&backend, "p1").await.unwrap();
        cache.project_tree(&backend, "p2").await.unwrap();

        let removed = cache.invalidate_project_views(
            "p1",
            &[CacheCategory::ProjectTree, CacheCategory::RepositoryStatus],
        );
        assert_eq!(removed, 2);
        assert!(cache.cached_file_content("p1", "a.md").is_some());

        assert_eq!(cache.invalidate_project("p1"), 1);
        assert_eq!(cache.store().len(), 1);
    }
}
