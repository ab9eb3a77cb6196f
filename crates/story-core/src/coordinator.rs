//! Push-message orchestration.
//!
//! [`SyncCoordinator`] turns one inbound [`PushMessage`] into cache
//! invalidations, overlay reconciliation and lock-table updates, and reports
//! everything the caller has to act on as a [`SyncOutcome`]: events for the
//! collaborator layer, refetches to run, frames to send back.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, FileContent};
use crate::cache::{CacheCategory, CacheConfig, Clock, SystemClock};
use crate::events::{Notification, SyncEvent};
use crate::locks::LockManager;
use crate::locks::types::{Lock, LockConflict};
use crate::message::{GitUpdate, OutboundFrame, PushMessage};
use crate::overlay::{
    InvalidationOutcome, OptimisticContentStore, OverlayError, ReconcileChoice, RefetchOutcome,
    RefetchTicket,
};
use crate::repo::RepositoryCache;

/// State owned by one project session. Built when the session starts and
/// torn down with it.
pub struct SyncContext {
    pub cache: RepositoryCache,
    pub locks: LockManager,
    pub overlays: OptimisticContentStore,
}

impl SyncContext {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache: RepositoryCache::with_clock(config, clock),
            locks: LockManager::new(),
            overlays: OptimisticContentStore::new(),
        }
    }

    /// Drop everything held for `project_id`.
    pub fn teardown(&mut self, project_id: &str) {
        let closed = self.overlays.close_project(project_id);
        let dropped = self.cache.invalidate_project(project_id);
        self.locks.clear();
        debug!(
            "Tore down {}: {} overlays closed, {} cache entries dropped",
            project_id, closed, dropped
        );
    }
}

/// Work produced by handling one message.
#[derive(Debug, Default, PartialEq)]
pub struct SyncOutcome {
    pub events: Vec<SyncEvent>,
    pub refetches: Vec<RefetchTicket>,
    pub outbound: Vec<OutboundFrame>,
}

impl SyncOutcome {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.refetches.is_empty() && self.outbound.is_empty()
    }
}

pub struct SyncCoordinator {
    project_id: String,
    context: SyncContext,
}

impl SyncCoordinator {
    pub fn new(project_id: impl Into<String>, context: SyncContext) -> Self {
        Self {
            project_id: project_id.into(),
            context,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn context(&self) -> &SyncContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut SyncContext {
        &mut self.context
    }

    pub fn into_context(self) -> SyncContext {
        self.context
    }

    /// Apply one push. Messages for other projects are ignored.
    pub fn handle(&mut self, message: &PushMessage) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();
        if let Some(project_id) = message.project_id() {
            if project_id != self.project_id {
                debug!(
                    "Ignoring {} for project {} (following {})",
                    message.topic(),
                    project_id,
                    self.project_id
                );
                return outcome;
            }
        }

        match message {
            PushMessage::GitUpdate(update) => self.on_git_update(update, &mut outcome),
            PushMessage::FileChanged(change) => {
                let project_id = self.project_id.clone();
                self.context.cache.invalidate_file(&project_id, &change.file_path);
                self.route_invalidation(&change.file_path, None, &mut outcome);
            }
            PushMessage::BranchChanged(change) => {
                debug!(
                    "Branch {} {}",
                    change.branch_name.as_deref().unwrap_or("?"),
                    change.operation.as_deref().unwrap_or("changed")
                );
                let project_id = self.project_id.clone();
                self.context.cache.invalidate_project_views(
                    &project_id,
                    &[
                        CacheCategory::ProjectBranches,
                        CacheCategory::RepositoryStatus,
                        CacheCategory::ProjectTree,
                    ],
                );
            }
            PushMessage::LockUpdated {
                component_id, lock, ..
            } => {
                self.context.locks.apply_remote(component_id, lock.clone());
                outcome.events.push(SyncEvent::LockChanged {
                    component_id: component_id.clone(),
                    lock: lock.clone(),
                });
            }
            PushMessage::LocksBulkUpdated {
                affected_components,
                ..
            } => {
                debug!(
                    "{} locks changed in bulk, requesting snapshot",
                    affected_components.len()
                );
                outcome.outbound.push(OutboundFrame::sync_request(&self.project_id));
            }
            PushMessage::ConflictResolved { conflict_id, .. } => {
                if self.context.locks.forget_conflict(conflict_id).is_some() {
                    outcome.events.push(SyncEvent::ConflictResolved {
                        conflict_id: conflict_id.clone(),
                    });
                }
            }
            PushMessage::SyncSnapshot {
                locks, conflicts, ..
            } => self.on_snapshot(locks, conflicts, &mut outcome),
            PushMessage::Subscribed { status, .. } => {
                info!("Subscribed to {} ({})", self.project_id, status);
                outcome.outbound.push(OutboundFrame::sync_request(&self.project_id));
            }
            PushMessage::TokenRefresh { .. } => {}
            PushMessage::ServerError { message, code } => {
                warn!("Server error {:?}: {}", code, message);
                outcome
                    .events
                    .push(SyncEvent::Notification(Notification::warning(match code {
                        Some(code) => format!("Server error ({code}): {message}"),
                        None => format!("Server error: {message}"),
                    })));
            }
        }
        outcome
    }

    fn on_git_update(&mut self, update: &GitUpdate, outcome: &mut SyncOutcome) {
        let project_id = self.project_id.clone();
        let mut seen = HashSet::new();
        let files: Vec<&String> = update
            .updated_files()
            .iter()
            .filter(|path| seen.insert(path.as_str()))
            .collect();

        let cache = &mut self.context.cache;
        if files.is_empty() {
            cache.invalidate_project_views(
                &project_id,
                &[CacheCategory::ProjectTree, CacheCategory::RepositoryStatus],
            );
        } else {
            for path in &files {
                cache.invalidate_file(&project_id, path);
            }
            cache.invalidate_project_views(
                &project_id,
                &[
                    CacheCategory::RepositoryStatus,
                    CacheCategory::ProjectTree,
                    CacheCategory::ProjectBranches,
                ],
            );
            for path in &files {
                self.route_invalidation(path, update.commit_hash.as_deref(), outcome);
            }
        }

        info!(
            "git_update on {} ({}): {} files",
            project_id,
            update.operation.as_deref().unwrap_or("unknown operation"),
            files.len()
        );
        outcome
            .events
            .push(SyncEvent::Notification(Notification::project_updated(files.len())));
    }

    fn on_snapshot(
        &mut self,
        locks: &BTreeMap<String, Lock>,
        conflicts: &[LockConflict],
        outcome: &mut SyncOutcome,
    ) {
        let before: BTreeMap<String, Lock> = self
            .context
            .locks
            .locks()
            .map(|lock| (lock.component_id.clone(), lock.clone()))
            .collect();

        self.context.locks.replace_all(
            locks.iter().map(|(component_id, lock)| Lock {
                component_id: component_id.clone(),
                ..lock.clone()
            }),
            conflicts.iter().cloned(),
        );

        let touched: std::collections::BTreeSet<&String> = before.keys().chain(locks.keys()).collect();
        for component_id in touched {
            let now = self.context.locks.lock(component_id);
            if before.get(component_id) != now {
                outcome.events.push(SyncEvent::LockChanged {
                    component_id: component_id.clone(),
                    lock: now.cloned(),
                });
            }
        }
        outcome
            .events
            .extend(
                conflicts
                    .iter()
                    .cloned()
                    .map(|conflict| SyncEvent::LockConflict { conflict }),
            );
    }

    fn route_invalidation(&mut self, path: &str, version: Option<&str>, outcome: &mut SyncOutcome) {
        let context = &mut self.context;
        match context
            .overlays
            .on_remote_invalidation(&mut context.cache, &self.project_id, path, version)
        {
            InvalidationOutcome::Refetch(ticket) => outcome.refetches.push(ticket),
            InvalidationOutcome::Conflict(notice) => {
                outcome.events.push(SyncEvent::Reconciliation(notice))
            }
            InvalidationOutcome::NotOpen
            | InvalidationOutcome::UpToDate
            | InvalidationOutcome::Stale
            | InvalidationOutcome::Deferred => {}
        }
    }

    /// Feed back the result of a refetch issued by an earlier outcome.
    pub fn complete_refetch(
        &mut self,
        ticket: &RefetchTicket,
        result: Result<FileContent, BackendError>,
    ) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();
        let context = &mut self.context;
        match context
            .overlays
            .complete_refetch(&mut context.cache, ticket, result)
        {
            RefetchOutcome::Applied => {}
            RefetchOutcome::Discarded(reason) => {
                debug!("Refetch of {} discarded: {:?}", ticket.path(), reason);
            }
            RefetchOutcome::Conflict(notice) => {
                outcome.events.push(SyncEvent::Reconciliation(notice));
            }
            RefetchOutcome::Failed(error) => outcome.events.push(SyncEvent::RefetchFailed {
                project_id: ticket.project_id().to_string(),
                path: ticket.path().to_string(),
                error: error.to_string(),
            }),
        }
        outcome
    }

    /// Apply the collaborator's answer to a reconciliation notice.
    pub fn resolve_reconciliation(
        &mut self,
        path: &str,
        choice: ReconcileChoice,
    ) -> Result<SyncOutcome, OverlayError> {
        let context = &mut self.context;
        let ticket = context.overlays.resolve_reconciliation(
            &mut context.cache,
            &self.project_id,
            path,
            choice,
        )?;
        Ok(SyncOutcome {
            refetches: ticket.into_iter().collect(),
            ..SyncOutcome::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CachedResource;
    use crate::cache::CacheKey;
    use crate::events::NotificationLevel;
    use crate::locks::types::{Actor, LockLevel};
    use crate::testing::FakeBackend;
    use std::time::Duration;

    fn coordinator() -> SyncCoordinator {
        SyncCoordinator::new("p1", SyncContext::new(CacheConfig::default()))
    }

    fn seed_cache(coordinator: &mut SyncCoordinator) {
        let cache = &mut coordinator.context_mut().cache;
        cache.put_file_content("p1", "scenes/1.md", FileContent::new("v1", Some("c1")));
        cache.put_file_content("p1", "scenes/2.md", FileContent::new("v1", Some("c1")));
        let ttl = Duration::from_secs(60);
        let store = cache.store_mut();
        store.set(
            CacheKey::file("p1", CacheCategory::FileHistory, "scenes/1.md"),
            CachedResource::History {
                page: Default::default(),
                commits: Vec::new(),
            },
            ttl,
        );
        store.set(
            CacheKey::project("p1", CacheCategory::ProjectTree),
            CachedResource::Tree(Vec::new()),
            ttl,
        );
        store.set(
            CacheKey::project("p1", CacheCategory::RepositoryStatus),
            CachedResource::Status(Default::default()),
            ttl,
        );
        store.set(
            CacheKey::project("p1", CacheCategory::ProjectBranches),
            CachedResource::Branches(Vec::new()),
            ttl,
        );
    }

    fn cached(coordinator: &mut SyncCoordinator, key: CacheKey) -> bool {
        coordinator.context_mut().cache.store_mut().contains(&key)
    }

    fn parse(text: &str) -> PushMessage {
        PushMessage::parse(text).unwrap()
    }

    fn notifications(outcome: &SyncOutcome) -> Vec<&Notification> {
        outcome
            .events
            .iter()
            .filter_map(|event| match event {
                SyncEvent::Notification(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    // ==================== git_update ====================

    #[test]
    fn test_git_update_invalidates_file_and_project_views() {
        let mut coordinator = coordinator();
        seed_cache(&mut coordinator);

        let outcome = coordinator.handle(&parse(
            r#"{"type":"git_update","project_id":"p1","updated_files":["scenes/1.md"]}"#,
        ));

        assert!(!cached(&mut coordinator, CacheKey::file("p1", CacheCategory::FileContent, "scenes/1.md")));
        assert!(!cached(&mut coordinator, CacheKey::file("p1", CacheCategory::FileHistory, "scenes/1.md")));
        assert!(!cached(&mut coordinator, CacheKey::project("p1", CacheCategory::ProjectTree)));
        assert!(!cached(&mut coordinator, CacheKey::project("p1", CacheCategory::RepositoryStatus)));
        assert!(!cached(&mut coordinator, CacheKey::project("p1", CacheCategory::ProjectBranches)));
        assert!(cached(&mut coordinator, CacheKey::file("p1", CacheCategory::FileContent, "scenes/2.md")));

        let notes = notifications(&outcome);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].message, "Project updated: 1 file changed");
        assert_eq!(notes[0].level, NotificationLevel::Info);
    }

    #[test]
    fn test_git_update_without_files_is_project_wide_touch() {
        let mut coordinator = coordinator();
        seed_cache(&mut coordinator);

        let outcome = coordinator.handle(&parse(r#"{"type":"git_update","project_id":"p1"}"#));

        assert!(!cached(&mut coordinator, CacheKey::project("p1", CacheCategory::ProjectTree)));
        assert!(!cached(&mut coordinator, CacheKey::project("p1", CacheCategory::RepositoryStatus)));
        assert!(cached(&mut coordinator, CacheKey::project("p1", CacheCategory::ProjectBranches)));
        assert!(cached(&mut coordinator, CacheKey::file("p1", CacheCategory::FileContent, "scenes/1.md")));
        assert_eq!(notifications(&outcome)[0].message, "Project updated");
    }

    #[test]
    fn test_git_update_counts_distinct_files() {
        let mut coordinator = coordinator();

        let outcome = coordinator.handle(&parse(
            r#"{"type":"git_update","updated_files":["a.md","b.md","a.md"]}"#,
        ));

        assert_eq!(notifications(&outcome)[0].message, "Project updated: 2 files changed");
    }

    #[test]
    fn test_git_update_for_other_project_is_ignored() {
        let mut coordinator = coordinator();
        seed_cache(&mut coordinator);

        let outcome = coordinator.handle(&parse(
            r#"{"type":"git_update","project_id":"p2","updated_files":["scenes/1.md"]}"#,
        ));

        assert!(outcome.is_empty());
        assert!(cached(&mut coordinator, CacheKey::file("p1", CacheCategory::FileContent, "scenes/1.md")));
    }

    #[tokio::test]
    async fn test_git_update_reaches_open_overlays() {
        let backend = FakeBackend::with_file("scenes/1.md", "v1", "c1");
        backend.set_file("scenes/2.md", "v1", "c1");
        let mut coordinator = coordinator();
        {
            let context = coordinator.context_mut();
            for path in ["scenes/1.md", "scenes/2.md"] {
                context
                    .overlays
                    .open(&mut context.cache, &backend, "p1", path)
                    .await
                    .unwrap();
            }
            context.overlays.edit("p1", "scenes/2.md", "local").unwrap();
        }

        let outcome = coordinator.handle(&parse(
            r#"{"type":"git_update","project_id":"p1","commit_hash":"c2",
                "updated_files":["scenes/1.md","scenes/2.md"]}"#,
        ));

        assert_eq!(outcome.refetches.len(), 1);
        assert_eq!(outcome.refetches[0].path(), "scenes/1.md");
        assert!(matches!(
            &outcome.events[0],
            SyncEvent::Reconciliation(notice) if notice.path == "scenes/2.md"
        ));
        // The summary comes after everything else.
        assert!(matches!(outcome.events.last(), Some(SyncEvent::Notification(_))));

        let ticket = outcome.refetches[0].clone();
        let done = coordinator.complete_refetch(&ticket, Ok(FileContent::new("v2", Some("c2"))));
        assert!(done.is_empty());
        assert_eq!(
            coordinator
                .context()
                .overlays
                .effective_content("p1", "scenes/1.md"),
            Some("v2")
        );
    }

    #[tokio::test]
    async fn test_failed_refetch_is_reported() {
        let backend = FakeBackend::with_file("scenes/1.md", "v1", "c1");
        let mut coordinator = coordinator();
        {
            let context = coordinator.context_mut();
            context
                .overlays
                .open(&mut context.cache, &backend, "p1", "scenes/1.md")
                .await
                .unwrap();
        }
        let outcome = coordinator.handle(&parse(
            r#"{"type":"file_changed","project_id":"p1","file_path":"scenes/1.md"}"#,
        ));

        let done = coordinator.complete_refetch(
            &outcome.refetches[0],
            Err(BackendError::Transport("down".into())),
        );

        assert!(matches!(&done.events[..], [SyncEvent::RefetchFailed { path, .. }] if path == "scenes/1.md"));
    }

    // ==================== Other repository pushes ====================

    #[test]
    fn test_file_changed_invalidates_only_that_path() {
        let mut coordinator = coordinator();
        seed_cache(&mut coordinator);

        let outcome = coordinator.handle(&parse(r#"{"type":"file_changed","file_path":"scenes/1.md"}"#));

        assert!(notifications(&outcome).is_empty());
        assert!(!cached(&mut coordinator, CacheKey::file("p1", CacheCategory::FileContent, "scenes/1.md")));
        assert!(!cached(&mut coordinator, CacheKey::file("p1", CacheCategory::FileHistory, "scenes/1.md")));
        assert!(cached(&mut coordinator, CacheKey::project("p1", CacheCategory::ProjectTree)));
    }

    #[test]
    fn test_branch_changed_invalidates_branch_views() {
        let mut coordinator = coordinator();
        seed_cache(&mut coordinator);

        coordinator.handle(&parse(
            r#"{"type":"branch_changed","project_id":"p1","branch_name":"draft","operation":"checkout"}"#,
        ));

        assert!(!cached(&mut coordinator, CacheKey::project("p1", CacheCategory::ProjectBranches)));
        assert!(!cached(&mut coordinator, CacheKey::project("p1", CacheCategory::ProjectTree)));
        assert!(cached(&mut coordinator, CacheKey::file("p1", CacheCategory::FileContent, "scenes/1.md")));
    }

    // ==================== Locks ====================

    const LOCK: &str = r#"{"id":"l1","componentId":"scene-1","level":"hard","lockedBy":"alice",
        "lockedAt":"2024-05-01T10:00:00Z","canOverride":false}"#;

    #[test]
    fn test_remote_lock_update_and_removal() {
        let mut coordinator = coordinator();

        let outcome = coordinator.handle(&parse(&format!(
            r#"{{"channel":"locks:p1","data":{{"componentId":"scene-1","lock":{LOCK}}}}}"#
        )));
        assert_eq!(coordinator.context().locks.level_of("scene-1"), LockLevel::Hard);
        assert!(matches!(&outcome.events[..], [SyncEvent::LockChanged { lock: Some(_), .. }]));

        coordinator.handle(&parse(
            r#"{"channel":"locks:p1","data":{"componentId":"scene-1","lock":null}}"#,
        ));
        assert_eq!(coordinator.context().locks.level_of("scene-1"), LockLevel::Unlocked);
    }

    #[test]
    fn test_bulk_update_and_subscription_request_snapshot() {
        let mut coordinator = coordinator();

        let bulk = coordinator.handle(&parse(
            r#"{"channel":"locks:p1","data":{"bulk_update":true,"affected_components":["a"]}}"#,
        ));
        let ack = coordinator.handle(&parse(
            r#"{"channel":"subscription","data":{"project_id":"p1","status":"subscribed"}}"#,
        ));

        assert_eq!(bulk.outbound, vec![OutboundFrame::sync_request("p1")]);
        assert_eq!(ack.outbound, vec![OutboundFrame::sync_request("p1")]);
    }

    #[test]
    fn test_snapshot_replaces_lock_table() {
        let mut coordinator = coordinator();
        coordinator
            .context_mut()
            .locks
            .request_lock("scene-9", LockLevel::Soft, "", &Actor::member("bob"))
            .unwrap();

        let outcome = coordinator.handle(&parse(&format!(
            r#"{{"channel":"sync-response:p1","data":{{"locks":{{"scene-1":{LOCK}}},"conflicts":[]}}}}"#
        )));

        let locks = &coordinator.context().locks;
        assert!(locks.lock("scene-9").is_none());
        assert_eq!(locks.lock("scene-1").unwrap().locked_by, "alice");
        assert_eq!(
            outcome
                .events
                .iter()
                .filter(|e| matches!(e, SyncEvent::LockChanged { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn test_remote_conflict_resolution() {
        let mut coordinator = coordinator();
        coordinator.handle(&parse(&format!(
            r#"{{"channel":"locks:p1","data":{{"componentId":"scene-1","lock":{LOCK}}}}}"#
        )));
        let conflict = match coordinator.context_mut().locks.request_lock(
            "scene-1",
            LockLevel::Hard,
            "x",
            &Actor::member("bob"),
        ) {
            Err(crate::locks::LockError::Conflict(conflict)) => conflict,
            other => panic!("expected conflict, got {other:?}"),
        };

        let outcome = coordinator.handle(&parse(&format!(
            r#"{{"channel":"conflicts:p1","data":{{"conflictId":"{}","status":"resolved"}}}}"#,
            conflict.id
        )));

        assert!(matches!(&outcome.events[..], [SyncEvent::ConflictResolved { .. }]));
        assert_eq!(coordinator.context().locks.conflicts().count(), 0);
        assert!(coordinator.context().locks.lock("scene-1").is_some());
    }

    #[test]
    fn test_server_error_becomes_warning() {
        let mut coordinator = coordinator();

        let outcome = coordinator.handle(&parse(
            r#"{"channel":"error","data":{"message":"slow down","code":"RATE_LIMITED"}}"#,
        ));

        let notes = notifications(&outcome);
        assert_eq!(notes[0].level, NotificationLevel::Warning);
        assert_eq!(notes[0].message, "Server error (RATE_LIMITED): slow down");
    }

    #[test]
    fn test_teardown_clears_project_state() {
        let mut coordinator = coordinator();
        seed_cache(&mut coordinator);
        coordinator
            .context_mut()
            .locks
            .request_lock("c1", LockLevel::Soft, "", &Actor::member("a"))
            .unwrap();

        coordinator.context_mut().teardown("p1");

        assert!(coordinator.context().cache.store().is_empty());
        assert_eq!(coordinator.context().locks.locks().count(), 0);
    }
}
