//! One project's sync session.
//!
//! [`ProjectSession`] owns everything held for a project while it is open:
//! the repository cache, lock table and overlays (inside a
//! [`SyncCoordinator`]), the push channel and the REST backend. Nothing is
//! shared between sessions; [`ProjectSession::shutdown`] tears it all down.
//!
//! The session runs on the caller's task. [`ProjectSession::step`] waits for
//! the next push message, refetch result or channel event and applies it.
//! Refetches run as spawned tasks and report back through a queue, so a slow
//! fetch never holds up push processing.

use std::collections::HashMap;
use std::sync::Arc;

use story_core::{
    Actor, BackendError, BranchInfo, CacheConfig, Capability, CommitInfo, CommitOutcome,
    ComponentInfo, FileContent, FileKey, FileOverlay, HistoryPage, Lock, LockError, LockLevel,
    OutboundFrame, OverlayError, PotentialConflict, PushMessage, ReconcileChoice, RefetchTicket,
    RepositoryBackend, RepositoryStatus, Resolution, SyncContext, SyncCoordinator, SyncEvent,
    SyncOutcome, TreeEntry,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::channel::{ChannelError, ChannelEvent, ChannelState, RealtimeSyncChannel};
use crate::config::SyncConfig;
use crate::reconnect::ReconnectConfig;

/// Every topic the coordinator understands.
pub const TOPICS: [&str; 9] = [
    "git_update",
    "file_changed",
    "branch_changed",
    "locks",
    "conflicts",
    "sync-response",
    "subscription",
    "token_refresh",
    "error",
];

const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Overlay(#[from] OverlayError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ws_url: Url,
    pub token: String,
    pub reconnect: ReconnectConfig,
    pub cache: CacheConfig,
    /// Capacity of the event queue handed to the caller
    pub event_capacity: usize,
}

impl SessionConfig {
    pub fn new(ws_url: Url, token: impl Into<String>) -> Self {
        Self {
            ws_url,
            token: token.into(),
            reconnect: ReconnectConfig::default(),
            cache: CacheConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl From<&SyncConfig> for SessionConfig {
    fn from(config: &SyncConfig) -> Self {
        Self::new(config.ws_url.clone(), config.token.clone())
    }
}

type RefetchResult = (RefetchTicket, Result<FileContent, BackendError>);

pub struct ProjectSession {
    project_id: String,
    actor: Actor,
    coordinator: SyncCoordinator,
    backend: Arc<dyn RepositoryBackend>,
    channel: RealtimeSyncChannel,
    push_rx: mpsc::UnboundedReceiver<PushMessage>,
    refetch_tx: mpsc::UnboundedSender<RefetchResult>,
    refetch_rx: mpsc::UnboundedReceiver<RefetchResult>,
    /// Running refetch per file, with the fetch id of its ticket.
    inflight: HashMap<FileKey, (u64, JoinHandle<()>)>,
    events_tx: mpsc::Sender<SyncEvent>,
}

impl ProjectSession {
    /// Connect to `project_id` and subscribe to every push topic. Events
    /// surface on the returned receiver.
    pub fn start(
        config: SessionConfig,
        backend: Arc<dyn RepositoryBackend>,
        project_id: &str,
        actor: Actor,
    ) -> Result<(Self, mpsc::Receiver<SyncEvent>), SessionError> {
        let mut channel = RealtimeSyncChannel::new(config.ws_url, config.reconnect);
        channel.connect(project_id, &config.token)?;

        let (push_tx, push_rx) = mpsc::unbounded_channel();
        for topic in TOPICS {
            let tx = push_tx.clone();
            channel.subscribe(
                topic,
                Box::new(move |message: &PushMessage| {
                    let _ = tx.send(message.clone());
                }),
            )?;
        }

        let (refetch_tx, refetch_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        info!("Session started for {} as {}", project_id, actor.id);

        let session = Self {
            project_id: project_id.to_string(),
            actor,
            coordinator: SyncCoordinator::new(project_id, SyncContext::new(config.cache)),
            backend,
            channel,
            push_rx,
            refetch_tx,
            refetch_rx,
            inflight: HashMap::new(),
            events_tx,
        };
        Ok((session, events_rx))
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn context(&self) -> &SyncContext {
        self.coordinator.context()
    }

    pub fn context_mut(&mut self) -> &mut SyncContext {
        self.coordinator.context_mut()
    }

    /// Process one unit of work. Returns `false` once the channel is
    /// disconnected and nothing is left to process.
    pub async fn step(&mut self) -> bool {
        tokio::select! {
            biased;

            Some(message) = self.push_rx.recv() => {
                let outcome = self.coordinator.handle(&message);
                self.apply(outcome).await;
                true
            }
            Some((ticket, result)) = self.refetch_rx.recv() => {
                self.finish_refetch(ticket, result).await;
                true
            }
            event = self.channel.next_event() => match event {
                Some(ChannelEvent::GaveUp { attempts }) => {
                    warn!("Push channel for {} lost after {} attempts", self.project_id, attempts);
                    self.emit(SyncEvent::ConnectionLost { attempts }).await;
                    true
                }
                Some(ChannelEvent::StateChanged { from, to }) => {
                    debug!("Channel {} -> {}", from, to);
                    true
                }
                Some(ChannelEvent::Delivered { .. }) => true,
                // Disconnected: drain refetches still running, then stop.
                None if self.inflight.is_empty() => false,
                None => {
                    if let Some((ticket, result)) = self.refetch_rx.recv().await {
                        self.finish_refetch(ticket, result).await;
                    }
                    true
                }
            },
        }
    }

    async fn finish_refetch(&mut self, ticket: RefetchTicket, result: Result<FileContent, BackendError>) {
        // A stale result must not forget the newer fetch for the same file.
        if self
            .inflight
            .get(&ticket.key)
            .is_some_and(|(fetch_id, _)| *fetch_id == ticket.fetch_id())
        {
            self.inflight.remove(&ticket.key);
        }
        let outcome = self.coordinator.complete_refetch(&ticket, result);
        self.apply(outcome).await;
    }

    async fn apply(&mut self, outcome: SyncOutcome) {
        for frame in outcome.outbound {
            self.send(frame);
        }
        for ticket in outcome.refetches {
            self.spawn_refetch(ticket);
        }
        for event in outcome.events {
            self.emit(event).await;
        }
    }

    async fn emit(&self, event: SyncEvent) {
        if self.events_tx.send(event).await.is_err() {
            debug!("Event receiver dropped");
        }
    }

    fn send(&mut self, frame: OutboundFrame) {
        let channel = frame.channel.clone();
        if let Err(e) = self.channel.send(frame) {
            warn!("Could not send {}: {}", channel, e);
        }
    }

    fn spawn_refetch(&mut self, ticket: RefetchTicket) {
        let backend = self.backend.clone();
        let tx = self.refetch_tx.clone();
        let key = ticket.key.clone();
        let fetch_id = ticket.fetch_id();
        debug!("Refetching {}", ticket.path());

        let handle = tokio::spawn(async move {
            let result = backend
                .fetch_file_content(ticket.project_id(), ticket.path())
                .await;
            let _ = tx.send((ticket, result));
        });
        // A newer ticket supersedes whatever the older fetch would bring back.
        if let Some((_, previous)) = self.inflight.insert(key, (fetch_id, handle)) {
            previous.abort();
        }
    }

    // ==================== Files ====================

    pub async fn open_file(&mut self, path: &str) -> Result<FileOverlay, SessionError> {
        let context = self.coordinator.context_mut();
        let overlay = context
            .overlays
            .open(&mut context.cache, self.backend.as_ref(), &self.project_id, path)
            .await?;
        Ok(overlay)
    }

    pub fn file(&self, path: &str) -> Option<&FileOverlay> {
        self.coordinator.context().overlays.get(&self.project_id, path)
    }

    /// `localContent ?? remoteContent` of an open file.
    pub fn effective_content(&self, path: &str) -> Option<&str> {
        self.coordinator
            .context()
            .overlays
            .effective_content(&self.project_id, path)
    }

    pub fn edit(&mut self, path: &str, content: impl Into<String>) -> Result<u64, SessionError> {
        let seq = self
            .coordinator
            .context_mut()
            .overlays
            .edit(&self.project_id, path, content)?;
        Ok(seq)
    }

    pub fn discard(&mut self, path: &str) -> Result<(), SessionError> {
        let ticket = self
            .coordinator
            .context_mut()
            .overlays
            .discard(&self.project_id, path)?;
        if let Some(ticket) = ticket {
            self.spawn_refetch(ticket);
        }
        Ok(())
    }

    /// Close a file, cancelling any refetch still running for it.
    pub fn close_file(&mut self, path: &str) -> bool {
        if let Some((_, handle)) = self.inflight.remove(&FileKey::new(&self.project_id, path)) {
            handle.abort();
        }
        self.coordinator
            .context_mut()
            .overlays
            .close(&self.project_id, path)
    }

    /// Save and commit the local edit of `path`.
    pub async fn commit(&mut self, path: &str, message: Option<&str>) -> Result<CommitOutcome, SessionError> {
        let ticket = self
            .coordinator
            .context_mut()
            .overlays
            .begin_commit(&self.project_id, path)?;

        let default_message = format!("Update {path}");
        let result = self
            .backend
            .save_file(
                &self.project_id,
                path,
                &ticket.content,
                message.unwrap_or(&default_message),
            )
            .await
            .map(|receipt| receipt.commit_hash);

        let context = self.coordinator.context_mut();
        let outcome = context
            .overlays
            .complete_commit(&mut context.cache, ticket, result);
        if let CommitOutcome::Failed {
            notice: Some(notice),
            ..
        } = &outcome
        {
            self.emit(SyncEvent::Reconciliation(notice.clone())).await;
        }
        Ok(outcome)
    }

    pub async fn resolve_reconciliation(
        &mut self,
        path: &str,
        choice: ReconcileChoice,
    ) -> Result<(), SessionError> {
        let outcome = self.coordinator.resolve_reconciliation(path, choice)?;
        self.apply(outcome).await;
        Ok(())
    }

    // ==================== Repository reads ====================

    pub async fn project_tree(&mut self) -> Result<Vec<TreeEntry>, SessionError> {
        let cache = &mut self.coordinator.context_mut().cache;
        Ok(cache.project_tree(self.backend.as_ref(), &self.project_id).await?)
    }

    pub async fn file_history(&mut self, path: &str, page: HistoryPage) -> Result<Vec<CommitInfo>, SessionError> {
        let cache = &mut self.coordinator.context_mut().cache;
        Ok(cache
            .file_history(self.backend.as_ref(), &self.project_id, path, page)
            .await?)
    }

    pub async fn repository_status(&mut self) -> Result<RepositoryStatus, SessionError> {
        let cache = &mut self.coordinator.context_mut().cache;
        Ok(cache
            .repository_status(self.backend.as_ref(), &self.project_id)
            .await?)
    }

    pub async fn branches(&mut self) -> Result<Vec<BranchInfo>, SessionError> {
        let cache = &mut self.coordinator.context_mut().cache;
        Ok(cache.branches(self.backend.as_ref(), &self.project_id).await?)
    }

    // ==================== Locks ====================

    pub fn register_component(&mut self, component_id: &str, info: ComponentInfo) {
        self.coordinator
            .context_mut()
            .locks
            .register_component(component_id, info);
    }

    pub fn capability(&self, component_id: &str) -> Capability {
        self.coordinator.context().locks.capability_for(component_id)
    }

    pub fn check_conflicts(&self, component_ids: &[&str]) -> Vec<PotentialConflict> {
        self.coordinator
            .context()
            .locks
            .check_conflicts(component_ids.iter().copied(), &self.actor)
    }

    /// Lock a component and persist the lock. A rejected write rolls the
    /// local grant back.
    pub async fn request_lock(
        &mut self,
        component_id: &str,
        level: LockLevel,
        reason: &str,
    ) -> Result<Lock, SessionError> {
        let locks = &mut self.coordinator.context_mut().locks;
        let previous = locks.lock(component_id).cloned();
        let lock = match locks.request_lock(component_id, level, reason, &self.actor) {
            Ok(lock) => lock,
            Err(LockError::Conflict(conflict)) => {
                self.emit(SyncEvent::LockConflict {
                    conflict: (*conflict).clone(),
                })
                .await;
                return Err(LockError::Conflict(conflict).into());
            }
            Err(e) => return Err(e.into()),
        };
        self.persist_lock(component_id, lock, previous).await
    }

    /// Move the caller's own lock to another level.
    pub async fn change_lock_level(
        &mut self,
        component_id: &str,
        level: LockLevel,
    ) -> Result<Lock, SessionError> {
        let locks = &mut self.coordinator.context_mut().locks;
        let previous = locks.lock(component_id).cloned();
        let lock = locks.change_level(component_id, level, &self.actor)?;
        self.persist_lock(component_id, lock, previous).await
    }

    async fn persist_lock(
        &mut self,
        component_id: &str,
        lock: Lock,
        previous: Option<Lock>,
    ) -> Result<Lock, SessionError> {
        if let Err(e) = self.backend.put_lock(&self.project_id, &lock).await {
            warn!("Lock on {} rejected by backend, rolling back: {}", component_id, e);
            self.coordinator
                .context_mut()
                .locks
                .restore(component_id, previous);
            return Err(e.into());
        }

        self.send(OutboundFrame::lock_update(
            &self.project_id,
            component_id,
            Some(&lock),
        ));
        self.emit(SyncEvent::LockChanged {
            component_id: component_id.to_string(),
            lock: Some(lock.clone()),
        })
        .await;
        Ok(lock)
    }

    pub async fn release_lock(&mut self, component_id: &str) -> Result<Lock, SessionError> {
        let released = self
            .coordinator
            .context_mut()
            .locks
            .release_lock(component_id, &self.actor)?;
        self.persist_release(component_id, &released).await?;
        Ok(released)
    }

    async fn persist_release(&mut self, component_id: &str, released: &Lock) -> Result<(), SessionError> {
        if let Err(e) = self.backend.delete_lock(&self.project_id, component_id).await {
            warn!("Release of {} rejected by backend, restoring: {}", component_id, e);
            self.coordinator
                .context_mut()
                .locks
                .restore(component_id, Some(released.clone()));
            return Err(e.into());
        }

        self.send(OutboundFrame::lock_update(&self.project_id, component_id, None));
        self.emit(SyncEvent::LockChanged {
            component_id: component_id.to_string(),
            lock: None,
        })
        .await;
        Ok(())
    }

    /// Settle an outstanding lock conflict and tell the server.
    pub async fn resolve_conflict(
        &mut self,
        conflict_id: &str,
        resolution: Resolution,
    ) -> Result<(), SessionError> {
        let locks = &mut self.coordinator.context_mut().locks;
        let component_id = locks
            .conflicts()
            .find(|conflict| conflict.id == conflict_id)
            .map(|conflict| conflict.component_id.clone());
        let blocking = component_id
            .as_deref()
            .and_then(|component_id| locks.lock(component_id))
            .cloned();

        let conflict = locks.resolve_conflict(conflict_id, resolution)?;
        if resolution == Resolution::Unlock {
            if let Some(blocking) = blocking {
                if let Err(e) = self.persist_release(&conflict.component_id, &blocking).await {
                    // The lock is back, so the conflict stays outstanding.
                    self.coordinator
                        .context_mut()
                        .locks
                        .restore_conflict(conflict);
                    return Err(e);
                }
            }
        }

        self.send(OutboundFrame::conflict_resolution(
            &self.project_id,
            conflict_id,
            resolution,
        ));
        self.emit(SyncEvent::ConflictResolved {
            conflict_id: conflict_id.to_string(),
        })
        .await;
        Ok(())
    }

    // ==================== Lifecycle ====================

    /// Disconnect and drop everything held for the project.
    pub async fn shutdown(mut self) {
        self.channel.disconnect().await;
        for (_, (_, handle)) in self.inflight.drain() {
            handle.abort();
        }
        self.coordinator.context_mut().teardown(&self.project_id);
        info!("Session for {} shut down", self.project_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use story_core::SaveReceipt;

    /// In-memory backend; lock writes and releases fail while `reject_locks` is set.
    #[derive(Default)]
    struct MemoryBackend {
        files: Mutex<HashMap<String, FileContent>>,
        reject_locks: bool,
        commits: Mutex<u32>,
    }

    #[async_trait]
    impl RepositoryBackend for MemoryBackend {
        async fn fetch_tree(&self, _: &str, _: &str) -> Result<Vec<TreeEntry>, BackendError> {
            Ok(Vec::new())
        }

        async fn fetch_file_content(&self, _: &str, path: &str) -> Result<FileContent, BackendError> {
            self.files
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| BackendError::NotFound(path.to_string()))
        }

        async fn fetch_file_history(
            &self,
            _: &str,
            _: &str,
            _: HistoryPage,
        ) -> Result<Vec<CommitInfo>, BackendError> {
            Ok(Vec::new())
        }

        async fn fetch_status(&self, _: &str) -> Result<RepositoryStatus, BackendError> {
            Ok(RepositoryStatus::default())
        }

        async fn fetch_branches(&self, _: &str) -> Result<Vec<BranchInfo>, BackendError> {
            Ok(Vec::new())
        }

        async fn save_file(
            &self,
            _: &str,
            path: &str,
            content: &str,
            _: &str,
        ) -> Result<SaveReceipt, BackendError> {
            let mut commits = self.commits.lock().unwrap();
            *commits += 1;
            let hash = format!("saved-{}", *commits);
            self.files
                .lock()
                .unwrap()
                .insert(path.to_string(), FileContent::new(content, Some(&hash)));
            Ok(SaveReceipt {
                commit_hash: Some(hash),
            })
        }

        async fn put_lock(&self, _: &str, _: &Lock) -> Result<(), BackendError> {
            if self.reject_locks {
                return Err(BackendError::Rejected {
                    status: 403,
                    message: "forbidden".into(),
                });
            }
            Ok(())
        }

        async fn delete_lock(&self, _: &str, _: &str) -> Result<(), BackendError> {
            if self.reject_locks {
                return Err(BackendError::Rejected {
                    status: 403,
                    message: "forbidden".into(),
                });
            }
            Ok(())
        }
    }

    fn start(backend: MemoryBackend, actor: Actor) -> (ProjectSession, mpsc::Receiver<SyncEvent>) {
        // Nothing listens here; the channel just keeps retrying.
        let config = SessionConfig::new(Url::parse("ws://127.0.0.1:9/ws").unwrap(), "t1");
        ProjectSession::start(config, Arc::new(backend), "p1", actor).unwrap()
    }

    fn with_file(path: &str, content: &str, commit: &str) -> MemoryBackend {
        let backend = MemoryBackend::default();
        backend
            .files
            .lock()
            .unwrap()
            .insert(path.to_string(), FileContent::new(content, Some(commit)));
        backend
    }

    // ==================== Locks ====================

    #[tokio::test]
    async fn test_rejected_lock_is_rolled_back() {
        let backend = MemoryBackend {
            reject_locks: true,
            ..Default::default()
        };
        let (mut session, _events) = start(backend, Actor::member("alice"));

        let result = session.request_lock("scene-1", LockLevel::Hard, "revising").await;
        assert!(matches!(result, Err(SessionError::Backend(_))));
        assert!(session.context().locks.lock("scene-1").is_none());
        assert_eq!(session.capability("scene-1"), Capability::default());
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_lock_and_release_surface_events() {
        let (mut session, mut events) = start(MemoryBackend::default(), Actor::member("alice"));

        let lock = session
            .request_lock("scene-1", LockLevel::Frozen, "final")
            .await
            .unwrap();
        assert!(!lock.can_override);
        assert!(session.capability("scene-1").read_only);
        assert!(matches!(
            events.recv().await,
            Some(SyncEvent::LockChanged { lock: Some(_), .. })
        ));

        session.release_lock("scene-1").await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(SyncEvent::LockChanged { lock: None, .. })
        ));
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_conflicting_lock_surfaces_conflict() {
        let (mut session, mut events) = start(MemoryBackend::default(), Actor::member("bob"));
        session
            .coordinator
            .context_mut()
            .locks
            .request_lock("scene-1", LockLevel::Frozen, "final", &Actor::editor("alice"))
            .unwrap();

        let result = session.request_lock("scene-1", LockLevel::Soft, "typo").await;
        assert!(matches!(
            result,
            Err(SessionError::Lock(LockError::Conflict(_)))
        ));
        let Some(SyncEvent::LockConflict { conflict }) = events.recv().await else {
            panic!("expected a lock conflict event");
        };

        session
            .resolve_conflict(&conflict.id, Resolution::Skip)
            .await
            .unwrap();
        assert!(session.context().locks.lock("scene-1").is_some());
        assert!(matches!(
            events.recv().await,
            Some(SyncEvent::ConflictResolved { .. })
        ));
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_unlock_keeps_conflict_outstanding() {
        let backend = MemoryBackend {
            reject_locks: true,
            ..Default::default()
        };
        let (mut session, mut events) = start(backend, Actor::editor("bob"));
        session
            .coordinator
            .context_mut()
            .locks
            .request_lock("scene-1", LockLevel::Frozen, "final", &Actor::member("alice"))
            .unwrap();
        let _ = session.request_lock("scene-1", LockLevel::Soft, "typo").await;
        let Some(SyncEvent::LockConflict { conflict }) = events.recv().await else {
            panic!("expected a lock conflict event");
        };

        let result = session.resolve_conflict(&conflict.id, Resolution::Unlock).await;

        assert!(matches!(result, Err(SessionError::Backend(_))));
        let locks = &session.context().locks;
        assert_eq!(locks.lock("scene-1").unwrap().locked_by, "alice");
        assert_eq!(
            locks.conflict_for("scene-1").map(|c| c.id.clone()),
            Some(conflict.id.clone())
        );
        assert!(events.try_recv().is_err());
        session.shutdown().await;
    }

    // ==================== Files ====================

    #[tokio::test]
    async fn test_commit_round_trip() {
        let (mut session, _events) =
            start(with_file("scenes/1.md", "v1", "c1"), Actor::member("alice"));

        session.open_file("scenes/1.md").await.unwrap();
        session.edit("scenes/1.md", "v2").unwrap();
        assert_eq!(session.effective_content("scenes/1.md"), Some("v2"));

        let outcome = session.commit("scenes/1.md", None).await.unwrap();
        assert_eq!(
            outcome,
            CommitOutcome::Committed {
                version: Some("saved-1".into())
            }
        );
        let overlay = session.file("scenes/1.md").unwrap();
        assert!(!overlay.is_dirty());
        assert_eq!(overlay.remote_content(), "v2");
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_push_invalidation_refetches_clean_file() {
        let backend = Arc::new(with_file("scenes/1.md", "v1", "c1"));
        let config = SessionConfig::new(Url::parse("ws://127.0.0.1:9/ws").unwrap(), "t1");
        let (mut session, mut events) =
            ProjectSession::start(config, backend.clone(), "p1", Actor::member("alice")).unwrap();
        session.open_file("scenes/1.md").await.unwrap();

        backend
            .files
            .lock()
            .unwrap()
            .insert("scenes/1.md".into(), FileContent::new("v2", Some("c2")));
        let message = PushMessage::parse(
            r#"{"type":"git_update","project_id":"p1","updated_files":["scenes/1.md"],"commit_hash":"c2"}"#,
        )
        .unwrap();
        let outcome = session.coordinator.handle(&message);
        session.apply(outcome).await;

        let Some(SyncEvent::Notification(notification)) = events.recv().await else {
            panic!("expected a notification");
        };
        assert_eq!(notification.message, "Project updated: 1 file changed");

        tokio::time::timeout(Duration::from_secs(5), async {
            while session.file("scenes/1.md").unwrap().remote_content() != "v2" {
                session.step().await;
            }
        })
        .await
        .unwrap();
        assert!(session.inflight.is_empty());
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_cancels_refetch() {
        let (mut session, _events) =
            start(with_file("scenes/1.md", "v1", "c1"), Actor::member("alice"));
        session.open_file("scenes/1.md").await.unwrap();
        let message =
            PushMessage::parse(r#"{"type":"file_changed","file_path":"scenes/1.md"}"#).unwrap();
        let outcome = session.coordinator.handle(&message);
        session.apply(outcome).await;
        assert_eq!(session.inflight.len(), 1);

        assert!(session.close_file("scenes/1.md"));
        assert!(session.inflight.is_empty());
        assert!(session.file("scenes/1.md").is_none());
        session.shutdown().await;
    }
    #[tokio::test]
    async fn test_stale_refetch_keeps_newer_fetch_tracked() {
        let (mut session, _events) =
            start(with_file("scenes/1.md", "v1", "c1"), Actor::member("alice"));
        session.open_file("scenes/1.md").await.unwrap();
        let message =
            PushMessage::parse(r#"{"type":"file_changed","file_path":"scenes/1.md"}"#).unwrap();
        let older = session.coordinator.handle(&message).refetches.remove(0);
        let newer = session.coordinator.handle(&message).refetches.remove(0);
        assert_ne!(older.fetch_id(), newer.fetch_id());
        session.spawn_refetch(newer.clone());

        session
            .finish_refetch(older, Ok(FileContent::new("v0", Some("c0"))))
            .await;

        assert_eq!(
            session.inflight.get(&newer.key).map(|(fetch_id, _)| *fetch_id),
            Some(newer.fetch_id())
        );
        assert!(session.close_file("scenes/1.md"));
        assert!(session.inflight.is_empty());
        session.shutdown().await;
    }
}
