//! Optimistic per-file overlays.
//!
//! An overlay pairs the last content known to be saved remotely with any
//! local edit not yet confirmed. Remote invalidations never overwrite a local
//! edit: a clean overlay is refreshed, a dirty one raises a
//! [`ReconciliationNotice`] instead.
//!
//! Fetches and saves are split into a synchronous `begin` that hands out a
//! ticket and a `complete` that applies the result, so the caller decides
//! where the await happens. Each overlay keeps a local sequence number,
//! bumped on every edit, discard and commit. A refetch result is applied only
//! if its ticket still names the same overlay instance, the overlay is clean,
//! the ticket was issued no earlier than the last local commit, and the
//! fetched version is not the one that commit replaced.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{BackendError, FileContent, RepositoryBackend};
use crate::repo::RepositoryCache;

/// `(projectId, path)` of an open file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FileKey {
    pub project_id: String,
    pub path: String,
}

impl FileKey {
    pub fn new(project_id: &str, path: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            path: path.to_string(),
        }
    }
}

/// Remote content moved while the file had unsaved local edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationNotice {
    pub id: String,
    pub project_id: String,
    pub path: String,
    /// Local sequence number of the edit that is at risk.
    pub local_seq: u64,
    /// Remote version reported by the latest invalidation, when known.
    pub remote_version: Option<String>,
    pub raised_at: DateTime<Utc>,
    /// How many invalidations have hit this notice while it was pending.
    pub occurrences: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ReconcileChoice {
    /// Keep the local edit; the next commit overwrites the remote change.
    KeepLocal,
    /// Drop the local edit and refetch the remote content.
    TakeRemote,
}

/// One open file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileOverlay {
    project_id: String,
    path: String,
    remote_content: String,
    remote_version: Option<String>,
    /// `Some` exactly when the overlay is dirty.
    local_content: Option<String>,
    instance: u64,
    seq: u64,
    last_commit_seq: u64,
    /// Version the most recent local commit superseded.
    replaced_version: Option<String>,
    commit_in_flight: bool,
    remote_moved_during_commit: bool,
    moved_version: Option<String>,
    next_fetch_id: u64,
    applied_fetch_id: u64,
    pending_notice: Option<ReconciliationNotice>,
}

impl FileOverlay {
    fn new(project_id: &str, path: &str, remote: FileContent, instance: u64) -> Self {
        Self {
            project_id: project_id.to_string(),
            path: path.to_string(),
            remote_content: remote.content,
            remote_version: remote.last_commit,
            local_content: None,
            instance,
            seq: 0,
            last_commit_seq: 0,
            replaced_version: None,
            commit_in_flight: false,
            remote_moved_during_commit: false,
            moved_version: None,
            next_fetch_id: 0,
            applied_fetch_id: 0,
            pending_notice: None,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn remote_content(&self) -> &str {
        &self.remote_content
    }

    pub fn remote_version(&self) -> Option<&str> {
        self.remote_version.as_deref()
    }

    pub fn local_content(&self) -> Option<&str> {
        self.local_content.as_deref()
    }

    pub fn is_dirty(&self) -> bool {
        self.local_content.is_some()
    }

    /// `localContent ?? remoteContent`.
    pub fn effective_content(&self) -> &str {
        self.local_content.as_deref().unwrap_or(&self.remote_content)
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_committing(&self) -> bool {
        self.commit_in_flight
    }

    pub fn pending_notice(&self) -> Option<&ReconciliationNotice> {
        self.pending_notice.as_ref()
    }

    fn key(&self) -> FileKey {
        FileKey::new(&self.project_id, &self.path)
    }

    fn issue_refetch(&mut self) -> RefetchTicket {
        self.next_fetch_id += 1;
        RefetchTicket {
            key: self.key(),
            instance: self.instance,
            seq: self.seq,
            fetch_id: self.next_fetch_id,
        }
    }

    fn raise_notice(&mut self, remote_version: Option<String>) -> ReconciliationNotice {
        let notice = match self.pending_notice.take() {
            Some(previous) => ReconciliationNotice {
                local_seq: self.seq,
                remote_version: remote_version.or(previous.remote_version),
                raised_at: Utc::now(),
                occurrences: previous.occurrences + 1,
                ..previous
            },
            None => ReconciliationNotice {
                id: Uuid::new_v4().to_string(),
                project_id: self.project_id.clone(),
                path: self.path.clone(),
                local_seq: self.seq,
                remote_version,
                raised_at: Utc::now(),
                occurrences: 1,
            },
        };
        warn!(
            "Remote change on {}:{} while local edits are pending (notice {}, seen {}x)",
            self.project_id, self.path, notice.id, notice.occurrences
        );
        self.pending_notice = Some(notice.clone());
        notice
    }
}

/// Permission to apply one refetch result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefetchTicket {
    pub key: FileKey,
    instance: u64,
    seq: u64,
    fetch_id: u64,
}

impl RefetchTicket {
    pub fn project_id(&self) -> &str {
        &self.key.project_id
    }

    pub fn path(&self) -> &str {
        &self.key.path
    }

    /// Distinguishes successive refetches of the same file.
    pub fn fetch_id(&self) -> u64 {
        self.fetch_id
    }
}

/// A save started by [`OptimisticContentStore::begin_commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitTicket {
    pub key: FileKey,
    /// Content being saved.
    pub content: String,
    instance: u64,
    seq: u64,
}

/// What a remote invalidation did to an overlay.
#[derive(Debug, Clone, PartialEq)]
pub enum InvalidationOutcome {
    NotOpen,
    /// The overlay already holds the announced version.
    UpToDate,
    /// The announced version is the one the last local commit replaced.
    Stale,
    /// A commit is in flight; its completion decides what happens.
    Deferred,
    /// Clean overlay; fetch and hand the result to `complete_refetch`.
    Refetch(RefetchTicket),
    /// Dirty overlay; local edit kept, notice raised.
    Conflict(ReconciliationNotice),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// The overlay was closed (or closed and reopened) meanwhile.
    Closed,
    /// A local commit completed after the ticket was issued.
    SupersededByCommit,
    /// A later refetch already landed.
    Superseded,
    /// The fetched version is the one the last local commit replaced.
    StaleVersion,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefetchOutcome {
    Applied,
    Discarded(DiscardReason),
    /// The overlay became dirty in the interim; the result was dropped and
    /// a notice raised.
    Conflict(ReconciliationNotice),
    /// Fetch failed; the overlay keeps its last known remote content.
    Failed(BackendError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed { version: Option<String> },
    /// Saved remotely, but the overlay was closed meanwhile.
    Closed,
    Failed {
        error: BackendError,
        notice: Option<ReconciliationNotice>,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OverlayError {
    #[error("{project_id}:{path} is not open")]
    NotOpen { project_id: String, path: String },
    #[error("nothing to commit")]
    NothingToCommit,
    #[error("a commit is already in flight")]
    CommitInFlight,
    #[error("no reconciliation is pending")]
    NoPendingNotice,
    #[error(transparent)]
    Fetch(#[from] BackendError),
}

fn not_open(project_id: &str, path: &str) -> OverlayError {
    OverlayError::NotOpen {
        project_id: project_id.to_string(),
        path: path.to_string(),
    }
}

/// Overlays of every open file.
#[derive(Debug, Default)]
pub struct OptimisticContentStore {
    overlays: BTreeMap<FileKey, FileOverlay>,
    next_instance: u64,
}

impl OptimisticContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, project_id: &str, path: &str) -> Option<&FileOverlay> {
        self.overlays.get(&FileKey::new(project_id, path))
    }

    pub fn is_open(&self, project_id: &str, path: &str) -> bool {
        self.get(project_id, path).is_some()
    }

    pub fn overlays(&self) -> impl Iterator<Item = &FileOverlay> {
        self.overlays.values()
    }

    pub fn effective_content(&self, project_id: &str, path: &str) -> Option<&str> {
        self.get(project_id, path).map(FileOverlay::effective_content)
    }

    fn overlay_mut(&mut self, project_id: &str, path: &str) -> Result<&mut FileOverlay, OverlayError> {
        self.overlays
            .get_mut(&FileKey::new(project_id, path))
            .ok_or_else(|| not_open(project_id, path))
    }

    /// Open a file for editing, reading its remote content through the cache.
    /// Opening an already open file returns the existing overlay untouched.
    pub async fn open(
        &mut self,
        repo: &mut RepositoryCache,
        backend: &dyn RepositoryBackend,
        project_id: &str,
        path: &str,
    ) -> Result<FileOverlay, OverlayError> {
        if let Some(existing) = self.get(project_id, path) {
            return Ok(existing.clone());
        }

        let remote = repo.file_content(backend, project_id, path).await?;
        // The fetch may have raced with another open of the same file.
        if let Some(existing) = self.get(project_id, path) {
            return Ok(existing.clone());
        }

        self.next_instance += 1;
        let overlay = FileOverlay::new(project_id, path, remote, self.next_instance);
        debug!("Opened {}:{} (instance {})", project_id, path, overlay.instance);
        self.overlays.insert(overlay.key(), overlay.clone());
        Ok(overlay)
    }

    /// Replace the local content. Never touches the cache.
    pub fn edit(&mut self, project_id: &str, path: &str, content: impl Into<String>) -> Result<u64, OverlayError> {
        let overlay = self.overlay_mut(project_id, path)?;
        overlay.local_content = Some(content.into());
        overlay.seq += 1;
        Ok(overlay.seq)
    }

    /// Drop the local edit. If remote content moved while it was pending, a
    /// refetch ticket is returned to catch up.
    pub fn discard(&mut self, project_id: &str, path: &str) -> Result<Option<RefetchTicket>, OverlayError> {
        let overlay = self.overlay_mut(project_id, path)?;
        if overlay.commit_in_flight {
            return Err(OverlayError::CommitInFlight);
        }
        overlay.local_content = None;
        overlay.seq += 1;
        let moved = overlay.pending_notice.take().is_some();
        Ok(moved.then(|| overlay.issue_refetch()))
    }

    /// Destroy the overlay. Outstanding tickets for it become stale.
    pub fn close(&mut self, project_id: &str, path: &str) -> bool {
        let closed = self.overlays.remove(&FileKey::new(project_id, path)).is_some();
        if closed {
            debug!("Closed {}:{}", project_id, path);
        }
        closed
    }

    /// Close every overlay of a project.
    pub fn close_project(&mut self, project_id: &str) -> usize {
        let before = self.overlays.len();
        self.overlays.retain(|key, _| key.project_id != project_id);
        before - self.overlays.len()
    }

    /// React to a push saying `path` changed remotely, optionally at `version`.
    pub fn on_remote_invalidation(
        &mut self,
        repo: &mut RepositoryCache,
        project_id: &str,
        path: &str,
        version: Option<&str>,
    ) -> InvalidationOutcome {
        let Some(overlay) = self.overlays.get_mut(&FileKey::new(project_id, path)) else {
            return InvalidationOutcome::NotOpen;
        };

        if let Some(version) = version {
            if overlay.remote_version.as_deref() == Some(version) && !overlay.commit_in_flight {
                return InvalidationOutcome::UpToDate;
            }
            if overlay.replaced_version.as_deref() == Some(version) {
                debug!("Ignoring stale invalidation of {}:{} at {}", project_id, path, version);
                return InvalidationOutcome::Stale;
            }
        }

        if overlay.commit_in_flight {
            overlay.remote_moved_during_commit = true;
            overlay.moved_version = version.map(str::to_string);
            return InvalidationOutcome::Deferred;
        }

        if overlay.is_dirty() {
            return InvalidationOutcome::Conflict(overlay.raise_notice(version.map(str::to_string)));
        }

        repo.invalidate_file(project_id, path);
        InvalidationOutcome::Refetch(overlay.issue_refetch())
    }

    /// Apply (or discard) the result of a refetch.
    pub fn complete_refetch(
        &mut self,
        repo: &mut RepositoryCache,
        ticket: &RefetchTicket,
        result: Result<FileContent, BackendError>,
    ) -> RefetchOutcome {
        let Some(overlay) = self
            .overlays
            .get_mut(&ticket.key)
            .filter(|overlay| overlay.instance == ticket.instance)
        else {
            debug!("Dropping refetch for closed {}:{}", ticket.project_id(), ticket.path());
            return RefetchOutcome::Discarded(DiscardReason::Closed);
        };

        let fetched = match result {
            Ok(fetched) => fetched,
            Err(error) => {
                warn!(
                    "Refetch of {}:{} failed, keeping last known content: {}",
                    ticket.project_id(),
                    ticket.path(),
                    error
                );
                return RefetchOutcome::Failed(error);
            }
        };

        if ticket.seq < overlay.last_commit_seq {
            debug!("Refetch of {} predates a local commit", ticket.path());
            return RefetchOutcome::Discarded(DiscardReason::SupersededByCommit);
        }
        if ticket.fetch_id < overlay.applied_fetch_id {
            return RefetchOutcome::Discarded(DiscardReason::Superseded);
        }
        if fetched.last_commit.is_some() && fetched.last_commit == overlay.replaced_version {
            debug!("Refetch of {} returned the pre-commit version", ticket.path());
            return RefetchOutcome::Discarded(DiscardReason::StaleVersion);
        }
        if overlay.is_dirty() || overlay.commit_in_flight {
            return RefetchOutcome::Conflict(overlay.raise_notice(fetched.last_commit));
        }

        overlay.applied_fetch_id = ticket.fetch_id;
        overlay.remote_content = fetched.content.clone();
        overlay.remote_version = fetched.last_commit.clone();
        info!(
            "Refreshed {}:{} to {}",
            ticket.project_id(),
            ticket.path(),
            fetched.last_commit.as_deref().unwrap_or("unknown version")
        );
        repo.put_file_content(ticket.project_id(), ticket.path(), fetched);
        RefetchOutcome::Applied
    }

    /// Start saving the local edit.
    pub fn begin_commit(&mut self, project_id: &str, path: &str) -> Result<CommitTicket, OverlayError> {
        let overlay = self.overlay_mut(project_id, path)?;
        if overlay.commit_in_flight {
            return Err(OverlayError::CommitInFlight);
        }
        let content = overlay
            .local_content
            .clone()
            .ok_or(OverlayError::NothingToCommit)?;

        overlay.commit_in_flight = true;
        overlay.remote_moved_during_commit = false;
        overlay.moved_version = None;
        Ok(CommitTicket {
            key: overlay.key(),
            content,
            instance: overlay.instance,
            seq: overlay.seq,
        })
    }

    /// Finish a save. `result` carries the new commit hash on success.
    pub fn complete_commit(
        &mut self,
        repo: &mut RepositoryCache,
        ticket: CommitTicket,
        result: Result<Option<String>, BackendError>,
    ) -> CommitOutcome {
        let project_id = ticket.key.project_id.as_str();
        let path = ticket.key.path.as_str();

        let Some(overlay) = self
            .overlays
            .get_mut(&ticket.key)
            .filter(|overlay| overlay.instance == ticket.instance)
        else {
            if result.is_ok() {
                repo.invalidate_file(project_id, path);
                return CommitOutcome::Closed;
            }
            return CommitOutcome::Failed {
                error: result.err().unwrap_or(BackendError::NotFound(path.to_string())),
                notice: None,
            };
        };
        overlay.commit_in_flight = false;

        match result {
            Ok(version) => {
                overlay.replaced_version = overlay.remote_version.take();
                overlay.remote_content = ticket.content.clone();
                overlay.remote_version = version.clone();
                // Edits made while the save was in flight stay pending.
                if overlay.seq == ticket.seq {
                    overlay.local_content = None;
                    overlay.pending_notice = None;
                }
                overlay.seq += 1;
                overlay.last_commit_seq = overlay.seq;
                overlay.remote_moved_during_commit = false;
                overlay.moved_version = None;

                repo.invalidate_file(project_id, path);
                repo.put_file_content(
                    project_id,
                    path,
                    FileContent {
                        content: ticket.content,
                        last_commit: version.clone(),
                    },
                );
                info!(
                    "Committed {}:{} as {}",
                    project_id,
                    path,
                    version.as_deref().unwrap_or("unknown version")
                );
                CommitOutcome::Committed { version }
            }
            Err(error) => {
                warn!("Commit of {}:{} failed: {}", project_id, path, error);
                let notice = overlay.remote_moved_during_commit.then(|| {
                    let moved = overlay.moved_version.take();
                    overlay.raise_notice(moved)
                });
                overlay.remote_moved_during_commit = false;
                CommitOutcome::Failed { error, notice }
            }
        }
    }

    /// Act on the collaborator's answer to a pending notice.
    pub fn resolve_reconciliation(
        &mut self,
        repo: &mut RepositoryCache,
        project_id: &str,
        path: &str,
        choice: ReconcileChoice,
    ) -> Result<Option<RefetchTicket>, OverlayError> {
        let overlay = self.overlay_mut(project_id, path)?;
        if overlay.pending_notice.is_none() {
            return Err(OverlayError::NoPendingNotice);
        }
        if overlay.commit_in_flight {
            return Err(OverlayError::CommitInFlight);
        }

        overlay.pending_notice = None;
        match choice {
            ReconcileChoice::KeepLocal => {
                info!("Keeping local edits of {}:{}", project_id, path);
                Ok(None)
            }
            ReconcileChoice::TakeRemote => {
                info!("Taking remote content of {}:{}", project_id, path);
                overlay.local_content = None;
                overlay.seq += 1;
                let ticket = overlay.issue_refetch();
                repo.invalidate_file(project_id, path);
                Ok(Some(ticket))
            }
        }
    }
}
