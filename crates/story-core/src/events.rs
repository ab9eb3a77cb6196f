//! Events surfaced to the collaborator layer (UI, toasts, logs).

use serde::Serialize;

use crate::locks::types::{Lock, LockConflict};
use crate::overlay::ReconciliationNotice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// A user-facing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
}

impl Notification {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Error,
            message: message.into(),
        }
    }

    /// Summary for a `git_update` touching `changed` files.
    pub fn project_updated(changed: usize) -> Self {
        match changed {
            0 => Self::info("Project updated"),
            1 => Self::info("Project updated: 1 file changed"),
            n => Self::info(format!("Project updated: {n} files changed")),
        }
    }
}

/// Everything the sync engine reports upward. Conflicts always travel as
/// data; nothing here is ever dropped silently by the engine itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    Notification(Notification),
    /// A component's lock changed, locally or by push.
    LockChanged {
        #[serde(rename = "componentId")]
        component_id: String,
        lock: Option<Lock>,
    },
    /// Wrapped so the conflict's own `type` field does not collide with
    /// the event tag.
    LockConflict { conflict: LockConflict },
    ConflictResolved {
        #[serde(rename = "conflictId")]
        conflict_id: String,
    },
    /// Remote content moved under a file with unsaved local edits.
    Reconciliation(ReconciliationNotice),
    /// A refetch triggered by invalidation failed; the overlay kept its
    /// last known remote content.
    RefetchFailed {
        #[serde(rename = "projectId")]
        project_id: String,
        path: String,
        error: String,
    },
    /// The channel gave up reconnecting.
    ConnectionLost { attempts: u32 },
}
