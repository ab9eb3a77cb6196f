//! Lock and conflict records as exchanged with the backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Graded restriction on edits, ordered `Unlocked < Soft < Hard < Frozen`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LockLevel {
    #[default]
    Unlocked,
    Soft,
    Hard,
    Frozen,
}

impl LockLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockLevel::Unlocked => "unlocked",
            LockLevel::Soft => "soft",
            LockLevel::Hard => "hard",
            LockLevel::Frozen => "frozen",
        }
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockType {
    #[default]
    Personal,
    Editorial,
    Collaborative,
}

/// A component lock. Exactly one may be active per component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lock {
    pub id: String,
    pub component_id: String,
    pub level: LockLevel,
    #[serde(rename = "type", default)]
    pub lock_type: LockType,
    #[serde(default)]
    pub reason: String,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    #[serde(default)]
    pub shared_with: Vec<String>,
    #[serde(default)]
    pub can_override: bool,
}

impl Lock {
    /// Frozen locks are never overridable, whatever `can_override` says.
    pub fn is_overridable(&self) -> bool {
        self.can_override && self.level != LockLevel::Frozen
    }
}

/// Editing capabilities derived from a lock level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    pub read_only: bool,
    pub ai_suggestions_only: bool,
    pub requires_confirmation: bool,
}

impl Capability {
    pub const fn for_level(level: LockLevel) -> Self {
        match level {
            LockLevel::Unlocked => Capability {
                read_only: false,
                ai_suggestions_only: false,
                requires_confirmation: false,
            },
            LockLevel::Soft => Capability {
                read_only: false,
                ai_suggestions_only: true,
                requires_confirmation: false,
            },
            LockLevel::Hard => Capability {
                read_only: false,
                ai_suggestions_only: false,
                requires_confirmation: true,
            },
            LockLevel::Frozen => Capability {
                read_only: true,
                ai_suggestions_only: false,
                requires_confirmation: false,
            },
        }
    }
}

/// Whoever is asking for a lock operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Actor {
    pub id: String,
    /// Editors may override overridable locks and release other people's locks.
    pub can_override: bool,
}

impl Actor {
    pub fn member(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            can_override: false,
        }
    }

    pub fn editor(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            can_override: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Chapter,
    Character,
    Scene,
    #[default]
    #[serde(other)]
    Component,
}

/// Display metadata for a lockable component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentInfo {
    pub kind: ComponentKind,
    pub name: String,
}

/// Snapshot of one side of a conflict.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockState {
    pub level: LockLevel,
    pub locked_by: String,
    pub reason: String,
    #[serde(rename = "type")]
    pub lock_type: LockType,
}

impl From<&Lock> for LockState {
    fn from(lock: &Lock) -> Self {
        Self {
            level: lock.level,
            locked_by: lock.locked_by.clone(),
            reason: lock.reason.clone(),
            lock_type: lock.lock_type,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPriority {
    #[default]
    Low,
    Medium,
    High,
}

impl From<LockLevel> for ConflictPriority {
    fn from(level: LockLevel) -> Self {
        match level {
            LockLevel::Frozen => ConflictPriority::High,
            LockLevel::Hard => ConflictPriority::Medium,
            LockLevel::Soft | LockLevel::Unlocked => ConflictPriority::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    #[default]
    AlreadyLocked,
    #[serde(other)]
    Other,
}

/// Disagreement between a requested lock and the one already held.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockConflict {
    pub id: String,
    pub component_id: String,
    #[serde(default)]
    pub component_type: ComponentKind,
    #[serde(default)]
    pub component_name: String,
    #[serde(rename = "type", default)]
    pub kind: ConflictKind,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub current_state: LockState,
    #[serde(default)]
    pub conflicting_state: LockState,
    #[serde(default)]
    pub priority: ConflictPriority,
    #[serde(default)]
    pub affected_users: Vec<String>,
    #[serde(default)]
    pub locked_by: String,
    #[serde(default)]
    pub lock_level: LockLevel,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub reason: String,
}

/// External decision applied to a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Remove the blocking lock.
    Unlock,
    /// Abandon the requested action and keep the lock.
    Skip,
}

/// Pre-flight answer for one component.
#[derive(Debug, Clone, PartialEq)]
pub struct PotentialConflict {
    pub component_id: String,
    pub existing_lock: Lock,
    pub can_override: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockAction {
    Locked,
    Overridden,
    LevelChanged,
    Unlocked,
    RemoteUpdated,
    RemoteRemoved,
    ConflictResolved,
}

/// One line of the lock audit trail.
#[derive(Debug, Clone, PartialEq)]
pub struct LockAuditEntry {
    pub action: LockAction,
    pub component_id: String,
    pub actor: Option<String>,
    pub lock: Option<Lock>,
    pub at: DateTime<Utc>,
}
