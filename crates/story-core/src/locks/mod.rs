//! Component lock table and conflict tracking.
//!
//! [`LockManager`] holds the locks as last known to this client. Local
//! requests are checked against that table; remote pushes replace records
//! wholesale. Contention never fails silently: every rejected request leaves
//! exactly one [`LockConflict`] per component until something resolves it.

pub mod types;

pub use types::{
    Actor, Capability, ComponentInfo, ComponentKind, ConflictKind, ConflictPriority, Lock,
    LockAction, LockAuditEntry, LockConflict, LockLevel, LockState, LockType,
    PotentialConflict, Resolution,
};

use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Audit entries kept before the oldest are dropped.
pub const DEFAULT_AUDIT_CAPACITY: usize = 256;

/// Rejected lock operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LockError {
    #[error("component {} is {} locked by {}", .0.component_id, .0.lock_level, .0.locked_by)]
    Conflict(Box<LockConflict>),
    #[error("{actor} may not change the lock on {component_id} held by {locked_by}")]
    PermissionDenied {
        component_id: String,
        actor: String,
        locked_by: String,
    },
    #[error("component {0} is not locked")]
    NotLocked(String),
    #[error("no outstanding conflict with id {0}")]
    ConflictNotFound(String),
    #[error("cannot request a lock at level {0}")]
    InvalidLevel(LockLevel),
}

/// Locks, outstanding conflicts and the audit trail for one project.
#[derive(Debug)]
pub struct LockManager {
    locks: BTreeMap<String, Lock>,
    /// Outstanding conflicts keyed by component id.
    conflicts: BTreeMap<String, LockConflict>,
    components: HashMap<String, ComponentInfo>,
    audit: VecDeque<LockAuditEntry>,
    audit_capacity: usize,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::with_audit_capacity(DEFAULT_AUDIT_CAPACITY)
    }

    pub fn with_audit_capacity(audit_capacity: usize) -> Self {
        Self {
            locks: BTreeMap::new(),
            conflicts: BTreeMap::new(),
            components: HashMap::new(),
            audit: VecDeque::new(),
            audit_capacity: audit_capacity.max(1),
        }
    }

    /// Attach display metadata used when describing conflicts.
    pub fn register_component(&mut self, component_id: &str, info: ComponentInfo) {
        self.components.insert(component_id.to_string(), info);
    }

    pub fn lock(&self, component_id: &str) -> Option<&Lock> {
        self.locks.get(component_id)
    }

    pub fn locks(&self) -> impl Iterator<Item = &Lock> {
        self.locks.values()
    }

    pub fn level_of(&self, component_id: &str) -> LockLevel {
        self.locks
            .get(component_id)
            .map(|lock| lock.level)
            .unwrap_or_default()
    }

    /// Editing capabilities for a component. Depends only on its current level.
    pub fn capability_for(&self, component_id: &str) -> Capability {
        Capability::for_level(self.level_of(component_id))
    }

    /// Ask for a lock on `component_id`.
    ///
    /// Granted when the component is unlocked, or when the existing lock is
    /// overridable and `actor` is someone else with override rights. Anything
    /// else records (or refreshes) the component's conflict and returns it.
    pub fn request_lock(
        &mut self,
        component_id: &str,
        level: LockLevel,
        reason: &str,
        actor: &Actor,
    ) -> Result<Lock, LockError> {
        if level == LockLevel::Unlocked {
            return Err(LockError::InvalidLevel(level));
        }

        let action = match self.locks.get(component_id) {
            None => LockAction::Locked,
            Some(existing)
                if existing.is_overridable()
                    && existing.locked_by != actor.id
                    && actor.can_override =>
            {
                LockAction::Overridden
            }
            Some(existing) => {
                let existing = existing.clone();
                let conflict = self.record_conflict(&existing, level, reason, actor);
                return Err(LockError::Conflict(Box::new(conflict)));
            }
        };

        let lock = Lock {
            id: Uuid::new_v4().to_string(),
            component_id: component_id.to_string(),
            level,
            lock_type: lock_type_for(actor),
            reason: reason.to_string(),
            locked_by: actor.id.clone(),
            locked_at: Utc::now(),
            shared_with: Vec::new(),
            can_override: level != LockLevel::Frozen,
        };

        if let Some(previous) = self.locks.insert(component_id.to_string(), lock.clone()) {
            info!(
                "{} overrode {} lock on {} held by {}",
                actor.id, previous.level, component_id, previous.locked_by
            );
        } else {
            info!("{} locked {} ({})", actor.id, component_id, level);
        }
        self.record(action, component_id, Some(&actor.id), Some(lock.clone()));
        Ok(lock)
    }

    /// Replace the caller's own lock with one at a different level.
    pub fn change_level(
        &mut self,
        component_id: &str,
        level: LockLevel,
        actor: &Actor,
    ) -> Result<Lock, LockError> {
        if level == LockLevel::Unlocked {
            return Err(LockError::InvalidLevel(level));
        }
        let existing = self
            .locks
            .get(component_id)
            .ok_or_else(|| LockError::NotLocked(component_id.to_string()))?;
        if existing.locked_by != actor.id {
            return Err(LockError::PermissionDenied {
                component_id: component_id.to_string(),
                actor: actor.id.clone(),
                locked_by: existing.locked_by.clone(),
            });
        }

        let lock = Lock {
            level,
            locked_at: Utc::now(),
            can_override: level != LockLevel::Frozen,
            ..existing.clone()
        };
        debug!("{} moved {} from {} to {}", actor.id, component_id, existing.level, level);
        self.locks.insert(component_id.to_string(), lock.clone());
        self.record(LockAction::LevelChanged, component_id, Some(&actor.id), Some(lock.clone()));
        Ok(lock)
    }

    /// Remove a lock. The owner may always release it; actors with override
    /// rights may release anyone's lock except a frozen one.
    pub fn release_lock(&mut self, component_id: &str, actor: &Actor) -> Result<Lock, LockError> {
        let existing = self
            .locks
            .get(component_id)
            .ok_or_else(|| LockError::NotLocked(component_id.to_string()))?;

        let owns = existing.locked_by == actor.id;
        let may_override = actor.can_override && existing.level != LockLevel::Frozen;
        if !owns && !may_override {
            warn!(
                "{} tried to release {} lock on {} held by {}",
                actor.id, existing.level, component_id, existing.locked_by
            );
            return Err(LockError::PermissionDenied {
                component_id: component_id.to_string(),
                actor: actor.id.clone(),
                locked_by: existing.locked_by.clone(),
            });
        }

        let released = self
            .locks
            .remove(component_id)
            .ok_or_else(|| LockError::NotLocked(component_id.to_string()))?;
        info!("{} released {} on {}", actor.id, released.level, component_id);
        self.record(LockAction::Unlocked, component_id, Some(&actor.id), Some(released.clone()));
        Ok(released)
    }

    /// Apply an external decision to an outstanding conflict.
    ///
    /// `Unlock` removes the blocking lock as well; `Skip` leaves it in place.
    /// Either way the conflict is consumed and returned.
    pub fn resolve_conflict(
        &mut self,
        conflict_id: &str,
        resolution: Resolution,
    ) -> Result<LockConflict, LockError> {
        let component_id = self
            .conflicts
            .values()
            .find(|c| c.id == conflict_id)
            .map(|c| c.component_id.clone())
            .ok_or_else(|| LockError::ConflictNotFound(conflict_id.to_string()))?;
        let conflict = self
            .conflicts
            .remove(&component_id)
            .ok_or_else(|| LockError::ConflictNotFound(conflict_id.to_string()))?;

        if resolution == Resolution::Unlock {
            if let Some(lock) = self.locks.remove(&component_id) {
                self.record(LockAction::Unlocked, &component_id, None, Some(lock));
            }
        }
        info!("Conflict {} on {} resolved ({:?})", conflict_id, component_id, resolution);
        self.record(LockAction::ConflictResolved, &component_id, None, None);
        Ok(conflict)
    }

    /// Drop a conflict that was resolved elsewhere, leaving locks untouched.
    pub fn forget_conflict(&mut self, conflict_id: &str) -> Option<LockConflict> {
        let component_id = self
            .conflicts
            .values()
            .find(|c| c.id == conflict_id)?
            .component_id
            .clone();
        self.conflicts.remove(&component_id)
    }

    /// Replace or remove one component's lock as pushed by the server.
    /// Returns the record it replaced.
    pub fn apply_remote(&mut self, component_id: &str, lock: Option<Lock>) -> Option<Lock> {
        let action = if lock.is_some() {
            LockAction::RemoteUpdated
        } else {
            LockAction::RemoteRemoved
        };
        let previous = match lock.clone() {
            Some(lock) => self.locks.insert(component_id.to_string(), lock),
            None => {
                // Nothing left to conflict with.
                self.conflicts.remove(component_id);
                self.locks.remove(component_id)
            }
        };
        debug!("Remote lock update on {}: {:?}", component_id, action);
        self.record(action, component_id, None, lock);
        previous
    }

    /// Rebuild the table from a server snapshot.
    ///
    /// Locks are replaced wholesale. Server conflicts replace local ones for
    /// the same component; local conflicts on components that are no longer
    /// locked are dropped.
    pub fn replace_all(
        &mut self,
        locks: impl IntoIterator<Item = Lock>,
        conflicts: impl IntoIterator<Item = LockConflict>,
    ) {
        self.locks = locks
            .into_iter()
            .map(|lock| (lock.component_id.clone(), lock))
            .collect();

        let locks = &self.locks;
        self.conflicts.retain(|component_id, _| locks.contains_key(component_id));
        for conflict in conflicts {
            self.conflicts.insert(conflict.component_id.clone(), conflict);
        }
        info!(
            "Lock table replaced: {} locks, {} conflicts",
            self.locks.len(),
            self.conflicts.len()
        );
    }

    /// Put back a record exactly as it was, without auditing.
    pub fn restore(&mut self, component_id: &str, lock: Option<Lock>) {
        debug!("Restoring lock state on {}", component_id);
        match lock {
            Some(lock) => self.locks.insert(component_id.to_string(), lock),
            None => self.locks.remove(component_id),
        };
    }

    /// Reinstate a conflict taken out by `resolve_conflict`, unless a newer
    /// one has been recorded for the component since.
    pub fn restore_conflict(&mut self, conflict: LockConflict) {
        debug!("Restoring conflict {} on {}", conflict.id, conflict.component_id);
        self.conflicts
            .entry(conflict.component_id.clone())
            .or_insert(conflict);
    }

    /// Which of `component_ids` are locked, and whether `actor` could override each.
    pub fn check_conflicts<'a>(
        &self,
        component_ids: impl IntoIterator<Item = &'a str>,
        actor: &Actor,
    ) -> Vec<PotentialConflict> {
        component_ids
            .into_iter()
            .filter_map(|id| self.locks.get(id))
            .filter(|lock| lock.locked_by != actor.id)
            .map(|lock| PotentialConflict {
                component_id: lock.component_id.clone(),
                existing_lock: lock.clone(),
                can_override: lock.is_overridable() && actor.can_override,
            })
            .collect()
    }

    pub fn conflict_for(&self, component_id: &str) -> Option<&LockConflict> {
        self.conflicts.get(component_id)
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &LockConflict> {
        self.conflicts.values()
    }

    /// Oldest first.
    pub fn audit(&self) -> impl Iterator<Item = &LockAuditEntry> {
        self.audit.iter()
    }

    pub fn clear(&mut self) {
        self.locks.clear();
        self.conflicts.clear();
        self.components.clear();
        self.audit.clear();
    }

    fn record_conflict(
        &mut self,
        existing: &Lock,
        level: LockLevel,
        reason: &str,
        actor: &Actor,
    ) -> LockConflict {
        let component_id = existing.component_id.as_str();
        let info = self
            .components
            .get(component_id)
            .cloned()
            .unwrap_or_else(|| ComponentInfo {
                kind: ComponentKind::Component,
                name: component_id.to_string(),
            });

        let (id, created_at, mut affected_users) = match self.conflicts.get(component_id) {
            Some(previous) => (
                previous.id.clone(),
                previous.created_at,
                previous.affected_users.clone(),
            ),
            None => (Uuid::new_v4().to_string(), Utc::now(), Vec::new()),
        };
        for user in [&existing.locked_by, &actor.id] {
            if !affected_users.contains(user) {
                affected_users.push(user.clone());
            }
        }

        let conflict = LockConflict {
            id,
            component_id: component_id.to_string(),
            component_type: info.kind,
            component_name: info.name.clone(),
            kind: ConflictKind::AlreadyLocked,
            description: format!(
                "{} is {} locked by {}",
                info.name, existing.level, existing.locked_by
            ),
            current_state: LockState::from(existing),
            conflicting_state: LockState {
                level,
                locked_by: actor.id.clone(),
                reason: reason.to_string(),
                lock_type: lock_type_for(actor),
            },
            priority: ConflictPriority::from(existing.level),
            affected_users,
            locked_by: existing.locked_by.clone(),
            lock_level: existing.level,
            created_at,
            reason: existing.reason.clone(),
        };

        warn!(
            "Lock conflict {} on {}: {} requested {}, held {} by {}",
            conflict.id, component_id, actor.id, level, existing.level, existing.locked_by
        );
        self.conflicts
            .insert(component_id.to_string(), conflict.clone());
        conflict
    }

    fn record(
        &mut self,
        action: LockAction,
        component_id: &str,
        actor: Option<&str>,
        lock: Option<Lock>,
    ) {
        if self.audit.len() == self.audit_capacity {
            self.audit.pop_front();
        }
        self.audit.push_back(LockAuditEntry {
            action,
            component_id: component_id.to_string(),
            actor: actor.map(str::to_string),
            lock,
            at: Utc::now(),
        });
    }
}

fn lock_type_for(actor: &Actor) -> LockType {
    if actor.can_override {
        LockType::Editorial
    } else {
        LockType::Personal
    }
}
