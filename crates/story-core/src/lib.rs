//! story-core: lock, cache and optimistic-content engine for collaborative
//! story projects.
//!
//! Everything in this crate is runtime-agnostic. Network I/O happens behind
//! the [`RepositoryBackend`] trait, and push messages arrive already parsed
//! as [`PushMessage`]s. The tokio side (WebSocket channel, REST client,
//! session event loop) lives in the `story-sync` crate.

pub mod backend;
pub mod cache;
pub mod coordinator;
pub mod events;
pub mod locks;
pub mod message;
pub mod overlay;
pub mod repo;

#[cfg(test)]
mod testing;

pub use backend::{
    BackendError, BranchInfo, CachedResource, CommitInfo, FileContent, HistoryPage,
    RepositoryBackend, RepositoryStatus, SaveReceipt, TreeEntry,
};
pub use cache::{CacheCategory, CacheConfig, CacheKey, CacheStore, Clock, KeyPrefix, ManualClock, SystemClock};
pub use coordinator::{SyncContext, SyncCoordinator, SyncOutcome};
pub use events::{Notification, NotificationLevel, SyncEvent};
pub use locks::{
    Actor, Capability, ComponentInfo, ComponentKind, LockConflict, LockError, LockLevel,
    Lock, LockManager, LockType, PotentialConflict, Resolution,
};
pub use message::{BranchChanged, FileChanged, GitUpdate, MessageError, OutboundFrame, PushMessage};
pub use overlay::{
    CommitOutcome, CommitTicket, DiscardReason, FileKey, FileOverlay, InvalidationOutcome,
    OptimisticContentStore, OverlayError, ReconcileChoice, ReconciliationNotice, RefetchOutcome, RefetchTicket,
};
pub use repo::RepositoryCache;
