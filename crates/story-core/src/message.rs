//! Push-channel wire format.
//!
//! The server speaks two dialects over the same socket. Repository events are
//! flat objects tagged by `type`:
//!
//! ```json
//! {"type": "git_update", "project_id": "p1", "updated_files": ["scenes/1.md"]}
//! ```
//!
//! Lock traffic and control messages are `{channel, data}` envelopes whose
//! channel is `name` or `name:{projectId}`:
//!
//! ```json
//! {"channel": "locks:p1", "data": {"componentId": "scene-1", "lock": null}}
//! ```
//!
//! Both parse into a single [`PushMessage`]; its [`topic`](PushMessage::topic)
//! is what channel subscribers register for.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::locks::types::{Lock, LockConflict, Resolution};

/// Errors parsing an inbound frame. The channel logs and drops these.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message has neither `type` nor `channel`")]
    Untyped,
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("unknown channel {0:?}")]
    UnknownChannel(String),
    #[error("channel {0:?} is missing its project id")]
    MissingProject(String),
    #[error("invalid {topic} payload: {source}")]
    Payload {
        topic: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Files touched by a git operation on the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitUpdate {
    /// Absent means the currently subscribed project.
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub updated_files: Option<Vec<String>>,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    /// Commit produced by the operation; doubles as the new version marker.
    #[serde(default)]
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl GitUpdate {
    pub fn updated_files(&self) -> &[String] {
        self.updated_files.as_deref().unwrap_or(&[])
    }
}

/// A single file written outside the batch path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChanged {
    pub file_path: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub change_type: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchChanged {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Any inbound push the sync engine understands.
#[derive(Debug, Clone, PartialEq)]
pub enum PushMessage {
    GitUpdate(GitUpdate),
    FileChanged(FileChanged),
    BranchChanged(BranchChanged),
    /// One component's lock was set (`Some`) or removed (`None`).
    LockUpdated {
        project_id: String,
        component_id: String,
        lock: Option<Lock>,
    },
    /// Several locks changed at once; the client should ask for a snapshot.
    LocksBulkUpdated {
        project_id: String,
        affected_components: Vec<String>,
    },
    ConflictResolved {
        project_id: String,
        conflict_id: String,
    },
    /// Full lock table, sent in answer to a sync request.
    SyncSnapshot {
        project_id: String,
        locks: BTreeMap<String, Lock>,
        conflicts: Vec<LockConflict>,
    },
    Subscribed {
        project_id: String,
        status: String,
    },
    TokenRefresh {
        token: String,
    },
    ServerError {
        message: String,
        code: Option<String>,
    },
}

#[derive(Deserialize)]
struct LockPayload {
    #[serde(rename = "componentId")]
    component_id: String,
    #[serde(default)]
    lock: Option<Lock>,
}

#[derive(Deserialize)]
struct BulkPayload {
    #[serde(default)]
    affected_components: Vec<String>,
}

#[derive(Deserialize)]
struct ConflictPayload {
    #[serde(rename = "conflictId")]
    conflict_id: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize)]
struct SnapshotPayload {
    #[serde(default)]
    locks: BTreeMap<String, Lock>,
    #[serde(default)]
    conflicts: Vec<LockConflict>,
}

#[derive(Deserialize)]
struct SubscriptionPayload {
    project_id: String,
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
struct TokenPayload {
    token: String,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<String>,
}

fn payload<T: serde::de::DeserializeOwned>(
    topic: &'static str,
    value: Value,
) -> Result<T, MessageError> {
    serde_json::from_value(value).map_err(|source| MessageError::Payload { topic, source })
}

impl PushMessage {
    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let mut value: Value = serde_json::from_str(text)?;

        if let Some(kind) = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string)
        {
            return match kind.as_str() {
                "git_update" => Ok(PushMessage::GitUpdate(payload("git_update", value)?)),
                "file_changed" => Ok(PushMessage::FileChanged(payload("file_changed", value)?)),
                "branch_changed" => {
                    Ok(PushMessage::BranchChanged(payload("branch_changed", value)?))
                }
                _ => Err(MessageError::UnknownType(kind)),
            };
        }

        let channel = value
            .get("channel")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(MessageError::Untyped)?;
        let data = value
            .get_mut("data")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Self::parse_envelope(&channel, data)
    }

    fn parse_envelope(channel: &str, data: Value) -> Result<Self, MessageError> {
        let (name, project) = match channel.split_once(':') {
            Some((name, project)) if !project.is_empty() => (name, Some(project)),
            Some((name, _)) => (name, None),
            None => (channel, None),
        };
        let project_id = || {
            project
                .map(str::to_string)
                .ok_or_else(|| MessageError::MissingProject(channel.to_string()))
        };

        match name {
            "locks" => {
                let project_id = project_id()?;
                if data.get("bulk_update").and_then(Value::as_bool) == Some(true) {
                    let bulk: BulkPayload = payload("locks", data)?;
                    Ok(PushMessage::LocksBulkUpdated {
                        project_id,
                        affected_components: bulk.affected_components,
                    })
                } else {
                    let update: LockPayload = payload("locks", data)?;
                    Ok(PushMessage::LockUpdated {
                        project_id,
                        component_id: update.component_id,
                        lock: update.lock,
                    })
                }
            }
            "conflicts" => {
                let project_id = project_id()?;
                let update: ConflictPayload = payload("conflicts", data)?;
                match update.status.as_deref() {
                    None | Some("resolved") => Ok(PushMessage::ConflictResolved {
                        project_id,
                        conflict_id: update.conflict_id,
                    }),
                    Some(other) => Err(MessageError::Payload {
                        topic: "conflicts",
                        source: <serde_json::Error as serde::de::Error>::custom(format!(
                            "unsupported conflict status {other:?}"
                        )),
                    }),
                }
            }
            "sync-response" => {
                let project_id = project_id()?;
                let snapshot: SnapshotPayload = payload("sync-response", data)?;
                Ok(PushMessage::SyncSnapshot {
                    project_id,
                    locks: snapshot.locks,
                    conflicts: snapshot.conflicts,
                })
            }
            "subscription" => {
                let ack: SubscriptionPayload = payload("subscription", data)?;
                Ok(PushMessage::Subscribed {
                    project_id: ack.project_id,
                    status: ack.status,
                })
            }
            "token_refresh" => {
                let refresh: TokenPayload = payload("token_refresh", data)?;
                Ok(PushMessage::TokenRefresh {
                    token: refresh.token,
                })
            }
            "error" => {
                let error: ErrorPayload = payload("error", data)?;
                Ok(PushMessage::ServerError {
                    message: error.message,
                    code: error.code,
                })
            }
            _ => Err(MessageError::UnknownChannel(channel.to_string())),
        }
    }

    /// Subscription topic this message is dispatched under.
    pub fn topic(&self) -> &'static str {
        match self {
            PushMessage::GitUpdate(_) => "git_update",
            PushMessage::FileChanged(_) => "file_changed",
            PushMessage::BranchChanged(_) => "branch_changed",
            PushMessage::LockUpdated { .. } | PushMessage::LocksBulkUpdated { .. } => "locks",
            PushMessage::ConflictResolved { .. } => "conflicts",
            PushMessage::SyncSnapshot { .. } => "sync-response",
            PushMessage::Subscribed { .. } => "subscription",
            PushMessage::TokenRefresh { .. } => "token_refresh",
            PushMessage::ServerError { .. } => "error",
        }
    }

    /// Project the message names, if it names one.
    pub fn project_id(&self) -> Option<&str> {
        match self {
            PushMessage::GitUpdate(update) => update.project_id.as_deref(),
            PushMessage::FileChanged(change) => change.project_id.as_deref(),
            PushMessage::BranchChanged(change) => change.project_id.as_deref(),
            PushMessage::LockUpdated { project_id, .. }
            | PushMessage::LocksBulkUpdated { project_id, .. }
            | PushMessage::ConflictResolved { project_id, .. }
            | PushMessage::SyncSnapshot { project_id, .. }
            | PushMessage::Subscribed { project_id, .. } => Some(project_id),
            PushMessage::TokenRefresh { .. } | PushMessage::ServerError { .. } => None,
        }
    }
}

/// Client-to-server envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub channel: String,
    #[serde(default)]
    pub data: Value,
}

impl OutboundFrame {
    /// `subscribe:{projectId}`, sent on every (re)connect.
    pub fn subscribe(project_id: &str) -> Self {
        Self {
            channel: format!("subscribe:{project_id}"),
            data: json!({}),
        }
    }

    /// Ask the server for the project's full lock table.
    pub fn sync_request(project_id: &str) -> Self {
        Self {
            channel: format!("sync-request:{project_id}"),
            data: json!({}),
        }
    }

    /// Tell other clients a lock was set or removed.
    pub fn lock_update(project_id: &str, component_id: &str, lock: Option<&Lock>) -> Self {
        Self {
            channel: format!("lock-update:{project_id}"),
            data: json!({ "componentId": component_id, "lock": lock }),
        }
    }

    pub fn conflict_resolution(project_id: &str, conflict_id: &str, resolution: Resolution) -> Self {
        Self {
            channel: format!("conflict-resolution:{project_id}"),
            data: json!({
                "conflictId": conflict_id,
                "resolution": resolution,
                "status": "resolved",
            }),
        }
    }

    pub fn to_text(&self) -> String {
        json!({ "channel": self.channel, "data": self.data }).to_string()
    }
}
