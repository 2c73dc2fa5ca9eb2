//! Core data models for the fleet coordinator.
//!
//! Every relation the coordinator persists is a plain record here; state
//! columns are tagged enums so that illegal states cannot be represented.
//! Timestamps are `DateTime<Utc>`; stores decide how to encode them.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type NodeId = i64;
pub type NamespaceId = i64;
pub type ProjectId = i64;
pub type EnabledNamespaceId = i64;
pub type ReplicaId = i64;
pub type IndexId = i64;
pub type RepositoryId = i64;
pub type TaskId = i64;
pub type PartitionId = i64;

/// Implements `as_str`, `Display` and `FromStr` for a unit-only state enum.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> anyhow::Result<Self> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => bail!("unknown {} value: '{}'", stringify!($name), other),
                }
            }
        }
    };
}

// ============ Catalog (mirrored external data) ============

/// A tenant boundary (user or group). Only roots are indexed as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub id: NamespaceId,
    #[serde(default)]
    pub parent_id: Option<NamespaceId>,
    pub name: String,
    /// Total repository bytes across the namespace hierarchy.
    #[serde(default)]
    pub repository_size: u64,
}

impl Namespace {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// A project whose repository gets indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub namespace_id: NamespaceId,
    pub root_namespace_id: NamespaceId,
}

/// Billing state backing a root namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub namespace_id: NamespaceId,
    pub paid: bool,
    #[serde(default)]
    pub ends_on: Option<NaiveDate>,
}

// ============ Nodes ============

/// Free-form metadata reported by a node on every heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
}

/// A remote search backend instance.
///
/// `id` is `None` until the node has been persisted through
/// [`Store::save_node`](crate::store::Store::save_node).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: Option<NodeId>,
    pub uuid: Uuid,
    pub index_base_url: String,
    pub search_base_url: String,
    pub last_seen_at: DateTime<Utc>,
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub metadata: NodeMetadata,
}

impl Node {
    pub fn free_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }

    /// Fraction of storage in use, `0.0` when the node reports no capacity.
    pub fn storage_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64
    }

    /// True when the node reports it is running at (or above) its concurrency.
    pub fn is_saturated(&self) -> bool {
        match (self.metadata.task_count, self.metadata.concurrency) {
            (Some(count), Some(concurrency)) if concurrency > 0 => count >= concurrency,
            _ => false,
        }
    }
}

// ============ Placement ============

/// A root namespace that is eligible for search indexing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnabledNamespace {
    pub id: EnabledNamespaceId,
    pub root_namespace_id: NamespaceId,
    /// Whether the namespace's indices may serve live searches.
    pub search: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    Pending,
    Ready,
}

string_enum!(ReplicaState {
    Pending => "pending",
    Ready => "ready",
});

/// A logical, node-independent copy of a namespace's index content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replica {
    pub id: ReplicaId,
    pub enabled_namespace_id: EnabledNamespaceId,
    pub namespace_id: NamespaceId,
    pub state: ReplicaState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    Pending,
    Initializing,
    Ready,
}

string_enum!(IndexState {
    Pending => "pending",
    Initializing => "initializing",
    Ready => "ready",
});

/// Physical placement of a namespace's index onto one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub id: IndexId,
    pub enabled_namespace_id: EnabledNamespaceId,
    pub replica_id: Option<ReplicaId>,
    pub node_id: NodeId,
    pub namespace_id: NamespaceId,
    pub state: IndexState,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for an [`Index`].
#[derive(Debug, Clone)]
pub struct NewIndex {
    pub enabled_namespace_id: EnabledNamespaceId,
    pub replica_id: Option<ReplicaId>,
    pub node_id: NodeId,
    pub namespace_id: NamespaceId,
    pub state: IndexState,
    pub created_at: DateTime<Utc>,
}

/// An index deleted from the store together with the projects it tracked.
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedIndex {
    pub index: Index,
    pub project_identifiers: Vec<ProjectId>,
}

// ============ Repositories ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryState {
    Pending,
    Ready,
}

string_enum!(RepositoryState {
    Pending => "pending",
    Ready => "ready",
});

/// Indexing state of one project's repository within one index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: RepositoryId,
    pub index_id: IndexId,
    /// Live project reference; cleared when the project is deleted.
    pub project_id: Option<ProjectId>,
    /// Immutable project identity, kept after the project is gone.
    pub project_identifier: ProjectId,
    pub state: RepositoryState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for a [`Repository`].
#[derive(Debug, Clone)]
pub struct NewRepository {
    pub index_id: IndexId,
    pub project_id: Option<ProjectId>,
    pub project_identifier: ProjectId,
    pub created_at: DateTime<Utc>,
}

// ============ Task log ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    IndexRepo,
    ForceIndexRepo,
    DeleteRepo,
}

string_enum!(TaskType {
    IndexRepo => "index_repo",
    ForceIndexRepo => "force_index_repo",
    DeleteRepo => "delete_repo",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Done,
    Failed,
    Orphaned,
}

string_enum!(TaskState {
    Pending => "pending",
    Done => "done",
    Failed => "failed",
    Orphaned => "orphaned",
});

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Pending)
    }
}

/// A dispatch lease held by one `dispatch_batch` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// One unit of dispatchable work targeted at a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub partition_id: PartitionId,
    /// Owning repository; cleared when the repository is destroyed.
    pub repository_id: Option<RepositoryId>,
    pub node_id: NodeId,
    pub project_identifier: ProjectId,
    pub task_type: TaskType,
    pub state: TaskState,
    pub perform_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub claim: Option<Claim>,
}

impl Task {
    /// Keyset position of this task in dispatch order.
    pub fn cursor(&self) -> TaskCursor {
        TaskCursor {
            perform_at: self.perform_at,
            id: self.id,
        }
    }

    /// True if another dispatch currently holds an unexpired lease on the task.
    pub fn is_claimed(&self, now: DateTime<Utc>) -> bool {
        self.claim.is_some_and(|c| c.expires_at > now)
    }

    /// Whether an outcome reported under `token` may resolve the task. A
    /// report that names a token must match the task's current lease, so a
    /// worker whose lease was taken over cannot resolve the newer claim.
    pub fn accepts_outcome(&self, token: Option<&Uuid>) -> bool {
        match (token, self.claim) {
            (Some(reported), Some(claim)) => &claim.token == reported,
            _ => true,
        }
    }
}

/// Insert payload for a [`Task`]; the store assigns id and partition.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub repository_id: Option<RepositoryId>,
    pub node_id: NodeId,
    pub project_identifier: ProjectId,
    pub task_type: TaskType,
    pub perform_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Keyset cursor over `(perform_at ASC, id ASC)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskCursor {
    pub perform_at: DateTime<Utc>,
    pub id: TaskId,
}

/// A time-bounded shard of the task log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub id: PartitionId,
    pub opened_at: DateTime<Utc>,
}
