//! Storage abstraction for the fleet coordinator.
//!
//! The [`Store`] trait defines every persistence operation the placement,
//! repository, task-log and reconciler layers need, so the coordination
//! logic can run against SQLite in production and [`memory::InMemoryStore`]
//! in tests.
//!
//! Operations that must be race-free are expressed as single store calls
//! (`save_node`, `insert_repository`, `insert_repository_task`,
//! `claim_tasks`, `open_partition`, `detach_partition`) so each backend can
//! make them atomic in its own way.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    Claim, EnabledNamespace, EnabledNamespaceId, Index, IndexId, IndexState, Namespace,
    NamespaceId, NewIndex, NewRepository, NewTask, Node, NodeId, Partition, PartitionId, Project,
    ProjectId, RemovedIndex, Replica, Repository, RepositoryId, RepositoryState, Subscription,
    Task, TaskCursor, TaskId, TaskState,
};

/// Abstract storage backend for the coordinator.
///
/// # Operations
///
/// | Group | Methods |
/// |-------|---------|
/// | Catalog | `upsert_namespace`, `get_namespace`, `upsert_project`, `get_project`, `delete_project`, `existing_project_ids`, `project_ids_for_root_namespace`, `upsert_subscription`, `subscriptions_after` |
/// | Nodes | `save_node`, `find_node_by_uuid`, `get_node`, `list_nodes` |
/// | Placement | `create_enabled_namespace`, `get_enabled_namespace`, `find_enabled_namespace`, `list_enabled_namespaces`, `set_namespace_search`, `delete_enabled_namespace`, `create_replica`, `replicas_for_namespace`, `insert_index`, `get_index`, `list_indices`, `indices_for_enabled_namespace`, `set_index_state`, `delete_index` |
/// | Repositories | `insert_repository`, `insert_repository_task`, `find_repository`, `get_repository`, `get_repositories`, `repositories_for_index`, `non_ready_repositories`, `set_repository_state` |
/// | Task log | `partitions`, `open_partition`, `detach_partition`, `insert_task`, `get_task`, `oldest_task`, `tasks_for_partition`, `pending_count`, `pending_tasks_after`, `claim_tasks`, `release_claim`, `mark_tasks_orphaned`, `resolve_task` |
#[async_trait]
pub trait Store: Send + Sync {
    // ============ Catalog ============

    async fn upsert_namespace(&self, namespace: &Namespace) -> Result<()>;

    async fn get_namespace(&self, id: NamespaceId) -> Result<Option<Namespace>>;

    async fn upsert_project(&self, project: &Project) -> Result<()>;

    async fn get_project(&self, id: ProjectId) -> Result<Option<Project>>;

    /// Remove a project from the catalog, clearing `project_id` on every
    /// repository that referenced it. Returns whether the project existed.
    async fn delete_project(&self, id: ProjectId) -> Result<bool>;

    /// The subset of `ids` that still exist in the catalog.
    async fn existing_project_ids(&self, ids: &[ProjectId]) -> Result<Vec<ProjectId>>;

    /// All projects below a root namespace, ascending by id.
    async fn project_ids_for_root_namespace(&self, root: NamespaceId) -> Result<Vec<ProjectId>>;

    async fn upsert_subscription(&self, subscription: &Subscription) -> Result<()>;

    /// Keyset page of subscriptions ordered by `namespace_id`.
    async fn subscriptions_after(
        &self,
        after: Option<NamespaceId>,
        limit: usize,
    ) -> Result<Vec<Subscription>>;

    // ============ Nodes ============

    /// Insert or update a node keyed by `uuid`. Returns the stored row.
    async fn save_node(&self, node: &Node) -> Result<Node>;

    async fn find_node_by_uuid(&self, uuid: &Uuid) -> Result<Option<Node>>;

    async fn get_node(&self, id: NodeId) -> Result<Option<Node>>;

    async fn list_nodes(&self) -> Result<Vec<Node>>;

    // ============ Placement ============

    /// Find-or-create by `root_namespace_id`.
    async fn create_enabled_namespace(
        &self,
        root_namespace_id: NamespaceId,
        search: bool,
        now: DateTime<Utc>,
    ) -> Result<EnabledNamespace>;

    async fn get_enabled_namespace(&self, id: EnabledNamespaceId)
        -> Result<Option<EnabledNamespace>>;

    async fn find_enabled_namespace(
        &self,
        root_namespace_id: NamespaceId,
    ) -> Result<Option<EnabledNamespace>>;

    async fn list_enabled_namespaces(&self) -> Result<Vec<EnabledNamespace>>;

    async fn set_namespace_search(
        &self,
        id: EnabledNamespaceId,
        search: bool,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Delete an enabled namespace with its replicas and indices (and their
    /// repositories). Returns the indices that were removed.
    async fn delete_enabled_namespace(&self, id: EnabledNamespaceId) -> Result<Vec<RemovedIndex>>;

    async fn create_replica(
        &self,
        enabled_namespace_id: EnabledNamespaceId,
        namespace_id: NamespaceId,
    ) -> Result<Replica>;

    async fn replicas_for_namespace(
        &self,
        enabled_namespace_id: EnabledNamespaceId,
    ) -> Result<Vec<Replica>>;

    async fn insert_index(&self, index: &NewIndex) -> Result<Index>;

    async fn get_index(&self, id: IndexId) -> Result<Option<Index>>;

    async fn list_indices(&self) -> Result<Vec<Index>>;

    async fn indices_for_enabled_namespace(&self, id: EnabledNamespaceId) -> Result<Vec<Index>>;

    async fn set_index_state(&self, id: IndexId, state: IndexState) -> Result<()>;

    /// Delete an index and its repositories; tasks keep their rows with
    /// `repository_id` cleared. The removed index carries the project
    /// identifiers of the repositories deleted with it.
    async fn delete_index(&self, id: IndexId) -> Result<Option<RemovedIndex>>;

    // ============ Repositories ============

    /// Insert a repository. Fails with
    /// [`CoordinatorError::DuplicateRepository`](crate::error::CoordinatorError::DuplicateRepository)
    /// when `(index_id, project_identifier)` already exists.
    async fn insert_repository(&self, repository: &NewRepository) -> Result<Repository>;

    /// Atomically find-or-create the repository and append a task owned by
    /// it. `task.repository_id` is ignored and replaced with the row's id.
    async fn insert_repository_task(
        &self,
        repository: &NewRepository,
        task: &NewTask,
    ) -> Result<(Repository, Task)>;

    async fn find_repository(
        &self,
        index_id: IndexId,
        project_identifier: ProjectId,
    ) -> Result<Option<Repository>>;

    async fn get_repository(&self, id: RepositoryId) -> Result<Option<Repository>>;

    async fn get_repositories(&self, ids: &[RepositoryId]) -> Result<Vec<Repository>>;

    async fn repositories_for_index(&self, index_id: IndexId) -> Result<Vec<Repository>>;

    async fn non_ready_repositories(&self, index_id: IndexId) -> Result<Vec<Repository>>;

    /// Returns whether a row was updated.
    async fn set_repository_state(
        &self,
        id: RepositoryId,
        state: RepositoryState,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    // ============ Task log ============

    /// Live partitions, ascending by id. The last one is the active partition.
    async fn partitions(&self) -> Result<Vec<Partition>>;

    /// Open a partition after `after`. Creates one only if `after` is still
    /// the newest partition; otherwise returns the existing newest partition.
    async fn open_partition(
        &self,
        after: Option<PartitionId>,
        now: DateTime<Utc>,
    ) -> Result<Partition>;

    /// Drop a partition and its tasks if it is not the newest and holds no
    /// pending task. Returns whether it was dropped.
    async fn detach_partition(&self, id: PartitionId) -> Result<bool>;

    /// Append a task to the active partition, opening the first partition
    /// if none exists.
    async fn insert_task(&self, task: &NewTask) -> Result<Task>;

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>>;

    /// Oldest task in a partition by creation order.
    async fn oldest_task(&self, partition_id: PartitionId) -> Result<Option<Task>>;

    async fn tasks_for_partition(&self, partition_id: PartitionId) -> Result<Vec<Task>>;

    async fn pending_count(&self, partition_id: PartitionId) -> Result<usize>;

    /// Keyset page of dispatchable tasks for a node: pending, due at `now`,
    /// and not under an unexpired claim, ordered by `(perform_at, id)`.
    /// Only tasks of live partitions are visible; the page spans all of
    /// them so the order holds across a rotation.
    async fn pending_tasks_after(
        &self,
        node_id: NodeId,
        after: Option<TaskCursor>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>>;

    /// Compare-and-set claim: claims each task that is still pending and not
    /// under another unexpired claim. Returns the ids actually claimed.
    async fn claim_tasks(&self, ids: &[TaskId], claim: &Claim, now: DateTime<Utc>)
        -> Result<Vec<TaskId>>;

    /// Drop a claim so its pending tasks become dispatchable again.
    async fn release_claim(&self, token: &Uuid) -> Result<usize>;

    /// Bulk `pending → orphaned`. Returns the number of rows transitioned.
    async fn mark_tasks_orphaned(&self, ids: &[TaskId]) -> Result<usize>;

    /// `pending → state` for a terminal state, clearing any claim. When
    /// `token` is given the task must not be held by a different claim.
    /// Returns the updated task, or `None` if the task is missing, already
    /// resolved or claimed under another token.
    async fn resolve_task(
        &self,
        id: TaskId,
        state: TaskState,
        token: Option<&Uuid>,
    ) -> Result<Option<Task>>;
}
