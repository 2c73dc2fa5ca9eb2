//! In-memory [`Store`] implementation for tests and single-process use.
//!
//! All relations live in one `Tables` value behind a `std::sync::RwLock`,
//! so every trait method is atomic with respect to every other one. That
//! gives the same guarantees the SQLite store gets from transactions and
//! conditional updates.

use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::CoordinatorError;
use crate::models::{
    Claim, EnabledNamespace, EnabledNamespaceId, Index, IndexId, IndexState, Namespace,
    NamespaceId, NewIndex, NewRepository, NewTask, Node, NodeId, Partition, PartitionId, Project,
    ProjectId, RemovedIndex, Replica, ReplicaId, ReplicaState, Repository, RepositoryId,
    RepositoryState, Subscription, Task, TaskCursor, TaskId, TaskState,
};

use super::Store;

#[derive(Default)]
struct Sequences {
    node: i64,
    enabled_namespace: i64,
    replica: i64,
    index: i64,
    repository: i64,
    partition: i64,
    task: i64,
}

fn next(seq: &mut i64) -> i64 {
    *seq += 1;
    *seq
}

#[derive(Default)]
struct Tables {
    namespaces: BTreeMap<NamespaceId, Namespace>,
    projects: BTreeMap<ProjectId, Project>,
    subscriptions: BTreeMap<NamespaceId, Subscription>,
    nodes: BTreeMap<NodeId, Node>,
    enabled_namespaces: BTreeMap<EnabledNamespaceId, EnabledNamespace>,
    replicas: BTreeMap<ReplicaId, Replica>,
    indices: BTreeMap<IndexId, Index>,
    repositories: BTreeMap<RepositoryId, Repository>,
    partitions: BTreeMap<PartitionId, Partition>,
    tasks: BTreeMap<TaskId, Task>,
    seq: Sequences,
}

impl Tables {
    fn find_repository(&self, index_id: IndexId, project_identifier: ProjectId) -> Option<&Repository> {
        self.repositories
            .values()
            .find(|r| r.index_id == index_id && r.project_identifier == project_identifier)
    }

    fn insert_repository(&mut self, new: &NewRepository) -> Result<Repository> {
        if self.find_repository(new.index_id, new.project_identifier).is_some() {
            return Err(CoordinatorError::DuplicateRepository {
                index_id: new.index_id,
                project_identifier: new.project_identifier,
            }
            .into());
        }
        let repository = Repository {
            id: next(&mut self.seq.repository),
            index_id: new.index_id,
            project_id: new.project_id,
            project_identifier: new.project_identifier,
            state: RepositoryState::Pending,
            created_at: new.created_at,
            updated_at: new.created_at,
        };
        self.repositories.insert(repository.id, repository.clone());
        Ok(repository)
    }

    fn active_partition(&mut self, now: DateTime<Utc>) -> PartitionId {
        if let Some(id) = self.partitions.keys().next_back() {
            return *id;
        }
        let partition = Partition {
            id: next(&mut self.seq.partition),
            opened_at: now,
        };
        let id = partition.id;
        self.partitions.insert(id, partition);
        id
    }

    fn insert_task(&mut self, new: &NewTask) -> Task {
        let partition_id = self.active_partition(new.created_at);
        let task = Task {
            id: next(&mut self.seq.task),
            partition_id,
            repository_id: new.repository_id,
            node_id: new.node_id,
            project_identifier: new.project_identifier,
            task_type: new.task_type,
            state: TaskState::Pending,
            perform_at: new.perform_at,
            created_at: new.created_at,
            claim: None,
        };
        self.tasks.insert(task.id, task.clone());
        task
    }

    fn delete_index(&mut self, id: IndexId) -> Option<RemovedIndex> {
        let index = self.indices.remove(&id)?;
        let mut removed = HashSet::new();
        let mut project_identifiers = Vec::new();
        for repository in self.repositories.values().filter(|r| r.index_id == id) {
            removed.insert(repository.id);
            project_identifiers.push(repository.project_identifier);
        }
        project_identifiers.sort_unstable();
        self.repositories.retain(|rid, _| !removed.contains(rid));
        for task in self.tasks.values_mut() {
            if task.repository_id.is_some_and(|rid| removed.contains(&rid)) {
                task.repository_id = None;
            }
        }
        Some(RemovedIndex {
            index,
            project_identifiers,
        })
    }
}

/// In-memory store for tests and embedded use.
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_namespace(&self, namespace: &Namespace) -> Result<()> {
        let mut t = self.tables.write().unwrap();
        t.namespaces.insert(namespace.id, namespace.clone());
        Ok(())
    }

    async fn get_namespace(&self, id: NamespaceId) -> Result<Option<Namespace>> {
        Ok(self.tables.read().unwrap().namespaces.get(&id).cloned())
    }

    async fn upsert_project(&self, project: &Project) -> Result<()> {
        let mut t = self.tables.write().unwrap();
        t.projects.insert(project.id, project.clone());
        Ok(())
    }

    async fn get_project(&self, id: ProjectId) -> Result<Option<Project>> {
        Ok(self.tables.read().unwrap().projects.get(&id).cloned())
    }

    async fn delete_project(&self, id: ProjectId) -> Result<bool> {
        let mut t = self.tables.write().unwrap();
        if t.projects.remove(&id).is_none() {
            return Ok(false);
        }
        for repository in t.repositories.values_mut() {
            if repository.project_id == Some(id) {
                repository.project_id = None;
            }
        }
        Ok(true)
    }

    async fn existing_project_ids(&self, ids: &[ProjectId]) -> Result<Vec<ProjectId>> {
        let t = self.tables.read().unwrap();
        Ok(ids
            .iter()
            .copied()
            .filter(|id| t.projects.contains_key(id))
            .collect())
    }

    async fn project_ids_for_root_namespace(&self, root: NamespaceId) -> Result<Vec<ProjectId>> {
        let t = self.tables.read().unwrap();
        Ok(t.projects
            .values()
            .filter(|p| p.root_namespace_id == root)
            .map(|p| p.id)
            .collect())
    }

    async fn upsert_subscription(&self, subscription: &Subscription) -> Result<()> {
        let mut t = self.tables.write().unwrap();
        t.subscriptions
            .insert(subscription.namespace_id, subscription.clone());
        Ok(())
    }

    async fn subscriptions_after(
        &self,
        after: Option<NamespaceId>,
        limit: usize,
    ) -> Result<Vec<Subscription>> {
        let t = self.tables.read().unwrap();
        Ok(t.subscriptions
            .values()
            .filter(|s| after.map_or(true, |a| s.namespace_id > a))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn save_node(&self, node: &Node) -> Result<Node> {
        let mut t = self.tables.write().unwrap();
        let existing = t
            .nodes
            .values()
            .find(|n| n.uuid == node.uuid)
            .and_then(|n| n.id);
        let id = match existing {
            Some(id) => id,
            None => next(&mut t.seq.node),
        };
        let mut stored = node.clone();
        stored.id = Some(id);
        t.nodes.insert(id, stored.clone());
        Ok(stored)
    }

    async fn find_node_by_uuid(&self, uuid: &Uuid) -> Result<Option<Node>> {
        let t = self.tables.read().unwrap();
        Ok(t.nodes.values().find(|n| &n.uuid == uuid).cloned())
    }

    async fn get_node(&self, id: NodeId) -> Result<Option<Node>> {
        Ok(self.tables.read().unwrap().nodes.get(&id).cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.tables.read().unwrap().nodes.values().cloned().collect())
    }

    async fn create_enabled_namespace(
        &self,
        root_namespace_id: NamespaceId,
        search: bool,
        now: DateTime<Utc>,
    ) -> Result<EnabledNamespace> {
        let mut t = self.tables.write().unwrap();
        if let Some(existing) = t
            .enabled_namespaces
            .values()
            .find(|e| e.root_namespace_id == root_namespace_id)
        {
            return Ok(existing.clone());
        }
        let enabled = EnabledNamespace {
            id: next(&mut t.seq.enabled_namespace),
            root_namespace_id,
            search,
            created_at: now,
            updated_at: now,
        };
        t.enabled_namespaces.insert(enabled.id, enabled.clone());
        Ok(enabled)
    }

    async fn get_enabled_namespace(
        &self,
        id: EnabledNamespaceId,
    ) -> Result<Option<EnabledNamespace>> {
        Ok(self.tables.read().unwrap().enabled_namespaces.get(&id).cloned())
    }

    async fn find_enabled_namespace(
        &self,
        root_namespace_id: NamespaceId,
    ) -> Result<Option<EnabledNamespace>> {
        let t = self.tables.read().unwrap();
        Ok(t.enabled_namespaces
            .values()
            .find(|e| e.root_namespace_id == root_namespace_id)
            .cloned())
    }

    async fn list_enabled_namespaces(&self) -> Result<Vec<EnabledNamespace>> {
        let t = self.tables.read().unwrap();
        Ok(t.enabled_namespaces.values().cloned().collect())
    }

    async fn set_namespace_search(
        &self,
        id: EnabledNamespaceId,
        search: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut t = self.tables.write().unwrap();
        let enabled = t
            .enabled_namespaces
            .get_mut(&id)
            .ok_or_else(|| CoordinatorError::not_found("enabled namespace", id))?;
        enabled.search = search;
        enabled.updated_at = now;
        Ok(())
    }

    async fn delete_enabled_namespace(&self, id: EnabledNamespaceId) -> Result<Vec<RemovedIndex>> {
        let mut t = self.tables.write().unwrap();
        let index_ids: Vec<IndexId> = t
            .indices
            .values()
            .filter(|i| i.enabled_namespace_id == id)
            .map(|i| i.id)
            .collect();
        let removed = index_ids
            .into_iter()
            .filter_map(|index_id| t.delete_index(index_id))
            .collect();
        t.replicas.retain(|_, r| r.enabled_namespace_id != id);
        t.enabled_namespaces.remove(&id);
        Ok(removed)
    }

    async fn create_replica(
        &self,
        enabled_namespace_id: EnabledNamespaceId,
        namespace_id: NamespaceId,
    ) -> Result<Replica> {
        let mut t = self.tables.write().unwrap();
        let replica = Replica {
            id: next(&mut t.seq.replica),
            enabled_namespace_id,
            namespace_id,
            state: ReplicaState::Pending,
        };
        t.replicas.insert(replica.id, replica.clone());
        Ok(replica)
    }

    async fn replicas_for_namespace(
        &self,
        enabled_namespace_id: EnabledNamespaceId,
    ) -> Result<Vec<Replica>> {
        let t = self.tables.read().unwrap();
        Ok(t.replicas
            .values()
            .filter(|r| r.enabled_namespace_id == enabled_namespace_id)
            .cloned()
            .collect())
    }

    async fn insert_index(&self, new: &NewIndex) -> Result<Index> {
        let mut t = self.tables.write().unwrap();
        let index = Index {
            id: next(&mut t.seq.index),
            enabled_namespace_id: new.enabled_namespace_id,
            replica_id: new.replica_id,
            node_id: new.node_id,
            namespace_id: new.namespace_id,
            state: new.state,
            created_at: new.created_at,
        };
        t.indices.insert(index.id, index.clone());
        Ok(index)
    }

    async fn get_index(&self, id: IndexId) -> Result<Option<Index>> {
        Ok(self.tables.read().unwrap().indices.get(&id).cloned())
    }

    async fn list_indices(&self) -> Result<Vec<Index>> {
        Ok(self.tables.read().unwrap().indices.values().cloned().collect())
    }

    async fn indices_for_enabled_namespace(&self, id: EnabledNamespaceId) -> Result<Vec<Index>> {
        let t = self.tables.read().unwrap();
        Ok(t.indices
            .values()
            .filter(|i| i.enabled_namespace_id == id)
            .cloned()
            .collect())
    }

    async fn set_index_state(&self, id: IndexId, state: IndexState) -> Result<()> {
        let mut t = self.tables.write().unwrap();
        let index = t
            .indices
            .get_mut(&id)
            .ok_or_else(|| CoordinatorError::not_found("index", id))?;
        index.state = state;
        Ok(())
    }

    async fn delete_index(&self, id: IndexId) -> Result<Option<RemovedIndex>> {
        Ok(self.tables.write().unwrap().delete_index(id))
    }

    async fn insert_repository(&self, repository: &NewRepository) -> Result<Repository> {
        self.tables.write().unwrap().insert_repository(repository)
    }

    async fn insert_repository_task(
        &self,
        repository: &NewRepository,
        task: &NewTask,
    ) -> Result<(Repository, Task)> {
        let mut t = self.tables.write().unwrap();
        let existing = t
            .find_repository(repository.index_id, repository.project_identifier)
            .cloned();
        let repository = match existing {
            Some(existing) => existing,
            None => t.insert_repository(repository)?,
        };
        let mut task = task.clone();
        task.repository_id = Some(repository.id);
        let task = t.insert_task(&task);
        Ok((repository, task))
    }

    async fn find_repository(
        &self,
        index_id: IndexId,
        project_identifier: ProjectId,
    ) -> Result<Option<Repository>> {
        let t = self.tables.read().unwrap();
        Ok(t.find_repository(index_id, project_identifier).cloned())
    }

    async fn get_repository(&self, id: RepositoryId) -> Result<Option<Repository>> {
        Ok(self.tables.read().unwrap().repositories.get(&id).cloned())
    }

    async fn get_repositories(&self, ids: &[RepositoryId]) -> Result<Vec<Repository>> {
        let t = self.tables.read().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| t.repositories.get(id).cloned())
            .collect())
    }

    async fn repositories_for_index(&self, index_id: IndexId) -> Result<Vec<Repository>> {
        let t = self.tables.read().unwrap();
        Ok(t.repositories
            .values()
            .filter(|r| r.index_id == index_id)
            .cloned()
            .collect())
    }

    async fn non_ready_repositories(&self, index_id: IndexId) -> Result<Vec<Repository>> {
        let t = self.tables.read().unwrap();
        Ok(t.repositories
            .values()
            .filter(|r| r.index_id == index_id && r.state != RepositoryState::Ready)
            .cloned()
            .collect())
    }

    async fn set_repository_state(
        &self,
        id: RepositoryId,
        state: RepositoryState,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut t = self.tables.write().unwrap();
        match t.repositories.get_mut(&id) {
            Some(repository) => {
                repository.state = state;
                repository.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn partitions(&self) -> Result<Vec<Partition>> {
        Ok(self.tables.read().unwrap().partitions.values().cloned().collect())
    }

    async fn open_partition(
        &self,
        after: Option<PartitionId>,
        now: DateTime<Utc>,
    ) -> Result<Partition> {
        let mut t = self.tables.write().unwrap();
        let newest = t.partitions.values().next_back().cloned();
        match newest {
            Some(p) if Some(p.id) != after => Ok(p),
            _ => {
                let partition = Partition {
                    id: next(&mut t.seq.partition),
                    opened_at: now,
                };
                t.partitions.insert(partition.id, partition.clone());
                Ok(partition)
            }
        }
    }

    async fn detach_partition(&self, id: PartitionId) -> Result<bool> {
        let mut t = self.tables.write().unwrap();
        let newest = t.partitions.keys().next_back().copied();
        if newest == Some(id) || !t.partitions.contains_key(&id) {
            return Ok(false);
        }
        let has_pending = t
            .tasks
            .values()
            .any(|task| task.partition_id == id && task.state == TaskState::Pending);
        if has_pending {
            return Ok(false);
        }
        t.tasks.retain(|_, task| task.partition_id != id);
        t.partitions.remove(&id);
        Ok(true)
    }

    async fn insert_task(&self, task: &NewTask) -> Result<Task> {
        Ok(self.tables.write().unwrap().insert_task(task))
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.tables.read().unwrap().tasks.get(&id).cloned())
    }

    async fn oldest_task(&self, partition_id: PartitionId) -> Result<Option<Task>> {
        let t = self.tables.read().unwrap();
        Ok(t.tasks
            .values()
            .filter(|task| task.partition_id == partition_id)
            .min_by_key(|task| (task.created_at, task.id))
            .cloned())
    }

    async fn tasks_for_partition(&self, partition_id: PartitionId) -> Result<Vec<Task>> {
        let t = self.tables.read().unwrap();
        Ok(t.tasks
            .values()
            .filter(|task| task.partition_id == partition_id)
            .cloned()
            .collect())
    }

    async fn pending_count(&self, partition_id: PartitionId) -> Result<usize> {
        let t = self.tables.read().unwrap();
        Ok(t.tasks
            .values()
            .filter(|task| task.partition_id == partition_id && task.state == TaskState::Pending)
            .count())
    }

    async fn pending_tasks_after(
        &self,
        node_id: NodeId,
        after: Option<TaskCursor>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>> {
        let t = self.tables.read().unwrap();
        let mut page: Vec<Task> = t
            .tasks
            .values()
            .filter(|task| {
                task.node_id == node_id
                    && t.partitions.contains_key(&task.partition_id)
                    && task.state == TaskState::Pending
                    && task.perform_at <= now
                    && !task.is_claimed(now)
                    && after.map_or(true, |cursor| task.cursor() > cursor)
            })
            .cloned()
            .collect();
        page.sort_by_key(|task| task.cursor());
        page.truncate(limit);
        Ok(page)
    }

    async fn claim_tasks(
        &self,
        ids: &[TaskId],
        claim: &Claim,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>> {
        let mut t = self.tables.write().unwrap();
        let mut claimed = Vec::new();
        for id in ids {
            if let Some(task) = t.tasks.get_mut(id) {
                if task.state == TaskState::Pending && !task.is_claimed(now) {
                    task.claim = Some(*claim);
                    claimed.push(*id);
                }
            }
        }
        Ok(claimed)
    }

    async fn release_claim(&self, token: &Uuid) -> Result<usize> {
        let mut t = self.tables.write().unwrap();
        let mut released = 0;
        for task in t.tasks.values_mut() {
            if task.claim.is_some_and(|c| &c.token == token) {
                task.claim = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn mark_tasks_orphaned(&self, ids: &[TaskId]) -> Result<usize> {
        let mut t = self.tables.write().unwrap();
        let mut count = 0;
        for id in ids {
            if let Some(task) = t.tasks.get_mut(id) {
                if task.state == TaskState::Pending {
                    task.state = TaskState::Orphaned;
                    task.claim = None;
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    async fn resolve_task(
        &self,
        id: TaskId,
        state: TaskState,
        token: Option<&Uuid>,
    ) -> Result<Option<Task>> {
        if !state.is_terminal() {
            return Err(CoordinatorError::Validation(format!(
                "task {} cannot be resolved to '{}'",
                id, state
            ))
            .into());
        }
        let mut t = self.tables.write().unwrap();
        match t.tasks.get_mut(&id) {
            Some(task) if task.state == TaskState::Pending && task.accepts_outcome(token) => {
                task.state = state;
                task.claim = None;
                Ok(Some(task.clone()))
            }
            _ => Ok(None),
        }
    }
}
