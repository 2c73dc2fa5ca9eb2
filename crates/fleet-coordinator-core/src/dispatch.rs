//! The reconciler: hands pending tasks to polling nodes and records what
//! they report back.
//!
//! # Dispatch
//!
//! [`Reconciler::dispatch_batch`] walks a node's pending, due tasks in
//! `(perform_at, id)` order using a keyset cursor, one page at a time:
//!
//! 1. every inspected task is classified as deliverable or orphaned;
//! 2. orphans of the page are moved to `orphaned` in one bulk write;
//! 3. deliverable tasks are claimed with a lease token in one
//!    compare-and-set write, and only tasks actually claimed are delivered;
//! 4. scanning stops as soon as `limit` tasks were delivered. A page cut
//!    short by the limit is resumed from its cursor when some of its claims
//!    were lost to a concurrent dispatch.
//!
//! A claim is a lease, not a state change. The task stays `pending` until
//! the node reports an outcome. If the poll never reaches the node the
//! caller can [`release`](Reconciler::release) the token, and otherwise the
//! lease expires after `claim_ttl` and the task is dispatched again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::{
    Claim, NodeId, ProjectId, Repository, RepositoryId, Task, TaskCursor, TaskId, TaskState,
    TaskType,
};
use crate::nodes::{upsert_node, BackoffRegistry, Heartbeat};
use crate::repositories::mark_repository_ready;
use crate::store::Store;

#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    /// Keyset page size used while scanning pending tasks.
    pub page_size: usize,
    /// Tasks handed to a healthy node per poll.
    pub batch_limit: usize,
    pub claim_ttl: Duration,
    /// Echoed to nodes so they know how often the coordinator reconciles.
    pub housekeeping_interval: StdDuration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            page_size: 100,
            batch_limit: 20,
            claim_ttl: Duration::minutes(5),
            housekeeping_interval: StdDuration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResult {
    Done,
    Failed,
}

/// A per-task result reported by a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub result: TaskResult,
    /// Token the task was delivered under. When present it must match the
    /// task's current claim.
    #[serde(default)]
    pub claim_token: Option<Uuid>,
}

/// Tasks delivered by one dispatch, all claimed under `token`.
#[derive(Debug, Clone)]
pub struct DispatchedBatch {
    pub token: Uuid,
    pub tasks: Vec<Task>,
    pub orphaned: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct OutcomeReport {
    pub done: usize,
    pub failed: usize,
    pub ignored: usize,
}

/// Operational parameters returned to a node on every poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollSettings {
    pub housekeeping_interval_secs: u64,
    pub batch_limit: usize,
    pub claim_ttl_secs: i64,
    /// Current backoff delay for this node; zero when healthy.
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollResponse {
    #[serde(rename = "id")]
    pub node_id: NodeId,
    pub claim_token: Option<Uuid>,
    pub tasks: Vec<Task>,
    pub settings: PollSettings,
}

/// Per-page lookup of what dispatch needs to judge orphans.
struct Liveness {
    repositories: HashMap<RepositoryId, Repository>,
    projects: HashSet<ProjectId>,
}

impl Liveness {
    async fn load<S: Store + ?Sized>(store: &S, page: &[Task]) -> Result<Self> {
        let repository_ids: Vec<RepositoryId> = page
            .iter()
            .filter(|t| t.task_type != TaskType::DeleteRepo)
            .filter_map(|t| t.repository_id)
            .collect();
        let repositories: HashMap<_, _> = store
            .get_repositories(&repository_ids)
            .await?
            .into_iter()
            .map(|r| (r.id, r))
            .collect();
        let project_ids: Vec<ProjectId> = repositories.values().filter_map(|r| r.project_id).collect();
        let projects = store
            .existing_project_ids(&project_ids)
            .await?
            .into_iter()
            .collect();
        Ok(Self {
            repositories,
            projects,
        })
    }

    /// Delete tasks never need a live project. Anything else needs its
    /// repository row, the repository's project link and the catalog project.
    fn is_deliverable(&self, task: &Task) -> bool {
        if task.task_type == TaskType::DeleteRepo {
            return true;
        }
        task.repository_id
            .and_then(|id| self.repositories.get(&id))
            .and_then(|r| r.project_id)
            .is_some_and(|project_id| self.projects.contains(&project_id))
    }
}

pub struct Reconciler<S: Store + ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    backoff: BackoffRegistry,
    settings: DispatchSettings,
}

impl<S: Store + ?Sized> Reconciler<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        backoff: BackoffRegistry,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            clock,
            backoff,
            settings,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn backoff(&self) -> &BackoffRegistry {
        &self.backoff
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Claim and return up to `limit` deliverable tasks for a node.
    pub async fn dispatch_batch(&self, node_id: NodeId, limit: usize) -> Result<DispatchedBatch> {
        let now = self.clock.now();
        let claim = Claim {
            token: Uuid::new_v4(),
            expires_at: now + self.settings.claim_ttl,
        };
        let page_size = self.settings.page_size.max(1);
        let mut delivered: Vec<Task> = Vec::new();
        let mut orphaned = 0;
        let mut cursor: Option<TaskCursor> = None;

        while delivered.len() < limit {
            let page = self
                .store
                .pending_tasks_after(node_id, cursor, now, page_size)
                .await?;
            if page.is_empty() {
                break;
            }
            let exhausted = page.len() < page_size;
            let liveness = Liveness::load(self.store.as_ref(), &page).await?;

            let mut orphans = Vec::new();
            let mut candidates = Vec::new();
            let mut stopped_early = false;
            for task in &page {
                cursor = Some(task.cursor());
                if liveness.is_deliverable(task) {
                    candidates.push(task.id);
                    if delivered.len() + candidates.len() >= limit {
                        stopped_early = true;
                        break;
                    }
                } else {
                    orphans.push(task.id);
                }
            }

            if !orphans.is_empty() {
                let count = self.store.mark_tasks_orphaned(&orphans).await?;
                tracing::info!(node_id, count, "orphaned tasks with no live project");
                orphaned += count;
            }

            if !candidates.is_empty() {
                let claimed: HashSet<TaskId> = self
                    .store
                    .claim_tasks(&candidates, &claim, now)
                    .await?
                    .into_iter()
                    .collect();
                if claimed.len() < candidates.len() {
                    tracing::debug!(
                        node_id,
                        lost = candidates.len() - claimed.len(),
                        "tasks claimed by a concurrent dispatch"
                    );
                }
                delivered.extend(page.into_iter().filter(|t| claimed.contains(&t.id)).map(
                    |mut task| {
                        task.claim = Some(claim);
                        task
                    },
                ));
            }

            if exhausted && !stopped_early {
                break;
            }
        }

        if !delivered.is_empty() {
            tracing::debug!(
                node_id,
                count = delivered.len(),
                token = %claim.token,
                "dispatched tasks"
            );
        }
        Ok(DispatchedBatch {
            token: claim.token,
            tasks: delivered,
            orphaned,
        })
    }

    /// Return every task claimed under `token` to the pool.
    pub async fn release(&self, token: &Uuid) -> Result<usize> {
        let released = self.store.release_claim(token).await?;
        if released > 0 {
            tracing::info!(token = %token, released, "released task claim");
        }
        Ok(released)
    }

    /// Record outcomes reported by a node. Only `pending` tasks owned by the
    /// node move, and an outcome carrying a claim token only applies while
    /// that token still holds the task. Anything else is counted as ignored.
    pub async fn apply_outcomes(
        &self,
        node_id: NodeId,
        outcomes: &[TaskOutcome],
    ) -> Result<OutcomeReport> {
        let now = self.clock.now();
        let mut report = OutcomeReport::default();

        for outcome in outcomes {
            let Some(task) = self.store.get_task(outcome.task_id).await? else {
                tracing::warn!(node_id, task_id = outcome.task_id, "outcome for unknown task");
                report.ignored += 1;
                continue;
            };
            if task.node_id != node_id {
                tracing::warn!(
                    node_id,
                    task_id = task.id,
                    owner = task.node_id,
                    "outcome reported by a node that does not own the task"
                );
                report.ignored += 1;
                continue;
            }

            let state = match outcome.result {
                TaskResult::Done => TaskState::Done,
                TaskResult::Failed => TaskState::Failed,
            };
            let Some(task) = self
                .store
                .resolve_task(task.id, state, outcome.claim_token.as_ref())
                .await?
            else {
                tracing::debug!(
                    task_id = outcome.task_id,
                    "task already resolved or claimed under another token"
                );
                report.ignored += 1;
                continue;
            };

            match outcome.result {
                TaskResult::Done => {
                    if task.task_type != TaskType::DeleteRepo {
                        if let Some(repository_id) = task.repository_id {
                            mark_repository_ready(self.store.as_ref(), repository_id, now).await?;
                        }
                    }
                    self.backoff.record_success(node_id);
                    report.done += 1;
                }
                TaskResult::Failed => {
                    self.backoff.record_failure(node_id, now);
                    tracing::warn!(
                        node_id,
                        task_id = task.id,
                        task_type = %task.task_type,
                        "node reported task failure"
                    );
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Handle one inbound poll: register the heartbeat, apply outcomes,
    /// then dispatch a backoff-adjusted batch.
    pub async fn poll(&self, heartbeat: &Heartbeat, outcomes: &[TaskOutcome]) -> Result<PollResponse> {
        let now = self.clock.now();
        let uuid = heartbeat.parsed_uuid()?;
        let existing = self.store.find_node_by_uuid(&uuid).await?;
        let node = upsert_node(existing, heartbeat, now)?;
        let node = self.store.save_node(&node).await?;
        let node_id = node
            .id
            .with_context(|| format!("node {} was saved without an id", uuid))?;

        let outcome_report = self.apply_outcomes(node_id, outcomes).await?;
        let limit = self
            .backoff
            .dispatch_limit(&node, self.settings.batch_limit, now);
        let batch = self.dispatch_batch(node_id, limit).await?;

        tracing::info!(
            node_id,
            node_name = %node.metadata.name,
            done = outcome_report.done,
            failed = outcome_report.failed,
            limit,
            delivered = batch.tasks.len(),
            orphaned = batch.orphaned,
            "poll handled"
        );

        let backoff_ms = u64::try_from(self.backoff.delay(node_id).as_millis()).unwrap_or(u64::MAX);
        Ok(PollResponse {
            node_id,
            claim_token: (!batch.tasks.is_empty()).then_some(batch.token),
            tasks: batch.tasks,
            settings: PollSettings {
                housekeeping_interval_secs: self.settings.housekeeping_interval.as_secs(),
                batch_limit: self.settings.batch_limit,
                claim_ttl_secs: self.settings.claim_ttl.num_seconds(),
                backoff_ms,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    use crate::clock::ManualClock;
    use crate::models::{Index, IndexState, Namespace, NewIndex, NewTask, Project, RepositoryState};
    use crate::placement::{assign_index, enable_namespace, index_ready, PlacementEvent};
    use crate::repositories::create_tasks;
    use crate::store::memory::InMemoryStore;

    const UUID: &str = "3869fe21-36d1-4612-9676-0b783ef2dcd7";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn reconciler(store: Arc<InMemoryStore>, clock: Arc<ManualClock>) -> Reconciler<InMemoryStore> {
        Reconciler::new(
            store,
            clock,
            BackoffRegistry::default(),
            DispatchSettings {
                page_size: 2,
                ..DispatchSettings::default()
            },
        )
    }

    fn delete_task(node_id: NodeId, perform_at: DateTime<Utc>) -> NewTask {
        NewTask {
            repository_id: None,
            node_id,
            project_identifier: 1,
            task_type: TaskType::DeleteRepo,
            perform_at,
            created_at: t0(),
        }
    }

    async fn index_with_projects(store: &InMemoryStore, count: i64) -> (Index, Vec<Project>) {
        let index = store
            .insert_index(&NewIndex {
                enabled_namespace_id: 1,
                replica_id: None,
                node_id: 1,
                namespace_id: 42,
                state: IndexState::Pending,
                created_at: t0(),
            })
            .await
            .unwrap();
        let mut projects = Vec::new();
        for id in 1..=count {
            let project = Project {
                id,
                namespace_id: 42,
                root_namespace_id: 42,
            };
            store.upsert_project(&project).await.unwrap();
            projects.push(project);
        }
        (index, projects)
    }

    fn heartbeat() -> Heartbeat {
        Heartbeat {
            uuid: Some(UUID.into()),
            index_url: Some("http://localhost:6080".into()),
            search_url: None,
            used_bytes: Some(10),
            total_bytes: Some(100),
            name: Some("m1.local".into()),
            task_count: None,
            concurrency: None,
        }
    }

    #[tokio::test]
    async fn test_dispatch_orders_by_perform_at_then_id() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let t1 = t0() + Duration::minutes(1);
        // Ids 1..=7; node 1 owns 3 and 5 at t0 and 7 at t1.
        for (node_id, at) in [(2, t0()), (2, t0()), (1, t0()), (2, t0()), (1, t0()), (2, t0()), (1, t1)] {
            store.insert_task(&delete_task(node_id, at)).await.unwrap();
        }
        clock.set(t1);

        let batch = reconciler(store, clock).dispatch_batch(1, 2).await.unwrap();
        let ids: Vec<TaskId> = batch.tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![3, 5]);
    }

    #[tokio::test]
    async fn test_later_perform_at_dispatches_after_lower_id() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let t1 = t0() + Duration::minutes(1);
        store.insert_task(&delete_task(1, t1)).await.unwrap();
        store.insert_task(&delete_task(1, t0())).await.unwrap();

        let r = reconciler(store, clock.clone());
        // Not due yet.
        let batch = r.dispatch_batch(1, 10).await.unwrap();
        assert_eq!(batch.tasks.iter().map(|t| t.id).collect::<Vec<_>>(), vec![2]);

        clock.set(t1);
        r.release(&batch.token).await.unwrap();
        let batch = r.dispatch_batch(1, 10).await.unwrap();
        assert_eq!(batch.tasks.iter().map(|t| t.id).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_limit_respected_under_orphan_interference() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let (index, projects) = index_with_projects(&store, 3).await;
        let mut tasks = Vec::new();
        for project in &projects {
            let (_, task) = create_tasks(store.as_ref(), project, &index, TaskType::IndexRepo, t0(), t0())
                .await
                .unwrap();
            tasks.push(task);
        }
        store.delete_project(projects[1].id).await.unwrap();

        let batch = reconciler(store.clone(), clock)
            .dispatch_batch(1, 2)
            .await
            .unwrap();

        let ids: Vec<TaskId> = batch.tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![tasks[0].id, tasks[2].id]);
        assert_eq!(batch.orphaned, 1);
        let orphan = store.get_task(tasks[1].id).await.unwrap().unwrap();
        assert_eq!(orphan.state, TaskState::Orphaned);
    }

    #[tokio::test]
    async fn test_task_without_repository_is_orphaned_but_delete_is_not() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let (index, projects) = index_with_projects(&store, 1).await;
        let (_, index_task) = create_tasks(store.as_ref(), &projects[0], &index, TaskType::IndexRepo, t0(), t0())
            .await
            .unwrap();
        let delete = store.insert_task(&delete_task(1, t0())).await.unwrap();
        store.delete_index(index.id).await.unwrap();

        let batch = reconciler(store.clone(), clock).dispatch_batch(1, 10).await.unwrap();
        assert_eq!(batch.tasks.len(), 1);
        assert_eq!(batch.tasks[0].id, delete.id);
        let orphan = store.get_task(index_task.id).await.unwrap().unwrap();
        assert_eq!(orphan.state, TaskState::Orphaned);
    }

    #[tokio::test]
    async fn test_concurrent_dispatch_never_shares_tasks() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        for _ in 0..5 {
            store.insert_task(&delete_task(1, t0())).await.unwrap();
        }
        let r = reconciler(store, clock.clone());

        let (a, b) = tokio::join!(r.dispatch_batch(1, 3), r.dispatch_batch(1, 3));
        let a = a.unwrap();
        let b = b.unwrap();
        let a_ids: HashSet<TaskId> = a.tasks.iter().map(|t| t.id).collect();
        assert!(b.tasks.iter().all(|t| !a_ids.contains(&t.id)));
        assert_eq!(a.tasks.len() + b.tasks.len(), 5);

        // Nothing left until a lease lapses.
        assert!(r.dispatch_batch(1, 10).await.unwrap().tasks.is_empty());
        clock.advance(Duration::minutes(6));
        assert_eq!(r.dispatch_batch(1, 10).await.unwrap().tasks.len(), 5);
    }

    #[tokio::test]
    async fn test_released_claim_is_redispatched() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        store.insert_task(&delete_task(1, t0())).await.unwrap();
        let r = reconciler(store.clone(), clock);

        let first = r.dispatch_batch(1, 10).await.unwrap();
        assert_eq!(first.tasks.len(), 1);
        assert!(r.dispatch_batch(1, 10).await.unwrap().tasks.is_empty());

        assert_eq!(r.release(&first.token).await.unwrap(), 1);
        let again = r.dispatch_batch(1, 10).await.unwrap();
        assert_eq!(again.tasks[0].id, first.tasks[0].id);
        let task = store.get_task(first.tasks[0].id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Pending);
    }

    #[tokio::test]
    async fn test_outcomes_resolve_once_and_respect_ownership() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let mine = store.insert_task(&delete_task(1, t0())).await.unwrap();
        let theirs = store.insert_task(&delete_task(2, t0())).await.unwrap();
        let r = reconciler(store.clone(), clock);

        let report = r
            .apply_outcomes(
                1,
                &[
                    TaskOutcome { task_id: mine.id, result: TaskResult::Failed, claim_token: None },
                    TaskOutcome { task_id: theirs.id, result: TaskResult::Done, claim_token: None },
                    TaskOutcome { task_id: 999, result: TaskResult::Done, claim_token: None },
                ],
            )
            .await
            .unwrap();
        assert_eq!(report, OutcomeReport { done: 0, failed: 1, ignored: 2 });
        assert_eq!(r.backoff().get(1).failures(), 1);

        // A failed task is terminal and never flips back.
        let report = r
            .apply_outcomes(1, &[TaskOutcome { task_id: mine.id, result: TaskResult::Done, claim_token: None }])
            .await
            .unwrap();
        assert_eq!(report.ignored, 1);
        let task = store.get_task(mine.id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Failed);
        let other = store.get_task(theirs.id).await.unwrap().unwrap();
        assert_eq!(other.state, TaskState::Pending);
    }

    #[tokio::test]
    async fn test_poll_registers_node_and_backs_off() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let r = reconciler(store.clone(), clock.clone());

        let first = r.poll(&heartbeat(), &[]).await.unwrap();
        clock.advance(Duration::seconds(1));
        let second = r.poll(&heartbeat(), &[]).await.unwrap();
        assert_eq!(first.node_id, second.node_id);
        assert_eq!(store.list_nodes().await.unwrap().len(), 1);
        let node = store.get_node(first.node_id).await.unwrap().unwrap();
        assert_eq!(node.last_seen_at, t0() + Duration::seconds(1));

        for _ in 0..30 {
            store.insert_task(&delete_task(first.node_id, t0())).await.unwrap();
        }
        let failing: Vec<TaskOutcome> = Vec::new();
        let healthy = r.poll(&heartbeat(), &failing).await.unwrap();
        assert_eq!(healthy.tasks.len(), 20);
        assert!(healthy.claim_token.is_some());
        assert_eq!(healthy.settings.backoff_ms, 0);

        let outcomes: Vec<TaskOutcome> = healthy
            .tasks
            .iter()
            .take(2)
            .map(|t| TaskOutcome { task_id: t.id, result: TaskResult::Failed, claim_token: None })
            .collect();
        let throttled = r.poll(&heartbeat(), &outcomes).await.unwrap();
        // Inside the throttle window a failing node still gets one task.
        assert_eq!(throttled.tasks.len(), 1);
        assert_eq!(throttled.settings.backoff_ms, 2000);
    }

    #[tokio::test]
    async fn test_poll_rejects_malformed_heartbeat() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let r = reconciler(store.clone(), clock);
        let broken = Heartbeat {
            total_bytes: None,
            ..heartbeat()
        };
        assert!(r.poll(&broken, &[]).await.is_err());
        assert!(store.list_nodes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_end_to_end_scenario() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let r = reconciler(store.clone(), clock);
        store
            .upsert_namespace(&Namespace {
                id: 42,
                parent_id: None,
                name: "acme".into(),
                repository_size: 0,
            })
            .await
            .unwrap();
        let project = Project {
            id: 7,
            namespace_id: 42,
            root_namespace_id: 42,
        };
        store.upsert_project(&project).await.unwrap();

        let response = r.poll(&heartbeat(), &[]).await.unwrap();
        let node_a = store.get_node(response.node_id).await.unwrap().unwrap();

        let enabled = enable_namespace(store.as_ref(), 42, true, t0()).await.unwrap();
        let (index, events) = assign_index(store.as_ref(), &enabled, &node_a, t0()).await.unwrap();
        assert!(matches!(
            events.as_slice(),
            [PlacementEvent::RequestFullNamespaceIndex { root_namespace_id: 42, .. }]
        ));

        let (repository, task) = create_tasks(store.as_ref(), &project, &index, TaskType::IndexRepo, t0(), t0())
            .await
            .unwrap();
        assert_eq!(repository.state, RepositoryState::Pending);
        assert_eq!(task.node_id, response.node_id);

        let batch = r.dispatch_batch(response.node_id, 10).await.unwrap();
        assert_eq!(batch.tasks.len(), 1);
        assert_eq!(batch.tasks[0].id, task.id);

        r.apply_outcomes(
            response.node_id,
            &[TaskOutcome { task_id: task.id, result: TaskResult::Done, claim_token: None }],
        )
        .await
        .unwrap();
        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Done);

        store.set_index_state(index.id, IndexState::Ready).await.unwrap();
        let index = store.get_index(index.id).await.unwrap().unwrap();
        assert!(index_ready(store.as_ref(), &index).await.unwrap());
    }

    /// A store where a rival dispatch wins the first task of the first claim.
    mod contended {
        use std::sync::atomic::{AtomicBool, Ordering};

        use anyhow::Result;
        use async_trait::async_trait;
        use chrono::{DateTime, Utc};
        use uuid::Uuid;

        use crate::models::{
            Claim, EnabledNamespace, EnabledNamespaceId, Index, IndexId, IndexState, Namespace,
            NamespaceId, NewIndex, NewRepository, NewTask, Node, NodeId, Partition, PartitionId,
            Project, ProjectId, RemovedIndex, Replica, Repository, RepositoryId, RepositoryState,
            Subscription, Task, TaskCursor, TaskId, TaskState,
        };
        use crate::store::memory::InMemoryStore;
        use crate::store::Store;

        pub struct ContendedStore {
            pub inner: InMemoryStore,
            raced: AtomicBool,
        }

        impl ContendedStore {
            pub fn new() -> Self {
                Self {
                    inner: InMemoryStore::new(),
                    raced: AtomicBool::new(false),
                }
            }
        }

        #[async_trait]
        impl Store for ContendedStore {
            async fn claim_tasks(
                &self,
                ids: &[TaskId],
                claim: &Claim,
                now: DateTime<Utc>,
            ) -> Result<Vec<TaskId>> {
                if let Some(first) = ids.first() {
                    if !self.raced.swap(true, Ordering::SeqCst) {
                        let rival = Claim {
                            token: Uuid::new_v4(),
                            expires_at: claim.expires_at,
                        };
                        self.inner.claim_tasks(&[*first], &rival, now).await?;
                    }
                }
                self.inner.claim_tasks(ids, claim, now).await
            }

            async fn upsert_namespace(&self, namespace: &Namespace) -> Result<()> {
                self.inner.upsert_namespace(namespace).await
            }

            async fn get_namespace(&self, id: NamespaceId) -> Result<Option<Namespace>> {
                self.inner.get_namespace(id).await
            }

            async fn upsert_project(&self, project: &Project) -> Result<()> {
                self.inner.upsert_project(project).await
            }

            async fn get_project(&self, id: ProjectId) -> Result<Option<Project>> {
                self.inner.get_project(id).await
            }

            async fn delete_project(&self, id: ProjectId) -> Result<bool> {
                self.inner.delete_project(id).await
            }

            async fn existing_project_ids(&self, ids: &[ProjectId]) -> Result<Vec<ProjectId>> {
                self.inner.existing_project_ids(ids).await
            }

            async fn project_ids_for_root_namespace(
                &self,
                root: NamespaceId,
            ) -> Result<Vec<ProjectId>> {
                self.inner.project_ids_for_root_namespace(root).await
            }

            async fn upsert_subscription(&self, subscription: &Subscription) -> Result<()> {
                self.inner.upsert_subscription(subscription).await
            }

            async fn subscriptions_after(
                &self,
                after: Option<NamespaceId>,
                limit: usize,
            ) -> Result<Vec<Subscription>> {
                self.inner.subscriptions_after(after, limit).await
            }

            async fn save_node(&self, node: &Node) -> Result<Node> {
                self.inner.save_node(node).await
            }

            async fn find_node_by_uuid(&self, uuid: &Uuid) -> Result<Option<Node>> {
                self.inner.find_node_by_uuid(uuid).await
            }

            async fn get_node(&self, id: NodeId) -> Result<Option<Node>> {
                self.inner.get_node(id).await
            }

            async fn list_nodes(&self) -> Result<Vec<Node>> {
                self.inner.list_nodes().await
            }

            async fn create_enabled_namespace(
                &self,
                root_namespace_id: NamespaceId,
                search: bool,
                now: DateTime<Utc>,
            ) -> Result<EnabledNamespace> {
                self.inner.create_enabled_namespace(root_namespace_id, search, now).await
            }

            async fn get_enabled_namespace(
                &self,
                id: EnabledNamespaceId,
            ) -> Result<Option<EnabledNamespace>> {
                self.inner.get_enabled_namespace(id).await
            }

            async fn find_enabled_namespace(
                &self,
                root_namespace_id: NamespaceId,
            ) -> Result<Option<EnabledNamespace>> {
                self.inner.find_enabled_namespace(root_namespace_id).await
            }

            async fn list_enabled_namespaces(&self) -> Result<Vec<EnabledNamespace>> {
                self.inner.list_enabled_namespaces().await
            }

            async fn set_namespace_search(
                &self,
                id: EnabledNamespaceId,
                search: bool,
                now: DateTime<Utc>,
            ) -> Result<()> {
                self.inner.set_namespace_search(id, search, now).await
            }

            async fn delete_enabled_namespace(
                &self,
                id: EnabledNamespaceId,
            ) -> Result<Vec<RemovedIndex>> {
                self.inner.delete_enabled_namespace(id).await
            }

            async fn create_replica(
                &self,
                enabled_namespace_id: EnabledNamespaceId,
                namespace_id: NamespaceId,
            ) -> Result<Replica> {
                self.inner.create_replica(enabled_namespace_id, namespace_id).await
            }

            async fn replicas_for_namespace(
                &self,
                enabled_namespace_id: EnabledNamespaceId,
            ) -> Result<Vec<Replica>> {
                self.inner.replicas_for_namespace(enabled_namespace_id).await
            }

            async fn insert_index(&self, index: &NewIndex) -> Result<Index> {
                self.inner.insert_index(index).await
            }

            async fn get_index(&self, id: IndexId) -> Result<Option<Index>> {
                self.inner.get_index(id).await
            }

            async fn list_indices(&self) -> Result<Vec<Index>> {
                self.inner.list_indices().await
            }

            async fn indices_for_enabled_namespace(
                &self,
                id: EnabledNamespaceId,
            ) -> Result<Vec<Index>> {
                self.inner.indices_for_enabled_namespace(id).await
            }

            async fn set_index_state(&self, id: IndexId, state: IndexState) -> Result<()> {
                self.inner.set_index_state(id, state).await
            }

            async fn delete_index(&self, id: IndexId) -> Result<Option<RemovedIndex>> {
                self.inner.delete_index(id).await
            }

            async fn insert_repository(&self, repository: &NewRepository) -> Result<Repository> {
                self.inner.insert_repository(repository).await
            }

            async fn insert_repository_task(
                &self,
                repository: &NewRepository,
                task: &NewTask,
            ) -> Result<(Repository, Task)> {
                self.inner.insert_repository_task(repository, task).await
            }

            async fn find_repository(
                &self,
                index_id: IndexId,
                project_identifier: ProjectId,
            ) -> Result<Option<Repository>> {
                self.inner.find_repository(index_id, project_identifier).await
            }

            async fn get_repository(&self, id: RepositoryId) -> Result<Option<Repository>> {
                self.inner.get_repository(id).await
            }

            async fn get_repositories(&self, ids: &[RepositoryId]) -> Result<Vec<Repository>> {
                self.inner.get_repositories(ids).await
            }

            async fn repositories_for_index(&self, index_id: IndexId) -> Result<Vec<Repository>> {
                self.inner.repositories_for_index(index_id).await
            }

            async fn non_ready_repositories(&self, index_id: IndexId) -> Result<Vec<Repository>> {
                self.inner.non_ready_repositories(index_id).await
            }

            async fn set_repository_state(
                &self,
                id: RepositoryId,
                state: RepositoryState,
                now: DateTime<Utc>,
            ) -> Result<bool> {
                self.inner.set_repository_state(id, state, now).await
            }

            async fn partitions(&self) -> Result<Vec<Partition>> {
                self.inner.partitions().await
            }

            async fn open_partition(
                &self,
                after: Option<PartitionId>,
                now: DateTime<Utc>,
            ) -> Result<Partition> {
                self.inner.open_partition(after, now).await
            }

            async fn detach_partition(&self, id: PartitionId) -> Result<bool> {
                self.inner.detach_partition(id).await
            }

            async fn insert_task(&self, task: &NewTask) -> Result<Task> {
                self.inner.insert_task(task).await
            }

            async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
                self.inner.get_task(id).await
            }

            async fn oldest_task(&self, partition_id: PartitionId) -> Result<Option<Task>> {
                self.inner.oldest_task(partition_id).await
            }

            async fn tasks_for_partition(&self, partition_id: PartitionId) -> Result<Vec<Task>> {
                self.inner.tasks_for_partition(partition_id).await
            }

            async fn pending_count(&self, partition_id: PartitionId) -> Result<usize> {
                self.inner.pending_count(partition_id).await
            }

            async fn pending_tasks_after(
                &self,
                node_id: NodeId,
                after: Option<TaskCursor>,
                now: DateTime<Utc>,
                limit: usize,
            ) -> Result<Vec<Task>> {
                self.inner.pending_tasks_after(node_id, after, now, limit).await
            }

            async fn release_claim(&self, token: &Uuid) -> Result<usize> {
                self.inner.release_claim(token).await
            }

            async fn mark_tasks_orphaned(&self, ids: &[TaskId]) -> Result<usize> {
                self.inner.mark_tasks_orphaned(ids).await
            }

            async fn resolve_task(
                &self,
                id: TaskId,
                state: TaskState,
                token: Option<&Uuid>,
            ) -> Result<Option<Task>> {
                self.inner.resolve_task(id, state, token).await
            }
        }
    }

    #[tokio::test]
    async fn test_lost_claim_resumes_page_cut_short() {
        let store = Arc::new(contended::ContendedStore::new());
        store.inner.insert_task(&delete_task(1, t0())).await.unwrap();
        let second = store.inner.insert_task(&delete_task(1, t0())).await.unwrap();
        let r = Reconciler::new(
            store.clone(),
            Arc::new(ManualClock::new(t0())),
            BackoffRegistry::default(),
            DispatchSettings {
                page_size: 3,
                ..DispatchSettings::default()
            },
        );

        // The page holds both tasks, the limit stops the scan at the first
        // and a rival dispatch takes that one.
        let batch = r.dispatch_batch(1, 1).await.unwrap();
        assert_eq!(batch.tasks.iter().map(|t| t.id).collect::<Vec<_>>(), vec![second.id]);
        let claimed = store.inner.get_task(second.id).await.unwrap().unwrap();
        assert_eq!(claimed.claim.map(|c| c.token), Some(batch.token));
    }

    #[tokio::test]
    async fn test_outcome_under_superseded_token_is_ignored() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let task = store.insert_task(&delete_task(1, t0())).await.unwrap();
        let r = reconciler(store.clone(), clock.clone());

        let stale = r.dispatch_batch(1, 10).await.unwrap();
        clock.advance(Duration::minutes(6));
        let fresh = r.dispatch_batch(1, 10).await.unwrap();
        assert_eq!(fresh.tasks[0].id, task.id);

        let report = r
            .apply_outcomes(
                1,
                &[TaskOutcome {
                    task_id: task.id,
                    result: TaskResult::Failed,
                    claim_token: Some(stale.token),
                }],
            )
            .await
            .unwrap();
        assert_eq!(report, OutcomeReport { done: 0, failed: 0, ignored: 1 });
        assert_eq!(r.backoff().get(1).failures(), 0);
        let pending = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(pending.state, TaskState::Pending);

        let report = r
            .apply_outcomes(
                1,
                &[TaskOutcome {
                    task_id: task.id,
                    result: TaskResult::Done,
                    claim_token: Some(fresh.token),
                }],
            )
            .await
            .unwrap();
        assert_eq!(report.done, 1);
        let done = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(done.state, TaskState::Done);
    }

    #[test]
    fn test_outcome_token_is_optional_on_the_wire() {
        let outcome: TaskOutcome =
            serde_json::from_str(r#"{"task_id": 4, "result": "done"}"#).unwrap();
        assert_eq!(outcome.claim_token, None);
    }
}
