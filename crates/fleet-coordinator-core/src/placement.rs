//! Placement layer: which namespace's index lives on which node.
//!
//! Operations here never perform side effects on nodes directly. Creating
//! or removing an index returns [`PlacementEvent`]s describing the work the
//! owning node has to do; the caller hands them to
//! [`events::apply_events`](crate::events::apply_events).
//!
//! # Index lifecycle
//!
//! ```text
//! pending ──(repositories tracked for every project)──▶ initializing
//! initializing ──(every repository ready, at least one)──▶ ready
//! ```

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::CoordinatorError;
use crate::models::{
    EnabledNamespace, Index, IndexId, IndexState, NamespaceId, NewIndex, Node, NodeId, ProjectId,
    RemovedIndex, Replica,
};
use crate::nodes::online_nodes;
use crate::store::Store;

/// Outbound work produced by a placement change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlacementEvent {
    /// Build everything for this namespace from scratch on the node.
    RequestFullNamespaceIndex {
        root_namespace_id: NamespaceId,
        index_id: IndexId,
        node_id: NodeId,
    },
    /// Drop the namespace's data from the node.
    RequestNamespaceDelete {
        root_namespace_id: NamespaceId,
        node_id: NodeId,
        /// Projects whose repositories the removed index was tracking.
        project_identifiers: Vec<ProjectId>,
    },
}

/// Capacity rules for automatic placement.
#[derive(Debug, Clone, Copy)]
pub struct PlacementPolicy {
    /// Multiplier applied to a namespace's repository size to estimate
    /// index size on disk.
    pub buffer_factor: u64,
    /// New placements must keep a node at or below this storage ratio.
    pub watermark_low: f64,
    /// Nodes at or above this ratio shed namespaces during reallocation.
    pub watermark_high: f64,
}

impl Default for PlacementPolicy {
    fn default() -> Self {
        Self {
            buffer_factor: 3,
            watermark_low: 0.7,
            watermark_high: 0.8,
        }
    }
}

/// Mark a root namespace as eligible for indexing.
pub async fn enable_namespace<S: Store + ?Sized>(
    store: &S,
    root_namespace_id: NamespaceId,
    search: bool,
    now: DateTime<Utc>,
) -> Result<EnabledNamespace> {
    let namespace = store
        .get_namespace(root_namespace_id)
        .await?
        .ok_or(CoordinatorError::InvalidNamespace(root_namespace_id))?;
    if !namespace.is_root() {
        return Err(CoordinatorError::InvalidNamespace(root_namespace_id).into());
    }

    let enabled = store
        .create_enabled_namespace(root_namespace_id, search, now)
        .await?;
    tracing::info!(
        root_namespace_id,
        enabled_namespace_id = enabled.id,
        search = enabled.search,
        "namespace enabled"
    );
    Ok(enabled)
}

/// Toggle whether a namespace's indices serve live searches.
pub async fn set_search<S: Store + ?Sized>(
    store: &S,
    root_namespace_id: NamespaceId,
    search: bool,
    now: DateTime<Utc>,
) -> Result<EnabledNamespace> {
    let enabled = store
        .find_enabled_namespace(root_namespace_id)
        .await?
        .ok_or_else(|| CoordinatorError::not_found("enabled namespace", root_namespace_id))?;
    store.set_namespace_search(enabled.id, search, now).await?;
    Ok(EnabledNamespace {
        search,
        updated_at: now,
        ..enabled
    })
}

fn check_root(enabled: &EnabledNamespace, namespace_id: NamespaceId) -> Result<()> {
    if namespace_id != enabled.root_namespace_id {
        return Err(CoordinatorError::NamespaceMismatch {
            expected: enabled.root_namespace_id,
            actual: namespace_id,
        }
        .into());
    }
    Ok(())
}

async fn replica_for<S: Store + ?Sized>(store: &S, enabled: &EnabledNamespace) -> Result<Replica> {
    let existing = store.replicas_for_namespace(enabled.id).await?;
    let replica = match existing.into_iter().next() {
        Some(replica) => replica,
        None => {
            store
                .create_replica(enabled.id, enabled.root_namespace_id)
                .await?
        }
    };
    check_root(enabled, replica.namespace_id)?;
    Ok(replica)
}

/// Place a namespace's index on a node.
///
/// The index starts `pending`; the returned event asks the node to build the
/// namespace from scratch. A namespace already placed on the node keeps its
/// index and produces no event.
pub async fn assign_index<S: Store + ?Sized>(
    store: &S,
    enabled: &EnabledNamespace,
    node: &Node,
    now: DateTime<Utc>,
) -> Result<(Index, Vec<PlacementEvent>)> {
    let node_id = node
        .id
        .ok_or_else(|| CoordinatorError::Validation(format!("node {} is not registered", node.uuid)))?;
    if let Some(existing) = store
        .indices_for_enabled_namespace(enabled.id)
        .await?
        .into_iter()
        .find(|index| index.node_id == node_id)
    {
        tracing::debug!(
            index_id = existing.id,
            node_id,
            root_namespace_id = enabled.root_namespace_id,
            "namespace already placed on node"
        );
        return Ok((existing, Vec::new()));
    }
    let replica = replica_for(store, enabled).await?;

    let new = NewIndex {
        enabled_namespace_id: enabled.id,
        replica_id: Some(replica.id),
        node_id,
        namespace_id: enabled.root_namespace_id,
        state: IndexState::Pending,
        created_at: now,
    };
    check_root(enabled, new.namespace_id)?;
    let index = store.insert_index(&new).await?;

    tracing::info!(
        index_id = index.id,
        node_id,
        node_name = %node.metadata.name,
        root_namespace_id = enabled.root_namespace_id,
        "index assigned"
    );
    let events = vec![PlacementEvent::RequestFullNamespaceIndex {
        root_namespace_id: enabled.root_namespace_id,
        index_id: index.id,
        node_id,
    }];
    Ok((index, events))
}

/// Destroy an index. Returns the delete request for its node, or nothing if
/// the index was already gone.
pub async fn remove_index<S: Store + ?Sized>(store: &S, index: &Index) -> Result<Vec<PlacementEvent>> {
    match store.delete_index(index.id).await? {
        Some(removed) => {
            tracing::info!(
                index_id = removed.index.id,
                node_id = removed.index.node_id,
                repositories = removed.project_identifiers.len(),
                "index removed"
            );
            Ok(vec![delete_request(removed)])
        }
        None => Ok(Vec::new()),
    }
}

fn delete_request(removed: RemovedIndex) -> PlacementEvent {
    PlacementEvent::RequestNamespaceDelete {
        root_namespace_id: removed.index.namespace_id,
        node_id: removed.index.node_id,
        project_identifiers: removed.project_identifiers,
    }
}

/// Destroy an enabled namespace and every index it owns.
pub async fn remove_enabled_namespace<S: Store + ?Sized>(
    store: &S,
    enabled: &EnabledNamespace,
) -> Result<Vec<PlacementEvent>> {
    let removed = store.delete_enabled_namespace(enabled.id).await?;
    tracing::info!(
        root_namespace_id = enabled.root_namespace_id,
        indices = removed.len(),
        "enabled namespace removed"
    );
    Ok(removed.into_iter().map(delete_request).collect())
}

/// Indices that may serve live searches: `ready` and owned by a namespace
/// with search enabled.
pub async fn searchable_indices<S: Store + ?Sized>(store: &S) -> Result<Vec<Index>> {
    let search_enabled: HashMap<_, _> = store
        .list_enabled_namespaces()
        .await?
        .into_iter()
        .map(|e| (e.id, e.search))
        .collect();
    Ok(store
        .list_indices()
        .await?
        .into_iter()
        .filter(|index| {
            index.state == IndexState::Ready
                && search_enabled
                    .get(&index.enabled_namespace_id)
                    .copied()
                    .unwrap_or(false)
        })
        .collect())
}

/// Enabled namespaces that have no index yet.
pub async fn missing_indices<S: Store + ?Sized>(store: &S) -> Result<Vec<EnabledNamespace>> {
    let placed: std::collections::HashSet<_> = store
        .list_indices()
        .await?
        .into_iter()
        .map(|i| i.enabled_namespace_id)
        .collect();
    Ok(store
        .list_enabled_namespaces()
        .await?
        .into_iter()
        .filter(|e| !placed.contains(&e.id))
        .collect())
}

/// True if the index tracks at least one repository and none of them is
/// outside the `ready` state.
pub async fn all_repositories_ready<S: Store + ?Sized>(store: &S, index_id: IndexId) -> Result<bool> {
    if !store.non_ready_repositories(index_id).await?.is_empty() {
        return Ok(false);
    }
    Ok(!store.repositories_for_index(index_id).await?.is_empty())
}

/// Whether an index is fully searchable.
pub async fn index_ready<S: Store + ?Sized>(store: &S, index: &Index) -> Result<bool> {
    if index.state != IndexState::Ready {
        return Ok(false);
    }
    all_repositories_ready(store, index.id).await
}

/// Outcome of an automatic placement run.
#[derive(Debug, Default, Serialize)]
pub struct AssignmentReport {
    pub assigned: Vec<Index>,
    /// Enabled namespaces that could not be placed this run.
    pub skipped: Vec<NamespaceId>,
    pub events: Vec<PlacementEvent>,
}

/// Place every enabled namespace that has no index onto the online node with
/// the most free space, as long as the node stays under the low watermark.
pub async fn assign_missing_indices<S: Store + ?Sized>(
    store: &S,
    policy: &PlacementPolicy,
    now: DateTime<Utc>,
) -> Result<AssignmentReport> {
    let mut report = AssignmentReport::default();
    let mut nodes = online_nodes(store.list_nodes().await?, now);
    if nodes.is_empty() {
        tracing::debug!("no online nodes; skipping node assignment");
        return Ok(report);
    }

    for enabled in missing_indices(store).await? {
        let Some(namespace) = store.get_namespace(enabled.root_namespace_id).await? else {
            tracing::error!(
                root_namespace_id = enabled.root_namespace_id,
                "namespace missing from catalog; cannot size it"
            );
            report.skipped.push(enabled.root_namespace_id);
            continue;
        };
        let required = namespace.repository_size.saturating_mul(policy.buffer_factor);

        let Some(node) = nodes.iter_mut().max_by_key(|n| n.free_bytes()) else {
            break;
        };
        let limit = node.total_bytes as f64 * policy.watermark_low;
        if (node.used_bytes.saturating_add(required)) as f64 > limit {
            tracing::error!(
                root_namespace_id = enabled.root_namespace_id,
                node_id = node.id,
                node_name = %node.metadata.name,
                required,
                "space is not available on any node"
            );
            report.skipped.push(enabled.root_namespace_id);
            continue;
        }

        let (index, events) = assign_index(store, &enabled, node, now).await?;
        node.used_bytes = node.used_bytes.saturating_add(required);
        report.assigned.push(index);
        report.events.extend(events);
    }

    Ok(report)
}

/// Shed namespaces from nodes above the high watermark, smallest first,
/// until each node's projected ratio falls below it. Affected namespaces
/// stop serving searches until they are re-placed and re-indexed.
pub async fn reallocate<S: Store + ?Sized>(
    store: &S,
    policy: &PlacementPolicy,
    now: DateTime<Utc>,
) -> Result<Vec<PlacementEvent>> {
    let nodes: Vec<Node> = online_nodes(store.list_nodes().await?, now)
        .into_iter()
        .filter(|n| n.total_bytes > 0 && n.storage_ratio() >= policy.watermark_high)
        .collect();
    if nodes.is_empty() {
        return Ok(Vec::new());
    }
    tracing::info!(
        count = nodes.len(),
        watermark_high = policy.watermark_high,
        "nodes over watermark"
    );

    let indices = store.list_indices().await?;
    let mut events = Vec::new();

    for node in nodes {
        let mut sized = Vec::new();
        for index in indices.iter().filter(|i| Some(i.node_id) == node.id) {
            let size = store
                .get_namespace(index.namespace_id)
                .await?
                .map(|n| n.repository_size)
                .unwrap_or(0);
            sized.push((size, index));
        }
        sized.sort_by_key(|(size, index)| (*size, index.id));

        let mut projected = node.used_bytes;
        let mut to_move = Vec::new();
        for (size, index) in sized {
            if (projected as f64 / node.total_bytes as f64) < policy.watermark_high {
                break;
            }
            projected = projected.saturating_sub(size);
            to_move.push(index);
        }

        tracing::info!(
            node_id = node.id,
            node_name = %node.metadata.name,
            count = to_move.len(),
            node_used_bytes = node.used_bytes,
            node_expected_used_bytes = projected,
            "unassigning namespaces from node"
        );

        for index in to_move {
            store
                .set_namespace_search(index.enabled_namespace_id, false, now)
                .await?;
            events.extend(remove_index(store, index).await?);
        }
    }

    Ok(events)
}

/// Index ids moved by [`advance_index_states`].
#[derive(Debug, Default, Serialize)]
pub struct IndexTransitions {
    pub initializing: Vec<IndexId>,
    pub ready: Vec<IndexId>,
    /// Full-index requests for pending indices that still miss repositories.
    pub requests: Vec<PlacementEvent>,
}

/// Drive indices forward through their lifecycle.
///
/// A pending index that does not yet track every project of its namespace
/// is asked to index again, so a lost placement event never leaves it
/// stranded. Applying the request only fills in the missing repositories.
pub async fn advance_index_states<S: Store + ?Sized>(store: &S) -> Result<IndexTransitions> {
    let mut transitions = IndexTransitions::default();

    for index in store.list_indices().await? {
        match index.state {
            IndexState::Pending => {
                let projects = store
                    .project_ids_for_root_namespace(index.namespace_id)
                    .await?
                    .len();
                let tracked = store.repositories_for_index(index.id).await?.len();
                if tracked >= projects {
                    store
                        .set_index_state(index.id, IndexState::Initializing)
                        .await?;
                    tracing::info!(
                        index_id = index.id,
                        node_id = index.node_id,
                        repo_count = tracked,
                        project_count = projects,
                        "index moved to initializing"
                    );
                    transitions.initializing.push(index.id);
                } else {
                    tracing::debug!(
                        index_id = index.id,
                        repo_count = tracked,
                        project_count = projects,
                        "index still pending; requesting full index"
                    );
                    transitions.requests.push(PlacementEvent::RequestFullNamespaceIndex {
                        root_namespace_id: index.namespace_id,
                        index_id: index.id,
                        node_id: index.node_id,
                    });
                }
            }
            IndexState::Initializing => {
                if all_repositories_ready(store, index.id).await? {
                    store.set_index_state(index.id, IndexState::Ready).await?;
                    transitions.ready.push(index.id);
                }
            }
            IndexState::Ready => {}
        }
    }

    if !transitions.ready.is_empty() {
        tracing::info!(count = transitions.ready.len(), "set indices ready");
    }
    Ok(transitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    use crate::models::{Namespace, NodeMetadata, Project, RepositoryState, TaskType};
    use crate::repositories::create_tasks;
    use crate::store::memory::InMemoryStore;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn namespace(id: NamespaceId, parent_id: Option<NamespaceId>, size: u64) -> Namespace {
        Namespace {
            id,
            parent_id,
            name: format!("ns-{}", id),
            repository_size: size,
        }
    }

    async fn node(store: &InMemoryStore, name: &str, used: u64, total: u64) -> Node {
        store
            .save_node(&Node {
                id: None,
                uuid: Uuid::new_v4(),
                index_base_url: format!("http://{}:6080", name),
                search_base_url: format!("http://{}:6090", name),
                last_seen_at: t0(),
                used_bytes: used,
                total_bytes: total,
                metadata: NodeMetadata {
                    name: name.into(),
                    ..Default::default()
                },
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_enable_root_only() {
        let store = InMemoryStore::new();
        store.upsert_namespace(&namespace(42, None, 0)).await.unwrap();
        store.upsert_namespace(&namespace(43, Some(42), 0)).await.unwrap();

        let enabled = enable_namespace(&store, 42, false, t0()).await.unwrap();
        assert_eq!(enabled.root_namespace_id, 42);

        let err = enable_namespace(&store, 43, false, t0()).await.unwrap_err();
        assert_eq!(
            CoordinatorError::find(&err),
            Some(&CoordinatorError::InvalidNamespace(43))
        );
        let err = enable_namespace(&store, 999, false, t0()).await.unwrap_err();
        assert_eq!(
            CoordinatorError::find(&err),
            Some(&CoordinatorError::InvalidNamespace(999))
        );
    }

    #[tokio::test]
    async fn test_assign_and_remove_emit_events() {
        let store = InMemoryStore::new();
        store.upsert_namespace(&namespace(42, None, 0)).await.unwrap();
        let enabled = enable_namespace(&store, 42, true, t0()).await.unwrap();
        let node_a = node(&store, "a", 0, 100).await;

        let (index, events) = assign_index(&store, &enabled, &node_a, t0()).await.unwrap();
        assert_eq!(index.state, IndexState::Pending);
        assert_eq!(index.namespace_id, 42);
        assert!(index.replica_id.is_some());
        assert_eq!(
            events,
            vec![PlacementEvent::RequestFullNamespaceIndex {
                root_namespace_id: 42,
                index_id: index.id,
                node_id: node_a.id.unwrap(),
            }]
        );
        assert!(missing_indices(&store).await.unwrap().is_empty());

        let events = remove_index(&store, &index).await.unwrap();
        assert_eq!(
            events,
            vec![PlacementEvent::RequestNamespaceDelete {
                root_namespace_id: 42,
                node_id: node_a.id.unwrap(),
                project_identifiers: vec![],
            }]
        );
        assert!(remove_index(&store, &index).await.unwrap().is_empty());
        assert_eq!(missing_indices(&store).await.unwrap().len(), 1);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = PlacementEvent::RequestNamespaceDelete {
            root_namespace_id: 42,
            node_id: 3,
            project_identifiers: vec![7, 8],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "request_namespace_delete");
        assert_eq!(json["root_namespace_id"], 42);
        assert_eq!(json["project_identifiers"], serde_json::json!([7, 8]));
    }

    #[tokio::test]
    async fn test_assign_twice_keeps_one_index() {
        let store = InMemoryStore::new();
        store.upsert_namespace(&namespace(42, None, 0)).await.unwrap();
        let enabled = enable_namespace(&store, 42, true, t0()).await.unwrap();
        let node_a = node(&store, "a", 0, 100).await;
        let node_b = node(&store, "b", 0, 100).await;

        let (first, events) = assign_index(&store, &enabled, &node_a, t0()).await.unwrap();
        assert_eq!(events.len(), 1);
        let (again, events) = assign_index(&store, &enabled, &node_a, t0()).await.unwrap();
        assert_eq!(again, first);
        assert!(events.is_empty());
        assert_eq!(store.indices_for_enabled_namespace(enabled.id).await.unwrap().len(), 1);

        let (other, events) = assign_index(&store, &enabled, &node_b, t0()).await.unwrap();
        assert_ne!(other.id, first.id);
        assert_eq!(events.len(), 1);
        assert_eq!(store.indices_for_enabled_namespace(enabled.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_reports_tracked_projects() {
        let store = InMemoryStore::new();
        store.upsert_namespace(&namespace(42, None, 0)).await.unwrap();
        let enabled = enable_namespace(&store, 42, true, t0()).await.unwrap();
        let node_a = node(&store, "a", 0, 100).await;
        let (index, _) = assign_index(&store, &enabled, &node_a, t0()).await.unwrap();
        for id in [3, 1] {
            let project = Project { id, namespace_id: 42, root_namespace_id: 42 };
            store.upsert_project(&project).await.unwrap();
            create_tasks(&store, &project, &index, TaskType::IndexRepo, t0(), t0())
                .await
                .unwrap();
        }
        assert!(store.delete_project(3).await.unwrap());

        let events = remove_enabled_namespace(&store, &enabled).await.unwrap();
        assert_eq!(
            events,
            vec![PlacementEvent::RequestNamespaceDelete {
                root_namespace_id: 42,
                node_id: node_a.id.unwrap(),
                project_identifiers: vec![1, 3],
            }]
        );
    }

    #[tokio::test]
    async fn test_assign_requires_persisted_node() {
        let store = InMemoryStore::new();
        store.upsert_namespace(&namespace(42, None, 0)).await.unwrap();
        let enabled = enable_namespace(&store, 42, true, t0()).await.unwrap();
        let mut unsaved = node(&store, "a", 0, 100).await;
        unsaved.id = None;
        assert!(assign_index(&store, &enabled, &unsaved, t0()).await.is_err());
    }

    #[tokio::test]
    async fn test_index_readiness_is_exact() {
        let store = InMemoryStore::new();
        store.upsert_namespace(&namespace(42, None, 0)).await.unwrap();
        let p1 = Project { id: 1, namespace_id: 42, root_namespace_id: 42 };
        let p2 = Project { id: 2, namespace_id: 42, root_namespace_id: 42 };
        store.upsert_project(&p1).await.unwrap();
        store.upsert_project(&p2).await.unwrap();
        let enabled = enable_namespace(&store, 42, true, t0()).await.unwrap();
        let node_a = node(&store, "a", 0, 100).await;
        let (index, _) = assign_index(&store, &enabled, &node_a, t0()).await.unwrap();
        store.set_index_state(index.id, IndexState::Ready).await.unwrap();
        let index = store.get_index(index.id).await.unwrap().unwrap();

        // Ready state alone is not enough without repositories.
        assert!(!index_ready(&store, &index).await.unwrap());

        let (r1, _) = create_tasks(&store, &p1, &index, TaskType::IndexRepo, t0(), t0())
            .await
            .unwrap();
        assert!(!index_ready(&store, &index).await.unwrap());
        store
            .set_repository_state(r1.id, RepositoryState::Ready, t0())
            .await
            .unwrap();
        assert!(index_ready(&store, &index).await.unwrap());
        assert_eq!(searchable_indices(&store).await.unwrap().len(), 1);

        create_tasks(&store, &p2, &index, TaskType::IndexRepo, t0(), t0())
            .await
            .unwrap();
        assert!(!index_ready(&store, &index).await.unwrap());
    }

    #[tokio::test]
    async fn test_searchable_requires_search_flag() {
        let store = InMemoryStore::new();
        store.upsert_namespace(&namespace(42, None, 0)).await.unwrap();
        let enabled = enable_namespace(&store, 42, false, t0()).await.unwrap();
        let node_a = node(&store, "a", 0, 100).await;
        let (index, _) = assign_index(&store, &enabled, &node_a, t0()).await.unwrap();
        store.set_index_state(index.id, IndexState::Ready).await.unwrap();

        assert!(searchable_indices(&store).await.unwrap().is_empty());
        set_search(&store, 42, true, t0()).await.unwrap();
        assert_eq!(searchable_indices(&store).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_assign_missing_respects_watermark() {
        let store = InMemoryStore::new();
        store.upsert_namespace(&namespace(1, None, 10)).await.unwrap();
        store.upsert_namespace(&namespace(2, None, 10)).await.unwrap();
        store.upsert_namespace(&namespace(3, None, 10)).await.unwrap();
        for id in 1..=3 {
            enable_namespace(&store, id, false, t0()).await.unwrap();
        }
        let small = node(&store, "small", 0, 50).await;
        let big = node(&store, "big", 0, 100).await;

        let report = assign_missing_indices(&store, &PlacementPolicy::default(), t0())
            .await
            .unwrap();

        // Each namespace needs 30 bytes; big takes two (60 <= 70), small one (30 <= 35).
        assert_eq!(report.assigned.len(), 3);
        let on_big = report
            .assigned
            .iter()
            .filter(|i| Some(i.node_id) == big.id)
            .count();
        let on_small = report
            .assigned
            .iter()
            .filter(|i| Some(i.node_id) == small.id)
            .count();
        assert_eq!((on_big, on_small), (2, 1));
        assert_eq!(report.events.len(), 3);

        store.upsert_namespace(&namespace(4, None, 10)).await.unwrap();
        enable_namespace(&store, 4, false, t0()).await.unwrap();
        let report = assign_missing_indices(&store, &PlacementPolicy::default(), t0())
            .await
            .unwrap();
        // Node accounting only comes from heartbeats, so a fresh run sees free space again.
        assert_eq!(report.assigned.len(), 1);
    }

    #[tokio::test]
    async fn test_assign_missing_skips_offline_and_full() {
        let store = InMemoryStore::new();
        store.upsert_namespace(&namespace(1, None, 40)).await.unwrap();
        enable_namespace(&store, 1, false, t0()).await.unwrap();
        node(&store, "a", 0, 100).await;

        let later = t0() + Duration::minutes(5);
        let report = assign_missing_indices(&store, &PlacementPolicy::default(), later)
            .await
            .unwrap();
        assert!(report.assigned.is_empty());

        let report = assign_missing_indices(&store, &PlacementPolicy::default(), t0())
            .await
            .unwrap();
        assert!(report.assigned.is_empty());
        assert_eq!(report.skipped, vec![1]);
    }

    #[tokio::test]
    async fn test_reallocate_sheds_smallest_first() {
        let store = InMemoryStore::new();
        for (id, size) in [(1, 5), (2, 10), (3, 40)] {
            store.upsert_namespace(&namespace(id, None, size)).await.unwrap();
            enable_namespace(&store, id, true, t0()).await.unwrap();
        }
        let full = node(&store, "full", 90, 100).await;
        for enabled in store.list_enabled_namespaces().await.unwrap() {
            assign_index(&store, &enabled, &full, t0()).await.unwrap();
        }

        let events = reallocate(&store, &PlacementPolicy::default(), t0()).await.unwrap();

        // 90 -> 85 (still >= 80) -> 75: namespaces 1 and 2 move, 3 stays.
        assert_eq!(events.len(), 2);
        let remaining = store.list_indices().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].namespace_id, 3);
        let ns1 = store.find_enabled_namespace(1).await.unwrap().unwrap();
        assert!(!ns1.search);
        let ns3 = store.find_enabled_namespace(3).await.unwrap().unwrap();
        assert!(ns3.search);
    }

    #[tokio::test]
    async fn test_advance_index_states() {
        let store = InMemoryStore::new();
        store.upsert_namespace(&namespace(42, None, 0)).await.unwrap();
        let project = Project { id: 1, namespace_id: 42, root_namespace_id: 42 };
        store.upsert_project(&project).await.unwrap();
        let enabled = enable_namespace(&store, 42, true, t0()).await.unwrap();
        let node_a = node(&store, "a", 0, 100).await;
        let (index, _) = assign_index(&store, &enabled, &node_a, t0()).await.unwrap();

        let transitions = advance_index_states(&store).await.unwrap();
        assert!(transitions.initializing.is_empty());
        assert_eq!(
            transitions.requests,
            vec![PlacementEvent::RequestFullNamespaceIndex {
                root_namespace_id: 42,
                index_id: index.id,
                node_id: node_a.id.unwrap(),
            }]
        );

        let (repository, _) = create_tasks(&store, &project, &index, TaskType::IndexRepo, t0(), t0())
            .await
            .unwrap();
        let transitions = advance_index_states(&store).await.unwrap();
        assert_eq!(transitions.initializing, vec![index.id]);
        assert!(transitions.requests.is_empty());

        let transitions = advance_index_states(&store).await.unwrap();
        assert!(transitions.ready.is_empty());

        store
            .set_repository_state(repository.id, RepositoryState::Ready, t0())
            .await
            .unwrap();
        let transitions = advance_index_states(&store).await.unwrap();
        assert_eq!(transitions.ready, vec![index.id]);
        let index = store.get_index(index.id).await.unwrap().unwrap();
        assert!(index_ready(&store, &index).await.unwrap());
    }

    #[tokio::test]
    async fn test_pending_index_recovers_from_lost_event() {
        let store = InMemoryStore::new();
        store.upsert_namespace(&namespace(42, None, 1)).await.unwrap();
        for id in [1, 2] {
            store
                .upsert_project(&Project { id, namespace_id: 42, root_namespace_id: 42 })
                .await
                .unwrap();
        }
        enable_namespace(&store, 42, true, t0()).await.unwrap();
        node(&store, "a", 0, 100).await;

        // The placement events are dropped on the floor.
        let report = assign_missing_indices(&store, &PlacementPolicy::default(), t0())
            .await
            .unwrap();
        assert_eq!(report.assigned.len(), 1);
        let index_id = report.assigned[0].id;
        assert!(store.repositories_for_index(index_id).await.unwrap().is_empty());

        let transitions = advance_index_states(&store).await.unwrap();
        assert_eq!(transitions.requests.len(), 1);
        let tasks = crate::events::apply_events(&store, &transitions.requests, t0())
            .await
            .unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(store.repositories_for_index(index_id).await.unwrap().len(), 2);

        let transitions = advance_index_states(&store).await.unwrap();
        assert_eq!(transitions.initializing, vec![index_id]);
        assert!(transitions.requests.is_empty());
        let index = store.get_index(index_id).await.unwrap().unwrap();
        assert_eq!(index.state, IndexState::Initializing);
    }
}
