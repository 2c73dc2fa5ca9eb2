//! Turns [`PlacementEvent`]s into task-log entries.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::models::{Task, TaskType};
use crate::placement::PlacementEvent;
use crate::repositories::{create_delete_task, create_tasks};
use crate::store::Store;

/// Apply placement events, returning the tasks they created.
///
/// A full-namespace index request becomes one `index_repo` task per catalog
/// project of the namespace that the index does not track yet, so repeating
/// a request is harmless. A namespace delete request becomes one
/// repository-less `delete_repo` task per repository the removed index
/// tracked, whether or not its project is still in the catalog.
pub async fn apply_events<S: Store + ?Sized>(
    store: &S,
    events: &[PlacementEvent],
    now: DateTime<Utc>,
) -> Result<Vec<Task>> {
    let mut created = Vec::new();

    for event in events {
        match event {
            PlacementEvent::RequestFullNamespaceIndex {
                root_namespace_id,
                index_id,
                ..
            } => {
                let Some(index) = store.get_index(*index_id).await? else {
                    tracing::warn!(index_id, "index removed before it could be populated");
                    continue;
                };
                for project_id in store.project_ids_for_root_namespace(*root_namespace_id).await? {
                    if store.find_repository(index.id, project_id).await?.is_some() {
                        continue;
                    }
                    let Some(project) = store.get_project(project_id).await? else {
                        continue;
                    };
                    let (_, task) =
                        create_tasks(store, &project, &index, TaskType::IndexRepo, now, now).await?;
                    created.push(task);
                }
            }
            PlacementEvent::RequestNamespaceDelete {
                node_id,
                project_identifiers,
                ..
            } => {
                for project_id in project_identifiers {
                    created.push(create_delete_task(store, *node_id, *project_id, now).await?);
                }
            }
        }
    }

    if !created.is_empty() {
        tracing::info!(events = events.len(), tasks = created.len(), "applied placement events");
    }
    Ok(created)
}
