//! Repository tracker: per `(index, project)` indexing state.
//!
//! Repositories only move `pending → ready`. A hard re-index is a new
//! `force_index_repo` task, never a state rewind. [`create_tasks`] is the
//! single entry point through which indexing work enters the task log.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::error::CoordinatorError;
use crate::models::{
    Index, IndexId, NewRepository, NewTask, NodeId, Project, ProjectId, Repository, RepositoryId,
    RepositoryState, Task, TaskType,
};
use crate::store::Store;

fn check_namespace(project: &Project, index: &Index) -> Result<()> {
    if project.root_namespace_id != index.namespace_id {
        return Err(CoordinatorError::NamespaceMismatch {
            expected: index.namespace_id,
            actual: project.root_namespace_id,
        }
        .into());
    }
    Ok(())
}

fn new_repository(project: &Project, index: &Index, now: DateTime<Utc>) -> NewRepository {
    NewRepository {
        index_id: index.id,
        project_id: Some(project.id),
        project_identifier: project.id,
        created_at: now,
    }
}

/// Find-or-create the repository for `(project, index)`.
///
/// Insert first; if the composite unique constraint fires, the row that won
/// the race is read back and returned.
pub async fn ensure_repository<S: Store + ?Sized>(
    store: &S,
    project: &Project,
    index: &Index,
    now: DateTime<Utc>,
) -> Result<Repository> {
    check_namespace(project, index)?;

    match store.insert_repository(&new_repository(project, index, now)).await {
        Ok(repository) => Ok(repository),
        Err(err) if matches!(
            CoordinatorError::find(&err),
            Some(CoordinatorError::DuplicateRepository { .. })
        ) =>
        {
            store
                .find_repository(index.id, project.id)
                .await?
                .with_context(|| {
                    format!(
                        "repository for project {} in index {} vanished after a duplicate insert",
                        project.id, index.id
                    )
                })
        }
        Err(err) => Err(err),
    }
}

/// Ensure the repository exists and append one task for it on the index's
/// node, as one atomic store operation.
pub async fn create_tasks<S: Store + ?Sized>(
    store: &S,
    project: &Project,
    index: &Index,
    task_type: TaskType,
    perform_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(Repository, Task)> {
    check_namespace(project, index)?;

    let task = NewTask {
        repository_id: None,
        node_id: index.node_id,
        project_identifier: project.id,
        task_type,
        perform_at,
        created_at: now,
    };
    let (repository, task) = store
        .insert_repository_task(&new_repository(project, index, now), &task)
        .await?;

    tracing::debug!(
        task_id = task.id,
        repository_id = repository.id,
        index_id = index.id,
        node_id = index.node_id,
        task_type = %task_type,
        "task created"
    );
    Ok((repository, task))
}

/// Queue work for a project on every index of its root namespace.
///
/// This is the trigger for repository-change events and operator re-index
/// requests. A project whose namespace is not enabled yields no tasks.
pub async fn index_project<S: Store + ?Sized>(
    store: &S,
    project_id: ProjectId,
    task_type: TaskType,
    perform_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Vec<Task>> {
    let project = store
        .get_project(project_id)
        .await?
        .ok_or_else(|| CoordinatorError::not_found("project", project_id))?;
    let Some(enabled) = store.find_enabled_namespace(project.root_namespace_id).await? else {
        tracing::debug!(
            project_id,
            root_namespace_id = project.root_namespace_id,
            "namespace not enabled; nothing to index"
        );
        return Ok(Vec::new());
    };

    let mut tasks = Vec::new();
    for index in store.indices_for_enabled_namespace(enabled.id).await? {
        let (_, task) = create_tasks(store, &project, &index, task_type, perform_at, now).await?;
        tasks.push(task);
    }
    Ok(tasks)
}

/// Append a `delete_repo` task that is not tied to a tracked repository,
/// used when the owning index is already gone.
pub async fn create_delete_task<S: Store + ?Sized>(
    store: &S,
    node_id: NodeId,
    project_identifier: ProjectId,
    now: DateTime<Utc>,
) -> Result<Task> {
    store
        .insert_task(&NewTask {
            repository_id: None,
            node_id,
            project_identifier,
            task_type: TaskType::DeleteRepo,
            perform_at: now,
            created_at: now,
        })
        .await
}

/// Repositories under an index whose state is not `ready`.
pub async fn non_ready<S: Store + ?Sized>(store: &S, index_id: IndexId) -> Result<Vec<Repository>> {
    store.non_ready_repositories(index_id).await
}

/// Confirm that a node finished indexing a repository.
pub async fn mark_repository_ready<S: Store + ?Sized>(
    store: &S,
    id: RepositoryId,
    now: DateTime<Utc>,
) -> Result<bool> {
    store
        .set_repository_state(id, RepositoryState::Ready, now)
        .await
}
