//! Operator commands that change placement or queue work.
//!
//! Each command applies the placement events it produces right away, so
//! the resulting tasks are in the log before the command returns.

use anyhow::Result;
use chrono::Utc;
use uuid::Uuid;

use fleet_coordinator_core::error::CoordinatorError;
use fleet_coordinator_core::events::apply_events;
use fleet_coordinator_core::models::{IndexId, NamespaceId, ProjectId, TaskType};
use fleet_coordinator_core::placement::{
    assign_index, enable_namespace, remove_enabled_namespace, remove_index, set_search,
    PlacementEvent,
};
use fleet_coordinator_core::repositories::index_project;
use fleet_coordinator_core::store::Store;

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

async fn apply_and_report(store: &SqliteStore, events: &[PlacementEvent]) -> Result<()> {
    let tasks = apply_events(store, events, Utc::now()).await?;
    for event in events {
        println!("  event: {}", serde_json::to_string(event)?);
    }
    println!("  tasks queued: {}", tasks.len());
    Ok(())
}

pub async fn run_enable(config: &Config, root_namespace_id: NamespaceId, search: bool) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let enabled = enable_namespace(&store, root_namespace_id, search, Utc::now()).await?;
    println!(
        "Enabled namespace {} (id {}, search {})",
        enabled.root_namespace_id,
        enabled.id,
        if enabled.search { "on" } else { "off" }
    );
    store.pool().close().await;
    Ok(())
}

pub async fn run_disable(config: &Config, root_namespace_id: NamespaceId) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let enabled = store
        .find_enabled_namespace(root_namespace_id)
        .await?
        .ok_or_else(|| CoordinatorError::not_found("enabled namespace", root_namespace_id))?;
    let events = remove_enabled_namespace(&store, &enabled).await?;
    println!("Disabled namespace {}", root_namespace_id);
    apply_and_report(&store, &events).await?;
    store.pool().close().await;
    Ok(())
}

pub async fn run_set_search(config: &Config, root_namespace_id: NamespaceId, on: bool) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    set_search(&store, root_namespace_id, on, Utc::now()).await?;
    println!(
        "Search {} for namespace {}",
        if on { "enabled" } else { "disabled" },
        root_namespace_id
    );
    store.pool().close().await;
    Ok(())
}

pub async fn run_assign(config: &Config, root_namespace_id: NamespaceId, node_uuid: &str) -> Result<()> {
    let uuid = Uuid::parse_str(node_uuid)
        .map_err(|e| CoordinatorError::Validation(format!("invalid node uuid '{}': {}", node_uuid, e)))?;
    let store = SqliteStore::open(config).await?;
    let enabled = store
        .find_enabled_namespace(root_namespace_id)
        .await?
        .ok_or_else(|| CoordinatorError::not_found("enabled namespace", root_namespace_id))?;
    let node = store
        .find_node_by_uuid(&uuid)
        .await?
        .ok_or_else(|| CoordinatorError::not_found("node", uuid))?;

    let (index, events) = assign_index(&store, &enabled, &node, Utc::now()).await?;
    println!(
        "Assigned namespace {} to node {} (index {})",
        root_namespace_id, node.metadata.name, index.id
    );
    apply_and_report(&store, &events).await?;
    store.pool().close().await;
    Ok(())
}

pub async fn run_remove_index(config: &Config, index_id: IndexId) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let index = store
        .get_index(index_id)
        .await?
        .ok_or_else(|| CoordinatorError::not_found("index", index_id))?;
    let events = remove_index(&store, &index).await?;
    println!("Removed index {} from node {}", index.id, index.node_id);
    apply_and_report(&store, &events).await?;
    store.pool().close().await;
    Ok(())
}

pub async fn run_reindex(config: &Config, project_id: ProjectId, force: bool) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let task_type = if force {
        TaskType::ForceIndexRepo
    } else {
        TaskType::IndexRepo
    };
    let now = Utc::now();
    let tasks = index_project(&store, project_id, task_type, now, now).await?;

    if tasks.is_empty() {
        println!("Project {} has no indices; nothing queued.", project_id);
    } else {
        for task in &tasks {
            println!("  task {} ({}) -> node {}", task.id, task.task_type, task.node_id);
        }
        println!("Queued {} {} task(s).", tasks.len(), task_type);
    }
    store.pool().close().await;
    Ok(())
}
