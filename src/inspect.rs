//! Read-only views over the coordinator database: `fleet nodes`,
//! `fleet indices`, `fleet partitions` and `fleet tasks`.

use anyhow::Result;
use chrono::{DateTime, Utc};

use fleet_coordinator_core::models::PartitionId;
use fleet_coordinator_core::nodes::is_online;
use fleet_coordinator_core::store::Store;

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

pub async fn run_nodes(config: &Config) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let nodes = store.list_nodes().await?;
    let now = Utc::now();

    if nodes.is_empty() {
        println!("No nodes have checked in.");
    } else {
        println!(
            "{:<6} {:<20} {:<38} {:>10} {:>10} {:>6}  {:<7} {}",
            "ID", "NAME", "UUID", "USED", "TOTAL", "RATIO", "STATUS", "LAST SEEN"
        );
        for node in &nodes {
            println!(
                "{:<6} {:<20} {:<38} {:>10} {:>10} {:>5.1}%  {:<7} {}",
                node.id.unwrap_or_default(),
                node.metadata.name,
                node.uuid,
                format_bytes(node.used_bytes),
                format_bytes(node.total_bytes),
                node.storage_ratio() * 100.0,
                if is_online(node, now) { "online" } else { "offline" },
                format_ts(node.last_seen_at)
            );
        }
    }

    store.pool().close().await;
    Ok(())
}

pub async fn run_indices(config: &Config) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let indices = store.list_indices().await?;

    if indices.is_empty() {
        println!("No indices.");
    } else {
        println!(
            "{:<6} {:<10} {:<6} {:<13} {:>8} {}",
            "ID", "NAMESPACE", "NODE", "STATE", "PENDING", "CREATED"
        );
        for index in &indices {
            let pending = store.non_ready_repositories(index.id).await?.len();
            println!(
                "{:<6} {:<10} {:<6} {:<13} {:>8} {}",
                index.id,
                index.namespace_id,
                index.node_id,
                index.state,
                pending,
                format_ts(index.created_at)
            );
        }
    }

    store.pool().close().await;
    Ok(())
}

pub async fn run_partitions(config: &Config) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let partitions = store.partitions().await?;

    if partitions.is_empty() {
        println!("Task log is empty.");
    } else {
        println!("{:<6} {:<17} {:>8}", "ID", "OPENED", "PENDING");
        for partition in &partitions {
            println!(
                "{:<6} {:<17} {:>8}",
                partition.id,
                format_ts(partition.opened_at),
                store.pending_count(partition.id).await?
            );
        }
    }

    store.pool().close().await;
    Ok(())
}

pub async fn run_tasks(config: &Config, partition_id: PartitionId) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let tasks = store.tasks_for_partition(partition_id).await?;

    if tasks.is_empty() {
        println!("No tasks in partition {}.", partition_id);
    } else {
        println!(
            "{:<8} {:<17} {:<9} {:<6} {:<8} {:<11} {}",
            "ID", "TYPE", "STATE", "NODE", "PROJECT", "REPOSITORY", "PERFORM AT"
        );
        for task in &tasks {
            println!(
                "{:<8} {:<17} {:<9} {:<6} {:<8} {:<11} {}",
                task.id,
                task.task_type,
                task.state,
                task.node_id,
                task.project_identifier,
                task.repository_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                format_ts(task.perform_at)
            );
        }
    }

    store.pool().close().await;
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M").to_string()
}
