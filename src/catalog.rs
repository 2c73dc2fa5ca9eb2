//! Catalog import.
//!
//! Namespaces, projects and subscriptions belong to the host application.
//! The coordinator keeps a mirror that `fleet catalog load <file>` refreshes
//! from a JSON snapshot:
//!
//! ```json
//! {
//!   "namespaces": [{ "id": 1, "parent_id": null, "name": "acme", "repository_size": 4096 }],
//!   "projects": [{ "id": 10, "namespace_id": 1, "root_namespace_id": 1 }],
//!   "subscriptions": [{ "namespace_id": 1, "paid": true, "ends_on": "2025-01-31" }],
//!   "deleted_projects": [7]
//! }
//! ```
//!
//! Every section is optional. Records are upserted by id.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use fleet_coordinator_core::error::CoordinatorError;
use fleet_coordinator_core::models::{Namespace, Project, ProjectId, Subscription};
use fleet_coordinator_core::store::Store;

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

#[derive(Debug, Default, Deserialize)]
pub struct CatalogSnapshot {
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    #[serde(default)]
    pub deleted_projects: Vec<ProjectId>,
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct CatalogReport {
    pub namespaces: usize,
    pub projects: usize,
    pub subscriptions: usize,
    pub deleted_projects: usize,
}

pub fn read_snapshot(path: &Path) -> Result<CatalogSnapshot> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read catalog file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse catalog file: {}", path.display()))
}

/// Upsert a snapshot into the store. Namespaces go first so that project
/// root references can be checked against them.
pub async fn apply_snapshot<S: Store + ?Sized>(
    store: &S,
    snapshot: &CatalogSnapshot,
) -> Result<CatalogReport> {
    let mut report = CatalogReport::default();

    for namespace in &snapshot.namespaces {
        store.upsert_namespace(namespace).await?;
        report.namespaces += 1;
    }

    for project in &snapshot.projects {
        if let Some(root) = store.get_namespace(project.root_namespace_id).await? {
            if !root.is_root() {
                return Err(CoordinatorError::InvalidNamespace(root.id))
                    .with_context(|| format!("project {} has a non-root root namespace", project.id));
            }
        }
        store.upsert_project(project).await?;
        report.projects += 1;
    }

    for subscription in &snapshot.subscriptions {
        store.upsert_subscription(subscription).await?;
        report.subscriptions += 1;
    }

    for id in &snapshot.deleted_projects {
        if store.delete_project(*id).await? {
            report.deleted_projects += 1;
        }
    }

    tracing::info!(
        namespaces = report.namespaces,
        projects = report.projects,
        subscriptions = report.subscriptions,
        deleted_projects = report.deleted_projects,
        "catalog applied"
    );
    Ok(report)
}

/// `fleet catalog load <file>`
pub async fn run_load(config: &Config, path: &Path) -> Result<()> {
    let snapshot = read_snapshot(path)?;
    let store = SqliteStore::open(config).await?;
    let report = apply_snapshot(&store, &snapshot).await?;
    println!(
        "Loaded catalog: {} namespaces, {} projects, {} subscriptions, {} projects deleted",
        report.namespaces, report.projects, report.subscriptions, report.deleted_projects
    );
    store.pool().close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_coordinator_core::store::memory::InMemoryStore;

    #[tokio::test]
    async fn test_snapshot_upserts_and_deletes() {
        let store = InMemoryStore::new();
        let snapshot: CatalogSnapshot = serde_json::from_str(
            r#"{
                "namespaces": [
                    {"id": 1, "name": "acme", "repository_size": 4096},
                    {"id": 2, "parent_id": 1, "name": "acme/team"}
                ],
                "projects": [
                    {"id": 10, "namespace_id": 2, "root_namespace_id": 1},
                    {"id": 11, "namespace_id": 1, "root_namespace_id": 1}
                ],
                "subscriptions": [{"namespace_id": 1, "paid": true, "ends_on": "2025-01-31"}],
                "deleted_projects": [11, 99]
            }"#,
        )
        .unwrap();

        let report = apply_snapshot(&store, &snapshot).await.unwrap();
        assert_eq!(
            report,
            CatalogReport {
                namespaces: 2,
                projects: 2,
                subscriptions: 1,
                deleted_projects: 1,
            }
        );
        assert_eq!(store.get_namespace(1).await.unwrap().unwrap().repository_size, 4096);
        assert!(store.get_project(11).await.unwrap().is_none());
        assert_eq!(store.project_ids_for_root_namespace(1).await.unwrap(), vec![10]);
    }

    #[tokio::test]
    async fn test_project_under_non_root_is_rejected() {
        let store = InMemoryStore::new();
        let snapshot: CatalogSnapshot = serde_json::from_str(
            r#"{
                "namespaces": [{"id": 1, "name": "acme"}, {"id": 2, "parent_id": 1, "name": "sub"}],
                "projects": [{"id": 10, "namespace_id": 2, "root_namespace_id": 2}]
            }"#,
        )
        .unwrap();

        let err = apply_snapshot(&store, &snapshot).await.unwrap_err();
        assert_eq!(
            CoordinatorError::find(&err),
            Some(&CoordinatorError::InvalidNamespace(2))
        );
        assert!(store.get_project(10).await.unwrap().is_none());
    }
}
