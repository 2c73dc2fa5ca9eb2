use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const SCHEMA: &[&str] = &[
    // Catalog mirrored from the host application.
    r#"
    CREATE TABLE IF NOT EXISTS namespaces (
        id INTEGER PRIMARY KEY,
        parent_id INTEGER,
        name TEXT NOT NULL,
        repository_size INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS projects (
        id INTEGER PRIMARY KEY,
        namespace_id INTEGER NOT NULL,
        root_namespace_id INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS subscriptions (
        namespace_id INTEGER PRIMARY KEY,
        paid INTEGER NOT NULL,
        ends_on TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS nodes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uuid TEXT NOT NULL UNIQUE,
        index_base_url TEXT NOT NULL,
        search_base_url TEXT NOT NULL,
        last_seen_at INTEGER NOT NULL,
        used_bytes INTEGER NOT NULL,
        total_bytes INTEGER NOT NULL,
        metadata_json TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS enabled_namespaces (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        root_namespace_id INTEGER NOT NULL UNIQUE,
        search INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS replicas (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        enabled_namespace_id INTEGER NOT NULL,
        namespace_id INTEGER NOT NULL,
        state TEXT NOT NULL DEFAULT 'pending'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS indices (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        enabled_namespace_id INTEGER NOT NULL,
        replica_id INTEGER,
        node_id INTEGER NOT NULL,
        namespace_id INTEGER NOT NULL,
        state TEXT NOT NULL DEFAULT 'pending',
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS repositories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        index_id INTEGER NOT NULL,
        project_id INTEGER,
        project_identifier INTEGER NOT NULL,
        state TEXT NOT NULL DEFAULT 'pending',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE(index_id, project_identifier)
    )
    "#,
    // Task log. Every task row belongs to one partition; dropping a
    // partition deletes its rows in one statement.
    r#"
    CREATE TABLE IF NOT EXISTS task_partitions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        opened_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        partition_id INTEGER NOT NULL,
        repository_id INTEGER,
        node_id INTEGER NOT NULL,
        project_identifier INTEGER NOT NULL,
        task_type TEXT NOT NULL,
        state TEXT NOT NULL DEFAULT 'pending',
        perform_at INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        claim_token TEXT,
        claim_expires_at INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_projects_root ON projects(root_namespace_id)",
    "CREATE INDEX IF NOT EXISTS idx_indices_node ON indices(node_id)",
    "CREATE INDEX IF NOT EXISTS idx_indices_enabled ON indices(enabled_namespace_id)",
    "CREATE INDEX IF NOT EXISTS idx_repositories_project ON repositories(project_id)",
    "CREATE INDEX IF NOT EXISTS idx_repositories_state ON repositories(index_id, state)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_dispatch ON tasks(node_id, state, perform_at, id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_partition ON tasks(partition_id, state)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_repository ON tasks(repository_id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(claim_token)",
];

/// Create every table and index. Idempotent.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    tracing::debug!(path = %config.db.path.display(), "schema applied");
    pool.close().await;
    Ok(())
}
