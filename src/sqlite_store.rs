//! SQLite-backed [`Store`] implementation.
//!
//! Every operation the coordinator needs to be race-free maps to either one
//! conditional statement (`ON CONFLICT`, `UPDATE ... WHERE state = 'pending'`,
//! `RETURNING`) or a short transaction whose first statement is a write, so
//! a WAL reader never has to upgrade to a writer mid-transaction.
//!
//! Timestamps are stored as unix milliseconds; byte counters as `INTEGER`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use fleet_coordinator_core::error::CoordinatorError;
use fleet_coordinator_core::models::{
    Claim, EnabledNamespace, EnabledNamespaceId, Index, IndexId, IndexState, Namespace,
    NamespaceId, NewIndex, NewRepository, NewTask, Node, NodeId, NodeMetadata, Partition,
    PartitionId, Project, ProjectId, RemovedIndex, Replica, ReplicaState, Repository, RepositoryId,
    RepositoryState, Subscription, Task, TaskCursor, TaskId, TaskState,
};
use fleet_coordinator_core::store::Store;

use crate::config::Config;
use crate::db;
use crate::migrate::apply_schema;

const NODE_COLUMNS: &str =
    "id, uuid, index_base_url, search_base_url, last_seen_at, used_bytes, total_bytes, metadata_json";
const ENABLED_COLUMNS: &str = "id, root_namespace_id, search, created_at, updated_at";
const INDEX_COLUMNS: &str =
    "id, enabled_namespace_id, replica_id, node_id, namespace_id, state, created_at";
const REPOSITORY_COLUMNS: &str =
    "id, index_id, project_id, project_identifier, state, created_at, updated_at";
const TASK_COLUMNS: &str = "id, partition_id, repository_id, node_id, project_identifier, \
     task_type, state, perform_at, created_at, claim_token, claim_expires_at";

/// Upper bound on bound parameters per `IN (...)` list.
const IN_CHUNK: usize = 500;

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database and make sure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        apply_schema(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ============ Encoding helpers ============

fn ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_ms(value: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(value)
        .with_context(|| format!("timestamp out of range: {}", value))
}

/// The value a timestamp has after a round trip through the database.
fn stored(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms(ts)).unwrap_or(ts)
}

fn to_db(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

fn from_db(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

// ============ Row mapping ============

fn namespace_from_row(row: &SqliteRow) -> Result<Namespace> {
    Ok(Namespace {
        id: row.try_get("id")?,
        parent_id: row.try_get("parent_id")?,
        name: row.try_get("name")?,
        repository_size: from_db(row.try_get("repository_size")?),
    })
}

fn project_from_row(row: &SqliteRow) -> Result<Project> {
    Ok(Project {
        id: row.try_get("id")?,
        namespace_id: row.try_get("namespace_id")?,
        root_namespace_id: row.try_get("root_namespace_id")?,
    })
}

fn subscription_from_row(row: &SqliteRow) -> Result<Subscription> {
    let ends_on: Option<String> = row.try_get("ends_on")?;
    let ends_on = ends_on
        .map(|s| s.parse::<NaiveDate>().with_context(|| format!("invalid ends_on '{}'", s)))
        .transpose()?;
    Ok(Subscription {
        namespace_id: row.try_get("namespace_id")?,
        paid: row.try_get("paid")?,
        ends_on,
    })
}

fn node_from_row(row: &SqliteRow) -> Result<Node> {
    let uuid: String = row.try_get("uuid")?;
    let metadata: String = row.try_get("metadata_json")?;
    Ok(Node {
        id: Some(row.try_get("id")?),
        uuid: Uuid::parse_str(&uuid).with_context(|| format!("invalid node uuid '{}'", uuid))?,
        index_base_url: row.try_get("index_base_url")?,
        search_base_url: row.try_get("search_base_url")?,
        last_seen_at: from_ms(row.try_get("last_seen_at")?)?,
        used_bytes: from_db(row.try_get("used_bytes")?),
        total_bytes: from_db(row.try_get("total_bytes")?),
        metadata: serde_json::from_str::<NodeMetadata>(&metadata)
            .with_context(|| format!("invalid metadata for node {}", uuid))?,
    })
}

fn enabled_from_row(row: &SqliteRow) -> Result<EnabledNamespace> {
    Ok(EnabledNamespace {
        id: row.try_get("id")?,
        root_namespace_id: row.try_get("root_namespace_id")?,
        search: row.try_get("search")?,
        created_at: from_ms(row.try_get("created_at")?)?,
        updated_at: from_ms(row.try_get("updated_at")?)?,
    })
}

fn replica_from_row(row: &SqliteRow) -> Result<Replica> {
    Ok(Replica {
        id: row.try_get("id")?,
        enabled_namespace_id: row.try_get("enabled_namespace_id")?,
        namespace_id: row.try_get("namespace_id")?,
        state: row.try_get::<String, _>("state")?.parse::<ReplicaState>()?,
    })
}

fn index_from_row(row: &SqliteRow) -> Result<Index> {
    Ok(Index {
        id: row.try_get("id")?,
        enabled_namespace_id: row.try_get("enabled_namespace_id")?,
        replica_id: row.try_get("replica_id")?,
        node_id: row.try_get("node_id")?,
        namespace_id: row.try_get("namespace_id")?,
        state: row.try_get::<String, _>("state")?.parse::<IndexState>()?,
        created_at: from_ms(row.try_get("created_at")?)?,
    })
}

fn repository_from_row(row: &SqliteRow) -> Result<Repository> {
    Ok(Repository {
        id: row.try_get("id")?,
        index_id: row.try_get("index_id")?,
        project_id: row.try_get("project_id")?,
        project_identifier: row.try_get("project_identifier")?,
        state: row.try_get::<String, _>("state")?.parse::<RepositoryState>()?,
        created_at: from_ms(row.try_get("created_at")?)?,
        updated_at: from_ms(row.try_get("updated_at")?)?,
    })
}

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let token: Option<String> = row.try_get("claim_token")?;
    let expires_at: Option<i64> = row.try_get("claim_expires_at")?;
    let claim = match (token, expires_at) {
        (Some(token), Some(expires_at)) => Some(Claim {
            token: Uuid::parse_str(&token)
                .with_context(|| format!("invalid claim token '{}'", token))?,
            expires_at: from_ms(expires_at)?,
        }),
        _ => None,
    };
    Ok(Task {
        id: row.try_get("id")?,
        partition_id: row.try_get("partition_id")?,
        repository_id: row.try_get("repository_id")?,
        node_id: row.try_get("node_id")?,
        project_identifier: row.try_get("project_identifier")?,
        task_type: row.try_get::<String, _>("task_type")?.parse()?,
        state: row.try_get::<String, _>("state")?.parse()?,
        perform_at: from_ms(row.try_get("perform_at")?)?,
        created_at: from_ms(row.try_get("created_at")?)?,
        claim,
    })
}

fn partition_from_row(row: &SqliteRow) -> Result<Partition> {
    Ok(Partition {
        id: row.try_get("id")?,
        opened_at: from_ms(row.try_get("opened_at")?)?,
    })
}

// ============ Shared statements ============

/// Append a task to the newest partition, opening the first partition if
/// the log is empty. Both statements are writes.
async fn append_task(
    conn: &mut SqliteConnection,
    new: &NewTask,
    repository_id: Option<RepositoryId>,
) -> Result<Task> {
    sqlx::query(
        "INSERT INTO task_partitions (opened_at) SELECT ? WHERE NOT EXISTS (SELECT 1 FROM task_partitions)",
    )
    .bind(ms(new.created_at))
    .execute(&mut *conn)
    .await?;

    let row = sqlx::query(
        r#"
        INSERT INTO tasks (partition_id, repository_id, node_id, project_identifier,
                           task_type, state, perform_at, created_at)
        VALUES ((SELECT MAX(id) FROM task_partitions), ?, ?, ?, ?, 'pending', ?, ?)
        RETURNING id, partition_id
        "#,
    )
    .bind(repository_id)
    .bind(new.node_id)
    .bind(new.project_identifier)
    .bind(new.task_type.as_str())
    .bind(ms(new.perform_at))
    .bind(ms(new.created_at))
    .fetch_one(&mut *conn)
    .await?;

    Ok(Task {
        id: row.try_get("id")?,
        partition_id: row.try_get("partition_id")?,
        repository_id,
        node_id: new.node_id,
        project_identifier: new.project_identifier,
        task_type: new.task_type,
        state: TaskState::Pending,
        perform_at: stored(new.perform_at),
        created_at: stored(new.created_at),
        claim: None,
    })
}

/// Remove an index's repositories, keeping their tasks with the
/// repository reference cleared. Returns the removed project identifiers.
async fn drop_repositories(conn: &mut SqliteConnection, index: Index) -> Result<RemovedIndex> {
    sqlx::query(
        "UPDATE tasks SET repository_id = NULL WHERE repository_id IN (SELECT id FROM repositories WHERE index_id = ?)",
    )
    .bind(index.id)
    .execute(&mut *conn)
    .await?;
    let mut project_identifiers: Vec<ProjectId> =
        sqlx::query_scalar("DELETE FROM repositories WHERE index_id = ? RETURNING project_identifier")
            .bind(index.id)
            .fetch_all(&mut *conn)
            .await?;
    project_identifiers.sort_unstable();
    Ok(RemovedIndex {
        index,
        project_identifiers,
    })
}

#[async_trait]
impl Store for SqliteStore {
    // ============ Catalog ============

    async fn upsert_namespace(&self, namespace: &Namespace) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO namespaces (id, parent_id, name, repository_size)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                parent_id = excluded.parent_id,
                name = excluded.name,
                repository_size = excluded.repository_size
            "#,
        )
        .bind(namespace.id)
        .bind(namespace.parent_id)
        .bind(&namespace.name)
        .bind(to_db(namespace.repository_size))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_namespace(&self, id: NamespaceId) -> Result<Option<Namespace>> {
        sqlx::query("SELECT id, parent_id, name, repository_size FROM namespaces WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(namespace_from_row)
            .transpose()
    }

    async fn upsert_project(&self, project: &Project) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO projects (id, namespace_id, root_namespace_id)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                namespace_id = excluded.namespace_id,
                root_namespace_id = excluded.root_namespace_id
            "#,
        )
        .bind(project.id)
        .bind(project.namespace_id)
        .bind(project.root_namespace_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_project(&self, id: ProjectId) -> Result<Option<Project>> {
        sqlx::query("SELECT id, namespace_id, root_namespace_id FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(project_from_row)
            .transpose()
    }

    async fn delete_project(&self, id: ProjectId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted > 0 {
            sqlx::query("UPDATE repositories SET project_id = NULL WHERE project_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(deleted > 0)
    }

    async fn existing_project_ids(&self, ids: &[ProjectId]) -> Result<Vec<ProjectId>> {
        let mut found = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(IN_CHUNK) {
            let sql = format!(
                "SELECT id FROM projects WHERE id IN ({})",
                placeholders(chunk.len())
            );
            let mut query = sqlx::query_scalar::<_, i64>(&sql);
            for id in chunk {
                query = query.bind(*id);
            }
            found.extend(query.fetch_all(&self.pool).await?);
        }
        Ok(found)
    }

    async fn project_ids_for_root_namespace(&self, root: NamespaceId) -> Result<Vec<ProjectId>> {
        Ok(
            sqlx::query_scalar("SELECT id FROM projects WHERE root_namespace_id = ? ORDER BY id")
                .bind(root)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn upsert_subscription(&self, subscription: &Subscription) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (namespace_id, paid, ends_on)
            VALUES (?, ?, ?)
            ON CONFLICT(namespace_id) DO UPDATE SET
                paid = excluded.paid,
                ends_on = excluded.ends_on
            "#,
        )
        .bind(subscription.namespace_id)
        .bind(subscription.paid)
        .bind(subscription.ends_on.map(|d| d.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn subscriptions_after(
        &self,
        after: Option<NamespaceId>,
        limit: usize,
    ) -> Result<Vec<Subscription>> {
        let rows = sqlx::query(
            "SELECT namespace_id, paid, ends_on FROM subscriptions WHERE namespace_id > ? ORDER BY namespace_id LIMIT ?",
        )
        .bind(after.unwrap_or(i64::MIN))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(subscription_from_row).collect()
    }

    // ============ Nodes ============

    async fn save_node(&self, node: &Node) -> Result<Node> {
        let metadata = serde_json::to_string(&node.metadata)?;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO nodes (uuid, index_base_url, search_base_url, last_seen_at,
                               used_bytes, total_bytes, metadata_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(uuid) DO UPDATE SET
                index_base_url = excluded.index_base_url,
                search_base_url = excluded.search_base_url,
                last_seen_at = MAX(nodes.last_seen_at, excluded.last_seen_at),
                used_bytes = excluded.used_bytes,
                total_bytes = excluded.total_bytes,
                metadata_json = excluded.metadata_json
            RETURNING id
            "#,
        )
        .bind(node.uuid.to_string())
        .bind(&node.index_base_url)
        .bind(&node.search_base_url)
        .bind(ms(node.last_seen_at))
        .bind(to_db(node.used_bytes))
        .bind(to_db(node.total_bytes))
        .bind(metadata)
        .fetch_one(&self.pool)
        .await?;

        self.get_node(id)
            .await?
            .with_context(|| format!("node {} missing after save", id))
    }

    async fn find_node_by_uuid(&self, uuid: &Uuid) -> Result<Option<Node>> {
        sqlx::query(&format!("SELECT {} FROM nodes WHERE uuid = ?", NODE_COLUMNS))
            .bind(uuid.to_string())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(node_from_row)
            .transpose()
    }

    async fn get_node(&self, id: NodeId) -> Result<Option<Node>> {
        sqlx::query(&format!("SELECT {} FROM nodes WHERE id = ?", NODE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(node_from_row)
            .transpose()
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let rows = sqlx::query(&format!("SELECT {} FROM nodes ORDER BY id", NODE_COLUMNS))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(node_from_row).collect()
    }

    // ============ Placement ============

    async fn create_enabled_namespace(
        &self,
        root_namespace_id: NamespaceId,
        search: bool,
        now: DateTime<Utc>,
    ) -> Result<EnabledNamespace> {
        sqlx::query(
            r#"
            INSERT INTO enabled_namespaces (root_namespace_id, search, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(root_namespace_id) DO NOTHING
            "#,
        )
        .bind(root_namespace_id)
        .bind(search)
        .bind(ms(now))
        .bind(ms(now))
        .execute(&self.pool)
        .await?;

        self.find_enabled_namespace(root_namespace_id)
            .await?
            .with_context(|| format!("enabled namespace {} missing after insert", root_namespace_id))
    }

    async fn get_enabled_namespace(
        &self,
        id: EnabledNamespaceId,
    ) -> Result<Option<EnabledNamespace>> {
        sqlx::query(&format!(
            "SELECT {} FROM enabled_namespaces WHERE id = ?",
            ENABLED_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(enabled_from_row)
        .transpose()
    }

    async fn find_enabled_namespace(
        &self,
        root_namespace_id: NamespaceId,
    ) -> Result<Option<EnabledNamespace>> {
        sqlx::query(&format!(
            "SELECT {} FROM enabled_namespaces WHERE root_namespace_id = ?",
            ENABLED_COLUMNS
        ))
        .bind(root_namespace_id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(enabled_from_row)
        .transpose()
    }

    async fn list_enabled_namespaces(&self) -> Result<Vec<EnabledNamespace>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM enabled_namespaces ORDER BY id",
            ENABLED_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(enabled_from_row).collect()
    }

    async fn set_namespace_search(
        &self,
        id: EnabledNamespaceId,
        search: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE enabled_namespaces SET search = ?, updated_at = ? WHERE id = ?",
        )
        .bind(search)
        .bind(ms(now))
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(CoordinatorError::not_found("enabled namespace", id).into());
        }
        Ok(())
    }

    async fn delete_enabled_namespace(&self, id: EnabledNamespaceId) -> Result<Vec<RemovedIndex>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(&format!(
            "DELETE FROM indices WHERE enabled_namespace_id = ? RETURNING {}",
            INDEX_COLUMNS
        ))
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;
        let indices = rows.iter().map(index_from_row).collect::<Result<Vec<_>>>()?;

        let mut removed = Vec::with_capacity(indices.len());
        for index in indices {
            removed.push(drop_repositories(&mut tx, index).await?);
        }
        sqlx::query("DELETE FROM replicas WHERE enabled_namespace_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM enabled_namespaces WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed)
    }

    async fn create_replica(
        &self,
        enabled_namespace_id: EnabledNamespaceId,
        namespace_id: NamespaceId,
    ) -> Result<Replica> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO replicas (enabled_namespace_id, namespace_id, state) VALUES (?, ?, 'pending') RETURNING id",
        )
        .bind(enabled_namespace_id)
        .bind(namespace_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(Replica {
            id,
            enabled_namespace_id,
            namespace_id,
            state: ReplicaState::Pending,
        })
    }

    async fn replicas_for_namespace(
        &self,
        enabled_namespace_id: EnabledNamespaceId,
    ) -> Result<Vec<Replica>> {
        let rows = sqlx::query(
            "SELECT id, enabled_namespace_id, namespace_id, state FROM replicas WHERE enabled_namespace_id = ? ORDER BY id",
        )
        .bind(enabled_namespace_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(replica_from_row).collect()
    }

    async fn insert_index(&self, new: &NewIndex) -> Result<Index> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO indices (enabled_namespace_id, replica_id, node_id, namespace_id, state, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(new.enabled_namespace_id)
        .bind(new.replica_id)
        .bind(new.node_id)
        .bind(new.namespace_id)
        .bind(new.state.as_str())
        .bind(ms(new.created_at))
        .fetch_one(&self.pool)
        .await?;
        Ok(Index {
            id,
            enabled_namespace_id: new.enabled_namespace_id,
            replica_id: new.replica_id,
            node_id: new.node_id,
            namespace_id: new.namespace_id,
            state: new.state,
            created_at: stored(new.created_at),
        })
    }

    async fn get_index(&self, id: IndexId) -> Result<Option<Index>> {
        sqlx::query(&format!("SELECT {} FROM indices WHERE id = ?", INDEX_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(index_from_row)
            .transpose()
    }

    async fn list_indices(&self) -> Result<Vec<Index>> {
        let rows = sqlx::query(&format!("SELECT {} FROM indices ORDER BY id", INDEX_COLUMNS))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(index_from_row).collect()
    }

    async fn indices_for_enabled_namespace(&self, id: EnabledNamespaceId) -> Result<Vec<Index>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM indices WHERE enabled_namespace_id = ? ORDER BY id",
            INDEX_COLUMNS
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(index_from_row).collect()
    }

    async fn set_index_state(&self, id: IndexId, state: IndexState) -> Result<()> {
        let updated = sqlx::query("UPDATE indices SET state = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(CoordinatorError::not_found("index", id).into());
        }
        Ok(())
    }

    async fn delete_index(&self, id: IndexId) -> Result<Option<RemovedIndex>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "DELETE FROM indices WHERE id = ? RETURNING {}",
            INDEX_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let removed = drop_repositories(&mut tx, index_from_row(&row)?).await?;
        tx.commit().await?;
        Ok(Some(removed))
    }

    // ============ Repositories ============

    async fn insert_repository(&self, new: &NewRepository) -> Result<Repository> {
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO repositories (index_id, project_id, project_identifier, state, created_at, updated_at)
            VALUES (?, ?, ?, 'pending', ?, ?)
            ON CONFLICT(index_id, project_identifier) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(new.index_id)
        .bind(new.project_id)
        .bind(new.project_identifier)
        .bind(ms(new.created_at))
        .bind(ms(new.created_at))
        .fetch_optional(&self.pool)
        .await?;

        let id = id.ok_or(CoordinatorError::DuplicateRepository {
            index_id: new.index_id,
            project_identifier: new.project_identifier,
        })?;
        Ok(Repository {
            id,
            index_id: new.index_id,
            project_id: new.project_id,
            project_identifier: new.project_identifier,
            state: RepositoryState::Pending,
            created_at: stored(new.created_at),
            updated_at: stored(new.created_at),
        })
    }

    async fn insert_repository_task(
        &self,
        repository: &NewRepository,
        task: &NewTask,
    ) -> Result<(Repository, Task)> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO repositories (index_id, project_id, project_identifier, state, created_at, updated_at)
            VALUES (?, ?, ?, 'pending', ?, ?)
            ON CONFLICT(index_id, project_identifier) DO NOTHING
            "#,
        )
        .bind(repository.index_id)
        .bind(repository.project_id)
        .bind(repository.project_identifier)
        .bind(ms(repository.created_at))
        .bind(ms(repository.created_at))
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM repositories WHERE index_id = ? AND project_identifier = ?",
            REPOSITORY_COLUMNS
        ))
        .bind(repository.index_id)
        .bind(repository.project_identifier)
        .fetch_one(&mut *tx)
        .await?;
        let repository = repository_from_row(&row)?;

        let task = append_task(&mut tx, task, Some(repository.id)).await?;
        tx.commit().await?;
        Ok((repository, task))
    }

    async fn find_repository(
        &self,
        index_id: IndexId,
        project_identifier: ProjectId,
    ) -> Result<Option<Repository>> {
        sqlx::query(&format!(
            "SELECT {} FROM repositories WHERE index_id = ? AND project_identifier = ?",
            REPOSITORY_COLUMNS
        ))
        .bind(index_id)
        .bind(project_identifier)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(repository_from_row)
        .transpose()
    }

    async fn get_repository(&self, id: RepositoryId) -> Result<Option<Repository>> {
        sqlx::query(&format!(
            "SELECT {} FROM repositories WHERE id = ?",
            REPOSITORY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(repository_from_row)
        .transpose()
    }

    async fn get_repositories(&self, ids: &[RepositoryId]) -> Result<Vec<Repository>> {
        let mut found = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(IN_CHUNK) {
            let sql = format!(
                "SELECT {} FROM repositories WHERE id IN ({})",
                REPOSITORY_COLUMNS,
                placeholders(chunk.len())
            );
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(*id);
            }
            for row in query.fetch_all(&self.pool).await? {
                found.push(repository_from_row(&row)?);
            }
        }
        Ok(found)
    }

    async fn repositories_for_index(&self, index_id: IndexId) -> Result<Vec<Repository>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM repositories WHERE index_id = ? ORDER BY id",
            REPOSITORY_COLUMNS
        ))
        .bind(index_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(repository_from_row).collect()
    }

    async fn non_ready_repositories(&self, index_id: IndexId) -> Result<Vec<Repository>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM repositories WHERE index_id = ? AND state != 'ready' ORDER BY id",
            REPOSITORY_COLUMNS
        ))
        .bind(index_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(repository_from_row).collect()
    }

    async fn set_repository_state(
        &self,
        id: RepositoryId,
        state: RepositoryState,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = sqlx::query("UPDATE repositories SET state = ?, updated_at = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(ms(now))
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated > 0)
    }

    // ============ Task log ============

    async fn partitions(&self) -> Result<Vec<Partition>> {
        let rows = sqlx::query("SELECT id, opened_at FROM task_partitions ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(partition_from_row).collect()
    }

    async fn open_partition(
        &self,
        after: Option<PartitionId>,
        now: DateTime<Utc>,
    ) -> Result<Partition> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO task_partitions (opened_at) SELECT ? WHERE (SELECT MAX(id) FROM task_partitions) IS ?",
        )
        .bind(ms(now))
        .bind(after)
        .execute(&mut *tx)
        .await?;
        let row = sqlx::query("SELECT id, opened_at FROM task_partitions ORDER BY id DESC LIMIT 1")
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        partition_from_row(&row)
    }

    async fn detach_partition(&self, id: PartitionId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let dropped = sqlx::query(
            r#"
            DELETE FROM task_partitions
            WHERE id = ?
              AND id < (SELECT MAX(id) FROM task_partitions)
              AND NOT EXISTS (SELECT 1 FROM tasks WHERE partition_id = ? AND state = 'pending')
            "#,
        )
        .bind(id)
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if dropped > 0 {
            sqlx::query("DELETE FROM tasks WHERE partition_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(dropped > 0)
    }

    async fn insert_task(&self, task: &NewTask) -> Result<Task> {
        let mut tx = self.pool.begin().await?;
        let task = append_task(&mut tx, task, task.repository_id).await?;
        tx.commit().await?;
        Ok(task)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        sqlx::query(&format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(task_from_row)
            .transpose()
    }

    async fn oldest_task(&self, partition_id: PartitionId) -> Result<Option<Task>> {
        sqlx::query(&format!(
            "SELECT {} FROM tasks WHERE partition_id = ? ORDER BY created_at, id LIMIT 1",
            TASK_COLUMNS
        ))
        .bind(partition_id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(task_from_row)
        .transpose()
    }

    async fn tasks_for_partition(&self, partition_id: PartitionId) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tasks WHERE partition_id = ? ORDER BY id",
            TASK_COLUMNS
        ))
        .bind(partition_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn pending_count(&self, partition_id: PartitionId) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tasks WHERE partition_id = ? AND state = 'pending'",
        )
        .bind(partition_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn pending_tasks_after(
        &self,
        node_id: NodeId,
        after: Option<TaskCursor>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>> {
        let (after_at, after_id) = after
            .map(|c| (ms(c.perform_at), c.id))
            .unwrap_or((i64::MIN, i64::MIN));
        // One keyset over all live partitions; detached ones drop out.
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM tasks
            WHERE node_id = ?
              AND partition_id IN (SELECT id FROM task_partitions)
              AND state = 'pending'
              AND perform_at <= ?
              AND (claim_token IS NULL OR claim_expires_at <= ?)
              AND (perform_at > ? OR (perform_at = ? AND id > ?))
            ORDER BY perform_at ASC, id ASC
            LIMIT ?
            "#,
            TASK_COLUMNS
        ))
        .bind(node_id)
        .bind(ms(now))
        .bind(ms(now))
        .bind(after_at)
        .bind(after_at)
        .bind(after_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn claim_tasks(
        &self,
        ids: &[TaskId],
        claim: &Claim,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>> {
        let mut claimed = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(IN_CHUNK) {
            let sql = format!(
                r#"
                UPDATE tasks SET claim_token = ?, claim_expires_at = ?
                WHERE id IN ({})
                  AND state = 'pending'
                  AND (claim_token IS NULL OR claim_expires_at <= ?)
                RETURNING id
                "#,
                placeholders(chunk.len())
            );
            let mut query = sqlx::query_scalar::<_, i64>(&sql)
                .bind(claim.token.to_string())
                .bind(ms(claim.expires_at));
            for id in chunk {
                query = query.bind(*id);
            }
            query = query.bind(ms(now));
            claimed.extend(query.fetch_all(&self.pool).await?);
        }
        Ok(claimed)
    }

    async fn release_claim(&self, token: &Uuid) -> Result<usize> {
        let released = sqlx::query(
            "UPDATE tasks SET claim_token = NULL, claim_expires_at = NULL WHERE claim_token = ?",
        )
        .bind(token.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(released as usize)
    }

    async fn mark_tasks_orphaned(&self, ids: &[TaskId]) -> Result<usize> {
        let mut count = 0;
        for chunk in ids.chunks(IN_CHUNK) {
            let sql = format!(
                "UPDATE tasks SET state = 'orphaned', claim_token = NULL, claim_expires_at = NULL \
                 WHERE state = 'pending' AND id IN ({})",
                placeholders(chunk.len())
            );
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(*id);
            }
            count += query.execute(&self.pool).await?.rows_affected() as usize;
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
        sqlx::query(&format!(
            r#"
            UPDATE tasks SET state = ?, claim_token = NULL, claim_expires_at = NULL
            WHERE id = ? AND state = 'pending'
              AND (? IS NULL OR claim_token IS NULL OR claim_token = ?)
            RETURNING {}
            "#,
            TASK_COLUMNS
        ))
        .bind(state.as_str())
        .bind(id)
        .bind(token.map(Uuid::to_string))
        .bind(token.map(Uuid::to_string))
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(task_from_row)
        .transpose()
    }
}
