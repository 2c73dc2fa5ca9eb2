//! Sliding-window housekeeping for the partitioned task log.
//!
//! The newest partition is the active one and receives every new task.
//! Rotation is keyed on the age of the oldest task in the active partition,
//! never on the calendar: an empty or young partition stays open no matter
//! how much wall-clock time passes. Any older partition is dropped once it
//! holds no `pending` task.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::models::{Partition, PartitionId, Task};
use crate::store::Store;

#[derive(Debug, Clone, Copy)]
pub struct PartitionPolicy {
    pub duration: Duration,
}

impl Default for PartitionPolicy {
    fn default() -> Self {
        Self {
            duration: Duration::days(1),
        }
    }
}

/// True when the active partition's oldest task is older than the policy
/// duration. An empty partition never rotates.
pub fn should_rotate(oldest: Option<&Task>, now: DateTime<Utc>, policy: &PartitionPolicy) -> bool {
    match oldest {
        Some(task) => now - task.created_at > policy.duration,
        None => false,
    }
}

/// True when a partition is not the active one and holds no pending task.
pub fn should_detach(partition: &Partition, active_id: PartitionId, pending_count: usize) -> bool {
    partition.id != active_id && pending_count == 0
}

#[derive(Debug, Default, Serialize)]
pub struct PartitionReport {
    /// The partition opened by this run, if any.
    pub opened: Option<PartitionId>,
    pub detached: Vec<PartitionId>,
}

/// One rotate-then-detach pass. Safe to run repeatedly; a second concurrent
/// run sees the newer partition and becomes a no-op.
pub async fn run_partition_housekeeping<S: Store + ?Sized>(
    store: &S,
    policy: &PartitionPolicy,
    now: DateTime<Utc>,
) -> Result<PartitionReport> {
    let mut report = PartitionReport::default();
    let partitions = store.partitions().await?;
    let Some(active) = partitions.last().cloned() else {
        return Ok(report);
    };

    let oldest = store.oldest_task(active.id).await?;
    let mut active_id = active.id;
    if should_rotate(oldest.as_ref(), now, policy) {
        let opened = store.open_partition(Some(active.id), now).await?;
        if opened.id != active.id {
            tracing::info!(
                partition_id = opened.id,
                previous = active.id,
                "opened task partition"
            );
            report.opened = Some(opened.id);
        }
        active_id = opened.id;
    }

    for partition in &partitions {
        let pending = store.pending_count(partition.id).await?;
        if !should_detach(partition, active_id, pending) {
            continue;
        }
        if store.detach_partition(partition.id).await? {
            tracing::info!(partition_id = partition.id, "detached task partition");
            report.detached.push(partition.id);
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::models::{NewTask, TaskState, TaskType};
    use crate::store::memory::InMemoryStore;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn new_task(created_at: DateTime<Utc>) -> NewTask {
        NewTask {
            repository_id: None,
            node_id: 1,
            project_identifier: 1,
            task_type: TaskType::DeleteRepo,
            perform_at: created_at,
            created_at,
        }
    }

    #[tokio::test]
    async fn test_old_partition_rotates_before_next_write() {
        let store = InMemoryStore::new();
        let policy = PartitionPolicy::default();
        let first = store.insert_task(&new_task(t0())).await.unwrap();

        let later = t0() + Duration::hours(25);
        let report = run_partition_housekeeping(&store, &policy, later).await.unwrap();
        assert!(report.opened.is_some());

        let next = store.insert_task(&new_task(later)).await.unwrap();
        assert_ne!(next.partition_id, first.partition_id);
        assert_eq!(Some(next.partition_id), report.opened);
    }

    #[tokio::test]
    async fn test_young_partition_never_rotates_across_days() {
        let store = InMemoryStore::new();
        let policy = PartitionPolicy::default();
        // Created late in the evening; "today" changes an hour later.
        let evening = Utc.with_ymd_and_hms(2024, 5, 1, 23, 30, 0).unwrap();
        let first = store.insert_task(&new_task(evening)).await.unwrap();

        let after_midnight = evening + Duration::hours(1);
        let report = run_partition_housekeeping(&store, &policy, after_midnight)
            .await
            .unwrap();
        assert!(report.opened.is_none());

        let next = store.insert_task(&new_task(after_midnight)).await.unwrap();
        assert_eq!(next.partition_id, first.partition_id);
    }

    #[tokio::test]
    async fn test_rotation_is_idempotent() {
        let store = InMemoryStore::new();
        let policy = PartitionPolicy::default();
        store.insert_task(&new_task(t0())).await.unwrap();
        let later = t0() + Duration::days(2);

        run_partition_housekeeping(&store, &policy, later).await.unwrap();
        let again = run_partition_housekeeping(&store, &policy, later).await.unwrap();
        assert!(again.opened.is_none());
        // The first partition still holds its pending task.
        assert_eq!(store.partitions().await.unwrap().len(), 2);

        let active = store.partitions().await.unwrap()[1].id;
        let opened = store.open_partition(Some(1), later).await.unwrap();
        assert_eq!(opened.id, active);
    }

    #[tokio::test]
    async fn test_pending_task_blocks_detach() {
        let store = InMemoryStore::new();
        let policy = PartitionPolicy::default();
        let task = store.insert_task(&new_task(t0())).await.unwrap();
        let later = t0() + Duration::days(2);

        let report = run_partition_housekeeping(&store, &policy, later).await.unwrap();
        assert!(report.opened.is_some());
        assert!(report.detached.is_empty());
        assert_eq!(store.partitions().await.unwrap().len(), 2);

        store.resolve_task(task.id, TaskState::Failed, None).await.unwrap();
        let report = run_partition_housekeeping(&store, &policy, later).await.unwrap();
        assert_eq!(report.detached, vec![task.partition_id]);
        assert!(store.get_task(task.id).await.unwrap().is_none());
    }

    #[test]
    fn test_predicates() {
        let policy = PartitionPolicy::default();
        assert!(!should_rotate(None, t0(), &policy));
        let partition = Partition { id: 1, opened_at: t0() };
        assert!(!should_detach(&partition, 1, 0));
        assert!(!should_detach(&partition, 2, 1));
        assert!(should_detach(&partition, 2, 0));
    }
}
