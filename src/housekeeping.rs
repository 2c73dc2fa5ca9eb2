//! Periodic reconciliation of placement and the task log.
//!
//! One pass runs, in order: partition rotation and detach, the optional
//! subscription purge, optional reallocation, assignment of unplaced
//! namespaces, index lifecycle advance, and finally application of every
//! placement event the earlier steps produced.
//!
//! `fleet housekeep` runs one pass; `fleet serve` runs it on an interval.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use fleet_coordinator_core::clock::Clock;
use fleet_coordinator_core::events::apply_events;
use fleet_coordinator_core::models::{IndexId, NamespaceId, PartitionId};
use fleet_coordinator_core::partitions::run_partition_housekeeping;
use fleet_coordinator_core::placement::{
    advance_index_states, assign_missing_indices, reallocate, PlacementEvent,
};
use fleet_coordinator_core::store::Store;
use fleet_coordinator_core::subscriptions::purge_expired_namespaces;

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

/// Summary of one housekeeping pass.
#[derive(Debug, Default, Serialize)]
pub struct HousekeepingReport {
    pub partition_opened: Option<PartitionId>,
    pub partitions_detached: Vec<PartitionId>,
    pub events: Vec<PlacementEvent>,
    pub assigned: Vec<IndexId>,
    pub skipped: Vec<NamespaceId>,
    pub initializing: Vec<IndexId>,
    pub ready: Vec<IndexId>,
    pub tasks_created: usize,
}

pub async fn run_housekeeping_once<S: Store + ?Sized>(
    store: &S,
    config: &Config,
    now: DateTime<Utc>,
) -> Result<HousekeepingReport> {
    let mut report = HousekeepingReport::default();

    let partitions = run_partition_housekeeping(store, &config.partition_policy(), now).await?;
    report.partition_opened = partitions.opened;
    report.partitions_detached = partitions.detached;

    if config.subscriptions.enabled {
        let events = purge_expired_namespaces(
            store,
            config.subscriptions.grace_days,
            now.date_naive(),
            config.subscriptions.batch_size,
        )
        .await?;
        report.events.extend(events);
    }

    let policy = config.placement_policy();
    if config.placement.reallocation {
        report.events.extend(reallocate(store, &policy, now).await?);
    }

    let assignment = assign_missing_indices(store, &policy, now).await?;
    report.assigned = assignment.assigned.iter().map(|i| i.id).collect();
    report.skipped = assignment.skipped;
    report.events.extend(assignment.events);

    let transitions = advance_index_states(store).await?;
    report.initializing = transitions.initializing;
    report.ready = transitions.ready;
    for request in transitions.requests {
        if !report.events.contains(&request) {
            report.events.push(request);
        }
    }

    report.tasks_created = apply_events(store, &report.events, now).await?.len();

    tracing::info!(
        events = report.events.len(),
        assigned = report.assigned.len(),
        skipped = report.skipped.len(),
        ready = report.ready.len(),
        tasks_created = report.tasks_created,
        "housekeeping pass complete"
    );
    Ok(report)
}

/// `fleet housekeep`: one pass against the configured database.
pub async fn run_housekeep(config: &Config) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let report = run_housekeeping_once(&store, config, Utc::now()).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    store.pool().close().await;
    Ok(())
}

/// Run housekeeping forever on the configured interval. A failed pass is
/// logged and the loop carries on.
pub async fn run_housekeeping_loop<S: Store + ?Sized>(
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
        config.housekeeping.interval_secs,
    ));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Err(err) = run_housekeeping_once(store.as_ref(), &config, clock.now()).await {
            tracing::error!(error = %format!("{:#}", err), "housekeeping pass failed");
        }
    }
}
