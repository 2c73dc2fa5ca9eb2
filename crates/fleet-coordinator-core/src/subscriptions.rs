//! Removal of enabled namespaces whose paid subscription has lapsed.

use std::collections::HashSet;

use anyhow::Result;
use chrono::{Duration, NaiveDate};

use crate::models::{NamespaceId, Subscription};
use crate::placement::{remove_enabled_namespace, PlacementEvent};
use crate::store::Store;

/// A subscription keeps its namespace while it is paid and has not ended
/// more than `grace_days` ago.
pub fn is_valid(subscription: &Subscription, grace_days: i64, today: NaiveDate) -> bool {
    if !subscription.paid {
        return false;
    }
    match subscription.ends_on {
        None => true,
        Some(ends_on) => ends_on
            .checked_add_signed(Duration::days(grace_days))
            .map_or(true, |cutoff| cutoff >= today),
    }
}

async fn valid_namespaces<S: Store + ?Sized>(
    store: &S,
    grace_days: i64,
    today: NaiveDate,
    batch_size: usize,
) -> Result<HashSet<NamespaceId>> {
    let batch_size = batch_size.max(1);
    let mut valid = HashSet::new();
    let mut after = None;
    loop {
        let page = store.subscriptions_after(after, batch_size).await?;
        let Some(last) = page.last() else {
            break;
        };
        after = Some(last.namespace_id);
        let full = page.len() == batch_size;
        valid.extend(
            page.iter()
                .filter(|s| is_valid(s, grace_days, today))
                .map(|s| s.namespace_id),
        );
        if !full {
            break;
        }
    }
    Ok(valid)
}

/// Destroy every enabled namespace without a currently valid subscription,
/// cascading to its indices. Returns the delete requests for their nodes.
pub async fn purge_expired_namespaces<S: Store + ?Sized>(
    store: &S,
    grace_days: i64,
    today: NaiveDate,
    batch_size: usize,
) -> Result<Vec<PlacementEvent>> {
    let valid = valid_namespaces(store, grace_days, today, batch_size).await?;
    let mut events = Vec::new();
    let mut purged = 0;

    for enabled in store.list_enabled_namespaces().await? {
        if valid.contains(&enabled.root_namespace_id) {
            continue;
        }
        events.extend(remove_enabled_namespace(store, &enabled).await?);
        purged += 1;
    }

    if purged > 0 {
        tracing::info!(purged, grace_days, "removed namespaces with expired subscriptions");
    }
    Ok(events)
}
