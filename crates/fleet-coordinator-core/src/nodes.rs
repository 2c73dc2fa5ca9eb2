//! Node registry and per-node dispatch backoff.
//!
//! Nodes announce themselves on every poll with a [`Heartbeat`]. The
//! registry turns that into a [`Node`] record (upsert by uuid) and decides
//! liveness purely from heartbeat age. Nodes are never purged here.
//!
//! [`BackoffRegistry`] throttles how much work the reconciler hands to a
//! node that reports failures or saturation. State is kept per node id for
//! the lifetime of the registry, so it survives across polls.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoordinatorError;
use crate::models::{Node, NodeId, NodeMetadata};

/// A node is online while its last heartbeat is younger than this many seconds.
pub const ONLINE_WINDOW_SECS: i64 = 60;

/// Heartbeat payload reported by a node.
///
/// Every field is optional at the wire level so that a malformed heartbeat
/// surfaces as a [`CoordinatorError::Validation`] rather than a decode error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Heartbeat {
    pub uuid: Option<String>,
    pub index_url: Option<String>,
    #[serde(default)]
    pub search_url: Option<String>,
    pub used_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub name: Option<String>,
    #[serde(default)]
    pub task_count: Option<u32>,
    #[serde(default)]
    pub concurrency: Option<u32>,
}

impl Heartbeat {
    /// Parse and validate the node uuid.
    pub fn parsed_uuid(&self) -> Result<Uuid> {
        let raw = required(&self.uuid, "uuid")?;
        Uuid::parse_str(raw)
            .map_err(|e| CoordinatorError::Validation(format!("invalid uuid '{}': {}", raw, e)).into())
    }

    /// First required field the heartbeat omits, if any.
    pub fn missing_field(&self) -> Option<&'static str> {
        [
            ("uuid", self.uuid.is_none()),
            ("index_url", self.index_url.is_none()),
            ("used_bytes", self.used_bytes.is_none()),
            ("total_bytes", self.total_bytes.is_none()),
            ("name", self.name.is_none()),
        ]
        .into_iter()
        .find_map(|(name, missing)| missing.then_some(name))
    }
}

fn required<'a, T>(field: &'a Option<T>, name: &str) -> Result<&'a T> {
    field
        .as_ref()
        .ok_or_else(|| CoordinatorError::Validation(format!("heartbeat is missing '{}'", name)).into())
}

fn non_blank<'a>(field: &'a Option<String>, name: &str) -> Result<&'a str> {
    let value = required(field, name)?.trim();
    if value.is_empty() {
        return Err(CoordinatorError::Validation(format!("heartbeat field '{}' is blank", name)).into());
    }
    Ok(value)
}

/// Apply a heartbeat to an existing node (or build a fresh one).
///
/// Always overwrites the index URL and storage counters, falls back the
/// search URL to the index URL, and merges optional capacity metadata
/// without clobbering fields the node omitted. `last_seen_at` never moves
/// backwards. The returned node is not persisted.
pub fn upsert_node(existing: Option<Node>, heartbeat: &Heartbeat, now: DateTime<Utc>) -> Result<Node> {
    let uuid = heartbeat.parsed_uuid()?;
    let index_url = non_blank(&heartbeat.index_url, "index_url")?.to_string();
    let name = non_blank(&heartbeat.name, "name")?.to_string();
    let used_bytes = *required(&heartbeat.used_bytes, "used_bytes")?;
    let total_bytes = *required(&heartbeat.total_bytes, "total_bytes")?;
    if used_bytes > total_bytes {
        return Err(CoordinatorError::Validation(format!(
            "used_bytes ({}) exceeds total_bytes ({})",
            used_bytes, total_bytes
        ))
        .into());
    }

    let search_url = heartbeat
        .search_url
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| index_url.clone());

    let mut node = match existing {
        Some(node) if node.uuid == uuid => node,
        Some(node) => {
            return Err(CoordinatorError::Validation(format!(
                "heartbeat uuid {} does not match node {}",
                uuid, node.uuid
            ))
            .into())
        }
        None => Node {
            id: None,
            uuid,
            index_base_url: String::new(),
            search_base_url: String::new(),
            last_seen_at: now,
            used_bytes: 0,
            total_bytes: 0,
            metadata: NodeMetadata::default(),
        },
    };

    node.index_base_url = index_url;
    node.search_base_url = search_url;
    node.used_bytes = used_bytes;
    node.total_bytes = total_bytes;
    node.last_seen_at = node.last_seen_at.max(now);
    node.metadata.name = name;
    if heartbeat.task_count.is_some() {
        node.metadata.task_count = heartbeat.task_count;
    }
    if heartbeat.concurrency.is_some() {
        node.metadata.concurrency = heartbeat.concurrency;
    }

    Ok(node)
}

pub fn is_online(node: &Node, now: DateTime<Utc>) -> bool {
    now - node.last_seen_at < Duration::seconds(ONLINE_WINDOW_SECS)
}

/// Nodes whose last heartbeat is inside the online window.
pub fn online_nodes(nodes: Vec<Node>, now: DateTime<Utc>) -> Vec<Node> {
    nodes.into_iter().filter(|n| is_online(n, now)).collect()
}

// ============ Backoff ============

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: StdDuration,
    pub max: StdDuration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: StdDuration::from_secs(1),
            max: StdDuration::from_secs(60),
        }
    }
}

/// Backoff state for one node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Backoff {
    failures: u32,
    throttled_until: Option<DateTime<Utc>>,
}

impl Backoff {
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Current delay: `base * 2^(failures - 1)`, capped at `policy.max`.
    pub fn delay(&self, policy: &BackoffPolicy) -> StdDuration {
        if self.failures == 0 {
            return StdDuration::ZERO;
        }
        let factor = 1u32.checked_shl(self.failures - 1).unwrap_or(u32::MAX);
        policy.base.saturating_mul(factor).min(policy.max)
    }

    pub fn record_failure(&mut self, policy: &BackoffPolicy, now: DateTime<Utc>) {
        self.failures = self.failures.saturating_add(1);
        let delay = Duration::from_std(self.delay(policy)).unwrap_or_else(|_| Duration::days(1));
        self.throttled_until = Some(now + delay);
    }

    /// Successes decay the failure count one step at a time.
    pub fn record_success(&mut self) {
        self.failures = self.failures.saturating_sub(1);
        if self.failures == 0 {
            self.throttled_until = None;
        }
    }

    /// Scale `requested` down for failures, saturation and an active
    /// throttle window. Never returns zero for a non-zero request.
    pub fn dispatch_limit(&self, requested: usize, saturated: bool, now: DateTime<Utc>) -> usize {
        if requested == 0 {
            return 0;
        }
        if self.throttled_until.is_some_and(|until| now < until) {
            return 1;
        }
        let mut limit = requested >> self.failures.min(usize::BITS - 1);
        if saturated {
            limit /= 2;
        }
        limit.max(1)
    }
}

/// Backoff state for every node the coordinator has seen.
pub struct BackoffRegistry {
    policy: BackoffPolicy,
    entries: Mutex<HashMap<NodeId, Backoff>>,
}

impl BackoffRegistry {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Snapshot of the backoff state for a node.
    pub fn get(&self, node_id: NodeId) -> Backoff {
        self.entries
            .lock()
            .unwrap()
            .get(&node_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn record_failure(&self, node_id: NodeId, now: DateTime<Utc>) {
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(node_id)
            .or_default()
            .record_failure(&self.policy, now);
    }

    pub fn record_success(&self, node_id: NodeId) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(backoff) = entries.get_mut(&node_id) {
            backoff.record_success();
            if backoff.failures == 0 {
                entries.remove(&node_id);
            }
        }
    }

    pub fn dispatch_limit(&self, node: &Node, requested: usize, now: DateTime<Utc>) -> usize {
        let backoff = match node.id {
            Some(id) => self.get(id),
            None => Backoff::default(),
        };
        backoff.dispatch_limit(requested, node.is_saturated(), now)
    }

    pub fn delay(&self, node_id: NodeId) -> StdDuration {
        self.get(node_id).delay(&self.policy)
    }
}

impl Default for BackoffRegistry {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}
