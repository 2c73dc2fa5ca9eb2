//! # Fleet Coordinator Core
//!
//! Coordination logic for a fleet of search-index nodes: which node owns
//! which namespace's index, which repositories each index tracks, and the
//! partitioned task log that nodes drain by polling.
//!
//! Everything here runs against the [`store::Store`] trait and an injected
//! [`clock::Clock`], so the same logic drives the SQLite-backed service and
//! the in-memory store used by tests. This crate has no runtime, database,
//! or network dependencies.
//!
//! | Module | Concern |
//! |--------|---------|
//! | [`nodes`] | heartbeat upsert, liveness, per-node backoff |
//! | [`placement`] | enabled namespaces, index placement, readiness |
//! | [`repositories`] | per-project indexing state and task creation |
//! | [`partitions`] | task-log rotation and retirement |
//! | [`dispatch`] | the reconciler that serves node polls |
//! | [`subscriptions`] | purge of namespaces with lapsed subscriptions |
//! | [`events`] | placement events to tasks |

pub mod clock;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod models;
pub mod nodes;
pub mod partitions;
pub mod placement;
pub mod repositories;
pub mod store;
pub mod subscriptions;
