//! # Fleet Coordinator
//!
//! Coordinates a fleet of stateless search-index nodes: decides which node
//! hosts which tenant namespace, tracks per-project indexing state, and
//! hands nodes their work through a time-partitioned task log.
//!
//! The coordination logic lives in [`fleet_coordinator_core`] and runs over
//! its `Store` trait. This crate supplies the SQLite store, configuration,
//! the HTTP poll transport, the housekeeping loop and the `fleet` CLI.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  poll   ┌──────────────┐       ┌──────────┐
//! │   Nodes    │────────▶│  Reconciler  │──────▶│  SQLite  │
//! │ (HTTP)     │◀────────│  (dispatch)  │       │  store   │
//! └────────────┘  tasks  └──────────────┘       └────┬─────┘
//!                                                    │
//!                       ┌────────────────────────────┤
//!                       ▼                            ▼
//!                 ┌──────────────┐            ┌──────────┐
//!                 │ Housekeeping │            │   CLI    │
//!                 │ (interval)   │            │ (fleet)  │
//!                 └──────────────┘            └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! fleet init                        # create database
//! fleet catalog load catalog.json   # mirror namespaces and projects
//! fleet namespace enable 1 --search
//! fleet serve                       # accept node polls, run housekeeping
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the core `Store` |
//! | [`catalog`] | Catalog snapshot import |
//! | [`housekeeping`] | Periodic placement and task-log maintenance |
//! | [`server`] | HTTP poll transport |
//! | [`admin`] | Operator placement and re-index commands |
//! | [`inspect`] | Read-only listings |

pub mod admin;
pub mod catalog;
pub mod config;
pub mod db;
pub mod housekeeping;
pub mod inspect;
pub mod migrate;
pub mod server;
pub mod sqlite_store;
