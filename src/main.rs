//! # Fleet CLI (`fleet`)
//!
//! ## Usage
//!
//! ```bash
//! fleet --config ./config/fleet.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fleet init` | Create the SQLite database and run schema migrations |
//! | `fleet serve` | Accept node polls and run housekeeping on an interval |
//! | `fleet housekeep` | Run one housekeeping pass and print its report |
//! | `fleet catalog load <file>` | Upsert a JSON catalog snapshot |
//! | `fleet namespace ...` | Enable, disable, place and toggle search for namespaces |
//! | `fleet reindex <project-id>` | Queue indexing for a project on every index |
//! | `fleet nodes` / `fleet indices` | Registry and placement listings |
//! | `fleet partitions` / `fleet tasks <id>` | Task log inspection |

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use fleet_coordinator::{admin, catalog, config, housekeeping, inspect, migrate, server};

/// Coordinator for a fleet of search-index nodes.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/fleet.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "fleet",
    about = "Coordinator for a fleet of search-index nodes",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/fleet.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Serve the node poll API and run housekeeping in the background.
    Serve,

    /// Run a single housekeeping pass.
    Housekeep,

    /// Catalog mirror management.
    Catalog {
        #[command(subcommand)]
        action: CatalogAction,
    },

    /// Namespace placement.
    Namespace {
        #[command(subcommand)]
        action: NamespaceAction,
    },

    /// Queue indexing work for a project on every index of its namespace.
    Reindex {
        project_id: i64,

        /// Queue `force_index_repo` instead of `index_repo`.
        #[arg(long)]
        force: bool,
    },

    /// List registered nodes with storage and liveness.
    Nodes,

    /// List indices with their state and unfinished repositories.
    Indices,

    /// List live task-log partitions.
    Partitions,

    /// List the tasks of one partition.
    Tasks { partition_id: i64 },
}

#[derive(Subcommand)]
enum CatalogAction {
    /// Upsert a JSON catalog snapshot.
    Load { file: PathBuf },
}

#[derive(Subcommand)]
enum NamespaceAction {
    /// Make a root namespace eligible for indexing.
    Enable {
        root_namespace_id: i64,

        /// Allow live searches once indices are ready.
        #[arg(long)]
        search: bool,
    },
    /// Remove a namespace with all of its indices.
    Disable { root_namespace_id: i64 },
    /// Toggle live search for an enabled namespace.
    Search {
        root_namespace_id: i64,
        #[arg(value_enum)]
        state: Toggle,
    },
    /// Place a namespace's index on a specific node.
    Assign {
        root_namespace_id: i64,
        node_uuid: String,
    },
    /// Destroy one index.
    RemoveIndex { index_id: i64 },
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg.logging.level);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Housekeep => {
            housekeeping::run_housekeep(&cfg).await?;
        }
        Commands::Catalog { action } => match action {
            CatalogAction::Load { file } => {
                catalog::run_load(&cfg, &file).await?;
            }
        },
        Commands::Namespace { action } => match action {
            NamespaceAction::Enable {
                root_namespace_id,
                search,
            } => {
                admin::run_enable(&cfg, root_namespace_id, search).await?;
            }
            NamespaceAction::Disable { root_namespace_id } => {
                admin::run_disable(&cfg, root_namespace_id).await?;
            }
            NamespaceAction::Search {
                root_namespace_id,
                state,
            } => {
                admin::run_set_search(&cfg, root_namespace_id, matches!(state, Toggle::On)).await?;
            }
            NamespaceAction::Assign {
                root_namespace_id,
                node_uuid,
            } => {
                admin::run_assign(&cfg, root_namespace_id, &node_uuid).await?;
            }
            NamespaceAction::RemoveIndex { index_id } => {
                admin::run_remove_index(&cfg, index_id).await?;
            }
        },
        Commands::Reindex { project_id, force } => {
            admin::run_reindex(&cfg, project_id, force).await?;
        }
        Commands::Nodes => {
            inspect::run_nodes(&cfg).await?;
        }
        Commands::Indices => {
            inspect::run_indices(&cfg).await?;
        }
        Commands::Partitions => {
            inspect::run_partitions(&cfg).await?;
        }
        Commands::Tasks { partition_id } => {
            inspect::run_tasks(&cfg, partition_id).await?;
        }
    }

    Ok(())
}
