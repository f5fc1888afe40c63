//! # docgraph CLI (`dgx`)
//!
//! The `dgx` binary is the operator interface for the retrieval engine. It
//! initializes the database, loads pre-extracted snapshots, backfills
//! embeddings, manages tenant plans, answers queries, and starts the HTTP
//! server.
//!
//! ## Usage
//!
//! ```bash
//! dgx --config ./config/dgx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dgx init` | Create the SQLite database and run schema migrations |
//! | `dgx import <file> --tenant <t>` | Load a JSON snapshot of documents, chunks, and graph rows |
//! | `dgx embed pending` | Embed chunks, entities, and relations that have no vector |
//! | `dgx plan set <tenant> <plan>` | Assign a subscription plan |
//! | `dgx plan show <tenant>` | Show a tenant's plan, modes, and usage |
//! | `dgx query "<q>" --tenant <t>` | Answer a query from the command line |
//! | `dgx serve` | Start the HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! dgx init
//! dgx import ./snapshot.json --tenant acme
//! dgx embed pending --tenant acme
//! dgx plan set acme pro
//! dgx query "What is the refund policy?" --tenant acme --mode mix
//! dgx serve
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use docgraph::progress::ProgressMode;
use docgraph::{config, embed_cmd, import, logging, migrate, plans, query, server};
use docgraph_core::query::QueryRequest;

/// docgraph: multi-tenant graph-augmented retrieval over pre-indexed documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/dgx.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "dgx",
    about = "docgraph: multi-tenant graph-augmented retrieval for document question answering",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/dgx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Load a JSON snapshot of documents, chunks, entities, and relations.
    Import {
        /// Snapshot file.
        file: PathBuf,

        /// Tenant that will own every imported row.
        #[arg(long)]
        tenant: String,

        /// Workspace for rows that do not name one.
        #[arg(long)]
        workspace: Option<String>,
    },

    /// Embedding management.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Tenant plan management.
    Plan {
        #[command(subcommand)]
        action: PlanAction,
    },

    /// Answer a query for a tenant.
    Query {
        query: String,

        #[arg(long)]
        tenant: String,

        /// naive, local, global, hybrid, or mix. Falls back to naive when the
        /// tenant's plan does not include it.
        #[arg(long)]
        mode: Option<String>,

        #[arg(long)]
        workspace: Option<String>,

        #[arg(long)]
        top_k: Option<i64>,

        /// Print the result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed rows that have no vector yet.
    Pending {
        /// Only rows owned by this tenant.
        #[arg(long)]
        tenant: Option<String>,

        /// Maximum rows of each kind to embed.
        #[arg(long)]
        limit: Option<usize>,

        /// Count pending rows without calling the provider.
        #[arg(long)]
        dry_run: bool,

        /// Progress output. Defaults to human when stderr is a terminal.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },
}

#[derive(Subcommand)]
enum PlanAction {
    /// Assign a configured plan to a tenant.
    Set { tenant: String, plan: String },
    /// Show a tenant's plan, available modes, and this month's usage.
    Show { tenant: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(p: ProgressArg) -> Self {
        match p {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Import {
            file,
            tenant,
            workspace,
        } => {
            import::run_import(&cfg, &file, &tenant, workspace.as_deref()).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending {
                tenant,
                limit,
                dry_run,
                progress,
            } => {
                let progress = progress
                    .map(ProgressMode::from)
                    .unwrap_or_else(ProgressMode::default_for_tty);
                embed_cmd::run_embed_pending(&cfg, tenant.as_deref(), limit, dry_run, progress)
                    .await?;
            }
        },
        Commands::Plan { action } => match action {
            PlanAction::Set { tenant, plan } => {
                plans::run_plan_set(&cfg, &tenant, &plan).await?;
            }
            PlanAction::Show { tenant } => {
                plans::run_plan_show(&cfg, &tenant).await?;
            }
        },
        Commands::Query {
            query: text,
            tenant,
            mode,
            workspace,
            top_k,
            json,
        } => {
            let request = QueryRequest {
                query: text,
                mode,
                workspace,
                top_k,
                ..Default::default()
            };
            query::run_query(&cfg, &tenant, &request, json).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
