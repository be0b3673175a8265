//! # codectx CLI
//!
//! The `codectx` binary creates project stores, inspects them, manages the
//! MCP tool set, and runs the MCP server.
//!
//! ## Usage
//!
//! ```bash
//! codectx --config ./config/codectx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `codectx init <project>` | Create a project store and run schema migrations |
//! | `codectx stats <project>` | Row counts and embedding provenance |
//! | `codectx outline <project> <path>` | Print a file's outline |
//! | `codectx embed stale <project>` | Re-embed chunks from a retired model |
//! | `codectx tools list` | List MCP tools and their state |
//! | `codectx tools toggle <name>` | Enable or disable an MCP tool |
//! | `codectx serve` | Start the MCP server |

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use codectx::config::{self, Config};
use codectx::embedding;
use codectx::ingest;
use codectx::logging;
use codectx::models::OutlineTree;
use codectx::outline;
use codectx::project::LocalProjectService;
use codectx::registry::ToolRegistry;
use codectx::server::McpManager;
use codectx::settings::SqliteSettings;
use codectx::status::Metrics;

/// codectx: a local-first code index for AI agents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Without the file, everything lives under `./data`.
#[derive(Parser)]
#[command(
    name = "codectx",
    about = "codectx: a local-first source code index served to AI agents over MCP",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/codectx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a project store.
    ///
    /// Runs all schema migrations and records the project's metadata.
    /// Fails if the project already exists.
    Init {
        /// Project id; also the store's directory name.
        project: String,

        /// Display name (defaults to the id).
        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        description: Option<String>,
    },

    /// Show row counts for a project.
    Stats { project: String },

    /// Print the outline of an indexed file.
    Outline {
        project: String,

        /// File path as stored in the index.
        path: String,

        /// Maximum nesting depth (0 = unlimited).
        #[arg(long, default_value_t = 0)]
        depth: usize,
    },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Inspect and toggle MCP tools.
    Tools {
        #[command(subcommand)]
        action: ToolsAction,
    },

    /// Start the MCP server and run until Ctrl-C.
    Serve,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Re-embed chunks whose vector is missing or was produced by another model.
    Stale { project: String },
}

#[derive(Subcommand)]
enum ToolsAction {
    /// List tools with their enabled state.
    List,
    /// Flip a tool between enabled and disabled.
    Toggle { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = load_or_minimal(&cli.config)?;
    logging::init(&cfg.logging.filter);

    match cli.command {
        Commands::Init {
            project,
            name,
            description,
        } => {
            let service = project_service(&cfg)?;
            let name = name.unwrap_or_else(|| project.clone());
            let meta = service
                .create_project(&project, &name, description.as_deref())
                .await
                .with_context(|| format!("Failed to create project '{}'", project))?;
            println!(
                "Initialized project '{}' at {}",
                meta.id,
                cfg.storage.project_db_path(&project).display()
            );
        }
        Commands::Stats { project } => {
            let service = project_service(&cfg)?;
            let store = service.store(&project).await?;
            let stats = store.stats().await?;
            println!("Project:        {}", project);
            println!("Schema version: {}", store.schema_version().await?);
            println!("Files:          {}", stats.files);
            println!("Chunks:         {}", stats.chunks);
            println!("Symbols:        {}", stats.symbols);
            println!("Outline nodes:  {}", stats.outline_nodes);
            if !stats.embedding_models.is_empty() {
                println!("Embeddings:");
                for (model, count) in &stats.embedding_models {
                    let model = if model.is_empty() { "<none>" } else { model };
                    println!("  {:<24} {}", model, count);
                }
            }
        }
        Commands::Outline {
            project,
            path,
            depth,
        } => {
            let service = project_service(&cfg)?;
            let store = service.store(&project).await?;
            let mut forest = store.get_outline(&path).await?;
            if depth > 0 {
                outline::truncate_depth(&mut forest, depth);
            }
            if forest.is_empty() {
                println!("No outline for {}", path);
            }
            print_outline(&forest, 0);
        }
        Commands::Embed { action } => match action {
            EmbedAction::Stale { project } => {
                let service = project_service(&cfg)?;
                let store = service.store(&project).await?;
                let updated = ingest::reembed_stale(&store, service.embedder().as_ref()).await?;
                println!(
                    "Re-embedded {} chunks with {}",
                    updated,
                    service.embedder().model_id()
                );
            }
        },
        Commands::Tools { action } => {
            let settings = Arc::new(
                SqliteSettings::open(&cfg.settings.path, cfg.storage.busy_timeout()).await?,
            );
            let registry = ToolRegistry::with_builtins(Arc::new(Metrics::new()), settings);
            registry.load_disabled().await?;
            match action {
                ToolsAction::List => {
                    for tool in registry.infos() {
                        let state = if tool.enabled { "enabled" } else { "disabled" };
                        println!("{:<12} {:<9} {}", tool.name, state, tool.description);
                    }
                }
                ToolsAction::Toggle { name } => {
                    let enabled = registry.toggle(&name, &[]).await?;
                    println!(
                        "{} is now {}",
                        name,
                        if enabled { "enabled" } else { "disabled" }
                    );
                }
            }
        }
        Commands::Serve => {
            let settings = Arc::new(
                SqliteSettings::open(&cfg.settings.path, cfg.storage.busy_timeout()).await?,
            );
            let service = Arc::new(project_service(&cfg)?);
            let manager = McpManager::load(cfg.server.clone(), service, settings).await?;
            manager.start().await?;

            if let Some(addr) = manager.local_addr() {
                println!("codectx MCP server listening on http://{}", addr);
                println!("  Unbound:     http://{}/mcp", addr);
                println!("  Per project: http://{}/mcp/<projectId>", addr);
            }

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            manager.stop().await?;
        }
    }

    Ok(())
}

fn load_or_minimal(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        Ok(Config::minimal())
    }
}

fn project_service(cfg: &Config) -> anyhow::Result<LocalProjectService> {
    let embedder = embedding::from_config(&cfg.embedding)?;
    Ok(LocalProjectService::new(cfg.storage.clone(), embedder))
}

fn print_outline(forest: &[OutlineTree], indent: usize) {
    for node in forest {
        println!(
            "{}{} {} [{}-{}]",
            "  ".repeat(indent),
            node.kind,
            node.name,
            node.start_line,
            node.end_line
        );
        print_outline(&node.children, indent + 1);
    }
}
