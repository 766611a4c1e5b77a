/// mnemon CLI - Associative Memory Command Line Tool
///
/// Simple commands for interacting with a mnemon state directory.
///
/// Usage:
///   mnemon remember <text> [--type fact] [--importance 0.5] [--ttl 30d] [--tags a,b]
///   mnemon recall <query> [--limit 5]
///   mnemon get <id>
///   mnemon associate <from> <to> [--relation :relates_to] [--weight 0.5]
///   mnemon stats
///   mnemon describe
///   mnemon snapshot
///   mnemon list-policy-versions
///
/// Exit codes: 0 success, 1 user error, 2 internal error.
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use mnemon::{EngineConfig, MemoryEngine, MemoryError, Ttl};

#[derive(Parser)]
#[command(name = "mnemon", version, about = "Persistent associative memory engine")]
struct Cli {
    /// State directory (default: MEMORY_STATE_DIR or ~/.mnemon)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store a new memory item
    ///
    /// Examples:
    ///   mnemon remember "sled trees are lock-free" --type fact --tags rust,storage
    ///   mnemon remember "retry deploys twice" --type technique --ttl 90d
    Remember {
        /// The item text
        text: String,

        /// Item type label (open set: fact, event, plan, technique, ...)
        #[arg(long = "type", default_value = "fact")]
        type_label: String,

        /// Importance in [0, 1]
        #[arg(long, default_value_t = 0.5)]
        importance: f64,

        /// Lifetime bound: 7d, 30d, 90d, 365d or perpetual
        #[arg(long, default_value = "30d")]
        ttl: String,

        /// Comma-separated tags
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,

        /// Optional scope (e.g. agent identity)
        #[arg(long)]
        scope: Option<String>,
    },

    /// Recall items by spreading activation
    ///
    /// Example:
    ///   mnemon recall "deploy failures" --limit 5
    Recall {
        /// The query
        query: String,

        /// Maximum results
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },

    /// Fetch one item in full
    Get {
        /// Item id
        id: String,
    },

    /// Create or reinforce an edge between two items
    Associate {
        /// Source item id
        from: String,

        /// Target item id
        to: String,

        /// Relation label
        #[arg(long, default_value = ":relates_to")]
        relation: String,

        /// Reinforcement weight in [0, 1]
        #[arg(long, default_value_t = 0.5)]
        weight: f64,
    },

    /// Show memory statistics
    Stats,

    /// Print the memory-about-memory description
    Describe,

    /// Force a snapshot save
    Snapshot,

    /// List installed policy versions with counters and lineage
    ListPolicyVersions,
}

#[tokio::main]
async fn main() {
    mnemon::init_logging();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version requests are not errors.
            if e.use_stderr() {
                eprintln!("{e}");
                std::process::exit(1);
            }
            println!("{e}");
            std::process::exit(0);
        }
    };

    match run(cli).await {
        Ok(()) => {}
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            let user_error = e
                .downcast_ref::<MemoryError>()
                .map(|me| me.is_user_error())
                .unwrap_or(false);
            std::process::exit(if user_error { 1 } else { 2 });
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = EngineConfig::from_env();
    if let Some(dir) = cli.state_dir {
        config.state_dir = dir;
    }
    let memory = MemoryEngine::start_with_config(config).await?;

    match cli.command {
        Command::Remember {
            text,
            type_label,
            importance,
            ttl,
            tags,
            scope,
        } => {
            let ttl: Ttl = ttl.parse::<Ttl>()?;
            let id = memory
                .remember(&type_label, &text, importance, ttl, tags, scope)
                .await?;
            println!("{}", "OK".green().bold());
            println!("  id: {}", id.cyan());
        }
        Command::Recall { query, limit } => {
            let results = memory.recall(&query, limit).await?;
            if results.is_empty() {
                println!("{}", "No matches.".bright_black());
            } else {
                println!("{} ({} items)", "Recall:".bold(), results.len());
                for item in results {
                    println!(
                        "  {} {:.3} [{}] {}",
                        "*".cyan(),
                        item.score,
                        item.item_type.as_str().bright_black(),
                        item.preview
                    );
                    println!("    {}", item.id.bright_black());
                }
            }
        }
        Command::Get { id } => match memory.get_item(&id).await {
            Some(item) => {
                println!("{}", serde_json::to_string_pretty(&item)?);
            }
            None => {
                return Err(MemoryError::ItemNotFound { id }.into());
            }
        },
        Command::Associate {
            from,
            to,
            relation,
            weight,
        } => {
            let new_weight = memory
                .associate(&from, &to, &relation, weight, None)
                .await?;
            println!("{}", "OK".green().bold());
            println!(
                "  {} {} {} (weight {:.3})",
                from.cyan(),
                relation,
                to.cyan(),
                new_weight
            );
        }
        Command::Stats => {
            let stats = memory.stats().await;
            println!("{}", "Memory Status".bold().cyan());
            println!("  id:              {}", stats.id);
            println!("  items:           {}", stats.item_count);
            println!("  edges:           {}", stats.edge_count);
            println!("  energy:          {:.3}", stats.global_energy);
            println!("  sessions:        {}", stats.session_count);
            println!("  policy versions: {}", stats.policy_version_count);
            println!("  manifest epoch:  {}", stats.manifest_epoch);
            if !stats.type_counts.is_empty() {
                println!("  {}", "by type:".bold());
                for (type_label, count) in &stats.type_counts {
                    println!("    {} {}: {}", "*".cyan(), type_label, count);
                }
            }
        }
        Command::Describe => {
            let manifest = memory.refresh_manifest().await;
            println!("{}", manifest.description);
        }
        Command::Snapshot => {
            memory.snapshot().await?;
            println!("{}", "Snapshot saved.".green().bold());
        }
        Command::ListPolicyVersions => {
            let versions = memory.list_policy_versions().await;
            println!("{} ({} versions)", "Policy versions:".bold(), versions.len());
            for version in versions {
                let lineage = version
                    .superseded_by
                    .as_deref()
                    .map(|s| format!(" -> {}", &s[..8.min(s.len())]))
                    .unwrap_or_default();
                println!(
                    "  {} {} [{}] success={} fail={}{}",
                    "*".cyan(),
                    &version.version_id[..8.min(version.version_id.len())],
                    version.name.to_string().bright_black(),
                    version.success,
                    version.fail,
                    lineage.bright_black()
                );
            }
        }
    }
    Ok(())
}
