//! # Newsdesk CLI (`newsdesk`)
//!
//! The `newsdesk` binary runs every stage of the pipeline (ingest, tagging,
//! embedding) as well as the HTTP server and the operational tasks that are
//! usually scheduled from cron: backups, rotation, retention cleanup and
//! Telegram digests.
//!
//! ## Usage
//!
//! ```bash
//! newsdesk --config ./config/newsdesk.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `newsdesk init` | Create the SQLite database and run schema migrations |
//! | `newsdesk ingest` | Fetch headlines from NewsAPI |
//! | `newsdesk tag` | Tag untagged articles with sentiment and category |
//! | `newsdesk embed pending` | Embed articles without a vector |
//! | `newsdesk embed rebuild` | Clear and regenerate all embeddings |
//! | `newsdesk search "<query>"` | Search stored articles |
//! | `newsdesk stats` | Print database statistics |
//! | `newsdesk serve` | Start the REST + SSE server |
//! | `newsdesk health` | Integrity check, or poll a running server |
//! | `newsdesk backup <action>` | Create, rotate, verify or restore backups |
//! | `newsdesk cleanup` | Delete articles past the retention window |
//! | `newsdesk notify <action>` | Send a Telegram test message or digest |

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;

use newsdesk::{
    backup, config, embed_cmd, health, ingest, migrate, notify, retention, search, server,
    stats, tagging,
};

/// Newsdesk: geopolitical news aggregation with sentiment tagging and
/// retrieval-augmented chat.
#[derive(Parser)]
#[command(
    name = "newsdesk",
    about = "Newsdesk: news ingestion, tagging, retrieval and RAG chat backend",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/newsdesk.toml`. API keys may also come from the
    /// environment or a `.env` file.
    #[arg(long, global = true, default_value = "./config/newsdesk.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Fetch headlines from NewsAPI and store the new ones.
    Ingest {
        /// Override the configured query for this run.
        #[arg(long)]
        query: Option<String>,

        /// Fetch and count without writing to the database.
        #[arg(long)]
        dry_run: bool,
    },

    /// Tag untagged articles with sentiment and category.
    Tag {
        /// Maximum number of articles to tag.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Search stored articles.
    Search {
        /// The search query string.
        query: String,

        /// `keyword` (FTS5), `semantic` (vector), or `hybrid`.
        #[arg(long, default_value = "keyword")]
        mode: String,

        /// Filter by category (e.g. `conflict`, `economy`).
        #[arg(long)]
        category: Option<String>,

        /// Filter by source name.
        #[arg(long)]
        source: Option<String>,

        /// Only articles published on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Print article, chat and ingest statistics.
    Stats,

    /// Start the HTTP server.
    Serve,

    /// Check database integrity, or poll a running server with `--url`.
    Health {
        /// Base URL of a running server (e.g. `http://127.0.0.1:8080`).
        #[arg(long)]
        url: Option<String>,

        /// Poll attempts before giving up.
        #[arg(long, default_value_t = 10)]
        attempts: u32,

        /// Seconds between poll attempts.
        #[arg(long, default_value_t = 3)]
        interval_secs: u64,
    },

    /// Database backups.
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },

    /// Delete articles older than `retention.max_age_days`.
    Cleanup {
        /// Report how many articles would be deleted.
        #[arg(long)]
        dry_run: bool,
    },

    /// Telegram notifications.
    Notify {
        #[command(subcommand)]
        action: NotifyAction,
    },

    /// Print shell completions to stdout.
    Completions {
        shell: Shell,
    },
}

/// Embedding management subcommands.
#[derive(Subcommand)]
enum EmbedAction {
    /// Embed articles that have no vector yet.
    Pending {
        /// Maximum number of articles to embed in this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Show counts without calling the provider.
        #[arg(long)]
        dry_run: bool,
    },

    /// Clear every stored vector and re-embed all articles.
    Rebuild,
}

#[derive(Subcommand)]
enum BackupAction {
    /// Snapshot the database into the backup directory.
    Create,
    /// Compress backups older than a day and delete old archives.
    Rotate,
    /// Open a backup read-only and run an integrity check.
    Verify { file: PathBuf },
    /// Replace the live database with a backup. Stop the server first.
    Restore { file: PathBuf },
}

#[derive(Subcommand)]
enum NotifyAction {
    /// Send a test message.
    Test {
        #[arg(default_value = "newsdesk test notification")]
        message: String,
    },
    /// Send a digest of the latest headlines.
    Digest,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,sqlx=warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if std::env::var("NEWSDESK_LOG_FORMAT").is_ok_and(|v| v == "json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Commands that don't require config
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "newsdesk", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Health {
            url: Some(url),
            attempts,
            interval_secs,
        } => {
            init_tracing();
            health::run_health_poll(url, *attempts, Duration::from_secs(*interval_secs)).await?;
            return Ok(());
        }
        Commands::Backup {
            action: BackupAction::Verify { file },
        } => {
            init_tracing();
            backup::run_backup_verify(file).await?;
            return Ok(());
        }
        _ => {}
    }

    init_tracing();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { query, dry_run } => {
            ingest::run_ingest(&cfg, query, dry_run).await?;
        }
        Commands::Tag { limit } => {
            tagging::run_tag(&cfg, limit).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending { limit, dry_run } => {
                embed_cmd::run_embed_pending(&cfg, limit, dry_run).await?;
            }
            EmbedAction::Rebuild => {
                embed_cmd::run_embed_rebuild(&cfg).await?;
            }
        },
        Commands::Search {
            query,
            mode,
            category,
            source,
            since,
            limit,
        } => {
            search::run_search(&cfg, &query, &mode, category, source, since, limit).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Health { .. } => {
            health::run_health(&cfg).await?;
        }
        Commands::Backup { action } => match action {
            BackupAction::Create => backup::run_backup_create(&cfg).await?,
            BackupAction::Rotate => backup::run_backup_rotate(&cfg)?,
            BackupAction::Restore { file } => backup::run_backup_restore(&cfg, &file).await?,
            BackupAction::Verify { .. } => {
                // Handled above (before config loading)
                unreachable!()
            }
        },
        Commands::Cleanup { dry_run } => {
            retention::run_cleanup(&cfg, dry_run).await?;
        }
        Commands::Notify { action } => match action {
            NotifyAction::Test { message } => notify::run_notify_test(&cfg, &message).await?,
            NotifyAction::Digest => notify::run_notify_digest(&cfg).await?,
        },
        Commands::Completions { .. } => unreachable!(),
    }

    Ok(())
}
