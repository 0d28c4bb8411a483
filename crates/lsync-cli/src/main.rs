use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use lsync_core::{SyncJobType, SyncScope, SyncStatus};
use lsync_storage::PgStore;
use lsync_sync::{build_supervisor, Outcome, StartOptions, SyncConfig, DEFAULT_HISTORY_LIMIT};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "lsync-cli")]
#[command(about = "Legacy sync engine command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScopeArg {
    Full,
    Incremental,
    Subset,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Clean up stale runs, start the scheduler and serve the HTTP control surface.
    Serve,
    /// Run one sync in the foreground and print the final log.
    Run {
        #[arg(value_parser = parse_job_type)]
        job_type: SyncJobType,
        #[arg(long, value_enum, default_value = "full")]
        scope: ScopeArg,
        /// Record ids for a subset scope, comma separated.
        #[arg(long, value_delimiter = ',')]
        ids: Vec<String>,
        /// RFC 3339 lower bound for an incremental scope; defaults to the last completed run.
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        #[arg(long)]
        batch_size: Option<u32>,
        #[arg(long)]
        delay_ms: Option<u64>,
    },
    Status {
        #[arg(value_parser = parse_job_type)]
        job_type: SyncJobType,
    },
    History {
        #[arg(value_parser = parse_job_type)]
        job_type: SyncJobType,
        #[arg(long, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: u32,
    },
    /// Mark runs without recent progress as failed.
    Cleanup {
        #[arg(value_parser = parse_job_type)]
        job_type: Option<SyncJobType>,
    },
    Migrate,
}

fn parse_job_type(raw: &str) -> Result<SyncJobType, String> {
    raw.parse().map_err(|err| format!("{err}"))
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var("LSYNC_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let port = config.web_port;
            let supervisor = build_supervisor(config).await?;
            let cleaned = supervisor.cleanup_stale(None).await?;
            if !cleaned.is_empty() {
                warn!(?cleaned, "stale runs from a previous process marked failed");
            }
            let scheduler = supervisor.maybe_build_scheduler().await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!("scheduler started");
            }
            lsync_web::serve(supervisor, port).await?;
        }
        Commands::Run {
            job_type,
            scope,
            ids,
            since,
            batch_size,
            delay_ms,
        } => {
            let scope = match scope {
                ScopeArg::Full => SyncScope::Full,
                ScopeArg::Incremental => SyncScope::Incremental { since },
                ScopeArg::Subset => SyncScope::Subset { entity_ids: ids },
            };
            let supervisor = build_supervisor(config).await?;
            let options = StartOptions {
                batch_size,
                delay_ms,
                initiated_by: Some("cli".to_string()),
            };
            let log = supervisor.start(job_type, scope, options).await?;
            info!(log_id = log.id, "waiting for sync run to finish");
            let done = supervisor.wait_for(log.id).await?;
            print_json(&done)?;
            if done.status == SyncStatus::Failed {
                bail!(
                    "{job_type} sync {} failed: {}",
                    done.id,
                    done.error_message.as_deref().unwrap_or("no message")
                );
            }
            if Outcome::of(&done) == Outcome::SucceededWithWarnings {
                warn!(errors = done.error_count, "sync completed with record errors");
            }
        }
        Commands::Status { job_type } => {
            let supervisor = build_supervisor(config).await?;
            print_json(&supervisor.status(job_type).await?)?;
        }
        Commands::History { job_type, limit } => {
            let supervisor = build_supervisor(config).await?;
            print_json(&supervisor.history(job_type, limit).await?)?;
        }
        Commands::Cleanup { job_type } => {
            let supervisor = build_supervisor(config).await?;
            let cleaned = supervisor.cleanup_stale(job_type).await?;
            println!("cleanup complete: {} run(s) marked failed {:?}", cleaned.len(), cleaned);
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let store = PgStore::connect(url).await.context("connecting to sync database")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}
