// ABOUTME: CLI entry point for audit-sync
// ABOUTME: Parses commands and routes to appropriate handlers

use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};

use audit_sync::audit::AuditFilter;
use audit_sync::commands;
use audit_sync::config::{AppConfig, Tunables};
use audit_sync::event::{Operation, SourceEngine};
use audit_sync::sync::{SyncStatus, Winner};

#[derive(Parser)]
#[command(name = "audit-sync")]
#[command(about = "Tamper-evident auditing and cross-database sync for PostgreSQL, MySQL and MongoDB", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to audit-sync.toml
    #[arg(long, global = true, env = "AUDIT_SYNC_CONFIG", default_value = "audit-sync.toml")]
    config: PathBuf,
    #[command(flatten)]
    tunables: Tunables,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct FilterArgs {
    /// Only records from this engine (postgres, mysql, mongodb)
    #[arg(long)]
    engine: Option<SourceEngine>,
    #[arg(long)]
    table: Option<String>,
    /// INSERT, UPDATE or DELETE
    #[arg(long)]
    operation: Option<Operation>,
    /// Only records executed by this user id
    #[arg(long)]
    actor: Option<String>,
    /// Executed at or after this RFC 3339 time
    #[arg(long)]
    from: Option<DateTime<Utc>>,
    /// Executed before this RFC 3339 time
    #[arg(long)]
    to: Option<DateTime<Utc>>,
}

impl FilterArgs {
    fn into_filter(self, page: u32, per_page: u32) -> AuditFilter {
        AuditFilter {
            engine: self.engine,
            table: self.table,
            operation: self.operation,
            actor: self.actor,
            from: self.from,
            to: self.to,
            page,
            per_page,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WinnerArg {
    Source,
    Destination,
}

impl From<WinnerArg> for Winner {
    fn from(arg: WinnerArg) -> Self {
        match arg {
            WinnerArg::Source => Winner::Source,
            WinnerArg::Destination => Winner::Destination,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Audit and replicate change notifications until the input ends or Ctrl+C
    Run {
        /// JSON-lines notification feed ("-" for stdin)
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Re-verify checksums (and signatures, when the key is available) of stored audit records
    VerifyAudit,
    /// Show one page of audit records, newest first
    QueryAudit {
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 50)]
        per_page: u32,
    },
    /// Export audit records in compliance format as JSON lines
    ExportCompliance {
        #[command(flatten)]
        filter: FilterArgs,
        /// Write to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Delete audit records older than AUDIT_RETENTION_DAYS
    Evict,
    /// Summarize the sync ledger and list FAILED and CONFLICT records
    SyncStatus {
        /// Only this pair (SOURCE->TARGET)
        #[arg(long)]
        pair: Option<String>,
        /// Only records in this status
        #[arg(long)]
        status: Option<SyncStatus>,
    },
    /// Settle a CONFLICT(MANUAL) record
    Resolve {
        #[arg(long)]
        pair: String,
        #[arg(long)]
        event_id: String,
        #[arg(long, value_enum)]
        winner: WinnerArg,
    },
    /// Re-run a FAILED record
    Retry {
        #[arg(long)]
        pair: String,
        #[arg(long)]
        event_id: String,
    },
    /// Print the last health report written by `run`
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    // 3. Default to "info" if neither are provided
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let load_config = || {
        AppConfig::load(&cli.config)
            .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))
    };

    match cli.command {
        Commands::Run { input } => {
            let config = load_config()?;
            commands::run(commands::run::RunOptions {
                config,
                tunables: cli.tunables,
                input,
            })
            .await
        }
        Commands::VerifyAudit => {
            let config = load_config()?;
            commands::verify_audit(
                &config.audit.store_path,
                config.audit.signing_key_env.as_deref(),
            )
            .map(|_| ())
        }
        Commands::QueryAudit {
            filter,
            page,
            per_page,
        } => {
            let config = load_config()?;
            commands::query_audit(&config.audit.store_path, &filter.into_filter(page, per_page))
        }
        Commands::ExportCompliance { filter, output } => {
            let config = load_config()?;
            let filter = filter.into_filter(1, 0);
            let exported = match output {
                Some(path) => {
                    let file = std::fs::File::create(&path)
                        .with_context(|| format!("Failed to create {}", path.display()))?;
                    commands::export_compliance(&config.audit.store_path, &filter, file)
                }
                None => commands::export_compliance(
                    &config.audit.store_path,
                    &filter,
                    std::io::stdout().lock(),
                ),
            };
            exported.map(|_| ())
        }
        Commands::Evict => {
            let config = load_config()?;
            commands::evict(&config.audit.store_path, cli.tunables.audit_retention_days)
                .map(|_| ())
        }
        Commands::SyncStatus { pair, status } => {
            let config = load_config()?;
            let pair = pair.as_deref().map(commands::parse_pair).transpose()?;
            commands::sync_status(&config.runtime.ledger_path, pair.as_ref(), status).await
        }
        Commands::Resolve {
            pair,
            event_id,
            winner,
        } => {
            let config = load_config()?;
            let pair = commands::parse_pair(&pair)?;
            commands::resolve_conflict(config, cli.tunables, &pair, &event_id, winner.into())
                .await
                .map(|_| ())
        }
        Commands::Retry { pair, event_id } => {
            let config = load_config()?;
            let pair = commands::parse_pair(&pair)?;
            commands::retry_failed(config, cli.tunables, &pair, &event_id)
                .await
                .map(|_| ())
        }
        Commands::Health => {
            let config = load_config()?;
            commands::health(&config.runtime.health_path).map(|_| ())
        }
    }
}
