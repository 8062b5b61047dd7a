use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use event_log::server::TcpServerHandle;
use event_log::EventLog;
use tracing_subscriber::EnvFilter;

const DEFAULT_LISTEN: &str = "127.0.0.1:50061";

/// Serves an existing event log to downstream consumers over gRPC.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "event-log",
    version,
    about = "Serves the audit-sync event log as a pull-based gRPC feed.",
    long_about = None
)]
struct Cli {
    /// Path to the event log database written by audit-sync.
    #[arg(long = "log-db", value_name = "PATH")]
    log_db: PathBuf,

    /// Socket address to listen on.
    #[arg(long, value_name = "ADDR", default_value = DEFAULT_LISTEN)]
    listen: String,

    /// Shared-secret token file used to authenticate feed consumers.
    #[arg(long = "token-file", value_name = "PATH")]
    token_file: Option<PathBuf>,

    /// Tracing filter (info,warn,debug,trace). Can also be provided via EVENT_LOG_LOG.
    #[arg(
        long = "log-level",
        value_name = "FILTER",
        default_value = "info",
        env = "EVENT_LOG_LOG"
    )]
    log_filter: String,
}

#[derive(Debug, Clone)]
struct FeedConfig {
    log_path: PathBuf,
    listen: SocketAddr,
    token_file: PathBuf,
}

impl TryFrom<Cli> for FeedConfig {
    type Error = anyhow::Error;

    fn try_from(args: Cli) -> Result<Self> {
        let listen: SocketAddr = args
            .listen
            .trim()
            .parse()
            .with_context(|| format!("invalid listen address {}", args.listen))?;
        let token_file = match args.token_file {
            Some(path) => expand_home(path)?,
            None => default_token_path()?,
        };
        Ok(Self {
            log_path: expand_home(args.log_db)?,
            listen,
            token_file,
        })
    }
}

fn default_token_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow!("unable to determine home directory"))?;
    Ok(home.join(".audit-sync/feed-token"))
}

fn expand_home(path: PathBuf) -> Result<PathBuf> {
    let as_str = path.to_string_lossy();
    if let Some(stripped) = as_str.strip_prefix("~/") {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("unable to determine home directory"))?;
        return Ok(home.join(stripped));
    }
    Ok(path)
}

fn read_token_file(path: &Path) -> Result<String> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read token file {}", path.display()))?;
    let token = contents.trim().to_string();
    if token.is_empty() {
        bail!("token file {} is empty", path.display());
    }
    Ok(token)
}

fn init_tracing(filter: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(filter).or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to init tracing subscriber: {err}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_filter)?;
    let config = FeedConfig::try_from(cli)?;
    let token = read_token_file(&config.token_file)?;

    // Fail early if the log cannot be opened instead of on the first request.
    let head = EventLog::open(&config.log_path)?.head_offset()?;
    tracing::info!(
        log = %config.log_path.display(),
        listen = %config.listen,
        head_offset = head,
        "event-log feed starting"
    );

    let handle = TcpServerHandle::spawn(config.listen, config.log_path.clone(), token)?;
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down event feed");
    drop(handle);
    Ok(())
}
