use clap::Parser;
use stratumdb::config::{Config, ListenerMode};
use stratumdb::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env first so clap's env fallbacks see variables
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Attempt to load config before initializing logs to pick up log_level from file
    let cfg_file_res = Config::load_from_file(cli.config.as_deref());
    let cfg_file = match &cfg_file_res {
        Ok(c) => c.clone(),
        Err(_) => Config::default(),
    };

    // Determine log filter precedence: CLI (--log-level / STRATUMDB_LOG_LEVEL)
    // > RUST_LOG (env) > config.toml log_level > default("info")
    let filter_spec = if let Some(ref lvl) = cli.log_level {
        lvl.clone()
    } else if let Ok(env_spec) = std::env::var("RUST_LOG") {
        env_spec
    } else if let Some(ref lvl) = cfg_file.log_level {
        lvl.clone()
    } else {
        "info".to_string()
    };

    // Initialize logging with chosen filter
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter_spec))
        .compact()
        .init();

    if let Err(e) = cfg_file_res.as_ref() {
        tracing::warn!(error = %format!("{e:?}"), "invalid config; using defaults");
    }

    let mode = match cli.mode.as_deref() {
        None => None,
        Some("normal") => Some(ListenerMode::Normal),
        Some("proxy") => Some(ListenerMode::Proxy),
        Some("diff") => Some(ListenerMode::Diff),
        Some(other) => anyhow::bail!("unknown mode {other:?}; expected normal, proxy or diff"),
    };

    // Load from config file (if present), then override with CLI/env.
    let cfg = cfg_file.with_overrides(
        cli.listen_addr.clone(),
        cli.data_api_addr.clone(),
        cli.log_level.clone(),
        mode,
        cli.upstream_addr.clone(),
        cli.auth,
    );
    cfg.validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    tracing::info!(listen_addr = %cfg.listen_addr, "starting stratumdb");

    if let Err(e) = server::run(cfg).await {
        tracing::error!(error = %format!("{e:?}"), "server terminated with error");
    }

    Ok(())
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "stratumdb",
    version,
    about = "Document database wire front-end over pluggable storage"
)]
struct Cli {
    /// Path to config TOML file
    #[arg(short = 'c', long = "config", env = "STRATUMDB_CONFIG")]
    config: Option<String>,

    /// Listen address for the wire server (e.g., 127.0.0.1:27017)
    #[arg(long = "listen-addr", env = "STRATUMDB_LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Listen address for the HTTP data api (disabled when unset)
    #[arg(long = "data-api-addr", env = "STRATUMDB_DATA_API_ADDR")]
    data_api_addr: Option<String>,

    /// Log level or filter spec (e.g., info or info,stratumdb=debug)
    #[arg(long = "log-level", env = "STRATUMDB_LOG_LEVEL")]
    log_level: Option<String>,

    /// Listener mode: normal, proxy or diff
    #[arg(long = "mode", env = "STRATUMDB_MODE")]
    mode: Option<String>,

    /// Upstream address for proxy/diff modes (host:port)
    #[arg(long = "upstream-addr", env = "STRATUMDB_UPSTREAM_ADDR")]
    upstream_addr: Option<String>,

    /// Require authentication for data commands
    #[arg(long = "auth", env = "STRATUMDB_AUTH")]
    auth: Option<bool>,
}
