use std::sync::Arc;

use clap::Parser;
use quota_proxy::{
    Config, QuotaLimiter, ServerState, SqliteStore, build_client, serve, shutdown_signal,
    spawn_record_purge,
};
use tokio::net::TcpListener;
use tracing::info;

/// Command-line flags. Each one, when given, overrides the config file.
#[derive(Parser, Debug)]
#[command(name = "quota-proxy")]
#[command(about = "Forwarding proxy with a persisted per-client hourly quota")]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address, e.g. ":8080" or "127.0.0.1:8080"
    #[arg(short, long)]
    listen: Option<String>,

    /// Target URL every allowed request is forwarded to
    #[arg(short, long)]
    target: Option<String>,

    /// Access count per hour
    #[arg(long = "ac", visible_alias = "access-count")]
    access_count: Option<u32>,

    /// SQLite database file, or ":memory:"
    #[arg(short, long)]
    database: Option<String>,

    /// Peer allowed to supply X-Forwarded-For (repeatable)
    #[arg(long = "trusted-proxy")]
    trusted_proxies: Vec<String>,

    /// Seconds between sweeps of expired records
    #[arg(long = "purge-interval")]
    purge_interval_secs: Option<u64>,
}

impl Args {
    /// Layers the flags that were given over `config`.
    fn apply(self, mut config: Config) -> Config {
        config.listen = self.listen.or(config.listen);
        config.target = self.target.or(config.target);
        config.access_count = self.access_count.or(config.access_count);
        config.database = self.database.or(config.database);
        config.purge_interval_secs = self.purge_interval_secs.or(config.purge_interval_secs);
        if !self.trusted_proxies.is_empty() {
            config.trusted_proxies = Some(self.trusted_proxies);
        }
        config
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quota_proxy=info".into()),
        )
        .init();

    let mut args = Args::parse();
    let file_config = match args.config.take() {
        Some(path) => Config::load_from_file(&path),
        None => Ok(Config::default()),
    };
    let config = file_config
        .and_then(|c| args.apply(c).into_runtime())
        .unwrap_or_else(|e| {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        });

    let store = SqliteStore::open(&config.database)
        .await
        .unwrap_or_else(|e| {
            eprintln!("fatal: failed to open {}: {e}", config.database);
            std::process::exit(1);
        });

    let limiter = QuotaLimiter::new(Arc::new(store.clone()), config.access_count);

    let listener = TcpListener::bind(config.listen).await.unwrap_or_else(|e| {
        eprintln!("fatal: failed to bind {}: {e}", config.listen);
        std::process::exit(1);
    });

    info!(
        listen = %config.listen,
        target = %config.target,
        access_count = config.access_count,
        database = %config.database,
        https = config.has_https_target(),
        "listening"
    );

    if let Some(interval) = config.purge_interval {
        spawn_record_purge(limiter.clone(), interval);
    }

    let config = Arc::new(config);
    let state = ServerState {
        client: build_client(&config),
        config,
        limiter,
    };

    serve(listener, state, shutdown_signal()).await;
    store.close().await;
}
