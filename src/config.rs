//! Configuration loading, validation, and pre-parsed runtime state.
//!
//! The proxy reads its optional YAML configuration exactly once at startup.
//! Command-line flags are layered over the file values, and the merged
//! result is validated into a [`RuntimeConfig`] that request handlers use
//! without further parsing.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use hyper::Uri;
use serde::{Deserialize, Serialize};

use crate::identity::TrustedProxies;
use crate::{ProxyError, Result};

/// Default bind address. `:PORT` binds every IPv4 interface.
pub const DEFAULT_LISTEN_ADDR: &str = ":8080";

/// Default upstream that all allowed traffic is forwarded to.
pub const DEFAULT_TARGET: &str = "https://dcard.tw";

/// Default number of requests each client may make per window.
pub const DEFAULT_ACCESS_COUNT: u32 = 1000;

/// Default SQLite database file holding the rate-limit records.
pub const DEFAULT_DATABASE: &str = "limiter.db";

/// Default idle timeout for pooled upstream connections.
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default cap on idle upstream connections per host.
pub const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 32;

/// On-disk YAML schema.
///
/// Every field is optional; unset fields fall back to the defaults above
/// when the config is turned into a [`RuntimeConfig`].
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Address the proxy listens on (default `":8080"`).
    #[serde(default)]
    pub listen: Option<String>,
    /// Upstream base URL (default `"https://dcard.tw"`).
    #[serde(default)]
    pub target: Option<String>,
    /// Requests allowed per client per hour (default: 1000).
    #[serde(default)]
    pub access_count: Option<u32>,
    /// SQLite database path, or `":memory:"` (default `"limiter.db"`).
    #[serde(default)]
    pub database: Option<String>,
    /// Peer addresses allowed to supply `X-Forwarded-For`. When absent,
    /// every peer is trusted.
    #[serde(default)]
    pub trusted_proxies: Option<Vec<String>>,
    /// Seconds between sweeps of expired records. When absent, records are
    /// kept forever.
    #[serde(default)]
    pub purge_interval_secs: Option<u64>,
    /// Idle timeout in milliseconds for pooled upstream connections
    /// (default: 60000).
    #[serde(default)]
    pub pool_idle_timeout_ms: Option<u64>,
    /// Cap on idle upstream connections per host (default: 32).
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

/// Fully validated, ready-to-use configuration.
///
/// Built once in `main` and handed to every connection behind an `Arc`.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Bound address, with the `:PORT` shorthand already expanded.
    pub listen: SocketAddr,
    /// Upstream base URL exactly as configured; request targets are appended
    /// to it verbatim.
    pub target: String,
    /// Parsed form of `target`, used for the authority and scheme.
    pub target_uri: Uri,
    /// Requests allowed per client per window. Zero denies every new client.
    pub access_count: u32,
    /// SQLite database path.
    pub database: String,
    /// Which peers may supply `X-Forwarded-For`.
    pub trusted_proxies: TrustedProxies,
    /// Interval between expired-record sweeps. `None` disables sweeping.
    pub purge_interval: Option<Duration>,
    /// How long an unused upstream connection stays pooled.
    pub pool_idle_timeout: Duration,
    /// Cap on idle upstream connections per host.
    pub pool_max_idle_per_host: usize,
}

/// Parses a listen address, accepting the `:PORT` shorthand for all IPv4
/// interfaces.
fn parse_listen(listen: &str) -> Result<SocketAddr> {
    let expanded = match listen.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => listen.to_owned(),
    };

    expanded
        .parse::<SocketAddr>()
        .map_err(|e| ProxyError::Config(format!("invalid listen address \"{listen}\": {e}")))
}

/// Validates the upstream base URL, returning its parsed form.
fn validate_target(target: &str) -> Result<Uri> {
    if target.is_empty() {
        return Err(ProxyError::InvalidUpstream(
            "target URL must not be empty".into(),
        ));
    }

    let uri = target
        .parse::<Uri>()
        .map_err(|e| ProxyError::InvalidUpstream(format!("{target}: {e}")))?;

    match uri.scheme_str() {
        Some(scheme) if scheme.eq_ignore_ascii_case("http") => {}
        Some(scheme) if scheme.eq_ignore_ascii_case("https") => {}
        _ => {
            return Err(ProxyError::InvalidUpstream(format!(
                "target URL must use http or https: {target}"
            )));
        }
    }

    uri.authority().ok_or_else(|| {
        ProxyError::InvalidUpstream(format!("target URL has no authority: {target}"))
    })?;

    Ok(uri)
}

fn parse_trusted_proxies(proxies: Option<Vec<String>>) -> Result<TrustedProxies> {
    let Some(proxies) = proxies else {
        return Ok(TrustedProxies::Any);
    };

    proxies
        .iter()
        .map(|addr| {
            addr.trim().parse::<IpAddr>().map_err(|e| {
                ProxyError::Config(format!("invalid trusted proxy address \"{addr}\": {e}"))
            })
        })
        .collect::<Result<Vec<_>>>()
        .map(TrustedProxies::Only)
}

impl Config {
    /// Reads and deserializes the YAML file at `file_path`. Any I/O or
    /// parse failure is a [`ProxyError::Config`].
    pub fn load_from_file(file_path: &(impl AsRef<Path> + ?Sized)) -> Result<Self> {
        let file = std::fs::File::open(file_path).map_err(|e| {
            ProxyError::Config(format!(
                "failed to open {}: {e}",
                file_path.as_ref().display()
            ))
        })?;

        serde_yaml::from_reader(file)
            .map_err(|e| ProxyError::Config(format!("invalid YAML: {e}")))
    }

    /// Validates all fields, producing a [`RuntimeConfig`] suitable for the
    /// request hot path.
    pub fn into_runtime(self) -> Result<RuntimeConfig> {
        let listen = parse_listen(self.listen.as_deref().unwrap_or(DEFAULT_LISTEN_ADDR))?;

        let target = self.target.unwrap_or_else(|| DEFAULT_TARGET.to_owned());
        let target_uri = validate_target(&target)?;

        let access_count = self.access_count.unwrap_or(DEFAULT_ACCESS_COUNT);

        let database = self
            .database
            .unwrap_or_else(|| DEFAULT_DATABASE.to_owned());
        if database.is_empty() {
            return Err(ProxyError::Config("database path must not be empty".into()));
        }

        let trusted_proxies = parse_trusted_proxies(self.trusted_proxies)?;

        let purge_interval = match self.purge_interval_secs {
            Some(0) => {
                return Err(ProxyError::Config(
                    "purge interval must be positive".into(),
                ));
            }
            other => other.map(Duration::from_secs),
        };

        let pool_idle_timeout = self
            .pool_idle_timeout_ms
            .map_or(DEFAULT_POOL_IDLE_TIMEOUT, Duration::from_millis);

        let pool_max_idle_per_host = self
            .pool_max_idle_per_host
            .unwrap_or(DEFAULT_POOL_MAX_IDLE_PER_HOST);

        Ok(RuntimeConfig {
            listen,
            target,
            target_uri,
            access_count,
            database,
            trusted_proxies,
            purge_interval,
            pool_idle_timeout,
            pool_max_idle_per_host,
        })
    }
}

impl RuntimeConfig {
    /// Returns `true` if the upstream uses the HTTPS scheme.
    pub fn has_https_target(&self) -> bool {
        self.target_uri
            .scheme_str()
            .is_some_and(|s| s.eq_ignore_ascii_case("https"))
    }
}
