//!
//! A transparent HTTP forwarding proxy that enforces a persisted, per-client
//! hourly request quota before relaying traffic to a single upstream, built
//! on [Hyper].
//!
//! [Hyper]: https://hyper.rs/

pub mod config;
pub mod error;
pub mod headers;
pub mod identity;
pub mod proxy;
pub mod rate_limit;
pub mod relay;
pub mod server;
pub mod store;
pub mod tls;

pub use config::{Config, RuntimeConfig};
pub use error::{ProxyError, Result};
pub use identity::TrustedProxies;
pub use proxy::{BoxBody, HttpClient, boxed_response, build_client, handle_request};
pub use rate_limit::{Decision, QuotaLimiter};
pub use server::{ServerState, serve, shutdown_signal, spawn_record_purge};
pub use store::{RateLimitRecord, RecordStore, SqliteStore};
