//! Shared test infrastructure for integration tests.
//!
//! Provides throwaway HTTP backends, configuration builders, client
//! constructors, and store doubles used across all integration test
//! modules.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use quota_proxy::{
    BoxBody, Config, HttpClient, ProxyError, QuotaLimiter, RateLimitRecord, RecordStore, Result,
    RuntimeConfig, SqliteStore, build_client,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// A synthetic client address used in all test invocations.
const TEST_CLIENT_ADDR: &str = "192.168.1.100:54321";

/// Initializes a tracing subscriber for test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

pub fn test_addr() -> SocketAddr {
    TEST_CLIENT_ADDR.parse().unwrap()
}

/// Builds a `RuntimeConfig` targeting the given local backend address,
/// backed by an in-memory database.
pub fn test_config(addr: SocketAddr) -> Arc<RuntimeConfig> {
    test_config_with_quota(addr, 1000)
}

pub fn test_config_with_quota(addr: SocketAddr, access_count: u32) -> Arc<RuntimeConfig> {
    Arc::new(
        Config {
            listen: Some("127.0.0.1:0".into()),
            target: Some(format!("http://{addr}")),
            access_count: Some(access_count),
            database: Some(":memory:".into()),
            ..Default::default()
        }
        .into_runtime()
        .expect("test config must be valid"),
    )
}

pub fn test_client(config: &RuntimeConfig) -> HttpClient {
    build_client(config)
}

/// Builds a limiter over a fresh in-memory store.
pub async fn test_limiter(quota: u32) -> QuotaLimiter {
    let store = SqliteStore::in_memory()
        .await
        .expect("in-memory store must open");
    QuotaLimiter::new(Arc::new(store), quota)
}

/// Collects a [`BoxBody`] into [`Bytes`], mapping any body error to a
/// descriptive panic so test assertions remain concise.
pub async fn collect_body(body: BoxBody) -> Bytes {
    body.collect()
        .await
        .expect("failed to collect response body")
        .to_bytes()
}

/// Reads a header as a string, panicking if it is missing.
pub fn header_str<'a>(resp: &'a Response<BoxBody>, name: &str) -> &'a str {
    resp.headers()
        .get(name)
        .unwrap_or_else(|| panic!("missing {name} header"))
        .to_str()
        .expect("header must be visible ASCII")
}

/// An address nothing is listening on.
pub async fn unreachable_addr() -> SocketAddr {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind probe listener");
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Accept loop shared by every throwaway backend: serves each connection
/// with `service` until the returned sender fires or is dropped.
async fn spawn_backend<F, Fut>(handler: F) -> (SocketAddr, oneshot::Sender<()>)
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let (tx, rx) = oneshot::channel::<()>();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let handler = handler.clone();
                    let service = service_fn(move |req: Request<Incoming>| {
                        let fut = handler(req);
                        async move { Ok::<_, std::convert::Infallible>(fut.await) }
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, tx)
}

/// Starts a local HTTP server that responds to every request with the given
/// status, content-type, and body. Returns the server address and a handle
/// to shut it down.
pub async fn start_backend(
    status: StatusCode,
    content_type: &'static str,
    body: &'static str,
) -> (SocketAddr, oneshot::Sender<()>) {
    spawn_backend(move |_req| async move {
        Response::builder()
            .status(status)
            .header("content-type", content_type)
            .body(Full::new(Bytes::from(body)))
            .expect("test response must build")
    })
    .await
}

/// Like [`start_backend`], but counts the requests that reach it.
pub async fn start_counting_backend() -> (SocketAddr, Arc<AtomicUsize>, oneshot::Sender<()>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    let (addr, tx) = spawn_backend(move |_req| {
        counter.fetch_add(1, Ordering::SeqCst);
        async {
            Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from("counted")))
                .expect("test response must build")
        }
    })
    .await;

    (addr, hits, tx)
}

/// Starts a local backend that echoes the request line, headers, and body.
///
/// The body has the form `METHOD PATH_AND_QUERY\nname: value\n...\n\nBODY`,
/// with header lines in wire order. The response also carries two
/// `x-multi` values, a `server` header and a `keep-alive` header.
pub async fn start_echo_backend() -> (SocketAddr, oneshot::Sender<()>) {
    spawn_backend(|req: Request<Incoming>| async move {
        let (parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .map(|c| c.to_bytes())
            .unwrap_or_default();

        let mut echo = format!(
            "{} {}\n",
            parts.method,
            parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
        );
        for (name, value) in &parts.headers {
            echo.push_str(&format!(
                "{}: {}\n",
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes())
            ));
        }
        echo.push('\n');
        echo.push_str(&String::from_utf8_lossy(&body));

        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain")
            .header("x-multi", "one")
            .header("x-multi", "two")
            .header("server", "echo/1.0")
            .header("keep-alive", "timeout=5")
            .body(Full::new(Bytes::from(echo)))
            .expect("test response must build")
    })
    .await
}

/// A [`RecordStore`] whose every operation fails.
#[derive(Debug, Default)]
pub struct FailingStore;

#[async_trait]
impl RecordStore for FailingStore {
    async fn load(&self, _identity: &str) -> Result<Option<RateLimitRecord>> {
        Err(ProxyError::Storage("database is locked".into()))
    }

    async fn save(&self, _record: &RateLimitRecord) -> Result<()> {
        Err(ProxyError::Storage("database is locked".into()))
    }

    async fn purge_expired(&self, _cutoff: i64) -> Result<u64> {
        Err(ProxyError::Storage("database is locked".into()))
    }
}
