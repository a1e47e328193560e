//! Listener loop, the expired-record sweeper, and signal handling.
//!
//! Lives outside `main()` so integration tests can run the proxy on an
//! ephemeral port and stop it with a plain future.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{BoxBody, HttpClient, QuotaLimiter, RuntimeConfig, boxed_response, handle_request};

/// Everything a connection task needs. Cloned once per accepted connection.
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<RuntimeConfig>,
    pub client: HttpClient,
    pub limiter: QuotaLimiter,
}

/// Serves HTTP/1 on `listener` until `shutdown` completes.
///
/// Each accepted connection gets its own task. Once `shutdown` completes
/// the listener is dropped; connections already handed to a task are left
/// to finish.
pub async fn serve(listener: TcpListener, state: ServerState, shutdown: impl Future<Output = ()>) {
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_connection(stream, peer, state.clone()));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            () = &mut shutdown => {
                info!("listener closed");
                return;
            }
        }
    }
}

/// Drives one client connection. Handler errors become their mapped
/// response so the connection itself never fails on a proxy error.
async fn serve_connection(stream: TcpStream, peer: SocketAddr, state: ServerState) {
    let svc = service_fn(move |req: Request<Incoming>| {
        let ServerState {
            config,
            client,
            limiter,
        } = state.clone();

        async move {
            let resp = match handle_request(req, client, config, &limiter, peer).await {
                Ok(resp) => resp,
                Err(e) => boxed_response(e.into_response()),
            };
            Ok::<Response<BoxBody>, std::convert::Infallible>(resp)
        }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), svc)
        .await
    {
        warn!(%peer, error = %e, "connection closed with error");
    }
}

/// Periodically drops records whose window has ended.
pub fn spawn_record_purge(limiter: QuotaLimiter, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match limiter.purge_expired(Utc::now()).await {
                Ok(0) => {}
                Ok(pruned) => info!(pruned, "expired rate limit records purged"),
                Err(e) => error!(error = %e, "failed to purge expired rate limit records"),
            }
        }
    })
}

/// Resolves on the first SIGINT or SIGTERM (Ctrl+C only, off Unix).
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler must install");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!(signal = "SIGINT", "shutdown requested"),
            _ = term.recv() => info!(signal = "SIGTERM", "shutdown requested"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Ctrl+C handler must install");
        info!(signal = "ctrl-c", "shutdown requested");
    }
}
