//! Per-request entry point: identify the client, enforce its quota, relay.
//!
//! Every inbound request is assigned a monotonically increasing request ID
//! and wrapped in a [`tracing::Span`] carrying structured fields for
//! observability.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::{Instrument, debug, error, warn};

use crate::{ProxyError, QuotaLimiter, Result, RuntimeConfig, headers, identity, relay, tls};

/// An alias to simplify the calls to `Box<dyn std::error::Error + Send + Sync>`.
pub type StdError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased body used for both request forwarding and response streaming.
///
/// Lets the handler accept requests with arbitrary body types (e.g.
/// `Incoming`, `Full<Bytes>`, `Empty<Bytes>`) and return a uniform response
/// type whether the body came from the upstream or was generated locally.
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, StdError>;

/// The HTTP client used for the upstream leg. Handles both `http://` and
/// `https://` targets.
pub type HttpClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, BoxBody>;

/// Global monotonic counter for assigning unique request IDs.
static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Constructs the pooled upstream client.
pub fn build_client(config: &RuntimeConfig) -> HttpClient {
    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(config.pool_idle_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .build(tls::build_https_connector())
}

/// Converts a locally generated response into the uniform [`BoxBody`] form.
pub fn boxed_response(resp: Response<Full<Bytes>>) -> Response<BoxBody> {
    resp.map(|b| b.map_err(|never| -> StdError { match never {} }).boxed())
}

/// Processes a single inbound request.
///
/// 1. **Identity**: The client key is the first `X-Forwarded-For` entry
///    when the peer is trusted to send one, else the peer IP.
/// 2. **Quota check**: The key is checked against its hourly window. A
///    store failure is returned as [`ProxyError::Storage`]; an exhausted
///    quota as [`ProxyError::QuotaExceeded`]. Neither is forwarded.
/// 3. **Relay**: Allowed requests are forwarded to the upstream and the
///    response streamed back. A relay failure becomes a 500 response.
/// 4. **Quota headers**: `X-RateLimit-Remaining` and `X-RateLimit-Reset`
///    are attached to whatever response the relay step produced.
pub async fn handle_request<B>(
    req: Request<B>,
    client: HttpClient,
    config: Arc<RuntimeConfig>,
    limiter: &QuotaLimiter,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody>>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<StdError>,
{
    let request_id = REQUEST_ID.fetch_add(1, Ordering::Relaxed);

    let span = tracing::info_span!(
        "request",
        id = request_id,
        method = %req.method(),
        uri = %req.uri(),
        client = %client_addr,
    );

    async move {
        let key = identity::client_key(req.headers(), client_addr, &config.trusted_proxies);

        let decision = limiter.check_now(&key).await.inspect_err(|e| {
            error!(client_key = %key, error = %e, "quota check failed");
        })?;

        if !decision.allowed {
            warn!(
                client_key = %key,
                reset_secs = decision.reset_secs,
                "rate limit exceeded"
            );
            return Err(ProxyError::QuotaExceeded {
                reset_secs: decision.reset_secs,
            });
        }

        debug!(
            client_key = %key,
            remaining = decision.remaining,
            reset_secs = decision.reset_secs,
            "request allowed"
        );

        let mut response = match relay::forward(req, &client, &config.target).await {
            Ok(resp) => resp,
            Err(e) => boxed_response(e.into_response()),
        };

        let merged =
            headers::with_quota_headers(response.headers(), decision.remaining, decision.reset_secs);
        *response.headers_mut() = merged;

        Ok(response)
    }
    .instrument(span)
    .await
}
