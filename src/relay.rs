//! Forwarding of allowed requests to the fixed upstream.
//!
//! The outbound request keeps the inbound method, body stream, and
//! headers. Its URI is the configured target with the inbound
//! path and query appended verbatim. The upstream response comes back with
//! its status, headers and body stream untouched. There are no
//! retries and no timeout beyond the transport's own.

use std::time::Instant;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{Request, Response, Uri};
use tracing::{debug, info, warn};

use crate::proxy::{BoxBody, HttpClient, StdError};
use crate::{ProxyError, Result, headers};

/// Appends the request target's path and query to `target` without any
/// normalization or re-encoding.
pub fn upstream_uri(target: &str, original: &Uri) -> Result<Uri> {
    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    format!("{target}{path_and_query}")
        .parse::<Uri>()
        .map_err(|e| ProxyError::UpstreamBuild(format!("{target}{path_and_query}: {e}")))
}

/// Sends `req` to `target` and returns the upstream response with its body
/// streamed through.
///
/// `Host` is set to the upstream authority and `Transfer-Encoding` is left
/// to hyper; every other header, including connection-scoped ones, is
/// passed through in order in both directions.
pub async fn forward<B>(req: Request<B>, client: &HttpClient, target: &str) -> Result<Response<BoxBody>>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<StdError>,
{
    let uri = upstream_uri(target, req.uri())?;
    let authority = uri
        .authority()
        .cloned()
        .ok_or_else(|| ProxyError::UpstreamBuild(format!("{uri} has no authority")))?;

    let (mut parts, body) = req.into_parts();
    headers::strip_framing(&mut parts.headers);
    headers::rewrite_host(&mut parts.headers, &authority);
    parts.uri = uri;

    debug!(
        headers = ?parts.headers,
        upstream_uri = %parts.uri,
        "forwarding request"
    );

    let start = Instant::now();
    let proxy_req = Request::from_parts(parts, body.map_err(Into::into).boxed());

    let mut upstream_resp = client.request(proxy_req).await.map_err(|e| {
        warn!(
            error = %e,
            latency_ms = start.elapsed().as_millis() as u64,
            upstream = %authority,
            "upstream request failed"
        );
        ProxyError::Upstream(e)
    })?;

    info!(
        status = upstream_resp.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        upstream = %authority,
        "upstream responded"
    );

    headers::strip_framing(upstream_resp.headers_mut());

    let (parts, body) = upstream_resp.into_parts();
    Ok(Response::from_parts(
        parts,
        body.map_err(|e| -> StdError { Box::new(e) }).boxed(),
    ))
}
