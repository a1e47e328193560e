//! Header handling for the relay and the quota decision.
//!
//! The relay passes headers through untouched in both directions, apart
//! from `Host` and the message framing that hyper re-derives for the body it
//! actually streams. Every response that follows a quota decision carries
//! `X-RateLimit-Remaining` and `X-RateLimit-Reset`.

use hyper::header::{HOST, HeaderMap, HeaderValue, TRANSFER_ENCODING};
use hyper::http::uri::Authority;

/// Quota left in the current window. Zero on deny.
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// Whole seconds until the current window resets.
pub const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

/// Proxy-chain header whose first entry identifies the originating client.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Drops `Transfer-Encoding`. hyper frames the outgoing message from the
/// body stream itself; `Content-Length` is kept since the stream is the same
/// length on both legs.
pub fn strip_framing(headers: &mut HeaderMap) {
    headers.remove(TRANSFER_ENCODING);
}

/// Points `Host` at the upstream, replacing whatever the client sent.
pub fn rewrite_host(headers: &mut HeaderMap, upstream: &Authority) {
    if let Ok(value) = HeaderValue::from_str(upstream.as_str()) {
        headers.insert(HOST, value);
    }
}

/// Sets both quota headers, replacing any existing values.
pub fn set_quota_headers(headers: &mut HeaderMap, remaining: i64, reset_secs: i64) {
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(reset_secs));
}

/// Returns a header map holding the quota headers first, followed by every
/// header of `passthrough` in its original order.
///
/// Values that `passthrough` carries under the quota header names are kept
/// as additional values after the proxy's own.
pub fn with_quota_headers(passthrough: &HeaderMap, remaining: i64, reset_secs: i64) -> HeaderMap {
    let mut merged = HeaderMap::with_capacity(passthrough.len() + 2);
    set_quota_headers(&mut merged, remaining, reset_secs);

    passthrough.iter().for_each(|(name, value)| {
        merged.append(name.clone(), value.clone());
    });

    merged
}
