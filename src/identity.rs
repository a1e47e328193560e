//! Client identity resolution.
//!
//! Every request is bucketed under a single string key. The first entry of
//! `X-Forwarded-For` wins when present; otherwise the transport peer's IP is
//! used. Forwarded values are taken as-is without address validation, so
//! the header is spoofable by any peer allowed to send it. The
//! [`TrustedProxies`] policy narrows which peers that is.

use std::net::{IpAddr, SocketAddr};

use hyper::header::HeaderMap;

use crate::headers::X_FORWARDED_FOR;

/// Which immediate peers may supply `X-Forwarded-For`.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum TrustedProxies {
    /// Honor the header from every peer.
    #[default]
    Any,
    /// Honor the header only from the listed peer addresses.
    Only(Vec<IpAddr>),
}

impl TrustedProxies {
    /// Returns `true` if `peer` may supply a forwarded client address.
    pub fn trusts(&self, peer: &IpAddr) -> bool {
        match self {
            Self::Any => true,
            Self::Only(allowed) => allowed.contains(peer),
        }
    }
}

/// Derives the rate-limit key for a request.
pub fn client_key(headers: &HeaderMap, peer: SocketAddr, trusted: &TrustedProxies) -> String {
    trusted
        .trusts(&peer.ip())
        .then(|| forwarded_client(headers))
        .flatten()
        .unwrap_or_else(|| peer.ip().to_string())
}

/// Separator between `X-Forwarded-For` entries. Entries joined any other
/// way stay a single entry.
const ENTRY_SEPARATOR: &str = ", ";

/// Returns the first entry of the first `X-Forwarded-For` value, verbatim,
/// unless it is empty.
fn forwarded_client(headers: &HeaderMap) -> Option<String> {
    headers
        .get(X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|chain| chain.split(ENTRY_SEPARATOR).next())
        .filter(|first| !first.is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn peer() -> SocketAddr {
        "10.1.2.3:40000".parse().unwrap()
    }

    fn with_xff(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn falls_back_to_peer_ip_without_header() {
        let key = client_key(&HeaderMap::new(), peer(), &TrustedProxies::Any);
        assert_eq!(key, "10.1.2.3");
    }

    #[test]
    fn uses_first_forwarded_entry() {
        let key = client_key(&with_xff("1.2.3.4, 5.6.7.8"), peer(), &TrustedProxies::Any);
        assert_eq!(key, "1.2.3.4");
    }

    #[test]
    fn comma_without_space_does_not_split_entries() {
        let key = client_key(&with_xff("1.2.3.4,5.6.7.8"), peer(), &TrustedProxies::Any);
        assert_eq!(key, "1.2.3.4,5.6.7.8");
    }

    #[test]
    fn first_entry_is_not_trimmed() {
        let key = client_key(&with_xff(" 1.2.3.4, 5.6.7.8"), peer(), &TrustedProxies::Any);
        assert_eq!(key, " 1.2.3.4");
    }

    #[test]
    fn empty_first_entry_falls_back_to_peer() {
        let key = client_key(&with_xff(", 5.6.7.8"), peer(), &TrustedProxies::Any);
        assert_eq!(key, "10.1.2.3");

        let key = client_key(&with_xff(""), peer(), &TrustedProxies::Any);
        assert_eq!(key, "10.1.2.3");
    }

    #[test]
    fn malformed_entries_are_taken_verbatim() {
        let key = client_key(&with_xff("not-an-ip, 1.1.1.1"), peer(), &TrustedProxies::Any);
        assert_eq!(key, "not-an-ip");
    }

    #[test]
    fn ipv6_peer_is_rendered_without_brackets_or_port() {
        let peer: SocketAddr = "[2001:db8::1]:8080".parse().unwrap();
        let key = client_key(&HeaderMap::new(), peer, &TrustedProxies::Any);
        assert_eq!(key, "2001:db8::1");
    }

    #[test]
    fn untrusted_peer_cannot_supply_forwarded_address() {
        let trusted = TrustedProxies::Only(vec!["127.0.0.1".parse().unwrap()]);
        let key = client_key(&with_xff("1.2.3.4"), peer(), &trusted);
        assert_eq!(key, "10.1.2.3");
    }

    #[test]
    fn trusted_peer_supplies_forwarded_address() {
        let trusted = TrustedProxies::Only(vec!["10.1.2.3".parse().unwrap()]);
        let key = client_key(&with_xff("1.2.3.4"), peer(), &trusted);
        assert_eq!(key, "1.2.3.4");
    }
}
