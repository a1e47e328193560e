//! TLS origination for `https://` upstreams.
//!
//! The proxy itself listens on plain HTTP; only the proxy -> upstream leg
//! may be encrypted. Server certificates are verified against the Mozilla
//! root store shipped in [`webpki_roots`].

use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::HttpConnector;

/// Builds a connector for outbound connections to the upstream.
///
/// The resulting connector supports both `http://` and `https://` schemes;
/// plain HTTP connections pass through unmodified.
pub fn build_https_connector() -> hyper_rustls::HttpsConnector<HttpConnector> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .build()
}
