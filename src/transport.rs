//! Upstream transport & CA endpoint (spec §4.7): dial the target, perform a
//! client TLS handshake that blends in with ordinary browser traffic, and
//! hand the response back to the pipeline. A synthetic `marasi.cert`
//! endpoint short-circuits all of that and serves the root CA certificate
//! instead of dialing anywhere.
//!
//! Grounded on `examples/http_mitm_proxy_rustls.rs`'s `http_mitm_proxy`:
//! a fresh [`EasyHttpWebClient`] per call, configured with a
//! [`TlsConnectorDataBuilder`] that disables upstream certificate
//! verification (the proxy impersonates the browser; validating the
//! origin's certificate is the browser's job, not ours) and fixes ALPN.

use rama::error::{BoxError, ErrorContext as RamaErrorContext};
use rama::http::client::{EasyHttpWebClient, TlsConnectorConfig};
use rama::http::{Body, Request, Response, StatusCode};
use rama::net::tls::ApplicationProtocol;
use rama::tls::rustls::client::TlsConnectorDataBuilder;
use rama::{Context, Service};

use crate::ca::Ca;
use crate::error::{ErrorContext, OpaqueError};

/// Host serving the root CA certificate for download (spec §4.7).
pub const CA_ENDPOINT_HOST: &str = "marasi.cert";

/// Upstream dial is pinned to HTTP/1.1: HTTP/2 upstream is explicitly out
/// of scope (spec §4.7).
fn upstream_client() -> Result<EasyHttpWebClient, OpaqueError> {
    let mut client = EasyHttpWebClient::default();

    let data = TlsConnectorDataBuilder::new()
        .with_no_cert_verifier()
        .with_alpn_protocols(&[ApplicationProtocol::HTTP_11])
        .with_env_key_logger()
        .context("configure upstream tls keylogger")?
        .build();

    client.set_tls_connector_config(TlsConnectorConfig::Rustls(Some(data)));
    Ok(client)
}

/// `true` if `req` targets the synthetic CA-download endpoint rather than a
/// real upstream (spec §4.7: `http://marasi.cert` and `http://marasi.cert/`).
#[must_use]
pub fn is_ca_endpoint(req: &Request<Body>) -> bool {
    req.uri().host() == Some(CA_ENDPOINT_HOST)
        && matches!(req.uri().path(), "" | "/")
}

/// Serve the root CA certificate in DER, with the headers a browser/OS
/// trust-store import expects (spec §4.7).
pub fn serve_ca_certificate(ca: &Ca) -> Response<Body> {
    let der = ca.root_cert_der().as_ref().to_vec();
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/x-x509-ca-cert")
        .header(
            "content-disposition",
            "attachment; filename=\"marasi-cert.der\"",
        )
        .body(Body::from(der))
        .expect("static headers and a byte body always build a valid response")
}

/// Dial `req`'s target and return its response, or serve the CA certificate
/// directly if `req` targets the synthetic endpoint (spec §4.7).
pub async fn dispatch(
    ctx: Context<()>,
    req: Request<Body>,
    ca: &Ca,
) -> Result<Response<Body>, BoxError> {
    if is_ca_endpoint(&req) {
        return Ok(serve_ca_certificate(ca));
    }

    let client = upstream_client().map_err(BoxError::from)?;
    client.serve(ctx, req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_the_ca_endpoint_with_and_without_trailing_slash() {
        let bare = Request::builder()
            .uri("http://marasi.cert")
            .body(Body::empty())
            .unwrap();
        let slash = Request::builder()
            .uri("http://marasi.cert/")
            .body(Body::empty())
            .unwrap();
        let other = Request::builder()
            .uri("http://marasi.cert/download")
            .body(Body::empty())
            .unwrap();
        let unrelated = Request::builder()
            .uri("http://example.test/")
            .body(Body::empty())
            .unwrap();

        assert!(is_ca_endpoint(&bare));
        assert!(is_ca_endpoint(&slash));
        assert!(!is_ca_endpoint(&other));
        assert!(!is_ca_endpoint(&unrelated));
    }

    #[tokio::test]
    async fn serves_der_with_download_headers() {
        let dir = tempfile::tempdir().unwrap();
        let ca = Ca::get_or_create_root(dir.path()).await.unwrap();

        let res = serve_ca_certificate(&ca);
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            res.headers().get("content-type").unwrap(),
            "application/x-x509-ca-cert"
        );
        assert!(
            res.headers()
                .get("content-disposition")
                .unwrap()
                .to_str()
                .unwrap()
                .contains("marasi-cert.der")
        );
    }
}
