//! Dynamic per-SNI leaf-certificate resolution, wiring [`Ca`] into rustls
//! via rama's TLS acceptor types (spec §4.1 / §4.2).
//!
//! Grounded on `examples/tls_rustls_dynamic_certs.rs`'s `DynamicIssuer`: a
//! `ResolvesServerCert` whose `resolve` reads the SNI name off the incoming
//! `ClientHello` and mints (or reuses) a leaf for it.

use std::sync::Arc;

use rama::tls::rustls::RamaFrom;
use rama::tls::rustls::dep::rustls::crypto::aws_lc_rs;
use rama::tls::rustls::dep::rustls::server::{ClientHello, ResolvesServerCert};
use rama::tls::rustls::dep::rustls::sign::CertifiedKey;
use rama::tls::rustls::dep::rustls::{ALL_VERSIONS, ServerConfig};
use rama::tls::rustls::server::{TlsAcceptorData, TlsAcceptorDataBuilder};

use crate::ca::Ca;
use crate::error::{ErrorContext, OpaqueError};

/// Resolves a fresh (or cached) leaf certificate for whatever hostname the
/// client's ClientHello names, falling back to the root's own name when no
/// SNI was sent at all.
#[derive(Debug, Clone)]
struct DynamicLeafResolver {
    ca: Ca,
}

impl ResolvesServerCert for DynamicLeafResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let client_hello = rama::net::tls::client::ClientHello::rama_from(client_hello);
        let server_name = client_hello.ext_server_name().unwrap_or("marasi.invalid");
        match self.ca.mint_leaf(server_name) {
            Ok(certified) => Some(certified),
            Err(err) => {
                tracing::error!(error = %err, server_name, "minting leaf certificate failed");
                None
            }
        }
    }
}

/// Build the acceptor data shared by the protocol-mux listener (spec §4.2)
/// and the CONNECT-tunnel upgrade handler (spec §4.5 step 2 / §4.7): same
/// resolver, same ALPN negotiation, so either entry point into a MITM'd
/// connection produces an identical leaf for a given server name.
pub fn build_acceptor_data(ca: Ca) -> Result<TlsAcceptorData, OpaqueError> {
    // aws-lc-rs is used directly so the process-wide default crypto
    // provider is installed once, matching rcgen's aws_lc_rs feature.
    let _ = aws_lc_rs::default_provider();

    let resolver = Arc::new(DynamicLeafResolver { ca });
    let config = ServerConfig::builder_with_protocol_versions(ALL_VERSIONS)
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    Ok(TlsAcceptorDataBuilder::from(config)
        .with_alpn_protocols_http_auto()
        .with_env_key_logger()
        .context("configure tls keylogger")?
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_acceptor_data_from_a_fresh_ca() {
        let dir = tempfile::tempdir().unwrap();
        let ca = Ca::get_or_create_root(dir.path()).await.unwrap();
        build_acceptor_data(ca).expect("acceptor data should build from a valid ca");
    }
}
