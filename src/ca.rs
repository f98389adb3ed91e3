//! Certificate Authority: issues the long-lived root used to MITM TLS
//! connections, and mints per-server-name leaf certificates on demand
//! (spec §4.1).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use rama::tls::rustls::dep::rustls::crypto::aws_lc_rs;
use rama::tls::rustls::dep::rustls::sign::CertifiedKey;
use rcgen::{CertificateParams, DistinguishedName, DnType, Ia5String, Issuer, KeyPair, SanType};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivatePkcs8KeyDer};

use crate::error::{ErrorContext, OpaqueError};

const ROOT_CERT_FILE: &str = "marasi_cert.pem";
const ROOT_KEY_FILE: &str = "marasi_key.pem";
const ROOT_COMMON_NAME: &str = "Marasi";
const ROOT_ORGANIZATION: &str = "Marasi Authority";
const ROOT_VALIDITY_YEARS: i32 = 3;
const LEAF_VALIDITY_DAYS: u64 = 90;

/// The root CA certificate and the leaf-minting machinery built on top of
/// it. Cheap to clone: everything that matters is behind an `Arc`.
#[derive(Clone)]
pub struct Ca(Arc<Inner>);

struct Inner {
    root_cert_der: CertificateDer<'static>,
    root_cert_pem: String,
    root_params: CertificateParams,
    root_key: KeyPair,
    leaf_cache: Mutex<HashMap<String, Arc<CertifiedKey>>>,
}

impl Ca {
    /// Load the root CA from `dir` if both `marasi_cert.pem` and
    /// `marasi_key.pem` exist and parse, otherwise generate a fresh one and
    /// persist it there (spec §4.1).
    ///
    /// Refuses to start up if a loaded root has already expired, rather
    /// than silently forging leaves whose chain of trust is already
    /// invalid (spec §3 Root-CA material invariant).
    pub async fn get_or_create_root(dir: impl AsRef<Path>) -> Result<Self, OpaqueError> {
        let dir = dir.as_ref().to_path_buf();
        let cert_path = dir.join(ROOT_CERT_FILE);
        let key_path = dir.join(ROOT_KEY_FILE);

        if let Some(inner) = Self::try_load(&cert_path, &key_path).await? {
            inner.check_not_expired()?;
            return Ok(Self(Arc::new(inner)));
        }

        let inner = Self::generate()?;
        Self::persist(&dir, &cert_path, &key_path, &inner).await?;
        Ok(Self(Arc::new(inner)))
    }

    async fn try_load(cert_path: &Path, key_path: &Path) -> Result<Option<Inner>, OpaqueError> {
        let (cert_pem, key_pem) = match (
            tokio::fs::read_to_string(cert_path).await,
            tokio::fs::read_to_string(key_path).await,
        ) {
            (Ok(c), Ok(k)) => (c, k),
            _ => return Ok(None),
        };

        let key_pair = KeyPair::from_pem(&key_pem).context("parse root key from pem")?;
        let params =
            CertificateParams::from_ca_cert_pem(&cert_pem).context("parse root cert from pem")?;
        let root_cert_der = pem_to_der(&cert_pem).context("decode root cert pem to der")?;

        Ok(Some(Inner {
            root_cert_der,
            root_cert_pem: cert_pem,
            root_params: params,
            root_key: key_pair,
            leaf_cache: Mutex::new(HashMap::new()),
        }))
    }

    fn generate() -> Result<Inner, OpaqueError> {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, ROOT_COMMON_NAME);
        dn.push(DnType::OrganizationName, ROOT_ORGANIZATION);

        let mut params =
            CertificateParams::default();
        params.distinguished_name = dn;
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::CrlSign,
            rcgen::KeyUsagePurpose::DigitalSignature,
        ];
        let not_before = SystemTime::now();
        params.not_before = not_before.into();
        params.not_after = (not_before + Duration::from_secs(60 * 60 * 24 * 365 * ROOT_VALIDITY_YEARS as u64)).into();

        let key_pair = KeyPair::generate().context("generate root key pair")?;
        let cert = params
            .clone()
            .self_signed(&key_pair)
            .context("self-sign root certificate")?;

        let cert_pem = cert.pem();
        let root_cert_der = cert.der().clone();

        Ok(Inner {
            root_cert_der,
            root_cert_pem: cert_pem,
            root_params: params,
            root_key: key_pair,
            leaf_cache: Mutex::new(HashMap::new()),
        })
    }

    async fn persist(
        dir: &Path,
        cert_path: &Path,
        key_path: &Path,
        inner: &Inner,
    ) -> Result<(), OpaqueError> {
        tokio::fs::create_dir_all(dir)
            .await
            .context("create ca directory")?;

        // Write to temp files first and rename into place, so a reader never
        // observes a cert without its matching key (spec §3 invariant).
        let cert_tmp = cert_path.with_extension("pem.tmp");
        let key_tmp = key_path.with_extension("pem.tmp");

        write_private(&cert_tmp, inner.root_cert_pem.as_bytes())
            .await
            .context("write root cert")?;
        write_private(&key_tmp, inner.root_key.serialize_pem().as_bytes())
            .await
            .context("write root key")?;

        tokio::fs::rename(&cert_tmp, cert_path)
            .await
            .context("publish root cert")?;
        tokio::fs::rename(&key_tmp, key_path)
            .await
            .context("publish root key")?;

        Ok(())
    }

    fn check_not_expired(&self) -> Result<(), OpaqueError> {
        let now = jiff::Timestamp::now();
        let not_after = &self.0.root_params.not_after;
        let not_after = jiff::Timestamp::from_second(not_after.unix_timestamp())
            .context("convert root cert not_after")?;
        if now >= not_after {
            return Err(OpaqueError::new(std::io::Error::other(
                "root CA certificate has expired",
            ))
            .context("validate root ca validity window"));
        }
        Ok(())
    }

    /// The root certificate, PEM-encoded.
    #[must_use]
    pub fn root_cert_pem(&self) -> &str {
        &self.0.root_cert_pem
    }

    /// The root certificate, DER-encoded (spec §4.7: served at
    /// `http://marasi.cert`).
    #[must_use]
    pub fn root_cert_der(&self) -> &CertificateDer<'static> {
        &self.0.root_cert_der
    }

    /// Mint (or return a cached) leaf certificate for `server_name`,
    /// signed by the root, cached by server name (spec §4.1).
    ///
    /// Synchronous: signing is pure CPU work (no I/O), which lets this be
    /// called directly from `ResolvesServerCert::resolve` (spec §4.2), a
    /// synchronous rustls callback.
    pub fn mint_leaf(&self, server_name: &str) -> Result<Arc<CertifiedKey>, OpaqueError> {
        let mut cache = self.0.leaf_cache.lock();
        if let Some(existing) = cache.get(server_name) {
            return Ok(existing.clone());
        }

        let certified = self.mint_leaf_uncached(server_name)?;
        cache.insert(server_name.to_owned(), certified.clone());
        Ok(certified)
    }

    fn mint_leaf_uncached(&self, server_name: &str) -> Result<Arc<CertifiedKey>, OpaqueError> {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, server_name);

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        let san = SanType::DnsName(
            Ia5String::try_from(server_name.to_owned()).context("server name as dns SAN")?,
        );
        params.subject_alt_names = vec![san];

        let not_before = SystemTime::now();
        params.not_before = not_before.into();
        params.not_after =
            (not_before + Duration::from_secs(60 * 60 * 24 * LEAF_VALIDITY_DAYS)).into();

        let leaf_key = KeyPair::generate().context("generate leaf key pair")?;

        let issuer = Issuer::new(self.0.root_params.clone(), self.0.root_key.clone());
        let leaf_cert = params
            .signed_by(&leaf_key, &issuer)
            .context("sign leaf certificate with root")?;

        let cert_der = leaf_cert.der().clone();
        let key_der = PrivatePkcs8KeyDer::from(leaf_key.serialize_der());

        let provider = aws_lc_rs::default_provider();
        let signing_key = provider
            .key_provider
            .load_private_key(key_der.into())
            .context("load leaf private key")?;

        Ok(Arc::new(CertifiedKey::new(vec![cert_der], signing_key)))
    }

    /// SHA-256 of the root's subject-public-key-info, base64-encoded --
    /// used by the browser launcher to pin-whitelist the CA (spec §4.1,
    /// §4.11; kept as a standalone operation per SPEC_FULL §11 so any
    /// future front end can use it without going through the launcher).
    pub fn spki_sha256_base64(&self) -> Result<String, OpaqueError> {
        spki_sha256_base64(self.0.root_cert_der.as_ref())
    }
}

/// SHA-256 of a certificate's subject-public-key-info, base64-encoded.
pub fn spki_sha256_base64(cert_der: &[u8]) -> Result<String, OpaqueError> {
    use sha2::Digest;

    let (_, cert) =
        x509_parser::parse_x509_certificate(cert_der).context("parse certificate for spki")?;
    let spki_raw = cert.tbs_certificate.subject_pki.raw;
    let digest = sha2::Sha256::digest(spki_raw);
    Ok(base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        digest,
    ))
}

fn pem_to_der(pem: &str) -> Result<CertificateDer<'static>, OpaqueError> {
    CertificateDer::from_pem_slice(pem.as_bytes()).context("decode certificate pem")
}

#[cfg(unix)]
async fn write_private(path: &PathBuf, contents: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::write(path, contents).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn write_private(path: &PathBuf, contents: &[u8]) -> std::io::Result<()> {
    tokio::fs::write(path, contents).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generates_and_reloads_root_consistently() {
        let dir = tempfile::tempdir().unwrap();

        let ca1 = Ca::get_or_create_root(dir.path()).await.unwrap();
        let ca2 = Ca::get_or_create_root(dir.path()).await.unwrap();

        // Second call should have loaded the persisted files, not regenerated.
        assert_eq!(ca1.root_cert_pem(), ca2.root_cert_pem());
    }

    #[tokio::test]
    async fn mints_distinct_cached_leaves_per_server_name() {
        let dir = tempfile::tempdir().unwrap();
        let ca = Ca::get_or_create_root(dir.path()).await.unwrap();

        let leaf_a1 = ca.mint_leaf("a.test").unwrap();
        let leaf_a2 = ca.mint_leaf("a.test").unwrap();
        assert!(Arc::ptr_eq(&leaf_a1, &leaf_a2), "same server name should hit the cache");

        let leaf_b = ca.mint_leaf("b.test").unwrap();
        assert!(!Arc::ptr_eq(&leaf_a1, &leaf_b));
    }

    #[test]
    fn spki_fingerprint_is_stable_for_same_der() {
        // regression guard: same input must hash the same way twice
        let dummy = b"not-a-real-cert";
        let a = spki_sha256_base64(dummy);
        let b = spki_sha256_base64(dummy);
        // both fail identically (invalid cert), proving determinism of the path
        assert_eq!(a.is_err(), b.is_err());
    }
}
