//! TLS configuration assembly.
//!
//! Turns accumulated option side effects (certificate/key pairs, client
//! trust pool, protocol hints, dynamic resolver) into a rustls
//! `ServerConfig` and the acceptor state used by the listener.

mod resolver;
mod verify;

pub use verify::ClientAuthPolicy;

pub(crate) use resolver::{CertResolver, StaticCert};

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::autocert::{AutoCertManager, ACME_TLS_ALPN};
use crate::error::ListenError;

/// TLS fields accumulated by option application.
///
/// Allocated lazily by the first option that needs it; a configuration is
/// TLS-enabled exactly when this exists.
#[derive(Default)]
pub(crate) struct TlsSettings {
    pub(crate) static_certs: Vec<StaticCert>,
    pub(crate) trust: Option<TrustPool>,
    pub(crate) alpn: Vec<Vec<u8>>,
    pub(crate) auto: Option<Arc<AutoCertManager>>,
}

/// Trusted roots for client authentication plus the requested policy.
pub(crate) struct TrustPool {
    pub(crate) roots: RootCertStore,
    pub(crate) policy: ClientAuthPolicy,
}

/// Acceptor state held by a TLS-terminating listener.
pub(crate) struct TlsContext {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) acceptor: TlsAcceptor,
    pub(crate) resolver: Arc<CertResolver>,
    pub(crate) auto: Option<Arc<AutoCertManager>>,
}

/// Load a certificate/key pair from PEM files.
pub(crate) fn load_static_cert(cert_path: &Path, key_path: &Path) -> Result<StaticCert, ListenError> {
    let pair_err = |source: io::Error| ListenError::CertPair {
        cert: cert_path.to_path_buf(),
        key: key_path.to_path_buf(),
        source,
    };
    let invalid = |reason: String| io::Error::new(io::ErrorKind::InvalidData, reason);

    let mut cert_reader = BufReader::new(File::open(cert_path).map_err(pair_err)?);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(pair_err)?;
    if certs.is_empty() {
        return Err(pair_err(invalid("no certificates found".to_string())));
    }

    let mut key_reader = BufReader::new(File::open(key_path).map_err(pair_err)?);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(pair_err)?
        .ok_or_else(|| pair_err(invalid("no private key found".to_string())))?;
    let signing = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| pair_err(invalid(e.to_string())))?;

    let names = leaf_dns_names(&certs[0]).map_err(|e| pair_err(invalid(e)))?;
    Ok(StaticCert {
        key: Arc::new(CertifiedKey::new(certs, signing)),
        names,
    })
}

/// DNS names the leaf certificate is valid for: SAN entries, with the
/// subject CN as a legacy fallback.
fn leaf_dns_names(leaf: &CertificateDer<'_>) -> Result<Vec<String>, String> {
    use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

    let (_, cert) = X509Certificate::from_der(leaf.as_ref()).map_err(|e| e.to_string())?;
    let mut names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for general in &san.value.general_names {
            if let GeneralName::DNSName(dns) = general {
                names.push(dns.to_ascii_lowercase());
            }
        }
    }
    if names.is_empty() {
        if let Some(cn) = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
        {
            names.push(cn.to_ascii_lowercase());
        }
    }
    Ok(names)
}

/// Read a CA bundle into a trust pool. Entries the parser cannot use are
/// skipped.
pub(crate) fn load_trust_pool(path: &Path) -> Result<RootCertStore, ListenError> {
    let ca_err = |source: io::Error| ListenError::ClientCa {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = BufReader::new(File::open(path).map_err(ca_err)?);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .filter_map(|c| c.ok())
        .collect();
    let mut roots = RootCertStore::empty();
    roots.add_parsable_certificates(certs);
    Ok(roots)
}

/// Assemble the accumulated TLS fields into acceptor state.
pub(crate) fn assemble(settings: TlsSettings) -> Result<TlsContext, ListenError> {
    let resolver = Arc::new(CertResolver::new(
        settings.static_certs,
        settings.auto.clone(),
    ));

    let builder = ServerConfig::builder();
    let mut config = match settings.trust {
        Some(pool) if pool.policy != ClientAuthPolicy::None => builder
            .with_client_cert_verifier(verify::client_verifier(pool.roots, pool.policy)?)
            .with_cert_resolver(resolver.clone()),
        _ => builder
            .with_no_client_auth()
            .with_cert_resolver(resolver.clone()),
    };

    config.alpn_protocols = settings.alpn;
    if settings.auto.is_some() {
        config.alpn_protocols.push(ACME_TLS_ALPN.to_vec());
    }

    debug!(
        alpn = config.alpn_protocols.len(),
        auto = settings.auto.is_some(),
        "tls config assembled"
    );

    let config = Arc::new(config);
    Ok(TlsContext {
        acceptor: TlsAcceptor::from(config.clone()),
        config,
        resolver,
        auto: settings.auto,
    })
}
