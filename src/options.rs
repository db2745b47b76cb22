//! Listener construction options.
//!
//! Each option is a named, validated mutation applied in order to an
//! empty configuration. Options that load external material (certificate
//! files, CA bundles) do all their I/O during application; the first
//! failure aborts construction with no listener returned.

use std::path::PathBuf;
use std::sync::Arc;

use crate::autocert::{Authority, AutoCertManager};
use crate::error::ListenError;
use crate::tls::{ClientAuthPolicy, TlsSettings, TrustPool};

/// Accumulated listener configuration.
///
/// Created empty per construction call, mutated in place by each option,
/// then consumed by the socket opener and TLS assembly. The TLS field is
/// allocated lazily by the first option that needs it, so option ordering
/// never matters for allocation.
#[derive(Default)]
pub(crate) struct Config {
    pub(crate) naggle: bool,
    pub(crate) fast_open: bool,
    pub(crate) tls: Option<TlsSettings>,
}

impl Config {
    fn tls_mut(&mut self) -> &mut TlsSettings {
        self.tls.get_or_insert_with(TlsSettings::default)
    }
}

/// A listener construction option.
///
/// Options compose; repeated TLS-material options append rather than
/// overwrite. Applying the same flag option twice is harmless.
#[derive(Debug)]
pub enum ListenOption {
    /// Enable TCP fast open on the listening socket.
    FastOpen,
    /// Enable Nagle's algorithm on accepted connections, i.e. turn
    /// no-delay off. Can be useful combined with fast open to allow data
    /// on ack.
    Naggle,
    /// Terminate TLS with a certificate/key pair loaded from PEM files.
    StaticCert { cert: PathBuf, key: PathBuf },
    /// Authenticate client certificates against a CA bundle.
    ClientAuth { ca: PathBuf, policy: ClientAuthPolicy },
    /// Advertise an additional ALPN protocol.
    Alpn(Vec<u8>),
    /// Obtain certificates on demand from a certificate authority.
    AutoCerts {
        cache_dir: String,
        email: String,
        hosts: Vec<String>,
        authority: Option<Arc<dyn Authority>>,
    },
}

impl ListenOption {
    /// Enable TCP fast open.
    pub fn fast_open() -> Self {
        Self::FastOpen
    }

    /// Enable Nagle's algorithm, disabling no-delay on accepted
    /// connections.
    pub fn naggle() -> Self {
        Self::Naggle
    }

    /// Terminate TLS with the certificate and key at the given PEM file
    /// paths. May be repeated to serve multiple certificates.
    pub fn static_cert(cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        Self::StaticCert {
            cert: cert.into(),
            key: key.into(),
        }
    }

    /// Authenticate client certificates against the CA bundle at `ca`,
    /// enforcing `policy`.
    pub fn client_auth(ca: impl Into<PathBuf>, policy: ClientAuthPolicy) -> Self {
        Self::ClientAuth {
            ca: ca.into(),
            policy,
        }
    }

    /// Advertise an additional ALPN protocol during the handshake.
    pub fn alpn(protocol: impl Into<Vec<u8>>) -> Self {
        Self::Alpn(protocol.into())
    }

    /// Advertise "h2" so an HTTP server can serve HTTP/2 over TLS. Only
    /// meaningful combined with other TLS options.
    pub fn http2() -> Self {
        Self::Alpn(b"h2".to_vec())
    }

    /// Obtain certificates automatically from Let's Encrypt.
    ///
    /// `cache_dir` stores issued certificates for reuse across restarts;
    /// empty defaults to ".". `email` is optionally registered with the
    /// authority to notify about certificate problems; empty obtains
    /// certificates anonymously. `hosts` is the allow-list of hostnames
    /// eligible for issuance and must not be empty.
    ///
    /// By using this option you are accepting Let's Encrypt's terms of
    /// service.
    pub fn auto_certs<I, S>(cache_dir: impl Into<String>, email: impl Into<String>, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::AutoCerts {
            cache_dir: cache_dir.into(),
            email: email.into(),
            hosts: hosts.into_iter().map(Into::into).collect(),
            authority: None,
        }
    }

    /// Like [`ListenOption::auto_certs`], issuing from a custom
    /// [`Authority`] (private CAs, tests).
    pub fn auto_certs_with<I, S>(
        cache_dir: impl Into<String>,
        email: impl Into<String>,
        hosts: I,
        authority: Arc<dyn Authority>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::AutoCerts {
            cache_dir: cache_dir.into(),
            email: email.into(),
            hosts: hosts.into_iter().map(Into::into).collect(),
            authority: Some(authority),
        }
    }

    /// Apply this option to the configuration, performing any validation
    /// I/O now.
    pub(crate) fn apply(self, config: &mut Config) -> Result<(), ListenError> {
        match self {
            Self::FastOpen => config.fast_open = true,
            Self::Naggle => config.naggle = true,
            Self::StaticCert { cert, key } => {
                let loaded = crate::tls::load_static_cert(&cert, &key)?;
                config.tls_mut().static_certs.push(loaded);
            }
            Self::ClientAuth { ca, policy } => {
                let roots = crate::tls::load_trust_pool(&ca)?;
                config.tls_mut().trust = Some(TrustPool { roots, policy });
            }
            Self::Alpn(protocol) => config.tls_mut().alpn.push(protocol),
            Self::AutoCerts {
                cache_dir,
                email,
                hosts,
                authority,
            } => {
                if hosts.is_empty() {
                    return Err(ListenError::NoHosts);
                }
                let cache_dir = if cache_dir.is_empty() {
                    ".".to_string()
                } else {
                    cache_dir
                };
                let email = if email.is_empty() { None } else { Some(email) };
                let manager = match authority {
                    Some(authority) => {
                        AutoCertManager::with_authority(cache_dir, email, hosts, authority)?
                    }
                    None => AutoCertManager::lets_encrypt(cache_dir, email, hosts)?,
                };
                config.tls_mut().auto = Some(manager);
            }
        }
        Ok(())
    }
}
