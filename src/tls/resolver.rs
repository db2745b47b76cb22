//! Handshake-time certificate selection.

use std::fmt;
use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;

use crate::autocert::{AutoCertManager, ACME_TLS_ALPN};

/// A statically loaded certificate with the leaf's DNS names.
#[derive(Debug)]
pub(crate) struct StaticCert {
    pub(crate) key: Arc<CertifiedKey>,
    pub(crate) names: Vec<String>,
}

/// Selects the certificate for an inbound handshake.
///
/// Statically loaded certificates are matched against the requested name
/// first; the dynamic resolver is consulted only when none matches. With
/// no dynamic resolver configured, the first static certificate is the
/// fallback for unmatched or absent server names.
pub(crate) struct CertResolver {
    static_certs: Vec<StaticCert>,
    auto: Option<Arc<AutoCertManager>>,
}

impl CertResolver {
    pub(crate) fn new(static_certs: Vec<StaticCert>, auto: Option<Arc<AutoCertManager>>) -> Self {
        Self { static_certs, auto }
    }

    /// Whether a static certificate covers `name`.
    pub(crate) fn has_static_match(&self, name: &str) -> bool {
        self.static_for(&name.to_ascii_lowercase()).is_some()
    }

    fn static_for(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        self.static_certs
            .iter()
            .find(|c| c.names.iter().any(|pattern| name_matches(pattern, name)))
            .map(|c| c.key.clone())
    }

    fn fallback(&self) -> Option<Arc<CertifiedKey>> {
        self.static_certs.first().map(|c| c.key.clone())
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name().map(|n| n.to_ascii_lowercase());

        if let Some(auto) = &self.auto {
            let challenge = client_hello
                .alpn()
                .map_or(false, |mut protos| protos.any(|p| p == ACME_TLS_ALPN));
            if challenge {
                return auto.challenge_cert(name.as_deref()?);
            }
        }

        match name {
            Some(name) => {
                if let Some(key) = self.static_for(&name) {
                    return Some(key);
                }
                match &self.auto {
                    Some(auto) => auto.cached_cert(&name),
                    None => self.fallback(),
                }
            }
            None => self.fallback(),
        }
    }
}

impl fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertResolver")
            .field("static_certs", &self.static_certs.len())
            .field("auto", &self.auto.is_some())
            .finish()
    }
}

/// Exact or single-label wildcard match. Both sides must already be
/// lowercase.
fn name_matches(pattern: &str, name: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        match name.strip_suffix(suffix) {
            Some(head) => {
                head.len() > 1 && head.ends_with('.') && !head[..head.len() - 1].contains('.')
            }
            None => false,
        }
    } else {
        pattern == name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_name_match() {
        assert!(name_matches("example.com", "example.com"));
        assert!(!name_matches("example.com", "www.example.com"));
        assert!(!name_matches("example.com", "example.org"));
    }

    #[test]
    fn test_wildcard_matches_single_label() {
        assert!(name_matches("*.example.com", "www.example.com"));
        assert!(name_matches("*.example.com", "api.example.com"));
        assert!(!name_matches("*.example.com", "example.com"));
        assert!(!name_matches("*.example.com", "a.b.example.com"));
        assert!(!name_matches("*.example.com", "badexample.com"));
    }
}
