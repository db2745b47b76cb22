//! On-demand certificate issuance with persistent caching.
//!
//! Resolution for an eligible hostname checks the in-memory cache, then
//! the persistent cache, then runs one issuance exchange with the
//! configured [`Authority`]. Concurrent requests for the same hostname
//! share a single exchange and observe the same result; requests for
//! different hostnames proceed independently. Hostnames outside the
//! allow-list fail closed before any cache access.

mod acme;
mod cache;

pub use acme::{AcmeAuthority, Authority, IssuedCert, ACME_TLS_ALPN};
pub use cache::CertCache;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Renew-before margin: an entry this close to its notAfter is treated as
/// expiring and refreshed on the next resolution.
const RENEW_BEFORE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Certificate resolution error types.
///
/// Cloneable so every waiter on a shared issuance exchange observes the
/// same failure.
#[derive(Debug, Clone, Error)]
pub enum AutoCertError {
    /// The hostname is not in the allow-list.
    #[error("host {0:?} not allowed")]
    HostNotAllowed(String),

    /// The persistent cache failed.
    #[error("certificate cache {path:?}: {reason}")]
    Cache { path: PathBuf, reason: String },

    /// Account registration with the authority failed.
    #[error("registration: {0}")]
    Registration(String),

    /// The issuance exchange failed.
    #[error("issuance for {host}: {reason}")]
    Issuance { host: String, reason: String },

    /// Issued or cached material could not be parsed.
    #[error("certificate for {host}: {reason}")]
    BadCertificate { host: String, reason: String },
}

/// Hostnames eligible for automatic issuance.
#[derive(Debug, Clone)]
pub struct HostAllowList {
    hosts: HashSet<String>,
}

impl HostAllowList {
    /// Build from an iterator of hostnames, normalized to lowercase with
    /// any trailing dot stripped.
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hosts: hosts
                .into_iter()
                .map(|h| normalize_host(h.as_ref()))
                .collect(),
        }
    }

    /// Whether `host` is eligible for issuance.
    pub fn allows(&self, host: &str) -> bool {
        self.hosts.contains(&normalize_host(host))
    }

    /// Number of configured hostnames.
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// True when no hostname is configured.
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Challenge certificates staged during TLS-ALPN-01 validation, consulted
/// by the handshake resolver.
#[derive(Default)]
pub struct ChallengeCerts {
    certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl ChallengeCerts {
    pub(crate) fn put(&self, host: &str, key: Arc<CertifiedKey>) {
        self.certs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(normalize_host(host), key);
    }

    pub(crate) fn get(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        self.certs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&normalize_host(host))
            .cloned()
    }

    pub(crate) fn remove(&self, host: &str) {
        self.certs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&normalize_host(host));
    }
}

impl fmt::Debug for ChallengeCerts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let staged = self
            .certs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("ChallengeCerts").field("staged", &staged).finish()
    }
}

#[derive(Clone)]
struct CachedCert {
    key: Arc<CertifiedKey>,
    not_after: SystemTime,
}

type FlightResult = Result<Arc<CertifiedKey>, AutoCertError>;

/// One in-flight resolution per hostname; later requesters await the same
/// cell and clone its result.
struct Flight {
    cell: OnceCell<FlightResult>,
}

/// Owns the persistent cache, allow-list, authority handle, and in-memory
/// certificate state for automatic issuance.
///
/// Created at configuration time and held by the listener's TLS state, so
/// its lifetime and concurrent access are explicit.
pub struct AutoCertManager {
    allow: HostAllowList,
    email: Option<String>,
    cache: CertCache,
    authority: Arc<dyn Authority>,
    challenges: Arc<ChallengeCerts>,
    certs: RwLock<HashMap<String, CachedCert>>,
    flights: Mutex<HashMap<String, Arc<Flight>>>,
}

impl AutoCertManager {
    /// Manager issuing from Let's Encrypt production.
    pub fn lets_encrypt<I, S>(
        cache_dir: impl Into<PathBuf>,
        email: Option<String>,
        hosts: I,
    ) -> Result<Arc<Self>, AutoCertError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let cache = CertCache::new(cache_dir);
        let challenges = Arc::new(ChallengeCerts::default());
        let authority = Arc::new(AcmeAuthority::lets_encrypt(cache.clone(), challenges.clone()));
        Self::build(cache, email, HostAllowList::new(hosts), authority, challenges)
    }

    /// Manager issuing from a custom ACME directory, e.g. a staging
    /// environment.
    pub fn acme<I, S>(
        directory: impl Into<String>,
        cache_dir: impl Into<PathBuf>,
        email: Option<String>,
        hosts: I,
    ) -> Result<Arc<Self>, AutoCertError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let cache = CertCache::new(cache_dir);
        let challenges = Arc::new(ChallengeCerts::default());
        let authority = Arc::new(AcmeAuthority::new(
            directory,
            cache.clone(),
            challenges.clone(),
        ));
        Self::build(cache, email, HostAllowList::new(hosts), authority, challenges)
    }

    /// Manager issuing from a custom authority (private CAs, tests).
    pub fn with_authority<I, S>(
        cache_dir: impl Into<PathBuf>,
        email: Option<String>,
        hosts: I,
        authority: Arc<dyn Authority>,
    ) -> Result<Arc<Self>, AutoCertError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let cache = CertCache::new(cache_dir);
        let challenges = Arc::new(ChallengeCerts::default());
        Self::build(cache, email, HostAllowList::new(hosts), authority, challenges)
    }

    fn build(
        cache: CertCache,
        email: Option<String>,
        allow: HostAllowList,
        authority: Arc<dyn Authority>,
        challenges: Arc<ChallengeCerts>,
    ) -> Result<Arc<Self>, AutoCertError> {
        cache.ensure().map_err(|e| AutoCertError::Cache {
            path: cache.dir().to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Arc::new(Self {
            allow,
            email,
            cache,
            authority,
            challenges,
            certs: RwLock::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
        }))
    }

    /// Register the configured email with the authority. No-op without an
    /// email. Runs once during listener construction, before any
    /// resolution; failure aborts construction.
    pub async fn register(&self) -> Result<(), AutoCertError> {
        match &self.email {
            Some(email) => self.authority.register(email).await,
            None => Ok(()),
        }
    }

    /// Hostnames eligible for issuance.
    pub fn allow_list(&self) -> &HostAllowList {
        &self.allow
    }

    /// In-memory cached certificate for `host`, if present and not
    /// expiring. Synchronous: called during handshake certificate
    /// resolution.
    pub fn cached_cert(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        let host = normalize_host(host);
        let certs = self.certs.read().unwrap_or_else(PoisonError::into_inner);
        let entry = certs.get(&host)?;
        if expiring(entry.not_after) {
            return None;
        }
        Some(entry.key.clone())
    }

    /// Staged challenge certificate for an in-flight validation
    /// handshake.
    pub fn challenge_cert(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        self.challenges.get(host)
    }

    /// Resolve a certificate for `host`, issuing and persisting one when
    /// the caches have no usable entry.
    pub async fn obtain(self: &Arc<Self>, host: &str) -> FlightResult {
        let host = normalize_host(host);
        if !self.allow.allows(&host) {
            return Err(AutoCertError::HostNotAllowed(host));
        }
        if let Some(key) = self.cached_cert(&host) {
            return Ok(key);
        }

        let flight = {
            let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
            flights
                .entry(host.clone())
                .or_insert_with(|| {
                    Arc::new(Flight {
                        cell: OnceCell::new(),
                    })
                })
                .clone()
        };

        let result = flight
            .cell
            .get_or_init(|| self.resolve_slow(host.clone()))
            .await
            .clone();

        // Retire the flight so a later request retries after a failure or
        // refreshes an expiring entry.
        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = flights.get(&host) {
            if Arc::ptr_eq(current, &flight) {
                flights.remove(&host);
            }
        }
        result
    }

    async fn resolve_slow(&self, host: String) -> FlightResult {
        // Another flight may have completed between the fast-path check
        // and this one.
        if let Some(key) = self.cached_cert(&host) {
            return Ok(key);
        }

        match self.load_persisted(&host)? {
            Some(entry) if !expiring(entry.not_after) => {
                debug!(host, "certificate loaded from cache");
                let key = entry.key.clone();
                self.publish(&host, entry);
                return Ok(key);
            }
            Some(_) => info!(host, "cached certificate expiring, refreshing"),
            None => {}
        }

        let issued = self.authority.issue(&host).await?;
        let entry = parse_bundle(&host, issued.key_pem.as_bytes(), issued.chain_pem.as_bytes())?;

        let mut bundle = Vec::with_capacity(issued.key_pem.len() + issued.chain_pem.len() + 1);
        bundle.extend_from_slice(issued.key_pem.as_bytes());
        if !issued.key_pem.ends_with('\n') {
            bundle.push(b'\n');
        }
        bundle.extend_from_slice(issued.chain_pem.as_bytes());
        self.cache
            .put(&host, &bundle)
            .map_err(|e| AutoCertError::Cache {
                path: self.cache.dir().to_path_buf(),
                reason: e.to_string(),
            })?;

        info!(host, "certificate issued and cached");
        let key = entry.key.clone();
        self.publish(&host, entry);
        Ok(key)
    }

    fn load_persisted(&self, host: &str) -> Result<Option<CachedCert>, AutoCertError> {
        let bundle = self.cache.get(host).map_err(|e| AutoCertError::Cache {
            path: self.cache.dir().to_path_buf(),
            reason: e.to_string(),
        })?;
        match bundle {
            None => Ok(None),
            Some(data) => match parse_bundle(host, &data, &data) {
                Ok(entry) => Ok(Some(entry)),
                Err(e) => {
                    warn!(host, error = %e, "discarding unreadable cache entry");
                    Ok(None)
                }
            },
        }
    }

    fn publish(&self, host: &str, entry: CachedCert) {
        self.certs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host.to_string(), entry);
    }
}

impl fmt::Debug for AutoCertManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoCertManager")
            .field("hosts", &self.allow.len())
            .field("email", &self.email)
            .field("cache", &self.cache.dir())
            .finish()
    }
}

/// Build a rustls server certificate from parsed material.
pub(crate) fn certified_key(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<CertifiedKey, String> {
    let signing = rustls::crypto::ring::sign::any_supported_type(&key).map_err(|e| e.to_string())?;
    Ok(CertifiedKey::new(chain, signing))
}

fn parse_bundle(host: &str, key_src: &[u8], chain_src: &[u8]) -> Result<CachedCert, AutoCertError> {
    let bad = |reason: String| AutoCertError::BadCertificate {
        host: host.to_string(),
        reason,
    };

    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &*chain_src)
        .collect::<Result<_, _>>()
        .map_err(|e| bad(e.to_string()))?;
    if chain.is_empty() {
        return Err(bad("no certificates in bundle".to_string()));
    }
    let key = rustls_pemfile::private_key(&mut &*key_src)
        .map_err(|e| bad(e.to_string()))?
        .ok_or_else(|| bad("no private key in bundle".to_string()))?;

    let not_after = leaf_not_after(&chain[0]).map_err(&bad)?;
    let key = certified_key(chain, key).map_err(bad)?;
    Ok(CachedCert {
        key: Arc::new(key),
        not_after,
    })
}

fn leaf_not_after(leaf: &CertificateDer<'_>) -> Result<SystemTime, String> {
    use x509_parser::prelude::{FromDer, X509Certificate};

    let (_, cert) = X509Certificate::from_der(leaf.as_ref()).map_err(|e| e.to_string())?;
    let ts = cert.validity().not_after.timestamp();
    if ts < 0 {
        return Err("notAfter predates the epoch".to_string());
    }
    Ok(SystemTime::UNIX_EPOCH + Duration::from_secs(ts as u64))
}

fn expiring(not_after: SystemTime) -> bool {
    match not_after.duration_since(SystemTime::now()) {
        Ok(remaining) => remaining < RENEW_BEFORE,
        Err(_) => true,
    }
}
