//! The issuance authority boundary and its ACME implementation.
//!
//! The protocol exchange is delegated to `instant-acme`; this module owns
//! the account lifecycle, TLS-ALPN-01 challenge staging, and order
//! polling. Validation handshakes are answered by the listener's own
//! certificate resolver, which serves the staged challenge certificate
//! for `acme-tls/1` handshakes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, Order, OrderStatus,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::cache::CertCache;
use super::{certified_key, AutoCertError, ChallengeCerts};

/// ALPN protocol answering TLS-ALPN-01 validation handshakes.
pub const ACME_TLS_ALPN: &[u8] = b"acme-tls/1";

/// Certificate material returned by a completed issuance exchange.
#[derive(Debug, Clone)]
pub struct IssuedCert {
    /// PEM-encoded certificate chain, leaf first.
    pub chain_pem: String,
    /// PEM-encoded private key for the leaf.
    pub key_pem: String,
}

/// The external certificate authority boundary.
///
/// Implementations perform the registration and issuance exchanges.
/// Allow-listing, caching, and request de-duplication live in
/// [`AutoCertManager`](super::AutoCertManager), so implementations see
/// one `issue` call per certificate actually needed.
#[async_trait]
pub trait Authority: fmt::Debug + Send + Sync + 'static {
    /// Register `email` with the authority. Called once, eagerly, during
    /// listener construction.
    async fn register(&self, email: &str) -> Result<(), AutoCertError>;

    /// Run the issuance exchange for `host`.
    async fn issue(&self, host: &str) -> Result<IssuedCert, AutoCertError>;
}

/// ACME authority delegating the protocol exchange to `instant-acme`.
///
/// Account credentials are persisted in the certificate cache and reused
/// across restarts. By requesting certificates through this authority you
/// are accepting the directory's terms of service.
pub struct AcmeAuthority {
    directory: String,
    cache: CertCache,
    challenges: Arc<ChallengeCerts>,
    account: Mutex<Option<Arc<Account>>>,
}

impl AcmeAuthority {
    /// Authority against the given ACME directory URL.
    pub(crate) fn new(
        directory: impl Into<String>,
        cache: CertCache,
        challenges: Arc<ChallengeCerts>,
    ) -> Self {
        Self {
            directory: directory.into(),
            cache,
            challenges,
            account: Mutex::new(None),
        }
    }

    /// Authority against Let's Encrypt production.
    pub(crate) fn lets_encrypt(cache: CertCache, challenges: Arc<ChallengeCerts>) -> Self {
        Self::new(LetsEncrypt::Production.url(), cache, challenges)
    }

    async fn ensure_account(&self, contact: Option<&str>) -> Result<Arc<Account>, AutoCertError> {
        let mut guard = self.account.lock().await;
        if let Some(account) = guard.as_ref() {
            return Ok(account.clone());
        }
        let account = self.load_or_create(contact).await?;
        *guard = Some(account.clone());
        Ok(account)
    }

    async fn load_or_create(&self, contact: Option<&str>) -> Result<Arc<Account>, AutoCertError> {
        let cache_err = |e: std::io::Error| AutoCertError::Cache {
            path: self.cache.dir().to_path_buf(),
            reason: e.to_string(),
        };

        if let Some(stored) = self.cache.get_account().map_err(cache_err)? {
            let credentials: AccountCredentials = serde_json::from_slice(&stored)
                .map_err(|e| AutoCertError::Registration(format!("stored credentials: {e}")))?;
            let account = Account::from_credentials(credentials)
                .await
                .map_err(|e| AutoCertError::Registration(e.to_string()))?;
            debug!(directory = %self.directory, "acme account loaded from cache");
            return Ok(Arc::new(account));
        }

        let mailto = contact.map(|email| format!("mailto:{email}"));
        let contact_refs: Vec<&str> = mailto.as_deref().into_iter().collect();
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact_refs,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory,
            None,
        )
        .await
        .map_err(|e| AutoCertError::Registration(e.to_string()))?;

        let encoded = serde_json::to_vec(&credentials)
            .map_err(|e| AutoCertError::Registration(e.to_string()))?;
        self.cache.put_account(&encoded).map_err(cache_err)?;
        info!(directory = %self.directory, "acme account created");
        Ok(Arc::new(account))
    }

    async fn finish_order(&self, order: &mut Order, host: &str) -> Result<IssuedCert, AutoCertError> {
        let issue_err = |reason: String| AutoCertError::Issuance {
            host: host.to_string(),
            reason,
        };

        enum Outcome {
            Ready,
            Invalid,
        }

        let mut delay = Duration::from_millis(500);
        let mut tries = 0u32;
        let outcome = loop {
            tokio::time::sleep(delay).await;
            let state = order.refresh().await.map_err(|e| issue_err(e.to_string()))?;
            match &state.status {
                OrderStatus::Ready => break Outcome::Ready,
                OrderStatus::Invalid => break Outcome::Invalid,
                _ => {}
            }
            tries += 1;
            if tries > 10 {
                return Err(issue_err("order did not become ready".to_string()));
            }
            delay = (delay * 2).min(Duration::from_secs(8));
        };
        if let Outcome::Invalid = outcome {
            return Err(issue_err("order failed validation".to_string()));
        }

        let mut params = rcgen::CertificateParams::new(vec![host.to_string()]);
        params.distinguished_name = rcgen::DistinguishedName::new();
        let leaf = rcgen::Certificate::from_params(params).map_err(|e| issue_err(e.to_string()))?;
        let csr = leaf
            .serialize_request_der()
            .map_err(|e| issue_err(e.to_string()))?;
        order
            .finalize(&csr)
            .await
            .map_err(|e| issue_err(e.to_string()))?;

        let mut tries = 0u32;
        let chain_pem = loop {
            match order
                .certificate()
                .await
                .map_err(|e| issue_err(e.to_string()))?
            {
                Some(pem) => break pem,
                None => {
                    tries += 1;
                    if tries > 10 {
                        return Err(issue_err("certificate was not issued".to_string()));
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        };

        Ok(IssuedCert {
            chain_pem,
            key_pem: leaf.serialize_private_key_pem(),
        })
    }
}

#[async_trait]
impl Authority for AcmeAuthority {
    async fn register(&self, email: &str) -> Result<(), AutoCertError> {
        self.ensure_account(Some(email)).await?;
        Ok(())
    }

    async fn issue(&self, host: &str) -> Result<IssuedCert, AutoCertError> {
        let issue_err = |reason: String| AutoCertError::Issuance {
            host: host.to_string(),
            reason,
        };

        let account = self.ensure_account(None).await?;

        info!(host, directory = %self.directory, "starting issuance exchange");
        let identifiers = [Identifier::Dns(host.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| issue_err(e.to_string()))?;

        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| issue_err(e.to_string()))?;
        let mut staged = false;
        for authz in &authorizations {
            match &authz.status {
                AuthorizationStatus::Valid => continue,
                AuthorizationStatus::Pending => {}
                status => {
                    return Err(issue_err(format!("authorization is {status:?}")));
                }
            }
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::TlsAlpn01)
                .ok_or_else(|| issue_err("no tls-alpn-01 challenge offered".to_string()))?;
            let key_auth = order.key_authorization(challenge);
            let staged_key = challenge_certificate(host, key_auth.digest().as_ref())
                .map_err(issue_err)?;
            self.challenges.put(host, staged_key);
            staged = true;
            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(|e| issue_err(e.to_string()))?;
        }

        let result = self.finish_order(&mut order, host).await;
        if staged {
            self.challenges.remove(host);
        }
        if result.is_ok() {
            info!(host, "issuance exchange complete");
        }
        result
    }
}

impl fmt::Debug for AcmeAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcmeAuthority")
            .field("directory", &self.directory)
            .field("cache", &self.cache.dir())
            .finish()
    }
}

/// Self-signed certificate carrying the ACME identifier extension, served
/// only for `acme-tls/1` validation handshakes.
fn challenge_certificate(host: &str, digest: &[u8]) -> Result<Arc<CertifiedKey>, String> {
    let mut params = rcgen::CertificateParams::new(vec![host.to_string()]);
    params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
    params.custom_extensions = vec![rcgen::CustomExtension::new_acme_identifier(digest)];
    let cert = rcgen::Certificate::from_params(params).map_err(|e| e.to_string())?;
    let cert_der = cert.serialize_der().map_err(|e| e.to_string())?;
    let key_der = cert.serialize_private_key_der();
    certified_key(
        vec![CertificateDer::from(cert_der)],
        PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_der)),
    )
    .map(Arc::new)
}
