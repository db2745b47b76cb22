//! Client certificate authentication policies.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, SignatureScheme};

use crate::error::ListenError;

/// Handshake-time requirement level for client-presented certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuthPolicy {
    /// No client certificate is requested.
    None,
    /// A certificate is requested but neither required nor verified.
    Request,
    /// A certificate is required but not verified against the trust pool.
    RequireAny,
    /// A certificate is verified when presented, but not required.
    VerifyIfGiven,
    /// A certificate is required and verified against the trust pool.
    RequireAndVerify,
}

impl FromStr for ClientAuthPolicy {
    type Err = ListenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "request-any" => Ok(Self::Request),
            "require-any" => Ok(Self::RequireAny),
            "verify-if-given" => Ok(Self::VerifyIfGiven),
            "require-and-verify" => Ok(Self::RequireAndVerify),
            other => Err(ListenError::InvalidPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for ClientAuthPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            Self::None => "none",
            Self::Request => "request-any",
            Self::RequireAny => "require-any",
            Self::VerifyIfGiven => "verify-if-given",
            Self::RequireAndVerify => "require-and-verify",
        };
        write!(f, "{token}")
    }
}

/// Build the verifier enforcing `policy` against `roots`.
///
/// `ClientAuthPolicy::None` is handled by the caller, which skips client
/// auth entirely.
pub(crate) fn client_verifier(
    roots: RootCertStore,
    policy: ClientAuthPolicy,
) -> Result<Arc<dyn ClientCertVerifier>, ListenError> {
    let builder = WebPkiClientVerifier::builder(Arc::new(roots));
    let build_err = |e: rustls::server::VerifierBuilderError| ListenError::ClientAuth(e.to_string());
    let verifier = match policy {
        ClientAuthPolicy::None => {
            return Err(ListenError::ClientAuth(
                "no verifier for policy none".to_string(),
            ))
        }
        ClientAuthPolicy::VerifyIfGiven => {
            builder.allow_unauthenticated().build().map_err(build_err)?
        }
        ClientAuthPolicy::RequireAndVerify => builder.build().map_err(build_err)?,
        ClientAuthPolicy::Request => Arc::new(AnyClientCert {
            inner: builder.allow_unauthenticated().build().map_err(build_err)?,
            mandatory: false,
        }),
        ClientAuthPolicy::RequireAny => Arc::new(AnyClientCert {
            inner: builder.allow_unauthenticated().build().map_err(build_err)?,
            mandatory: true,
        }),
    };
    Ok(verifier)
}

/// Accepts any presented client certificate, optionally demanding one.
///
/// Chain validation is skipped; handshake signature verification still
/// runs against the presented end-entity certificate.
struct AnyClientCert {
    inner: Arc<dyn ClientCertVerifier>,
    mandatory: bool,
}

impl fmt::Debug for AnyClientCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyClientCert")
            .field("mandatory", &self.mandatory)
            .finish()
    }
}

impl ClientCertVerifier for AnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        self.mandatory
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
