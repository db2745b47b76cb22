//! Listener construction errors.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::autocert::AutoCertError;

/// Errors surfaced while constructing a listener.
///
/// Construction either returns a fully configured listener or one of
/// these; a partially configured listener is never returned. Failures on
/// individual accepted connections are reported as `io::Error` from
/// `accept` and never abort the listener.
#[derive(Debug, Error)]
pub enum ListenError {
    /// The listen address could not be parsed or resolved.
    #[error("invalid listen address {addr:?}: {reason}")]
    Address { addr: String, reason: String },

    /// Binding the listening socket failed.
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The platform supports fast open but enabling it failed.
    #[error("fast open: {0}")]
    FastOpen(#[source] io::Error),

    /// A certificate/key pair could not be loaded or parsed.
    #[error("cert/key pair {cert:?} / {key:?}: {source}")]
    CertPair {
        cert: PathBuf,
        key: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The client-auth CA bundle could not be read.
    #[error("client auth ca {path:?}: {source}")]
    ClientCa {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The client certificate verifier could not be built.
    #[error("client auth: {0}")]
    ClientAuth(String),

    /// Unknown client-authentication policy token.
    #[error("unknown client auth policy {0:?}")]
    InvalidPolicy(String),

    /// Automatic certificates were requested without any hostnames.
    #[error("no hosts configured for automatic certificates")]
    NoHosts,

    /// The automatic-certificate subsystem failed during construction.
    #[error("automatic certificates: {0}")]
    AutoCert(#[from] AutoCertError),

    /// TLS configuration assembly failed.
    #[error("tls config: {0}")]
    Tls(#[from] rustls::Error),
}
