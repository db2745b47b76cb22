//! Ready-to-accept TCP listeners with production socket tuning and TLS
//! termination.
//!
//! [`bind`] applies an ordered set of [`ListenOption`]s to an empty
//! configuration, opens and tunes the listening socket (keep-alive,
//! no-delay, optional fast open), and wraps it with TLS termination when
//! any TLS option was set. Certificates can be supplied statically from
//! PEM files or obtained on demand from a certificate authority and
//! cached across restarts.
//!
//! ```no_run
//! use gatehouse::{bind, ClientAuthPolicy, ListenOption};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let listener = bind(
//!     ":443",
//!     [
//!         ListenOption::fast_open(),
//!         ListenOption::static_cert("cert.pem", "key.pem"),
//!         ListenOption::client_auth("cacert.pem", ClientAuthPolicy::VerifyIfGiven),
//!         ListenOption::http2(),
//!     ],
//! )
//! .await?;
//!
//! loop {
//!     let (stream, peer) = listener.accept().await?;
//!     // hand the connection to its own task
//! #   let _ = (stream, peer);
//! #   break;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Automatic certificates:
//!
//! ```no_run
//! use gatehouse::{bind, ListenOption};
//!
//! # async fn run() -> Result<(), gatehouse::ListenError> {
//! let listener = bind(
//!     ":443",
//!     [ListenOption::auto_certs(
//!         "/var/lib/app/certs",
//!         "ops@example.com",
//!         ["example.com", "www.example.com"],
//!     )],
//! )
//! .await?;
//! # drop(listener);
//! # Ok(())
//! # }
//! ```

pub mod autocert;

mod error;
mod listener;
mod options;
mod socket;
mod tls;

pub use error::ListenError;
pub use listener::{Listener, Stream};
pub use options::ListenOption;
pub use tls::ClientAuthPolicy;

use tracing::info;

use options::Config;

/// Create a listener bound to `addr`, configured by `options`.
///
/// `addr` is a host:port string; an empty host binds all interfaces and
/// port 0 selects an ephemeral port. An empty `addr` means ":0". Options
/// are applied in order and the first failure aborts construction:
/// either a fully configured listener is returned, or an error and no
/// listener.
pub async fn bind<I>(addr: &str, options: I) -> Result<Listener, ListenError>
where
    I: IntoIterator<Item = ListenOption>,
{
    let mut config = Config::default();
    for option in options {
        option.apply(&mut config)?;
    }

    let tls = match config.tls {
        None => None,
        Some(settings) => {
            if let Some(auto) = &settings.auto {
                auto.register().await?;
            }
            Some(tls::assemble(settings)?)
        }
    };

    let inner = socket::bind(addr, config.fast_open).await?;
    let listener = Listener::new(inner, !config.naggle, tls);
    info!(
        addr = ?listener.local_addr().ok(),
        tls = listener.is_tls(),
        "listener ready"
    );
    Ok(listener)
}
