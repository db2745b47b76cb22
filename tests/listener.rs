//! Listener construction and end-to-end TLS tests.

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use gatehouse::autocert::{Authority, AutoCertError, IssuedCert};
use gatehouse::{bind, ClientAuthPolicy, ListenError, ListenOption};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Throwaway CA for signing server and client certificates.
struct TestCa {
    ca: rcgen::Certificate,
}

impl TestCa {
    fn new() -> Self {
        let mut params = rcgen::CertificateParams::new(Vec::new());
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "gatehouse test ca");
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        Self {
            ca: rcgen::Certificate::from_params(params).unwrap(),
        }
    }

    fn ca_pem(&self) -> String {
        self.ca.serialize_pem().unwrap()
    }

    /// Issue a leaf for `names`, returning (cert chain PEM, key PEM).
    fn issue(&self, names: &[&str]) -> (String, String) {
        let params = rcgen::CertificateParams::new(
            names.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
        );
        let leaf = rcgen::Certificate::from_params(params).unwrap();
        (
            leaf.serialize_pem_with_signer(&self.ca).unwrap(),
            leaf.serialize_private_key_pem(),
        )
    }
}

fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path
}

fn root_store(ca_pem: &str) -> RootCertStore {
    let ders: Vec<_> = rustls_pemfile::certs(&mut ca_pem.as_bytes())
        .collect::<Result<_, _>>()
        .unwrap();
    let mut roots = RootCertStore::empty();
    roots.add_parsable_certificates(ders);
    roots
}

fn client_config(ca_pem: &str, alpn: &[&[u8]]) -> rustls::ClientConfig {
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store(ca_pem))
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    config
}

async fn tls_connect(
    addr: SocketAddr,
    config: rustls::ClientConfig,
    sni: &str,
) -> std::io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let connector = TlsConnector::from(Arc::new(config));
    let tcp = TcpStream::connect(addr).await?;
    let name = ServerName::try_from(sni.to_string()).unwrap();
    connector.connect(name, tcp).await
}

/// Test authority signing leaves with its own CA so clients can verify
/// them.
struct CaAuthority {
    ca: TestCa,
    issued: AtomicUsize,
    registered: AtomicUsize,
    fail_register: bool,
}

impl CaAuthority {
    fn new() -> Self {
        Self {
            ca: TestCa::new(),
            issued: AtomicUsize::new(0),
            registered: AtomicUsize::new(0),
            fail_register: false,
        }
    }

    fn failing_registration() -> Self {
        Self {
            fail_register: true,
            ..Self::new()
        }
    }
}

impl std::fmt::Debug for CaAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaAuthority")
            .field("issued", &self.issued.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl Authority for CaAuthority {
    async fn register(&self, _email: &str) -> Result<(), AutoCertError> {
        self.registered.fetch_add(1, Ordering::SeqCst);
        if self.fail_register {
            return Err(AutoCertError::Registration("refused".to_string()));
        }
        Ok(())
    }

    async fn issue(&self, host: &str) -> Result<IssuedCert, AutoCertError> {
        self.issued.fetch_add(1, Ordering::SeqCst);
        let (chain_pem, key_pem) = self.ca.issue(&[host]);
        Ok(IssuedCert { chain_pem, key_pem })
    }
}

#[tokio::test]
async fn test_plain_listener_round_trip() {
    let listener = bind("127.0.0.1:0", []).await.unwrap();
    assert!(!listener.is_tls());
    assert!(listener.tls_config().is_none());
    let addr = listener.local_addr().unwrap();

    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let mut client = client.unwrap();
    let (mut stream, peer) = accepted.unwrap();
    assert_eq!(peer.ip(), addr.ip());
    assert!(!stream.is_tls());

    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
}

#[tokio::test]
async fn test_close_releases_address() {
    let listener = bind("127.0.0.1:0", []).await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let reused = bind(&addr.to_string(), []).await.unwrap();
    assert_eq!(reused.local_addr().unwrap(), addr);
}

#[tokio::test]
async fn test_fast_open_and_naggle_construct_everywhere() {
    let listener = bind("", [ListenOption::fast_open(), ListenOption::naggle()])
        .await
        .unwrap();
    assert!(!listener.is_tls());
}

#[tokio::test]
async fn test_invalid_address() {
    assert!(matches!(
        bind(":fail", []).await,
        Err(ListenError::Address { .. })
    ));
}

#[tokio::test]
async fn test_bad_cert_pair_returns_no_listener() {
    assert!(matches!(
        bind("", [ListenOption::static_cert("", "")]).await,
        Err(ListenError::CertPair { .. })
    ));
}

#[tokio::test]
async fn test_static_tls_end_to_end() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let ca = TestCa::new();
    let (cert_pem, key_pem) = ca.issue(&["localhost"]);
    let cert_path = write_file(&dir, "cert.pem", &cert_pem);
    let key_path = write_file(&dir, "key.pem", &key_pem);

    let listener = bind(
        "127.0.0.1:0",
        [ListenOption::static_cert(&cert_path, &key_path)],
    )
    .await
    .unwrap();
    assert!(listener.is_tls());
    assert!(listener.tls_config().is_some());
    let addr = listener.local_addr().unwrap();

    let (client, accepted) = tokio::join!(
        tls_connect(addr, client_config(&ca.ca_pem(), &[]), "localhost"),
        listener.accept()
    );
    let mut client = client.unwrap();
    let (mut stream, _) = accepted.unwrap();
    assert!(stream.is_tls());

    // The negotiated certificate is the supplied one.
    let leaf_der: Vec<_> = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<_, _>>()
        .unwrap();
    let presented = client.get_ref().1.peer_certificates().unwrap();
    assert_eq!(presented[0].as_ref(), leaf_der[0].as_ref());

    client.write_all(b"over tls").await.unwrap();
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"over tls");
}

#[tokio::test]
async fn test_http2_alpn_negotiation() {
    let dir = tempfile::tempdir().unwrap();
    let ca = TestCa::new();
    let (cert_pem, key_pem) = ca.issue(&["localhost"]);
    let cert_path = write_file(&dir, "cert.pem", &cert_pem);
    let key_path = write_file(&dir, "key.pem", &key_pem);

    let listener = bind(
        "127.0.0.1:0",
        [
            ListenOption::static_cert(&cert_path, &key_path),
            ListenOption::http2(),
        ],
    )
    .await
    .unwrap();
    let addr = listener.local_addr().unwrap();

    let (client, accepted) = tokio::join!(
        tls_connect(addr, client_config(&ca.ca_pem(), &[b"h2"]), "localhost"),
        listener.accept()
    );
    let client = client.unwrap();
    accepted.unwrap();
    assert_eq!(client.get_ref().1.alpn_protocol(), Some(&b"h2"[..]));
}

#[tokio::test]
async fn test_client_auth_require_and_verify() {
    let dir = tempfile::tempdir().unwrap();
    let ca = TestCa::new();
    let (cert_pem, key_pem) = ca.issue(&["localhost"]);
    let cert_path = write_file(&dir, "cert.pem", &cert_pem);
    let key_path = write_file(&dir, "key.pem", &key_pem);
    let ca_path = write_file(&dir, "cacert.pem", &ca.ca_pem());

    let listener = bind(
        "127.0.0.1:0",
        [
            ListenOption::static_cert(&cert_path, &key_path),
            ListenOption::client_auth(&ca_path, ClientAuthPolicy::RequireAndVerify),
        ],
    )
    .await
    .unwrap();
    let addr = listener.local_addr().unwrap();

    // Without a client certificate the handshake is rejected, and only
    // that connection is affected.
    let (client, accepted) = tokio::join!(
        async {
            let mut stream =
                tls_connect(addr, client_config(&ca.ca_pem(), &[]), "localhost").await?;
            // The rejection may arrive after the client considers the
            // handshake done; force a round trip.
            stream.write_all(b"x").await?;
            stream.read(&mut [0u8; 1]).await
        },
        listener.accept()
    );
    assert!(client.is_err() || accepted.is_err());

    // With a certificate from the trust pool the handshake completes.
    let (client_cert_pem, client_key_pem) = ca.issue(&["client.example.com"]);
    let client_chain: Vec<_> = rustls_pemfile::certs(&mut client_cert_pem.as_bytes())
        .collect::<Result<_, _>>()
        .unwrap();
    let client_key = rustls_pemfile::private_key(&mut client_key_pem.as_bytes())
        .unwrap()
        .unwrap();
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store(&ca.ca_pem()))
        .with_client_auth_cert(client_chain, client_key)
        .unwrap();

    let (client, accepted) = tokio::join!(
        tls_connect(addr, config, "localhost"),
        listener.accept()
    );
    client.unwrap();
    let (stream, _) = accepted.unwrap();
    assert!(stream.is_tls());
}

#[tokio::test]
async fn test_auto_certs_without_hosts_fails() {
    let err = bind(
        ":0",
        [ListenOption::auto_certs("", "", Vec::<String>::new())],
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ListenError::NoHosts));
}

#[tokio::test]
async fn test_auto_certs_installs_dynamic_resolver() {
    let dir = tempfile::tempdir().unwrap();
    let authority = Arc::new(CaAuthority::new());
    let listener = bind(
        "127.0.0.1:0",
        [ListenOption::auto_certs_with(
            dir.path().to_string_lossy().into_owned(),
            "",
            ["auto.example.com"],
            authority.clone(),
        )],
    )
    .await
    .unwrap();

    assert!(listener.is_tls());
    let config = listener.tls_config().unwrap();
    assert!(config.alpn_protocols.contains(&b"acme-tls/1".to_vec()));
    // Construction alone never issues.
    assert_eq!(authority.issued.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_auto_certs_end_to_end() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let authority = Arc::new(CaAuthority::new());
    let listener = bind(
        "127.0.0.1:0",
        [ListenOption::auto_certs_with(
            dir.path().to_string_lossy().into_owned(),
            "",
            ["auto.example.com"],
            authority.clone(),
        )],
    )
    .await
    .unwrap();
    let addr = listener.local_addr().unwrap();
    let ca_pem = authority.ca.ca_pem();

    // First connection triggers issuance.
    let (client, accepted) = tokio::join!(
        tls_connect(addr, client_config(&ca_pem, &[]), "auto.example.com"),
        listener.accept()
    );
    client.unwrap();
    accepted.unwrap();
    assert_eq!(authority.issued.load(Ordering::SeqCst), 1);

    // Second connection is served from the cache.
    let (client, accepted) = tokio::join!(
        tls_connect(addr, client_config(&ca_pem, &[]), "auto.example.com"),
        listener.accept()
    );
    client.unwrap();
    accepted.unwrap();
    assert_eq!(authority.issued.load(Ordering::SeqCst), 1);

    // A hostname outside the allow-list fails closed without reaching
    // the authority, and the listener keeps serving afterwards.
    let (client, accepted) = tokio::join!(
        tls_connect(addr, client_config(&ca_pem, &[]), "other.example.com"),
        listener.accept()
    );
    assert!(client.is_err() || accepted.is_err());
    assert_eq!(authority.issued.load(Ordering::SeqCst), 1);

    let (client, accepted) = tokio::join!(
        tls_connect(addr, client_config(&ca_pem, &[]), "auto.example.com"),
        listener.accept()
    );
    client.unwrap();
    accepted.unwrap();
}

#[tokio::test]
async fn test_static_certificate_takes_precedence_over_resolver() {
    let dir = tempfile::tempdir().unwrap();
    let static_ca = TestCa::new();
    let (cert_pem, key_pem) = static_ca.issue(&["localhost"]);
    let cert_path = write_file(&dir, "cert.pem", &cert_pem);
    let key_path = write_file(&dir, "key.pem", &key_pem);

    let authority = Arc::new(CaAuthority::new());
    let listener = bind(
        "127.0.0.1:0",
        [
            ListenOption::static_cert(&cert_path, &key_path),
            ListenOption::auto_certs_with(
                dir.path().join("cache").to_string_lossy().into_owned(),
                "",
                ["localhost"],
                authority.clone(),
            ),
        ],
    )
    .await
    .unwrap();
    let addr = listener.local_addr().unwrap();

    // The client trusts only the static CA; the handshake succeeding
    // proves the static certificate was served and the resolver skipped.
    let (client, accepted) = tokio::join!(
        tls_connect(addr, client_config(&static_ca.ca_pem(), &[]), "localhost"),
        listener.accept()
    );
    client.unwrap();
    accepted.unwrap();
    assert_eq!(authority.issued.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_registration_runs_eagerly() {
    let dir = tempfile::tempdir().unwrap();
    let authority = Arc::new(CaAuthority::new());
    bind(
        "127.0.0.1:0",
        [ListenOption::auto_certs_with(
            dir.path().to_string_lossy().into_owned(),
            "ops@example.com",
            ["auto.example.com"],
            authority.clone(),
        )],
    )
    .await
    .unwrap();
    assert_eq!(authority.registered.load(Ordering::SeqCst), 1);
    assert_eq!(authority.issued.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_registration_failure_aborts_construction() {
    let dir = tempfile::tempdir().unwrap();
    let authority = Arc::new(CaAuthority::failing_registration());
    let err = bind(
        "127.0.0.1:0",
        [ListenOption::auto_certs_with(
            dir.path().to_string_lossy().into_owned(),
            "ops@example.com",
            ["auto.example.com"],
            authority.clone(),
        )],
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ListenError::AutoCert(_)));
    assert_eq!(authority.registered.load(Ordering::SeqCst), 1);
}
