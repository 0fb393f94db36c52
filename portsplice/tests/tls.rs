// portsplice/tests/tls.rs
//
// TLS termination (HTTPS client → engine → cleartext backend) and TLS
// origination (cleartext client → engine → TLS backend), both against
// self-signed certificates generated on the fly.


use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use portsplice::{EngineConfig, ProxyEngine, ProxyError};

use harness::*;

const TICK: Duration = Duration::from_secs(5);

static DIR_SEQ: AtomicU32 = AtomicU32::new(0);

/// Self-signed material written in the engine's cert-dir layout. Returns the
/// directory and the certificate DER for the client's trust store.
fn write_cert_dir(names: &[&str]) -> (PathBuf, rcgen::CertifiedKey) {
    let cert = rcgen::generate_simple_self_signed(
        names.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
    )
    .unwrap();

    let dir = std::env::temp_dir().join(format!(
        "portsplice-tls-{}-{}",
        std::process::id(),
        DIR_SEQ.fetch_add(1, Ordering::Relaxed),
    ));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("server.crt"), cert.cert.pem()).unwrap();
    std::fs::write(dir.join("server.key"), cert.key_pair.serialize_pem()).unwrap();
    (dir, cert)
}

/// TLS echo backend using the given self-signed material.
async fn spawn_tls_echo(cert: &rcgen::CertifiedKey) -> SocketAddr {
    let certs = vec![cert.cert.der().clone()];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(stream).await else { return };
                let mut buf = vec![0u8; 8192];
                loop {
                    match tls.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tls.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn terminates_tls_for_a_plain_backend() {
    let (cert_dir, cert) = write_cert_dir(&["localhost"]);
    let (backend, received) = spawn_echo().await;

    let cfg = EngineConfig { cert_dir, ..EngineConfig::default() };
    let engine = ProxyEngine::new(cfg, None);
    let key = loopback_key();
    let mut spec = unicast_spec("", 1, &[backend]);
    spec.tls_accept = true;
    engine.add_rule(key, spec).unwrap();
    let addr = engine.listen_addr(&key).unwrap();

    // HTTPS client trusting the engine's self-signed cert.
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert.cert.der().clone()).unwrap();
    let client_cfg = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_cfg));

    let tcp = TcpStream::connect(addr).await.unwrap();
    let name = ServerName::try_from("localhost").unwrap();
    let mut tls = timeout(TICK, connector.connect(name, tcp)).await.unwrap().unwrap();

    let request = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
    tls.write_all(request).await.unwrap();

    // The backend saw cleartext and echoed; the echo comes back encrypted.
    let mut back = vec![0u8; request.len()];
    timeout(TICK, tls.read_exact(&mut back)).await.unwrap().unwrap();
    assert_eq!(&back, request);
    assert_eq!(received.load(Ordering::Relaxed), request.len() as u64);

    engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn originates_tls_toward_the_backend() {
    let (_dir, cert) = write_cert_dir(&["localhost"]);
    let backend = spawn_tls_echo(&cert).await;

    let cfg = EngineConfig { ep_skip_verify: true, ..EngineConfig::default() };
    let engine = ProxyEngine::new(cfg, None);
    let key = loopback_key();
    let mut spec = unicast_spec("", 1, &[backend]);
    spec.tls_connect = true;
    engine.add_rule(key, spec).unwrap();
    let addr = engine.listen_addr(&key).unwrap();

    // Plain client; the engine encrypts on the way to the backend.
    let request = b"GET / HTTP/1.1\r\nHost: any\r\n\r\n";
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(request).await.unwrap();

    let mut back = vec![0u8; request.len()];
    timeout(TICK, client.read_exact(&mut back)).await.unwrap().unwrap();
    assert_eq!(&back, request);

    engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tls_both_sides_of_the_flow() {
    let (cert_dir, cert) = write_cert_dir(&["localhost"]);
    let backend = spawn_tls_echo(&cert).await;

    let cfg = EngineConfig { cert_dir, ep_skip_verify: true, ..EngineConfig::default() };
    let engine = ProxyEngine::new(cfg, None);
    let key = loopback_key();
    let mut spec = unicast_spec("", 1, &[backend]);
    spec.tls_accept = true;
    spec.tls_connect = true;
    engine.add_rule(key, spec).unwrap();
    let addr = engine.listen_addr(&key).unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert.cert.der().clone()).unwrap();
    let client_cfg = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_cfg));

    let tcp = TcpStream::connect(addr).await.unwrap();
    let name = ServerName::try_from("localhost").unwrap();
    let mut tls = timeout(TICK, connector.connect(name, tcp)).await.unwrap().unwrap();

    let request = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
    tls.write_all(request).await.unwrap();
    let mut back = vec![0u8; request.len()];
    timeout(TICK, tls.read_exact(&mut back)).await.unwrap().unwrap();
    assert_eq!(&back, request);

    engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tls_rule_without_certificates_is_rejected() {
    let cfg = EngineConfig {
        cert_dir: PathBuf::from("/nonexistent-portsplice-certs"),
        ..EngineConfig::default()
    };
    let engine = ProxyEngine::new(cfg, None);
    let key = loopback_key();
    let mut spec = unicast_spec("", 1, &["127.0.0.1:9000".parse().unwrap()]);
    spec.tls_accept = true;
    let err = engine.add_rule(key, spec).unwrap_err();
    assert!(matches!(err, ProxyError::Tls(_)));
    // Nothing was installed.
    assert!(engine.listen_addr(&key).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn per_host_certificate_is_preferred() {
    // Root cert says "fallback.test"; the site directory for a.test carries
    // its own cert. A client for a.test must be served the site cert.
    let (cert_dir, _root) = write_cert_dir(&["fallback.test"]);
    let site = rcgen::generate_simple_self_signed(vec!["a.test".to_string()]).unwrap();
    let site_dir = cert_dir.join("a.test");
    std::fs::create_dir_all(&site_dir).unwrap();
    std::fs::write(site_dir.join("server.crt"), site.cert.pem()).unwrap();
    std::fs::write(site_dir.join("server.key"), site.key_pair.serialize_pem()).unwrap();

    let (backend, _received) = spawn_echo().await;
    let cfg = EngineConfig { cert_dir, ..EngineConfig::default() };
    let engine = ProxyEngine::new(cfg, None);
    let key = loopback_key();
    let mut spec = unicast_spec("a.test", 1, &[backend]);
    spec.tls_accept = true;
    engine.add_rule(key, spec).unwrap();
    let addr = engine.listen_addr(&key).unwrap();

    // Trusting only the site cert works iff the engine picked it.
    let mut roots = rustls::RootCertStore::empty();
    roots.add(site.cert.der().clone()).unwrap();
    let client_cfg = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_cfg));

    let tcp = TcpStream::connect(addr).await.unwrap();
    let name = ServerName::try_from("a.test").unwrap();
    let mut tls = timeout(TICK, connector.connect(name, tcp)).await.unwrap().unwrap();

    let request = b"GET / HTTP/1.1\r\nHost: a.test\r\n\r\n";
    tls.write_all(request).await.unwrap();
    let mut back = vec![0u8; request.len()];
    timeout(TICK, tls.read_exact(&mut back)).await.unwrap().unwrap();
    assert_eq!(&back, request);

    engine.stop();
}
