//! TLS verification against a local HTTPS event stream.
//!
//! A CA and a leaf certificate for `localhost` are generated per test. The
//! server speaks HTTP/1.1 over rustls, records the SNI name it was sent and
//! answers every request with one event on a stream that stays open.

use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::stream;
use hpx_eventsource::{
    EventSource, EventSourceConfig, IdentityCheck, SseEvent, SseStream, TlsOptions,
};
use http_body_util::{BodyExt, StreamBody};
use hyper::{
    Request, Response,
    body::{Bytes, Frame, Incoming},
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::{net::TcpListener, time::timeout};
use tokio_rustls::TlsAcceptor;

// ---------------------------------------------------------------------------
// Test PKI and HTTPS server
// ---------------------------------------------------------------------------

struct TestPki {
    ca_pem: String,
    leaf: CertificateDer<'static>,
    leaf_key: PrivateKeyDer<'static>,
}

fn generate_pki() -> TestPki {
    let ca_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).expect("generate CA key");
    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    let mut ca_dn = DistinguishedName::new();
    ca_dn.push(DnType::CommonName, "hpx-eventsource test CA");
    ca_params.distinguished_name = ca_dn;
    let ca_cert = ca_params.self_signed(&ca_key).expect("self-sign CA");
    let ca_pem = ca_cert.pem();
    let issuer = Issuer::new(ca_params, ca_key);

    let leaf_key =
        KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).expect("generate leaf key");
    let mut leaf_params =
        CertificateParams::new(vec!["localhost".to_string()]).expect("leaf params");
    leaf_params.is_ca = IsCa::NoCa;
    let mut leaf_dn = DistinguishedName::new();
    leaf_dn.push(DnType::CommonName, "localhost");
    leaf_params.distinguished_name = leaf_dn;
    let leaf = leaf_params
        .signed_by(&leaf_key, &issuer)
        .expect("sign leaf certificate");

    TestPki {
        ca_pem,
        leaf: leaf.der().clone(),
        leaf_key: PrivatePkcs8KeyDer::from(leaf_key.serialize_der()).into(),
    }
}

type SniLog = Arc<Mutex<Vec<Option<String>>>>;

/// Start an HTTPS server presenting the generated leaf certificate.
///
/// Failed handshakes are dropped; only completed ones reach the SNI log.
async fn start_tls_server(pki: &TestPki) -> (SocketAddr, SniLog) {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("server protocol versions")
        .with_no_client_auth()
        .with_single_cert(vec![pki.leaf.clone()], pki.leaf_key.clone_key())
        .expect("server certificate");
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind TLS server");
    let addr = listener.local_addr().expect("local addr");
    let sni: SniLog = Arc::new(Mutex::new(Vec::new()));
    let server_sni = Arc::clone(&sni);

    tokio::spawn(async move {
        loop {
            let Ok((tcp, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            let sni = Arc::clone(&server_sni);
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(tcp).await else {
                    return;
                };
                let name = tls.get_ref().1.server_name().map(str::to_owned);
                sni.lock().expect("lock sni").push(name);
                let _ = http1::Builder::new()
                    .serve_connection(
                        TokioIo::new(tls),
                        service_fn(|_req: Request<Incoming>| async {
                            let head = stream::iter(vec![Ok::<_, Infallible>(Frame::data(
                                Bytes::from_static(b"data: secure\n\n"),
                            ))]);
                            let body = StreamBody::new(futures_util::StreamExt::chain(
                                head,
                                stream::pending(),
                            ));
                            Ok::<_, Infallible>(
                                Response::builder()
                                    .status(200)
                                    .header("content-type", "text/event-stream")
                                    .body(body.boxed())
                                    .expect("build response"),
                            )
                        }),
                    )
                    .await;
            });
        }
    });

    (addr, sni)
}

fn config(host: &str, addr: SocketAddr) -> EventSourceConfig {
    EventSourceConfig::new(format!("https://{host}:{}/events", addr.port()))
        .reconnect_interval(Duration::from_secs(30))
}

async fn next(stream: &mut SseStream) -> SseEvent {
    timeout(Duration::from_secs(5), stream.next_event())
        .await
        .expect("timeout waiting for event")
        .expect("stream ended unexpectedly")
}

fn open(config: EventSourceConfig) -> (EventSource, SseStream) {
    let source = EventSource::new(config).expect("valid config");
    let stream = source.stream();
    source.start();
    (source, stream)
}

async fn assert_connects(stream: &mut SseStream) {
    assert_eq!(next(stream).await, SseEvent::Open);
    let event = next(stream).await;
    assert_eq!(event.as_message().expect("message").data(), "secure");
}

async fn assert_handshake_fails(stream: &mut SseStream) {
    let event = next(stream).await;
    let error = event.as_error().expect("handshake failure is an error event");
    assert_eq!(error.status, None);
}

// ---------------------------------------------------------------------------
// Chain verification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_default_roots_reject_untrusted_chain() {
    let pki = generate_pki();
    let (addr, sni) = start_tls_server(&pki).await;
    let (source, mut stream) = open(config("localhost", addr));

    assert_handshake_fails(&mut stream).await;
    assert!(sni.lock().expect("lock").is_empty());
    source.close();
}

#[tokio::test]
async fn test_configured_ca_is_trusted() {
    let pki = generate_pki();
    let (addr, sni) = start_tls_server(&pki).await;
    let config = config("localhost", addr).tls(TlsOptions::default().ca(pki.ca_pem.clone()));
    let (source, mut stream) = open(config);

    assert_connects(&mut stream).await;
    assert_eq!(*sni.lock().expect("lock"), vec![Some("localhost".to_string())]);
    source.close();
}

#[tokio::test]
async fn test_legacy_flag_accepts_untrusted_chain() {
    let pki = generate_pki();
    let (addr, _sni) = start_tls_server(&pki).await;
    let (source, mut stream) = open(config("127.0.0.1", addr).reject_unauthorized(false));

    assert_connects(&mut stream).await;
    source.close();
}

#[tokio::test]
async fn test_structured_option_overrides_legacy_flag() {
    let pki = generate_pki();
    let (addr, _sni) = start_tls_server(&pki).await;
    let config = config("localhost", addr)
        .reject_unauthorized(false)
        .tls(TlsOptions::default().reject_unauthorized(true));
    let (source, mut stream) = open(config);

    assert_handshake_fails(&mut stream).await;
    source.close();
}

// ---------------------------------------------------------------------------
// Hostname verification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_name_mismatch_fails_without_callback() {
    let pki = generate_pki();
    let (addr, _sni) = start_tls_server(&pki).await;
    let config = config("127.0.0.1", addr).tls(TlsOptions::default().ca(pki.ca_pem.clone()));
    let (source, mut stream) = open(config);

    assert_handshake_fails(&mut stream).await;
    source.close();
}

#[tokio::test]
async fn test_identity_callback_accepts_name_mismatch() {
    let pki = generate_pki();
    let (addr, _sni) = start_tls_server(&pki).await;
    let checked = Arc::new(Mutex::new(Vec::new()));
    let check = IdentityCheck::new({
        let checked = Arc::clone(&checked);
        move |host: &str, cert: &CertificateDer<'_>| {
            checked
                .lock()
                .expect("lock")
                .push((host.to_string(), cert.as_ref().to_vec()));
            Ok(())
        }
    });
    let tls = TlsOptions::default()
        .ca(pki.ca_pem.clone())
        .check_server_identity(check);
    let (source, mut stream) = open(config("127.0.0.1", addr).tls(tls));

    assert_connects(&mut stream).await;
    let checked = checked.lock().expect("lock");
    assert_eq!(checked.len(), 1);
    assert_eq!(checked[0].0, "127.0.0.1");
    assert_eq!(checked[0].1, pki.leaf.as_ref().to_vec());
    source.close();
}

#[tokio::test]
async fn test_identity_callback_rejection_fails_handshake() {
    let pki = generate_pki();
    let (addr, sni) = start_tls_server(&pki).await;
    let check = IdentityCheck::new(|host: &str, _: &CertificateDer<'_>| {
        Err(format!("{host} is not allowed"))
    });
    let tls = TlsOptions::default()
        .ca(pki.ca_pem.clone())
        .check_server_identity(check);
    let (source, mut stream) = open(config("localhost", addr).tls(tls));

    assert_handshake_fails(&mut stream).await;
    assert!(sni.lock().expect("lock").is_empty());
    source.close();
}

#[tokio::test]
async fn test_identity_callback_does_not_bypass_chain_check() {
    let pki = generate_pki();
    let (addr, _sni) = start_tls_server(&pki).await;
    let check = IdentityCheck::new(|_: &str, _: &CertificateDer<'_>| Ok(()));
    let (source, mut stream) = open(
        config("localhost", addr).tls(TlsOptions::default().check_server_identity(check)),
    );

    assert_handshake_fails(&mut stream).await;
    source.close();
}

#[tokio::test]
async fn test_servername_overrides_sni_and_verified_name() {
    let pki = generate_pki();
    let (addr, sni) = start_tls_server(&pki).await;
    let tls = TlsOptions::default()
        .ca(pki.ca_pem.clone())
        .servername("localhost");
    let (source, mut stream) = open(config("127.0.0.1", addr).tls(tls));

    assert_connects(&mut stream).await;
    assert_eq!(*sni.lock().expect("lock"), vec![Some("localhost".to_string())]);
    source.close();
}
