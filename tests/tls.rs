mod support;

use std::time::Duration;

use xylo::tls::rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use xylo::tls::rustls::RootCertStore;
use xylo::{Client, HostPort, Server, ServerHandle, Value};

struct TlsFixture {
    addr: std::net::SocketAddr,
    cert_der: xylo::tls::rustls::pki_types::CertificateDer<'static>,
    _handle: ServerHandle,
}

fn spawn_tls_echo() -> TlsFixture {
    support::init_tracing();
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = generated.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        generated.key_pair.serialize_der(),
    ));

    let mut server = Server::bind(&HostPort::new("127.0.0.1", 0).unwrap()).unwrap();
    support::register_echo(&mut server);
    server.set_tls(xylo::tls::server_config(vec![cert_der.clone()], key).unwrap());
    let addr = server.local_addr().unwrap();
    let handle = server.handle();
    tokio::spawn(server.serve());

    TlsFixture {
        addr,
        cert_der,
        _handle: handle,
    }
}

#[tokio::test]
async fn https_round_trip_with_trusted_root() {
    let fixture = spawn_tls_echo();

    let mut roots = RootCertStore::empty();
    roots.add(fixture.cert_der.clone()).unwrap();
    let mut client = Client::new_tls(
        HostPort::new("127.0.0.1", fixture.addr.port()).unwrap(),
        xylo::tls::client_config(roots),
    )
    .unwrap();
    // the certificate names "localhost", not the dialed IP
    client.set_expected_hostname("localhost").unwrap();

    let resp = client.execute("echo", vec![Value::from("over tls")]).await.unwrap();
    assert_eq!(resp.value(), Some(&Value::String("over tls".into())));
}

#[tokio::test]
async fn hostname_mismatch_fails_the_handshake() {
    let fixture = spawn_tls_echo();

    let mut roots = RootCertStore::empty();
    roots.add(fixture.cert_der.clone()).unwrap();
    let mut client = Client::new_tls(
        HostPort::new("127.0.0.1", fixture.addr.port()).unwrap(),
        xylo::tls::client_config(roots),
    )
    .unwrap();
    client.set_expected_hostname("example.com").unwrap();

    assert!(client.execute("echo", vec![]).await.is_err());
}

#[tokio::test]
async fn pinned_fingerprint_accepts_the_right_certificate() {
    let fixture = spawn_tls_echo();

    let fingerprint = xylo::tls::certificate_fingerprint(&fixture.cert_der);
    let mut client = Client::new_tls(
        HostPort::new("127.0.0.1", fixture.addr.port()).unwrap(),
        xylo::tls::client_config_pinned(&fingerprint).unwrap(),
    )
    .unwrap();
    client.set_keep_alive(true);

    let resp = client.execute("echo", vec![Value::from(11)]).await.unwrap();
    assert_eq!(resp.value(), Some(&Value::Int(11)));
    // keep-alive works across the TLS session too
    let resp = client.execute("echo", vec![Value::from(12)]).await.unwrap();
    assert_eq!(resp.value(), Some(&Value::Int(12)));
}

#[tokio::test]
async fn pinned_fingerprint_rejects_the_wrong_certificate() {
    let fixture = spawn_tls_echo();

    let wrong = "0".repeat(64);
    let mut client = Client::new_tls(
        HostPort::new("127.0.0.1", fixture.addr.port()).unwrap(),
        xylo::tls::client_config_pinned(&wrong).unwrap(),
    )
    .unwrap();
    client.set_timeout(Some(Duration::from_secs(5)));

    let err = client.execute("echo", vec![]).await.unwrap_err();
    assert!(!err.is_timeout());
}
