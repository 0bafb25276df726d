mod harness;

use std::sync::Arc;
use std::time::Duration;

use harness::{
    alpn_tls_connector, body, get, read_response, test_config, tls_connect, tls_connector, HttpBackend,
    ProxyHandle, TlsBackend,
};
use rstest::rstest;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tapwire_proxy::config::{ClientAuthSettings, IdentityConfig, TlsSettings};
use tapwire_proxy::proxy::ServerIdentity;
use tapwire_proxy::{ConnectionStatus, ProxyConfig, RouteSpec};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

fn self_signed(name: &str) -> (String, String) {
    let cert = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
    (cert.cert.pem(), cert.key_pair.serialize_pem())
}

#[tokio::test]
async fn issues_certificate_for_sni_and_records_session() {
    let backend = HttpBackend::spawn("plain").await.unwrap();
    let handle = ProxyHandle::start(test_config()).await;
    handle
        .proxy
        .add_route(RouteSpec::new("/", format!("http://{}/", backend.addr)).with_host("site.test"))
        .unwrap();

    let connector = tls_connector(&handle.proxy.ca_certificate_pem(), None);
    let mut tls = tls_connect(&connector, handle.addr(), "site.test").await.unwrap();
    let negotiated = format!("{:?}", tls.get_ref().1.negotiated_cipher_suite().unwrap().suite());

    tls.write_all(get("/hello", "site.test").as_bytes()).await.unwrap();
    let response = read_response(&mut tls).await.unwrap();
    assert_eq!(body(&response), "plain /hello");

    let open = handle.proxy.open_connections(Some(ConnectionStatus::OpenTls));
    assert_eq!(open.len(), 1);
    assert!(handle.proxy.open_connections(Some(ConnectionStatus::Open)).is_empty());

    let units = handle
        .sink
        .wait_for(Duration::from_secs(2), |u| !u.is_empty())
        .await
        .unwrap();
    let session = units[0].tls.as_ref().expect("TLS session attached");
    assert_eq!(session.server_name.as_deref(), Some("site.test"));
    assert_eq!(session.cipher_suite, negotiated);
    assert_eq!(session.protocol_version, "TLSv1.3");
    assert!(units[0].bytes.starts_with(b"GET /hello HTTP/1.1\r\n"));
}

#[tokio::test]
async fn disallowed_protocol_version_fails_handshake() {
    let handle = ProxyHandle::start(ProxyConfig {
        tls: TlsSettings {
            protocols: vec!["TLSv1.3".into()],
            ..TlsSettings::default()
        },
        ..test_config()
    })
    .await;

    let connector = tls_connector(&handle.proxy.ca_certificate_pem(), Some(&[&rustls::version::TLS12][..]));
    assert!(tls_connect(&connector, handle.addr(), "site.test").await.is_err());
    assert!(handle.wait_for_error("TLS", Duration::from_secs(2)).await);
    assert!(handle.wait_until_idle(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn configured_cipher_suite_is_negotiated_and_recorded() {
    let backend = HttpBackend::spawn("suite").await.unwrap();
    let suite = "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256";
    let handle = ProxyHandle::start(ProxyConfig {
        tls: TlsSettings {
            protocols: vec!["TLSv1.2".into()],
            cipher_suites: vec![suite.into()],
            ..TlsSettings::default()
        },
        ..test_config()
    })
    .await;
    handle
        .proxy
        .add_route(RouteSpec::new("/", format!("http://{}/", backend.addr)))
        .unwrap();

    let connector = tls_connector(&handle.proxy.ca_certificate_pem(), None);
    let mut tls = tls_connect(&connector, handle.addr(), "suite.test").await.unwrap();
    let negotiated = format!("{:?}", tls.get_ref().1.negotiated_cipher_suite().unwrap().suite());
    assert_eq!(negotiated, suite);

    tls.write_all(get("/", "suite.test").as_bytes()).await.unwrap();
    read_response(&mut tls).await.unwrap();

    let units = handle
        .sink
        .wait_for(Duration::from_secs(2), |u| !u.is_empty())
        .await
        .unwrap();
    let session = units[0].tls.as_ref().unwrap();
    assert_eq!(session.cipher_suite, suite);
    assert_eq!(session.protocol_version, "TLSv1.2");
}

#[tokio::test]
async fn configured_identity_is_served_for_its_domain() {
    let backend = HttpBackend::spawn("configured").await.unwrap();
    let (cert_pem, key_pem) = self_signed("configured.test");
    let handle = ProxyHandle::start(ProxyConfig {
        tls: TlsSettings {
            server_identities: vec![IdentityConfig {
                name: "main".into(),
                certificate_pem: cert_pem.clone(),
                private_key_pem: key_pem,
                domains: Vec::new(),
            }],
            ..TlsSettings::default()
        },
        ..test_config()
    })
    .await;
    handle
        .proxy
        .add_route(RouteSpec::new("/", format!("http://{}/", backend.addr)))
        .unwrap();

    let connector = tls_connector(&cert_pem, None);
    let mut tls = tls_connect(&connector, handle.addr(), "configured.test").await.unwrap();
    tls.write_all(get("/x", "configured.test").as_bytes()).await.unwrap();
    assert_eq!(body(&read_response(&mut tls).await.unwrap()), "configured /x");

    // Other names still get an issued certificate.
    let ca = tls_connector(&handle.proxy.ca_certificate_pem(), None);
    assert!(tls_connect(&ca, handle.addr(), "elsewhere.test").await.is_ok());
}

#[tokio::test]
async fn identity_added_at_runtime_serves_new_connections() {
    let handle = ProxyHandle::start(test_config()).await;
    let (cert_pem, key_pem) = self_signed("hot.test");
    let connector = tls_connector(&cert_pem, None);

    assert!(tls_connect(&connector, handle.addr(), "hot.test").await.is_err());

    let identity = ServerIdentity::from_pem("hot", &cert_pem, &key_pem, &[]).unwrap();
    handle.proxy.tls_identities().add_identity(identity).unwrap();
    assert!(tls_connect(&connector, handle.addr(), "hot.test").await.is_ok());

    assert!(handle.proxy.tls_identities().remove_identity("hot"));
    assert!(tls_connect(&connector, handle.addr(), "hot.test").await.is_err());
}

#[tokio::test]
async fn reoriginates_tls_to_trusted_upstream() {
    let backend = TlsBackend::spawn(&["localhost"], "secure").await.unwrap();
    let handle = ProxyHandle::start(ProxyConfig {
        tls: TlsSettings {
            upstream_trust_roots_pem: vec![backend.cert_pem.clone()],
            ..TlsSettings::default()
        },
        ..test_config()
    })
    .await;
    handle
        .proxy
        .add_route(
            RouteSpec::new("/", format!("https://localhost:{}/api", backend.addr.port()))
                .with_host("secure.test"),
        )
        .unwrap();

    let connector = tls_connector(&handle.proxy.ca_certificate_pem(), None);
    let mut tls = tls_connect(&connector, handle.addr(), "secure.test").await.unwrap();
    tls.write_all(get("/v1", "secure.test").as_bytes()).await.unwrap();
    assert_eq!(body(&read_response(&mut tls).await.unwrap()), "secure /api/v1");
    assert_eq!(backend.request_lines(), vec!["GET /api/v1 HTTP/1.1".to_string()]);
}

#[tokio::test]
async fn untrusted_upstream_is_unreachable() {
    let backend = TlsBackend::spawn(&["localhost"], "secure").await.unwrap();
    let handle = ProxyHandle::start(test_config()).await;
    handle
        .proxy
        .add_route(RouteSpec::new("/", format!("https://localhost:{}/", backend.addr.port())))
        .unwrap();

    let connector = tls_connector(&handle.proxy.ca_certificate_pem(), None);
    let mut tls = tls_connect(&connector, handle.addr(), "strict.test").await.unwrap();
    tls.write_all(get("/", "strict.test").as_bytes()).await.unwrap();
    assert!(read_response(&mut tls).await.is_err());
    assert!(handle.wait_for_error("no upstream reachable", Duration::from_secs(3)).await);
}

#[tokio::test]
async fn client_certificate_is_captured() {
    let backend = HttpBackend::spawn("mtls").await.unwrap();
    let handle = ProxyHandle::start(ProxyConfig {
        tls: TlsSettings {
            client_auth: ClientAuthSettings {
                request: true,
                trust_roots_pem: Vec::new(),
            },
            ..TlsSettings::default()
        },
        ..test_config()
    })
    .await;
    handle
        .proxy
        .add_route(RouteSpec::new("/", format!("http://{}/", backend.addr)))
        .unwrap();

    let client_cert = rcgen::generate_simple_self_signed(vec!["client.test".to_string()]).unwrap();
    let client_der = client_cert.cert.der().to_vec();
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut handle.proxy.ca_certificate_pem().as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(
            vec![CertificateDer::from(client_der.clone())],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(client_cert.key_pair.serialize_der())),
        )
        .unwrap();
    let connector = TlsConnector::from(Arc::new(config));
    let tcp = TcpStream::connect(handle.addr()).await.unwrap();
    let mut tls = connector
        .connect(ServerName::try_from("mtls.test").unwrap(), tcp)
        .await
        .unwrap();
    tls.write_all(get("/", "mtls.test").as_bytes()).await.unwrap();
    read_response(&mut tls).await.unwrap();

    let units = handle
        .sink
        .wait_for(Duration::from_secs(2), |u| !u.is_empty())
        .await
        .unwrap();
    let session = units[0].tls.as_ref().unwrap();
    assert_eq!(session.client_certificates.len(), 1);
    assert_eq!(&session.client_certificates[0][..], &client_der[..]);
}

#[rstest]
#[case::no_offer(vec![], None)]
#[case::h2_only(vec!["h2"], None)]
#[case::non_http_protocol(vec!["imap"], Some("imap"))]
#[case::h2_then_http1(vec!["h2", "http/1.1"], Some("http/1.1"))]
#[tokio::test]
async fn alpn_follows_the_client_offer(#[case] offered: Vec<&str>, #[case] expected: Option<&str>) {
    let backend = HttpBackend::spawn("alpn").await.unwrap();
    let handle = ProxyHandle::start(test_config()).await;
    handle
        .proxy
        .add_route(RouteSpec::new("/", format!("http://{}/", backend.addr)))
        .unwrap();

    let connector = alpn_tls_connector(&handle.proxy.ca_certificate_pem(), &offered);
    let mut tls = tls_connect(&connector, handle.addr(), "alpn.test").await.unwrap();
    let negotiated = tls
        .get_ref()
        .1
        .alpn_protocol()
        .map(|p| String::from_utf8_lossy(p).into_owned());
    assert_eq!(negotiated.as_deref(), expected);

    tls.write_all(get("/a", "alpn.test").as_bytes()).await.unwrap();
    assert_eq!(body(&read_response(&mut tls).await.unwrap()), "alpn /a");

    let units = handle
        .sink
        .wait_for(Duration::from_secs(2), |u| !u.is_empty())
        .await
        .unwrap();
    assert_eq!(units[0].tls.as_ref().unwrap().alpn.as_deref(), expected);
}

#[tokio::test]
async fn h2_is_negotiated_only_when_enabled() {
    let handle = ProxyHandle::start(ProxyConfig {
        tls: TlsSettings {
            enable_http2: true,
            ..TlsSettings::default()
        },
        ..test_config()
    })
    .await;

    let connector = alpn_tls_connector(&handle.proxy.ca_certificate_pem(), &["h2", "http/1.1"]);
    let tls = tls_connect(&connector, handle.addr(), "h2.test").await.unwrap();
    assert_eq!(tls.get_ref().1.alpn_protocol(), Some(b"h2".as_slice()));
}

#[tokio::test]
async fn upstream_is_offered_the_client_protocol() {
    let backend = TlsBackend::spawn_with_alpn(&["localhost"], "mirror", &["http/1.1"]).await.unwrap();
    let handle = ProxyHandle::start(ProxyConfig {
        tls: TlsSettings {
            upstream_trust_roots_pem: vec![backend.cert_pem.clone()],
            ..TlsSettings::default()
        },
        ..test_config()
    })
    .await;
    handle
        .proxy
        .add_route(RouteSpec::new("/", format!("https://localhost:{}/", backend.addr.port())))
        .unwrap();

    let with_alpn = alpn_tls_connector(&handle.proxy.ca_certificate_pem(), &["http/1.1"]);
    let mut tls = tls_connect(&with_alpn, handle.addr(), "mirror.test").await.unwrap();
    tls.write_all(get("/one", "mirror.test").as_bytes()).await.unwrap();
    assert_eq!(body(&read_response(&mut tls).await.unwrap()), "mirror /one");

    let without_alpn = tls_connector(&handle.proxy.ca_certificate_pem(), None);
    let mut tls = tls_connect(&without_alpn, handle.addr(), "mirror.test").await.unwrap();
    tls.write_all(get("/two", "mirror.test").as_bytes()).await.unwrap();
    assert_eq!(body(&read_response(&mut tls).await.unwrap()), "mirror /two");

    assert_eq!(backend.negotiated_alpn(), vec![Some("http/1.1".to_string()), None]);
}
