//! Test harness for proxy integration tests.
//!
//! Provides helpers to spawn TCP/HTTP/TLS backends, a proxy wired to a
//! recording sink, and TLS clients that trust the proxy's CA.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use tapwire_proxy::{Proxy, ProxyBuilder, ProxyConfig, ProxyError, RecordingSink, TrafficSink};

static INIT_CRYPTO: Once = Once::new();

pub fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Echoes every byte back and remembers what it received.
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    received: Arc<Mutex<Vec<u8>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let received_clone = Arc::clone(&received);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        let Ok((mut stream, _)) = accept_result else { break };
                        conn_clone.fetch_add(1, Ordering::Relaxed);
                        let received = Arc::clone(&received_clone);
                        tokio::spawn(async move {
                            let mut buf = vec![0u8; 8192];
                            loop {
                                match stream.read(&mut buf).await {
                                    Ok(0) | Err(_) => break,
                                    Ok(n) => {
                                        lock(&received).extend_from_slice(&buf[..n]);
                                        if stream.write_all(&buf[..n]).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn received(&self) -> Vec<u8> {
        lock(&self.received).clone()
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Answers every HTTP/1.1 request with `"{marker} {request target}"`.
pub struct HttpBackend {
    pub addr: SocketAddr,
    heads: Arc<Mutex<Vec<String>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl HttpBackend {
    pub async fn spawn(marker: &str) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let heads = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let heads_clone = Arc::clone(&heads);
        let marker = marker.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        let Ok((stream, _)) = accept_result else { break };
                        tokio::spawn(serve_http(stream, marker.clone(), Arc::clone(&heads_clone)));
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            heads,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Full request heads in arrival order.
    pub fn heads(&self) -> Vec<String> {
        lock(&self.heads).clone()
    }

    /// First line of each request.
    pub fn request_lines(&self) -> Vec<String> {
        self.heads()
            .iter()
            .filter_map(|h| h.lines().next().map(str::to_string))
            .collect()
    }
}

impl Drop for HttpBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn serve_http<S>(mut stream: S, marker: String, heads: Arc<Mutex<Vec<String>>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut pending = Vec::new();
    let mut buf = vec![0u8; 8192];
    loop {
        while let Some(end) = find_head_end(&pending) {
            let head = String::from_utf8_lossy(&pending[..end]).into_owned();
            pending.drain(..end);
            let target = head.split(' ').nth(1).unwrap_or("").to_string();
            lock(&heads).push(head);

            let body = format!("{marker} {target}");
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            );
            if stream.write_all(response.as_bytes()).await.is_err() {
                return;
            }
        }
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => pending.extend_from_slice(&buf[..n]),
        }
    }
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// HTTP backend behind TLS with a self-signed certificate.
pub struct TlsBackend {
    pub addr: SocketAddr,
    pub cert_pem: String,
    pub connections: Arc<AtomicU64>,
    heads: Arc<Mutex<Vec<String>>>,
    alpn: Arc<Mutex<Vec<Option<String>>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TlsBackend {
    pub async fn spawn(names: &[&str], marker: &str) -> io::Result<Self> {
        Self::spawn_with_alpn(names, marker, &[]).await
    }

    /// Backend that negotiates one of `protocols` when the client offers it.
    pub async fn spawn_with_alpn(names: &[&str], marker: &str, protocols: &[&str]) -> io::Result<Self> {
        init_crypto_provider();

        let cert = rcgen::generate_simple_self_signed(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
            .map_err(io::Error::other)?;
        let cert_pem = cert.cert.pem();
        let certs = vec![CertificateDer::from(cert.cert.der().to_vec())];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));

        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(io::Error::other)?;
        config.alpn_protocols = protocols.iter().map(|p| p.as_bytes().to_vec()).collect();
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let connections = Arc::new(AtomicU64::new(0));
        let heads = Arc::new(Mutex::new(Vec::new()));
        let alpn = Arc::new(Mutex::new(Vec::new()));

        let conn_clone = Arc::clone(&connections);
        let heads_clone = Arc::clone(&heads);
        let alpn_clone = Arc::clone(&alpn);
        let marker = marker.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        let Ok((stream, _)) = accept_result else { break };
                        conn_clone.fetch_add(1, Ordering::Relaxed);
                        let acceptor = acceptor.clone();
                        let marker = marker.clone();
                        let heads = Arc::clone(&heads_clone);
                        let alpn = Arc::clone(&alpn_clone);
                        tokio::spawn(async move {
                            if let Ok(tls) = acceptor.accept(stream).await {
                                let negotiated = tls
                                    .get_ref()
                                    .1
                                    .alpn_protocol()
                                    .map(|p| String::from_utf8_lossy(p).into_owned());
                                lock(&alpn).push(negotiated);
                                serve_http(tls, marker, heads).await;
                            }
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            cert_pem,
            connections,
            heads,
            alpn,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// ALPN protocol negotiated on each accepted connection.
    pub fn negotiated_alpn(&self) -> Vec<Option<String>> {
        lock(&self.alpn).clone()
    }

    pub fn request_lines(&self) -> Vec<String> {
        lock(&self.heads)
            .iter()
            .filter_map(|h| h.lines().next().map(str::to_string))
            .collect()
    }
}

impl Drop for TlsBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Configuration with timeouts short enough for tests.
pub fn test_config() -> ProxyConfig {
    ProxyConfig {
        connect_timeout_ms: 500,
        handshake_timeout_ms: 2000,
        sniff_timeout_ms: 100,
        head_timeout_ms: 500,
        relay_linger_ms: 300,
        ..ProxyConfig::default()
    }
}

/// A running proxy plus everything it reported.
pub struct ProxyHandle {
    pub proxy: Proxy,
    pub sink: Arc<RecordingSink>,
    errors: Arc<Mutex<Vec<String>>>,
}

impl ProxyHandle {
    pub async fn start(config: ProxyConfig) -> Self {
        Self::start_with(ProxyBuilder::new(config)).await
    }

    pub async fn start_with(builder: ProxyBuilder) -> Self {
        let sink = RecordingSink::new();
        Self::launch(builder.sink(sink.clone()), sink).await
    }

    /// Start with a custom sink; `self.sink` then stays empty.
    pub async fn start_with_sink(builder: ProxyBuilder, custom: Arc<dyn TrafficSink>) -> Self {
        Self::launch(builder.sink(custom), RecordingSink::new()).await
    }

    async fn launch(builder: ProxyBuilder, sink: Arc<RecordingSink>) -> Self {
        init_crypto_provider();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let errors_clone = Arc::clone(&errors);
        let proxy = builder
            .exception_listener(Arc::new(
                move |_: Option<tapwire_proxy::ConnectionId>, e: &ProxyError| {
                    lock(&errors_clone).push(e.to_string());
                },
            ))
            .start()
            .await
            .expect("proxy starts");
        Self { proxy, sink, errors }
    }

    pub fn addr(&self) -> SocketAddr {
        self.proxy.local_addr()
    }

    pub fn errors(&self) -> Vec<String> {
        lock(&self.errors).clone()
    }

    /// Wait until a reported error contains `needle`.
    pub async fn wait_for_error(&self, needle: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.errors().iter().any(|e| e.contains(needle)) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// Wait until no connection is open.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.proxy.open_connections(None).is_empty() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

/// Read one HTTP response (head plus `Content-Length` body).
pub async fn read_response<S>(stream: &mut S) -> io::Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        if let Some(end) = find_head_end(&data) {
            let head = String::from_utf8_lossy(&data[..end]).to_ascii_lowercase();
            let length = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if data.len() >= end + length {
                return Ok(String::from_utf8_lossy(&data[..end + length]).into_owned());
            }
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "response truncated"));
        }
        data.extend_from_slice(&buf[..n]);
    }
}

/// Send `request` over a fresh plaintext connection and read the response.
pub async fn http_exchange(addr: SocketAddr, request: &str) -> io::Result<String> {
    tokio::time::timeout(Duration::from_secs(3), async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(request.as_bytes()).await?;
        read_response(&mut stream).await
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "exchange timed out"))?
}

pub fn get(path: &str, host: &str) -> String {
    format!("GET {path} HTTP/1.1\r\nHost: {host}\r\n\r\n")
}

/// Body of a response produced by [`read_response`].
pub fn body(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("")
}

/// TLS client trusting `ca_pem`, optionally limited to some protocol versions.
pub fn tls_connector(
    ca_pem: &str,
    versions: Option<&[&'static rustls::SupportedProtocolVersion]>,
) -> TlsConnector {
    init_crypto_provider();
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
        roots.add(cert.expect("valid PEM")).expect("valid CA");
    }
    let builder = match versions {
        Some(versions) => rustls::ClientConfig::builder_with_protocol_versions(versions),
        None => rustls::ClientConfig::builder(),
    };
    let config = builder.with_root_certificates(roots).with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// TLS client trusting `ca_pem` that offers `protocols` through ALPN.
pub fn alpn_tls_connector(ca_pem: &str, protocols: &[&str]) -> TlsConnector {
    init_crypto_provider();
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
        roots.add(cert.expect("valid PEM")).expect("valid CA");
    }
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = protocols.iter().map(|p| p.as_bytes().to_vec()).collect();
    TlsConnector::from(Arc::new(config))
}

/// Open a TLS session to the proxy as `server_name`.
pub async fn tls_connect(
    connector: &TlsConnector,
    addr: SocketAddr,
    server_name: &str,
) -> io::Result<TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await?;
    let name = ServerName::try_from(server_name.to_string()).map_err(io::Error::other)?;
    tokio::time::timeout(Duration::from_secs(3), connector.connect(name, tcp))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"))?
}

/// A minimal forward proxy that accepts `CONNECT`, records the request head
/// and splices the tunnel.
pub struct ConnectProxy {
    pub addr: SocketAddr,
    heads: Arc<Mutex<Vec<String>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ConnectProxy {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let heads = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let heads_clone = Arc::clone(&heads);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        let Ok((stream, _)) = accept_result else { break };
                        tokio::spawn(splice_connect(stream, Arc::clone(&heads_clone)));
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            heads,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn heads(&self) -> Vec<String> {
        lock(&self.heads).clone()
    }
}

impl Drop for ConnectProxy {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn splice_connect(mut client: TcpStream, heads: Arc<Mutex<Vec<String>>>) {
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    let end = loop {
        if let Some(end) = find_head_end(&data) {
            break end;
        }
        match client.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => data.extend_from_slice(&buf[..n]),
        }
    };
    let head = String::from_utf8_lossy(&data[..end]).into_owned();
    lock(&heads).push(head.clone());

    let Some(authority) = head
        .lines()
        .next()
        .and_then(|l| l.strip_prefix("CONNECT "))
        .and_then(|l| l.split(' ').next())
    else {
        return;
    };
    let Ok(mut upstream) = TcpStream::connect(authority).await else {
        let _ = client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
        return;
    };
    if client
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await
        .is_err()
    {
        return;
    }
    if end < data.len() && upstream.write_all(&data[end..]).await.is_err() {
        return;
    }
    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
}

/// An address nothing listens on.
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    addr
}
