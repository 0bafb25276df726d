mod harness;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use harness::{test_config, ProxyHandle, TcpEchoBackend};
use rstest::rstest;
use serde_json::json;
use tapwire_proxy::config::DirectReverseProxyConfig;
use tapwire_proxy::{
    AnalyzerError, CapturedUnit, Direction, ModifierDescriptor, ProxyBuilder, ProxyConfig, RouteSpec,
    TrafficSink,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn direct_to(addr: std::net::SocketAddr) -> ProxyConfig {
    ProxyConfig {
        direct_reverse_proxy: Some(DirectReverseProxyConfig {
            hostname: addr.ip().to_string(),
            port: addr.port(),
            tls: false,
        }),
        ..test_config()
    }
}

async fn echo_round_trip(client: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    client.write_all(payload).await.unwrap();
    let mut reply = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut reply))
        .await
        .expect("reply before timeout")
        .unwrap();
    reply
}

#[rstest]
#[case(b"a".as_slice())]
#[case(b"ab".as_slice())]
#[case(b"abc".as_slice())]
#[case(b"\x16\x03".as_slice())]
#[case(b"abcd".as_slice())]
#[tokio::test]
async fn short_payloads_are_forwarded_without_stalling(#[case] payload: &[u8]) {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let handle = ProxyHandle::start(direct_to(backend.addr)).await;

    let mut client = TcpStream::connect(handle.addr()).await.unwrap();
    assert_eq!(echo_round_trip(&mut client, payload).await, payload);
}

#[rstest]
#[case(b"G".as_slice())]
#[case(b"GE".as_slice())]
#[case(b"PU".as_slice())]
#[case(b"hi".as_slice())]
#[case(b"\x16\x03".as_slice())]
#[tokio::test]
async fn short_payloads_are_forwarded_without_stalling_when_routed(#[case] payload: &[u8]) {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let handle = ProxyHandle::start(ProxyConfig {
        head_timeout_ms: 5000,
        ..test_config()
    })
    .await;
    handle
        .proxy
        .add_route(RouteSpec::new("/", format!("tcp://{}/", backend.addr)))
        .unwrap();

    let mut client = TcpStream::connect(handle.addr()).await.unwrap();
    let started = std::time::Instant::now();
    assert_eq!(echo_round_trip(&mut client, payload).await, payload);
    assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
}

#[tokio::test]
async fn server_speaks_first_is_bridged() {
    let greeter = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let greeter_addr = greeter.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = greeter.accept().await {
            let _ = socket.write_all(b"220 ready\r\n").await;
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await;
        }
    });
    let handle = ProxyHandle::start(direct_to(greeter_addr)).await;

    let mut client = TcpStream::connect(handle.addr()).await.unwrap();
    let mut greeting = [0u8; 11];
    tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut greeting))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&greeting, b"220 ready\r\n");
}

#[tokio::test]
async fn units_are_ordered_and_paired() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let handle = ProxyHandle::start(direct_to(backend.addr)).await;

    let mut client = TcpStream::connect(handle.addr()).await.unwrap();
    let client_addr = client.local_addr().unwrap();
    echo_round_trip(&mut client, b"first").await;
    echo_round_trip(&mut client, b"second").await;

    let units = handle
        .sink
        .wait_for(Duration::from_secs(2), |u| u.len() >= 4)
        .await
        .unwrap();
    let sequences: Vec<_> = units.iter().map(|u| u.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2, 3]);
    assert!(units.iter().all(|u| u.connection_id == units[0].connection_id));

    assert_eq!(units[0].direction, Direction::ClientToServer);
    assert_eq!(units[0].sender, client_addr);
    assert_eq!(&units[0].bytes[..], b"first");
    assert_eq!(units[1].direction, Direction::ServerToClient);
    assert_eq!(units[1].paired_with, Some(units[0].id));
    assert_eq!(units[1].receiver, client_addr);
    assert_eq!(units[3].paired_with, Some(units[2].id));
    assert!(units[0].captured_at <= units[1].captured_at);
}

#[tokio::test]
async fn binary_modifier_rewrites_only_matching_exchange() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let handle = ProxyHandle::start(direct_to(backend.addr)).await;
    handle
        .proxy
        .add_modifier(ModifierDescriptor::new(
            "retr",
            "replaceBytes",
            json!({ "search_hex": hex::encode("RETR 1"), "replace_hex": hex::encode("retr 2") }),
        ))
        .unwrap();

    let mut client = TcpStream::connect(handle.addr()).await.unwrap();
    assert_eq!(echo_round_trip(&mut client, b"RETR 1\r\n").await, b"retr 2\r\n");
    assert_eq!(echo_round_trip(&mut client, b"LIST\r\n").await, b"LIST\r\n");

    assert_eq!(backend.received(), b"retr 2\r\nLIST\r\n");
    let units = handle
        .sink
        .wait_for(Duration::from_secs(2), |u| u.len() >= 4)
        .await
        .unwrap();
    assert_eq!(&units[0].bytes[..], b"retr 2\r\n");
    assert_eq!(&units[2].bytes[..], b"LIST\r\n");
}

#[tokio::test]
async fn removed_modifier_no_longer_applies() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let handle = ProxyHandle::start(direct_to(backend.addr)).await;
    handle
        .proxy
        .add_modifier(ModifierDescriptor::new(
            "upper",
            "replaceContent",
            json!({ "search": "hello", "replace": "HELLO", "direction": "client_to_server" }),
        ))
        .unwrap();

    let mut client = TcpStream::connect(handle.addr()).await.unwrap();
    assert_eq!(echo_round_trip(&mut client, b"hello").await, b"HELLO");

    assert!(handle.proxy.remove_modifier("upper"));
    let mut fresh = TcpStream::connect(handle.addr()).await.unwrap();
    assert_eq!(echo_round_trip(&mut fresh, b"hello").await, b"hello");
}

#[tokio::test]
async fn invalid_modifier_params_are_rejected() {
    let handle = ProxyHandle::start(test_config()).await;
    let err = handle
        .proxy
        .add_modifier(ModifierDescriptor::new("bad", "replaceBytes", json!({ "search_hex": "zz", "replace_hex": "00" })))
        .unwrap_err();
    assert!(err.to_string().contains("search_hex"));
    assert!(handle.proxy.modifiers().is_empty());
}

/// Records units only after a delay.
#[derive(Default)]
struct SlowSink {
    done: Mutex<Vec<Direction>>,
}

#[async_trait]
impl TrafficSink for SlowSink {
    async fn on_unit(&self, unit: &CapturedUnit) -> Result<(), AnalyzerError> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.done.lock().unwrap().push(unit.direction);
        Ok(())
    }
}

#[tokio::test]
async fn blocking_analysis_holds_bytes_until_unit_is_analyzed() {
    harness::init_crypto_provider();
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let sink = Arc::new(SlowSink::default());
    let proxy = ProxyBuilder::new(ProxyConfig {
        parsing_should_block_communication: true,
        ..direct_to(backend.addr)
    })
    .sink(sink.clone())
    .start()
    .await
    .unwrap();

    let mut client = TcpStream::connect(proxy.local_addr()).await.unwrap();
    echo_round_trip(&mut client, b"ping").await;

    let done = sink.done.lock().unwrap().clone();
    assert_eq!(done, vec![Direction::ClientToServer, Direction::ServerToClient]);
}

struct FailingSink;

#[async_trait]
impl TrafficSink for FailingSink {
    async fn on_unit(&self, _unit: &CapturedUnit) -> Result<(), AnalyzerError> {
        Err(AnalyzerError("boom".into()))
    }
}

#[tokio::test]
async fn analyzer_failure_is_reported_and_relay_continues() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let handle = ProxyHandle::start_with_sink(ProxyBuilder::new(direct_to(backend.addr)), Arc::new(FailingSink)).await;

    let mut client = TcpStream::connect(handle.addr()).await.unwrap();
    assert_eq!(echo_round_trip(&mut client, b"still flowing").await, b"still flowing");
    assert!(handle.wait_for_error("boom", Duration::from_secs(2)).await);
}

#[tokio::test]
async fn connections_over_the_cap_are_closed() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let handle = ProxyHandle::start(ProxyConfig {
        max_connections: 1,
        ..direct_to(backend.addr)
    })
    .await;

    let mut first = TcpStream::connect(handle.addr()).await.unwrap();
    assert_eq!(echo_round_trip(&mut first, b"held").await, b"held");

    let mut second = TcpStream::connect(handle.addr()).await.unwrap();
    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(Duration::from_secs(2), second.read(&mut buf))
        .await
        .expect("closed before timeout");
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(
        handle
            .proxy
            .stats()
            .connections_rejected
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );

    assert_eq!(echo_round_trip(&mut first, b"still").await, b"still");
}
