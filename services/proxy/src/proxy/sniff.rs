//! Port unification: decide TLS vs. plaintext from the first bytes of a
//! connection, and extract SNI from a TLS ClientHello.
//!
//! Classification never consumes bytes irrevocably: everything read while
//! sniffing is pushed back into the [`Rewind`] stream.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tracing::{debug, trace};

use super::stream::Rewind;

/// Default timeout for sniffing (200ms).
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_millis(200);

/// Maximum bytes read while sniffing.
pub const DEFAULT_MAX_SNIFF_BYTES: usize = 8192;

const TLS_RECORD_HEADER_LEN: usize = 5;
const TLS_HANDSHAKE: u8 = 0x16;
const CLIENT_HELLO: u8 = 0x01;
/// Largest legal TLSCiphertext fragment (2^14 + 2048).
const MAX_TLS_RECORD_LEN: usize = 18432;

/// Outcome of classifying the bytes seen so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniffed {
    Tls,
    Plaintext,
    /// Not enough bytes to decide yet.
    Undetermined,
}

/// Classify a connection prefix.
///
/// A prefix is TLS only when it carries a handshake record header with a
/// plausible length followed by a ClientHello. Anything that cannot become
/// TLS is plaintext as soon as that is visible.
pub fn classify(data: &[u8]) -> Sniffed {
    let Some(&first) = data.first() else {
        return Sniffed::Undetermined;
    };
    if first != TLS_HANDSHAKE {
        return Sniffed::Plaintext;
    }
    if let Some(&major) = data.get(1) {
        if major != 0x03 {
            return Sniffed::Plaintext;
        }
    }
    if data.len() < TLS_RECORD_HEADER_LEN {
        return Sniffed::Undetermined;
    }
    let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    if record_len == 0 || record_len > MAX_TLS_RECORD_LEN {
        return Sniffed::Plaintext;
    }
    match data.get(TLS_RECORD_HEADER_LEN) {
        None => Sniffed::Undetermined,
        Some(&CLIENT_HELLO) => Sniffed::Tls,
        Some(_) => Sniffed::Plaintext,
    }
}

/// Result of SNI extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniResult {
    /// SNI hostname, lowercased with any trailing dot removed.
    Found(String),
    /// TLS ClientHello present but no SNI extension.
    NoSni,
    /// Data is not a TLS ClientHello.
    NotTls,
    /// ClientHello is malformed or incomplete within bounds.
    Malformed,
}

impl SniResult {
    pub fn hostname(&self) -> Option<&str> {
        match self {
            Self::Found(name) => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SniffConfig {
    /// How long to wait for a decision before falling back to plaintext.
    pub timeout: Duration,
    pub max_bytes: usize,
    /// Bound on waiting for the very first bytes. `None` waits for the client;
    /// set for server-speaks-first upstreams so an idle client is still bridged.
    pub first_read_timeout: Option<Duration>,
}

impl Default for SniffConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SNIFF_TIMEOUT,
            max_bytes: DEFAULT_MAX_SNIFF_BYTES,
            first_read_timeout: None,
        }
    }
}

/// What the sniffer saw on a connection.
#[derive(Debug, Clone)]
pub struct SniffOutcome {
    pub protocol: Sniffed,
    /// Everything read so far; already pushed back into the stream.
    pub prefix: Bytes,
    /// The peer closed before sending anything.
    pub eof: bool,
}

impl SniffOutcome {
    pub fn is_tls(&self) -> bool {
        self.protocol == Sniffed::Tls
    }

    /// SNI of the buffered ClientHello, if any.
    pub fn sni(&self) -> SniResult {
        parse_sni(&self.prefix)
    }
}

/// Classifies new connections as TLS or plaintext.
#[derive(Debug, Clone, Default)]
pub struct ProtocolSniffer {
    config: SniffConfig,
}

impl ProtocolSniffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SniffConfig) -> Self {
        Self { config }
    }

    /// Read from `stream` until the prefix is classified, the peer stops
    /// sending, or the timeout elapses. An undecided prefix is plaintext.
    /// For TLS the whole first record is buffered so SNI can be read.
    ///
    /// Bytes read are rewound into `stream` before returning.
    pub async fn sniff<S>(&self, stream: &mut Rewind<S>) -> std::io::Result<SniffOutcome>
    where
        S: AsyncRead + Unpin,
    {
        let mut buffer = BytesMut::with_capacity(512);

        let first = match self.config.first_read_timeout {
            Some(limit) => match timeout(limit, stream.read_buf(&mut buffer)).await {
                Ok(read) => read,
                Err(_) => {
                    trace!("No bytes before sniff timeout, treating as plaintext");
                    return Ok(SniffOutcome {
                        protocol: Sniffed::Plaintext,
                        prefix: Bytes::new(),
                        eof: false,
                    });
                }
            },
            None => stream.read_buf(&mut buffer).await,
        };
        let mut eof = first? == 0;

        let mut protocol = classify(&buffer);
        while protocol == Sniffed::Undetermined && !eof && buffer.len() < self.config.max_bytes {
            match timeout(self.config.timeout, stream.read_buf(&mut buffer)).await {
                Ok(Ok(0)) => eof = true,
                Ok(Ok(_)) => protocol = classify(&buffer),
                Ok(Err(e)) => {
                    stream.rewind(buffer.freeze());
                    return Err(e);
                }
                Err(_) => {
                    trace!(buffered = buffer.len(), "Sniff timeout, treating as plaintext");
                    break;
                }
            }
        }

        if protocol == Sniffed::Undetermined {
            protocol = Sniffed::Plaintext;
        }

        if protocol == Sniffed::Tls {
            let record_len = u16::from_be_bytes([buffer[3], buffer[4]]) as usize;
            let target = (TLS_RECORD_HEADER_LEN + record_len).min(self.config.max_bytes);
            while buffer.len() < target {
                match timeout(self.config.timeout, stream.read_buf(&mut buffer)).await {
                    Ok(Ok(0)) | Err(_) => break,
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        stream.rewind(buffer.freeze());
                        return Err(e);
                    }
                }
            }
        }

        let prefix = buffer.freeze();
        debug!(protocol = ?protocol, buffered = prefix.len(), eof, "Sniffed connection");
        stream.rewind(prefix.clone());
        Ok(SniffOutcome {
            protocol,
            eof: eof && prefix.is_empty(),
            prefix,
        })
    }
}

/// Parse SNI from a TLS ClientHello buffer.
///
/// TLS Record structure:
/// - byte 0: record type (0x16 = Handshake)
/// - bytes 1-2: version
/// - bytes 3-4: record length
/// - bytes 5+: handshake message
///
/// Handshake ClientHello:
/// - byte 0: handshake type (0x01 = ClientHello)
/// - bytes 1-3: length
/// - bytes 4-5: client version
/// - bytes 6-37: random (32 bytes)
/// - byte 38: session ID length, then session ID
/// - 2 bytes: cipher suites length, then cipher suites
/// - 1 byte: compression methods length, then methods
/// - 2 bytes: extensions length, then extensions
pub fn parse_sni(data: &[u8]) -> SniResult {
    if data.len() < 9 {
        return SniResult::Malformed;
    }
    if data[0] != TLS_HANDSHAKE {
        return SniResult::NotTls;
    }

    let handshake = &data[TLS_RECORD_HEADER_LEN..];
    if handshake[0] != CLIENT_HELLO {
        return SniResult::NotTls;
    }

    let client_hello = &handshake[4..];
    if client_hello.len() < 34 {
        return SniResult::Malformed;
    }

    // Skip version (2) + random (32)
    let mut pos = 34;

    let Some(&session_id_len) = client_hello.get(pos) else {
        return SniResult::Malformed;
    };
    pos += 1 + session_id_len as usize;

    if pos + 2 > client_hello.len() {
        return SniResult::Malformed;
    }
    let cipher_suites_len = u16::from_be_bytes([client_hello[pos], client_hello[pos + 1]]) as usize;
    pos += 2 + cipher_suites_len;

    let Some(&compression_len) = client_hello.get(pos) else {
        return SniResult::Malformed;
    };
    pos += 1 + compression_len as usize;

    if pos + 2 > client_hello.len() {
        return SniResult::NoSni;
    }
    let extensions_len = u16::from_be_bytes([client_hello[pos], client_hello[pos + 1]]) as usize;
    pos += 2;
    let extensions_end = (pos + extensions_len).min(client_hello.len());

    while pos + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([client_hello[pos], client_hello[pos + 1]]);
        let ext_len = u16::from_be_bytes([client_hello[pos + 2], client_hello[pos + 3]]) as usize;
        pos += 4;

        if ext_type == 0x0000 {
            let end = (pos + ext_len).min(client_hello.len());
            return parse_server_name_list(&client_hello[pos..end]);
        }
        pos += ext_len;
    }

    SniResult::NoSni
}

/// server_name extension: 2-byte list length, then
/// `{ name_type: u8, name_len: u16, name }` entries.
fn parse_server_name_list(data: &[u8]) -> SniResult {
    if data.len() < 2 {
        return SniResult::Malformed;
    }
    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if data.len() < 2 + list_len {
        return SniResult::Malformed;
    }

    let mut pos = 2;
    while pos + 3 <= 2 + list_len {
        let name_type = data[pos];
        let name_len = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
        pos += 3;

        if name_type == 0 {
            if pos + name_len > data.len() {
                return SniResult::Malformed;
            }
            return match std::str::from_utf8(&data[pos..pos + name_len]) {
                Ok(hostname) => SniResult::Found(normalize_hostname(hostname)),
                Err(_) => SniResult::Malformed,
            };
        }
        pos += name_len;
    }

    SniResult::NoSni
}

fn normalize_hostname(hostname: &str) -> String {
    hostname.to_ascii_lowercase().trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::io::AsyncWriteExt;

    // TLS 1.2 ClientHello carrying SNI "example.com" plus a padding extension.
    const EXAMPLE_CLIENT_HELLO: &[u8] = &[
        0x16, 0x03, 0x01, 0x00, 0x5f, // record header, 95 bytes
        0x01, 0x00, 0x00, 0x5b, // ClientHello, 91 bytes
        0x03, 0x03, // TLS 1.2
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, // random
        0x00, // session id length
        0x00, 0x02, 0x00, 0x2f, // one cipher suite
        0x01, 0x00, // null compression
        0x00, 0x28, // extensions, 40 bytes
        0x00, 0x00, 0x00, 0x10, // server_name, 16 bytes
        0x00, 0x0e, 0x00, 0x00, 0x0b, // list 14 bytes, host_name 11 bytes
        b'E', b'x', b'a', b'm', b'p', b'l', b'e', b'.', b'c', b'o', b'm',
        0x00, 0x15, 0x00, 0x10, // padding, 16 bytes
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00,
    ];

    #[test]
    fn classify_client_hello_as_tls() {
        assert_eq!(classify(EXAMPLE_CLIENT_HELLO), Sniffed::Tls);
        assert_eq!(classify(&EXAMPLE_CLIENT_HELLO[..6]), Sniffed::Tls);
    }

    #[test]
    fn classify_partial_record_header_as_undetermined() {
        assert_eq!(classify(&[]), Sniffed::Undetermined);
        assert_eq!(classify(&[0x16]), Sniffed::Undetermined);
        assert_eq!(classify(&[0x16, 0x03, 0x01, 0x00]), Sniffed::Undetermined);
        assert_eq!(classify(&EXAMPLE_CLIENT_HELLO[..5]), Sniffed::Undetermined);
    }

    #[test]
    fn classify_http_and_bogus_records_as_plaintext() {
        assert_eq!(classify(b"GET / HTTP/1.1\r\n"), Sniffed::Plaintext);
        assert_eq!(classify(&[0x16, 0x07]), Sniffed::Plaintext);
        assert_eq!(classify(&[0x16, 0x03, 0x01, 0xff, 0xff, 0x01]), Sniffed::Plaintext);
        assert_eq!(classify(&[0x16, 0x03, 0x01, 0x00, 0x10, 0x02]), Sniffed::Plaintext);
    }

    #[test]
    fn parse_sni_found_and_normalized() {
        assert_eq!(
            parse_sni(EXAMPLE_CLIENT_HELLO),
            SniResult::Found("example.com".to_string())
        );
    }

    #[test]
    fn parse_sni_rejects_non_tls() {
        assert_eq!(
            parse_sni(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n"),
            SniResult::NotTls
        );
        assert_eq!(parse_sni(&[0x16, 0x03, 0x01]), SniResult::Malformed);
    }

    #[test]
    fn normalize_trailing_dot() {
        assert_eq!(normalize_hostname("EXAMPLE.COM."), "example.com");
    }

    #[tokio::test]
    async fn sniff_rewinds_consumed_bytes() {
        let (client, mut peer) = tokio::io::duplex(1024);
        peer.write_all(EXAMPLE_CLIENT_HELLO).await.unwrap();

        let mut stream = Rewind::new(client);
        let outcome = ProtocolSniffer::new().sniff(&mut stream).await.unwrap();
        assert!(outcome.is_tls());
        assert_eq!(outcome.sni().hostname(), Some("example.com"));

        let mut replay = vec![0u8; EXAMPLE_CLIENT_HELLO.len()];
        stream.read_exact(&mut replay).await.unwrap();
        assert_eq!(replay, EXAMPLE_CLIENT_HELLO);
    }

    #[tokio::test]
    async fn ambiguous_short_prefix_falls_back_to_plaintext() {
        let (client, mut peer) = tokio::io::duplex(64);
        peer.write_all(&[0x16, 0x03]).await.unwrap();

        let sniffer = ProtocolSniffer::with_config(SniffConfig {
            timeout: Duration::from_millis(20),
            ..SniffConfig::default()
        });
        let mut stream = Rewind::new(client);
        let outcome = tokio::time::timeout(Duration::from_secs(1), sniffer.sniff(&mut stream))
            .await
            .expect("sniffing must not stall")
            .unwrap();
        assert_eq!(outcome.protocol, Sniffed::Plaintext);
        assert_eq!(stream.buffered(), &[0x16, 0x03]);
        drop(peer);
    }

    #[tokio::test]
    async fn idle_client_is_plaintext_with_first_read_timeout() {
        let (client, _peer) = tokio::io::duplex(64);
        let sniffer = ProtocolSniffer::with_config(SniffConfig {
            first_read_timeout: Some(Duration::from_millis(20)),
            ..SniffConfig::default()
        });
        let mut stream = Rewind::new(client);
        let outcome = sniffer.sniff(&mut stream).await.unwrap();
        assert_eq!(outcome.protocol, Sniffed::Plaintext);
        assert!(outcome.prefix.is_empty());
        assert!(!outcome.eof);
    }

    #[tokio::test]
    async fn eof_before_any_bytes() {
        let (client, peer) = tokio::io::duplex(64);
        drop(peer);
        let mut stream = Rewind::new(client);
        let outcome = ProtocolSniffer::new().sniff(&mut stream).await.unwrap();
        assert!(outcome.eof);
        assert_eq!(outcome.protocol, Sniffed::Plaintext);
    }

    proptest! {
        #[test]
        fn short_non_handshake_payloads_are_plaintext(
            first in any::<u8>().prop_filter("not a handshake record", |b| *b != TLS_HANDSHAKE),
            rest in proptest::collection::vec(any::<u8>(), 0..4),
        ) {
            let mut payload = vec![first];
            payload.extend(rest);
            prop_assert_eq!(classify(&payload), Sniffed::Plaintext);
        }

        #[test]
        fn classification_never_panics(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = classify(&data);
            let _ = parse_sni(&data);
        }
    }
}
