//! TLS interception: identity selection, dynamic issuance and both handshakes.
//!
//! The client-facing handshake picks a certificate per ClientHello through
//! [`IdentityResolver`]. Lookup order is a per-host override, then the first
//! configured identity serving the name, then the default identity, then a
//! leaf issued on the fly by the interception CA.
//!
//! ALPN is chosen per handshake from what the client offers, skipping `h2`
//! unless HTTP/2 is enabled. A client offering nothing acceptable still
//! completes the handshake, without ALPN.
//!
//! The upstream handshake re-originates TLS with the same version, cipher
//! suite and group restrictions, offering the protocol the client negotiated.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use dashmap::DashMap;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::{CertifiedKey, SigningKey};
use rustls::{
    ClientConfig, DigitallySignedStruct, Error as RustlsError, ProtocolVersion, RootCertStore,
    ServerConfig, SignatureScheme, SupportedCipherSuite, SupportedProtocolVersion,
};
use time::OffsetDateTime;
use tokio::net::TcpStream;
use rustls::server::Acceptor;
use tokio_rustls::{LazyConfigAcceptor, TlsConnector};
use tracing::{debug, warn};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::analyzer::TlsSessionInfo;
use crate::config::{load_pem, IdentityConfig, RootCaConfig, TlsSettings};
use crate::error::{ConfigError, TlsError};
use crate::proxy::ocsp::OcspSigner;
use crate::proxy::stream::{ClientStream, Rewind, UpstreamStream};

/// Dynamically issued leaves kept before the cache is flushed.
const MAX_CACHED_LEAVES: usize = 1000;

const CA_COMMON_NAME: &str = "tapwire interception CA";

/// Load every certificate from PEM text, leaf first.
pub fn parse_certificates(field: &str, pem: &str) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::invalid(field, e))?;
    if certs.is_empty() {
        return Err(ConfigError::invalid(field, "no certificate found"));
    }
    Ok(certs)
}

pub fn parse_private_key(field: &str, pem: &str) -> Result<PrivateKeyDer<'static>, ConfigError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| ConfigError::invalid(field, e))?
        .ok_or_else(|| ConfigError::invalid(field, "no private key found"))
}

fn signing_key(field: &str, key: &PrivateKeyDer<'_>) -> Result<Arc<dyn SigningKey>, ConfigError> {
    rustls::crypto::ring::sign::any_supported_type(key).map_err(|e| ConfigError::invalid(field, e))
}

/// DNS names and IP addresses a certificate is valid for.
fn certificate_names(der: &CertificateDer<'_>) -> Result<Vec<String>, String> {
    let (_, cert) = X509Certificate::from_der(der.as_ref()).map_err(|e| e.to_string())?;
    let mut names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => names.push(dns.to_ascii_lowercase()),
                GeneralName::IPAddress(bytes) => {
                    let ip = match bytes.len() {
                        4 => <[u8; 4]>::try_from(*bytes).ok().map(IpAddr::from),
                        16 => <[u8; 16]>::try_from(*bytes).ok().map(IpAddr::from),
                        _ => None,
                    };
                    names.extend(ip.map(|ip| ip.to_string()));
                }
                _ => {}
            }
        }
    }
    if names.is_empty() {
        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok());
        names.extend(common_name.map(str::to_ascii_lowercase));
    }
    Ok(names)
}

fn name_matches(pattern: &str, host: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host
            .strip_suffix(suffix)
            .and_then(|rest| rest.strip_suffix('.'))
            .is_some_and(|label| !label.is_empty() && !label.contains('.'));
    }
    pattern == host
}

/// A configured server certificate with the names it serves.
pub struct ServerIdentity {
    name: String,
    names: Vec<String>,
    certified: Arc<CertifiedKey>,
}

impl fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("name", &self.name)
            .field("names", &self.names)
            .finish()
    }
}

impl ServerIdentity {
    pub fn from_pem(
        name: impl Into<String>,
        certificate_pem: &str,
        private_key_pem: &str,
        domains: &[String],
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let field = format!("tls.server_identities.{name}");
        let chain = parse_certificates(&field, certificate_pem)?;
        let key = parse_private_key(&field, private_key_pem)?;
        let mut names = certificate_names(&chain[0]).map_err(|e| ConfigError::invalid(&field, e))?;
        names.extend(domains.iter().map(|d| d.to_ascii_lowercase()));
        let certified = CertifiedKey::new(chain, signing_key(&field, &key)?);
        Ok(Self {
            name,
            names,
            certified: Arc::new(certified),
        })
    }

    pub fn from_config(config: &IdentityConfig) -> Result<Self, ConfigError> {
        let field = format!("tls.server_identities.{}", config.name);
        let cert = load_pem(&field, &config.certificate_pem)?;
        let key = load_pem(&field, &config.private_key_pem)?;
        Self::from_pem(&config.name, &cert, &key, &config.domains)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lowercased names served, from the certificate plus configured domains.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn certified_key(&self) -> &Arc<CertifiedKey> {
        &self.certified
    }

    pub fn serves(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.names.iter().any(|pattern| name_matches(pattern, &host))
    }

    fn with_staple(&self, signer: &OcspSigner) -> Result<Self, TlsError> {
        let chain = &self.certified.cert;
        let issuer = chain.get(1).unwrap_or(&chain[0]);
        let response = signer.respond(&chain[0], issuer, Utc::now())?;
        let mut certified = CertifiedKey::clone(&self.certified);
        certified.ocsp = Some(response);
        Ok(Self {
            name: self.name.clone(),
            names: self.names.clone(),
            certified: Arc::new(certified),
        })
    }
}

/// Issues leaf certificates for names without a configured identity.
pub struct CertificateAuthority {
    certificate: rcgen::Certificate,
    key: KeyPair,
    /// DER of the CA as distributed to clients.
    trust_anchor: CertificateDer<'static>,
    cache: DashMap<String, Arc<CertifiedKey>>,
    ocsp: Option<OcspSigner>,
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cached_leaves", &self.cache.len())
            .field("ocsp", &self.ocsp.is_some())
            .finish()
    }
}

impl CertificateAuthority {
    /// Create a fresh in-memory CA.
    pub fn generate() -> Result<Self, TlsError> {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(identity_error)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        dn.push(DnType::OrganizationName, "tapwire");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(3650);

        let certificate = params.self_signed(&key).map_err(identity_error)?;
        let trust_anchor = certificate.der().clone();
        Ok(Self {
            certificate,
            key,
            trust_anchor,
            cache: DashMap::new(),
            ocsp: None,
        })
    }

    /// Load an existing CA from PEM.
    pub fn from_pem(certificate_pem: &str, private_key_pem: &str) -> Result<Self, ConfigError> {
        let field = "tls.root_ca";
        let key = KeyPair::from_pem(private_key_pem).map_err(|e| ConfigError::invalid(field, e))?;
        let params = CertificateParams::from_ca_cert_pem(certificate_pem)
            .map_err(|e| ConfigError::invalid(field, e))?;
        // rcgen needs a Certificate to sign with; the re-signed copy keeps
        // subject and key, so leaves still chain to the distributed anchor.
        let certificate = params.self_signed(&key).map_err(|e| ConfigError::invalid(field, e))?;
        let trust_anchor = parse_certificates(field, certificate_pem)?.remove(0);
        Ok(Self {
            certificate,
            key,
            trust_anchor,
            cache: DashMap::new(),
            ocsp: None,
        })
    }

    pub fn from_config(config: &RootCaConfig) -> Result<Self, ConfigError> {
        let cert = load_pem("tls.root_ca.certificate_pem", &config.certificate_pem)?;
        let key = load_pem("tls.root_ca.private_key_pem", &config.private_key_pem)?;
        Self::from_pem(&cert, &key)
    }

    fn with_ocsp(mut self, signer: OcspSigner) -> Self {
        self.ocsp = Some(signer);
        self
    }

    /// OCSP signer backed by this CA's own key.
    pub fn ocsp_signer(&self) -> Result<OcspSigner, ConfigError> {
        let der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(self.key.serialize_der()));
        Ok(OcspSigner::new(
            self.certificate.der().clone(),
            signing_key("tls.root_ca", &der)?,
        ))
    }

    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.trust_anchor
    }

    pub fn certificate_pem(&self) -> String {
        use base64::Engine;
        let body = base64::engine::general_purpose::STANDARD.encode(self.trust_anchor.as_ref());
        let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
        for line in body.as_bytes().chunks(64) {
            pem.push_str(&String::from_utf8_lossy(line));
            pem.push('\n');
        }
        pem.push_str("-----END CERTIFICATE-----\n");
        pem
    }

    pub fn cached_leaves(&self) -> usize {
        self.cache.len()
    }

    /// Leaf for `host` (DNS name or IP literal), issued once and cached.
    pub fn issue(&self, host: &str) -> Result<Arc<CertifiedKey>, TlsError> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if let Some(cached) = self.cache.get(&host) {
            return Ok(cached.clone());
        }

        let leaf_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(identity_error)?;
        let mut params = CertificateParams::new(vec![host.clone()]).map_err(identity_error)?;
        params.distinguished_name.push(DnType::CommonName, host.as_str());
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        let mut serial: [u8; 16] = rand::random();
        serial[0] &= 0x7f;
        params.serial_number = Some(SerialNumber::from_slice(&serial));
        let now = OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(365);

        let leaf = params
            .signed_by(&leaf_key, &self.certificate, &self.key)
            .map_err(identity_error)?;
        let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        let signer = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(|e| TlsError::Identity(e.to_string()))?;
        let mut certified = CertifiedKey::new(
            vec![leaf.der().clone(), self.trust_anchor.clone()],
            signer,
        );
        if let Some(ocsp) = &self.ocsp {
            certified.ocsp = Some(ocsp.respond(leaf.der(), self.certificate.der(), Utc::now())?);
        }
        let certified = Arc::new(certified);

        if self.cache.len() >= MAX_CACHED_LEAVES {
            self.cache.clear();
        }
        self.cache.insert(host.clone(), certified.clone());
        debug!(host = %host, "issued interception certificate");
        Ok(certified)
    }
}

fn identity_error(err: rcgen::Error) -> TlsError {
    TlsError::Identity(err.to_string())
}

#[derive(Default)]
struct IdentitySet {
    identities: Vec<Arc<ServerIdentity>>,
    default: Option<String>,
}

impl IdentitySet {
    fn by_name(&self, name: &str) -> Option<&Arc<ServerIdentity>> {
        self.identities.iter().find(|i| i.name == name)
    }
}

/// Server identities and the CA, shared by every handshake.
///
/// Readers load a snapshot; updates swap it whole, so a handshake in flight
/// keeps whatever it already selected.
pub struct TlsIdentityStore {
    identities: ArcSwap<IdentitySet>,
    overrides: DashMap<String, String>,
    authority: CertificateAuthority,
    default_domain: String,
    ocsp: Option<OcspSigner>,
}

impl fmt::Debug for TlsIdentityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentityStore")
            .field("identities", &self.identity_names())
            .field("default_domain", &self.default_domain)
            .field("authority", &self.authority)
            .finish()
    }
}

impl TlsIdentityStore {
    pub fn new(authority: CertificateAuthority, default_domain: impl Into<String>) -> Self {
        Self {
            identities: ArcSwap::from_pointee(IdentitySet::default()),
            overrides: DashMap::new(),
            authority,
            default_domain: default_domain.into(),
            ocsp: None,
        }
    }

    pub fn from_settings(settings: &TlsSettings) -> Result<Self, ConfigError> {
        let authority = match &settings.root_ca {
            Some(root) => CertificateAuthority::from_config(root)?,
            None => CertificateAuthority::generate().map_err(|e| ConfigError::invalid("tls.root_ca", e))?,
        };

        let ocsp = if settings.ocsp.enabled {
            Some(match &settings.ocsp.signer {
                Some(signer) => {
                    let field = "tls.ocsp.signer";
                    let chain = parse_certificates(field, &load_pem(field, &signer.certificate_pem)?)?;
                    let key = parse_private_key(field, &load_pem(field, &signer.private_key_pem)?)?;
                    OcspSigner::new(chain[0].clone(), signing_key(field, &key)?)
                }
                None => authority.ocsp_signer()?,
            })
        } else {
            None
        };

        let authority = match &ocsp {
            Some(signer) => authority.with_ocsp(signer.clone()),
            None => authority,
        };
        let mut store = Self::new(authority, settings.default_domain.clone());
        store.ocsp = ocsp;

        let identities = settings
            .server_identities
            .iter()
            .map(ServerIdentity::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        store.replace_identities(identities, settings.default_identity.clone())?;
        Ok(store)
    }

    pub fn authority(&self) -> &CertificateAuthority {
        &self.authority
    }

    pub fn default_domain(&self) -> &str {
        &self.default_domain
    }

    /// Pick the certificate for a handshake.
    ///
    /// `server_name` is the SNI, or the host the client asked to reach when
    /// it sent none. Without either, certificates are issued for the default
    /// domain.
    pub fn select(&self, server_name: Option<&str>) -> Result<Arc<CertifiedKey>, TlsError> {
        let host = server_name
            .map(|n| n.trim_end_matches('.').to_ascii_lowercase())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.default_domain.to_ascii_lowercase());
        let set = self.identities.load();

        if let Some(name) = self.overrides.get(&host) {
            if let Some(identity) = set.by_name(name.value()) {
                return Ok(identity.certified.clone());
            }
        }
        if let Some(identity) = set.identities.iter().find(|i| i.serves(&host)) {
            return Ok(identity.certified.clone());
        }
        if let Some(identity) = set.default.as_deref().and_then(|name| set.by_name(name)) {
            return Ok(identity.certified.clone());
        }
        self.authority.issue(&host)
    }

    fn prepare(&self, identity: ServerIdentity) -> Result<Arc<ServerIdentity>, ConfigError> {
        let identity = match &self.ocsp {
            Some(signer) => identity
                .with_staple(signer)
                .map_err(|e| ConfigError::invalid("tls.ocsp", e))?,
            None => identity,
        };
        Ok(Arc::new(identity))
    }

    /// Add an identity, replacing any identity with the same name.
    pub fn add_identity(&self, identity: ServerIdentity) -> Result<(), ConfigError> {
        let identity = self.prepare(identity)?;
        self.identities.rcu(|set| {
            let mut identities: Vec<_> = set
                .identities
                .iter()
                .filter(|i| i.name != identity.name)
                .cloned()
                .collect();
            identities.push(identity.clone());
            IdentitySet {
                identities,
                default: set.default.clone(),
            }
        });
        Ok(())
    }

    pub fn remove_identity(&self, name: &str) -> bool {
        let previous = self.identities.rcu(|set| IdentitySet {
            identities: set
                .identities
                .iter()
                .filter(|i| i.name != name)
                .cloned()
                .collect(),
            default: set.default.clone().filter(|d| d != name),
        });
        previous.by_name(name).is_some()
    }

    /// Swap the whole identity set at once.
    pub fn replace_identities(
        &self,
        identities: Vec<ServerIdentity>,
        default: Option<String>,
    ) -> Result<(), ConfigError> {
        let identities = identities
            .into_iter()
            .map(|i| self.prepare(i))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(name) = &default {
            if !identities.iter().any(|i| &i.name == name) {
                return Err(ConfigError::invalid(
                    "tls.default_identity",
                    format!("unknown identity {name}"),
                ));
            }
        }
        self.identities.store(Arc::new(IdentitySet { identities, default }));
        Ok(())
    }

    pub fn set_default(&self, name: Option<&str>) -> Result<(), ConfigError> {
        if let Some(name) = name {
            if self.identities.load().by_name(name).is_none() {
                return Err(ConfigError::invalid(
                    "tls.default_identity",
                    format!("unknown identity {name}"),
                ));
            }
        }
        self.identities.rcu(|set| IdentitySet {
            identities: set.identities.clone(),
            default: name.map(str::to_string),
        });
        Ok(())
    }

    /// Serve `host` with the named identity regardless of SNI matching.
    pub fn set_route_override(&self, host: &str, identity: &str) -> Result<(), ConfigError> {
        if self.identities.load().by_name(identity).is_none() {
            return Err(ConfigError::invalid(
                "tls_identity",
                format!("unknown identity {identity}"),
            ));
        }
        self.overrides
            .insert(host.to_ascii_lowercase(), identity.to_string());
        Ok(())
    }

    pub fn clear_route_override(&self, host: &str) {
        self.overrides.remove(&host.to_ascii_lowercase());
    }

    pub fn identity_names(&self) -> Vec<String> {
        self.identities
            .load()
            .identities
            .iter()
            .map(|i| i.name.clone())
            .collect()
    }
}

/// Per-handshake certificate resolver.
#[derive(Debug)]
pub struct IdentityResolver {
    store: Arc<TlsIdentityStore>,
    /// Host to use when the ClientHello carries no SNI.
    fallback_host: Option<String>,
}

impl IdentityResolver {
    pub fn new(store: Arc<TlsIdentityStore>, fallback_host: Option<String>) -> Self {
        Self {
            store,
            fallback_host,
        }
    }
}

impl ResolvesServerCert for IdentityResolver {
    fn resolve(&self, hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = hello.server_name().or(self.fallback_host.as_deref());
        match self.store.select(name) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(server_name = ?name, error = %e, "no certificate for handshake");
                None
            }
        }
    }
}

pub fn suite_name(suite: SupportedCipherSuite) -> String {
    format!("{:?}", suite.suite())
}

pub fn version_name(version: ProtocolVersion) -> String {
    match version {
        ProtocolVersion::TLSv1_2 => "TLSv1.2".to_string(),
        ProtocolVersion::TLSv1_3 => "TLSv1.3".to_string(),
        other => format!("{other:?}"),
    }
}

/// Protocol versions named in configuration; both when empty.
pub fn protocol_versions(
    names: &[String],
) -> Result<Vec<&'static SupportedProtocolVersion>, ConfigError> {
    if names.is_empty() {
        return Ok(rustls::ALL_VERSIONS.to_vec());
    }
    names
        .iter()
        .map(|name| match name.to_ascii_uppercase().as_str() {
            "TLSV1.2" | "TLS1.2" => Ok(&rustls::version::TLS12),
            "TLSV1.3" | "TLS1.3" => Ok(&rustls::version::TLS13),
            _ => Err(ConfigError::invalid(
                "tls.protocols",
                format!("unsupported protocol {name}"),
            )),
        })
        .collect()
}

/// The ring provider restricted to the configured suites and groups.
pub fn crypto_provider(settings: &TlsSettings) -> Result<Arc<CryptoProvider>, ConfigError> {
    let mut provider = rustls::crypto::ring::default_provider();

    if !settings.cipher_suites.is_empty() {
        provider.cipher_suites = settings
            .cipher_suites
            .iter()
            .map(|name| {
                provider
                    .cipher_suites
                    .iter()
                    .find(|s| suite_name(**s).eq_ignore_ascii_case(name))
                    .copied()
                    .ok_or_else(|| {
                        ConfigError::invalid("tls.cipher_suites", format!("unknown cipher suite {name}"))
                    })
            })
            .collect::<Result<_, _>>()?;
    }

    if !settings.supported_groups.is_empty() {
        provider.kx_groups = settings
            .supported_groups
            .iter()
            .map(|name| {
                provider
                    .kx_groups
                    .iter()
                    .find(|g| format!("{:?}", g.name()).eq_ignore_ascii_case(name))
                    .copied()
                    .ok_or_else(|| {
                        ConfigError::invalid("tls.supported_groups", format!("unknown group {name}"))
                    })
            })
            .collect::<Result<_, _>>()?;
    }

    Ok(Arc::new(provider))
}

/// Check names and their combination without loading any key material.
pub fn validate_settings(settings: &TlsSettings) -> Result<(), ConfigError> {
    let versions = protocol_versions(&settings.protocols)?;
    let provider = crypto_provider(settings)?;
    let usable = provider
        .cipher_suites
        .iter()
        .any(|s| versions.iter().any(|v| v.version == s.version().version));
    if !usable {
        return Err(ConfigError::invalid(
            "tls.cipher_suites",
            "no cipher suite is usable with the allowed protocols",
        ));
    }
    if let Some(default) = &settings.default_identity {
        if !settings.server_identities.iter().any(|i| &i.name == default) {
            return Err(ConfigError::invalid(
                "tls.default_identity",
                format!("unknown identity {default}"),
            ));
        }
    }
    Ok(())
}

const ALPN_H2: &[u8] = b"h2";

/// The client's most preferred protocol we are willing to speak.
fn select_alpn<'a>(offered: impl IntoIterator<Item = &'a [u8]>, enable_http2: bool) -> Option<Vec<u8>> {
    offered
        .into_iter()
        .find(|proto| !proto.is_empty() && (enable_http2 || *proto != ALPN_H2))
        .map(<[u8]>::to_vec)
}

/// Accepts any client certificate whose handshake signature verifies, so it
/// can be captured without a trust decision.
#[derive(Debug)]
struct CaptureClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for CaptureClientCert {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, RustlsError> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Upstream verifier used when `trust_all_upstream` is set.
#[derive(Debug)]
struct TrustAllUpstream {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for TrustAllUpstream {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

fn root_store(field: &str, pems: &[String]) -> Result<RootCertStore, ConfigError> {
    let mut roots = RootCertStore::empty();
    for pem in pems {
        for cert in parse_certificates(field, &load_pem(field, pem)?)? {
            roots.add(cert).map_err(|e| ConfigError::invalid(field, e))?;
        }
    }
    Ok(roots)
}

fn server_config(
    settings: &TlsSettings,
    provider: Arc<CryptoProvider>,
    store: Arc<TlsIdentityStore>,
) -> Result<ServerConfig, ConfigError> {
    let versions = protocol_versions(&settings.protocols)?;
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&versions)
        .map_err(|e| ConfigError::invalid("tls.protocols", e))?;

    let client_auth = &settings.client_auth;
    let builder = if !client_auth.request {
        builder.with_no_client_auth()
    } else if client_auth.trust_roots_pem.is_empty() {
        builder.with_client_cert_verifier(Arc::new(CaptureClientCert {
            algorithms: provider.signature_verification_algorithms,
        }))
    } else {
        let roots = root_store("tls.client_auth.trust_roots_pem", &client_auth.trust_roots_pem)?;
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .allow_unauthenticated()
            .build()
            .map_err(|e| ConfigError::invalid("tls.client_auth", e))?;
        builder.with_client_cert_verifier(verifier)
    };

    Ok(builder.with_cert_resolver(Arc::new(IdentityResolver::new(store, None))))
}

fn upstream_config(
    settings: &TlsSettings,
    provider: Arc<CryptoProvider>,
    store: &TlsIdentityStore,
) -> Result<ClientConfig, ConfigError> {
    let versions = protocol_versions(&settings.protocols)?;
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&versions)
        .map_err(|e| ConfigError::invalid("tls.protocols", e))?;

    let builder = if settings.trust_all_upstream {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(TrustAllUpstream {
                algorithms: provider.signature_verification_algorithms,
            }))
    } else {
        let mut roots = root_store("tls.upstream_trust_roots_pem", &settings.upstream_trust_roots_pem)?;
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        roots
            .add(store.authority().certificate_der().clone())
            .map_err(|e| ConfigError::invalid("tls.root_ca", e))?;
        builder.with_root_certificates(roots)
    };

    let config = match &settings.forward_mutual_tls_identity {
        Some(identity) => {
            let field = "tls.forward_mutual_tls_identity";
            let chain = parse_certificates(field, &load_pem(field, &identity.certificate_pem)?)?;
            let key = parse_private_key(field, &load_pem(field, &identity.private_key_pem)?)?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| ConfigError::invalid(field, e))?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(config)
}

/// Terminates client TLS and re-originates it towards upstreams.
pub struct TlsInterceptor {
    store: Arc<TlsIdentityStore>,
    server: Arc<ServerConfig>,
    upstream: Arc<ClientConfig>,
    /// Upstream configs offering a single ALPN protocol, keyed by protocol.
    upstream_alpn: DashMap<Vec<u8>, Arc<ClientConfig>>,
    enable_http2: bool,
    handshake_timeout: Duration,
}

impl fmt::Debug for TlsInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsInterceptor")
            .field("store", &self.store)
            .field("enable_http2", &self.enable_http2)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

impl TlsInterceptor {
    pub fn new(
        settings: &TlsSettings,
        store: Arc<TlsIdentityStore>,
        handshake_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let provider = crypto_provider(settings)?;
        let server = server_config(settings, provider.clone(), store.clone())?;
        let upstream = upstream_config(settings, provider, &store)?;
        Ok(Self {
            store,
            server: Arc::new(server),
            upstream: Arc::new(upstream),
            upstream_alpn: DashMap::new(),
            enable_http2: settings.enable_http2,
            handshake_timeout,
        })
    }

    pub fn store(&self) -> &Arc<TlsIdentityStore> {
        &self.store
    }

    /// Server-side handshake with the client.
    ///
    /// `fallback_host` names the certificate to present when the client sends
    /// no SNI (the CONNECT authority, for tunnelled traffic).
    pub async fn accept(
        &self,
        stream: Rewind<TcpStream>,
        peer: SocketAddr,
        fallback_host: Option<&str>,
    ) -> Result<(ClientStream, TlsSessionInfo), TlsError> {
        let handshake = async {
            let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;
            let alpn = start
                .client_hello()
                .alpn()
                .and_then(|offered| select_alpn(offered, self.enable_http2));
            start.into_stream(self.server_config(fallback_host, alpn)).await
        };

        let tls = tokio::time::timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| TlsError::Timeout {
                peer: peer.to_string(),
            })?
            .map_err(|e| TlsError::classify(peer, &e))?;

        let info = session_info(tls.get_ref().1);
        debug!(
            peer_addr = %peer,
            version = %info.protocol_version,
            cipher_suite = %info.cipher_suite,
            sni = ?info.server_name,
            "client TLS established"
        );
        Ok((ClientStream::Tls(Box::new(tls)), info))
    }

    fn server_config(&self, fallback_host: Option<&str>, alpn: Option<Vec<u8>>) -> Arc<ServerConfig> {
        if fallback_host.is_none() && alpn.is_none() {
            return self.server.clone();
        }
        let mut config = ServerConfig::clone(&self.server);
        if let Some(host) = fallback_host {
            config.cert_resolver = Arc::new(IdentityResolver::new(
                self.store.clone(),
                Some(host.to_string()),
            ));
        }
        config.alpn_protocols = alpn.into_iter().collect();
        Arc::new(config)
    }

    /// Upstream config offering `alpn`, or no ALPN at all.
    fn upstream_config(&self, alpn: Option<&[u8]>) -> Arc<ClientConfig> {
        let Some(proto) = alpn else {
            return self.upstream.clone();
        };
        self.upstream_alpn
            .entry(proto.to_vec())
            .or_insert_with(|| {
                let mut config = ClientConfig::clone(&self.upstream);
                config.alpn_protocols = vec![proto.to_vec()];
                Arc::new(config)
            })
            .clone()
    }

    /// Client-side handshake towards an upstream, offering the protocol the
    /// client negotiated.
    pub async fn connect(
        &self,
        tcp: TcpStream,
        host: &str,
        alpn: Option<&[u8]>,
    ) -> Result<UpstreamStream, TlsError> {
        let server_name = ServerName::try_from(host.to_string()).map_err(|e| TlsError::Handshake {
            peer: host.to_string(),
            reason: e.to_string(),
        })?;
        let tls = tokio::time::timeout(
            self.handshake_timeout,
            TlsConnector::from(self.upstream_config(alpn)).connect(server_name, tcp),
        )
        .await
        .map_err(|_| TlsError::Timeout {
            peer: host.to_string(),
        })?
        .map_err(|e| TlsError::classify(host, &e))?;
        Ok(UpstreamStream::Tls(Box::new(tls)))
    }
}

/// Negotiated parameters of a server-side session.
pub fn session_info(conn: &rustls::ServerConnection) -> TlsSessionInfo {
    TlsSessionInfo {
        protocol_version: conn
            .protocol_version()
            .map(version_name)
            .unwrap_or_default(),
        cipher_suite: conn
            .negotiated_cipher_suite()
            .map(suite_name)
            .unwrap_or_default(),
        server_name: conn.server_name().map(str::to_string),
        alpn: conn
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned()),
        client_certificates: conn
            .peer_certificates()
            .map(|certs| {
                certs
                    .iter()
                    .map(|c| bytes::Bytes::copy_from_slice(c.as_ref()))
                    .collect()
            })
            .unwrap_or_default(),
    }
}
