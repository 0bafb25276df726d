//! OCSP responses for stapling (RFC 6960).
//!
//! The proxy is its own responder: every served leaf gets a `good` response
//! identified by a SHA-256 CertID, with the responder named by the signer's
//! subject. Only the handful of DER constructs needed here are encoded.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rustls::pki_types::CertificateDer;
use rustls::sign::SigningKey;
use rustls::SignatureScheme;
use sha2::{Digest, Sha256};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::TlsError;

/// How long a stapled response claims to be fresh.
pub const RESPONSE_VALIDITY_HOURS: i64 = 24;

const OID_PKIX_OCSP_BASIC: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x01, 0x01];
const OID_SHA256: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];
const OID_ECDSA_SHA256: &[u8] = &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x02];
const OID_ECDSA_SHA384: &[u8] = &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x03];
const OID_RSA_SHA256: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0b];
const OID_ED25519: &[u8] = &[0x2b, 0x65, 0x70];

const SIGNATURE_SCHEMES: &[SignatureScheme] = &[
    SignatureScheme::ECDSA_NISTP256_SHA256,
    SignatureScheme::ECDSA_NISTP384_SHA384,
    SignatureScheme::ED25519,
    SignatureScheme::RSA_PKCS1_SHA256,
];

/// Certificate and key that sign OCSP responses.
#[derive(Clone)]
pub struct OcspSigner {
    certificate: CertificateDer<'static>,
    key: Arc<dyn SigningKey>,
}

impl std::fmt::Debug for OcspSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OcspSigner")
            .field("certificate_len", &self.certificate.len())
            .finish()
    }
}

impl OcspSigner {
    pub fn new(certificate: CertificateDer<'static>, key: Arc<dyn SigningKey>) -> Self {
        Self { certificate, key }
    }

    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certificate
    }

    /// Build a DER `OCSPResponse` declaring `leaf` (issued by `issuer`) good.
    pub fn respond(
        &self,
        leaf: &CertificateDer<'_>,
        issuer: &CertificateDer<'_>,
        now: DateTime<Utc>,
    ) -> Result<Vec<u8>, TlsError> {
        let leaf = parse(leaf)?;
        let issuer_cert = parse(issuer)?;
        let signer_cert = parse(&self.certificate)?;

        let cert_id = sequence(&[
            &algorithm(OID_SHA256, true),
            &tlv(0x04, &Sha256::digest(issuer_cert.tbs_certificate.subject.as_raw())),
            &tlv(
                0x04,
                &Sha256::digest(issuer_cert.public_key().subject_public_key.data.as_ref()),
            ),
            &tlv(0x02, leaf.tbs_certificate.raw_serial()),
        ]);

        let single_response = sequence(&[
            &cert_id,
            &[0x80, 0x00], // certStatus: good [0] IMPLICIT NULL
            &generalized_time(now),
            &tlv(0xa0, &generalized_time(now + Duration::hours(RESPONSE_VALIDITY_HOURS))),
        ]);

        let response_data = sequence(&[
            &tlv(0xa1, signer_cert.tbs_certificate.subject.as_raw()), // responderID byName
            &generalized_time(now),
            &sequence(&[&single_response]),
        ]);

        let signer = self
            .key
            .choose_scheme(SIGNATURE_SCHEMES)
            .ok_or_else(|| TlsError::Identity("OCSP signer key type is not supported".into()))?;
        let signature = signer
            .sign(&response_data)
            .map_err(|e| TlsError::Identity(format!("OCSP signing failed: {e}")))?;
        let signature_algorithm = match signer.scheme() {
            SignatureScheme::ECDSA_NISTP256_SHA256 => algorithm(OID_ECDSA_SHA256, false),
            SignatureScheme::ECDSA_NISTP384_SHA384 => algorithm(OID_ECDSA_SHA384, false),
            SignatureScheme::ED25519 => algorithm(OID_ED25519, false),
            _ => algorithm(OID_RSA_SHA256, true),
        };

        let mut bit_string = Vec::with_capacity(signature.len() + 1);
        bit_string.push(0);
        bit_string.extend_from_slice(&signature);

        let basic = sequence(&[
            &response_data,
            &signature_algorithm,
            &tlv(0x03, &bit_string),
            &tlv(0xa0, &sequence(&[self.certificate.as_ref()])),
        ]);

        let response_bytes = sequence(&[&tlv(0x06, OID_PKIX_OCSP_BASIC), &tlv(0x04, &basic)]);
        Ok(sequence(&[
            &[0x0a, 0x01, 0x00], // responseStatus: successful
            &tlv(0xa0, &response_bytes),
        ]))
    }
}

fn parse<'a>(der: &'a CertificateDer<'_>) -> Result<X509Certificate<'a>, TlsError> {
    X509Certificate::from_der(der.as_ref())
        .map(|(_, cert)| cert)
        .map_err(|e| TlsError::Identity(format!("invalid certificate: {e}")))
}

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(tag);
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
    out.extend_from_slice(content);
    out
}

fn sequence(parts: &[&[u8]]) -> Vec<u8> {
    tlv(0x30, &parts.concat())
}

fn algorithm(oid: &[u8], null_params: bool) -> Vec<u8> {
    if null_params {
        sequence(&[&tlv(0x06, oid), &[0x05, 0x00]])
    } else {
        sequence(&[&tlv(0x06, oid)])
    }
}

fn generalized_time(at: DateTime<Utc>) -> Vec<u8> {
    tlv(0x18, at.format("%Y%m%d%H%M%SZ").to_string().as_bytes())
}
