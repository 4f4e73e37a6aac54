//! X.509 generation and inspection

use crate::error::{RelayError, RelayResult};
use chrono::{DateTime, Duration, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
};
use openssl::x509::{X509NameBuilder, X509NameRef, X509};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;

const RSA_BITS: u32 = 2048;

/// PEM-encoded certificate and private key
#[derive(Debug, Clone)]
pub struct PemPair {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Fields extracted from a parsed certificate
#[derive(Debug, Clone)]
pub struct CertificateFacts {
    pub common_name: Option<String>,
    pub alt_names: Vec<String>,
    pub issuer_cn: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub self_signed: bool,
    pub fingerprint: String,
}

impl CertificateFacts {
    /// True if `domain` is the common name or one of the DNS alternate names
    pub fn covers(&self, domain: &str) -> bool {
        let domain = domain.to_ascii_lowercase();
        self.common_name
            .iter()
            .chain(self.alt_names.iter())
            .any(|name| name_matches(&name.to_ascii_lowercase(), &domain))
    }
}

fn name_matches(pattern: &str, domain: &str) -> bool {
    if pattern == domain {
        return true;
    }
    match pattern.strip_prefix("*.") {
        Some(suffix) => domain
            .split_once('.')
            .map(|(label, rest)| !label.is_empty() && rest == suffix)
            .unwrap_or(false),
        None => false,
    }
}

/// RSA-2048, CN=domain, SAN=[domain], self-issued, valid from now for `validity_days`
pub fn generate_self_signed(domain: &str, validity_days: u32) -> RelayResult<PemPair> {
    let now = Utc::now();
    generate_with_window(domain, now, now + Duration::days(validity_days as i64))
}

/// Self-issued certificate with an explicit validity window
pub fn generate_with_window(
    domain: &str,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> RelayResult<PemPair> {
    let rsa = Rsa::generate(RSA_BITS)?;
    let key: PKey<Private> = PKey::from_rsa(rsa)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, domain)?;
    let name = name.build();

    let mut serial = BigNum::new()?;
    serial.rand(128, MsbOption::MAYBE_ZERO, false)?;

    let serial = serial.to_asn1_integer()?;
    let not_before = Asn1Time::from_unix(not_before.timestamp() as libc::time_t)?;
    let not_after = Asn1Time::from_unix(not_after.timestamp() as libc::time_t)?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&key)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    builder.append_extension(BasicConstraints::new().critical().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .build()?,
    )?;
    builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;
    let san = SubjectAlternativeName::new()
        .dns(domain)
        .build(&builder.x509v3_context(None, None))?;
    builder.append_extension(san)?;

    builder.sign(&key, MessageDigest::sha256())?;
    let cert = builder.build();

    Ok(PemPair {
        cert_pem: pem_string(cert.to_pem()?)?,
        key_pem: pem_string(key.private_key_to_pem_pkcs8()?)?,
    })
}

/// Parse the leaf certificate of a PEM bundle
pub fn inspect(cert_pem: &[u8]) -> RelayResult<CertificateFacts> {
    let cert = X509::from_pem(cert_pem)
        .map_err(|e| RelayError::Certificate(format!("certificate does not parse: {}", e)))?;

    let alt_names = cert
        .subject_alt_names()
        .map(|names| {
            names
                .iter()
                .filter_map(|n| n.dnsname().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let public_key = cert.public_key()?;
    // Issuer equals subject and the signature verifies with the certificate's own key
    let self_issued = cert
        .subject_name()
        .try_cmp(cert.issuer_name())
        .map(|order| order == Ordering::Equal)
        .unwrap_or(false);
    let self_signed = self_issued && cert.verify(&public_key).unwrap_or(false);

    let fingerprint = Sha256::digest(cert.to_der()?)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":");

    Ok(CertificateFacts {
        common_name: common_name(cert.subject_name()),
        alt_names,
        issuer_cn: common_name(cert.issuer_name()).unwrap_or_default(),
        not_before: asn1_to_utc(cert.not_before())?,
        not_after: asn1_to_utc(cert.not_after())?,
        self_signed,
        fingerprint,
    })
}

/// Check that `key_pem` parses and belongs to the certificate in `cert_pem`
pub fn check_key_matches(cert_pem: &[u8], key_pem: &[u8]) -> RelayResult<()> {
    let cert = X509::from_pem(cert_pem)
        .map_err(|e| RelayError::Certificate(format!("certificate does not parse: {}", e)))?;
    let key = PKey::private_key_from_pem(key_pem)
        .map_err(|e| RelayError::Certificate(format!("private key does not parse: {}", e)))?;

    if !cert.public_key()?.public_eq(&key) {
        return Err(RelayError::Certificate(
            "private key does not match certificate".to_string(),
        ));
    }
    Ok(())
}

fn common_name(name: &X509NameRef) -> Option<String> {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|s| s.to_string())
}

fn asn1_to_utc(time: &Asn1TimeRef) -> RelayResult<DateTime<Utc>> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let secs = diff.days as i64 * 86_400 + diff.secs as i64;
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| RelayError::Certificate(format!("validity time out of range: {}", time)))
}

fn pem_string(bytes: Vec<u8>) -> RelayResult<String> {
    String::from_utf8(bytes).map_err(|e| RelayError::Certificate(format!("PEM is not UTF-8: {}", e)))
}
