//! Issued certificates

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use x509_parser::parse_x509_certificate;

use crate::keys::pem_config;

const CERTIFICATE_PEM_TAG: &str = "CERTIFICATE";

/// A certificate that could not be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid certificate: {0}")]
pub struct CertificateParseError(String);

/// A leaf certificate with the intermediates the CA returned alongside it
///
/// Records are immutable. A renewal that yields a different certificate
/// produces a new record.
#[derive(Clone)]
pub struct CertificateRecord {
    der: Vec<u8>,
    chain: Vec<Vec<u8>>,
    common_name: Option<String>,
    serial: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl CertificateRecord {
    /// Parse a DER leaf certificate with no chain
    pub fn from_der(der: Vec<u8>) -> Result<Self, CertificateParseError> {
        Self::with_chain(der, Vec::new())
    }

    /// Parse a DER leaf certificate and keep `chain` verbatim
    pub fn with_chain(der: Vec<u8>, chain: Vec<Vec<u8>>) -> Result<Self, CertificateParseError> {
        let (_, cert) =
            parse_x509_certificate(&der).map_err(|e| CertificateParseError(e.to_string()))?;

        let validity = cert.validity();
        let not_before = timestamp(validity.not_before.timestamp())?;
        let not_after = timestamp(validity.not_after.timestamp())?;
        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);
        let serial = cert.raw_serial_as_string();

        Ok(Self {
            der,
            chain,
            common_name,
            serial,
            not_before,
            not_after,
        })
    }

    /// Parse a PEM bundle, leaf first
    pub fn from_pem_chain(pem_bytes: &[u8]) -> Result<Self, CertificateParseError> {
        let blocks =
            pem::parse_many(pem_bytes).map_err(|e| CertificateParseError(e.to_string()))?;

        let mut certs = blocks
            .into_iter()
            .filter(|block| block.tag() == CERTIFICATE_PEM_TAG)
            .map(|block| block.into_contents());

        let leaf = certs
            .next()
            .ok_or_else(|| CertificateParseError("no CERTIFICATE block found".to_string()))?;

        Self::with_chain(leaf, certs.collect())
    }

    /// PEM bundle with the leaf first followed by the chain
    pub fn to_pem(&self) -> String {
        let blocks: Vec<pem::Pem> = std::iter::once(&self.der)
            .chain(self.chain.iter())
            .map(|der| pem::Pem::new(CERTIFICATE_PEM_TAG, der.clone()))
            .collect();
        pem::encode_many_config(&blocks, pem_config())
    }

    /// Leaf certificate DER bytes
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn chain(&self) -> &[Vec<u8>] {
        &self.chain
    }

    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    /// Colon-separated hex serial
    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Whether the certificate expires within `window` of `now`
    pub fn expires_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        match now.checked_add_signed(window) {
            Some(deadline) => self.not_after <= deadline,
            None => true,
        }
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, CertificateParseError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| CertificateParseError(format!("timestamp {} out of range", secs)))
}

/// Records are equal when their leaf bytes are equal
impl PartialEq for CertificateRecord {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for CertificateRecord {}

impl fmt::Debug for CertificateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRecord")
            .field("common_name", &self.common_name)
            .field("serial", &self.serial)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("chain_len", &self.chain.len())
            .finish()
    }
}
