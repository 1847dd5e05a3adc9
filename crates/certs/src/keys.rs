//! Key material
//!
//! Two kinds of secret are managed:
//!
//! - [`AccountKey`] identifies the ACME account. The ACME library generates
//!   its private key when the account is created and returns it together
//!   with the account URL as one JSON credentials document, which is what
//!   gets persisted and reused across restarts.
//! - [`CertificateKeyPair`] is bound to one issued certificate and is
//!   generated fresh for every issuance: a 2048-bit RSA key stored as PKCS#1
//!   DER inside a PEM block.

use std::fmt;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_RSA_SHA256};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use serde::Deserialize;

use crate::error::CertError;

/// RSA modulus size for every generated certificate key
pub const KEY_BITS: usize = 2048;

/// PEM label of the persisted certificate key
pub const CERTIFICATE_KEY_PEM_TAG: &str = "RSA PRIVATE KEY";

/// PEM encoding shared by every file this crate writes
pub(crate) fn pem_config() -> pem::EncodeConfig {
    pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF)
}

/// Secrets that are written to disk as a single owner-only file
pub trait PrivateKeyFile {
    /// File contents
    fn encode(&self) -> Result<String, CertError>;
}

// ============================================================================
// Account key
// ============================================================================

/// Fields of the credentials document this crate relies on
#[derive(Deserialize)]
struct CredentialsHeader {
    id: String,
}

/// ACME account credentials
///
/// Opaque apart from the account URL. The document is produced by the ACME
/// adapter on registration and handed back to it unchanged.
#[derive(Clone, PartialEq, Eq)]
pub struct AccountKey {
    json: String,
    account_url: String,
}

impl AccountKey {
    /// Decode a credentials document
    ///
    /// Anything that is not a JSON object carrying a string `id` is
    /// rejected.
    pub fn from_json(bytes: &[u8]) -> Result<Self, CertError> {
        let json = std::str::from_utf8(bytes)
            .map_err(|e| CertError::key_material(format!("account key is not UTF-8: {}", e)))?;
        let header: CredentialsHeader = serde_json::from_str(json).map_err(|e| {
            CertError::key_material(format!("invalid account credentials: {}", e))
        })?;
        if header.id.is_empty() {
            return Err(CertError::key_material("account credentials carry no account URL"));
        }

        Ok(Self {
            json: json.trim().to_string(),
            account_url: header.id,
        })
    }

    /// URL of the account at the CA
    pub fn account_url(&self) -> &str {
        &self.account_url
    }

    /// The credentials document
    pub fn as_json(&self) -> &str {
        &self.json
    }
}

impl PrivateKeyFile for AccountKey {
    fn encode(&self) -> Result<String, CertError> {
        Ok(format!("{}\n", self.json))
    }
}

impl fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountKey")
            .field("account_url", &self.account_url)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Certificate key pair
// ============================================================================

/// Private key bound to one issued certificate
#[derive(Clone)]
pub struct CertificateKeyPair {
    key: RsaPrivateKey,
}

impl CertificateKeyPair {
    pub fn generate() -> Result<Self, CertError> {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), KEY_BITS)
            .map_err(|e| CertError::key_material(format!("failed to generate RSA key: {}", e)))?;
        Ok(Self { key })
    }

    /// Decode a PKCS#1 RSA key from any PEM block
    ///
    /// The label is not checked so keys written by other tools with a
    /// different label still load.
    pub fn from_pem(pem_bytes: &[u8]) -> Result<Self, CertError> {
        let block = pem::parse(pem_bytes)
            .map_err(|e| CertError::key_material(format!("invalid PEM: {}", e)))?;
        let key = RsaPrivateKey::from_pkcs1_der(block.contents())
            .map_err(|e| CertError::key_material(format!("invalid PKCS#1 key: {}", e)))?;
        key.validate()
            .map_err(|e| CertError::key_material(format!("inconsistent RSA key: {}", e)))?;
        Ok(Self { key })
    }

    /// DER-encoded PKCS#10 request for `domain`, signed with this key
    ///
    /// The subject CN and the single DNS SAN are both the domain.
    pub fn csr(&self, domain: &str) -> Result<Vec<u8>, CertError> {
        let pkcs8 = self
            .key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CertError::key_material(format!("failed to encode key: {}", e)))?;
        let key_pair = KeyPair::from_pem_and_sign_algo(pkcs8.as_str(), &PKCS_RSA_SHA256)
            .map_err(|e| CertError::key_material(format!("failed to load key for CSR: {}", e)))?;

        let mut params = CertificateParams::new(vec![domain.to_string()])
            .map_err(|e| CertError::key_material(format!("invalid domain '{}': {}", domain, e)))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, domain);
        params.distinguished_name = dn;

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| CertError::key_material(format!("failed to create CSR: {}", e)))?;

        Ok(csr.der().to_vec())
    }
}

impl PrivateKeyFile for CertificateKeyPair {
    fn encode(&self) -> Result<String, CertError> {
        let der = self
            .key
            .to_pkcs1_der()
            .map_err(|e| CertError::key_material(format!("failed to encode key: {}", e)))?;
        let block = pem::Pem::new(CERTIFICATE_KEY_PEM_TAG, der.as_bytes());
        Ok(pem::encode_config(&block, pem_config()))
    }
}

impl fmt::Debug for CertificateKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateKeyPair").finish_non_exhaustive()
    }
}
