//! ACME protocol adapter
//!
//! The lifecycle controller talks to the certificate authority only through
//! the [`AcmeDirectory`] trait. [`AcmeHttpClient`] implements it on top of
//! `instant-acme`; tests substitute their own implementation.
//!
//! # Flow
//!
//! 1. `register` a new account (an existing one counts as success, see
//!    [`Registration::already_registered`])
//! 2. `authorize` the domain and pick the `http-01` challenge
//! 3. serve the key authorization, then `notify_challenge_ready` and wait
//! 4. `issue_certificate` with a CSR for a fresh key
//! 5. later, `renew_certificate`

mod client;

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::certificate::CertificateRecord;
use crate::keys::AccountKey;

pub use client::AcmeHttpClient;

/// Challenge type tag as it appears on the wire
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChallengeKind {
    Http01,
    Dns01,
    TlsAlpn01,
    Other(String),
}

impl ChallengeKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Http01 => "http-01",
            Self::Dns01 => "dns-01",
            Self::TlsAlpn01 => "tls-alpn-01",
            Self::Other(kind) => kind,
        }
    }
}

impl From<&str> for ChallengeKind {
    fn from(value: &str) -> Self {
        match value {
            "http-01" => Self::Http01,
            "dns-01" => Self::Dns01,
            "tls-alpn-01" => Self::TlsAlpn01,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One way of proving control of a domain, offered by the CA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub kind: ChallengeKind,
    pub token: String,
    /// URL to post to once the challenge is ready
    pub url: String,
    /// `<token>.<account key thumbprint>`, the body the CA expects to fetch
    pub key_authorization: String,
}

/// Authorization state as reported by the CA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

/// The CA's answer to a request to certify a domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub identifier: String,
    pub status: AuthorizationStatus,
    pub challenges: Vec<Challenge>,
}

impl Authorization {
    /// The HTTP-01 challenge, if the CA offered one
    pub fn http01(&self) -> Option<&Challenge> {
        self.challenges
            .iter()
            .find(|c| c.kind == ChallengeKind::Http01)
    }

    /// Type tags of every offered challenge
    pub fn offered(&self) -> Vec<String> {
        self.challenges
            .iter()
            .map(|c| c.kind.as_str().to_string())
            .collect()
    }
}

/// A successful account registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Credentials of the account, not yet persisted
    pub account_key: AccountKey,
    /// The CA already knew the account; treated the same as a new one
    pub already_registered: bool,
}

/// Adapter errors
///
/// The controller converts these into [`crate::CertError`] according to the
/// step that produced them.
#[derive(Error, Debug)]
pub enum AcmeError {
    #[error("ACME request failed: {0}")]
    Acme(#[from] instant_acme::Error),

    #[error("challenge validation failed: {0}")]
    ChallengeFailed(String),

    #[error("unexpected CA response: {0}")]
    Protocol(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// No certificate has been issued through this adapter yet
    #[error("no certificate to renew for {domain}")]
    NothingToRenew { domain: String },
}

/// Certificate authority operations the lifecycle controller depends on
#[async_trait]
pub trait AcmeDirectory: Send + Sync {
    /// Create an account at the CA
    ///
    /// The account's private key is generated here and returned inside
    /// [`Registration::account_key`]. Nothing is written to disk.
    async fn register(&self) -> Result<Registration, AcmeError>;

    /// Open an authorization for `domain`
    async fn authorize(
        &self,
        account_key: &AccountKey,
        domain: &str,
    ) -> Result<Authorization, AcmeError>;

    /// Tell the CA the challenge response is being served and wait for its
    /// verdict
    async fn notify_challenge_ready(
        &self,
        account_key: &AccountKey,
        challenge: &Challenge,
    ) -> Result<(), AcmeError>;

    /// Request a certificate for a DER-encoded CSR
    async fn issue_certificate(
        &self,
        account_key: &AccountKey,
        csr_der: &[u8],
    ) -> Result<CertificateRecord, AcmeError>;

    /// Fetch the current certificate for `domain` again
    ///
    /// The CA may return the very same certificate.
    async fn renew_certificate(&self, domain: &str) -> Result<CertificateRecord, AcmeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authorization(kinds: &[&str]) -> Authorization {
        Authorization {
            identifier: "home.example.com".to_string(),
            status: AuthorizationStatus::Pending,
            challenges: kinds
                .iter()
                .enumerate()
                .map(|(i, kind)| Challenge {
                    kind: ChallengeKind::from(*kind),
                    token: format!("token-{}", i),
                    url: format!("https://ca.test/chall/{}", i),
                    key_authorization: format!("token-{}.thumbprint", i),
                })
                .collect(),
        }
    }

    #[test]
    fn test_selects_http01_by_tag() {
        let authz = authorization(&["dns-01", "http-01", "tls-alpn-01"]);
        let challenge = authz.http01().unwrap();
        assert_eq!(challenge.token, "token-1");
    }

    #[test]
    fn test_no_http01_offered() {
        let authz = authorization(&["dns-01", "tls-alpn-01"]);
        assert!(authz.http01().is_none());
        assert_eq!(authz.offered(), vec!["dns-01", "tls-alpn-01"]);
    }

    #[test]
    fn test_challenge_kind_round_trip() {
        for tag in ["http-01", "dns-01", "tls-alpn-01", "dns-account-01"] {
            assert_eq!(ChallengeKind::from(tag).as_str(), tag);
        }
    }
}
