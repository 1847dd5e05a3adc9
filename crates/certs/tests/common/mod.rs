//! Shared test harness for the certificate lifecycle
//!
//! Provides an in-process [`MockDirectory`] standing in for an ACME CA and
//! a helper that wires a [`CertificateManager`] to it inside a temporary
//! directory, with the challenge responder on a free loopback port.
//!
//! # Usage
//!
//! ```ignore
//! mod common;
//! use common::Harness;
//!
//! #[tokio::test]
//! async fn issues_certificate() {
//!     let mut harness = Harness::new();
//!     harness.manager.bootstrap().await.unwrap();
//!     assert!(harness.certificate_path().exists());
//! }
//! ```

#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use hearth_certs::{
    AccountKey, AcmeDirectory, AcmeError, Authorization, AuthorizationStatus, CertificateManager,
    CertificateRecord, Challenge, ChallengeKind, ChallengeResponder, Domain, MaterialStore,
    Registration,
};
use parking_lot::Mutex;
use tempfile::TempDir;

pub const DOMAIN: &str = "home.example.com";
pub const DIRECTORY_URL: &str = "https://ca.test/directory";
pub const TOKEN: &str = "evaGxfADs6pSRb2LAv9IZf17Dt3juxGJ-PCt92wr-oA";
pub const ACCOUNT_URL: &str = "https://ca.test/acct/1";

/// Credentials the mock hands out on registration
pub fn account_key() -> AccountKey {
    let json = serde_json::json!({
        "id": ACCOUNT_URL,
        "key_pkcs8": "MIGHAgEAMBMGByqGSM49AgEGCCqGSM49AwEHBG0wawIBAQQg",
        "directory": DIRECTORY_URL,
    });
    AccountKey::from_json(json.to_string().as_bytes()).unwrap()
}

pub fn key_authorization() -> String {
    format!("{}.mock-thumbprint", TOKEN)
}

/// How the mock answers account registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterMode {
    Registered,
    AlreadyRegistered,
    Fail,
}

/// How the mock answers a renewal request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewMode {
    /// Hand back the last issued certificate unchanged
    SameAsLast,
    /// Mint a new certificate for the domain
    Fresh,
    Fail,
}

/// In-process ACME CA
///
/// Every knob can be changed between calls. Calls are recorded by name.
pub struct MockDirectory {
    pub register: Mutex<RegisterMode>,
    pub authorization_status: Mutex<AuthorizationStatus>,
    pub offer_http01: Mutex<bool>,
    pub reject_challenge: Mutex<bool>,
    pub fail_issue: Mutex<bool>,
    pub renew: Mutex<RenewMode>,
    /// Fetch the challenge from the responder before accepting it
    pub responder_addr: Mutex<Option<SocketAddr>>,
    /// Account key file that must not exist while a challenge is pending
    pub account_key_path: Mutex<Option<PathBuf>>,
    pub key_written_before_validation: Mutex<bool>,
    last_issued: Mutex<Option<CertificateRecord>>,
    calls: Mutex<Vec<&'static str>>,
}

impl MockDirectory {
    pub fn new() -> Self {
        Self {
            register: Mutex::new(RegisterMode::Registered),
            authorization_status: Mutex::new(AuthorizationStatus::Pending),
            offer_http01: Mutex::new(true),
            reject_challenge: Mutex::new(false),
            fail_issue: Mutex::new(false),
            renew: Mutex::new(RenewMode::SameAsLast),
            responder_addr: Mutex::new(None),
            account_key_path: Mutex::new(None),
            key_written_before_validation: Mutex::new(false),
            last_issued: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|c| **c == name).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn last_issued(&self) -> Option<CertificateRecord> {
        self.last_issued.lock().clone()
    }

    fn record(&self, name: &'static str) {
        self.calls.lock().push(name);
    }

    fn mint(&self) -> CertificateRecord {
        let record = CertificateRecord::from_der(self_signed(DOMAIN, 90)).unwrap();
        *self.last_issued.lock() = Some(record.clone());
        record
    }
}

#[async_trait]
impl AcmeDirectory for MockDirectory {
    async fn register(&self) -> Result<Registration, AcmeError> {
        self.record("register");
        let mode = *self.register.lock();
        match mode {
            RegisterMode::Registered | RegisterMode::AlreadyRegistered => Ok(Registration {
                account_key: account_key(),
                already_registered: mode == RegisterMode::AlreadyRegistered,
            }),
            RegisterMode::Fail => Err(AcmeError::Protocol("registration closed".to_string())),
        }
    }

    async fn authorize(
        &self,
        _account_key: &AccountKey,
        domain: &str,
    ) -> Result<Authorization, AcmeError> {
        self.record("authorize");

        let mut challenges = vec![Challenge {
            kind: ChallengeKind::Dns01,
            token: TOKEN.to_string(),
            url: "https://ca.test/chall/dns".to_string(),
            key_authorization: key_authorization(),
        }];
        if *self.offer_http01.lock() {
            challenges.push(Challenge {
                kind: ChallengeKind::Http01,
                token: TOKEN.to_string(),
                url: "https://ca.test/chall/http".to_string(),
                key_authorization: key_authorization(),
            });
        }

        Ok(Authorization {
            identifier: domain.to_string(),
            status: *self.authorization_status.lock(),
            challenges,
        })
    }

    async fn notify_challenge_ready(
        &self,
        _account_key: &AccountKey,
        challenge: &Challenge,
    ) -> Result<(), AcmeError> {
        self.record("notify");

        let key_path = self.account_key_path.lock().clone();
        if key_path.is_some_and(|path| path.exists()) {
            *self.key_written_before_validation.lock() = true;
        }

        let responder_addr = *self.responder_addr.lock();
        if let Some(addr) = responder_addr {
            let url = format!("http://{}/.well-known/acme-challenge/{}", addr, challenge.token);
            let body = fetch(&url)
                .await
                .map_err(|e| AcmeError::ChallengeFailed(format!("fetch failed: {}", e)))?;
            if body != key_authorization() {
                return Err(AcmeError::ChallengeFailed(format!(
                    "unexpected key authorization {:?}",
                    body
                )));
            }
        }

        if *self.reject_challenge.lock() {
            return Err(AcmeError::ChallengeFailed(
                "connection refused".to_string(),
            ));
        }
        Ok(())
    }

    async fn issue_certificate(
        &self,
        _account_key: &AccountKey,
        csr_der: &[u8],
    ) -> Result<CertificateRecord, AcmeError> {
        self.record("issue");
        assert!(!csr_der.is_empty(), "issuance needs a CSR");

        if *self.fail_issue.lock() {
            return Err(AcmeError::Protocol("order is invalid".to_string()));
        }
        Ok(self.mint())
    }

    async fn renew_certificate(&self, domain: &str) -> Result<CertificateRecord, AcmeError> {
        self.record("renew");
        match *self.renew.lock() {
            RenewMode::SameAsLast => self.last_issued().ok_or(AcmeError::NothingToRenew {
                domain: domain.to_string(),
            }),
            RenewMode::Fresh => Ok(self.mint()),
            RenewMode::Fail => Err(AcmeError::Protocol("service unavailable".to_string())),
        }
    }
}

async fn fetch(url: &str) -> Result<String, reqwest::Error> {
    let client = reqwest::Client::builder().no_proxy().build()?;
    client.get(url).send().await?.text().await
}

/// Self-signed certificate for `domain` expiring `days` from today
pub fn self_signed(domain: &str, days: i64) -> Vec<u8> {
    let key = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::new(vec![domain.to_string()]).unwrap();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, domain);

    let start = (Utc::now() - chrono::Duration::days(1)).date_naive();
    let end = (Utc::now() + chrono::Duration::days(days)).date_naive();
    params.not_before = rcgen::date_time_ymd(start.year(), start.month() as u8, start.day() as u8);
    params.not_after = rcgen::date_time_ymd(end.year(), end.month() as u8, end.day() as u8);

    params.self_signed(&key).unwrap().der().to_vec()
}

/// Reserve a loopback port that is free right now
pub fn free_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// A manager wired to a [`MockDirectory`] in a temporary directory
pub struct Harness {
    pub manager: CertificateManager,
    pub acme: Arc<MockDirectory>,
    pub responder_addr: SocketAddr,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::in_dir(dir, Arc::new(MockDirectory::new()))
    }

    /// Build a manager over an existing storage directory
    pub fn in_dir(dir: TempDir, acme: Arc<MockDirectory>) -> Self {
        let responder_addr = free_port();
        let account_key_path = dir.path().join("account.key");

        *acme.responder_addr.lock() = Some(responder_addr);
        *acme.account_key_path.lock() = Some(account_key_path.clone());

        let store = MaterialStore::new(dir.path(), account_key_path, DOMAIN).unwrap();
        let responder = ChallengeResponder::new(responder_addr, Duration::from_secs(10));
        let directory: Arc<dyn AcmeDirectory> = acme.clone();

        let manager = CertificateManager::new(
            Domain::new(DOMAIN, DIRECTORY_URL),
            directory,
            store,
            responder,
        )
        .with_renew_before(chrono::Duration::days(30));

        Self {
            manager,
            acme,
            responder_addr,
            dir,
        }
    }

    /// Drop the manager and start a new one over the same files
    pub fn restart(self, acme: Arc<MockDirectory>) -> Self {
        let Self { manager, dir, .. } = self;
        drop(manager);
        Self::in_dir(dir, acme)
    }

    pub fn certificate_path(&self) -> PathBuf {
        self.manager.store().certificate_path()
    }

    pub fn key_path(&self) -> PathBuf {
        self.manager.store().key_path()
    }

    pub fn account_key_path(&self) -> PathBuf {
        self.manager.store().account_key_path().to_path_buf()
    }
}
