//! Integration tests for the certificate lifecycle controller
//!
//! Each test drives a [`CertificateManager`] against the in-process
//! [`MockDirectory`] CA. HTTP-01 challenges are really served on a
//! loopback port and fetched back by the mock before it accepts them.

mod common;

use std::fs;
use std::net::TcpListener;
use std::sync::Arc;

use common::{Harness, MockDirectory, RegisterMode, RenewMode, ACCOUNT_URL, DOMAIN};
use hearth_certs::{
    AccountKey, AuthorizationStatus, CertificateRecord, ErrorKind, LifecycleState, Step,
};

fn read(path: &std::path::Path) -> String {
    fs::read_to_string(path).unwrap()
}

// ============================================================================
// Bootstrap
// ============================================================================

#[tokio::test]
async fn test_bootstrap_issues_and_persists() {
    let mut harness = Harness::new();

    let cert = harness.manager.bootstrap().await.unwrap();

    assert_eq!(harness.acme.calls(), ["register", "authorize", "notify", "issue"]);
    assert_eq!(harness.manager.state(), LifecycleState::Active);
    assert_eq!(cert.common_name(), Some(DOMAIN));
    assert_eq!(harness.manager.active_certificate(), Some(cert.clone()));

    assert_eq!(read(&harness.certificate_path()), cert.to_pem());
    assert!(read(&harness.key_path()).contains("BEGIN RSA PRIVATE KEY"));
    assert!(harness.account_key_path().exists());
}

#[tokio::test]
async fn test_account_key_written_only_after_validation() {
    let mut harness = Harness::new();

    harness.manager.bootstrap().await.unwrap();

    assert!(!*harness.acme.key_written_before_validation.lock());
    let stored = AccountKey::from_json(read(&harness.account_key_path()).as_bytes()).unwrap();
    assert_eq!(stored.account_url(), ACCOUNT_URL);
}

#[tokio::test]
async fn test_already_registered_proceeds_to_authorization() {
    let mut harness = Harness::new();
    *harness.acme.register.lock() = RegisterMode::AlreadyRegistered;

    harness.manager.bootstrap().await.unwrap();

    assert_eq!(harness.acme.calls(), ["register", "authorize", "notify", "issue"]);
    assert_eq!(harness.manager.state(), LifecycleState::Active);
}

#[tokio::test]
async fn test_registration_failure_writes_nothing() {
    let mut harness = Harness::new();
    *harness.acme.register.lock() = RegisterMode::Fail;

    let err = harness.manager.bootstrap().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Registration);
    assert_eq!(
        harness.manager.state(),
        LifecycleState::Failed {
            at: Step::Registration,
            kind: ErrorKind::Registration
        }
    );
    assert_eq!(harness.acme.calls(), ["register"]);
    assert!(!harness.account_key_path().exists());
    assert!(!harness.certificate_path().exists());
    assert!(harness.manager.active_certificate().is_none());
}

#[tokio::test]
async fn test_rejected_challenge_keeps_account_key_off_disk() {
    let mut harness = Harness::new();
    *harness.acme.reject_challenge.lock() = true;

    let err = harness.manager.bootstrap().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ChallengeFailed);
    assert!(err.to_string().contains("connection refused"));
    assert_eq!(
        harness.manager.state(),
        LifecycleState::Failed {
            at: Step::Validation,
            kind: ErrorKind::ChallengeFailed
        }
    );
    assert!(!harness.account_key_path().exists());
    assert!(!harness.certificate_path().exists());
    assert!(harness.manager.domain().challenge().is_none());
}

#[tokio::test]
async fn test_missing_http01_is_unsupported() {
    let mut harness = Harness::new();
    *harness.acme.offer_http01.lock() = false;

    let err = harness.manager.bootstrap().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::UnsupportedChallenge);
    assert!(err.to_string().contains("dns-01"));
    assert_eq!(
        harness.manager.state(),
        LifecycleState::Failed {
            at: Step::Authorization,
            kind: ErrorKind::UnsupportedChallenge
        }
    );
    assert_eq!(harness.acme.count("notify"), 0);
}

#[tokio::test]
async fn test_issuance_failure_leaves_no_certificate() {
    let mut harness = Harness::new();
    *harness.acme.fail_issue.lock() = true;

    let err = harness.manager.bootstrap().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Issuance);
    assert_eq!(
        harness.manager.state(),
        LifecycleState::Failed {
            at: Step::Issuance,
            kind: ErrorKind::Issuance
        }
    );
    assert!(!harness.certificate_path().exists());
    assert!(!harness.key_path().exists());
    // Validation succeeded, so the account is kept
    assert!(harness.account_key_path().exists());
}

#[tokio::test]
async fn test_valid_authorization_skips_challenge() {
    let mut harness = Harness::new();
    *harness.acme.authorization_status.lock() = AuthorizationStatus::Valid;

    harness.manager.bootstrap().await.unwrap();

    assert_eq!(harness.acme.calls(), ["register", "authorize", "issue"]);
    assert!(harness.account_key_path().exists());
}

#[tokio::test]
async fn test_responder_port_released_after_bootstrap() {
    let mut harness = Harness::new();

    harness.manager.bootstrap().await.unwrap();

    TcpListener::bind(harness.responder_addr).expect("challenge port should be free");
}

#[tokio::test]
async fn test_subscribers_see_active_certificate() {
    let mut harness = Harness::new();
    let mut rx = harness.manager.subscribe();
    assert!(rx.borrow().is_none());

    let cert = harness.manager.bootstrap().await.unwrap();

    assert!(rx.has_changed().unwrap());
    assert_eq!(rx.borrow_and_update().clone(), Some(cert));
}

// ============================================================================
// Restart
// ============================================================================

#[tokio::test]
async fn test_current_stored_certificate_adopted_without_ca() {
    let mut harness = Harness::new();
    let first = harness.manager.bootstrap().await.unwrap();

    let mut harness = harness.restart(Arc::new(MockDirectory::new()));
    let adopted = harness.manager.bootstrap().await.unwrap();

    assert!(harness.acme.calls().is_empty());
    assert_eq!(adopted, first);
    assert_eq!(harness.manager.state(), LifecycleState::Active);
}

#[tokio::test]
async fn test_expiring_stored_certificate_replaced_on_restart() {
    let mut harness = Harness::new();
    harness.manager.bootstrap().await.unwrap();

    let expiring = CertificateRecord::from_der(common::self_signed(DOMAIN, 10)).unwrap();
    hearth_certs::store::persist_certificate(&expiring, &harness.certificate_path()).unwrap();

    // A fresh CA adapter has nothing to renew, so the manager issues again
    let mut harness = harness.restart(Arc::new(MockDirectory::new()));
    let cert = harness.manager.bootstrap().await.unwrap();

    assert_eq!(harness.acme.calls(), ["renew", "authorize", "notify", "issue"]);
    assert_ne!(cert.as_ref(), &expiring);
    assert_eq!(read(&harness.certificate_path()), cert.to_pem());
}

#[tokio::test]
async fn test_lost_account_key_does_not_block_current_certificate() {
    let mut harness = Harness::new();
    let first = harness.manager.bootstrap().await.unwrap();
    fs::remove_file(harness.account_key_path()).unwrap();

    let acme = Arc::new(MockDirectory::new());
    *acme.reject_challenge.lock() = true;
    let mut harness = harness.restart(acme);
    let adopted = harness.manager.bootstrap().await.unwrap();

    assert!(harness.acme.calls().is_empty());
    assert_eq!(adopted, first);
    assert_eq!(harness.manager.active_certificate(), Some(first));
    assert!(!harness.account_key_path().exists());
}

#[tokio::test]
async fn test_expiring_certificate_served_while_reissue_fails() {
    let mut harness = Harness::new();
    harness.manager.bootstrap().await.unwrap();

    let expiring = CertificateRecord::from_der(common::self_signed(DOMAIN, 10)).unwrap();
    hearth_certs::store::persist_certificate(&expiring, &harness.certificate_path()).unwrap();
    fs::remove_file(harness.account_key_path()).unwrap();

    let acme = Arc::new(MockDirectory::new());
    *acme.reject_challenge.lock() = true;
    let mut harness = harness.restart(acme);
    let err = harness.manager.bootstrap().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ChallengeFailed);
    assert_eq!(harness.acme.calls(), ["register", "authorize", "notify"]);
    assert_eq!(harness.manager.active_certificate().as_deref(), Some(&expiring));
    assert_eq!(read(&harness.certificate_path()), expiring.to_pem());
}

#[tokio::test]
async fn test_failed_refresh_and_issuance_keep_stored_files() {
    let mut harness = Harness::new();
    harness.manager.bootstrap().await.unwrap();

    let expiring = CertificateRecord::from_der(common::self_signed(DOMAIN, 10)).unwrap();
    hearth_certs::store::persist_certificate(&expiring, &harness.certificate_path()).unwrap();
    let cert_before = read(&harness.certificate_path());
    let key_before = read(&harness.key_path());

    let acme = Arc::new(MockDirectory::new());
    *acme.renew.lock() = RenewMode::Fail;
    *acme.fail_issue.lock() = true;
    let mut harness = harness.restart(acme);
    let err = harness.manager.bootstrap().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Issuance);
    assert_eq!(
        harness.manager.state(),
        LifecycleState::Failed {
            at: Step::Issuance,
            kind: ErrorKind::Issuance
        }
    );
    assert_eq!(harness.acme.calls(), ["renew", "authorize", "notify", "issue"]);
    assert_eq!(harness.manager.active_certificate().as_deref(), Some(&expiring));
    assert_eq!(read(&harness.certificate_path()), cert_before);
    assert_eq!(read(&harness.key_path()), key_before);
}

// ============================================================================
// Renewal
// ============================================================================

#[tokio::test]
async fn test_renew_without_certificate_bootstraps() {
    let mut harness = Harness::new();

    harness.manager.renew().await.unwrap();

    assert_eq!(harness.acme.calls(), ["register", "authorize", "notify", "issue"]);
}

#[tokio::test]
async fn test_unchanged_renewal_forces_new_issuance() {
    let mut harness = Harness::new();
    let first = harness.manager.bootstrap().await.unwrap();
    harness.acme.clear_calls();

    let renewed = harness.manager.renew().await.unwrap();

    assert_eq!(harness.acme.calls(), ["renew", "authorize", "notify", "issue"]);
    assert_ne!(renewed, first);
    assert_eq!(harness.manager.active_certificate(), Some(renewed.clone()));
    assert_eq!(read(&harness.certificate_path()), renewed.to_pem());
}

#[tokio::test]
async fn test_changed_renewal_replaces_certificate() {
    let mut harness = Harness::new();
    let first = harness.manager.bootstrap().await.unwrap();
    let key_before = read(&harness.key_path());
    harness.acme.clear_calls();
    *harness.acme.renew.lock() = RenewMode::Fresh;

    let renewed = harness.manager.renew().await.unwrap();

    assert_eq!(harness.acme.calls(), ["renew"]);
    assert_ne!(renewed, first);
    assert_eq!(harness.manager.state(), LifecycleState::Active);
    assert_eq!(read(&harness.certificate_path()), renewed.to_pem());
    assert_eq!(read(&harness.key_path()), key_before);
}

#[tokio::test]
async fn test_renewal_failure_keeps_current_certificate() {
    let mut harness = Harness::new();
    let first = harness.manager.bootstrap().await.unwrap();
    let cert_before = read(&harness.certificate_path());
    let key_before = read(&harness.key_path());
    *harness.acme.renew.lock() = RenewMode::Fail;

    let err = harness.manager.renew().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Issuance);
    assert_eq!(
        harness.manager.state(),
        LifecycleState::Failed {
            at: Step::Renewal,
            kind: ErrorKind::Issuance
        }
    );
    assert_eq!(harness.manager.active_certificate(), Some(first));
    assert_eq!(read(&harness.certificate_path()), cert_before);
    assert_eq!(read(&harness.key_path()), key_before);
}

#[tokio::test]
async fn test_failed_reissue_keeps_current_certificate() {
    let mut harness = Harness::new();
    let first = harness.manager.bootstrap().await.unwrap();
    let cert_before = read(&harness.certificate_path());
    *harness.acme.reject_challenge.lock() = true;

    let err = harness.manager.renew().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ChallengeFailed);
    assert_eq!(harness.manager.active_certificate(), Some(first));
    assert_eq!(read(&harness.certificate_path()), cert_before);

    // The next cycle recovers
    *harness.acme.reject_challenge.lock() = false;
    harness.manager.renew().await.unwrap();
    assert_eq!(harness.manager.state(), LifecycleState::Active);
}

#[tokio::test]
async fn test_renewal_persistence_failure_keeps_current_certificate() {
    let mut harness = Harness::new();
    let first = harness.manager.bootstrap().await.unwrap();
    let cert_before = read(&harness.certificate_path());
    *harness.acme.renew.lock() = RenewMode::Fresh;

    // A directory in place of the certificate's staging file
    let mut staging = harness.certificate_path().into_os_string();
    staging.push(".tmp");
    fs::create_dir(&staging).unwrap();

    let err = harness.manager.renew().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(
        harness.manager.state(),
        LifecycleState::Failed {
            at: Step::Persistence,
            kind: ErrorKind::Io
        }
    );
    assert_eq!(harness.manager.active_certificate(), Some(first));
    assert_eq!(read(&harness.certificate_path()), cert_before);
}
