//! Hearth Certificate Manager
//!
//! Unattended TLS certificates for a single domain via ACME HTTP-01.
//!
//! The library acquires a domain-validated certificate from an ACME CA,
//! persists it next to its private key, and keeps it renewed from a
//! background task:
//!
//! - **Key material**: account credentials and RSA certificate keys, with
//!   atomic persistence
//! - **ACME adapter**: [`AcmeDirectory`] capability trait and the
//!   `instant-acme` backed [`AcmeHttpClient`]
//! - **Challenge responder**: transient HTTP listener for `/.well-known/acme-challenge/`
//! - **Lifecycle controller**: [`CertificateManager`] state machine
//! - **Renewal scheduler**: [`RenewalScheduler`] cancellable loop
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use hearth_certs::{AcmeHttpClient, CertificateManager, RenewalScheduler};
//! use hearth_config::AcmeConfig;
//!
//! let config = AcmeConfig::new("home.example.com");
//! let acme = Arc::new(AcmeHttpClient::new(&config.directory_url));
//! let mut manager = CertificateManager::from_config(&config, acme)?;
//!
//! manager.bootstrap().await?;
//! let handle = RenewalScheduler::new(manager)
//!     .with_interval(config.renew_interval())
//!     .spawn();
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod certificate;
pub mod challenge;
pub mod controller;
pub mod error;
pub mod keys;
pub mod scheduler;
pub mod store;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Errors
pub use error::{CertError, ErrorKind};

// Key material
pub use certificate::{CertificateParseError, CertificateRecord};
pub use keys::{AccountKey, CertificateKeyPair, PrivateKeyFile};
pub use store::MaterialStore;

// ACME adapter
pub use acme::{
    AcmeDirectory, AcmeError, AcmeHttpClient, Authorization, AuthorizationStatus, Challenge,
    ChallengeKind, Registration,
};

// Challenge responder
pub use challenge::{ChallengeResponder, ChallengeResponse, ResponderHandle};

// Lifecycle
pub use controller::{CertificateManager, Domain, LifecycleState, Step};
pub use scheduler::{RenewalHandle, RenewalScheduler};
