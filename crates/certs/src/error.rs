//! Certificate lifecycle error types.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Closed classification of lifecycle failures
///
/// Callers branch on the kind rather than on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The validation address could not be bound
    Bind,
    /// The CA rejected the domain-control proof, or it timed out
    ChallengeFailed,
    /// Account registration was refused
    Registration,
    /// The CA refused to open an authorization for the domain
    Authorization,
    /// Certificate issuance or renewal failed
    Issuance,
    /// Key or certificate persistence failed
    Io,
    /// The CA offered no HTTP-01 challenge
    UnsupportedChallenge,
    /// Key generation, encoding or CSR construction failed
    KeyMaterial,
}

/// Certificate lifecycle errors
#[derive(Error, Debug)]
pub enum CertError {
    #[error("failed to bind challenge responder on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP-01 challenge for {domain} failed: {reason}")]
    ChallengeFailed { domain: String, reason: String },

    #[error("account registration failed: {reason}")]
    Registration { reason: String },

    #[error("authorization for {domain} failed: {reason}")]
    Authorization { domain: String, reason: String },

    #[error("certificate issuance for {domain} failed: {reason}")]
    Issuance { domain: String, reason: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no http-01 challenge offered for {domain} (offered: {})", offered.join(", "))]
    UnsupportedChallenge { domain: String, offered: Vec<String> },

    #[error("key material error: {reason}")]
    KeyMaterial { reason: String },
}

impl CertError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Bind { .. } => ErrorKind::Bind,
            Self::ChallengeFailed { .. } => ErrorKind::ChallengeFailed,
            Self::Registration { .. } => ErrorKind::Registration,
            Self::Authorization { .. } => ErrorKind::Authorization,
            Self::Issuance { .. } => ErrorKind::Issuance,
            Self::Io { .. } => ErrorKind::Io,
            Self::UnsupportedChallenge { .. } => ErrorKind::UnsupportedChallenge,
            Self::KeyMaterial { .. } => ErrorKind::KeyMaterial,
        }
    }

    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn key_material(reason: impl std::fmt::Display) -> Self {
        Self::KeyMaterial {
            reason: reason.to_string(),
        }
    }
}
