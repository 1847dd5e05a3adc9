//! Hearth configuration
//!
//! Configuration for the automated certificate manager, loaded from a KDL
//! file. Every field except the domain has a default.
//!
//! # Example
//!
//! ```kdl
//! acme {
//!     directory "https://acme-v02.api.letsencrypt.org/directory"
//!     domain "home.example.com"
//!     email "admin@example.com"
//!     storage "/var/lib/hearth"
//!     account-key "auth.key"
//!     validation-address "0.0.0.0:80"
//!     validation-timeout-secs 120
//!     renew-interval-days 30
//!     renew-before-days 30
//! }
//!
//! logging {
//!     level "info"
//!     format "json"
//! }
//! ```

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

mod error;
mod parse;

pub use error::ConfigError;
pub use parse::parse_config;

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

// ============================================================================
// Defaults
// ============================================================================

pub(crate) fn default_directory_url() -> String {
    LETS_ENCRYPT_PRODUCTION.to_string()
}

pub(crate) fn default_storage_dir() -> PathBuf {
    PathBuf::from(".")
}

pub(crate) fn default_account_key_file() -> PathBuf {
    PathBuf::from("auth.key")
}

pub(crate) fn default_validation_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 80))
}

pub(crate) fn default_validation_timeout_secs() -> u64 {
    120
}

pub(crate) fn default_renew_interval_days() -> u64 {
    30
}

pub(crate) fn default_renew_before_days() -> u64 {
    30
}

/// Upper bound for the day-valued settings
pub const MAX_DAYS: u64 = 365;

// ============================================================================
// Configuration model
// ============================================================================

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub acme: AcmeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Certificate lifecycle settings for a single domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcmeConfig {
    /// ACME directory endpoint of the certificate authority
    #[serde(default = "default_directory_url")]
    pub directory_url: String,

    /// Fully-qualified domain name to certify
    pub domain: String,

    /// Optional contact address registered with the account
    #[serde(default)]
    pub contact_email: Option<String>,

    /// Working directory for key and certificate files
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Account key file, relative to `storage_dir` unless absolute
    #[serde(default = "default_account_key_file")]
    pub account_key_file: PathBuf,

    /// Address the HTTP-01 responder binds during validation
    #[serde(default = "default_validation_address")]
    pub validation_address: SocketAddr,

    /// Upper bound on waiting for the CA's validation verdict
    #[serde(default = "default_validation_timeout_secs")]
    pub validation_timeout_secs: u64,

    /// Interval between scheduled renewals
    #[serde(default = "default_renew_interval_days")]
    pub renew_interval_days: u64,

    /// A stored certificate expiring further out than this is adopted at
    /// startup without contacting the CA. Zero always refreshes.
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u64,
}

impl AcmeConfig {
    /// Create a configuration for `domain` with every other field defaulted
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            directory_url: default_directory_url(),
            domain: domain.into(),
            contact_email: None,
            storage_dir: default_storage_dir(),
            account_key_file: default_account_key_file(),
            validation_address: default_validation_address(),
            validation_timeout_secs: default_validation_timeout_secs(),
            renew_interval_days: default_renew_interval_days(),
            renew_before_days: default_renew_before_days(),
        }
    }

    /// Resolved path of the account key file
    pub fn account_key_path(&self) -> PathBuf {
        if self.account_key_file.is_absolute() {
            self.account_key_file.clone()
        } else {
            self.storage_dir.join(&self.account_key_file)
        }
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_secs(self.renew_interval_days.saturating_mul(24 * 3600))
    }

    /// Validate field values
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_domain(&self.domain)?;
        validate_directory_url(&self.directory_url)?;

        if let Some(email) = &self.contact_email {
            if !email.contains('@') {
                return Err(ConfigError::invalid(
                    "email",
                    format!("'{}' is not an email address", email),
                ));
            }
        }

        if self.account_key_file.as_os_str().is_empty() {
            return Err(ConfigError::invalid("account-key", "must not be empty"));
        }

        if self.validation_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "validation-timeout-secs",
                "must be greater than zero",
            ));
        }

        if self.renew_interval_days == 0 {
            return Err(ConfigError::invalid(
                "renew-interval-days",
                "must be at least one day",
            ));
        }

        for (field, days) in [
            ("renew-interval-days", self.renew_interval_days),
            ("renew-before-days", self.renew_before_days),
        ] {
            if days > MAX_DAYS {
                return Err(ConfigError::invalid(
                    field,
                    format!("must be at most {} days, got {}", MAX_DAYS, days),
                ));
            }
        }

        Ok(())
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl Config {
    /// Load, parse and validate a KDL configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Reading configuration file");

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = parse_config(&content)?;
        config.validate()?;

        info!(
            path = %path.display(),
            domain = %config.acme.domain,
            directory = %config.acme.directory_url,
            "Loaded configuration"
        );

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.acme.validate()
    }
}

fn validate_domain(domain: &str) -> Result<(), ConfigError> {
    if domain.is_empty() {
        return Err(ConfigError::invalid("domain", "must not be empty"));
    }
    if domain.contains('*') {
        return Err(ConfigError::invalid(
            "domain",
            "wildcard certificates need DNS-01 validation, which is not supported",
        ));
    }
    if domain.contains("://") || domain.contains('/') {
        return Err(ConfigError::invalid(
            "domain",
            format!("'{}' must be a bare host name without scheme or path", domain),
        ));
    }
    if domain.len() > 253 {
        return Err(ConfigError::invalid("domain", "exceeds 253 characters"));
    }

    for label in domain.split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(ConfigError::invalid(
                "domain",
                format!("'{}' contains an invalid label '{}'", domain, label),
            ));
        }
    }

    Ok(())
}

fn validate_directory_url(raw: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| ConfigError::invalid("directory", format!("'{}': {}", raw, e)))?;

    match parsed.scheme() {
        "https" => Ok(()),
        // Plain HTTP is only acceptable for a local test CA
        "http" if matches!(parsed.host_str(), Some("localhost" | "127.0.0.1" | "[::1]")) => Ok(()),
        other => Err(ConfigError::invalid(
            "directory",
            format!("scheme '{}' is not allowed, use https", other),
        )),
    }
}
