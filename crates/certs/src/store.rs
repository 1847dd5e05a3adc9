//! Key and certificate persistence
//!
//! # Directory Structure
//!
//! ```text
//! storage/
//! ├── auth.key              # ACME account credentials (JSON)
//! ├── example.com.crt       # Leaf certificate followed by its chain
//! └── example.com.key       # Certificate private key (RSA PRIVATE KEY)
//! ```
//!
//! Every file is written atomically: the content goes to a `.tmp` sibling,
//! is synced, and is then renamed over the target. Private keys are created
//! with mode 0600 on Unix.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, trace, warn};

use crate::certificate::CertificateRecord;
use crate::error::CertError;
use crate::keys::{AccountKey, CertificateKeyPair, PrivateKeyFile};

/// Load the account credentials at `path`
///
/// A missing or unreadable file yields `None`, after which the caller
/// registers a new account. Nothing is ever written here.
pub fn load_account_key(path: &Path) -> Option<AccountKey> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            trace!(path = %path.display(), "No stored account key found");
            return None;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read account key, ignoring it");
            return None;
        }
    };

    match AccountKey::from_json(&bytes) {
        Ok(key) => {
            debug!(path = %path.display(), account = %key.account_url(), "Loaded account key");
            Some(key)
        }
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "Stored account key is unreadable, ignoring it"
            );
            None
        }
    }
}

/// Write a private key file with owner-only permissions
pub fn persist_key(key: &impl PrivateKeyFile, path: &Path) -> Result<(), CertError> {
    let contents = key.encode()?;
    write_file_atomic(path, contents.as_bytes(), true)?;
    debug!(path = %path.display(), "Wrote private key");
    Ok(())
}

/// Write a certificate bundle as PEM
pub fn persist_certificate(cert: &CertificateRecord, path: &Path) -> Result<(), CertError> {
    write_file_atomic(path, cert.to_pem().as_bytes(), false)?;
    debug!(path = %path.display(), serial = %cert.serial(), "Wrote certificate");
    Ok(())
}

/// Load a certificate bundle, best effort
///
/// Missing or undecodable files yield `None`.
pub fn load_certificate(path: &Path) -> Option<CertificateRecord> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            trace!(path = %path.display(), error = %e, "No stored certificate");
            return None;
        }
    };

    match CertificateRecord::from_pem_chain(&bytes) {
        Ok(cert) => {
            debug!(
                path = %path.display(),
                expires = %cert.not_after(),
                "Loaded stored certificate"
            );
            Some(cert)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring undecodable certificate file");
            None
        }
    }
}

/// File layout for one domain's key material
#[derive(Debug, Clone)]
pub struct MaterialStore {
    base_path: PathBuf,
    account_key_path: PathBuf,
    domain: String,
}

impl MaterialStore {
    /// Open the store, creating `base_path` with mode 0700 on Unix
    ///
    /// `account_key_path` is used as given; resolve it against the base
    /// directory beforehand if it is relative.
    pub fn new(
        base_path: impl Into<PathBuf>,
        account_key_path: impl Into<PathBuf>,
        domain: impl Into<String>,
    ) -> Result<Self, CertError> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).map_err(|e| CertError::io(&base_path, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&base_path, fs::Permissions::from_mode(0o700))
                .map_err(|e| CertError::io(&base_path, e))?;
        }

        trace!(storage_path = %base_path.display(), "Opened key material store");

        Ok(Self {
            base_path,
            account_key_path: account_key_path.into(),
            domain: domain.into(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn account_key_path(&self) -> &Path {
        &self.account_key_path
    }

    /// `<domain>.crt`
    pub fn certificate_path(&self) -> PathBuf {
        self.base_path.join(format!("{}.crt", self.domain))
    }

    /// `<domain>.key`
    pub fn key_path(&self) -> PathBuf {
        self.base_path.join(format!("{}.key", self.domain))
    }

    pub fn load_account_key(&self) -> Option<AccountKey> {
        load_account_key(&self.account_key_path)
    }

    pub fn persist_account_key(&self, key: &AccountKey) -> Result<(), CertError> {
        persist_key(key, &self.account_key_path)?;
        info!(path = %self.account_key_path.display(), "Persisted ACME account key");
        Ok(())
    }

    pub fn load_certificate(&self) -> Option<CertificateRecord> {
        load_certificate(&self.certificate_path())
    }

    /// Replace only the certificate file, keeping the current key
    ///
    /// Used when the CA reissues for the key already on disk.
    pub fn persist_certificate(&self, cert: &CertificateRecord) -> Result<(), CertError> {
        persist_certificate(cert, &self.certificate_path())
    }

    /// Persist a freshly issued certificate together with its key
    ///
    /// Both files are staged before either is renamed into place, so a
    /// failure while staging leaves the previous pair untouched. The
    /// certificate is renamed first, then the key; if the key cannot be
    /// renamed the previous certificate is restored from a `.bak` copy.
    pub fn persist_issued(
        &self,
        cert: &CertificateRecord,
        key: &CertificateKeyPair,
    ) -> Result<(), CertError> {
        let cert_path = self.certificate_path();
        let key_path = self.key_path();
        let key_pem = key.encode()?;

        let cert_tmp = stage(&cert_path, cert.to_pem().as_bytes(), false)?;
        let key_tmp = match stage(&key_path, key_pem.as_bytes(), true) {
            Ok(tmp) => tmp,
            Err(e) => {
                let _ = fs::remove_file(&cert_tmp);
                return Err(e);
            }
        };
        let discard_staged = || {
            let _ = fs::remove_file(&cert_tmp);
            let _ = fs::remove_file(&key_tmp);
        };

        let backup = backup_path(&cert_path);
        let had_previous = match fs::copy(&cert_path, &backup) {
            Ok(_) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                discard_staged();
                return Err(CertError::io(&cert_path, e));
            }
        };
        let restore_previous = || {
            let restored = if had_previous {
                fs::rename(&backup, &cert_path)
            } else {
                fs::remove_file(&cert_path)
            };
            if let Err(e) = restored {
                warn!(path = %cert_path.display(), error = %e, "Failed to roll back certificate");
            }
        };

        if let Err(e) = fs::rename(&cert_tmp, &cert_path) {
            restore_previous();
            discard_staged();
            return Err(CertError::io(&cert_path, e));
        }
        if let Err(e) = fs::rename(&key_tmp, &key_path) {
            restore_previous();
            discard_staged();
            return Err(CertError::io(&key_path, e));
        }
        if had_previous {
            if let Err(e) = fs::remove_file(&backup) {
                debug!(path = %backup.display(), error = %e, "Failed to remove certificate backup");
            }
        }

        info!(
            domain = %self.domain,
            cert = %cert_path.display(),
            key = %key_path.display(),
            expires = %cert.not_after(),
            "Persisted certificate and key"
        );
        Ok(())
    }
}

// ============================================================================
// Atomic writes
// ============================================================================

fn sibling_path(target: &Path, suffix: &str) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    target.with_file_name(name)
}

fn tmp_path(target: &Path) -> PathBuf {
    sibling_path(target, ".tmp")
}

/// Where the previous certificate waits while a new pair is renamed in
fn backup_path(target: &Path) -> PathBuf {
    sibling_path(target, ".bak")
}

/// Write `content` to the `.tmp` sibling of `target` and sync it
fn stage(target: &Path, content: &[u8], private: bool) -> Result<PathBuf, CertError> {
    let temp_path = tmp_path(target);

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(if private { 0o600 } else { 0o644 });
    }
    #[cfg(not(unix))]
    let _ = private;

    let written = options.open(&temp_path).and_then(|mut file| {
        file.write_all(content)?;
        file.sync_all()
    });

    if let Err(e) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(CertError::io(target, e));
    }

    Ok(temp_path)
}

fn write_file_atomic(target: &Path, content: &[u8], private: bool) -> Result<(), CertError> {
    let temp_path = stage(target, content, private)?;
    fs::rename(&temp_path, target).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        CertError::io(target, e)
    })
}
