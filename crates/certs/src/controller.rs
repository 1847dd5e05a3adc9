//! Certificate lifecycle controller
//!
//! Drives one domain from "no certificate" to an active, persisted
//! certificate and keeps it fresh.
//!
//! ```text
//! Start ─► AccountReady ─► Authorized ─► Validated ─► Issued ─► Active
//!   │           │              │             │           │
//!   └───────────┴──────────────┴─────────────┴───────────┴──► Failed { at, kind }
//! ```
//!
//! Every step error is caught here, logged with the failing step, and
//! returned. Nothing panics, and a failure never touches the certificate
//! that is already active in memory and on disk.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use hearth_config::AcmeConfig;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::acme::{AcmeDirectory, AcmeError, AuthorizationStatus, Challenge};
use crate::certificate::CertificateRecord;
use crate::challenge::{ChallengeResponder, ChallengeResponse};
use crate::error::{CertError, ErrorKind};
use crate::keys::{AccountKey, CertificateKeyPair};
use crate::store::MaterialStore;

/// The step a lifecycle run was performing when it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Registration,
    Authorization,
    Validation,
    Issuance,
    Renewal,
    Persistence,
}

/// Where the controller is in the certificate lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Start,
    AccountReady,
    Authorized,
    Validated,
    Issued,
    Active,
    Failed { at: Step, kind: ErrorKind },
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { at, kind } => write!(f, "Failed(at={:?}, kind={:?})", at, kind),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Lifecycle state of one domain
///
/// Owned by exactly one [`CertificateManager`].
#[derive(Debug)]
pub struct Domain {
    /// Fully qualified domain name the certificate is issued for
    name: String,
    /// ACME directory of the issuing CA
    directory_url: String,
    /// Account credentials, set once the account is ready
    account_key: Option<AccountKey>,
    /// The challenge being answered, only set during validation
    challenge: Option<Challenge>,
    /// The active certificate
    certificate: Option<Arc<CertificateRecord>>,
}

impl Domain {
    pub fn new(name: impl Into<String>, directory_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            directory_url: directory_url.into(),
            account_key: None,
            challenge: None,
            certificate: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    pub fn account_key(&self) -> Option<&AccountKey> {
        self.account_key.as_ref()
    }

    /// The challenge being answered, only set during validation
    pub fn challenge(&self) -> Option<&Challenge> {
        self.challenge.as_ref()
    }

    pub fn certificate(&self) -> Option<&Arc<CertificateRecord>> {
        self.certificate.as_ref()
    }
}

/// Persistence status of the account key held in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccountKeyStatus {
    OnDisk,
    /// Generated and registered, waiting for the first successful validation
    AwaitingValidation,
    /// Validated, but writing it failed; retried on the next cycle
    AwaitingWrite,
}

type StepResult<T> = Result<T, (Step, CertError)>;

trait AtStep<T> {
    fn at(self, step: Step) -> StepResult<T>;
}

impl<T> AtStep<T> for Result<T, CertError> {
    fn at(self, step: Step) -> StepResult<T> {
        self.map_err(|e| (step, e))
    }
}

/// Certificate lifecycle controller for a single domain
pub struct CertificateManager {
    /// The single domain this manager owns
    domain: Domain,
    /// Certificate authority
    acme: Arc<dyn AcmeDirectory>,
    /// On-disk key material
    store: MaterialStore,
    /// Listener used while a challenge is in flight
    responder: ChallengeResponder,
    /// Stored certificates expiring further out than this are adopted as-is
    renew_before: chrono::Duration,
    state: LifecycleState,
    account_key_status: AccountKeyStatus,
    /// Publishes every newly activated certificate
    publisher: watch::Sender<Option<Arc<CertificateRecord>>>,
}

impl CertificateManager {
    /// Create a manager in the `Start` state
    ///
    /// # Arguments
    ///
    /// * `domain` - Domain to manage, usually without an active certificate
    /// * `acme` - Certificate authority adapter
    /// * `store` - Where keys and certificates are persisted
    /// * `responder` - HTTP-01 responder bound only during validation
    pub fn new(
        domain: Domain,
        acme: Arc<dyn AcmeDirectory>,
        store: MaterialStore,
        responder: ChallengeResponder,
    ) -> Self {
        let (publisher, _) = watch::channel(None);
        Self {
            domain,
            acme,
            store,
            responder,
            renew_before: chrono::Duration::zero(),
            state: LifecycleState::Start,
            account_key_status: AccountKeyStatus::OnDisk,
            publisher,
        }
    }

    /// Build a manager from configuration
    pub fn from_config(
        config: &AcmeConfig,
        acme: Arc<dyn AcmeDirectory>,
    ) -> Result<Self, CertError> {
        let store = MaterialStore::new(
            &config.storage_dir,
            config.account_key_path(),
            &config.domain,
        )?;
        let responder =
            ChallengeResponder::new(config.validation_address, config.validation_timeout());
        let domain = Domain::new(&config.domain, &config.directory_url);

        Ok(Self::new(domain, acme, store, responder)
            .with_renew_before(days(config.renew_before_days)))
    }

    /// Adopt a stored certificate at bootstrap without contacting the CA if
    /// it expires further out than `window`
    pub fn with_renew_before(mut self, window: chrono::Duration) -> Self {
        self.renew_before = window;
        self
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn store(&self) -> &MaterialStore {
        &self.store
    }

    pub fn active_certificate(&self) -> Option<Arc<CertificateRecord>> {
        self.domain.certificate.clone()
    }

    /// Watch the active certificate
    ///
    /// The key for a published certificate is on disk by the time it is
    /// published.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<CertificateRecord>>> {
        self.publisher.subscribe()
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    /// Obtain a usable certificate, issuing one if necessary
    ///
    /// Run once at startup, before serving TLS.
    pub async fn bootstrap(&mut self) -> Result<Arc<CertificateRecord>, CertError> {
        info!(
            domain = %self.domain.name,
            directory = %self.domain.directory_url,
            "Bootstrapping certificate"
        );
        self.state = LifecycleState::Start;
        let result = self.run_bootstrap().await;
        self.settle(result)
    }

    /// Refresh the active certificate
    ///
    /// Without an active certificate this runs [`bootstrap`](Self::bootstrap).
    /// On failure the previous certificate stays active.
    pub async fn renew(&mut self) -> Result<Arc<CertificateRecord>, CertError> {
        let Some(active) = self.domain.certificate.clone() else {
            info!(domain = %self.domain.name, "No active certificate, bootstrapping");
            return self.bootstrap().await;
        };

        info!(domain = %self.domain.name, expires = %active.not_after(), "Renewing certificate");
        let result = self.run_renewal(active).await;
        self.settle(result)
    }

    // =========================================================================
    // Flows
    // =========================================================================

    async fn run_bootstrap(&mut self) -> StepResult<Arc<CertificateRecord>> {
        let now = Utc::now();
        let mut adopted = None;
        let found_stored = match self.store.load_certificate() {
            Some(stored) if !stored.expires_within(self.renew_before, now) => {
                info!(
                    domain = %self.domain.name,
                    expires = %stored.not_after(),
                    "Stored certificate is current, adopting it"
                );
                return Ok(self.activate(stored));
            }
            Some(stored) if stored.not_after() > now => {
                info!(
                    domain = %self.domain.name,
                    expires = %stored.not_after(),
                    "Stored certificate expires soon, serving it until replaced"
                );
                adopted = Some(self.activate(stored));
                true
            }
            Some(stored) => {
                warn!(
                    domain = %self.domain.name,
                    expired = %stored.not_after(),
                    "Stored certificate has expired"
                );
                true
            }
            None => false,
        };

        let account_key = self.ensure_account().await?;

        let validated = self.account_key_status == AccountKeyStatus::AwaitingValidation;
        if validated {
            self.authorize_and_validate(&account_key).await?;
        }

        if found_stored {
            let refreshed = self.acme.renew_certificate(&self.domain.name).await;
            match refreshed {
                Ok(refreshed) if adopted.as_deref() != Some(&refreshed) => {
                    self.persist_certificate(&refreshed)
                        .await
                        .at(Step::Persistence)?;
                    return Ok(self.activate(refreshed));
                }
                Ok(_) => {
                    debug!(domain = %self.domain.name, "Refresh returned the stored certificate")
                }
                Err(e) => {
                    debug!(
                        domain = %self.domain.name,
                        error = %e,
                        "Refresh of stored certificate failed"
                    )
                }
            }
            info!(domain = %self.domain.name, "Falling back to fresh issuance");
        }

        if validated {
            self.issue(&account_key).await
        } else {
            self.issue_fresh(&account_key).await
        }
    }

    async fn run_renewal(
        &mut self,
        active: Arc<CertificateRecord>,
    ) -> StepResult<Arc<CertificateRecord>> {
        let account_key = self.ensure_account().await?;

        let renewed = self.acme.renew_certificate(&self.domain.name).await;
        let renewed = match renewed {
            Ok(renewed) => renewed,
            Err(AcmeError::NothingToRenew { .. }) => {
                info!(
                    domain = %self.domain.name,
                    "CA has no certificate to renew, issuing a fresh one"
                );
                return self.issue_fresh(&account_key).await;
            }
            Err(e) => return Err((Step::Renewal, issuance_error(&self.domain.name, e))),
        };

        if renewed == *active {
            warn!(
                domain = %self.domain.name,
                serial = %renewed.serial(),
                "CA returned the active certificate unchanged, issuing a fresh one"
            );
            return self.issue_fresh(&account_key).await;
        }

        self.persist_certificate(&renewed)
            .await
            .at(Step::Persistence)?;
        Ok(self.activate(renewed))
    }

    // =========================================================================
    // Steps
    // =========================================================================

    /// Start → AccountReady
    async fn ensure_account(&mut self) -> StepResult<AccountKey> {
        if let Some(key) = self.domain.account_key.clone() {
            if self.account_key_status == AccountKeyStatus::AwaitingWrite {
                self.persist_account_key(&key).await;
            }
            self.state = LifecycleState::AccountReady;
            return Ok(key);
        }

        let key = match self.store.load_account_key() {
            Some(key) => {
                self.account_key_status = AccountKeyStatus::OnDisk;
                key
            }
            None => {
                let registration = self
                    .acme
                    .register()
                    .await
                    .map_err(|e| CertError::Registration {
                        reason: e.to_string(),
                    })
                    .at(Step::Registration)?;

                let account = registration.account_key.account_url();
                if registration.already_registered {
                    info!(account = %account, "ACME account already registered");
                } else {
                    info!(account = %account, "Registered ACME account");
                }
                self.account_key_status = AccountKeyStatus::AwaitingValidation;
                registration.account_key
            }
        };

        self.domain.account_key = Some(key.clone());
        self.state = LifecycleState::AccountReady;
        Ok(key)
    }

    /// AccountReady → Authorized → Validated
    async fn authorize_and_validate(&mut self, account_key: &AccountKey) -> StepResult<()> {
        let name = self.domain.name.clone();

        let authorization = self
            .acme
            .authorize(account_key, &name)
            .await
            .map_err(|e| CertError::Authorization {
                domain: name.clone(),
                reason: e.to_string(),
            })
            .at(Step::Authorization)?;
        self.state = LifecycleState::Authorized;

        if authorization.status == AuthorizationStatus::Valid {
            debug!(domain = %name, "Authorization already valid, skipping challenge");
        } else {
            let challenge = authorization
                .http01()
                .cloned()
                .ok_or_else(|| CertError::UnsupportedChallenge {
                    domain: name.clone(),
                    offered: authorization.offered(),
                })
                .at(Step::Authorization)?;

            debug!(domain = %name, token = %challenge.token, "Answering HTTP-01 challenge");
            self.domain.challenge = Some(challenge.clone());

            let response = ChallengeResponse::http01(&challenge);
            let acme = Arc::clone(&self.acme);
            let verdict = async { acme.notify_challenge_ready(account_key, &challenge).await };
            let outcome = self.responder.serve_challenge(&name, response, verdict).await;

            self.domain.challenge = None;
            outcome.at(Step::Validation)?;
        }

        self.state = LifecycleState::Validated;

        if self.account_key_status == AccountKeyStatus::AwaitingValidation {
            self.persist_account_key(account_key).await;
        }

        Ok(())
    }

    /// Validated → Issued → Active
    async fn issue(&mut self, account_key: &AccountKey) -> StepResult<Arc<CertificateRecord>> {
        let name = self.domain.name.clone();

        let (certificate_key, csr) = self.generate_certificate_key().await.at(Step::Issuance)?;

        let record = self
            .acme
            .issue_certificate(account_key, &csr)
            .await
            .map_err(|e| issuance_error(&name, e))
            .at(Step::Issuance)?;
        self.state = LifecycleState::Issued;

        let issued = record.clone();
        self.on_store(move |store| store.persist_issued(&issued, &certificate_key))
            .await
            .at(Step::Persistence)?;

        Ok(self.activate(record))
    }

    /// Authorize, validate and issue
    async fn issue_fresh(
        &mut self,
        account_key: &AccountKey,
    ) -> StepResult<Arc<CertificateRecord>> {
        self.authorize_and_validate(account_key).await?;
        self.issue(account_key).await
    }

    /// Write the account key for the first time
    ///
    /// A failure is logged and retried on the next cycle.
    async fn persist_account_key(&mut self, key: &AccountKey) {
        let key = key.clone();
        match self.on_store(move |store| store.persist_account_key(&key)).await {
            Ok(()) => self.account_key_status = AccountKeyStatus::OnDisk,
            Err(e) => {
                warn!(error = %e, "Failed to persist account key, will retry next cycle");
                self.account_key_status = AccountKeyStatus::AwaitingWrite;
            }
        }
    }

    async fn persist_certificate(&self, record: &CertificateRecord) -> Result<(), CertError> {
        let record = record.clone();
        self.on_store(move |store| store.persist_certificate(&record))
            .await
    }

    /// Fresh certificate key and a CSR for the domain
    ///
    /// RSA generation takes long enough to stall the runtime, so it runs on
    /// the blocking pool.
    async fn generate_certificate_key(&self) -> Result<(CertificateKeyPair, Vec<u8>), CertError> {
        let name = self.domain.name.clone();
        tokio::task::spawn_blocking(move || {
            let key = CertificateKeyPair::generate()?;
            let csr = key.csr(&name)?;
            Ok((key, csr))
        })
        .await
        .map_err(|e| CertError::key_material(format!("key generation task failed: {}", e)))?
    }

    /// Run a synchronous store write on the blocking pool
    async fn on_store<F>(&self, write: F) -> Result<(), CertError>
    where
        F: FnOnce(&MaterialStore) -> Result<(), CertError> + Send + 'static,
    {
        let store = self.store.clone();
        let base_path = store.base_path().to_path_buf();
        tokio::task::spawn_blocking(move || write(&store))
            .await
            .map_err(|e| CertError::io(&base_path, std::io::Error::other(e)))?
    }

    fn activate(&mut self, record: CertificateRecord) -> Arc<CertificateRecord> {
        let record = Arc::new(record);
        self.domain.certificate = Some(Arc::clone(&record));
        self.state = LifecycleState::Active;
        self.publisher.send_replace(Some(Arc::clone(&record)));

        info!(
            domain = %self.domain.name,
            serial = %record.serial(),
            not_after = %record.not_after(),
            "Certificate active"
        );
        record
    }

    fn settle(
        &mut self,
        result: StepResult<Arc<CertificateRecord>>,
    ) -> Result<Arc<CertificateRecord>, CertError> {
        result.map_err(|(step, err)| {
            self.state = LifecycleState::Failed {
                at: step,
                kind: err.kind(),
            };
            error!(
                domain = %self.domain.name,
                step = ?step,
                kind = ?err.kind(),
                error = %err,
                "Certificate lifecycle step failed"
            );
            err
        })
    }
}

impl fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateManager")
            .field("domain", &self.domain.name)
            .field("state", &self.state)
            .field("responder", &self.responder)
            .finish_non_exhaustive()
    }
}

fn days(count: u64) -> chrono::Duration {
    i64::try_from(count)
        .ok()
        .and_then(chrono::Duration::try_days)
        .unwrap_or(chrono::Duration::MAX)
}

fn issuance_error(domain: &str, e: AcmeError) -> CertError {
    CertError::Issuance {
        domain: domain.to_string(),
        reason: e.to_string(),
    }
}
