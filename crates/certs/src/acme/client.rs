//! ACME client backed by `instant-acme`
//!
//! One client serves one domain: the order opened by `authorize` is the one
//! `issue_certificate` finalizes, and the finalized order is what
//! `renew_certificate` downloads from again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, ChallengeType, Identifier, NewAccount, NewOrder, Order,
    OrderStatus,
};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use super::{
    AcmeDirectory, AcmeError, Authorization, AuthorizationStatus, Challenge, ChallengeKind,
    Registration,
};
use crate::certificate::CertificateRecord;
use crate::keys::AccountKey;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_POLL_ATTEMPTS: u32 = 30;

/// [`AcmeDirectory`] backed by a live ACME server
pub struct AcmeHttpClient {
    /// ACME directory URL
    directory_url: String,
    /// Contact address sent when creating an account
    contact_email: Option<String>,
    /// Delay between status polls of authorizations and orders
    poll_interval: Duration,
    /// Polls before a pending authorization or order counts as timed out
    poll_attempts: u32,

    /// Account restored from credentials, keyed by account URL
    account: Mutex<Option<(String, Arc<Account>)>>,
    /// Order opened by the last `authorize`, consumed by `issue_certificate`
    pending: Mutex<Option<Order>>,
    /// Order of the last issued certificate
    issued: Mutex<Option<Order>>,
}

impl AcmeHttpClient {
    pub fn new(directory_url: impl Into<String>) -> Self {
        Self {
            directory_url: directory_url.into(),
            contact_email: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_attempts: DEFAULT_POLL_ATTEMPTS,
            account: Mutex::new(None),
            pending: Mutex::new(None),
            issued: Mutex::new(None),
        }
    }

    /// Contact address sent when creating an account
    pub fn with_contact_email(mut self, email: Option<String>) -> Self {
        self.contact_email = email;
        self
    }

    /// How often and how many times to poll authorizations and orders
    pub fn with_poll(mut self, interval: Duration, attempts: u32) -> Self {
        self.poll_interval = interval;
        self.poll_attempts = attempts.max(1);
        self
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    /// The live account for `key`, restored on first use
    async fn account(&self, key: &AccountKey) -> Result<Arc<Account>, AcmeError> {
        let mut cached = self.account.lock().await;
        if let Some((url, account)) = cached.as_ref() {
            if url == key.account_url() {
                return Ok(Arc::clone(account));
            }
        }

        let credentials: AccountCredentials = serde_json::from_str(key.as_json())
            .map_err(|e| AcmeError::Protocol(format!("unusable account credentials: {}", e)))?;
        let account = Arc::new(Account::from_credentials(credentials).await?);
        debug!(account = %key.account_url(), "Restored ACME account");

        *cached = Some((key.account_url().to_string(), Arc::clone(&account)));
        Ok(account)
    }

    /// Refresh `order` until it leaves `pending`/`processing`
    ///
    /// Returns whether the order still has to be finalized.
    async fn settle_order(&self, order: &mut Order) -> Result<bool, AcmeError> {
        for attempt in 1..=self.poll_attempts {
            let needs_finalize = match order.refresh().await?.status {
                OrderStatus::Ready => Some(true),
                OrderStatus::Valid => Some(false),
                OrderStatus::Invalid => {
                    return Err(AcmeError::Protocol("order is invalid".to_string()))
                }
                OrderStatus::Pending | OrderStatus::Processing => None,
            };
            if let Some(needs_finalize) = needs_finalize {
                return Ok(needs_finalize);
            }
            trace!(attempt, "Order not settled yet");
            tokio::time::sleep(self.poll_interval).await;
        }
        Err(AcmeError::Timeout(format!(
            "order not ready after {} polls",
            self.poll_attempts
        )))
    }

    /// Download the chain of a valid order, waiting while it is processed
    async fn download_chain(&self, order: &mut Order) -> Result<CertificateRecord, AcmeError> {
        for attempt in 1..=self.poll_attempts {
            if let Some(chain) = order.certificate().await? {
                return CertificateRecord::from_pem_chain(chain.as_bytes()).map_err(|e| {
                    AcmeError::Protocol(format!("CA returned an unusable certificate: {}", e))
                });
            }
            trace!(attempt, "Certificate not ready yet");
            tokio::time::sleep(self.poll_interval).await;
        }
        Err(AcmeError::Timeout(format!(
            "certificate not available after {} polls",
            self.poll_attempts
        )))
    }
}

#[async_trait]
impl AcmeDirectory for AcmeHttpClient {
    async fn register(&self) -> Result<Registration, AcmeError> {
        let contact: Vec<String> = self
            .contact_email
            .iter()
            .map(|email| format!("mailto:{}", email))
            .collect();
        let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();

        debug!(directory = %self.directory_url, "Creating ACME account");
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact_refs,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await?;

        let json = serde_json::to_string_pretty(&credentials).map_err(|e| {
            AcmeError::Protocol(format!("unserializable account credentials: {}", e))
        })?;
        let account_key = AccountKey::from_json(json.as_bytes())
            .map_err(|e| AcmeError::Protocol(e.to_string()))?;

        info!(account = %account_key.account_url(), "Created ACME account");
        *self.account.lock().await =
            Some((account_key.account_url().to_string(), Arc::new(account)));

        Ok(Registration {
            account_key,
            already_registered: false,
        })
    }

    async fn authorize(
        &self,
        account_key: &AccountKey,
        domain: &str,
    ) -> Result<Authorization, AcmeError> {
        let account = self.account(account_key).await?;

        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;
        debug!(domain, "Opened order");

        let authorizations = order.authorizations().await?;
        let authz = authorizations
            .iter()
            .find(|a| identifier_value(&a.identifier) == domain)
            .ok_or_else(|| {
                AcmeError::Protocol(format!("order carries no authorization for {}", domain))
            })?;

        let authorization = Authorization {
            identifier: identifier_value(&authz.identifier).to_string(),
            status: authorization_status(&authz.status),
            challenges: authz
                .challenges
                .iter()
                .map(|c| Challenge {
                    kind: challenge_kind(&c.r#type),
                    token: c.token.clone(),
                    url: c.url.clone(),
                    key_authorization: order.key_authorization(c).as_str().to_string(),
                })
                .collect(),
        };

        if self.pending.lock().await.replace(order).is_some() {
            warn!(domain, "Discarding unfinished order");
        }
        Ok(authorization)
    }

    async fn notify_challenge_ready(
        &self,
        _account_key: &AccountKey,
        challenge: &Challenge,
    ) -> Result<(), AcmeError> {
        let mut pending = self.pending.lock().await;
        let order = pending
            .as_mut()
            .ok_or_else(|| AcmeError::Protocol("no order awaiting validation".to_string()))?;

        order.set_challenge_ready(&challenge.url).await?;
        debug!(challenge = %challenge.url, "Challenge marked ready");

        for attempt in 1..=self.poll_attempts {
            tokio::time::sleep(self.poll_interval).await;

            let authorizations = order.authorizations().await?;
            let status = authorizations
                .iter()
                .find(|a| a.challenges.iter().any(|c| c.url == challenge.url))
                .map(|a| authorization_status(&a.status))
                .ok_or_else(|| {
                    AcmeError::Protocol(format!("challenge {} vanished", challenge.url))
                })?;

            match status {
                AuthorizationStatus::Valid => return Ok(()),
                AuthorizationStatus::Pending => {
                    trace!(attempt, "Authorization still pending");
                }
                other => {
                    return Err(AcmeError::ChallengeFailed(format!(
                        "authorization is {:?}",
                        other
                    )))
                }
            }
        }

        Err(AcmeError::Timeout(format!(
            "challenge {} still pending after {} polls",
            challenge.url, self.poll_attempts
        )))
    }

    async fn issue_certificate(
        &self,
        _account_key: &AccountKey,
        csr_der: &[u8],
    ) -> Result<CertificateRecord, AcmeError> {
        let mut order = self
            .pending
            .lock()
            .await
            .take()
            .ok_or_else(|| AcmeError::Protocol("no order to finalize".to_string()))?;

        if self.settle_order(&mut order).await? {
            order.finalize(csr_der).await?;
            debug!("Order finalized");
        }

        let record = self.download_chain(&mut order).await?;
        *self.issued.lock().await = Some(order);
        Ok(record)
    }

    async fn renew_certificate(&self, domain: &str) -> Result<CertificateRecord, AcmeError> {
        let mut issued = self.issued.lock().await;
        let Some(order) = issued.as_mut() else {
            return Err(AcmeError::NothingToRenew {
                domain: domain.to_string(),
            });
        };

        let chain = order
            .certificate()
            .await?
            .ok_or_else(|| AcmeError::NothingToRenew {
                domain: domain.to_string(),
            })?;
        CertificateRecord::from_pem_chain(chain.as_bytes())
            .map_err(|e| AcmeError::Protocol(format!("CA returned an unusable certificate: {}", e)))
    }
}

fn identifier_value(id: &Identifier) -> &str {
    match id {
        Identifier::Dns(domain) => domain.as_str(),
    }
}

fn challenge_kind(kind: &ChallengeType) -> ChallengeKind {
    match kind {
        ChallengeType::Http01 => ChallengeKind::Http01,
        ChallengeType::Dns01 => ChallengeKind::Dns01,
        ChallengeType::TlsAlpn01 => ChallengeKind::TlsAlpn01,
        #[allow(unreachable_patterns)]
        other => ChallengeKind::Other(format!("{:?}", other).to_lowercase()),
    }
}

/// Map the library's status onto ours by its lowercase wire name
fn authorization_status(status: &instant_acme::AuthorizationStatus) -> AuthorizationStatus {
    let name = format!("{:?}", status).to_lowercase();
    serde_json::from_value(serde_json::Value::String(name)).unwrap_or(AuthorizationStatus::Invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_kind_mapping() {
        assert_eq!(challenge_kind(&ChallengeType::Http01), ChallengeKind::Http01);
        assert_eq!(challenge_kind(&ChallengeType::Dns01), ChallengeKind::Dns01);
        assert_eq!(challenge_kind(&ChallengeType::TlsAlpn01), ChallengeKind::TlsAlpn01);
    }

    #[test]
    fn test_authorization_status_mapping() {
        use instant_acme::AuthorizationStatus as Lib;

        assert_eq!(authorization_status(&Lib::Pending), AuthorizationStatus::Pending);
        assert_eq!(authorization_status(&Lib::Valid), AuthorizationStatus::Valid);
        assert_eq!(authorization_status(&Lib::Invalid), AuthorizationStatus::Invalid);
    }

    #[test]
    fn test_poll_attempts_floor() {
        let client = AcmeHttpClient::new("https://ca.test/directory")
            .with_poll(Duration::from_millis(10), 0);
        assert_eq!(client.poll_attempts, 1);
        assert_eq!(client.directory_url(), "https://ca.test/directory");
    }

    #[tokio::test]
    async fn test_renew_without_issuance() {
        let client = AcmeHttpClient::new("https://ca.test/directory");
        let err = client.renew_certificate("home.example.com").await.unwrap_err();
        assert!(matches!(
            err,
            AcmeError::NothingToRenew { domain } if domain == "home.example.com"
        ));
    }

    #[tokio::test]
    async fn test_issue_without_order() {
        let client = AcmeHttpClient::new("https://ca.test/directory");
        let key = AccountKey::from_json(br#"{"id":"https://ca.test/acct/1"}"#).unwrap();
        let err = client.issue_certificate(&key, b"csr").await.unwrap_err();
        assert!(matches!(err, AcmeError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_notify_without_order() {
        let client = AcmeHttpClient::new("https://ca.test/directory");
        let key = AccountKey::from_json(br#"{"id":"https://ca.test/acct/1"}"#).unwrap();
        let challenge = Challenge {
            kind: ChallengeKind::Http01,
            token: "tok3n".to_string(),
            url: "https://ca.test/chall/1".to_string(),
            key_authorization: "tok3n.thumbprint".to_string(),
        };
        let err = client.notify_challenge_ready(&key, &challenge).await.unwrap_err();
        assert!(matches!(err, AcmeError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_authorize_rejects_incomplete_credentials() {
        let client = AcmeHttpClient::new("https://ca.test/directory");
        let key = AccountKey::from_json(br#"{"id":"https://ca.test/acct/1"}"#).unwrap();
        let err = client.authorize(&key, "home.example.com").await.unwrap_err();
        assert!(matches!(err, AcmeError::Protocol(reason) if reason.contains("credentials")));
    }
}
