//! Background certificate renewal scheduler
//!
//! Owns the [`CertificateManager`] and re-enters its renewal flow on a
//! fixed interval. A renewal runs to completion before the next interval
//! starts, so attempts never overlap.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::controller::CertificateManager;

/// Default renewal interval (30 days)
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(30 * 24 * 3600);

/// Minimum renewal interval (1 minute)
const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(60);

/// Background certificate renewal scheduler
pub struct RenewalScheduler {
    /// The controller, owned by the loop while it runs
    manager: CertificateManager,
    /// Time between the end of one attempt and the start of the next
    interval: Duration,
}

impl RenewalScheduler {
    /// Create a scheduler running every [`DEFAULT_RENEW_INTERVAL`]
    ///
    /// # Arguments
    ///
    /// * `manager` - Controller to renew through, normally already
    ///   bootstrapped
    pub fn new(manager: CertificateManager) -> Self {
        Self {
            manager,
            interval: DEFAULT_RENEW_INTERVAL,
        }
    }

    /// Set the renewal interval
    ///
    /// The interval is clamped to a minimum of 1 minute.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_RENEW_INTERVAL);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start the renewal loop on its own task
    pub fn spawn(self) -> RenewalHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join_handle = tokio::spawn(self.run(shutdown_rx));

        RenewalHandle {
            shutdown_tx,
            join_handle,
        }
    }

    async fn run(mut self, mut shutdown_rx: oneshot::Receiver<()>) -> CertificateManager {
        info!(
            domain = %self.manager.domain().name(),
            interval_secs = self.interval.as_secs(),
            "Starting certificate renewal scheduler"
        );

        // Set once the handle is dropped without a shutdown request
        let mut detached = false;

        loop {
            let tick = tokio::time::sleep(self.interval);
            tokio::pin!(tick);

            tokio::select! {
                _ = &mut tick => {}
                received = &mut shutdown_rx, if !detached => match received {
                    Ok(()) => break,
                    Err(_) => {
                        debug!("Renewal handle dropped, scheduler keeps running detached");
                        detached = true;
                        tick.await;
                    }
                },
            }

            debug!("Running scheduled certificate renewal");

            // Shutdown waits for an in-flight renewal to finish
            match self.manager.renew().await {
                Ok(cert) => info!(
                    domain = %self.manager.domain().name(),
                    serial = %cert.serial(),
                    expires = %cert.not_after(),
                    "Scheduled renewal succeeded"
                ),
                Err(e) => error!(
                    domain = %self.manager.domain().name(),
                    kind = ?e.kind(),
                    error = %e,
                    "Scheduled renewal failed, keeping current certificate"
                ),
            }
        }

        info!("Certificate renewal scheduler stopped");
        self.manager
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("manager", &self.manager)
            .field("interval", &self.interval)
            .finish()
    }
}

/// Handle for a running renewal loop
///
/// Dropping the handle detaches the loop: it keeps renewing until the
/// runtime shuts down. Use [`shutdown`](Self::shutdown) to stop it.
pub struct RenewalHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<CertificateManager>,
}

impl RenewalHandle {
    /// Stop the loop and take the manager back
    ///
    /// Returns `None` if the loop task panicked or was aborted.
    pub async fn shutdown(self) -> Option<CertificateManager> {
        debug!("Shutting down certificate renewal scheduler");
        let _ = self.shutdown_tx.send(());
        match self.join_handle.await {
            Ok(manager) => Some(manager),
            Err(e) => {
                warn!(error = %e, "Renewal scheduler task ended abnormally");
                None
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }
}

