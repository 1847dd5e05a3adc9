//! HTTP-01 challenge responder
//!
//! A short-lived HTTP/1.1 listener that serves exactly one
//! `/.well-known/acme-challenge/<token>` response while the CA validates
//! the domain, and is torn down as soon as the verdict is known.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::header::{ALLOW, CONTENT_TYPE};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use crate::acme::{AcmeError, Challenge};
use crate::error::CertError;

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Upper bound on serving a single connection
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The single path/body pair a responder serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeResponse {
    path: String,
    body: String,
}

impl ChallengeResponse {
    pub fn new(token: &str, key_authorization: impl Into<String>) -> Self {
        Self {
            path: format!("{}{}", ACME_CHALLENGE_PREFIX, token),
            body: key_authorization.into(),
        }
    }

    /// Response answering `challenge` with its key authorization
    pub fn http01(challenge: &Challenge) -> Self {
        Self::new(&challenge.token, challenge.key_authorization.clone())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn body(&self) -> &str {
        &self.body
    }
}

/// Handle for a running responder
///
/// Dropping the handle aborts the listener task. Call
/// [`shutdown`](Self::shutdown) to wait until the port is released.
pub struct ResponderHandle {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl ResponderHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, drop in-flight connections and wait for the listener
    /// to close
    pub async fn shutdown(mut self) {
        debug!(addr = %self.local_addr, "Shutting down challenge responder");
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ResponderHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            handle.abort();
        }
    }
}

/// Binds the validation address for the duration of one authorization
/// attempt
#[derive(Debug, Clone)]
pub struct ChallengeResponder {
    /// Validation address, normally port 80 on all interfaces
    bind_addr: SocketAddr,
    /// Longest wait for the CA's verdict once the listener is up
    timeout: Duration,
}

impl ChallengeResponder {
    /// Create a responder; nothing is bound until a challenge is served
    ///
    /// # Arguments
    ///
    /// * `bind_addr` - Address to listen on while a challenge is in flight
    /// * `timeout` - Bound on the wait for the CA's verdict, after which the
    ///   attempt fails and the listener is torn down
    pub fn new(bind_addr: SocketAddr, timeout: Duration) -> Self {
        Self { bind_addr, timeout }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Bind the validation address and start serving `response`
    pub async fn start(&self, response: ChallengeResponse) -> Result<ResponderHandle, CertError> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|source| CertError::Bind {
                addr: self.bind_addr,
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| CertError::Bind {
                addr: self.bind_addr,
                source,
            })?;

        info!(addr = %local_addr, path = %response.path(), "HTTP-01 challenge responder listening");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join_handle = tokio::spawn(accept_loop(listener, Arc::new(response), shutdown_rx));

        Ok(ResponderHandle {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            join_handle: Some(join_handle),
        })
    }

    /// Serve `response` until `verdict` resolves or the timeout elapses
    ///
    /// `verdict` is the notification to the CA. The listener is shut down
    /// and its port released before this returns, whatever the outcome.
    pub async fn serve_challenge<F>(
        &self,
        domain: &str,
        response: ChallengeResponse,
        verdict: F,
    ) -> Result<(), CertError>
    where
        F: Future<Output = Result<(), AcmeError>>,
    {
        let handle = self.start(response).await?;

        let outcome = tokio::time::timeout(self.timeout, verdict).await;
        handle.shutdown().await;

        match outcome {
            Ok(Ok(())) => {
                info!(domain = %domain, "HTTP-01 challenge validated");
                Ok(())
            }
            Ok(Err(e)) => Err(CertError::ChallengeFailed {
                domain: domain.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(CertError::ChallengeFailed {
                domain: domain.to_string(),
                reason: format!("no verdict from the CA within {:?}", self.timeout),
            }),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    response: Arc<ChallengeResponse>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    // Connection tasks are aborted when the set is dropped
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    let response = Arc::clone(&response);
                    connections.spawn(serve_connection(stream, remote_addr, response));
                }
                Err(e) => warn!(error = %e, "Error accepting connection"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = &mut shutdown_rx => break,
        }
    }

    trace!("Challenge responder stopped");
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    remote_addr: SocketAddr,
    response: Arc<ChallengeResponse>,
) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let reply = handle_request(&req, &response, remote_addr);
        async move { Ok::<_, Infallible>(reply) }
    });

    let served = tokio::time::timeout(
        REQUEST_TIMEOUT,
        http1::Builder::new()
            .keep_alive(false)
            .serve_connection(io, service),
    )
    .await;

    match served {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(remote = %remote_addr, error = %e, "Error serving connection"),
        Err(_) => debug!(remote = %remote_addr, "Connection timed out"),
    }
}

fn handle_request<B>(
    req: &Request<B>,
    expected: &ChallengeResponse,
    remote_addr: SocketAddr,
) -> Response<Full<Bytes>> {
    let path = req.uri().path();

    if path != expected.path() {
        debug!(path = %path, remote = %remote_addr, "Unknown path, returning 404");
        return text_response(StatusCode::NOT_FOUND, "Not found");
    }

    if req.method() != Method::GET && req.method() != Method::HEAD {
        let mut reply = text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
        reply
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
        return reply;
    }

    info!(remote = %remote_addr, "Serving ACME challenge response");
    text_response(StatusCode::OK, expected.body().to_string())
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut reply = Response::new(Full::new(body.into()));
    *reply.status_mut() = status;
    reply
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    reply
}
