//! Reverse tunnel to the collection broker
//!
//! The agent dials the broker over TLS, introduces itself, and then
//! answers HTTP-like requests the broker multiplexes over 15-bit
//! channels. The connection is outbound-initiated, so the broker can
//! reach agents behind NAT without the agent listening anywhere.

mod backoff;
mod conn;

pub use backoff::ExponentialBackoff;

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use pm_core::config::TunnelConfig;
use pm_protocol::ProtocolError;

use crate::check::{Check, CheckError, ReverseConfig};

/// Reverse tunnel errors
#[derive(Error, Debug)]
pub enum ReverseError {
    /// Orderly shutdown; callers treat this as success
    #[error("Shutdown requested")]
    Shutdown,

    /// The check manager could not supply a reverse configuration
    #[error("reverse configuration (check): {0}")]
    Config(#[from] CheckError),

    /// Dial failure (TCP, TLS handshake, or timeout)
    #[error("establishing reverse connection: {0}")]
    Connect(#[source] io::Error),

    /// Read/write failure on an established connection
    #[error("reverse connection transport: {0}")]
    Transport(#[from] io::Error),

    /// Broker closed the connection
    #[error("connection closed by broker")]
    UnexpectedEof,

    /// Frame-level violation
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Broker asked for a reconnect
    #[error("broker requested connection reset")]
    BrokerReset,

    /// Broker explicitly rejected the introduction
    #[error("introduction rejected by broker: {0}")]
    IntroductionRejected(String),
}

/// How one connection ended, driving the connect loop
pub(crate) enum Outcome {
    /// Cancellation observed; propagate the shutdown sentinel
    Shutdown,
    /// Close, back off, reconnect
    Recoverable(ReverseError),
    /// Surface from `start`
    Fatal(ReverseError),
}

/// Where the tunnel gets its dial configuration
///
/// `Check` is the production implementation; tests drive the tunnel with
/// a stub.
#[async_trait]
pub trait ReverseConfigSource: Send + Sync {
    /// Current reverse configuration
    async fn reverse_config(&self) -> Result<ReverseConfig, CheckError>;

    /// Re-resolve the configuration (broker failover)
    async fn refresh_check_config(&self) -> Result<(), CheckError>;
}

#[async_trait]
impl ReverseConfigSource for Check {
    async fn reverse_config(&self) -> Result<ReverseConfig, CheckError> {
        Check::reverse_config(self).await
    }

    async fn refresh_check_config(&self) -> Result<(), CheckError> {
        Check::refresh_check_config(self).await
    }
}

/// Reverse tunnel connection manager
pub struct Reverse {
    enabled: bool,
    opts: TunnelConfig,
    check: Arc<dyn ReverseConfigSource>,
    router: Router,
    cancel: CancellationToken,
}

impl Reverse {
    /// Create an idle tunnel
    ///
    /// `router` is the local HTTP surface broker requests are dispatched
    /// into; `cancel` is observed at every blocking point.
    pub fn new(
        opts: &TunnelConfig,
        check: Arc<dyn ReverseConfigSource>,
        router: Router,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            enabled: opts.enabled,
            opts: opts.clone(),
            check,
            router,
            cancel,
        }
    }

    /// Request orderly shutdown
    ///
    /// Idempotent, and safe to call before `start` or with no live
    /// connection.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Run the tunnel until shutdown or an unrecoverable error
    ///
    /// Returns immediately with success when the tunnel is disabled.
    /// `ReverseError::Shutdown` is the orderly-shutdown sentinel.
    pub async fn start(&self) -> Result<(), ReverseError> {
        if !self.enabled {
            tracing::info!("reverse connection disabled");
            return Ok(());
        }

        let mut rev_config = self.check.reverse_config().await?;
        let mut backoff = ExponentialBackoff::from_config(&self.opts.backoff);
        let mut attempt: u32 = 0;
        let mut refreshed = false;

        loop {
            if self.cancel.is_cancelled() {
                return Err(ReverseError::Shutdown);
            }

            tracing::debug!("connecting to broker at {}", rev_config.dial_addr);

            let failure = match self.connect(&rev_config).await {
                Ok(stream) => {
                    tracing::info!("connected to broker at {}", rev_config.dial_addr);
                    attempt = 0;
                    refreshed = false;
                    backoff.reset();

                    let outcome = conn::run(
                        stream,
                        rev_config.introduction(),
                        self.router.clone(),
                        self.cancel.clone(),
                        self.opts.max_frame_payload,
                    )
                    .await;

                    match outcome {
                        Outcome::Shutdown => return Err(ReverseError::Shutdown),
                        Outcome::Fatal(e) => return Err(e),
                        Outcome::Recoverable(e) => e,
                    }
                }
                Err(ReverseError::Shutdown) => return Err(ReverseError::Shutdown),
                Err(e) => e,
            };

            attempt += 1;
            tracing::warn!(
                "reverse connection failed (attempt {}): {}",
                attempt,
                failure
            );

            if attempt >= self.opts.max_conn_retry {
                if refreshed {
                    return Err(failure);
                }
                // the bundle may have moved to a failover broker
                tracing::info!(
                    "{} consecutive failures, refreshing check configuration",
                    attempt
                );
                self.check.refresh_check_config().await?;
                rev_config = self.check.reverse_config().await?;
                attempt = 0;
                refreshed = true;
            }

            let delay = backoff.next_delay();
            tracing::debug!("retrying in {:?}", delay);
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ReverseError::Shutdown),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One TLS dial attempt, bounded by the dial timeout
    async fn connect(&self, rev_config: &ReverseConfig) -> Result<TlsStream<TcpStream>, ReverseError> {
        let connector = TlsConnector::from(rev_config.tls.clone());
        let server_name = rev_config.server_name.clone();
        let addr = rev_config.dial_addr.clone();

        let dial = async move {
            let tcp = TcpStream::connect(&addr).await?;
            tcp.set_nodelay(true)?;
            connector.connect(server_name, tcp).await
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(ReverseError::Shutdown),
            result = tokio::time::timeout(self.opts.dialer_timeout, dial) => match result {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(e)) => Err(ReverseError::Connect(e)),
                Err(_) => Err(ReverseError::Connect(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("dial timed out after {:?}", self.opts.dialer_timeout),
                ))),
            }
        }
    }
}
