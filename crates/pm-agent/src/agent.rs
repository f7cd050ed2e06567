//! Agent supervisor
//!
//! Wires the components together, runs them until the first fatal error
//! or a shutdown signal, and tears everything down through one
//! cancellation token.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pm_core::Config;

use crate::check::Check;
use crate::reverse::{Reverse, ReverseError};
use crate::server::{self, AppState};
use crate::store::MetricStore;

/// The pulsemon agent process
pub struct Agent {
    config: Config,
}

impl Agent {
    /// Create an agent from configuration
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until shutdown or the first fatal component error
    pub async fn run(self) -> Result<()> {
        let cancel = CancellationToken::new();
        spawn_signal_handler(cancel.clone());

        let store = Arc::new(MetricStore::new());
        let check = Arc::new(
            Check::new(&self.config, None)
                .await
                .context("reverse configuration (check)")?,
        );

        let router = server::router(AppState {
            store,
            check: Arc::clone(&check),
        });

        let reverse = Arc::new(Reverse::new(
            &self.config.reverse,
            check,
            router.clone(),
            cancel.child_token(),
        ));

        let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(2);

        {
            let err_tx = err_tx.clone();
            let listen = self.config.server.listen.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = server::serve(&listen, router, cancel).await {
                    let _ = err_tx.send(e.context("Starting server")).await;
                }
            });
        }

        {
            let err_tx = err_tx.clone();
            let reverse = Arc::clone(&reverse);
            tokio::spawn(async move {
                match reverse.start().await {
                    // the shutdown sentinel is an orderly exit
                    Ok(()) | Err(ReverseError::Shutdown) => {}
                    Err(e) => {
                        let _ = err_tx
                            .send(
                                anyhow::Error::new(e)
                                    .context("Unable to start reverse connection"),
                            )
                            .await;
                    }
                }
            });
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            error = err_rx.recv() => match error {
                Some(e) => Err(e),
                None => Ok(()),
            },
        };

        // first fatal error or signal: stop everything
        reverse.stop();
        cancel.cancel();

        result
    }
}

/// Cancel the root token on SIGINT or SIGTERM
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!("failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received Ctrl+C, initiating shutdown");
            }
            _ = terminate => {
                tracing::info!("received SIGTERM, initiating shutdown");
            }
        }

        cancel.cancel();
    });
}
