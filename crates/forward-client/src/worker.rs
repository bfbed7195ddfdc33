// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Connection lifecycle across repeated sessions.
//!
//! The worker owns the reconnect loop: open a connection (in a background
//! task, so a shutdown request can abandon a hanging connect), run one
//! session to completion, then act on the session's policy: stop, retry
//! immediately, or sleep out the retry interval first. The leftover queue
//! rides along from session to session; whatever remains when the worker
//! finally stops is handed back to the buffer through the leftover
//! callback so it is persisted for the next process start.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hybrid_buffer::ChunkConsumerArgs;

use crate::connection::Connector;
use crate::session::{run_session, ReconnectPolicy, SessionConfig};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Fixed delay before reconnecting after a connection failure.
    pub retry_interval: Duration,
    pub session: SessionConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            retry_interval: Duration::from_secs(2),
            session: SessionConfig::default(),
        }
    }
}

/// Drives one buffer's consumer end against one upstream.
pub struct ClientWorker {
    connector: Arc<dyn Connector>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl ClientWorker {
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        config: WorkerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        ClientWorker {
            connector,
            config,
            shutdown,
        }
    }

    /// Runs until the buffer closes its output queue or shutdown fires.
    /// Consumes the args: the worker is the consumer, and it reports
    /// `finished` on the way out.
    pub async fn run(self, args: ChunkConsumerArgs) {
        info!("client worker started");
        let mut leftovers = VecDeque::new();
        // The buffer closing its input side stops this loop just like a
        // process shutdown does; only the leftover handling differs.
        let input_closed = args.input_closed();

        loop {
            if self.shutdown.is_cancelled() || input_closed.is_cancelled() {
                break;
            }

            // Connect in a background task so shutdown can abandon the
            // attempt instead of waiting out the dial timeout.
            let connector = Arc::clone(&self.connector);
            let mut connecting = tokio::spawn(async move { connector.connect().await });
            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    connecting.abort();
                    break;
                }
                _ = input_closed.cancelled() => {
                    connecting.abort();
                    break;
                }
                joined = &mut connecting => joined,
            };

            let conn = match connected {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    warn!(error = %e, "failed to connect to upstream");
                    if !self.sleep_before_retry(&input_closed).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "connect task failed");
                    if !self.sleep_before_retry(&input_closed).await {
                        break;
                    }
                    continue;
                }
            };

            let outcome = run_session(
                conn,
                &args,
                std::mem::take(&mut leftovers),
                &self.shutdown,
                &self.config.session,
            )
            .await;
            leftovers = outcome.leftovers;

            match outcome.policy {
                ReconnectPolicy::NoReconnect => break,
                ReconnectPolicy::Reconnect => {}
                ReconnectPolicy::ReconnectWithDelay => {
                    if !self.sleep_before_retry(&input_closed).await {
                        break;
                    }
                }
            }
        }

        if !leftovers.is_empty() {
            info!(count = leftovers.len(), "persisting undelivered chunks");
        }
        for chunk in leftovers {
            args.on_leftover(chunk);
        }
        args.finished();
        debug!("client worker stopped");
    }

    /// Interruptible retry delay; false means a stop signal fired.
    async fn sleep_before_retry(&self, input_closed: &CancellationToken) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = input_closed.cancelled() => false,
            _ = tokio::time::sleep(self.config.retry_interval) => true,
        }
    }
}
