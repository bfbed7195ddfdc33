// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use forward_client::{ClientWorker, SessionConfig, TcpConnector, WorkerConfig};
use hybrid_buffer::{default_chunk_matcher, BufferConfig, ChunkBufferer};

mod intake;

use intake::{ChunkCutter, LineIntake};

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5140";
const DEFAULT_MAX_CHUNK_BYTES: usize = 1024 * 1024;
const DEFAULT_CHUNK_FLUSH_SECS: u64 = 5;
const DEFAULT_RETRY_SECS: u64 = 2;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);
const RECORD_QUEUE_CAPACITY: usize = 1024;

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str) -> bool {
    env::var(name)
        .map(|v| v.to_lowercase() == "true")
        .unwrap_or(false)
}

#[tokio::main]
pub async fn main() {
    let log_level = env::var("LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(log_level).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let Ok(upstream_addr) = env::var("RELAY_UPSTREAM_ADDR") else {
        error!("RELAY_UPSTREAM_ADDR not set, nowhere to forward to. Shutting down.");
        return;
    };
    let listen_addr =
        env::var("RELAY_LISTEN_ADDR").unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string());
    let buffer_root: Option<PathBuf> = env::var("RELAY_BUFFER_DIR").ok().map(PathBuf::from);
    if buffer_root.is_none() {
        warn!("RELAY_BUFFER_DIR not set, chunks will not survive restarts");
    }

    info!(upstream = %upstream_addr, "starting log relay");

    let mut buffer_config = BufferConfig::new(format!("forward:{upstream_addr}"));
    buffer_config.root_dir = buffer_root;
    buffer_config.max_queued_chunks = env_u64("RELAY_MAX_QUEUED_CHUNKS", 64) as usize;
    buffer_config.max_loaded_chunks = env_u64("RELAY_MAX_LOADED_CHUNKS", 16) as usize;
    buffer_config.quota_bytes = env_u64("RELAY_QUOTA_BYTES", 1024 * 1024 * 1024);
    buffer_config.send_all_at_end = env_bool("RELAY_SEND_ALL_AT_END");
    let buffer = Arc::new(ChunkBufferer::start(buffer_config, default_chunk_matcher()));

    let client_shutdown = CancellationToken::new();
    let worker = ClientWorker::new(
        Arc::new(TcpConnector::new(upstream_addr, CONNECT_TIMEOUT)),
        WorkerConfig {
            retry_interval: Duration::from_secs(env_u64(
                "RELAY_RETRY_INTERVAL_SECS",
                DEFAULT_RETRY_SECS,
            )),
            session: SessionConfig::default(),
        },
        client_shutdown.clone(),
    );
    let worker_handle = tokio::spawn(worker.run(buffer.register_new_consumer()));

    let (records_tx, records_rx) = mpsc::channel(RECORD_QUEUE_CAPACITY);
    let cutter = ChunkCutter::new(
        records_rx,
        Arc::clone(&buffer),
        env_u64("RELAY_MAX_CHUNK_BYTES", DEFAULT_MAX_CHUNK_BYTES as u64) as usize,
        Duration::from_secs(env_u64(
            "RELAY_CHUNK_FLUSH_INTERVAL_SECS",
            DEFAULT_CHUNK_FLUSH_SECS,
        )),
        ACCEPT_TIMEOUT,
    );
    let cutter_handle = tokio::spawn(cutter.run());

    let intake_cancel = CancellationToken::new();
    let intake = match LineIntake::bind(&listen_addr, records_tx, intake_cancel.clone()).await {
        Ok(intake) => intake,
        Err(e) => {
            error!(addr = %listen_addr, error = %e, "cannot bind intake listener");
            return;
        }
    };
    let intake_handle = tokio::spawn(intake.run());

    wait_for_shutdown_signal().await;
    info!("shutting down");

    // Stop taking records, let the cutter flush what it holds, then tear
    // the buffer down (which also winds the client worker up through the
    // consumer contract) before cutting the worker's own token.
    intake_cancel.cancel();
    let _ = intake_handle.await;
    let _ = cutter_handle.await;
    buffer.destroy().await;
    client_shutdown.cancel();
    let _ = worker_handle.await;

    info!("log relay stopped");
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
