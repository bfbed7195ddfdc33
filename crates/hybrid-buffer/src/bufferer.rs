// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The public buffer façade.
//!
//! A `ChunkBufferer` sits between the processing pipeline and the network
//! client. It accepts completed chunks, decides memory-vs-disk placement
//! under load, recovers unsent chunks from a previous process at startup,
//! and hands consumers a read end of the output queue plus the callbacks
//! that complete each chunk's lifecycle.
//!
//! # Backpressure
//!
//! When the output queue is at or above half its capacity, `accept` spills
//! the chunk to disk *before* admission so the memory ceiling is respected
//! even while the consumer stalls. The depth is tracked with an explicit
//! counter maintained by the feeder and the shared receiver.
//!
//! # Shutdown
//!
//! `destroy` closes the input queue, waits for a full flush when
//! `send_all_at_end` is set, then fires the abort signal and joins the
//! feeder, which persists everything still queued. A join timeout is
//! logged as a bug: every blocking point in the pipeline selects on a
//! shutdown signal, so a hang means a signal-handling gap.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chunk::{Chunk, ChunkIdMatcher};
use crate::feeder::{ConsumerRegistry, OutputFeeder, SharedChunkReceiver};
use crate::manager::{BufferMetrics, ChunkManager};
use crate::store::ChunkStore;

/// Chunk-completion callback; fired once per chunk by a consumer.
pub type ChunkCallback = Arc<dyn Fn(Chunk) + Send + Sync>;

/// Configuration for one buffer.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Root under which every buffer's queue directory lives. `None` runs
    /// the buffer memory-only (degraded mode).
    pub root_dir: Option<PathBuf>,
    /// Identifier of this buffer; sanitized+hashed into the directory name.
    pub buffer_id: String,
    /// Input-queue capacity: the most chunks the buffer will track at
    /// once, loaded or not. This is the durability ceiling.
    pub max_queued_chunks: usize,
    /// Output-queue capacity: the most chunks allowed fully loaded in
    /// memory. Half of this is the disk-spill trigger.
    pub max_loaded_chunks: usize,
    /// Maximum total bytes persisted in the queue directory.
    pub quota_bytes: u64,
    /// Require a full flush-and-wait at shutdown instead of
    /// snapshot-and-persist. Forced on when the queue directory is
    /// unusable.
    pub send_all_at_end: bool,
    /// How long `destroy` waits for the feeder in snapshot mode.
    pub shutdown_timeout: Duration,
    /// How long `destroy` waits for a full flush in send-all mode; longer,
    /// because this mode must actually deliver, not merely persist.
    pub flush_timeout: Duration,
}

impl BufferConfig {
    #[must_use]
    pub fn new(buffer_id: impl Into<String>) -> Self {
        BufferConfig {
            root_dir: None,
            buffer_id: buffer_id.into(),
            max_queued_chunks: 64,
            max_loaded_chunks: 16,
            quota_bytes: 1024 * 1024 * 1024,
            send_all_at_end: false,
            shutdown_timeout: Duration::from_secs(10),
            flush_timeout: Duration::from_secs(60),
        }
    }
}

/// Everything a consumer needs to drain one buffer.
///
/// The contract: for every chunk read, call exactly one of
/// [`on_consumed`] or [`on_leftover`]; call [`finished`] exactly once when
/// the consuming loop exits. `finished` consumes the value, so calling it
/// twice is a compile error rather than a runtime one.
///
/// [`on_consumed`]: ChunkConsumerArgs::on_consumed
/// [`on_leftover`]: ChunkConsumerArgs::on_leftover
/// [`finished`]: ChunkConsumerArgs::finished
pub struct ChunkConsumerArgs {
    output: SharedChunkReceiver,
    input_closed: CancellationToken,
    consumed: ChunkCallback,
    leftover: ChunkCallback,
    done: oneshot::Sender<()>,
}

impl ChunkConsumerArgs {
    /// Next chunk off the output queue; `None` once the buffer closed it.
    pub async fn next_chunk(&self) -> Option<Chunk> {
        self.output.recv().await
    }

    /// Signal that fires when the buffer's input side has closed and the
    /// consumer should wind down.
    #[must_use]
    pub fn input_closed(&self) -> CancellationToken {
        self.input_closed.clone()
    }

    /// The chunk was acknowledged upstream: delete it and count it.
    pub fn on_consumed(&self, chunk: Chunk) {
        (self.consumed)(chunk);
    }

    /// The chunk was not delivered this attempt: persist it for the next.
    pub fn on_leftover(&self, chunk: Chunk) {
        (self.leftover)(chunk);
    }

    /// Cloneable handle to the consumed callback, for tasks that outlive
    /// a borrow of the args.
    #[must_use]
    pub fn consumed_callback(&self) -> ChunkCallback {
        Arc::clone(&self.consumed)
    }

    /// Reports this consumer's loop as finished. Consumes the args.
    pub fn finished(self) {
        let _ = self.done.send(());
    }
}

/// Hybrid memory/disk buffer for completed chunks.
pub struct ChunkBufferer {
    input_tx: StdMutex<Option<mpsc::Sender<Chunk>>>,
    output: SharedChunkReceiver,
    output_depth: Arc<AtomicUsize>,
    output_capacity: usize,
    store: Arc<ChunkStore>,
    manager: Arc<ChunkManager>,
    consumers: ConsumerRegistry,
    input_closed: CancellationToken,
    abort: CancellationToken,
    feeder: StdMutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
    flush_timeout: Duration,
}

impl ChunkBufferer {
    /// Creates the buffer, recovers any chunks left on disk by a previous
    /// process, and starts the feeder task. Must run inside a tokio
    /// runtime.
    #[must_use]
    pub fn start(config: BufferConfig, matcher: ChunkIdMatcher) -> Self {
        let store = Arc::new(match &config.root_dir {
            Some(root) => ChunkStore::open(root, &config.buffer_id, config.quota_bytes),
            None => ChunkStore::degraded(config.quota_bytes),
        });
        let manager = Arc::new(ChunkManager::new(config.send_all_at_end, store.has_dir()));

        let (input_tx, input_rx) = mpsc::channel(config.max_queued_chunks.max(1));
        let (output_tx, output_rx) = mpsc::channel(config.max_loaded_chunks.max(1));
        let output_depth = Arc::new(AtomicUsize::new(0));
        let output = SharedChunkReceiver::new(output_rx, Arc::clone(&output_depth));

        // Crash recovery: re-admit on-disk chunks oldest first, up to the
        // input queue's capacity. Durability is bounded by configuration,
        // not unbounded; anything past capacity stays on disk unadmitted.
        let existing = store.scan_existing(&matcher);
        let mut admitted = 0usize;
        let mut skipped = 0usize;
        for chunk in existing {
            if admitted >= config.max_queued_chunks {
                skipped += 1;
                continue;
            }
            store.on_recovered(&chunk);
            manager.on_recovered();
            // Cannot fail: we are the only producer and under capacity.
            if input_tx.try_send(chunk).is_err() {
                error!("input queue rejected a recovered chunk under capacity; this is a bug");
                break;
            }
            admitted += 1;
        }
        if admitted > 0 {
            info!(
                buffer = %config.buffer_id,
                count = admitted,
                "recovered chunks from a previous run"
            );
        }
        if skipped > 0 {
            warn!(
                buffer = %config.buffer_id,
                count = skipped,
                "on-disk chunks exceed queue capacity and were not re-admitted"
            );
        }

        let consumers = ConsumerRegistry::default();
        let abort = CancellationToken::new();
        let feeder = OutputFeeder::new(
            input_rx,
            output_tx,
            output.clone(),
            Arc::clone(&output_depth),
            abort.clone(),
            consumers.clone(),
            Arc::clone(&store),
            Arc::clone(&manager),
        );
        let feeder_handle = tokio::spawn(feeder.run());

        ChunkBufferer {
            input_tx: StdMutex::new(Some(input_tx)),
            output,
            output_depth,
            output_capacity: config.max_loaded_chunks.max(1),
            store,
            manager,
            consumers,
            input_closed: CancellationToken::new(),
            abort,
            feeder: StdMutex::new(Some(feeder_handle)),
            shutdown_timeout: config.shutdown_timeout,
            flush_timeout: config.flush_timeout,
        }
    }

    /// Offers a chunk to the buffer, blocking up to `timeout` when the
    /// input queue is full. Returns whether the chunk was admitted; a
    /// refused chunk is dropped and counted, never retried.
    pub async fn accept(&self, mut chunk: Chunk, timeout: Duration) -> bool {
        // Spill before admission once the output queue is half full, so
        // the memory ceiling holds while the consumer stalls. Failure to
        // spill (quota, degraded mode) keeps the chunk loaded.
        if self.output_depth.load(Ordering::Acquire) * 2 >= self.output_capacity {
            let _ = self.store.unload(&mut chunk);
        }

        self.manager.on_input(chunk.is_persisted());

        let sender = self
            .input_tx
            .lock()
            .expect("input sender lock poisoned")
            .clone();
        let Some(sender) = sender else {
            self.drop_refused(chunk, "buffer already destroyed");
            return false;
        };
        match sender.send_timeout(chunk, timeout).await {
            Ok(()) => true,
            Err(mpsc::error::SendTimeoutError::Timeout(chunk))
            | Err(mpsc::error::SendTimeoutError::Closed(chunk)) => {
                self.drop_refused(chunk, "input queue full");
                false
            }
        }
    }

    fn drop_refused(&self, chunk: Chunk, reason: &str) {
        warn!(chunk = %chunk.id(), reason, "dropping chunk");
        if chunk.is_persisted() {
            // Leaving the file behind would resurrect a dropped chunk at
            // the next start.
            self.store.remove(&chunk);
        }
        self.store.on_dropped(&chunk);
        self.manager.on_dropped();
    }

    /// Registers a consumer against the output queue. The feeder will not
    /// finalize until every registered consumer has called `finished`.
    #[must_use]
    pub fn register_new_consumer(&self) -> ChunkConsumerArgs {
        let done = self.consumers.register();

        let store = Arc::clone(&self.store);
        let manager = Arc::clone(&self.manager);
        let consumed: ChunkCallback = Arc::new(move |chunk: Chunk| {
            debug!(chunk = %chunk.id(), "chunk acknowledged");
            store.remove(&chunk);
            manager.on_consumed();
        });

        let store = Arc::clone(&self.store);
        let manager = Arc::clone(&self.manager);
        let leftover: ChunkCallback = Arc::new(move |mut chunk: Chunk| {
            if store.unload(&mut chunk) {
                debug!(chunk = %chunk.id(), "chunk kept for a later delivery attempt");
                manager.on_leftover();
            } else {
                warn!(chunk = %chunk.id(), "failed to persist undelivered chunk, dropping");
                store.on_dropped(&chunk);
                manager.on_dropped();
            }
        });

        ChunkConsumerArgs {
            output: self.output.clone(),
            input_closed: self.input_closed.clone(),
            consumed,
            leftover,
            done,
        }
    }

    /// Shuts the buffer down. Closes the input queue, waits for a full
    /// flush in send-all mode, then aborts and joins the feeder (which
    /// persists everything still queued).
    pub async fn destroy(&self) {
        info!("destroying chunk buffer");
        drop(
            self.input_tx
                .lock()
                .expect("input sender lock poisoned")
                .take(),
        );

        if self.manager.send_all_at_end() {
            if !self.manager.wait_pending_chunks(self.flush_timeout).await {
                warn!(
                    pending = self.manager.pending_chunks(),
                    "chunks still pending after flush wait"
                );
            }
        }

        self.input_closed.cancel();
        self.abort.cancel();

        let handle = self.feeder.lock().expect("feeder handle lock poisoned").take();
        if let Some(handle) = handle {
            let limit = if self.manager.send_all_at_end() {
                self.flush_timeout
            } else {
                self.shutdown_timeout
            };
            match tokio::time::timeout(limit, handle).await {
                Ok(Ok(())) => debug!("chunk buffer destroyed"),
                Ok(Err(e)) => error!(error = %e, "output feeder task failed"),
                Err(_) => error!("timed out waiting for the output feeder; this is a bug"),
            }
        }
    }

    #[must_use]
    pub fn metrics(&self) -> BufferMetrics {
        self.manager.metrics()
    }

    #[must_use]
    pub fn send_all_at_end(&self) -> bool {
        self.manager.send_all_at_end()
    }

    /// Pending gauge plus flush wait, exposed for orchestrators that flush
    /// before rotating buffers.
    pub async fn wait_pending_chunks(&self, timeout: Duration) -> bool {
        self.manager.wait_pending_chunks(timeout).await
    }

    #[cfg(test)]
    pub(crate) fn output_queue_depth(&self) -> usize {
        self.output_depth.load(Ordering::Acquire)
    }
}
