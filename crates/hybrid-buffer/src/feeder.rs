// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The background relay between a buffer's input and output queues.
//!
//! ```text
//!   accept / recovery          OutputFeeder              consumers
//!        │                         │                         │
//!        v                         v                         v
//!   [input queue] ──recv──> load-if-on-disk ──send──> [output queue]
//!    (durability               (drop on               (memory ceiling,
//!     ceiling)                  read failure)          shared receiver)
//! ```
//!
//! One feeder task serves one buffer. It pulls the next chunk off the
//! input queue, loads its payload from disk when it was spilled, and
//! publishes it to the bounded output queue, blocking there until space
//! frees up or the abort signal fires. When the input queue closes or the
//! buffer aborts, the feeder persists every chunk still sitting in either
//! queue, closes the output queue, and waits for all registered consumers
//! to report completion before declaring itself stopped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::chunk::Chunk;
use crate::manager::ChunkManager;
use crate::store::ChunkStore;

/// Upper bound on waiting for consumer completion handles at shutdown.
/// Hitting it means a consumer never called `finished`, which is a
/// contract violation, not an expected race.
const CONSUMER_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// The output-queue end handed to consumers. Successive consumers (the
/// live forwarder, then a recovery forwarder) share one underlying
/// receiver; the depth counter feeds the façade's spill heuristic.
#[derive(Clone)]
pub(crate) struct SharedChunkReceiver {
    rx: Arc<Mutex<mpsc::Receiver<Chunk>>>,
    depth: Arc<AtomicUsize>,
}

impl SharedChunkReceiver {
    pub(crate) fn new(rx: mpsc::Receiver<Chunk>, depth: Arc<AtomicUsize>) -> Self {
        SharedChunkReceiver {
            rx: Arc::new(Mutex::new(rx)),
            depth,
        }
    }

    /// Next chunk off the output queue; `None` once the queue is closed
    /// and drained.
    pub(crate) async fn recv(&self) -> Option<Chunk> {
        let mut rx = self.rx.lock().await;
        let chunk = rx.recv().await;
        if chunk.is_some() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
        }
        chunk
    }

    /// Drains whatever is currently buffered without blocking on new
    /// items. Only called by the feeder after it closed the sender side.
    async fn drain(&self) -> Vec<Chunk> {
        let mut rx = self.rx.lock().await;
        let mut drained = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            drained.push(chunk);
        }
        drained
    }
}

/// Completion handles for every consumer registered against one buffer.
/// Each registration hands the consumer a one-shot sender; the feeder
/// finalizes only after every handle has fired (or the wait times out).
#[derive(Clone, Default)]
pub(crate) struct ConsumerRegistry {
    handles: Arc<StdMutex<Vec<oneshot::Receiver<()>>>>,
}

impl ConsumerRegistry {
    pub(crate) fn register(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.handles
            .lock()
            .expect("consumer registry lock poisoned")
            .push(rx);
        tx
    }

    /// Waits for every registered consumer to finish. Returns false when
    /// the deadline passes first.
    async fn wait_all(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        let handles: Vec<_> = self
            .handles
            .lock()
            .expect("consumer registry lock poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, handle).await {
                // A dropped sender still means the consumer is gone.
                Ok(_) => {}
                Err(_) => return false,
            }
        }
        true
    }
}

pub(crate) struct OutputFeeder {
    input_rx: mpsc::Receiver<Chunk>,
    output_tx: mpsc::Sender<Chunk>,
    output: SharedChunkReceiver,
    output_depth: Arc<AtomicUsize>,
    abort: CancellationToken,
    consumers: ConsumerRegistry,
    store: Arc<ChunkStore>,
    manager: Arc<ChunkManager>,
}

impl OutputFeeder {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        input_rx: mpsc::Receiver<Chunk>,
        output_tx: mpsc::Sender<Chunk>,
        output: SharedChunkReceiver,
        output_depth: Arc<AtomicUsize>,
        abort: CancellationToken,
        consumers: ConsumerRegistry,
        store: Arc<ChunkStore>,
        manager: Arc<ChunkManager>,
    ) -> Self {
        OutputFeeder {
            input_rx,
            output_tx,
            output,
            output_depth,
            abort,
            consumers,
            store,
            manager,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("output feeder started");
        // A chunk pulled off the input queue but not yet published when the
        // loop ended; it must reach save_everything.
        let mut parked: Option<Chunk> = None;

        loop {
            let mut chunk = tokio::select! {
                _ = self.abort.cancelled() => break,
                received = self.input_rx.recv() => match received {
                    Some(chunk) => chunk,
                    None => break,
                },
            };

            if !chunk.is_loaded() && !self.store.load(&mut chunk) {
                warn!(chunk = %chunk.id(), "dropping chunk that cannot be read back");
                self.store.remove(&chunk);
                self.store.on_dropped(&chunk);
                self.manager.on_dropped();
                continue;
            }

            tokio::select! {
                _ = self.abort.cancelled() => {
                    parked = Some(chunk);
                    break;
                }
                permit = self.output_tx.reserve() => match permit {
                    Ok(permit) => {
                        self.output_depth.fetch_add(1, Ordering::AcqRel);
                        permit.send(chunk);
                    }
                    Err(_) => {
                        parked = Some(chunk);
                        break;
                    }
                },
            }
        }

        self.finalize(parked).await;
    }

    async fn finalize(self, parked: Option<Chunk>) {
        let OutputFeeder {
            mut input_rx,
            output_tx,
            output,
            consumers,
            store,
            manager,
            ..
        } = self;

        // Close the output queue first: a consumer blocked on recv releases
        // the shared receiver lock once it observes the closure, which is
        // what lets the drain below make progress.
        drop(output_tx);

        let mut stranded: Vec<Chunk> = parked.into_iter().collect();
        stranded.extend(output.drain().await);
        while let Ok(chunk) = input_rx.try_recv() {
            stranded.push(chunk);
        }
        save_everything(&store, &manager, stranded);

        if !consumers.wait_all(CONSUMER_WAIT_TIMEOUT).await {
            error!("timed out waiting for chunk consumers to finish; this is a bug");
        }
        debug!("output feeder stopped");
    }
}

/// Persists every chunk left behind at shutdown so nothing admitted is
/// lost. A chunk that cannot be persisted is dropped with its counter.
fn save_everything(store: &ChunkStore, manager: &ChunkManager, chunks: Vec<Chunk>) {
    let mut saved = 0usize;
    for mut chunk in chunks {
        if store.unload(&mut chunk) {
            saved += 1;
        } else {
            warn!(chunk = %chunk.id(), "failed to persist chunk at shutdown, dropping");
            store.on_dropped(&chunk);
            manager.on_dropped();
        }
    }
    if saved > 0 {
        debug!(count = saved, "persisted leftover queue contents");
    }
}
