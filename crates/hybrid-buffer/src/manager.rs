// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Chunk lifecycle accounting.
//!
//! Every chunk admitted into a buffer is "pending" from admission until it
//! reaches exactly one terminal outcome: consumed (acknowledged upstream),
//! leftover (persisted for a later attempt), or dropped (capacity/quota
//! loss, always counted). The single pending gauge plus the outcome
//! counters are what make loss observable: a chunk may be discarded by
//! design, but never without a counter change.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::debug;

/// How often `wait_pending_chunks` re-reads the gauge.
const PENDING_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Counter snapshot for one buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferMetrics {
    /// Chunks currently queued anywhere between admission and a terminal
    /// outcome.
    pub pending: i64,
    /// Chunks admitted with their payload in memory.
    pub input_transient: u64,
    /// Chunks admitted already persisted (spilled at admission or
    /// recovered from disk).
    pub input_persistent: u64,
    pub consumed: u64,
    pub leftover: u64,
    pub dropped: u64,
}

/// Tracks chunk state transitions and owns the flush-at-shutdown policy.
#[derive(Debug)]
pub struct ChunkManager {
    pending: AtomicI64,
    input_transient: AtomicU64,
    input_persistent: AtomicU64,
    consumed: AtomicU64,
    leftover: AtomicU64,
    dropped: AtomicU64,
    send_all_at_end: bool,
}

impl ChunkManager {
    /// `send_all_at_end` is forced on when the store has no usable
    /// directory: with nowhere to persist leftovers, delivering everything
    /// before shutdown is the only option left.
    #[must_use]
    pub fn new(send_all_at_end: bool, store_has_dir: bool) -> Self {
        ChunkManager {
            pending: AtomicI64::new(0),
            input_transient: AtomicU64::new(0),
            input_persistent: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            leftover: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            send_all_at_end: send_all_at_end || !store_has_dir,
        }
    }

    #[must_use]
    pub fn send_all_at_end(&self) -> bool {
        self.send_all_at_end
    }

    /// A chunk was admitted through `accept`.
    pub fn on_input(&self, persisted: bool) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if persisted {
            self.input_persistent.fetch_add(1, Ordering::AcqRel);
        } else {
            self.input_transient.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// A chunk was re-admitted from disk during crash recovery.
    pub fn on_recovered(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.input_persistent.fetch_add(1, Ordering::AcqRel);
    }

    pub fn on_consumed(&self) {
        self.consumed.fetch_add(1, Ordering::AcqRel);
        self.release_pending();
    }

    pub fn on_leftover(&self) {
        self.leftover.fetch_add(1, Ordering::AcqRel);
        self.release_pending();
    }

    pub fn on_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::AcqRel);
        self.release_pending();
    }

    fn release_pending(&self) {
        let prev = self.pending.fetch_sub(1, Ordering::AcqRel);
        // A negative gauge means some chunk reached two terminal outcomes;
        // that is a broken pipeline contract, not an external failure.
        assert!(prev > 0, "chunk released more times than it was acquired");
    }

    #[must_use]
    pub fn pending_chunks(&self) -> i64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Blocks until the pending gauge reaches zero, or `timeout` elapses.
    /// Returns whether the gauge drained. Only meaningful under
    /// `send_all_at_end`, where shutdown must deliver rather than persist.
    pub async fn wait_pending_chunks(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let pending = self.pending_chunks();
            if pending == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                debug!(pending, "gave up waiting for pending chunks");
                return false;
            }
            sleep(PENDING_POLL_INTERVAL).await;
        }
    }

    #[must_use]
    pub fn metrics(&self) -> BufferMetrics {
        BufferMetrics {
            pending: self.pending.load(Ordering::Acquire),
            input_transient: self.input_transient.load(Ordering::Acquire),
            input_persistent: self.input_persistent.load(Ordering::Acquire),
            consumed: self.consumed.load(Ordering::Acquire),
            leftover: self.leftover.load(Ordering::Acquire),
            dropped: self.dropped.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_each_outcome() {
        let manager = ChunkManager::new(false, true);
        manager.on_input(false);
        manager.on_input(true);
        manager.on_recovered();
        assert_eq!(manager.pending_chunks(), 3);

        manager.on_consumed();
        manager.on_leftover();
        manager.on_dropped();

        let m = manager.metrics();
        assert_eq!(m.pending, 0);
        assert_eq!(m.input_transient, 1);
        assert_eq!(m.input_persistent, 2);
        assert_eq!(m.consumed, 1);
        assert_eq!(m.leftover, 1);
        assert_eq!(m.dropped, 1);
    }

    #[test]
    fn missing_directory_forces_send_all_at_end() {
        assert!(!ChunkManager::new(false, true).send_all_at_end());
        assert!(ChunkManager::new(true, true).send_all_at_end());
        assert!(ChunkManager::new(false, false).send_all_at_end());
    }

    #[test]
    #[should_panic(expected = "released more times")]
    fn over_release_panics() {
        let manager = ChunkManager::new(false, true);
        manager.on_input(false);
        manager.on_consumed();
        manager.on_consumed();
    }

    #[tokio::test]
    async fn wait_pending_returns_once_drained() {
        let manager = std::sync::Arc::new(ChunkManager::new(true, true));
        manager.on_input(false);

        let waiter = std::sync::Arc::clone(&manager);
        let wait = tokio::spawn(async move {
            waiter.wait_pending_chunks(Duration::from_secs(5)).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.on_consumed();
        assert!(wait.await.expect("wait task"));
    }

    #[tokio::test]
    async fn wait_pending_times_out() {
        let manager = ChunkManager::new(true, true);
        manager.on_input(false);
        assert!(
            !manager
                .wait_pending_chunks(Duration::from_millis(120))
                .await
        );
    }
}
