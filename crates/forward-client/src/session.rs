// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One connection's lifetime: pipelined sending, out-of-order
//! acknowledgements, and the reconciliation that makes delivery
//! at-least-once.
//!
//! A session runs two loops against one connection. The send loop first
//! replays leftovers from the previous session, then drains the buffer's
//! output queue, handing each sent chunk to the acknowledger through a
//! bounded pipeline queue; it never waits for a chunk's ack before
//! sending the next. The acknowledger tracks sent-but-unacknowledged
//! chunks in a pending-by-ID map and completes each one as its ack
//! arrives, in whatever order the collector produces them.
//!
//! When anything ends the session (send failure, ack failure or timeout,
//! planned rotation, shutdown), `collect_leftovers` gathers every chunk
//! that entered the session and was not positively acknowledged from its
//! five possible locations (unreplayed leftovers, the pending map, the
//! unread pipeline queue, the mid-send chunk) into one ordered,
//! deduplicated queue for the next attempt. Each direction's failure also
//! aborts the shared connection token so a loop stuck on the other half
//! of the socket unblocks immediately.

use std::collections::{BTreeMap, HashMap, VecDeque};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use hybrid_buffer::{Chunk, ChunkCallback, ChunkConsumerArgs, ChunkId};

use crate::connection::{ChunkSender, Connection};

/// Tuning for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long to wait for the next acknowledgement once chunks are in
    /// flight before declaring the connection dead.
    pub ack_timeout: Duration,
    /// Idle interval after which a keepalive ping probes for a silently
    /// dead peer.
    pub ping_interval: Duration,
    /// Floor of every per-chunk send deadline.
    pub send_timeout_base: Duration,
    /// Assumed worst acceptable throughput; the send deadline for a chunk
    /// is the floor plus `payload_len / min_throughput`.
    pub min_throughput_bytes_per_sec: u64,
    /// Capacity of the send→ack pipeline queue: the most unacknowledged
    /// chunks allowed in flight.
    pub max_inflight_chunks: usize,
    /// Rotate the connection after this long, for upstream load
    /// balancing. `None` keeps a healthy connection forever.
    pub max_session_duration: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            ack_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(15),
            send_timeout_base: Duration::from_secs(5),
            min_throughput_bytes_per_sec: 16 * 1024,
            max_inflight_chunks: 16,
            max_session_duration: None,
        }
    }
}

/// What the worker should do after a session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Caller-requested shutdown; stop for good.
    NoReconnect,
    /// Planned rotation; retry immediately.
    Reconnect,
    /// The connection failed; back off before retrying.
    ReconnectWithDelay,
}

pub(crate) struct SessionOutcome {
    pub(crate) policy: ReconnectPolicy,
    pub(crate) leftovers: VecDeque<Chunk>,
}

/// Runs one session to completion and reconciles its state.
pub(crate) async fn run_session(
    conn: Connection,
    args: &ChunkConsumerArgs,
    mut leftovers: VecDeque<Chunk>,
    shutdown: &CancellationToken,
    config: &SessionConfig,
) -> SessionOutcome {
    let Connection {
        remote,
        mut sender,
        reader,
    } = conn;
    debug!(remote = %remote, leftovers = leftovers.len(), "session started");

    let conn_abort = CancellationToken::new();
    let acker_abort = CancellationToken::new();
    let (handoff_tx, handoff_rx) = mpsc::channel(config.max_inflight_chunks.max(1));

    let acker = Acknowledger {
        reader,
        handoff_rx,
        conn_abort: conn_abort.clone(),
        abort: acker_abort.clone(),
        ack_timeout: config.ack_timeout,
        on_consumed: args.consumed_callback(),
    };
    let acker_handle = tokio::spawn(acker.run());

    let (policy, mid_send) = send_phase(
        &mut sender,
        args,
        &mut leftovers,
        &handoff_tx,
        &conn_abort,
        shutdown,
        config,
    )
    .await;

    // A hard stop must not block shutdown on in-flight acks; resending a
    // duplicate later is the cheaper failure.
    let hard = shutdown.is_cancelled() || args.input_closed().is_cancelled();
    let leftovers = collect_leftovers(
        leftovers,
        mid_send,
        handoff_tx,
        &acker_abort,
        acker_handle,
        config.ack_timeout,
        hard,
    )
    .await;

    debug!(
        remote = %remote,
        policy = ?policy,
        leftovers = leftovers.len(),
        "session ended"
    );
    SessionOutcome { policy, leftovers }
}

/// Sends a chunk and hands it to the acknowledger. On any failure the
/// chunk comes back to the caller: it was possibly received upstream but
/// is certainly not tracked, so it must be retried.
async fn deliver(
    sender: &mut Box<dyn ChunkSender>,
    handoff_tx: &mpsc::Sender<Chunk>,
    conn_abort: &CancellationToken,
    shutdown: &CancellationToken,
    config: &SessionConfig,
    chunk: Chunk,
) -> Result<(), (Chunk, ReconnectPolicy)> {
    let limit = send_limit(chunk.payload_len(), config);
    if let Err(e) = sender.send_chunk(&chunk, limit).await {
        warn!(chunk = %chunk.id(), error = %e, "failed to send chunk");
        // Unblock an acknowledger stuck reading this same socket.
        conn_abort.cancel();
        return Err((chunk, ReconnectPolicy::ReconnectWithDelay));
    }

    tokio::select! {
        _ = shutdown.cancelled() => Err((chunk, ReconnectPolicy::NoReconnect)),
        _ = conn_abort.cancelled() => Err((chunk, ReconnectPolicy::ReconnectWithDelay)),
        permit = handoff_tx.reserve() => match permit {
            Ok(permit) => {
                permit.send(chunk);
                Ok(())
            }
            // The acknowledger is gone; its exit already aborted the
            // connection or shutdown is in progress.
            Err(_) => Err((chunk, ReconnectPolicy::ReconnectWithDelay)),
        },
    }
}

fn send_limit(payload_len: usize, config: &SessionConfig) -> Duration {
    let throughput = config.min_throughput_bytes_per_sec.max(1);
    config.send_timeout_base + Duration::from_secs_f64(payload_len as f64 / throughput as f64)
}

/// The session's own loop: leftover replay, then the live output queue.
/// Returns the exit policy plus the chunk that was mid-flight when the
/// session ended, if any.
async fn send_phase(
    sender: &mut Box<dyn ChunkSender>,
    args: &ChunkConsumerArgs,
    leftovers: &mut VecDeque<Chunk>,
    handoff_tx: &mpsc::Sender<Chunk>,
    conn_abort: &CancellationToken,
    shutdown: &CancellationToken,
    config: &SessionConfig,
) -> (ReconnectPolicy, Option<Chunk>) {
    // Replay is a best-effort drain: the queue is owned, so "appears
    // empty" is exact and the loop cannot block on a producer.
    while let Some(chunk) = leftovers.pop_front() {
        if shutdown.is_cancelled() {
            leftovers.push_front(chunk);
            return (ReconnectPolicy::NoReconnect, None);
        }
        match deliver(sender, handoff_tx, conn_abort, shutdown, config, chunk).await {
            Ok(()) => {}
            Err((chunk, policy)) => return (policy, Some(chunk)),
        }
    }

    let input_closed = args.input_closed();
    let rotation = async {
        match config.max_session_duration {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(rotation);
    let mut ping = interval_at(Instant::now() + config.ping_interval, config.ping_interval);

    loop {
        let chunk = tokio::select! {
            _ = shutdown.cancelled() => return (ReconnectPolicy::NoReconnect, None),
            _ = input_closed.cancelled() => return (ReconnectPolicy::NoReconnect, None),
            _ = conn_abort.cancelled() => return (ReconnectPolicy::ReconnectWithDelay, None),
            () = &mut rotation => {
                debug!("max session duration reached, rotating connection");
                return (ReconnectPolicy::Reconnect, None);
            }
            _ = ping.tick() => {
                if let Err(e) = sender.send_ping(config.send_timeout_base).await {
                    warn!(error = %e, "keepalive ping failed");
                    conn_abort.cancel();
                    return (ReconnectPolicy::ReconnectWithDelay, None);
                }
                continue;
            }
            received = args.next_chunk() => match received {
                Some(chunk) => chunk,
                // Output queue closed: the buffer is shutting down.
                None => return (ReconnectPolicy::NoReconnect, None),
            },
        };

        match deliver(sender, handoff_tx, conn_abort, shutdown, config, chunk).await {
            Ok(()) => ping.reset(),
            Err((chunk, policy)) => return (policy, Some(chunk)),
        }
    }
}

/// The acknowledger's final state, published exactly once as the task's
/// return value and read only at join.
#[derive(Default)]
struct AckerReport {
    /// Sent but unacknowledged, in hand-off order.
    pending: Vec<Chunk>,
    /// Handed off but never read from the pipeline queue.
    unread: Vec<Chunk>,
}

struct Acknowledger {
    reader: Box<dyn crate::connection::AckReader>,
    handoff_rx: mpsc::Receiver<Chunk>,
    conn_abort: CancellationToken,
    abort: CancellationToken,
    ack_timeout: Duration,
    on_consumed: ChunkCallback,
}

impl Acknowledger {
    async fn run(mut self) -> AckerReport {
        let mut pending: HashMap<String, Chunk> = HashMap::new();
        let mut order: VecDeque<String> = VecDeque::new();

        loop {
            // Block for a hand-off only while nothing is in flight;
            // otherwise the wire read below is the pacing point.
            if pending.is_empty() {
                let chunk = tokio::select! {
                    _ = self.abort.cancelled() => break,
                    _ = self.conn_abort.cancelled() => break,
                    received = self.handoff_rx.recv() => match received {
                        Some(chunk) => chunk,
                        None => break,
                    },
                };
                Self::track(&mut pending, &mut order, chunk);
            }
            while let Ok(chunk) = self.handoff_rx.try_recv() {
                Self::track(&mut pending, &mut order, chunk);
            }

            let ack = tokio::select! {
                _ = self.abort.cancelled() => break,
                _ = self.conn_abort.cancelled() => break,
                ack = self.reader.read_ack(self.ack_timeout) => ack,
            };

            // Chunks handed off while the read was in flight may be named
            // by this very ack; pick them up before the lookup.
            while let Ok(chunk) = self.handoff_rx.try_recv() {
                Self::track(&mut pending, &mut order, chunk);
            }

            match ack {
                Ok(Some(id)) => match pending.remove(&id) {
                    Some(chunk) => {
                        order.retain(|queued| queued != &id);
                        (self.on_consumed)(chunk);
                    }
                    None => warn!(chunk = %id, "acknowledgement for unknown chunk, ignoring"),
                },
                Ok(None) => match order.pop_front() {
                    Some(id) => {
                        let chunk = pending
                            .remove(&id)
                            .unwrap_or_else(|| panic!("pending map lost chunk {id}"));
                        (self.on_consumed)(chunk);
                    }
                    None => warn!("empty acknowledgement with nothing in flight, ignoring"),
                },
                Err(e) => {
                    warn!(error = %e, "failed to read acknowledgement");
                    // Unblock a send stuck on this same socket.
                    self.conn_abort.cancel();
                    break;
                }
            }
        }

        let mut report = AckerReport::default();
        for id in order {
            if let Some(chunk) = pending.remove(&id) {
                report.pending.push(chunk);
            }
        }
        while let Ok(chunk) = self.handoff_rx.try_recv() {
            report.unread.push(chunk);
        }
        report
    }

    fn track(pending: &mut HashMap<String, Chunk>, order: &mut VecDeque<String>, chunk: Chunk) {
        let id = chunk.id().as_str().to_string();
        order.push_back(id.clone());
        pending.insert(id, chunk);
    }
}

/// Gathers every unacknowledged chunk of a finished session into the next
/// session's leftover queue: (1) unreplayed previous leftovers, (2+3) the
/// acknowledger's pending map and unread hand-off remainder, (4) the
/// mid-send chunk. Sorted by ID, deduplicated last-write-wins.
async fn collect_leftovers(
    mut remaining: VecDeque<Chunk>,
    mid_send: Option<Chunk>,
    handoff_tx: mpsc::Sender<Chunk>,
    acker_abort: &CancellationToken,
    mut acker_handle: JoinHandle<AckerReport>,
    ack_timeout: Duration,
    hard: bool,
) -> VecDeque<Chunk> {
    // Closing the hand-off queue is the graceful stop; the abort token is
    // the immediate one.
    drop(handoff_tx);
    if hard {
        acker_abort.cancel();
    }

    // Every await inside the acknowledger is bounded by the ack timeout or
    // selects on the abort token, so these joins cannot hang unless a
    // signal path is broken, which is exactly what the error logs flag.
    let join_limit = ack_timeout + Duration::from_secs(1);
    let report = match timeout(join_limit, &mut acker_handle).await {
        Ok(joined) => report_from(joined),
        Err(_) => {
            acker_abort.cancel();
            match timeout(join_limit, &mut acker_handle).await {
                Ok(joined) => report_from(joined),
                Err(_) => {
                    error!("timed out stopping the acknowledger; this is a bug");
                    AckerReport::default()
                }
            }
        }
    };

    let mut merged: BTreeMap<ChunkId, Chunk> = BTreeMap::new();
    for chunk in remaining.drain(..) {
        merged.insert(chunk.id().clone(), chunk);
    }
    for chunk in report.pending {
        merged.insert(chunk.id().clone(), chunk);
    }
    for chunk in report.unread {
        merged.insert(chunk.id().clone(), chunk);
    }
    if let Some(chunk) = mid_send {
        merged.insert(chunk.id().clone(), chunk);
    }
    merged.into_values().collect()
}

fn report_from(joined: Result<AckerReport, tokio::task::JoinError>) -> AckerReport {
    joined.unwrap_or_else(|e| {
        error!(error = %e, "acknowledger task failed");
        AckerReport::default()
    })
}
