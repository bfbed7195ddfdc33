// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Forwarding client for buffered log chunks.
//!
//! Consumes a `hybrid-buffer` output queue and delivers its chunks to an
//! upstream collector over a persistent connection, with request/response
//! pipelining and out-of-order acknowledgement. Delivery is at-least-once:
//! a chunk leaves the client only through the buffer's consumed callback
//! (positively acknowledged) or its leftover callback (persisted for the
//! next attempt); duplicates across reconnects are possible and expected.
//!
//! # Pieces
//!
//! - [`connection`]: the connector/sender/ack-reader seam plus the framed
//!   TCP implementation.
//! - [`session`]: one connection's send and acknowledgement loops and the
//!   leftover reconciliation between attempts.
//! - [`worker`]: the reconnect loop that strings sessions together and
//!   drains undelivered chunks at final shutdown.

pub mod connection;
pub mod session;
pub mod worker;

pub use connection::{AckReader, ChunkSender, Connection, Connector, NetError, TcpConnector};
pub use session::{ReconnectPolicy, SessionConfig};
pub use worker::{ClientWorker, WorkerConfig};
