// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end delivery over real sockets: buffer → worker → mock
//! collector, including redelivery across a collector restart.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use forward_client::connection::{FRAME_ACK, FRAME_CHUNK, FRAME_PING, MAGIC, VERSION};
use forward_client::{ClientWorker, SessionConfig, TcpConnector, WorkerConfig};
use hybrid_buffer::{default_chunk_matcher, BufferConfig, Chunk, ChunkBufferer, ChunkId};

#[derive(Debug, PartialEq)]
struct ReceivedChunk {
    id: String,
    payload: Vec<u8>,
}

/// Reads one agent frame; returns `None` for pings and on EOF errors.
async fn read_frame(conn: &mut TcpStream) -> Option<ReceivedChunk> {
    loop {
        let mut preamble = [0u8; 7];
        conn.read_exact(&mut preamble).await.ok()?;
        assert_eq!(preamble[0], MAGIC);
        assert_eq!(preamble[1], VERSION);
        let body_len =
            u32::from_be_bytes([preamble[3], preamble[4], preamble[5], preamble[6]]) as usize;
        let mut body = vec![0u8; body_len];
        conn.read_exact(&mut body).await.ok()?;

        match preamble[2] {
            FRAME_PING => continue,
            FRAME_CHUNK => {
                let header: serde_json::Value = serde_json::from_slice(&body).expect("header");
                let id = header["id"].as_str().expect("id").to_string();
                let size = header["size"].as_u64().expect("size") as usize;
                let mut payload = vec![0u8; size];
                conn.read_exact(&mut payload).await.ok()?;
                return Some(ReceivedChunk { id, payload });
            }
            other => panic!("unexpected frame type {other:#04x}"),
        }
    }
}

async fn write_ack(conn: &mut TcpStream, id: &str) {
    let body = serde_json::json!({ "ack": id }).to_string().into_bytes();
    let mut frame = vec![MAGIC, VERSION, FRAME_ACK];
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    conn.write_all(&frame).await.expect("write ack");
}

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        retry_interval: Duration::from_millis(20),
        session: SessionConfig {
            ack_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(60),
            ..SessionConfig::default()
        },
    }
}

fn chunk(seq: u32, payload: &[u8]) -> Chunk {
    Chunk::new(
        ChunkId::new(format!("1722800000.000000000.{seq:06}")),
        payload.to_vec(),
    )
}

#[tokio::test]
async fn chunks_flow_end_to_end_and_acks_consume_them() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    // Collector: ack every chunk, in arrival order.
    let (received_tx, mut received_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.expect("accept");
        while let Some(received) = read_frame(&mut conn).await {
            write_ack(&mut conn, &received.id).await;
            let _ = received_tx.send(received);
        }
    });

    let dir = tempfile::tempdir().expect("tempdir");
    let mut buffer_config = BufferConfig::new("e2e-test");
    buffer_config.root_dir = Some(dir.path().to_path_buf());
    let buffer = Arc::new(ChunkBufferer::start(buffer_config, default_chunk_matcher()));

    let shutdown = CancellationToken::new();
    let worker = ClientWorker::new(
        Arc::new(TcpConnector::new(addr.to_string(), Duration::from_secs(2))),
        worker_config(),
        shutdown.clone(),
    );
    let worker_handle = tokio::spawn(worker.run(buffer.register_new_consumer()));

    for seq in 1..=5u32 {
        let payload = format!("record batch {seq}");
        assert!(
            buffer
                .accept(chunk(seq, payload.as_bytes()), Duration::from_secs(1))
                .await
        );
    }

    let mut delivered = Vec::new();
    for _ in 0..5 {
        let received = tokio::time::timeout(Duration::from_secs(5), received_rx.recv())
            .await
            .expect("delivery in time")
            .expect("collector alive");
        delivered.push(received);
    }
    assert_eq!(delivered[0].payload, b"record batch 1");
    assert_eq!(delivered[4].id, "1722800000.000000000.000005");

    // All acks processed: nothing pending, nothing on disk.
    for _ in 0..200 {
        if buffer.metrics().consumed == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let metrics = buffer.metrics();
    assert_eq!(metrics.consumed, 5);
    assert_eq!(metrics.pending, 0);
    assert_eq!(metrics.dropped, 0);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), worker_handle)
        .await
        .expect("worker stops")
        .expect("no panic");
    buffer.destroy().await;
}

#[tokio::test]
async fn collector_restart_triggers_redelivery() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    // First collector instance drops the connection without acking;
    // the second acks everything it sees.
    let (received_tx, mut received_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.expect("accept");
        let first = read_frame(&mut conn).await.expect("first delivery");
        let _ = received_tx.send(first);
        drop(conn);

        let (mut conn, _) = listener.accept().await.expect("re-accept");
        while let Some(received) = read_frame(&mut conn).await {
            write_ack(&mut conn, &received.id).await;
            let _ = received_tx.send(received);
        }
    });

    let dir = tempfile::tempdir().expect("tempdir");
    let mut buffer_config = BufferConfig::new("e2e-redelivery");
    buffer_config.root_dir = Some(dir.path().to_path_buf());
    let buffer = Arc::new(ChunkBufferer::start(buffer_config, default_chunk_matcher()));

    let shutdown = CancellationToken::new();
    let mut config = worker_config();
    // A short ack timeout notices the dead first connection quickly.
    config.session.ack_timeout = Duration::from_millis(200);
    let worker = ClientWorker::new(
        Arc::new(TcpConnector::new(addr.to_string(), Duration::from_secs(2))),
        config,
        shutdown.clone(),
    );
    let worker_handle = tokio::spawn(worker.run(buffer.register_new_consumer()));

    assert!(
        buffer
            .accept(chunk(1, b"survives reconnect"), Duration::from_secs(1))
            .await
    );

    let mut seen = HashSet::new();
    // First delivery (unacked) plus the redelivery after reconnect.
    for _ in 0..2 {
        let received = tokio::time::timeout(Duration::from_secs(5), received_rx.recv())
            .await
            .expect("delivery in time")
            .expect("collector alive");
        assert_eq!(received.payload, b"survives reconnect");
        seen.insert(received.id);
    }
    assert_eq!(seen.len(), 1, "same chunk id on both deliveries");

    for _ in 0..200 {
        if buffer.metrics().consumed == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(buffer.metrics().consumed, 1);
    assert_eq!(buffer.metrics().pending, 0);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), worker_handle)
        .await
        .expect("worker stops")
        .expect("no panic");
    buffer.destroy().await;
}
