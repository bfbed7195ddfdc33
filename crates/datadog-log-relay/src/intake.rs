// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Minimal TCP line intake and chunk cutting.
//!
//! Listens for newline-delimited records on a TCP socket and batches them
//! into chunks, cutting a chunk when it reaches the size limit or the
//! flush interval elapses. Completed chunks go straight into the buffer;
//! the real parsing and transformation pipeline sits upstream of this
//! boundary.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hybrid_buffer::{Chunk, ChunkBufferer, ChunkIdGenerator};

/// Accepts connections and forwards each received line as one record.
pub struct LineIntake {
    listener: TcpListener,
    records_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl LineIntake {
    pub async fn bind(
        addr: &str,
        records_tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "listening for records");
        Ok(LineIntake {
            listener,
            records_tx,
            cancel,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) {
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                },
            };
            debug!(peer = %peer, "record source connected");
            tokio::spawn(read_lines(
                stream,
                self.records_tx.clone(),
                self.cancel.clone(),
            ));
        }
        debug!("line intake stopped");
    }
}

async fn read_lines(stream: TcpStream, records_tx: mpsc::Sender<String>, cancel: CancellationToken) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            read = lines.next_line() => match read {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "record source read failed");
                    break;
                }
            },
        };
        if line.is_empty() {
            continue;
        }
        if records_tx.send(line).await.is_err() {
            break;
        }
    }
}

/// Batches records into chunks by size and age.
pub struct ChunkCutter {
    records_rx: mpsc::Receiver<String>,
    buffer: Arc<ChunkBufferer>,
    ids: ChunkIdGenerator,
    max_chunk_bytes: usize,
    flush_interval: Duration,
    accept_timeout: Duration,
}

impl ChunkCutter {
    #[must_use]
    pub fn new(
        records_rx: mpsc::Receiver<String>,
        buffer: Arc<ChunkBufferer>,
        max_chunk_bytes: usize,
        flush_interval: Duration,
        accept_timeout: Duration,
    ) -> Self {
        ChunkCutter {
            records_rx,
            buffer,
            ids: ChunkIdGenerator::new(),
            max_chunk_bytes,
            flush_interval,
            accept_timeout,
        }
    }

    pub async fn run(mut self) {
        let mut current: Vec<u8> = Vec::new();
        let mut flush = tokio::time::interval(self.flush_interval);
        flush.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                _ = flush.tick() => {
                    if !current.is_empty() {
                        self.cut(&mut current).await;
                    }
                }
                received = self.records_rx.recv() => match received {
                    Some(record) => {
                        current.extend_from_slice(record.as_bytes());
                        current.push(b'\n');
                        if current.len() >= self.max_chunk_bytes {
                            self.cut(&mut current).await;
                            flush.reset();
                        }
                    }
                    None => break,
                },
            }
        }

        if !current.is_empty() {
            self.cut(&mut current).await;
        }
        debug!("chunk cutter stopped");
    }

    async fn cut(&self, current: &mut Vec<u8>) {
        let chunk = Chunk::new(self.ids.next_id(), std::mem::take(current));
        debug!(chunk = %chunk.id(), bytes = chunk.payload_len(), "cut chunk");
        self.buffer.accept(chunk, self.accept_timeout).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hybrid_buffer::{default_chunk_matcher, BufferConfig};
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn intake_forwards_lines_as_records() {
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let intake = LineIntake::bind("127.0.0.1:0", tx, cancel.clone())
            .await
            .expect("bind");
        let addr = intake.local_addr().expect("addr");
        let server = tokio::spawn(intake.run());

        let mut client = TcpStream::connect(addr).await.expect("connect");
        client
            .write_all(b"<13>first record\n<13>second record\n")
            .await
            .expect("write");
        client.shutdown().await.expect("shutdown");

        assert_eq!(rx.recv().await.as_deref(), Some("<13>first record"));
        assert_eq!(rx.recv().await.as_deref(), Some("<13>second record"));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .expect("intake stops")
            .expect("no panic");
    }

    #[tokio::test]
    async fn cutter_cuts_by_size_and_drains_on_close() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = BufferConfig::new("cutter-test");
        config.root_dir = Some(dir.path().to_path_buf());
        let buffer = Arc::new(ChunkBufferer::start(config, default_chunk_matcher()));

        let (tx, rx) = mpsc::channel(16);
        let cutter = ChunkCutter::new(
            rx,
            Arc::clone(&buffer),
            16,
            Duration::from_secs(60),
            Duration::from_secs(1),
        );
        let cutter_task = tokio::spawn(cutter.run());
        let args = buffer.register_new_consumer();

        // Two records cross the 16-byte limit and force a cut.
        tx.send("0123456789".to_string()).await.expect("send");
        tx.send("abcdefghij".to_string()).await.expect("send");
        let chunk = args.next_chunk().await.expect("size-cut chunk");
        assert_eq!(chunk.payload(), Some(&b"0123456789\nabcdefghij\n"[..]));
        args.on_consumed(chunk);

        // Closing the records channel flushes the remainder.
        tx.send("tail".to_string()).await.expect("send");
        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), cutter_task)
            .await
            .expect("cutter stops")
            .expect("no panic");
        let chunk = args.next_chunk().await.expect("drained chunk");
        assert_eq!(chunk.payload(), Some(&b"tail\n"[..]));
        args.on_consumed(chunk);

        args.finished();
        buffer.destroy().await;
    }
}
