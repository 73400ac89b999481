//! Connection Acceptor - TCP ingest with newline framing.
//!
//! # Framing
//!
//! Clients stream one JSON object per line, terminated by LF (a trailing CR is
//! trimmed together with any other surrounding whitespace). Blank lines are
//! skipped. A line is only handed on once its terminator has arrived, so a
//! line split across reads is never split across queue entries. Bytes left
//! without a terminator when the client closes are discarded.
//!
//! A line that grows past `max_line_len` before its terminator shows up is
//! discarded up to and including the next LF.
//!
//! # Backpressure
//!
//! Each connection has its own reader task. The reader blocks on the ingest
//! queue when it is full and stops reading the socket meanwhile, so a slow
//! pipeline slows the client down through TCP flow control. The accept loop
//! never waits on a reader.

use crate::metrics::PipelineMetrics;
use crate::queue::BoundedQueue;
use crate::shutdown::ShutdownSignal;
use crate::worker::RawLine;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinError, JoinSet};

/// Default read size per `read` call.
const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Default maximum line length (1 MiB).
const DEFAULT_MAX_LINE_LEN: usize = 1024 * 1024;

/// Pause after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Acceptor configuration
#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    /// Bytes requested per socket read
    pub chunk_size: usize,
    /// Longest line accepted, terminator excluded
    pub max_line_len: usize,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

/// Acceptor errors
#[derive(Debug, thiserror::Error)]
pub enum AcceptorError {
    /// Failed to bind to address
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
}

// =============================================================================
// Framing
// =============================================================================

/// Splits a byte stream into trimmed, non-empty lines.
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    max_line_len: usize,
    /// Inside an oversized line; drop bytes until the next LF
    discarding: bool,
}

impl LineFramer {
    pub fn new(max_line_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line_len,
            discarding: false,
        }
    }

    /// Feeds one chunk, appending every completed line to `out`.
    ///
    /// Returns `true` if a line was found to exceed the limit while
    /// processing this chunk.
    pub fn push(&mut self, chunk: &[u8], out: &mut Vec<RawLine>) -> bool {
        let mut oversized = false;
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let head = &rest[..pos];
            rest = &rest[pos + 1..];

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if self.buffer.len() + head.len() > self.max_line_len {
                oversized = true;
                self.buffer.clear();
                continue;
            }

            let line = if self.buffer.is_empty() {
                head.trim_ascii().to_vec()
            } else {
                self.buffer.extend_from_slice(head);
                let line = self.buffer.trim_ascii().to_vec();
                self.buffer.clear();
                line
            };
            if !line.is_empty() {
                out.push(line);
            }
        }

        if !rest.is_empty() && !self.discarding {
            if self.buffer.len() + rest.len() > self.max_line_len {
                oversized = true;
                self.buffer.clear();
                self.discarding = true;
            } else {
                self.buffer.extend_from_slice(rest);
            }
        }

        oversized
    }

    /// Bytes buffered for an incomplete line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

// =============================================================================
// Acceptor
// =============================================================================

/// Accepts ingest connections and spawns a reader per connection.
pub struct ConnectionAcceptor {
    listener: TcpListener,
    lines: BoundedQueue<RawLine>,
    metrics: PipelineMetrics,
    config: AcceptorConfig,
}

impl ConnectionAcceptor {
    /// Binds the ingest socket.
    pub async fn bind(
        address: &str,
        config: AcceptorConfig,
        lines: BoundedQueue<RawLine>,
        metrics: PipelineMetrics,
    ) -> Result<Self, AcceptorError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| AcceptorError::Bind {
                address: address.to_string(),
                source: e,
            })?;

        Ok(Self {
            listener,
            lines,
            metrics,
            config,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `stop` is triggered, then waits for every
    /// reader to finish.
    ///
    /// Readers stop reading their socket once `stop` is triggered. Lines they
    /// already framed are still pushed, so when this returns no more lines
    /// will enter the ingest queue.
    pub async fn run(self, stop: ShutdownSignal) {
        if let Ok(addr) = self.local_addr() {
            tracing::info!(address = %addr, "ingest listener accepting connections");
        }

        let mut readers = JoinSet::new();
        loop {
            tokio::select! {
                () = stop.wait() => break,
                Some(result) = readers.join_next(), if !readers.is_empty() => {
                    log_reader_exit(result);
                }
                accept_result = self.listener.accept() => match accept_result {
                    Ok((stream, peer)) => {
                        tracing::debug!(peer = %peer, "connection accepted");
                        let reader = ConnectionReader {
                            lines: self.lines.clone(),
                            metrics: self.metrics.clone(),
                            config: self.config.clone(),
                            peer,
                        };
                        readers.spawn(reader.run(stream, stop.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        tracing::info!(open_connections = readers.len(), "ingest listener stopped accepting");
        drop(self.listener);
        while let Some(result) = readers.join_next().await {
            log_reader_exit(result);
        }
        tracing::info!("ingest readers finished");
    }
}

fn log_reader_exit(result: Result<(), JoinError>) {
    if let Err(e) = result {
        tracing::error!(error = %e, "connection reader failed");
    }
}

/// Per-connection reader.
struct ConnectionReader {
    lines: BoundedQueue<RawLine>,
    metrics: PipelineMetrics,
    config: AcceptorConfig,
    peer: SocketAddr,
}

impl ConnectionReader {
    async fn run(self, mut stream: TcpStream, stop: ShutdownSignal) {
        self.metrics.inc_active_connections();

        let mut framer = LineFramer::new(self.config.max_line_len);
        let mut chunk = vec![0_u8; self.config.chunk_size.max(1)];
        let mut completed = Vec::new();
        let mut forwarded: u64 = 0;

        'read: loop {
            let read = tokio::select! {
                () = stop.wait() => {
                    tracing::debug!(peer = %self.peer, "shutdown, closing connection");
                    break;
                }
                read = stream.read(&mut chunk) => read,
            };
            let n = match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(peer = %self.peer, error = %e, "connection read failed");
                    break;
                }
            };

            if framer.push(&chunk[..n], &mut completed) {
                tracing::warn!(
                    peer = %self.peer,
                    max_line_len = self.config.max_line_len,
                    "discarding oversized line"
                );
            }

            for line in completed.drain(..) {
                if self.lines.push(line).await.is_err() {
                    tracing::error!(peer = %self.peer, "ingest queue closed");
                    break 'read;
                }
                forwarded += 1;
            }
            self.metrics.set_ingest_queue_size(self.lines.len());
        }

        if framer.pending() > 0 {
            tracing::debug!(
                peer = %self.peer,
                bytes = framer.pending(),
                "dropping unterminated trailing data"
            );
        }
        tracing::debug!(peer = %self.peer, lines = forwarded, "connection closed");
        self.metrics.dec_active_connections();
    }
}
