//! Outbound connection manager
//!
//! A [`Connection`] owns one persistent TCP socket to a backend:
//! - a writer task drains a queue of outbound frames, so concurrent callers
//!   never interleave bytes on the socket
//! - a reader task decodes response frames and resolves the waiter registered
//!   under the response's correlation id
//! - any number of requests may be in flight at once (pipelining)
//!
//! When the socket closes or a read fails, every outstanding waiter fails with
//! [`RelayError::ConnectionLost`] and the connection stays closed. Reconnecting
//! is the caller's decision.

mod retry;

pub use retry::{connect_with_retry, RetryPolicy};

use crate::error::RelayError;
use crate::protocol::{CorrelationId, JsonLinesCodec, Response, WireRequest};
use futures::SinkExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Frames queued for the writer task
const OUTBOUND_QUEUE: usize = 1024;

type ClientCodec = JsonLinesCodec<Response, WireRequest>;
type Waiter = oneshot::Sender<Result<Response, RelayError>>;
type WaiterRx = oneshot::Receiver<Result<Response, RelayError>>;

/// Waiters keyed by correlation id.
///
/// Each registration carries a sequence number so a stale cleanup guard never
/// removes a newer waiter that reused the same id.
#[derive(Default)]
struct PendingTable {
    waiters: HashMap<CorrelationId, (u64, Waiter)>,
    closed: bool,
}

struct Shared {
    pending: Mutex<PendingTable>,
    next_seq: AtomicU64,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, id: &str) -> Result<(u64, WaiterRx), RelayError> {
        let mut table = self.table();
        if table.closed {
            return Err(RelayError::ConnectionLost);
        }
        if table.waiters.contains_key(id) {
            return Err(RelayError::DuplicateId(id.to_string()));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        table.waiters.insert(id.to_string(), (seq, tx));
        Ok((seq, rx))
    }

    fn resolve(&self, response: Response) -> bool {
        let waiter = self.table().waiters.remove(&response.id);
        match waiter {
            Some((_, tx)) => {
                // the caller may have given up already
                let _ = tx.send(Ok(response));
                true
            }
            None => false,
        }
    }

    fn forget(&self, id: &str, seq: u64) {
        let mut table = self.table();
        if matches!(table.waiters.get(id), Some((current, _)) if *current == seq) {
            table.waiters.remove(id);
        }
    }

    fn fail_all(&self) -> usize {
        let drained: Vec<Waiter> = {
            let mut table = self.table();
            table.closed = true;
            table.waiters.drain().map(|(_, (_, tx))| tx).collect()
        };
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(RelayError::ConnectionLost));
        }
        count
    }
}

/// Removes a waiter when its caller stops waiting (timeout or cancellation).
struct WaiterGuard {
    id: CorrelationId,
    seq: u64,
    shared: Arc<Shared>,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.shared.forget(&self.id, self.seq);
    }
}

/// A response that has been requested but not yet received.
pub struct PendingResponse {
    rx: WaiterRx,
    guard: WaiterGuard,
}

impl PendingResponse {
    /// Wait for the matching response or a connection failure.
    pub async fn wait(mut self) -> Result<Response, RelayError> {
        match (&mut self.rx).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::ConnectionLost),
        }
    }
}

/// A persistent, pipelined connection to a backend.
pub struct Connection {
    address: String,
    outbound: mpsc::Sender<WireRequest>,
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    /// Open a connection to `address`.
    pub async fn connect(address: &str, max_frame_bytes: usize) -> Result<Self, RelayError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| RelayError::Connect {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(address = %address, error = %e, "failed to set TCP_NODELAY");
        }
        tracing::info!(address = %address, "connected to backend");

        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(Shared {
            pending: Mutex::new(PendingTable::default()),
            next_seq: AtomicU64::new(0),
        });
        let (outbound, mut rx) = mpsc::channel::<WireRequest>(OUTBOUND_QUEUE);

        let reader = {
            let shared = shared.clone();
            let address = address.to_string();
            let mut frames = FramedRead::new(read_half, ClientCodec::new(max_frame_bytes));
            tokio::spawn(async move {
                loop {
                    match frames.next().await {
                        Some(Ok(response)) => {
                            let id = response.id.clone();
                            if !shared.resolve(response) {
                                tracing::warn!(address = %address, id = %id, "dropping response with no pending waiter");
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(address = %address, error = %e, "framing error on backend connection");
                            break;
                        }
                        None => break,
                    }
                }
                let failed = shared.fail_all();
                tracing::warn!(address = %address, failed_waiters = failed, "backend connection closed");
            })
        };

        let writer = {
            let shared = shared.clone();
            let address = address.to_string();
            let mut sink = FramedWrite::new(write_half, ClientCodec::new(max_frame_bytes));
            tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    if let Err(e) = sink.send(frame).await {
                        tracing::warn!(address = %address, error = %e, "write to backend failed");
                        shared.fail_all();
                        break;
                    }
                }
            })
        };

        Ok(Self {
            address: address.to_string(),
            outbound,
            shared,
            reader,
            writer,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_closed(&self) -> bool {
        self.shared.table().closed
    }

    /// Number of requests waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.shared.table().waiters.len()
    }

    /// Queue `request` and register a waiter under its id.
    ///
    /// Fails with [`RelayError::DuplicateId`] if the id is already in flight
    /// and [`RelayError::ConnectionLost`] if the connection is closed.
    pub async fn send(&self, request: WireRequest) -> Result<PendingResponse, RelayError> {
        let (seq, rx) = self.shared.register(&request.id)?;
        let guard = WaiterGuard {
            id: request.id.clone(),
            seq,
            shared: self.shared.clone(),
        };
        if self.outbound.send(request).await.is_err() {
            return Err(RelayError::ConnectionLost);
        }
        Ok(PendingResponse { rx, guard })
    }

    /// Send `request` and wait at most `deadline` for its response.
    ///
    /// On timeout the waiter is released; a late response is dropped by the
    /// reader. The connection itself stays usable.
    pub async fn request(
        &self,
        request: WireRequest,
        deadline: Duration,
    ) -> Result<Response, RelayError> {
        let exchange = async {
            let pending = self.send(request).await?;
            pending.wait().await
        };
        match tokio::time::timeout(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::Timeout(deadline)),
        }
    }

    /// Close the socket and fail every outstanding waiter.
    pub fn close(&self) {
        self.reader.abort();
        self.writer.abort();
        let failed = self.shared.fail_all();
        tracing::debug!(address = %self.address, failed_waiters = failed, "connection closed by caller");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
        self.shared.fail_all();
    }
}
