//! TCP listener shared by the calc server and the proxy
//!
//! [`RelayServer`] accepts connections and runs one session task per client.
//! Whatever answers the requests (the [`Dispatcher`] on the backend, the
//! forwarding engine on the proxy) plugs in as a [`RequestHandler`].

mod dispatcher;

pub use dispatcher::Dispatcher;

use crate::session::{serve_connection, RequestHandler};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio::time::sleep;

/// Server drain state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainState {
    /// Server is running normally
    Running,
    /// No longer accepting; waiting for open sessions to finish
    Draining { started_at: Instant },
    /// Listener closed
    Stopped,
}

/// Decrements the active session count when a session ends.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Relay server
pub struct RelayServer<H: RequestHandler> {
    handler: Arc<H>,
    listen_address: String,
    max_frame_bytes: usize,
    local_addr: Option<SocketAddr>,
    stop_tx: Option<oneshot::Sender<()>>,
    abort_tx: Option<oneshot::Sender<()>>,
    /// Drain state tracking
    drain_state: Arc<RwLock<DrainState>>,
    /// Active client connection count
    active_connections: Arc<AtomicUsize>,
}

impl<H: RequestHandler> RelayServer<H> {
    /// Create a new server
    pub fn new(handler: Arc<H>, listen_address: String, max_frame_bytes: usize) -> Self {
        Self {
            handler,
            listen_address,
            max_frame_bytes,
            local_addr: None,
            stop_tx: None,
            abort_tx: None,
            drain_state: Arc::new(RwLock::new(DrainState::Running)),
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Bound address, available after [`RelayServer::start`]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Get current drain state
    pub async fn get_drain_state(&self) -> DrainState {
        self.drain_state.read().await.clone()
    }

    /// Get active connection count
    pub fn get_active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Bind the listener and start accepting connections.
    pub async fn start(&mut self) -> crate::Result<SocketAddr> {
        let listener = TcpListener::bind(&self.listen_address).await?;
        let addr = listener.local_addr()?;
        self.local_addr = Some(addr);
        tracing::info!("Starting relay server on {}", addr);

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let (abort_tx, mut abort_rx) = oneshot::channel::<()>();
        self.stop_tx = Some(stop_tx);
        self.abort_tx = Some(abort_tx);

        let handler = self.handler.clone();
        let active = self.active_connections.clone();
        let max_frame_bytes = self.max_frame_bytes;

        tokio::spawn(async move {
            let mut sessions = JoinSet::new();
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(accepted) => accepted,
                            Err(e) => {
                                tracing::warn!(error = %e, "failed to accept connection");
                                continue;
                            }
                        };
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
                        }
                        active.fetch_add(1, Ordering::Relaxed);
                        let guard = ActiveGuard(active.clone());
                        let handler = handler.clone();

                        sessions.spawn(async move {
                            let _guard = guard;
                            tracing::info!(peer = %peer, "client connected");
                            let (reader, writer) = stream.into_split();
                            match serve_connection(reader, writer, peer, handler, max_frame_bytes).await {
                                Ok(()) => tracing::info!(peer = %peer, "client disconnected"),
                                Err(e) => tracing::warn!(peer = %peer, error = %e, "client connection closed on framing error"),
                            }
                        });
                    }
                }
            }
            drop(listener);
            tracing::info!(address = %addr, "listener stopped");

            // open sessions run until they end or the server is stopped
            tokio::select! {
                _ = &mut abort_rx => {
                    if !sessions.is_empty() {
                        tracing::warn!(sessions = sessions.len(), "closing open client sessions");
                    }
                }
                _ = async { while sessions.join_next().await.is_some() {} } => {}
            }
            sessions.shutdown().await;
        });

        Ok(addr)
    }

    /// Stop accepting new connections and close open sessions
    pub async fn shutdown(&mut self) -> crate::Result<()> {
        tracing::info!("Shutting down relay server");

        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(abort_tx) = self.abort_tx.take() {
            let _ = abort_tx.send(());
        }
        *self.drain_state.write().await = DrainState::Stopped;

        Ok(())
    }

    /// Stop accepting, then wait up to `timeout` for open sessions to end.
    ///
    /// Sessions still open at the deadline are closed.
    pub async fn drain_and_shutdown(&mut self, timeout: Duration) -> crate::Result<()> {
        tracing::info!(timeout_ms = timeout.as_millis() as u64, "starting drain");

        *self.drain_state.write().await = DrainState::Draining {
            started_at: Instant::now(),
        };
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        let poll_interval = Duration::from_millis(20);
        let deadline = Instant::now() + timeout;

        while self.active_connections.load(Ordering::Relaxed) > 0 {
            if Instant::now() > deadline {
                tracing::warn!(
                    remaining_connections = self.active_connections.load(Ordering::Relaxed),
                    "drain timeout exceeded, forcing shutdown"
                );
                break;
            }
            sleep(poll_interval).await;
        }

        self.shutdown().await?;
        tracing::info!("relay server shutdown complete");
        Ok(())
    }
}
