//! Proxy forwarding engine
//!
//! Sits between clients and the backend server. While the backend is `UP`,
//! requests are forwarded over one shared pipelined [`Connection`] and
//! successful responses are remembered in the proxy's own LRU cache. A forward
//! that times out or loses the connection moves the backend to `DOWN`; from
//! then on requests are answered from the proxy cache (degraded mode) and a
//! cache miss yields `service unavailable`. Each request that arrives while
//! `DOWN` first probes the backend with a fresh connect, so the proxy heals
//! as soon as the backend comes back.

mod health;

pub use health::BackendHealth;

use crate::cache::SharedCache;
use crate::config::ProxyConfig;
use crate::connection::{connect_with_retry, Connection, RetryPolicy};
use crate::error::RelayError;
use crate::protocol::{CacheKey, Request, Response, Source};
use crate::session::RequestHandler;
use async_trait::async_trait;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct BackendState {
    health: BackendHealth,
    connection: Option<Arc<Connection>>,
}

/// Returns the backend to `Down` if a probe is dropped before it finishes.
struct ProbeGuard<'a> {
    engine: &'a ForwardingEngine,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.engine.state();
            if state.health == BackendHealth::Probing {
                state.health = BackendHealth::Down;
                tracing::debug!(backend = %self.engine.options.backend_address, "probe abandoned, health DOWN");
            }
        }
    }
}

/// What to do with a request given the current backend state
enum Route {
    Forward(Arc<Connection>),
    Probe,
    Fallback,
}

/// Forwarding engine settings
#[derive(Debug, Clone)]
pub struct ForwardingOptions {
    pub backend_address: String,
    pub cache_capacity: NonZeroUsize,
    pub forward_timeout: Duration,
    pub max_frame_bytes: usize,
    pub cache_first: bool,
}

impl ForwardingOptions {
    pub fn from_config(config: &ProxyConfig) -> Result<Self, crate::config::ConfigError> {
        config.validate()?;
        Ok(Self {
            backend_address: config.backend_address.clone(),
            cache_capacity: config.capacity()?,
            forward_timeout: config.forward_timeout(),
            max_frame_bytes: config.max_frame_bytes,
            cache_first: config.cache_first,
        })
    }
}

pub struct ForwardingEngine {
    options: ForwardingOptions,
    cache: SharedCache<CacheKey, Value>,
    state: Mutex<BackendState>,
    /// Ids used on the backend connection, unique across all clients
    next_id: AtomicU64,
}

impl ForwardingEngine {
    /// Create an engine in the `UP` state; the backend connection is opened on
    /// first use or by [`ForwardingEngine::connect_backend`].
    pub fn new(options: ForwardingOptions) -> Self {
        Self {
            cache: SharedCache::new(options.cache_capacity),
            options,
            state: Mutex::new(BackendState {
                health: BackendHealth::Up,
                connection: None,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn health(&self) -> BackendHealth {
        self.state().health
    }

    pub fn backend_address(&self) -> &str {
        &self.options.backend_address
    }

    /// Handle to the proxy cache
    pub fn cache(&self) -> &SharedCache<CacheKey, Value> {
        &self.cache
    }

    fn state(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Establish the backend connection at startup.
    ///
    /// On failure the engine starts `DOWN` and keeps serving from its cache.
    pub async fn connect_backend(&self, policy: RetryPolicy) -> BackendHealth {
        match connect_with_retry(
            &self.options.backend_address,
            self.options.max_frame_bytes,
            policy,
        )
        .await
        {
            Ok(connection) => self.set_connected(connection),
            Err(e) => {
                tracing::warn!(
                    backend = %self.options.backend_address,
                    error = %e,
                    "backend unreachable at startup, starting in degraded mode"
                );
                let mut state = self.state();
                state.health = BackendHealth::Down;
                state.connection = None;
                BackendHealth::Down
            }
        }
    }

    fn set_connected(&self, connection: Connection) -> BackendHealth {
        let mut state = self.state();
        state.connection = Some(Arc::new(connection));
        state.health = BackendHealth::Up;
        BackendHealth::Up
    }

    fn route(&self) -> Route {
        let mut state = self.state();
        match state.health {
            BackendHealth::Up => match &state.connection {
                Some(connection) if !connection.is_closed() => Route::Forward(connection.clone()),
                _ => {
                    state.connection = None;
                    state.health = BackendHealth::Probing;
                    Route::Probe
                }
            },
            BackendHealth::Down => {
                state.health = BackendHealth::Probing;
                Route::Probe
            }
            BackendHealth::Probing => Route::Fallback,
        }
    }

    /// Try a fresh connect, bounded by the forward timeout.
    async fn probe(&self) -> Option<Arc<Connection>> {
        let address = &self.options.backend_address;
        tracing::debug!(backend = %address, "probing backend");
        let mut guard = ProbeGuard {
            engine: self,
            armed: true,
        };
        let attempt = tokio::time::timeout(
            self.options.forward_timeout,
            Connection::connect(address, self.options.max_frame_bytes),
        )
        .await;
        guard.armed = false;

        let mut state = self.state();
        match attempt {
            Ok(Ok(connection)) => {
                let connection = Arc::new(connection);
                state.connection = Some(connection.clone());
                state.health = BackendHealth::Up;
                tracing::info!(backend = %address, "backend recovered, health UP");
                Some(connection)
            }
            Ok(Err(e)) => {
                state.health = BackendHealth::Down;
                tracing::debug!(backend = %address, error = %e, "probe failed, health DOWN");
                None
            }
            Err(_) => {
                state.health = BackendHealth::Down;
                tracing::debug!(backend = %address, "probe timed out, health DOWN");
                None
            }
        }
    }

    /// Mark the backend `DOWN` unless a newer connection already replaced `failed`.
    fn mark_down(&self, failed: &Arc<Connection>, error: &RelayError) {
        let mut state = self.state();
        let current = matches!(&state.connection, Some(c) if Arc::ptr_eq(c, failed));
        if current {
            state.connection = None;
            state.health = BackendHealth::Down;
            tracing::warn!(
                backend = %self.options.backend_address,
                error = %error,
                "forward failed, health DOWN"
            );
        }
    }

    async fn forward(
        &self,
        connection: &Arc<Connection>,
        request: &Request,
    ) -> Result<Response, RelayError> {
        let mut wire = request.to_wire();
        wire.id = format!("p-{}", self.next_id.fetch_add(1, Ordering::Relaxed));

        let mut response = connection
            .request(wire, self.options.forward_timeout)
            .await?;
        response.id = request.id.clone();

        if request.use_cache && response.is_ok() {
            if let Some(result) = &response.result {
                self.cache.put(request.cache_key(), result.clone()).await;
            }
        }
        Ok(response)
    }

    /// Answer from the proxy cache while the backend is unavailable.
    async fn fallback(&self, request: &Request, started: Instant) -> Response {
        let cached = if request.use_cache {
            self.cache.get(&request.cache_key()).await
        } else {
            None
        };
        let took_ms = started.elapsed().as_millis() as u64;
        match cached {
            Some(result) => {
                tracing::debug!(id = %request.id, key = %request.cache_key(), "served from proxy cache in degraded mode");
                Response::ok(request.id.clone(), result, Source::ProxyCache).with_took_ms(took_ms)
            }
            None => Response::error(request.id.clone(), RelayError::ServiceUnavailable.to_string())
                .with_took_ms(took_ms),
        }
    }

    /// Produce the response for one client request.
    pub async fn process(&self, request: Request) -> Response {
        let started = Instant::now();

        if self.options.cache_first && request.use_cache {
            if let Some(result) = self.cache.get(&request.cache_key()).await {
                return Response::ok(request.id, result, Source::ProxyCache)
                    .with_took_ms(started.elapsed().as_millis() as u64);
            }
        }

        let connection = match self.route() {
            Route::Forward(connection) => Some(connection),
            Route::Probe => self.probe().await,
            Route::Fallback => None,
        };
        let Some(connection) = connection else {
            return self.fallback(&request, started).await;
        };

        match self.forward(&connection, &request).await {
            Ok(response) => response,
            Err(e) if e.is_backend_failure() => {
                self.mark_down(&connection, &e);
                self.fallback(&request, started).await
            }
            Err(e) => Response::error(request.id, e.to_string())
                .with_took_ms(started.elapsed().as_millis() as u64),
        }
    }
}

#[async_trait]
impl RequestHandler for ForwardingEngine {
    async fn handle(&self, request: Request) -> Response {
        self.process(request).await
    }
}
