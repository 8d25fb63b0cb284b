//! Server request dispatcher
//!
//! Answers requests authoritatively: a cache hit is served from the server's
//! LRU cache, a miss is computed, stored and tagged `computed`. Requests that
//! fail evaluation get an error response and leave the cache untouched.

use crate::cache::SharedCache;
use crate::compute::{self, EchoGenerator, TextGenerator};
use crate::protocol::{CacheKey, Request, Response, Source};
use crate::session::RequestHandler;
use async_trait::async_trait;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

/// Request dispatcher backed by the server's cache
pub struct Dispatcher {
    cache: SharedCache<CacheKey, Value>,
    generator: Arc<dyn TextGenerator>,
}

impl Dispatcher {
    /// Create a dispatcher with the default text generator
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self::with_generator(capacity, Arc::new(EchoGenerator))
    }

    pub fn with_generator(capacity: NonZeroUsize, generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            cache: SharedCache::new(capacity),
            generator,
        }
    }

    /// Handle to the server cache
    pub fn cache(&self) -> &SharedCache<CacheKey, Value> {
        &self.cache
    }

    /// Produce the response for one request.
    pub async fn dispatch(&self, request: Request) -> Response {
        let started = Instant::now();
        let Request {
            id,
            payload,
            use_cache,
        } = request;

        let outcome = if use_cache {
            let key = payload.cache_key();
            self.cache
                .get_or_try_insert_with(key.clone(), || {
                    compute::evaluate(&payload, self.generator.as_ref())
                })
                .await
                .map(|(value, hit)| {
                    tracing::debug!(id = %id, key = %key, hit = hit, "server cache lookup");
                    let source = if hit { Source::ServerCache } else { Source::Computed };
                    (value, source)
                })
        } else {
            compute::evaluate(&payload, self.generator.as_ref()).map(|value| (value, Source::Computed))
        };

        let took_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok((value, source)) => Response::ok(id, value, source).with_took_ms(took_ms),
            Err(e) => {
                tracing::debug!(id = %id, error = %e, "request failed evaluation");
                Response::error(id, e.to_string()).with_took_ms(took_ms)
            }
        }
    }
}

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle(&self, request: Request) -> Response {
        self.dispatch(request).await
    }
}
