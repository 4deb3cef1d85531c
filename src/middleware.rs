//! Middleware implementation for reqwest.

use crate::config::ProxyPoolConfig;
use crate::error::Error as PoolError;
use crate::pool::ProxyPool;
use crate::retry::{RequestPolicy, Retrier};
use crate::transport::ReqwestTransport;

use anyhow::anyhow;
use async_trait::async_trait;
use log::info;
use reqwest_middleware::{Error, Middleware, Next, Result};
use std::sync::Arc;

/// Middleware that sends every request through the proxy pool.
///
/// The wrapped client is never used; each attempt gets its own proxied client.
#[derive(Clone)]
pub struct ProxyPoolMiddleware {
    retrier: Retrier,
    policy: RequestPolicy,
}

impl ProxyPoolMiddleware {
    /// Create a new proxy pool middleware with the given configuration.
    /// This fetches the initial proxy list before returning.
    pub async fn new(config: ProxyPoolConfig) -> Result<Self> {
        let pool = ProxyPool::new(config).await.map_err(into_middleware_error)?;
        let stats = pool.get_stats();
        info!("Proxy pool initialized with {} proxies", stats.eligible);
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: Arc<ProxyPool>) -> Self {
        Self::from_retrier(Retrier::with_configured_stats(pool, Arc::new(ReqwestTransport)))
    }

    /// Wrap an existing retry loop, e.g. one with a custom transport.
    pub fn from_retrier(retrier: Retrier) -> Self {
        Self {
            retrier,
            policy: RequestPolicy::default(),
        }
    }

    /// Apply `policy` to every request going through the middleware.
    pub fn with_policy(mut self, policy: RequestPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl Middleware for ProxyPoolMiddleware {
    async fn handle(
        &self,
        req: reqwest::Request,
        _extensions: &mut http::Extensions,
        _next: Next<'_>,
    ) -> Result<reqwest::Response> {
        self.retrier
            .execute(req, &self.policy)
            .await
            .map_err(into_middleware_error)
    }
}

/// Hand reqwest errors back as such; everything else becomes a middleware error.
fn into_middleware_error(err: PoolError) -> Error {
    match err {
        PoolError::Transport(err) => match err.into_source().downcast::<reqwest::Error>() {
            Ok(err) => Error::Reqwest(*err),
            Err(other) => Error::Middleware(anyhow!(other)),
        },
        other => Error::Middleware(anyhow!(other)),
    }
}
