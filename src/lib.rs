//! # reqwest-proxy-rotator
//!
//! Send HTTP requests through a rotating pool of third-party proxies.
//!
//! Proxies are handed out earliest-eligible first. Each use is followed by a
//! cooldown that grows with the proxy's consecutive failures, and proxies that
//! never succeed are quarantined after a few attempts. Requests are retried
//! with another proxy on connection-level failures or on responses matching a
//! caller-supplied [`RetryTrigger`].

pub mod classify;
pub mod client;
pub mod config;
pub mod error;
pub mod middleware;
pub mod pool;
pub mod proxy;
pub mod retry;
pub mod source;
pub mod stats;
pub mod transport;

pub use classify::{classify, Outcome, RetryReason, RetryTrigger};
pub use client::{ProxyClient, RequestOptions};
pub use config::{ProxyPoolConfig, ProxyPoolConfigBuilder};
pub use error::{Error, SourceError, TransportError, TransportErrorKind};
pub use middleware::ProxyPoolMiddleware;
pub use pool::{PoolStats, ProxyLease, ProxyPool};
pub use proxy::{FailureKind, Proxy, ProxyAddr, ProxyOutcome};
pub use retry::{RequestPolicy, Retrier};
pub use source::{ProxyRecord, ProxySource, ProxyType, SourceSet, UrlSource};
pub use stats::{AttemptRecord, JsonLinesSink, NullSink, StatsSink};
pub use transport::{ReqwestTransport, Transport, TransportSettings};
