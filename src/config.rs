//! Configuration for the proxy pool and the retry loop.

use crate::error::TransportErrorKind;
use crate::source::ProxyType;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Browser-like User-Agent sent when the request does not set one.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:73.0) Gecko/20100101 Firefox/73.0";

/// Configuration for the proxy pool.
#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    /// Source URLs or file paths to fetch proxy lists from.
    pub sources: Vec<String>,
    /// Base cooldown between two uses of the same proxy.
    pub throttle_interval: Duration,
    /// Waits longer than this trigger a replenishment before sleeping.
    pub long_wait_threshold: Duration,
    /// Consecutive failures after which a proxy is quarantined.
    pub quarantine_threshold: usize,
    /// Capability a typed source record must advertise to be used.
    pub required_capability: Option<ProxyType>,
    /// Number of attempts per logical request.
    pub max_attempts: usize,
    /// Timeout for establishing the connection through the proxy.
    pub connect_timeout: Duration,
    /// Timeout for reading the response once connected.
    pub read_timeout: Duration,
    /// User-Agent applied to requests that carry none.
    pub user_agent: String,
    /// Transport failures that make the retry loop pick another proxy.
    pub retryable_errors: HashSet<TransportErrorKind>,
    /// Directory for per-attempt JSON-lines statistics, if any.
    pub stats_dir: Option<PathBuf>,
}

impl ProxyPoolConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ProxyPoolConfigBuilder {
        ProxyPoolConfigBuilder::new()
    }
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        ProxyPoolConfigBuilder::new().build()
    }
}

/// Builder for `ProxyPoolConfig`.
pub struct ProxyPoolConfigBuilder {
    sources: Vec<String>,
    throttle_interval: Option<Duration>,
    long_wait_threshold: Option<Duration>,
    quarantine_threshold: Option<usize>,
    required_capability: Option<Option<ProxyType>>,
    max_attempts: Option<usize>,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    user_agent: Option<String>,
    retryable_errors: Option<HashSet<TransportErrorKind>>,
    stats_dir: Option<PathBuf>,
}

impl ProxyPoolConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            throttle_interval: None,
            long_wait_threshold: None,
            quarantine_threshold: None,
            required_capability: None,
            max_attempts: None,
            connect_timeout: None,
            read_timeout: None,
            user_agent: None,
            retryable_errors: None,
            stats_dir: None,
        }
    }

    /// Set the source URLs or file paths to fetch proxy lists from.
    pub fn sources(mut self, sources: Vec<impl Into<String>>) -> Self {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    /// Set the base cooldown between two uses of the same proxy.
    pub fn throttle_interval(mut self, interval: Duration) -> Self {
        self.throttle_interval = Some(interval);
        self
    }

    /// Set the wait length above which borrowing replenishes the pool first.
    pub fn long_wait_threshold(mut self, threshold: Duration) -> Self {
        self.long_wait_threshold = Some(threshold);
        self
    }

    /// Set the number of consecutive failures that quarantines a proxy.
    pub fn quarantine_threshold(mut self, failures: usize) -> Self {
        self.quarantine_threshold = Some(failures);
        self
    }

    /// Set the capability typed source records must advertise.
    /// `None` accepts every record.
    pub fn required_capability(mut self, capability: Option<ProxyType>) -> Self {
        self.required_capability = Some(capability);
        self
    }

    /// Set the number of attempts per logical request.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the read timeout.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Set the default User-Agent.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Set the transport failures that are retried with another proxy.
    pub fn retryable_errors(mut self, kinds: impl IntoIterator<Item = TransportErrorKind>) -> Self {
        self.retryable_errors = Some(kinds.into_iter().collect());
        self
    }

    /// Write per-attempt statistics into this directory.
    pub fn stats_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.stats_dir = Some(dir.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ProxyPoolConfig {
        ProxyPoolConfig {
            sources: self.sources,
            throttle_interval: self.throttle_interval.unwrap_or(Duration::from_secs(1)),
            long_wait_threshold: self.long_wait_threshold.unwrap_or(Duration::from_secs(30)),
            quarantine_threshold: self.quarantine_threshold.unwrap_or(4),
            required_capability: self
                .required_capability
                .unwrap_or_else(|| Some(ProxyType::new("HTTPS", ""))),
            max_attempts: self.max_attempts.unwrap_or(100),
            connect_timeout: self.connect_timeout.unwrap_or(Duration::from_secs(10)),
            read_timeout: self.read_timeout.unwrap_or(Duration::from_secs(20)),
            user_agent: self.user_agent.unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            retryable_errors: self
                .retryable_errors
                .unwrap_or_else(|| TransportErrorKind::RETRYABLE.into_iter().collect()),
            stats_dir: self.stats_dir,
        }
    }
}

impl Default for ProxyPoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
