//! Proxy representation and throttling schedule.

use crate::error::{Error, TransportErrorKind};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

/// Port assumed when an address string carries none.
pub const DEFAULT_PORT: u16 = 80;

/// Stable identity of an upstream proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyAddr {
    pub host: String,
    pub port: u16,
}

impl ProxyAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Proxy URL understood by `reqwest::Proxy::all`.
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl FromStr for ProxyAddr {
    type Err = Error;

    /// Parse `host:port`; a missing port defaults to 80.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = match s.split_once(':') {
            Some((host, "")) => (host, DEFAULT_PORT),
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| Error::InvalidAddress(s.to_string()))?;
                (host, port)
            }
            None => (s, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(Error::InvalidAddress(s.to_string()));
        }
        Ok(ProxyAddr::new(host, port))
    }
}

impl fmt::Display for ProxyAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Why an attempt through a proxy counted as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The transport failed with this kind.
    Transport(TransportErrorKind),
    /// The response matched the caller's retry trigger.
    RetryTrigger,
    /// The lease was dropped without being finished.
    Abandoned,
}

/// Result of one attempt, as far as the proxy's health is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyOutcome {
    Success,
    Failure(FailureKind),
}

/// Representation of a proxy server and its usage history.
#[derive(Debug, Clone)]
pub struct Proxy {
    addr: ProxyAddr,
    throttle_interval: Duration,
    /// Attempts started through this proxy.
    pub request_count: usize,
    /// Failed attempts.
    pub error_count: usize,
    /// Failed attempts since the last success.
    pub consecutive_error_count: usize,
    /// Cooldown applied by the last schedule computation.
    pub interval: Duration,
    /// Instant after which the proxy may be borrowed again.
    pub next_eligible: Option<Instant>,
    pub last_failure: Option<FailureKind>,
}

impl Proxy {
    /// Create a proxy with zeroed counters.
    pub fn new(addr: ProxyAddr, throttle_interval: Duration) -> Self {
        Self {
            addr,
            throttle_interval,
            request_count: 0,
            error_count: 0,
            consecutive_error_count: 0,
            interval: Duration::ZERO,
            next_eligible: None,
            last_failure: None,
        }
    }

    /// Create a proxy from a literal `host[:port]` string.
    pub fn from_address_string(s: &str, throttle_interval: Duration) -> Result<Self, Error> {
        Ok(Self::new(s.parse()?, throttle_interval))
    }

    pub fn addr(&self) -> &ProxyAddr {
        &self.addr
    }

    /// Compute and store the instant at which this proxy becomes eligible again.
    ///
    /// The cooldown grows linearly with the consecutive failures, plus one base
    /// interval once the proxy has been used at all.
    pub fn compute_schedule_key(&mut self, now: Instant) -> Instant {
        let mut interval = self
            .throttle_interval
            .saturating_mul(self.consecutive_error_count as u32);
        if self.request_count > 0 {
            interval += self.throttle_interval;
        }
        self.interval = interval;
        let at = now + interval;
        self.next_eligible = Some(at);
        at
    }

    /// Record the start of a transport attempt.
    pub fn mark_used(&mut self) {
        self.request_count += 1;
    }

    /// Record the end of a transport attempt.
    pub fn mark_outcome(&mut self, outcome: ProxyOutcome) {
        match outcome {
            ProxyOutcome::Success => self.consecutive_error_count = 0,
            ProxyOutcome::Failure(kind) => {
                self.error_count += 1;
                self.consecutive_error_count += 1;
                self.last_failure = Some(kind);
            }
        }
    }

    /// True once the proxy has failed `threshold` times in a row and never
    /// had a failure interrupted by a success.
    pub fn is_quarantine_candidate(&self, threshold: usize) -> bool {
        self.consecutive_error_count >= threshold
            && self.error_count == self.consecutive_error_count
    }

    /// Fraction of attempts that succeeded.
    pub fn success_rate(&self) -> f64 {
        if self.request_count == 0 {
            return 0.0;
        }
        (self.request_count - self.error_count) as f64 / self.request_count as f64
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} req:{} err:{} seq_err:{}",
            self.addr, self.request_count, self.error_count, self.consecutive_error_count
        )
    }
}
