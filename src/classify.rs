//! Classification of attempt results into success, retry or fatal.

use crate::error::{TransportError, TransportErrorKind};
use crate::proxy::{FailureKind, ProxyOutcome};

use reqwest::Response;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

type ResponsePredicate = Arc<dyn Fn(&Response) -> bool + Send + Sync>;

/// Caller-supplied rule that turns an otherwise successful response into a retry.
///
/// Useful when the target answers a blocked proxy with a normal response,
/// e.g. a 403 or a captcha page.
#[derive(Clone, Default)]
pub struct RetryTrigger {
    status_codes: HashSet<u16>,
    predicates: Vec<ResponsePredicate>,
}

impl RetryTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retry on any of these status codes.
    pub fn on_status(codes: impl IntoIterator<Item = u16>) -> Self {
        Self::new().status_codes(codes)
    }

    /// Add status codes to retry on.
    pub fn status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.status_codes.extend(codes);
        self
    }

    /// Add a predicate; a response matching any predicate is retried.
    pub fn predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Response) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Arc::new(predicate));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status_codes.is_empty() && self.predicates.is_empty()
    }

    fn matches(&self, response: &Response) -> Option<RetryReason> {
        let status = response.status().as_u16();
        if self.status_codes.contains(&status) {
            return Some(RetryReason::Status(status));
        }
        if self.predicates.iter().any(|predicate| predicate(response)) {
            return Some(RetryReason::Predicate);
        }
        None
    }
}

impl fmt::Debug for RetryTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryTrigger")
            .field("status_codes", &self.status_codes)
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

/// Why an attempt should be repeated with another proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    Transport(TransportErrorKind),
    Status(u16),
    Predicate,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryReason::Transport(kind) => write!(f, "{}", kind),
            RetryReason::Status(code) => write!(f, "retry on status {}", code),
            RetryReason::Predicate => f.write_str("retry predicate matched"),
        }
    }
}

/// Classified result of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Retry(RetryReason),
    Fatal(TransportErrorKind),
}

impl Outcome {
    /// The health signal this outcome sends to the proxy that produced it.
    pub fn proxy_outcome(&self) -> ProxyOutcome {
        match self {
            Outcome::Success => ProxyOutcome::Success,
            Outcome::Retry(RetryReason::Transport(kind)) | Outcome::Fatal(kind) => {
                ProxyOutcome::Failure(FailureKind::Transport(*kind))
            }
            Outcome::Retry(_) => ProxyOutcome::Failure(FailureKind::RetryTrigger),
        }
    }
}

/// Classify a transport result against the retryable kinds and the retry trigger.
pub fn classify(
    result: &Result<Response, TransportError>,
    trigger: &RetryTrigger,
    retryable: &HashSet<TransportErrorKind>,
) -> Outcome {
    match result {
        Err(err) if retryable.contains(&err.kind()) => {
            Outcome::Retry(RetryReason::Transport(err.kind()))
        }
        Err(err) => Outcome::Fatal(err.kind()),
        Ok(response) => match trigger.matches(response) {
            Some(reason) => Outcome::Retry(reason),
            None => Outcome::Success,
        },
    }
}
