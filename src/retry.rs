//! Retry loop driving one logical request across proxies.

use crate::classify::{classify, Outcome, RetryTrigger};
use crate::error::Error;
use crate::pool::ProxyPool;
use crate::stats::{unix_now, AttemptRecord, JsonLinesSink, NullSink, StatsSink};
use crate::transport::{Transport, TransportSettings};

use log::{info, warn};
use std::sync::Arc;
use tokio::time::Instant;

/// Per-request retry settings.
#[derive(Debug, Clone)]
pub struct RequestPolicy {
    /// Reclassifies successful responses as retries.
    pub retry_on: RetryTrigger,
    pub follow_redirects: bool,
}

impl Default for RequestPolicy {
    fn default() -> Self {
        Self {
            retry_on: RetryTrigger::new(),
            follow_redirects: true,
        }
    }
}

/// Runs requests through the pool, switching proxy on every retryable failure.
#[derive(Clone)]
pub struct Retrier {
    pool: Arc<ProxyPool>,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn StatsSink>,
}

impl Retrier {
    pub fn new(pool: Arc<ProxyPool>, transport: Arc<dyn Transport>) -> Self {
        Self {
            pool,
            transport,
            sink: Arc::new(NullSink),
        }
    }

    /// Create a retry loop that writes attempt statistics to the pool's
    /// configured stats directory, if any.
    pub fn with_configured_stats(pool: Arc<ProxyPool>, transport: Arc<dyn Transport>) -> Self {
        let stats_dir = pool.config.stats_dir.clone();
        let retrier = Self::new(pool, transport);
        let Some(dir) = stats_dir else {
            return retrier;
        };
        match JsonLinesSink::create(&dir) {
            Ok(sink) => retrier.with_sink(Arc::new(sink)),
            Err(e) => {
                warn!("Stats disabled, cannot write to {}: {}", dir.display(), e);
                retrier
            }
        }
    }

    /// Report every attempt to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn StatsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    /// Execute `request`, retrying with other proxies until it succeeds, fails
    /// fatally, or the attempt budget runs out.
    pub async fn execute(
        &self,
        request: reqwest::Request,
        policy: &RequestPolicy,
    ) -> Result<reqwest::Response, Error> {
        let config = &self.pool.config;
        let max_attempts = config.max_attempts;
        let settings = TransportSettings::from_config(config, policy.follow_redirects);
        let method = request.method().to_string();
        let url = request.url().to_string();

        for attempt in 0..max_attempts {
            let attempt_request = request.try_clone().ok_or(Error::RequestNotCloneable)?;
            let lease = self.pool.borrow().await?;
            let proxy_addr = lease.addr().clone();
            info!(
                "Processing method={} url={} try_num={}/{} proxy={}",
                method, url, attempt, max_attempts, proxy_addr
            );

            let start = Instant::now();
            let result = self
                .transport
                .execute(attempt_request, &proxy_addr, &settings)
                .await;
            let elapsed = start.elapsed();
            let outcome = classify(&result, &policy.retry_on, &config.retryable_errors);

            let status = result.as_ref().ok().map(|r| r.status().as_u16());
            let description = match (&outcome, &result) {
                (Outcome::Success, _) => String::new(),
                (_, Err(e)) => e.to_string(),
                (Outcome::Retry(reason), Ok(_)) => reason.to_string(),
                (Outcome::Fatal(kind), Ok(_)) => kind.to_string(),
            };

            let proxy_outcome = outcome.proxy_outcome();
            let mut snapshot = lease.proxy().clone();
            snapshot.mark_outcome(proxy_outcome);
            lease.finish(proxy_outcome);

            let record = AttemptRecord {
                method: method.clone(),
                url: url.clone(),
                attempt,
                max_attempts,
                proxy: proxy_addr.to_string(),
                requests: snapshot.request_count,
                errors: snapshot.error_count,
                seq_errors: snapshot.consecutive_error_count,
                elapsed_secs: elapsed.as_secs_f64(),
                status,
                outcome: description,
                timestamp: unix_now(),
            };
            self.sink.record(&record);

            match outcome {
                Outcome::Success => {
                    info!(
                        "Finished processing method={} url={} proxy={} status_code={:?}",
                        method, url, proxy_addr, status
                    );
                    return result.map_err(Error::from);
                }
                Outcome::Retry(_) => {
                    warn!(
                        "Exception {} while processing method={} url={} try_num={}/{} proxy={}",
                        record.outcome, method, url, attempt, max_attempts, proxy_addr
                    );
                }
                Outcome::Fatal(_) => {
                    warn!(
                        "Fatal error {} while processing method={} url={} proxy={}",
                        record.outcome, method, url, proxy_addr
                    );
                    return result.map_err(Error::from);
                }
            }
        }

        warn!("Giving up on {} {} after {} attempts", method, url, max_attempts);
        Err(Error::RetriesExhausted {
            attempts: max_attempts,
        })
    }
}
