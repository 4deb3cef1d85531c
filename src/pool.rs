//! Core proxy pool implementation.

use crate::config::ProxyPoolConfig;
use crate::error::Error;
use crate::proxy::{FailureKind, Proxy, ProxyAddr, ProxyOutcome};
use crate::source::{ProxySource, SourceSet};

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{self, Instant};

/// Counts of proxies in each state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Waiting in the schedule.
    pub eligible: usize,
    /// Currently held by a lease.
    pub on_loan: usize,
    /// Removed from circulation for good.
    pub quarantined: usize,
}

/// A proxy waiting in the schedule.
struct Scheduled {
    at: Instant,
    seq: u64,
    proxy: Proxy,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed so the max-heap pops the earliest instant, then the oldest insertion.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct PoolState {
    eligible: BinaryHeap<Scheduled>,
    quarantined: Vec<Proxy>,
    /// Addresses that are eligible or on loan.
    live: HashSet<ProxyAddr>,
    next_seq: u64,
}

impl PoolState {
    fn schedule(&mut self, mut proxy: Proxy, now: Instant) {
        let at = proxy.compute_schedule_key(now);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.eligible.push(Scheduled { at, seq, proxy });
    }

    fn on_loan(&self) -> usize {
        self.live.len() - self.eligible.len()
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            eligible: self.eligible.len(),
            on_loan: self.on_loan(),
            quarantined: self.quarantined.len(),
        }
    }
}

/// A pool of proxies handed out earliest-eligible first.
pub struct ProxyPool {
    state: Mutex<PoolState>,
    /// Woken whenever a proxy enters the schedule or the pool runs dry.
    returned: Notify,
    source: Arc<dyn ProxySource>,
    /// Configuration for the pool.
    pub config: ProxyPoolConfig,
}

impl ProxyPool {
    /// Create a pool fed by the sources listed in the configuration.
    pub async fn new(config: ProxyPoolConfig) -> Result<Arc<Self>, Error> {
        let source = Arc::new(SourceSet::from_locations(&config.sources));
        Self::with_source(config, source).await
    }

    /// Create a pool fed by a custom proxy source.
    pub async fn with_source(
        config: ProxyPoolConfig,
        source: Arc<dyn ProxySource>,
    ) -> Result<Arc<Self>, Error> {
        let pool = Arc::new(Self::empty(config, source));
        pool.replenish(None).await?;
        pool.ensure_populated()?;
        Ok(pool)
    }

    /// Create a pool seeded with literal `host[:port]` addresses.
    ///
    /// Later replenishments still go to the configured sources.
    pub async fn from_addresses(
        config: ProxyPoolConfig,
        addresses: &[&str],
    ) -> Result<Arc<Self>, Error> {
        let source = Arc::new(SourceSet::from_locations(&config.sources));
        let pool = Arc::new(Self::empty(config, source));
        pool.replenish(Some(addresses)).await?;
        pool.ensure_populated()?;
        Ok(pool)
    }

    fn empty(config: ProxyPoolConfig, source: Arc<dyn ProxySource>) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            returned: Notify::new(),
            source,
            config,
        }
    }

    fn ensure_populated(&self) -> Result<(), Error> {
        let stats = self.get_stats();
        info!("Initial proxy pool status: {} eligible proxies", stats.eligible);
        if stats.eligible == 0 {
            return Err(Error::NoProxies);
        }
        Ok(())
    }

    /// Add proxies from `explicit` addresses, or from the proxy source.
    ///
    /// Addresses already eligible or on loan are skipped. Returns the number of
    /// proxies added.
    pub async fn replenish(&self, explicit: Option<&[&str]>) -> Result<usize, Error> {
        let throttle = self.config.throttle_interval;
        let candidates = match explicit {
            Some(addresses) => addresses
                .iter()
                .map(|s| Proxy::from_address_string(s, throttle))
                .collect::<Result<Vec<_>, _>>()?,
            None => {
                let records = self.source.fetch().await?;
                let fetched = records.len();
                let capability = self.config.required_capability.as_ref();
                let proxies: Vec<Proxy> = records
                    .into_iter()
                    .filter(|record| record.supports(capability))
                    .map(|record| Proxy::new(record.addr(), throttle))
                    .collect();
                info!(
                    "{} of {} fetched proxies advertise the required capability",
                    proxies.len(),
                    fetched
                );
                proxies
            }
        };

        let added = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let mut added = 0;
            for proxy in candidates {
                if !state.live.insert(proxy.addr().clone()) {
                    continue;
                }
                state.schedule(proxy, now);
                added += 1;
            }
            added
        };

        if added > 0 {
            self.returned.notify_waiters();
        }
        let stats = self.get_stats();
        info!(
            "Replenished {} proxies, eligible:{} used:{} bad:{}",
            added, stats.eligible, stats.on_loan, stats.quarantined
        );
        Ok(added)
    }

    /// Borrow the proxy that becomes eligible first, waiting until it is.
    ///
    /// When every proxy is on loan this waits for one to come back. Fails with
    /// [`Error::PoolExhausted`] once no proxy is eligible and none is on loan.
    pub async fn borrow(self: &Arc<Self>) -> Result<ProxyLease, Error> {
        let Scheduled { at, proxy, .. } = loop {
            let notified = self.returned.notified();
            {
                let mut state = self.state.lock();
                if let Some(entry) = state.eligible.pop() {
                    break entry;
                }
                if state.on_loan() == 0 {
                    warn!("No proxy available. Quarantined: {}", state.quarantined.len());
                    return Err(Error::PoolExhausted);
                }
            }
            debug!("All proxies on loan, waiting for one to be returned");
            notified.await;
        };

        // Owned by the lease from here on, so cancelling the wait puts it back.
        let mut lease = ProxyLease {
            pool: Arc::clone(self),
            proxy: Some(proxy),
            started: false,
        };

        let wait = at.saturating_duration_since(Instant::now());
        info!("Got proxy {} waiting {:?}", lease.proxy(), wait);
        if wait > self.config.long_wait_threshold {
            warn!("Waiting time {:?} exceeds {:?}, retrieving more proxies", wait, self.config.long_wait_threshold);
            if let Err(e) = self.replenish(None).await {
                warn!("Failed to replenish proxy pool: {}", e);
            }
        }
        time::sleep_until(at).await;

        if let Some(proxy) = lease.proxy.as_mut() {
            proxy.mark_used();
            debug!("{} waiting done", proxy);
        }
        lease.started = true;
        Ok(lease)
    }

    /// Put back a proxy whose borrower gave up before using it, keeping its slot.
    fn restore(&self, proxy: Proxy) {
        {
            let mut state = self.state.lock();
            let at = proxy.next_eligible.unwrap_or_else(Instant::now);
            let seq = state.next_seq;
            state.next_seq += 1;
            state.eligible.push(Scheduled { at, seq, proxy });
        }
        self.returned.notify_waiters();
    }

    /// Take back a borrowed proxy, quarantining or rescheduling it.
    fn give_back(&self, mut proxy: Proxy, outcome: ProxyOutcome) {
        proxy.mark_outcome(outcome);

        let stats = {
            let mut state = self.state.lock();
            if proxy.is_quarantine_candidate(self.config.quarantine_threshold) {
                warn!("Quarantining proxy {}", proxy);
                state.live.remove(proxy.addr());
                state.quarantined.push(proxy);
            } else {
                debug!("Putting back proxy {}", proxy);
                state.schedule(proxy, Instant::now());
            }
            state.stats()
        };

        // Waiters also need to hear about a quarantine: it may have exhausted the pool.
        self.returned.notify_waiters();
        info!(
            "Proxy returned, eligible:{} used:{} bad:{}",
            stats.eligible, stats.on_loan, stats.quarantined
        );
    }

    /// Get statistics about the proxy pool.
    pub fn get_stats(&self) -> PoolStats {
        self.state.lock().stats()
    }

    /// Addresses of quarantined proxies, oldest first.
    pub fn quarantined(&self) -> Vec<ProxyAddr> {
        self.state
            .lock()
            .quarantined
            .iter()
            .map(|proxy| proxy.addr().clone())
            .collect()
    }
}

/// Exclusive use of one proxy, returned to the pool when finished or dropped.
pub struct ProxyLease {
    pool: Arc<ProxyPool>,
    proxy: Option<Proxy>,
    /// Set once the throttle wait is over and the proxy counts as used.
    started: bool,
}

impl std::fmt::Debug for ProxyLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyLease")
            .field("proxy", &self.proxy)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl ProxyLease {
    pub fn proxy(&self) -> &Proxy {
        // Only `finish` and `drop` take the proxy, and both consume the lease.
        self.proxy.as_ref().unwrap_or_else(|| unreachable!("lease already returned"))
    }

    pub fn addr(&self) -> &ProxyAddr {
        self.proxy().addr()
    }

    /// Return the proxy with the outcome of the attempt.
    pub fn finish(mut self, outcome: ProxyOutcome) {
        if let Some(proxy) = self.proxy.take() {
            self.pool.give_back(proxy, outcome);
        }
    }
}

impl Drop for ProxyLease {
    fn drop(&mut self) {
        let Some(proxy) = self.proxy.take() else {
            return;
        };
        if !self.started {
            debug!("Borrow of {} cancelled while waiting", proxy.addr());
            self.pool.restore(proxy);
            return;
        }
        warn!("Proxy {} abandoned without an outcome", proxy.addr());
        self.pool
            .give_back(proxy, ProxyOutcome::Failure(FailureKind::Abandoned));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SourceError, TransportErrorKind};
    use crate::source::{ProxyRecord, ProxyType};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    const FAIL: ProxyOutcome =
        ProxyOutcome::Failure(FailureKind::Transport(TransportErrorKind::ConnectTimeout));

    struct FixedSource {
        records: Vec<ProxyRecord>,
        calls: AtomicUsize,
    }

    impl FixedSource {
        fn new(records: Vec<ProxyRecord>) -> Arc<Self> {
            Arc::new(Self {
                records,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ProxySource for FixedSource {
        async fn fetch(&self) -> Result<Vec<ProxyRecord>, SourceError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(self.records.clone())
        }
    }

    fn record(host: &str, kind: &str) -> ProxyRecord {
        ProxyRecord {
            host: host.to_string(),
            port: 3128,
            types: vec![ProxyType::new(kind, "")],
        }
    }

    async fn pool_of(addresses: &[&str]) -> Arc<ProxyPool> {
        ProxyPool::from_addresses(ProxyPoolConfig::default(), addresses)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn empty_source_fails_construction() {
        let result = ProxyPool::with_source(ProxyPoolConfig::default(), FixedSource::new(vec![])).await;
        assert!(matches!(result, Err(Error::NoProxies)));
    }

    #[tokio::test]
    async fn source_records_are_filtered_by_capability() {
        let source = FixedSource::new(vec![record("1.1.1.1", "HTTPS"), record("2.2.2.2", "SOCKS5")]);
        let pool = ProxyPool::with_source(ProxyPoolConfig::default(), source).await.unwrap();
        assert_eq!(pool.get_stats().eligible, 1);

        let lease = pool.borrow().await.unwrap();
        assert_eq!(lease.addr().host, "1.1.1.1");
    }

    #[tokio::test(start_paused = true)]
    async fn borrow_waits_until_eligible() {
        let pool = pool_of(&["10.0.0.1:8080"]).await;

        let lease = pool.borrow().await.unwrap();
        assert_eq!(lease.proxy().request_count, 1);
        lease.finish(FAIL);

        // One failure plus one prior use: two base intervals.
        let start = Instant::now();
        let lease = pool.borrow().await.unwrap();
        assert!(Instant::now() - start >= Duration::from_secs(2));
        assert!(lease.proxy().next_eligible.unwrap() <= Instant::now());
        lease.finish(ProxyOutcome::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn earliest_eligible_is_served_first() {
        let pool = pool_of(&["10.0.0.1:8080", "10.0.0.2:8080"]).await;

        let first = pool.borrow().await.unwrap();
        let second = pool.borrow().await.unwrap();
        assert_eq!(first.addr().host, "10.0.0.1");
        assert_eq!(second.addr().host, "10.0.0.2");

        // A failing proxy is pushed further out than a healthy one.
        first.finish(FAIL);
        second.finish(ProxyOutcome::Success);
        let next = pool.borrow().await.unwrap();
        assert_eq!(next.addr().host, "10.0.0.2");
        next.finish(ProxyOutcome::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn third_borrower_waits_for_a_return() {
        let pool = pool_of(&["10.0.0.1:8080", "10.0.0.2:8080"]).await;

        let first = pool.borrow().await.unwrap();
        let second = pool.borrow().await.unwrap();
        assert_ne!(first.addr(), second.addr());

        let waiter = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.borrow().await.map(|lease| lease.addr().clone()) }
        });

        time::sleep(Duration::from_secs(60)).await;
        assert!(!waiter.is_finished());
        assert_eq!(pool.get_stats().on_loan, 2);

        let returned = first.addr().clone();
        first.finish(ProxyOutcome::Success);

        let borrowed = waiter.await.unwrap().unwrap();
        assert_eq!(borrowed, returned);
        // The waiter's lease was dropped inside the task and came back.
        assert_eq!(pool.get_stats().on_loan, 1);
        drop(second);
    }

    #[tokio::test(start_paused = true)]
    async fn four_straight_failures_quarantine_for_good() {
        let pool = pool_of(&["10.0.0.1:8080", "10.0.0.2:8080"]).await;

        let mut failures = 0;
        while failures < 4 {
            let lease = pool.borrow().await.unwrap();
            if lease.addr().host == "10.0.0.1" {
                lease.finish(FAIL);
                failures += 1;
            } else {
                lease.finish(ProxyOutcome::Success);
            }
        }

        assert_eq!(pool.quarantined(), vec![ProxyAddr::new("10.0.0.1", 8080)]);
        for _ in 0..10 {
            let lease = pool.borrow().await.unwrap();
            assert_eq!(lease.addr().host, "10.0.0.2");
            lease.finish(ProxyOutcome::Success);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn quarantining_the_last_proxy_exhausts_the_pool() {
        let pool = pool_of(&["10.0.0.1:8080"]).await;
        for _ in 0..4 {
            assert_ok!(pool.borrow().await).finish(FAIL);
        }
        assert_eq!(
            pool.get_stats(),
            PoolStats { eligible: 0, on_loan: 0, quarantined: 1 }
        );
        assert!(matches!(assert_err!(pool.borrow().await), Error::PoolExhausted));

        // A fresh instance with the same address starts over.
        assert_eq!(pool.replenish(Some(&["10.0.0.1:8080"])).await.unwrap(), 1);
        let lease = pool.borrow().await.unwrap();
        assert_eq!(lease.proxy().error_count, 0);
        assert_eq!(lease.proxy().request_count, 1);
        lease.finish(ProxyOutcome::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_is_told_when_pool_runs_dry() {
        let config = ProxyPoolConfig::builder().quarantine_threshold(1).build();
        let pool = ProxyPool::from_addresses(config, &["10.0.0.1:8080"]).await.unwrap();

        let lease = pool.borrow().await.unwrap();
        let waiter = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.borrow().await.map(|_| ()) }
        });
        time::sleep(Duration::from_secs(1)).await;

        lease.finish(FAIL);
        assert!(matches!(waiter.await.unwrap(), Err(Error::PoolExhausted)));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_below_threshold_is_counted_and_reinserted() {
        let pool = pool_of(&["10.0.0.1:8080"]).await;
        let lease = pool.borrow().await.unwrap();
        lease.finish(ProxyOutcome::Failure(FailureKind::Transport(TransportErrorKind::Other)));

        assert_eq!(pool.get_stats().eligible, 1);
        let lease = pool.borrow().await.unwrap();
        assert_eq!(lease.proxy().error_count, 1);
        assert_eq!(lease.proxy().consecutive_error_count, 1);
        lease.finish(ProxyOutcome::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_lease_is_returned_as_failure() {
        let pool = pool_of(&["10.0.0.1:8080"]).await;
        drop(pool.borrow().await.unwrap());

        assert_eq!(pool.get_stats().on_loan, 0);
        let lease = pool.borrow().await.unwrap();
        assert_eq!(lease.proxy().last_failure, Some(FailureKind::Abandoned));
        lease.finish(ProxyOutcome::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wait_keeps_the_proxy_in_circulation() {
        let pool = pool_of(&["10.0.0.1:8080"]).await;
        pool.borrow().await.unwrap().finish(FAIL);
        let due = Instant::now() + Duration::from_secs(2);

        let cancelled = time::timeout(Duration::from_secs(1), pool.borrow()).await;
        assert!(cancelled.is_err());
        assert_eq!(
            pool.get_stats(),
            PoolStats { eligible: 1, on_loan: 0, quarantined: 0 }
        );

        // Same slot, counters untouched by the cancelled borrow.
        let lease = time::timeout(Duration::from_secs(10), pool.borrow())
            .await
            .unwrap()
            .unwrap();
        assert!(Instant::now() >= due);
        assert!(Instant::now() < due + Duration::from_secs(1));
        assert_eq!(lease.proxy().request_count, 2);
        assert_eq!(lease.proxy().error_count, 1);
        lease.finish(ProxyOutcome::Success);
        assert_eq!(pool.replenish(Some(&["10.0.0.1:8080"])).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn long_wait_triggers_replenishment() {
        let source = FixedSource::new(vec![record("1.1.1.1", "HTTPS")]);
        let config = ProxyPoolConfig::builder()
            .throttle_interval(Duration::from_secs(20))
            .build();
        let pool = ProxyPool::with_source(config, source.clone()).await.unwrap();
        assert_eq!(source.calls.load(AtomicOrdering::SeqCst), 1);

        pool.borrow().await.unwrap().finish(FAIL);
        // Next use is 40s out, beyond the 30s threshold.
        let lease = pool.borrow().await.unwrap();
        assert_eq!(source.calls.load(AtomicOrdering::SeqCst), 2);
        // The only address is on loan while the source runs, so nothing new is added.
        assert_eq!(pool.get_stats().eligible, 0);
        lease.finish(ProxyOutcome::Success);
    }

    #[tokio::test]
    async fn replenish_skips_live_addresses() {
        let pool = pool_of(&["10.0.0.1:8080"]).await;
        let added = pool
            .replenish(Some(&["10.0.0.1:8080", "10.0.0.2", "10.0.0.2:80"]))
            .await
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(pool.get_stats().eligible, 2);
        assert!(matches!(
            pool.replenish(Some(&["bad:port"])).await,
            Err(Error::InvalidAddress(_))
        ));
    }
}
