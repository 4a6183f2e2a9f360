//! Per-provider circuit breakers.
//!
//! Breaker state lives outside the configuration snapshot, so it survives reloads. Every
//! critical section is synchronous arithmetic under a `parking_lot` lock; nothing here awaits.

use std::{collections::VecDeque, fmt, sync::Arc};

use config::BreakerConfig;
use dashmap::DashMap;
use opentelemetry::{KeyValue, metrics::Counter};
use parking_lot::Mutex;
use telemetry::metrics::CONDUIT_BREAKER_TRANSITIONS;
use tokio::time::Instant;

use crate::error::ErrorCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerStatus::Closed => "closed",
            BreakerStatus::Open => "open",
            BreakerStatus::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for BreakerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct Breaker {
    status: BreakerStatus,
    /// Outcomes inside the trailing window, `true` for failures.
    outcomes: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Breaker {
    fn new() -> Self {
        Self {
            status: BreakerStatus::Closed,
            outcomes: VecDeque::new(),
            opened_at: None,
            probe_in_flight: false,
        }
    }

    fn prune(&mut self, config: &BreakerConfig, now: Instant) {
        while let Some((at, _)) = self.outcomes.front() {
            if now.saturating_duration_since(*at) > config.window {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn cooled_down(&self, config: &BreakerConfig, now: Instant) -> bool {
        self.opened_at
            .is_none_or(|opened_at| now.saturating_duration_since(opened_at) >= config.cooldown)
    }

    /// Whether a selection could take this provider right now.
    fn eligible(&self, config: &BreakerConfig, now: Instant) -> bool {
        match self.status {
            BreakerStatus::Closed => true,
            BreakerStatus::Open => self.cooled_down(config, now),
            BreakerStatus::HalfOpen => !self.probe_in_flight,
        }
    }

    fn open(&mut self, now: Instant) {
        self.status = BreakerStatus::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
    }

    fn close(&mut self) {
        self.status = BreakerStatus::Closed;
        self.opened_at = None;
        self.probe_in_flight = false;
        self.outcomes.clear();
    }
}

/// Breaker registry keyed by provider id.
pub struct CircuitBreakers {
    breakers: DashMap<String, Arc<Mutex<Breaker>>>,
    transitions: Counter<u64>,
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self {
            breakers: DashMap::new(),
            transitions: telemetry::metrics::meter()
                .u64_counter(CONDUIT_BREAKER_TRANSITIONS)
                .build(),
        }
    }
}

impl CircuitBreakers {
    pub fn new() -> Self {
        Self::default()
    }

    fn breaker(&self, provider: &str) -> Arc<Mutex<Breaker>> {
        if let Some(breaker) = self.breakers.get(provider) {
            return breaker.clone();
        }

        self.breakers
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Breaker::new())))
            .clone()
    }

    fn transition(&self, provider: &str, from: BreakerStatus, to: BreakerStatus) {
        if from == to {
            return;
        }

        match to {
            BreakerStatus::Open => log::warn!("Circuit breaker for provider '{provider}' opened (was {from})"),
            _ => log::info!("Circuit breaker for provider '{provider}' moved from {from} to {to}"),
        }

        self.transitions.add(
            1,
            &[
                KeyValue::new("conduit.provider", provider.to_string()),
                KeyValue::new("conduit.breaker.from", from.as_str()),
                KeyValue::new("conduit.breaker.to", to.as_str()),
            ],
        );
    }

    /// Current status, without observing cooldown expiry.
    pub fn status(&self, provider: &str) -> BreakerStatus {
        self.breakers
            .get(provider)
            .map(|breaker| breaker.lock().status)
            .unwrap_or(BreakerStatus::Closed)
    }

    /// Non-mutating eligibility check used to filter candidates.
    pub fn is_eligible(&self, provider: &str, config: &BreakerConfig, now: Instant) -> bool {
        self.breakers
            .get(provider)
            .is_none_or(|breaker| breaker.lock().eligible(config, now))
    }

    /// Takes a permit for one request to `provider`.
    ///
    /// An open breaker whose cooldown has elapsed moves to half-open here and hands out its
    /// single probe. Returns `None` when the provider may not be used.
    pub fn try_acquire(
        self: &Arc<Self>,
        provider: &str,
        config: &BreakerConfig,
        now: Instant,
    ) -> Option<BreakerPermit> {
        let breaker = self.breaker(provider);

        let (probe, from, to) = {
            let mut state = breaker.lock();
            let from = state.status;

            let probe = match state.status {
                BreakerStatus::Closed => false,
                BreakerStatus::Open if state.cooled_down(config, now) => {
                    state.status = BreakerStatus::HalfOpen;
                    state.probe_in_flight = true;
                    true
                }
                BreakerStatus::HalfOpen if !state.probe_in_flight => {
                    state.probe_in_flight = true;
                    true
                }
                BreakerStatus::Open | BreakerStatus::HalfOpen => return None,
            };

            (probe, from, state.status)
        };

        self.transition(provider, from, to);

        Some(BreakerPermit {
            breakers: self.clone(),
            breaker,
            provider: provider.to_string(),
            config: config.clone(),
            probe,
            settled: false,
        })
    }

    fn record(&self, permit: &BreakerPermit, failure: bool, now: Instant) {
        let config = &permit.config;

        let (from, to) = {
            let mut state = permit.breaker.lock();
            let from = state.status;

            match state.status {
                BreakerStatus::HalfOpen if permit.probe => {
                    if failure {
                        state.open(now);
                    } else {
                        state.close();
                    }
                }
                BreakerStatus::Closed => {
                    state.outcomes.push_back((now, failure));
                    state.prune(config, now);

                    let total = state.outcomes.len();
                    let failures = state.outcomes.iter().filter(|(_, failed)| *failed).count();

                    if total >= config.min_requests as usize
                        && total > 0
                        && failures as f64 / total as f64 > config.failure_threshold
                    {
                        state.open(now);
                        state.outcomes.clear();
                    }
                }
                // A request admitted before the breaker opened finished late.
                BreakerStatus::Open | BreakerStatus::HalfOpen => (),
            }

            (from, state.status)
        };

        self.transition(&permit.provider, from, to);
    }

    /// Drops breakers of providers no longer configured.
    pub fn retain<F>(&self, mut keep: F)
    where
        F: FnMut(&str) -> bool,
    {
        self.breakers.retain(|id, _| keep(id));
    }
}

/// The right to send one request to a provider, held by a selection.
///
/// Record the outcome with [`BreakerPermit::success`] or [`BreakerPermit::failure`]. Dropping
/// the permit without an outcome, e.g. on client cancel, releases a held probe and leaves the
/// breaker state untouched.
pub struct BreakerPermit {
    breakers: Arc<CircuitBreakers>,
    breaker: Arc<Mutex<Breaker>>,
    provider: String,
    config: BreakerConfig,
    probe: bool,
    settled: bool,
}

impl fmt::Debug for BreakerPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerPermit")
            .field("provider", &self.provider)
            .field("probe", &self.probe)
            .finish_non_exhaustive()
    }
}

impl BreakerPermit {
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(self) {
        self.settle(None);
    }

    pub fn failure(self, category: ErrorCategory) {
        self.settle(Some(category));
    }

    /// Records an outcome. Categories that do not trip the breaker count as successes.
    pub fn settle(mut self, failure: Option<ErrorCategory>) {
        self.settled = true;

        let failed = failure.is_some_and(ErrorCategory::trips_breaker);
        self.breakers.record(&self, failed, Instant::now());
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if self.settled || !self.probe {
            return;
        }

        let mut state = self.breaker.lock();

        if state.status == BreakerStatus::HalfOpen {
            log::debug!("Releasing unfinished probe for provider '{}'", self.provider);
            state.probe_in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 0.5,
            window: Duration::from_secs(60),
            min_requests: 5,
            cooldown: Duration::from_secs(30),
        }
    }

    fn fail_n(breakers: &Arc<CircuitBreakers>, n: usize) {
        for _ in 0..n {
            breakers
                .try_acquire("p", &config(), Instant::now())
                .unwrap()
                .failure(ErrorCategory::Provider5xx);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn trips_then_recovers_through_probe() {
        let breakers = Arc::new(CircuitBreakers::new());

        fail_n(&breakers, 4);
        assert_eq!(breakers.status("p"), BreakerStatus::Closed);

        fail_n(&breakers, 1);
        assert_eq!(breakers.status("p"), BreakerStatus::Open);
        assert!(breakers.try_acquire("p", &config(), Instant::now()).is_none());

        tokio::time::advance(Duration::from_secs(30)).await;

        let probe = breakers.try_acquire("p", &config(), Instant::now()).unwrap();
        assert!(probe.is_probe());
        assert_eq!(breakers.status("p"), BreakerStatus::HalfOpen);

        // Concurrent selections skip the provider while the probe is out.
        assert!(!breakers.is_eligible("p", &config(), Instant::now()));
        assert!(breakers.try_acquire("p", &config(), Instant::now()).is_none());

        probe.success();
        assert_eq!(breakers.status("p"), BreakerStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens() {
        let breakers = Arc::new(CircuitBreakers::new());

        fail_n(&breakers, 5);
        tokio::time::advance(Duration::from_secs(31)).await;

        breakers
            .try_acquire("p", &config(), Instant::now())
            .unwrap()
            .failure(ErrorCategory::Timeout);

        assert_eq!(breakers.status("p"), BreakerStatus::Open);

        // opened_at was reset, so the cooldown starts over.
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!breakers.is_eligible("p", &config(), Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_probe_is_released() {
        let breakers = Arc::new(CircuitBreakers::new());

        fail_n(&breakers, 5);
        tokio::time::advance(Duration::from_secs(30)).await;

        let probe = breakers.try_acquire("p", &config(), Instant::now()).unwrap();
        drop(probe);

        assert_eq!(breakers.status("p"), BreakerStatus::HalfOpen);
        assert!(breakers.try_acquire("p", &config(), Instant::now()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_do_not_trip() {
        let breakers = Arc::new(CircuitBreakers::new());

        for _ in 0..10 {
            breakers
                .try_acquire("p", &config(), Instant::now())
                .unwrap()
                .failure(ErrorCategory::Provider4xx);
        }

        assert_eq!(breakers.status("p"), BreakerStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn old_outcomes_leave_the_window() {
        let breakers = Arc::new(CircuitBreakers::new());

        fail_n(&breakers, 4);
        tokio::time::advance(Duration::from_secs(61)).await;

        for _ in 0..4 {
            breakers.try_acquire("p", &config(), Instant::now()).unwrap().success();
        }
        fail_n(&breakers, 1);

        // 1 failure of 5 in the window.
        assert_eq!(breakers.status("p"), BreakerStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn ratio_must_exceed_the_threshold() {
        let breakers = Arc::new(CircuitBreakers::new());
        let config = BreakerConfig {
            min_requests: 4,
            ..config()
        };

        for _ in 0..2 {
            breakers.try_acquire("p", &config, Instant::now()).unwrap().success();
        }
        for _ in 0..2 {
            breakers
                .try_acquire("p", &config, Instant::now())
                .unwrap()
                .failure(ErrorCategory::Provider5xx);
        }

        // Exactly 0.5.
        assert_eq!(breakers.status("p"), BreakerStatus::Closed);

        breakers
            .try_acquire("p", &config, Instant::now())
            .unwrap()
            .failure(ErrorCategory::Timeout);

        assert_eq!(breakers.status("p"), BreakerStatus::Open);
    }
}
