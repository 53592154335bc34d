//! Per-provider crawl metrics.
//!
//! Recorded by the crawler for every provider call and served on `/metrics`.

use crate::error::{CrawlerError, ErrorKind};
use crate::providers::ProviderId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};

/// How the calls of one provider were routed.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct RouteCounts {
    pub proxied: u64,
    pub direct: u64,
}

/// Failure causes worth watching separately.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct FailureCounts {
    pub rate_limited: u64,
    pub timeouts: u64,
    pub parse: u64,
    pub other: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderMetrics {
    pub provider: ProviderId,
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub routes: RouteCounts,
    pub failure_causes: FailureCounts,
    /// Summed over successful calls only.
    pub busy_ms: u64,
    pub avg_latency_ms: f64,
    pub last_ok_at: Option<DateTime<Utc>>,
    pub last_err_at: Option<DateTime<Utc>>,
    pub last_err: Option<String>,
}

impl ProviderMetrics {
    pub fn new(provider: ProviderId) -> Self {
        Self {
            provider,
            calls: 0,
            successes: 0,
            failures: 0,
            routes: RouteCounts::default(),
            failure_causes: FailureCounts::default(),
            busy_ms: 0,
            avg_latency_ms: 0.0,
            last_ok_at: None,
            last_err_at: None,
            last_err: None,
        }
    }

    /// Percentage of calls that succeeded; 0 before the first call.
    pub fn success_rate(&self) -> f64 {
        match self.calls {
            0 => 0.0,
            n => self.successes as f64 * 100.0 / n as f64,
        }
    }

    fn count_call(&mut self, proxied: bool) {
        self.calls += 1;
        let slot = if proxied {
            &mut self.routes.proxied
        } else {
            &mut self.routes.direct
        };
        *slot += 1;
    }

    pub fn record_success(&mut self, elapsed: Duration, proxied: bool) {
        self.count_call(proxied);
        self.successes += 1;
        self.busy_ms += u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.avg_latency_ms = self.busy_ms as f64 / self.successes as f64;
        self.last_ok_at = Some(Utc::now());
    }

    pub fn record_failure(&mut self, error: &CrawlerError, proxied: bool) {
        self.count_call(proxied);
        self.failures += 1;
        self.last_err_at = Some(Utc::now());
        self.last_err = Some(error.to_string());

        let causes = &mut self.failure_causes;
        if error.is_rate_limited() {
            causes.rate_limited += 1;
        } else if error.is_timeout() {
            causes.timeouts += 1;
        } else if error.kind() == ErrorKind::Parse {
            causes.parse += 1;
        } else {
            causes.other += 1;
        }
    }
}

/// Shared tracker, one entry per provider that has been called.
#[derive(Default)]
pub struct MetricsTracker {
    by_provider: Mutex<BTreeMap<ProviderId, ProviderMetrics>>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry<R>(&self, provider: ProviderId, f: impl FnOnce(&mut ProviderMetrics) -> R) -> R {
        let mut map = self.by_provider.lock();
        f(map.entry(provider).or_insert_with(|| ProviderMetrics::new(provider)))
    }

    pub fn record_success(&self, provider: ProviderId, elapsed: Duration, proxied: bool) {
        let rate = self.with_entry(provider, |m| {
            m.record_success(elapsed, proxied);
            m.success_rate()
        });
        log::info!(
            "[{}] ok in {}ms ({}), success rate {:.1}%",
            provider,
            elapsed.as_millis(),
            if proxied { "proxied" } else { "direct" },
            rate
        );
    }

    pub fn record_failure(&self, provider: ProviderId, error: &CrawlerError, proxied: bool) {
        let rate = self.with_entry(provider, |m| {
            m.record_failure(error, proxied);
            m.success_rate()
        });
        log::warn!("[{}] failed: {}, success rate {:.1}%", provider, error, rate);
    }

    pub fn get_metrics(&self, provider: ProviderId) -> Option<ProviderMetrics> {
        self.by_provider.lock().get(&provider).cloned()
    }

    /// Snapshot ordered by provider id.
    pub fn get_all_metrics(&self) -> Vec<ProviderMetrics> {
        self.by_provider.lock().values().cloned().collect()
    }
}

/// Times `call` and records its outcome against `provider`.
pub async fn track_request<F, T>(
    tracker: &MetricsTracker,
    provider: ProviderId,
    proxied: bool,
    call: F,
) -> Result<T, CrawlerError>
where
    F: Future<Output = Result<T, CrawlerError>>,
{
    let started = Instant::now();
    let outcome = call.await;
    match &outcome {
        Ok(_) => tracker.record_success(provider, started.elapsed(), proxied),
        Err(e) => tracker.record_failure(provider, e, proxied),
    }
    outcome
}
