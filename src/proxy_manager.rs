//! Weighted proxy selection with failure-driven cooldown.
//!
//! Weights come from each proxy's history: `100 + successes - 10 * failures`,
//! floored at 10 so no eligible proxy ever drops to zero probability. Once
//! `fail_threshold` consecutive failures accumulate the proxy cools down for
//! `cooldown`; expiry is checked lazily on the next [`ProxyManager::pick`].

use crate::error::{CrawlerError, StoreError};
use crate::models::{ProxyConfig, ProxyState, ProxyStateUpdate};
use crate::proxy_store::ProxyStore;
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

const BASE_SCORE: i64 = 100;
const MIN_SCORE: i64 = 10;
const SUCCESS_WEIGHT: i64 = 1;
const FAILURE_WEIGHT: i64 = 10;

pub const DEFAULT_FAIL_THRESHOLD: u32 = 3;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct ProxyManagerOptions {
    pub fail_threshold: u32,
    pub cooldown: Duration,
    pub default_proxies: Vec<ProxyConfig>,
}

impl Default for ProxyManagerOptions {
    fn default() -> Self {
        Self {
            fail_threshold: DEFAULT_FAIL_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
            default_proxies: Vec::new(),
        }
    }
}

/// Selection weight for a proxy given its history.
pub fn proxy_weight(state: &ProxyState) -> u64 {
    let score = BASE_SCORE + i64::from(state.success_count) * SUCCESS_WEIGHT
        - i64::from(state.fail_count) * FAILURE_WEIGHT;
    score.max(MIN_SCORE) as u64
}

/// Draws one candidate with probability proportional to its weight.
///
/// `ticket` is uniform in `[0, total)`; candidates are walked subtracting
/// their weight until the remainder drops below zero. The last candidate is
/// the fallback, so a non-empty slice always yields a selection.
pub fn select_weighted<'a, R: Rng + ?Sized>(
    candidates: &'a [ProxyState],
    rng: &mut R,
) -> Option<&'a ProxyState> {
    let weights: Vec<u64> = candidates.iter().map(proxy_weight).collect();
    let total: u64 = weights.iter().sum();
    if total == 0 {
        return candidates.last();
    }
    let mut ticket = rng.gen_range(0..total) as i64;
    for (candidate, weight) in candidates.iter().zip(&weights) {
        ticket -= *weight as i64;
        if ticket < 0 {
            return Some(candidate);
        }
    }
    candidates.last()
}

pub struct ProxyManager {
    store: Arc<ProxyStore>,
    fail_threshold: u32,
    cooldown_ms: i64,
}

impl ProxyManager {
    /// Builds the manager and registers `options.default_proxies`. A zero
    /// `fail_threshold` is rejected.
    pub fn new(store: Arc<ProxyStore>, options: ProxyManagerOptions) -> Result<Self, CrawlerError> {
        if options.fail_threshold == 0 {
            return Err(CrawlerError::InvalidProxyConfig(
                "fail_threshold must be at least 1".to_string(),
            ));
        }
        let manager = Self {
            store,
            fail_threshold: options.fail_threshold,
            cooldown_ms: i64::try_from(options.cooldown.as_millis()).unwrap_or(i64::MAX),
        };
        for config in &options.default_proxies {
            log::debug!("Add default proxy: {}", config.proxy_url());
            manager.add(config)?;
        }
        Ok(manager)
    }

    pub fn store(&self) -> &Arc<ProxyStore> {
        &self.store
    }

    pub fn fail_threshold(&self) -> u32 {
        self.fail_threshold
    }

    pub fn add(&self, config: &ProxyConfig) -> Result<ProxyState, CrawlerError> {
        if let Err(issues) = config.validate() {
            let msg = issues
                .iter()
                .map(|i| format!("{}: {}", i.path, i.message))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(CrawlerError::InvalidProxyConfig(msg));
        }
        Ok(self.store.add(config)?)
    }

    pub fn remove(&self, id: i64) -> Result<(), StoreError> {
        self.store.remove(id)
    }

    pub fn list(&self) -> Result<Vec<ProxyState>, StoreError> {
        self.store.list()
    }

    /// Picks an eligible proxy, or `None` when every proxy is cooling down
    /// (callers then connect directly).
    pub fn pick(&self) -> Result<Option<ProxyState>, StoreError> {
        self.pick_with(&mut rand::thread_rng())
    }

    pub fn pick_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Option<ProxyState>, StoreError> {
        let now = Utc::now().timestamp_millis();
        let mut available = Vec::new();
        for state in self.store.list()? {
            let state = self.refresh_if_cooldown_expired(state, now)?;
            if !state.is_cooling_down() {
                available.push(state);
            }
        }

        let Some(selected) = select_weighted(&available, rng) else {
            return Ok(None);
        };

        let stamp = ProxyStateUpdate {
            last_used_at: Some(Some(now)),
            ..Default::default()
        };
        let refreshed = self.store.update_state(selected.id, &stamp)?;
        // Removed between the snapshot and the stamp
        Ok(Some(refreshed.unwrap_or_else(|| stamp.apply_to(selected))))
    }

    /// Records the outcome of a request made through proxy `id`. Unknown ids
    /// are ignored.
    pub fn report_result(&self, id: i64, success: bool) -> Result<(), StoreError> {
        let now = Utc::now().timestamp_millis();
        let fail_threshold = self.fail_threshold;
        let cooldown_ms = self.cooldown_ms;

        let updated = self.store.modify(id, |state| {
            if success {
                ProxyStateUpdate {
                    fail_count: Some(0),
                    success_count: Some(state.success_count.saturating_add(1)),
                    cooldown_until: Some(None),
                    last_used_at: Some(Some(now)),
                    config: None,
                }
            } else {
                let fail_count = state.fail_count.saturating_add(1);
                let cooldown_until = if fail_count >= fail_threshold {
                    Some(Some(now.saturating_add(cooldown_ms)))
                } else {
                    None
                };
                ProxyStateUpdate {
                    fail_count: Some(fail_count),
                    cooldown_until,
                    last_used_at: Some(Some(now)),
                    ..Default::default()
                }
            }
        })?;

        match updated {
            Some(state) if !success && state.fail_count >= fail_threshold => {
                log::warn!(
                    "Proxy {} ({}) failed {} times, cooling down for {}ms",
                    state.id,
                    state.config.proxy_url(),
                    state.fail_count,
                    cooldown_ms
                );
            }
            Some(_) => {}
            None => log::debug!("Ignoring result for unknown proxy {}", id),
        }
        Ok(())
    }

    fn refresh_if_cooldown_expired(&self, state: ProxyState, now: i64) -> Result<ProxyState, StoreError> {
        if !state.cooldown_expired(now) {
            return Ok(state);
        }
        // Re-checked under the store lock: a failure reported since the
        // snapshot may have started a fresh cooldown.
        let refreshed = self.store.modify(state.id, |current| {
            if current.cooldown_expired(now) {
                ProxyStateUpdate {
                    cooldown_until: Some(None),
                    fail_count: Some(0),
                    ..Default::default()
                }
            } else {
                ProxyStateUpdate::default()
            }
        })?;
        if refreshed.as_ref().map_or(true, |s| !s.is_cooling_down()) {
            log::info!("Proxy {} cooldown expired", state.id);
        }
        Ok(refreshed.unwrap_or(ProxyState {
            cooldown_until: None,
            fail_count: 0,
            ..state
        }))
    }
}
