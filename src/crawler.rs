//! Crawl dispatch: binds a proxy, headers and cookies to one provider call and
//! reports the outcome back to the proxy pool.

use crate::error::CrawlerError;
use crate::http_client::{FetchClient, HeaderTable, HttpClientConfig};
use crate::metrics::{track_request, MetricsTracker};
use crate::models::{Page, RemoteChapter, RemoteNovelListItem, RemoteNovelMetadata};
use crate::providers::{self, ProviderId, ProviderSettings, ProviderTable, RankParams, WebNovelProvider};
use crate::proxy_manager::ProxyManager;
use parking_lot::Mutex;
use reqwest::cookie::Jar;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

/// Header key applied under every provider's own headers.
pub const DEFAULT_HEADERS_KEY: &str = "default";

/// Header tables keyed by provider id or [`DEFAULT_HEADERS_KEY`].
pub type HeadersByProvider = BTreeMap<String, HeaderTable>;

#[derive(Debug, Clone)]
pub struct CrawlerOptions {
    pub headers: HeadersByProvider,
    pub http: HttpClientConfig,
    pub providers: ProviderSettings,
    /// Count parse failures against the proxy that fetched the page.
    pub penalize_parse_errors: bool,
}

impl Default for CrawlerOptions {
    fn default() -> Self {
        Self {
            headers: HeadersByProvider::new(),
            http: HttpClientConfig::default(),
            providers: ProviderSettings::default(),
            penalize_parse_errors: true,
        }
    }
}

/// Provider-specific entries override the default entries key by key.
pub fn merge_headers(defaults: &HeaderTable, overrides: Option<&HeaderTable>) -> HeaderTable {
    let mut merged = defaults.clone();
    if let Some(overrides) = overrides {
        merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    merged
}

pub struct CrawlerService {
    proxy_manager: Arc<ProxyManager>,
    providers: ProviderTable,
    headers: HashMap<ProviderId, HeaderTable>,
    // Shared by concurrent calls to the same provider; never persisted.
    cookie_jars: Mutex<HashMap<ProviderId, Arc<Jar>>>,
    http: HttpClientConfig,
    penalize_parse_errors: bool,
    metrics: Arc<MetricsTracker>,
}

impl CrawlerService {
    pub fn new(proxy_manager: Arc<ProxyManager>, options: CrawlerOptions) -> Result<Self, CrawlerError> {
        let providers = providers::registry(&options.providers);
        Self::with_providers(proxy_manager, providers, options)
    }

    /// Builds the service over an explicit provider table.
    pub fn with_providers(
        proxy_manager: Arc<ProxyManager>,
        providers: ProviderTable,
        options: CrawlerOptions,
    ) -> Result<Self, CrawlerError> {
        let defaults = options
            .headers
            .get(DEFAULT_HEADERS_KEY)
            .cloned()
            .unwrap_or_default();

        for key in options.headers.keys() {
            if key != DEFAULT_HEADERS_KEY {
                key.parse::<ProviderId>()?;
            }
        }

        let mut headers = HashMap::new();
        for id in ProviderId::ALL {
            let merged = merge_headers(&defaults, options.headers.get(id.as_str()));
            if !merged.is_empty() {
                log::debug!("Setting initial headers for provider {}: {:?}", id, merged);
            }
            headers.insert(id, merged);
        }

        Ok(Self {
            proxy_manager,
            providers,
            headers,
            cookie_jars: Mutex::new(HashMap::new()),
            http: options.http,
            penalize_parse_errors: options.penalize_parse_errors,
            metrics: Arc::new(MetricsTracker::new()),
        })
    }

    pub fn proxy_manager(&self) -> &Arc<ProxyManager> {
        &self.proxy_manager
    }

    pub fn metrics(&self) -> &Arc<MetricsTracker> {
        &self.metrics
    }

    pub fn headers_for(&self, provider_id: ProviderId) -> HeaderTable {
        self.headers.get(&provider_id).cloned().unwrap_or_default()
    }

    pub async fn get_metadata(
        &self,
        provider_id: ProviderId,
        novel_id: &str,
    ) -> Result<Option<RemoteNovelMetadata>, CrawlerError> {
        self.fetch_resource(provider_id, |provider| async move {
            provider.get_metadata(novel_id).await
        })
        .await
    }

    pub async fn get_chapter(
        &self,
        provider_id: ProviderId,
        novel_id: &str,
        chapter_id: &str,
    ) -> Result<RemoteChapter, CrawlerError> {
        self.fetch_resource(provider_id, |provider| async move {
            provider.get_chapter(novel_id, chapter_id).await
        })
        .await
    }

    pub async fn get_rank(
        &self,
        provider_id: ProviderId,
        params: &RankParams,
    ) -> Result<Page<RemoteNovelListItem>, CrawlerError> {
        self.fetch_resource(provider_id, |provider| async move { provider.get_rank(params).await })
            .await
    }

    fn cookie_jar(&self, provider_id: ProviderId) -> Arc<Jar> {
        self.cookie_jars
            .lock()
            .entry(provider_id)
            .or_insert_with(|| Arc::new(Jar::default()))
            .clone()
    }

    async fn fetch_resource<T, F, Fut>(&self, provider_id: ProviderId, handler: F) -> Result<T, CrawlerError>
    where
        F: FnOnce(Box<dyn WebNovelProvider>) -> Fut,
        Fut: Future<Output = Result<T, CrawlerError>>,
    {
        let init = self
            .providers
            .get(&provider_id)
            .ok_or_else(|| CrawlerError::UnknownProvider(provider_id.to_string()))?;

        let proxy = self.proxy_manager.pick()?;
        let client = match FetchClient::build(
            &self.http,
            proxy.as_ref().map(|p| &p.config),
            &self.headers_for(provider_id),
            self.cookie_jar(provider_id),
        ) {
            Ok(client) => client,
            Err(e) => {
                // A stored proxy the client cannot use must still cool down.
                if let (Some(proxy), CrawlerError::InvalidProxyConfig(_)) = (&proxy, &e) {
                    self.report(proxy.id, false);
                }
                return Err(e);
            }
        };
        let provider = init(client);

        let result = track_request(&self.metrics, provider_id, proxy.is_some(), handler(provider)).await;

        if let Some(proxy) = proxy {
            let success = match &result {
                Ok(_) => Some(true),
                Err(e) if e.counts_against_proxy(self.penalize_parse_errors) => Some(false),
                Err(_) => None,
            };
            if let Some(success) = success {
                self.report(proxy.id, success);
            }
        }

        result
    }

    fn report(&self, proxy_id: i64, success: bool) {
        if let Err(e) = self.proxy_manager.report_result(proxy_id, success) {
            log::error!("Failed to record result for proxy {}: {}", proxy_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy_manager::ProxyManagerOptions;
    use crate::proxy_store::ProxyStore;

    fn table(pairs: &[(&str, &str)]) -> HeaderTable {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn manager() -> Arc<ProxyManager> {
        let store = Arc::new(ProxyStore::open_in_memory().unwrap());
        Arc::new(ProxyManager::new(store, ProxyManagerOptions::default()).unwrap())
    }

    #[test]
    fn test_merge_headers_overrides_defaults() {
        let defaults = table(&[("Accept-Language", "ja"), ("User-Agent", "base")]);
        let overrides = table(&[("User-Agent", "kakuyomu-ua")]);
        let merged = merge_headers(&defaults, Some(&overrides));
        assert_eq!(merged["Accept-Language"], "ja");
        assert_eq!(merged["User-Agent"], "kakuyomu-ua");
        assert_eq!(merge_headers(&defaults, None), defaults);
    }

    #[test]
    fn test_default_headers_apply_to_every_provider() {
        let mut headers = HeadersByProvider::new();
        headers.insert(DEFAULT_HEADERS_KEY.to_string(), table(&[("Accept-Language", "ja")]));
        headers.insert("hameln".to_string(), table(&[("Referer", "https://syosetu.org/")]));
        let service = CrawlerService::new(
            manager(),
            CrawlerOptions {
                headers,
                ..Default::default()
            },
        )
        .unwrap();

        let hameln = service.headers_for(ProviderId::Hameln);
        assert_eq!(hameln.len(), 2);
        let novelup = service.headers_for(ProviderId::Novelup);
        assert_eq!(novelup, table(&[("Accept-Language", "ja")]));
    }

    #[test]
    fn test_unknown_header_key_is_rejected() {
        let mut headers = HeadersByProvider::new();
        headers.insert("syosetu".to_string(), HeaderTable::new());
        let result = CrawlerService::new(
            manager(),
            CrawlerOptions {
                headers,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(CrawlerError::UnknownProvider(_))));
    }

    #[test]
    fn test_cookie_jar_is_shared_per_provider() {
        let service = CrawlerService::new(manager(), CrawlerOptions::default()).unwrap();
        let a = service.cookie_jar(ProviderId::Kakuyomu);
        let b = service.cookie_jar(ProviderId::Kakuyomu);
        let c = service.cookie_jar(ProviderId::Hameln);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
