use crate::error::CrawlerError;
use crate::models::ProxyConfig;
use rand::Rng;
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Client, ClientBuilder, Response};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Header name -> value, merged per provider.
pub type HeaderTable = BTreeMap<String, String>;

/// User agents to rotate through when a provider configures none
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

/// Configuration shared by every scoped client
#[derive(Clone, Debug)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub max_redirects: usize,
    pub enable_gzip: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_redirects: 10,
            enable_gzip: true,
        }
    }
}

/// HTTP client scoped to a single crawl call: routed through at most one
/// proxy, carrying the provider's headers and cookie jar. Non-2xx responses
/// are turned into [`CrawlerError::RequestFailed`] before the provider sees
/// them.
#[derive(Clone)]
pub struct FetchClient {
    client: Client,
    proxy_url: Option<String>,
}

impl FetchClient {
    pub fn build(
        config: &HttpClientConfig,
        proxy: Option<&ProxyConfig>,
        headers: &HeaderTable,
        cookie_jar: Arc<Jar>,
    ) -> Result<Self, CrawlerError> {
        let proxy_url = proxy.map(ProxyConfig::proxy_url);

        let mut builder = ClientBuilder::new()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .cookie_provider(cookie_jar)
            .gzip(config.enable_gzip)
            .brotli(config.enable_gzip)
            .default_headers(Self::header_map(headers)?);

        builder = match proxy_url {
            Some(ref url) => {
                let proxy = reqwest::Proxy::all(url.as_str())
                    .map_err(|e| CrawlerError::InvalidProxyConfig(format!("{}: {}", url, e)))?;
                builder.proxy(proxy)
            }
            None => builder.no_proxy(),
        };

        let client = builder.build()?;
        Ok(Self { client, proxy_url })
    }

    /// Client without proxy, cookies or custom headers.
    pub fn direct(config: &HttpClientConfig) -> Result<Self, CrawlerError> {
        Self::build(config, None, &HeaderTable::new(), Arc::new(Jar::default()))
    }

    fn header_map(headers: &HeaderTable) -> Result<HeaderMap, CrawlerError> {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| CrawlerError::InvalidHeader(format!("name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| CrawlerError::InvalidHeader(format!("value for {}: {}", name, e)))?;
            map.insert(name, value);
        }
        if !map.contains_key(USER_AGENT) {
            map.insert(USER_AGENT, HeaderValue::from_static(Self::random_user_agent()));
        }
        Ok(map)
    }

    fn random_user_agent() -> &'static str {
        let mut rng = rand::thread_rng();
        USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())]
    }

    pub fn proxy_url(&self) -> Option<&str> {
        self.proxy_url.as_deref()
    }

    /// Sends a GET and rejects any non-2xx status.
    pub async fn get(&self, url: &str) -> Result<Response, CrawlerError> {
        log::debug!(
            "[crawler] GET {} via proxy: {}",
            url,
            self.proxy_url.as_deref().unwrap_or("none")
        );
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("").to_string();
            match response.text().await {
                Ok(body) => log::debug!("response: {}", truncate(&body, 2048)),
                Err(e) => log::debug!("response body unavailable: {}", e),
            }
            return Err(CrawlerError::RequestFailed {
                status: status.as_u16(),
                reason,
            });
        }
        Ok(response)
    }

    pub async fn get_text(&self, url: &str) -> Result<String, CrawlerError> {
        Ok(self.get(url).await?.text().await?)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, CrawlerError> {
        let text = self.get_text(url).await?;
        serde_json::from_str(&text).map_err(|e| CrawlerError::parse(format!("invalid JSON from {}: {}", url, e)))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
