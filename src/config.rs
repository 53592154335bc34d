use crate::crawler::{CrawlerOptions, HeadersByProvider, DEFAULT_HEADERS_KEY};
use crate::http_client::{HeaderTable, HttpClientConfig};
use crate::models::ProxyConfig;
use crate::providers::{ProviderId, ProviderSettings};
use crate::proxy_manager::ProxyManagerOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub proxy_db_path: String,
    pub default_proxies: Vec<ProxyConfig>,
    pub proxy: ProxySettings,
    pub http: HttpSettings,
    /// Keyed by provider id, plus `default` for headers shared by all.
    pub providers: BTreeMap<String, ProviderConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ProxySettings {
    /// Consecutive failures before a proxy cools down
    pub fail_threshold: u32,
    pub cooldown_ms: u64,
    pub penalize_parse_errors: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub max_redirects: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderConfig {
    pub headers: HeaderTable,
    /// Only meaningful for hameln.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub use_mirror: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            proxy_db_path: "crawler-proxies.db".to_string(),
            default_proxies: Vec::new(),
            proxy: ProxySettings::default(),
            http: HttpSettings::default(),
            providers: BTreeMap::new(),
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            fail_threshold: 3,
            cooldown_ms: 300_000,
            penalize_parse_errors: true,
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_redirects: 10,
        }
    }
}

impl Config {
    /// Loads `path`. A missing file yields the defaults, which are written
    /// back to `path` on a best-effort basis.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Self::default();
            if let Err(e) = config.persist(path) {
                log::error!("Failed to write config file {}: {}", path.display(), e);
            } else {
                log::info!("Wrote default config to {}", path.display());
            }
            return Ok(config);
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn persist(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(path, content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for key in self.providers.keys() {
            if key != DEFAULT_HEADERS_KEY && key.parse::<ProviderId>().is_err() {
                return Err(ConfigError::Invalid(format!("unknown provider: {}", key)));
            }
        }
        for (i, proxy) in self.default_proxies.iter().enumerate() {
            if let Err(issues) = proxy.validate() {
                let detail = issues
                    .iter()
                    .map(|issue| format!("default_proxies[{}].{}: {}", i, issue.path, issue.message))
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(ConfigError::Invalid(detail));
            }
        }
        if self.proxy.fail_threshold == 0 {
            return Err(ConfigError::Invalid("proxy.fail_threshold must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }

    pub fn manager_options(&self) -> ProxyManagerOptions {
        ProxyManagerOptions {
            fail_threshold: self.proxy.fail_threshold,
            cooldown: Duration::from_millis(self.proxy.cooldown_ms),
            default_proxies: self.default_proxies.clone(),
        }
    }

    pub fn crawler_options(&self) -> CrawlerOptions {
        let headers: HeadersByProvider = self
            .providers
            .iter()
            .map(|(id, provider)| (id.clone(), provider.headers.clone()))
            .collect();
        let hameln_use_mirror = self
            .providers
            .get(ProviderId::Hameln.as_str())
            .map(|p| p.use_mirror)
            .unwrap_or(false);

        CrawlerOptions {
            headers,
            http: HttpClientConfig {
                timeout: Duration::from_secs(self.http.timeout_secs),
                max_redirects: self.http.max_redirects,
                ..HttpClientConfig::default()
            },
            providers: ProviderSettings { hameln_use_mirror },
            penalize_parse_errors: self.proxy.penalize_parse_errors,
        }
    }
}
