use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;
use url::Url;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Https,
    Socks5,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(ProxyProtocol::Http),
            "https" => Ok(ProxyProtocol::Https),
            "socks5" => Ok(ProxyProtocol::Socks5),
            other => Err(format!("unsupported proxy protocol: {}", other)),
        }
    }
}

/// Outbound proxy descriptor. Identity is `(protocol, host, port)`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    pub protocol: ProxyProtocol,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// A single rejected field of a [`ProxyConfig`].
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    pub path: String,
    pub message: String,
}

impl ProxyConfig {
    pub fn new(protocol: ProxyProtocol, host: &str, port: u16) -> Self {
        Self {
            protocol,
            host: host.to_string(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: Option<&str>) -> Self {
        self.username = Some(username.to_string());
        self.password = password.map(|p| p.to_string());
        self
    }

    /// Checks the fields serde cannot: an empty host, port 0, a password
    /// without a username, and a host that does not survive inside the proxy
    /// URL.
    pub fn validate(&self) -> Result<(), Vec<ConfigIssue>> {
        let mut issues = Vec::new();
        let host = self.host.trim();
        if host.is_empty() {
            issues.push(ConfigIssue {
                path: "host".to_string(),
                message: "host must not be empty".to_string(),
            });
        } else if host.contains(|c: char| c.is_whitespace() || c == '/' || c == '@') {
            issues.push(ConfigIssue {
                path: "host".to_string(),
                message: format!("invalid host: {}", self.host),
            });
        }
        if self.port == 0 {
            issues.push(ConfigIssue {
                path: "port".to_string(),
                message: "port must be between 1 and 65535".to_string(),
            });
        }
        if self.password.is_some() && self.username.is_none() {
            issues.push(ConfigIssue {
                path: "password".to_string(),
                message: "password requires a username".to_string(),
            });
        }
        if issues.is_empty() && !self.url_round_trips() {
            issues.push(ConfigIssue {
                path: "host".to_string(),
                message: format!("invalid host: {}", self.host),
            });
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }

    /// `protocol://[user[:pass]@]host:port`, credentials percent-encoded.
    pub fn proxy_url(&self) -> String {
        let credentials = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!("{}:{}@", encode_userinfo(user), encode_userinfo(pass)),
            (Some(user), None) => format!("{}@", encode_userinfo(user)),
            _ => String::new(),
        };
        format!("{}://{}{}:{}", self.protocol, credentials, self.url_host(), self.port)
    }

    /// IPv6 literals need brackets inside a URL.
    fn url_host(&self) -> Cow<'_, str> {
        match self.host.parse::<Ipv6Addr>() {
            Ok(_) => Cow::Owned(format!("[{}]", self.host)),
            Err(_) => Cow::Borrowed(self.host.as_str()),
        }
    }

    /// The proxy URL must parse back to exactly this host and port, with
    /// nothing spilling into a path, query or fragment.
    fn url_round_trips(&self) -> bool {
        let Ok(parsed) = Url::parse(&self.proxy_url()) else {
            return false;
        };
        parsed.host_str().is_some_and(|h| !h.is_empty())
            && parsed.port_or_known_default() == Some(self.port)
            && matches!(parsed.path(), "" | "/")
            && parsed.query().is_none()
            && parsed.fragment().is_none()
    }

    pub fn identity(&self) -> (ProxyProtocol, &str, u16) {
        (self.protocol, self.host.as_str(), self.port)
    }
}

fn encode_userinfo(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// Health record for one proxy, owned by the store.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyState {
    pub id: i64,
    pub config: ProxyConfig,
    pub fail_count: u32,
    pub success_count: u32,
    /// Epoch milliseconds; `None` means the proxy is not cooling down.
    pub cooldown_until: Option<i64>,
    pub last_used_at: Option<i64>,
}

impl ProxyState {
    pub fn is_cooling_down(&self) -> bool {
        self.cooldown_until.is_some()
    }

    pub fn cooldown_expired(&self, now_ms: i64) -> bool {
        matches!(self.cooldown_until, Some(until) if until <= now_ms)
    }
}

/// Partial update for a [`ProxyState`]. `None` leaves a field untouched;
/// for the nullable columns `Some(None)` clears the value.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProxyStateUpdate {
    pub fail_count: Option<u32>,
    pub success_count: Option<u32>,
    pub cooldown_until: Option<Option<i64>>,
    pub last_used_at: Option<Option<i64>>,
    pub config: Option<ProxyConfig>,
}

impl ProxyStateUpdate {
    pub fn is_empty(&self) -> bool {
        self.fail_count.is_none()
            && self.success_count.is_none()
            && self.cooldown_until.is_none()
            && self.last_used_at.is_none()
            && self.config.is_none()
    }

    /// Applies the update to an in-memory copy, mirroring what the store writes.
    pub fn apply_to(&self, state: &ProxyState) -> ProxyState {
        let mut next = state.clone();
        if let Some(v) = self.fail_count {
            next.fail_count = v;
        }
        if let Some(v) = self.success_count {
            next.success_count = v;
        }
        if let Some(v) = self.cooldown_until {
            next.cooldown_until = v;
        }
        if let Some(v) = self.last_used_at {
            next.last_used_at = v;
        }
        if let Some(ref config) = self.config {
            next.config = config.clone();
        }
        next
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum WebNovelType {
    Ongoing,
    Completed,
    ShortStory,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WebNovelAttention {
    R15,
    R18,
    Cruelty,
    Violence,
    SexualContent,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WebNovelAuthor {
    pub name: String,
    pub link: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TocItem {
    pub title: String,
    pub chapter_id: Option<String>,
    /// Epoch seconds.
    pub create_at: Option<i64>,
}

impl TocItem {
    pub fn heading(title: &str) -> Self {
        Self {
            title: title.to_string(),
            chapter_id: None,
            create_at: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteNovelMetadata {
    pub title: String,
    pub authors: Vec<WebNovelAuthor>,
    #[serde(rename = "type")]
    pub novel_type: WebNovelType,
    pub attentions: Vec<WebNovelAttention>,
    pub keywords: Vec<String>,
    pub points: Option<i64>,
    pub total_characters: Option<i64>,
    pub introduction: String,
    pub toc: Vec<TocItem>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RemoteChapter {
    pub paragraphs: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteNovelListItem {
    pub novel_id: String,
    pub title: String,
    pub attentions: Vec<WebNovelAttention>,
    pub keywords: Vec<String>,
    pub extra: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page_number: u32,
}

impl<T> Page<T> {
    pub fn single(items: Vec<T>) -> Self {
        Self {
            items,
            page_number: 1,
        }
    }
}
