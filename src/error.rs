use serde::Serialize;
use std::fmt;

/// Errors raised by the proxy store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Proxy store is closed")]
    Closed,

    #[error("Invalid proxy row: {0}")]
    InvalidRow(String),
}

/// Coarse classification of a [`CrawlerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Network,
    Parse,
    NotImplemented,
    Storage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Network => "network",
            ErrorKind::Parse => "parse",
            ErrorKind::NotImplemented => "not_implemented",
            ErrorKind::Storage => "storage",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CrawlerError {
    #[error("Unknown providerId: {0}")]
    UnknownProvider(String),

    #[error("Invalid proxy configuration: {0}")]
    InvalidProxyConfig(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Request failed: {status} {reason}")]
    RequestFailed { status: u16, reason: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("{provider} does not implement {operation}")]
    NotImplemented {
        provider: &'static str,
        operation: &'static str,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl CrawlerError {
    pub fn parse(msg: impl Into<String>) -> Self {
        CrawlerError::Parse(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CrawlerError::UnknownProvider(_)
            | CrawlerError::InvalidProxyConfig(_)
            | CrawlerError::InvalidHeader(_) => ErrorKind::Configuration,
            CrawlerError::Transport(_) | CrawlerError::RequestFailed { .. } => ErrorKind::Network,
            CrawlerError::Parse(_) => ErrorKind::Parse,
            CrawlerError::NotImplemented { .. } => ErrorKind::NotImplemented,
            CrawlerError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Whether this error is reported as a failure against the proxy that
    /// carried the request.
    pub fn counts_against_proxy(&self, penalize_parse_errors: bool) -> bool {
        match self.kind() {
            ErrorKind::Network => true,
            ErrorKind::Parse => penalize_parse_errors,
            ErrorKind::Configuration | ErrorKind::NotImplemented | ErrorKind::Storage => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CrawlerError::Transport(e) if e.is_timeout())
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, CrawlerError::RequestFailed { status: 429, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribution() {
        let parse = CrawlerError::parse("missing toc");
        assert!(parse.counts_against_proxy(true));
        assert!(!parse.counts_against_proxy(false));

        let failed = CrawlerError::RequestFailed {
            status: 503,
            reason: "Service Unavailable".to_string(),
        };
        assert_eq!(failed.kind(), ErrorKind::Network);
        assert!(failed.counts_against_proxy(false));

        let unimplemented = CrawlerError::NotImplemented {
            provider: "hameln",
            operation: "getRank",
        };
        assert!(!unimplemented.counts_against_proxy(true));
        assert!(!CrawlerError::UnknownProvider("x".into()).counts_against_proxy(true));
        assert!(!CrawlerError::Storage(StoreError::Closed).counts_against_proxy(true));
    }

    #[test]
    fn test_messages() {
        let failed = CrawlerError::RequestFailed {
            status: 404,
            reason: "Not Found".to_string(),
        };
        assert_eq!(failed.to_string(), "Request failed: 404 Not Found");
        assert!(failed.to_string().starts_with("Request failed"));
        assert!(!failed.is_rate_limited());
        assert_eq!(
            CrawlerError::UnknownProvider("foo".into()).to_string(),
            "Unknown providerId: foo"
        );
    }
}
