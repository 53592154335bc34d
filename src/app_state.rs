//! Shared state for the Actix-web handlers.

use crate::crawler::CrawlerService;
use crate::proxy_manager::ProxyManager;
use std::sync::Arc;
use tokio::sync::Notify;

/// Wrapped in `web::Data` and shared across all handlers.
pub struct AppState {
    pub crawler: Arc<CrawlerService>,
    /// Notified by `POST /shutdown`; `main` stops the server when it fires.
    pub shutdown: Arc<Notify>,
}

impl AppState {
    pub fn new(crawler: Arc<CrawlerService>) -> Self {
        Self {
            crawler,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn proxies(&self) -> &Arc<ProxyManager> {
        self.crawler.proxy_manager()
    }
}
