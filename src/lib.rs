// Library interface for novel-crawler
// The binary and the integration tests build on these modules

pub mod app_state;
pub mod config;
pub mod crawler;
pub mod error;
pub mod http_client;
pub mod metrics;
pub mod models;
pub mod providers;
pub mod proxy_manager;
pub mod proxy_store;
pub mod routes;
