//! Site-specific scrapers behind one capability contract.
//!
//! Providers are cheap to construct: the crawler builds one per call around a
//! [`FetchClient`] already bound to that call's proxy, headers and cookies.
//! The set of providers is closed ([`ProviderId`]) and resolved through a
//! static table ([`registry`]).

pub mod hameln;
pub mod kakuyomu;
pub mod novelup;
pub mod utils;

use crate::error::CrawlerError;
use crate::http_client::FetchClient;
use crate::models::{Page, RemoteChapter, RemoteNovelListItem, RemoteNovelMetadata};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Free-form ranking parameters, validated by each provider.
pub type RankParams = HashMap<String, String>;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Kakuyomu,
    Hameln,
    Novelup,
}

impl ProviderId {
    pub const ALL: [ProviderId; 3] = [ProviderId::Kakuyomu, ProviderId::Hameln, ProviderId::Novelup];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Kakuyomu => "kakuyomu",
            ProviderId::Hameln => "hameln",
            ProviderId::Novelup => "novelup",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = CrawlerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| CrawlerError::UnknownProvider(s.to_string()))
    }
}

/// Capability contract every site scraper implements.
///
/// Parse failures must surface as [`CrawlerError::Parse`]; an operation the
/// site cannot support returns [`CrawlerError::NotImplemented`] instead.
#[async_trait]
pub trait WebNovelProvider: Send + Sync {
    fn id(&self) -> ProviderId;

    /// `Ok(None)` when the novel page exists but carries no metadata.
    async fn get_metadata(&self, novel_id: &str) -> Result<Option<RemoteNovelMetadata>, CrawlerError>;

    async fn get_chapter(&self, novel_id: &str, chapter_id: &str) -> Result<RemoteChapter, CrawlerError>;

    async fn get_rank(&self, params: &RankParams) -> Result<Page<RemoteNovelListItem>, CrawlerError> {
        let _ = params;
        Err(CrawlerError::NotImplemented {
            provider: self.id().as_str(),
            operation: "getRank",
        })
    }
}

/// Builds a provider around a call-scoped client.
pub type ProviderInit = Arc<dyn Fn(FetchClient) -> Box<dyn WebNovelProvider> + Send + Sync>;

pub type ProviderTable = HashMap<ProviderId, ProviderInit>;

/// Runtime options for providers that have any.
#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    /// Route hameln through its mirror host.
    pub hameln_use_mirror: bool,
}

/// The static provider table.
pub fn registry(settings: &ProviderSettings) -> ProviderTable {
    let mut table: ProviderTable = HashMap::new();
    table.insert(
        ProviderId::Kakuyomu,
        Arc::new(|client| Box::new(kakuyomu::Kakuyomu::new(client)) as Box<dyn WebNovelProvider>),
    );
    let use_mirror = settings.hameln_use_mirror;
    table.insert(
        ProviderId::Hameln,
        Arc::new(move |client| {
            Box::new(hameln::Hameln::new(client).use_mirror(use_mirror)) as Box<dyn WebNovelProvider>
        }),
    );
    table.insert(
        ProviderId::Novelup,
        Arc::new(|client| Box::new(novelup::Novelup::new(client)) as Box<dyn WebNovelProvider>),
    );
    table
}
