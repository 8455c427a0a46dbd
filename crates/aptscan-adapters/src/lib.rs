//! Source adapter contracts and the site-specific page extractors behind them.
//!
//! An adapter owns everything that depends on a site's markup: how a search is
//! opened and advanced, how result cards become candidate listings, and how a
//! detail page is read. The scrape pipeline only sees the traits below.

use std::sync::Arc;

use aptscan_core::{ScrapedListing, Source};
use aptscan_storage::{FetchError, HttpFetcher};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod browser;
pub mod craigslist;
pub mod extract;
mod http;
pub mod streeteasy;

pub use browser::{BrowserSettings, ChromeSearchSession, LoadAction};
pub use craigslist::CraigslistAdapter;
pub use http::HttpDetailLoader;
pub use streeteasy::StreetEasyAdapter;

pub const CRATE_NAME: &str = "aptscan-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector {0}")]
    Selector(String),
    #[error("browser error: {0}")]
    Browser(String),
    #[error("detail fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("browser task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Search filters forwarded into each site's search URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub min_price: Option<u32>,
    pub max_price: Option<u32>,
    pub bedrooms: Option<u32>,
}

/// What a listing's detail page yields. Every field is optional; a page that
/// carries none of them is still a successful load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetailPage {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Gallery `img[src]` values in page order, `data:` placeholders removed.
    pub gallery: Vec<String>,
    /// Fallback `a.thumb[href]` links, used only when the gallery is empty.
    pub thumb_links: Vec<String>,
    pub address: Option<String>,
    /// Free-form attribute badges ("w/d in unit", "cats are OK", ...).
    pub attributes: Vec<String>,
    pub description: Option<String>,
}

/// Rewrites a size token embedded in thumbnail URLs to the largest variant the
/// site serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSizePattern {
    pub pattern: &'static str,
    pub replacement: &'static str,
}

/// A live search-results view. `load_next` advances it by one page turn or one
/// scroll; `visible_candidates` reads whatever is currently rendered.
#[async_trait]
pub trait SearchSession: Send {
    async fn load_next(&mut self) -> Result<(), AdapterError>;

    async fn visible_candidates(&mut self) -> Result<Vec<ScrapedListing>, AdapterError>;

    async fn close(&mut self) -> Result<(), AdapterError> {
        Ok(())
    }
}

#[async_trait]
pub trait DetailLoader: Send + Sync {
    async fn load_detail(&self, url: &str) -> Result<DetailPage, AdapterError>;
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> Source;

    /// Consecutive load actions without a new candidate before the search
    /// counts as exhausted.
    fn max_consecutive_empty(&self) -> usize;

    fn image_size_pattern(&self) -> Option<ImageSizePattern> {
        None
    }

    /// `None` when the site's result cards already carry everything we keep.
    fn detail_loader(&self) -> Option<Arc<dyn DetailLoader>>;

    async fn open_search(&self, query: &SearchQuery) -> Result<Box<dyn SearchSession>, AdapterError>;
}

/// Shared handles every adapter is built from.
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub fetcher: Arc<HttpFetcher>,
    pub browser: BrowserSettings,
}

/// Zillow is a known source without an adapter, so it yields `None` too.
pub fn adapter_for_source(source: Source, settings: &AdapterSettings) -> Option<Box<dyn SourceAdapter>> {
    match source {
        Source::Craigslist => Some(Box::new(CraigslistAdapter::new(settings.clone()))),
        Source::StreetEasy => Some(Box::new(StreetEasyAdapter::new(settings.clone()))),
        Source::Zillow => None,
    }
}
