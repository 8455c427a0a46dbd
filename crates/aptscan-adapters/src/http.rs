use std::fmt;
use std::sync::Arc;

use aptscan_core::Source;
use aptscan_storage::HttpFetcher;
use async_trait::async_trait;

use crate::{AdapterError, DetailLoader, DetailPage};

pub(crate) type DetailParser = fn(&str) -> Result<DetailPage, AdapterError>;

/// Loads static detail pages through the shared fetcher and hands the body to a
/// site-specific parser.
pub struct HttpDetailLoader {
    fetcher: Arc<HttpFetcher>,
    source: Source,
    parse: DetailParser,
}

impl HttpDetailLoader {
    pub fn new(fetcher: Arc<HttpFetcher>, source: Source, parse: DetailParser) -> Self {
        Self {
            fetcher,
            source,
            parse,
        }
    }
}

impl fmt::Debug for HttpDetailLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpDetailLoader")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DetailLoader for HttpDetailLoader {
    async fn load_detail(&self, url: &str) -> Result<DetailPage, AdapterError> {
        let response = self.fetcher.fetch_text(self.source, url).await?;
        (self.parse)(&response.body)
    }
}
