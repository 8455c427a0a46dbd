//! Scrape-enrich-reconcile orchestration: one run drives a source's search to
//! exhaustion, enriches the candidates from their detail pages, folds them into the
//! listing store and applies the coverage-gated off-market rule, all recorded in
//! the run ledger.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use aptscan_adapters::{
    adapter_for_source, AdapterError, AdapterSettings, SearchQuery, SourceAdapter,
};
use aptscan_core::{RunCounts, ScrapeRun, ScrapeSummary, Source, UnknownSource};
use aptscan_geo::GeoClassifier;
use aptscan_storage::{HttpFetcher, ListingStore, RunLedger, StoreError};
use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod enrich;
pub mod pagination;
pub mod reconcile;

pub use config::ScrapeConfig;
pub use enrich::{
    classify_laundry, merge_gallery, DetailEnricher, EnrichSettings, EnrichmentFailure,
    EnrichmentReport, ImageUpgradeRule,
};
pub use pagination::{ScrollDriver, ScrollLimits, ScrollOutcome, Termination};
pub use reconcile::{
    coverage_ratio, CoverageGate, GateDecision, OffMarketOutcome, ReconciliationEngine,
};

pub const CRATE_NAME: &str = "aptscan-sync";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    UnknownSource(#[from] UnknownSource),
    #[error("no scraper is available for {0}")]
    UnsupportedSource(Source),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("search failed: {0}")]
    Search(#[from] AdapterError),
}

/// Adapters by source. Sources without an entry are known but unsupported.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Source, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn from_settings(settings: &AdapterSettings) -> Self {
        let adapters = Source::ALL
            .iter()
            .filter_map(|&source| {
                adapter_for_source(source, settings).map(|a| (source, Arc::from(a)))
            })
            .collect();
        Self { adapters }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.adapters.insert(adapter.source(), adapter);
        self
    }

    pub fn get(&self, source: Source) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(&source).cloned()
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run: ScrapeRun,
    pub summary: ScrapeSummary,
    pub termination: Termination,
    pub load_actions: usize,
    pub enrichment_failures: Vec<EnrichmentFailure>,
    pub off_market: OffMarketOutcome,
}

struct RunOutput {
    summary: ScrapeSummary,
    scroll: ScrollOutcome,
    enrichment_failures: Vec<EnrichmentFailure>,
    off_market: OffMarketOutcome,
}

pub struct ScrapePipeline {
    config: ScrapeConfig,
    listings: Arc<dyn ListingStore>,
    ledger: Arc<dyn RunLedger>,
    geo: Arc<GeoClassifier>,
    adapters: AdapterRegistry,
}

impl ScrapePipeline {
    pub fn new(
        config: ScrapeConfig,
        listings: Arc<dyn ListingStore>,
        ledger: Arc<dyn RunLedger>,
        geo: Arc<GeoClassifier>,
        adapters: AdapterRegistry,
    ) -> Self {
        Self {
            config,
            listings,
            ledger,
            geo,
            adapters,
        }
    }

    /// Wires the real adapters, HTTP fetcher and polygon dataset from `config`.
    pub fn from_config(
        config: ScrapeConfig,
        listings: Arc<dyn ListingStore>,
        ledger: Arc<dyn RunLedger>,
        geo: Arc<GeoClassifier>,
    ) -> anyhow::Result<Self> {
        let fetcher = HttpFetcher::new(config.http_client()).context("building HTTP fetcher")?;
        let settings = AdapterSettings {
            fetcher: Arc::new(fetcher),
            browser: config.browser(),
        };
        let adapters = AdapterRegistry::from_settings(&settings);
        Ok(Self::new(config, listings, ledger, geo, adapters))
    }

    pub fn config(&self) -> &ScrapeConfig {
        &self.config
    }

    pub fn reconciliation(&self) -> ReconciliationEngine {
        ReconciliationEngine::new(Arc::clone(&self.listings), self.config.coverage_gate())
    }

    /// One full run for `source`. Unknown and unsupported sources are rejected
    /// before anything is written. Once the ledger run exists, every failure marks
    /// it `failed` before being returned.
    pub async fn run_once(
        &self,
        source: &str,
        query: &SearchQuery,
        triggered_by: &str,
    ) -> Result<RunReport, PipelineError> {
        let source: Source = source.parse()?;
        let adapter = self
            .adapters
            .get(source)
            .ok_or(PipelineError::UnsupportedSource(source))?;

        let run = self.ledger.begin_run(source, triggered_by, Utc::now()).await?;
        let span = tracing::info_span!("scrape_run", run_id = %run.id, %source, triggered_by);

        async move {
            info!(?query, "scrape run started");
            match self.execute(adapter.as_ref(), run.id, query).await {
                Ok(output) => {
                    let counts = RunCounts {
                        found: output.summary.scraped as u64,
                        new: output.summary.new as u64,
                        updated: output.summary.updated as u64,
                        marked_inactive: output.off_market.marked_inactive,
                    };
                    let run = self.ledger.complete_run(run.id, counts, Utc::now()).await?;
                    info!(
                        found = counts.found,
                        new = counts.new,
                        updated = counts.updated,
                        marked_inactive = counts.marked_inactive,
                        "scrape run completed"
                    );
                    Ok(RunReport {
                        run,
                        summary: output.summary,
                        termination: output.scroll.termination,
                        load_actions: output.scroll.load_actions,
                        enrichment_failures: output.enrichment_failures,
                        off_market: output.off_market,
                    })
                }
                Err(err) => {
                    warn!(error = %err, "scrape run failed");
                    if let Err(ledger_err) =
                        self.ledger.fail_run(run.id, &err.to_string(), Utc::now()).await
                    {
                        warn!(error = %ledger_err, "could not record run failure");
                    }
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        adapter: &dyn SourceAdapter,
        run_id: Uuid,
        query: &SearchQuery,
    ) -> Result<RunOutput, PipelineError> {
        let source = adapter.source();
        let active_before = self.listings.active_external_ids(source).await?;

        let driver = ScrollDriver::new(self.config.scroll_limits(adapter.max_consecutive_empty()));
        let mut session = adapter.open_search(query).await?;
        let scroll = driver.collect(session.as_mut()).await;
        if let Err(err) = session.close().await {
            warn!(error = %err, "closing search session failed");
        }

        let enrichment = match (self.config.fetch_details, adapter.detail_loader()) {
            (true, Some(loader)) if !scroll.candidates.is_empty() => {
                let image_rule = adapter.image_size_pattern().and_then(|size| {
                    ImageUpgradeRule::from_size_pattern(size)
                        .map_err(|err| warn!(error = %err, "ignoring invalid image size pattern"))
                        .ok()
                });
                DetailEnricher::new(loader, Arc::clone(&self.geo), self.config.enrich_settings())
                    .with_image_rule(image_rule)
                    .enrich(scroll.candidates.clone())
                    .await
            }
            _ => EnrichmentReport {
                listings: scroll.candidates.clone(),
                failures: Vec::new(),
            },
        };

        let engine = self.reconciliation();
        let summary = engine.reconcile(source, &enrichment.listings, run_id).await?;
        let off_market = engine
            .apply_off_market(source, &active_before, &summary.scraped_external_ids, run_id)
            .await?;

        Ok(RunOutput {
            summary,
            scroll,
            enrichment_failures: enrichment.failures,
            off_market,
        })
    }
}
