//! Folds a run's listings into persisted state and decides what went off-market.

use std::collections::BTreeSet;
use std::sync::Arc;

use aptscan_core::{ListingKey, ScrapeSummary, ScrapedListing, Source};
use aptscan_storage::{ListingStore, StoreError, UpsertOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_COVERAGE_THRESHOLD: f64 = 0.5;

/// `|scraped| / |active_before|`, or `None` when nothing was active before.
pub fn coverage_ratio(active_before: usize, scraped: usize) -> Option<f64> {
    if active_before == 0 {
        None
    } else {
        Some(scraped as f64 / active_before as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "gate", rename_all = "snake_case")]
pub enum GateDecision {
    /// `ratio` is `None` when there was no prior active set (vacuous coverage).
    Open { ratio: Option<f64> },
    Closed { ratio: f64 },
}

impl GateDecision {
    pub fn is_open(&self) -> bool {
        matches!(self, GateDecision::Open { .. })
    }
}

/// Deactivation only proceeds when a run re-observed enough of the previously active
/// listings; a partial scrape must not mass-deactivate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoverageGate {
    threshold: f64,
}

impl Default for CoverageGate {
    fn default() -> Self {
        Self::new(DEFAULT_COVERAGE_THRESHOLD)
    }
}

impl CoverageGate {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn evaluate(&self, active_before: &BTreeSet<String>, scraped: &BTreeSet<String>) -> GateDecision {
        match coverage_ratio(active_before.len(), scraped.len()) {
            None => GateDecision::Open { ratio: None },
            Some(ratio) if ratio >= self.threshold => GateDecision::Open { ratio: Some(ratio) },
            Some(ratio) => GateDecision::Closed { ratio },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OffMarketOutcome {
    pub decision: GateDecision,
    /// `active_before − scraped`, whether or not the gate let it through.
    pub disappeared: usize,
    pub marked_inactive: u64,
}

pub struct ReconciliationEngine {
    store: Arc<dyn ListingStore>,
    gate: CoverageGate,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn ListingStore>, gate: CoverageGate) -> Self {
        Self { store, gate }
    }

    pub fn gate(&self) -> CoverageGate {
        self.gate
    }

    pub async fn reconcile(
        &self,
        source: Source,
        listings: &[ScrapedListing],
        run_id: Uuid,
    ) -> Result<ScrapeSummary, StoreError> {
        self.reconcile_at(source, listings, run_id, Utc::now()).await
    }

    /// Upserts every listing by `(source, external_id)` in a single store write.
    /// Rows are never deleted; a store error aborts the whole batch.
    pub async fn reconcile_at(
        &self,
        source: Source,
        listings: &[ScrapedListing],
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ScrapeSummary, StoreError> {
        let own: Vec<ScrapedListing> = listings
            .iter()
            .filter(|listing| {
                if listing.source != source {
                    warn!(
                        expected = %source,
                        found = %listing.source,
                        external_id = %listing.external_id,
                        "skipping listing from another source"
                    );
                }
                listing.source == source
            })
            .cloned()
            .collect();

        let outcomes = self.store.upsert_listings(&own, run_id, now).await?;
        let mut summary = ScrapeSummary {
            source,
            scraped: own.len(),
            new: 0,
            updated: 0,
            scraped_external_ids: own.iter().map(|l| l.external_id.clone()).collect(),
        };
        for outcome in outcomes {
            match outcome {
                UpsertOutcome::Inserted => summary.new += 1,
                UpsertOutcome::Updated => summary.updated += 1,
            }
        }

        info!(
            %source,
            scraped = summary.scraped,
            new = summary.new,
            updated = summary.updated,
            "reconciled listings"
        );
        Ok(summary)
    }

    pub async fn apply_off_market(
        &self,
        source: Source,
        active_before: &BTreeSet<String>,
        scraped: &BTreeSet<String>,
        run_id: Uuid,
    ) -> Result<OffMarketOutcome, StoreError> {
        self.apply_off_market_at(source, active_before, scraped, run_id, Utc::now())
            .await
    }

    /// A closed gate is a logged no-op, not an error.
    pub async fn apply_off_market_at(
        &self,
        source: Source,
        active_before: &BTreeSet<String>,
        scraped: &BTreeSet<String>,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<OffMarketOutcome, StoreError> {
        let disappeared: BTreeSet<String> = active_before.difference(scraped).cloned().collect();
        let decision = self.gate.evaluate(active_before, scraped);

        let marked_inactive = match decision {
            GateDecision::Closed { ratio } => {
                warn!(
                    %source,
                    ratio,
                    threshold = self.gate.threshold(),
                    active_before = active_before.len(),
                    scraped = scraped.len(),
                    disappeared = disappeared.len(),
                    "coverage too low, skipping off-market detection"
                );
                0
            }
            GateDecision::Open { ratio } => {
                let marked = self
                    .store
                    .mark_off_market(source, &disappeared, run_id, now)
                    .await?;
                info!(%source, ?ratio, disappeared = disappeared.len(), marked, "off-market applied");
                marked
            }
        };

        Ok(OffMarketOutcome {
            decision,
            disappeared: disappeared.len(),
            marked_inactive,
        })
    }

    /// No-op (`false`) when the listing is absent or already active.
    pub async fn reactivate(&self, key: &ListingKey, run_id: Uuid) -> Result<bool, StoreError> {
        let reactivated = self.store.reactivate(key, run_id, Utc::now()).await?;
        if reactivated {
            info!(%key, "listing reactivated");
        }
        Ok(reactivated)
    }
}
