//! Listing store + scrape-run ledger contracts, their backends, and the bounded HTTP
//! fetcher used for detail pages.

use std::collections::BTreeSet;

use aptscan_core::{
    ListingKey, PersistedListing, RunCounts, ScrapeRun, ScrapedListing, Source,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod fetch;
mod memory;
mod postgres;

pub use fetch::{
    error_is_transient, status_is_transient, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher,
};
pub use memory::{MemoryStore, StoreSnapshot};
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "aptscan-storage";

/// How long a `running` run may go without being closed before `begin_run` treats it
/// as abandoned by a dead process.
pub const DEFAULT_STALE_RUN_AFTER: TimeDelta = TimeDelta::hours(6);

pub(crate) fn abandoned_run_message(stale_run_after: TimeDelta) -> String {
    format!(
        "abandoned: still running after {} minutes",
        stale_run_after.num_minutes()
    )
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a {site} scrape is already running (run {run_id})")]
    RunInProgress { site: Source, run_id: Uuid },
    #[error("scrape run {0} not found")]
    RunNotFound(Uuid),
    #[error("scrape run {0} is already closed")]
    RunClosed(Uuid),
    #[error("corrupt row: {0}")]
    CorruptRow(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffMarketStats {
    pub total_off_market: u64,
    pub recent_off_market: u64,
}

/// Persisted listing state. Every mutating call is one transaction.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn find_listing(&self, key: &ListingKey) -> Result<Option<PersistedListing>, StoreError>;

    /// Inserts a first sighting or folds the sighting into the stored row
    /// (see [`PersistedListing::absorb`]).
    async fn upsert_listing(
        &self,
        listing: &ScrapedListing,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Upserts a whole batch as one write; outcomes come back in input order.
    async fn upsert_listings(
        &self,
        listings: &[ScrapedListing],
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<UpsertOutcome>, StoreError> {
        let mut outcomes = Vec::with_capacity(listings.len());
        for listing in listings {
            outcomes.push(self.upsert_listing(listing, run_id, now).await?);
        }
        Ok(outcomes)
    }

    async fn active_external_ids(&self, source: Source) -> Result<BTreeSet<String>, StoreError>;

    /// Bulk-deactivates the still-active members of `external_ids`; returns how many
    /// rows changed. Already inactive rows are filtered out, so reapplying is a no-op.
    async fn mark_off_market(
        &self,
        source: Source,
        external_ids: &BTreeSet<String>,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// `false` when the listing is absent or already active.
    async fn reactivate(
        &self,
        key: &ListingKey,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn off_market_stats(
        &self,
        source: Option<Source>,
        since: DateTime<Utc>,
    ) -> Result<OffMarketStats, StoreError>;
}

/// Provenance for scrape runs. `begin_run` doubles as the per-source single-flight
/// guard: it fails with [`StoreError::RunInProgress`] while another run is `running`.
/// A `running` run older than the backend's stale bound is marked `failed` instead of
/// blocking, so a crashed process does not lock its source forever.
#[async_trait]
pub trait RunLedger: Send + Sync {
    async fn begin_run(
        &self,
        source: Source,
        triggered_by: &str,
        now: DateTime<Utc>,
    ) -> Result<ScrapeRun, StoreError>;

    async fn complete_run(
        &self,
        run_id: Uuid,
        counts: RunCounts,
        now: DateTime<Utc>,
    ) -> Result<ScrapeRun, StoreError>;

    async fn fail_run(
        &self,
        run_id: Uuid,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<ScrapeRun, StoreError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<ScrapeRun>, StoreError>;

    async fn recent_runs(
        &self,
        source: Option<Source>,
        limit: usize,
    ) -> Result<Vec<ScrapeRun>, StoreError>;
}
