use std::collections::BTreeSet;

use aptscan_core::{
    LaundryType, ListingKey, PersistedListing, RunCounts, RunStatus, ScrapeRun, ScrapedListing,
    Source,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Postgres, Row};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    abandoned_run_message, ListingStore, OffMarketStats, RunLedger, StoreError, UpsertOutcome,
    DEFAULT_STALE_RUN_AFTER,
};

const LISTING_COLUMNS: &str = "source, external_id, url, title, price, bedrooms, bathrooms, \
    neighborhood, address, sqft, laundry_type, amenities, images, description, latitude, \
    longitude, first_seen, last_seen, is_active, deactivated_at, last_scrape_run_id";

const RUN_COLUMNS: &str = "id, source, started_at, completed_at, status, listings_found, \
    listings_new, listings_updated, listings_marked_inactive, triggered_by, error_message";

// The conflict branch mirrors `PersistedListing::absorb`.
const UPSERT_LISTING: &str = r#"
INSERT INTO listings (
    source, external_id, url, title, price, bedrooms, bathrooms, neighborhood, address,
    sqft, laundry_type, amenities, images, description, latitude, longitude,
    first_seen, last_seen, is_active, deactivated_at, last_scrape_run_id
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $17, TRUE, NULL, $18)
ON CONFLICT (source, external_id) DO UPDATE SET
    price = EXCLUDED.price,
    images = CASE WHEN jsonb_array_length(EXCLUDED.images) > 0
        THEN EXCLUDED.images ELSE listings.images END,
    latitude = CASE WHEN EXCLUDED.latitude IS NOT NULL AND EXCLUDED.longitude IS NOT NULL
        THEN EXCLUDED.latitude ELSE listings.latitude END,
    longitude = CASE WHEN EXCLUDED.latitude IS NOT NULL AND EXCLUDED.longitude IS NOT NULL
        THEN EXCLUDED.longitude ELSE listings.longitude END,
    neighborhood = CASE WHEN btrim(EXCLUDED.neighborhood) <> ''
            AND ((EXCLUDED.latitude IS NOT NULL AND EXCLUDED.longitude IS NOT NULL)
                OR listings.latitude IS NULL OR listings.longitude IS NULL)
        THEN EXCLUDED.neighborhood ELSE listings.neighborhood END,
    laundry_type = COALESCE(EXCLUDED.laundry_type, listings.laundry_type),
    last_seen = EXCLUDED.last_seen,
    is_active = TRUE,
    deactivated_at = NULL,
    last_scrape_run_id = EXCLUDED.last_scrape_run_id
RETURNING (xmax = 0) AS inserted
"#;

/// Postgres-backed listing store and run ledger.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    stale_run_after: TimeDelta,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            stale_run_after: DEFAULT_STALE_RUN_AFTER,
        }
    }

    /// See [`crate::MemoryStore::with_stale_run_after`].
    pub fn with_stale_run_after(mut self, after: TimeDelta) -> Self {
        self.stale_run_after = after;
        self
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    async fn running_run_id(&self, source: Source) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query("SELECT id FROM scrape_runs WHERE source = $1 AND status = 'running'")
            .bind(source.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.try_get::<Uuid, _>("id").map_err(StoreError::from))
            .transpose()
    }

    async fn close_run(
        &self,
        run_id: Uuid,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<ScrapeRun, StoreError> {
        match query.fetch_optional(&self.pool).await? {
            Some(row) => run_from_row(&row),
            None => match self.get_run(run_id).await? {
                Some(_) => Err(StoreError::RunClosed(run_id)),
                None => Err(StoreError::RunNotFound(run_id)),
            },
        }
    }
}

fn corrupt(err: impl std::fmt::Display) -> StoreError {
    StoreError::CorruptRow(err.to_string())
}

fn to_u32(value: i64, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| corrupt(format!("{column} out of range: {value}")))
}

fn to_u64(value: i64, column: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| corrupt(format!("{column} out of range: {value}")))
}

fn listing_from_row(row: &PgRow) -> Result<PersistedListing, StoreError> {
    let source: String = row.try_get("source")?;
    let laundry: Option<String> = row.try_get("laundry_type")?;
    let sqft: Option<i32> = row.try_get("sqft")?;
    let Json(amenities): Json<Vec<String>> = row.try_get("amenities")?;
    let Json(images): Json<Vec<String>> = row.try_get("images")?;

    let listing = ScrapedListing {
        external_id: row.try_get("external_id")?,
        source: source.parse().map_err(corrupt)?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        price: to_u32(row.try_get("price")?, "price")?,
        bedrooms: to_u32(i64::from(row.try_get::<i32, _>("bedrooms")?), "bedrooms")?,
        bathrooms: row.try_get("bathrooms")?,
        neighborhood: row.try_get("neighborhood")?,
        address: row.try_get("address")?,
        sqft: sqft.map(|v| to_u32(i64::from(v), "sqft")).transpose()?,
        laundry_type: laundry
            .map(|v| v.parse::<LaundryType>().map_err(corrupt))
            .transpose()?,
        amenities,
        images,
        description: row.try_get("description")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
    };

    Ok(PersistedListing {
        listing,
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
        is_active: row.try_get("is_active")?,
        deactivated_at: row.try_get("deactivated_at")?,
        last_scrape_run_id: row.try_get("last_scrape_run_id")?,
    })
}

fn run_from_row(row: &PgRow) -> Result<ScrapeRun, StoreError> {
    let source: String = row.try_get("source")?;
    let status: String = row.try_get("status")?;
    Ok(ScrapeRun {
        id: row.try_get("id")?,
        source: source.parse().map_err(corrupt)?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        status: status.parse::<RunStatus>().map_err(corrupt)?,
        listings_found: to_u64(row.try_get("listings_found")?, "listings_found")?,
        listings_new: to_u64(row.try_get("listings_new")?, "listings_new")?,
        listings_updated: to_u64(row.try_get("listings_updated")?, "listings_updated")?,
        listings_marked_inactive: to_u64(
            row.try_get("listings_marked_inactive")?,
            "listings_marked_inactive",
        )?,
        triggered_by: row.try_get("triggered_by")?,
        error_message: row.try_get("error_message")?,
    })
}

fn upsert_query<'q>(
    listing: &'q ScrapedListing,
    run_id: Uuid,
    now: DateTime<Utc>,
) -> Query<'q, Postgres, PgArguments> {
    sqlx::query(UPSERT_LISTING)
        .bind(listing.source.as_str())
        .bind(&listing.external_id)
        .bind(&listing.url)
        .bind(&listing.title)
        .bind(i64::from(listing.price))
        .bind(i32::try_from(listing.bedrooms).unwrap_or(i32::MAX))
        .bind(listing.bathrooms)
        .bind(&listing.neighborhood)
        .bind(&listing.address)
        .bind(listing.sqft.map(|v| i32::try_from(v).unwrap_or(i32::MAX)))
        .bind(listing.laundry_type.map(|l| l.as_str()))
        .bind(Json(&listing.amenities))
        .bind(Json(&listing.images))
        .bind(listing.description.as_deref())
        .bind(listing.latitude)
        .bind(listing.longitude)
        .bind(now)
        .bind(run_id)
}

fn upsert_outcome(row: &PgRow) -> Result<UpsertOutcome, StoreError> {
    let inserted: bool = row.try_get("inserted")?;
    Ok(if inserted {
        UpsertOutcome::Inserted
    } else {
        UpsertOutcome::Updated
    })
}

fn count_as_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl ListingStore for PgStore {
    async fn find_listing(&self, key: &ListingKey) -> Result<Option<PersistedListing>, StoreError> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE source = $1 AND external_id = $2");
        let row = sqlx::query(&sql)
            .bind(key.source.as_str())
            .bind(&key.external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn upsert_listing(
        &self,
        listing: &ScrapedListing,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let row = upsert_query(listing, run_id, now)
            .fetch_one(&self.pool)
            .await?;
        upsert_outcome(&row)
    }

    async fn upsert_listings(
        &self,
        listings: &[ScrapedListing],
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<UpsertOutcome>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut outcomes = Vec::with_capacity(listings.len());
        for listing in listings {
            let row = upsert_query(listing, run_id, now)
                .fetch_one(&mut *tx)
                .await?;
            outcomes.push(upsert_outcome(&row)?);
        }
        tx.commit().await?;
        Ok(outcomes)
    }

    async fn active_external_ids(&self, source: Source) -> Result<BTreeSet<String>, StoreError> {
        let rows = sqlx::query("SELECT external_id FROM listings WHERE source = $1 AND is_active")
            .bind(source.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("external_id").map_err(StoreError::from))
            .collect()
    }

    async fn mark_off_market(
        &self,
        source: Source,
        external_ids: &BTreeSet<String>,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if external_ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = external_ids.iter().cloned().collect();
        let result = sqlx::query(
            "UPDATE listings \
             SET is_active = FALSE, deactivated_at = $3, last_scrape_run_id = $4 \
             WHERE source = $1 AND external_id = ANY($2) AND is_active",
        )
        .bind(source.as_str())
        .bind(&ids)
        .bind(now)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn reactivate(
        &self,
        key: &ListingKey,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE listings \
             SET is_active = TRUE, deactivated_at = NULL, last_seen = $3, last_scrape_run_id = $4 \
             WHERE source = $1 AND external_id = $2 AND NOT is_active",
        )
        .bind(key.source.as_str())
        .bind(&key.external_id)
        .bind(now)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn off_market_stats(
        &self,
        source: Option<Source>,
        since: DateTime<Utc>,
    ) -> Result<OffMarketStats, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, \
                    COUNT(*) FILTER (WHERE deactivated_at >= $2) AS recent \
             FROM listings \
             WHERE NOT is_active AND ($1::text IS NULL OR source = $1)",
        )
        .bind(source.map(|s| s.as_str()))
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(OffMarketStats {
            total_off_market: to_u64(row.try_get("total")?, "total")?,
            recent_off_market: to_u64(row.try_get("recent")?, "recent")?,
        })
    }
}

#[async_trait]
impl RunLedger for PgStore {
    async fn begin_run(
        &self,
        source: Source,
        triggered_by: &str,
        now: DateTime<Utc>,
    ) -> Result<ScrapeRun, StoreError> {
        let run = ScrapeRun::start(source, triggered_by, now);
        let mut tx = self.pool.begin().await?;

        if let Some(cutoff) = now.checked_sub_signed(self.stale_run_after) {
            let reclaimed = sqlx::query(
                "UPDATE scrape_runs \
                 SET status = 'failed', completed_at = $3, error_message = $4 \
                 WHERE source = $1 AND status = 'running' AND started_at < $2 \
                 RETURNING id",
            )
            .bind(source.as_str())
            .bind(cutoff)
            .bind(now)
            .bind(abandoned_run_message(self.stale_run_after))
            .fetch_all(&mut *tx)
            .await?;
            for row in &reclaimed {
                let run_id: Uuid = row.try_get("id")?;
                warn!(run_id = %run_id, source = %source, "reclaiming abandoned scrape run");
            }
        }

        let inserted = sqlx::query(
            "INSERT INTO scrape_runs (id, source, started_at, status, triggered_by) \
             VALUES ($1, $2, $3, 'running', $4)",
        )
        .bind(run.id)
        .bind(source.as_str())
        .bind(now)
        .bind(&run.triggered_by)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {
                tx.commit().await?;
                Ok(run)
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                drop(tx);
                let run_id = self.running_run_id(source).await?.unwrap_or_default();
                Err(StoreError::RunInProgress {
                    site: source,
                    run_id,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn complete_run(
        &self,
        run_id: Uuid,
        counts: RunCounts,
        now: DateTime<Utc>,
    ) -> Result<ScrapeRun, StoreError> {
        let sql = format!(
            "UPDATE scrape_runs \
             SET status = 'completed', completed_at = $2, listings_found = $3, listings_new = $4, \
                 listings_updated = $5, listings_marked_inactive = $6 \
             WHERE id = $1 AND status = 'running' \
             RETURNING {RUN_COLUMNS}"
        );
        let query = sqlx::query(&sql)
            .bind(run_id)
            .bind(now)
            .bind(count_as_i64(counts.found))
            .bind(count_as_i64(counts.new))
            .bind(count_as_i64(counts.updated))
            .bind(count_as_i64(counts.marked_inactive));
        self.close_run(run_id, query).await
    }

    async fn fail_run(
        &self,
        run_id: Uuid,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<ScrapeRun, StoreError> {
        let sql = format!(
            "UPDATE scrape_runs \
             SET status = 'failed', completed_at = $2, error_message = $3 \
             WHERE id = $1 AND status = 'running' \
             RETURNING {RUN_COLUMNS}"
        );
        let query = sqlx::query(&sql).bind(run_id).bind(now).bind(message);
        self.close_run(run_id, query).await
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<ScrapeRun>, StoreError> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM scrape_runs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn recent_runs(
        &self,
        source: Option<Source>,
        limit: usize,
    ) -> Result<Vec<ScrapeRun>, StoreError> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM scrape_runs \
             WHERE ($1::text IS NULL OR source = $1) \
             ORDER BY started_at DESC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(source.map(|s| s.as_str()))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(run_from_row).collect()
    }
}
