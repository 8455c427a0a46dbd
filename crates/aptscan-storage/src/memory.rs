use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use aptscan_core::{
    ListingKey, PersistedListing, RunCounts, ScrapeRun, ScrapedListing, Source,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    abandoned_run_message, ListingStore, OffMarketStats, RunLedger, StoreError, UpsertOutcome,
    DEFAULT_STALE_RUN_AFTER,
};

/// On-disk form of a [`MemoryStore`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub listings: Vec<PersistedListing>,
    pub runs: Vec<ScrapeRun>,
}

#[derive(Debug, Clone, Default)]
struct State {
    listings: BTreeMap<ListingKey, PersistedListing>,
    runs: Vec<ScrapeRun>,
}

impl State {
    fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            listings: snapshot
                .listings
                .into_iter()
                .map(|listing| (listing.key(), listing))
                .collect(),
            runs: snapshot.runs,
        }
    }

    fn to_snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            listings: self.listings.values().cloned().collect(),
            runs: self.runs.clone(),
        }
    }

    fn run_mut(&mut self, run_id: Uuid) -> Result<&mut ScrapeRun, StoreError> {
        let run = self
            .runs
            .iter_mut()
            .find(|run| run.id == run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        if !run.is_running() {
            return Err(StoreError::RunClosed(run_id));
        }
        Ok(run)
    }

    fn upsert(&mut self, listing: &ScrapedListing, run_id: Uuid, now: DateTime<Utc>) -> UpsertOutcome {
        match self.listings.get_mut(&listing.key()) {
            Some(stored) => {
                stored.absorb(listing, run_id, now);
                UpsertOutcome::Updated
            }
            None => {
                self.listings.insert(
                    listing.key(),
                    PersistedListing::first_sighting(listing.clone(), run_id, now),
                );
                UpsertOutcome::Inserted
            }
        }
    }
}

/// Listing store and run ledger held behind one async mutex; each call holds the lock
/// for its whole duration. Optionally mirrored to a JSON snapshot file: a mutating call
/// writes the snapshot once and only commits to memory after the write succeeded.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    snapshot_path: Option<PathBuf>,
    stale_run_after: TimeDelta,
    snapshot_writes: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            state: Mutex::default(),
            snapshot_path: None,
            stale_run_after: DEFAULT_STALE_RUN_AFTER,
            snapshot_writes: AtomicU64::new(0),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `path` when it exists, otherwise starts empty; later mutations write back
    /// to `path`.
    pub async fn open_snapshot(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let state = if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking snapshot path {}", path.display()))?
        {
            let text = fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading snapshot {}", path.display()))?;
            let snapshot: StoreSnapshot = serde_json::from_str(&text)
                .with_context(|| format!("parsing snapshot {}", path.display()))?;
            State::from_snapshot(snapshot)
        } else {
            State::default()
        };
        Ok(Self {
            state: Mutex::new(state),
            snapshot_path: Some(path),
            ..Self::default()
        })
    }

    /// A `running` run that started longer ago than this is treated as abandoned by the
    /// next `begin_run` for its source.
    pub fn with_stale_run_after(mut self, after: TimeDelta) -> Self {
        self.stale_run_after = after;
        self
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        self.state.lock().await.to_snapshot()
    }

    /// Number of snapshot files written by this handle.
    pub fn snapshot_writes(&self) -> u64 {
        self.snapshot_writes.load(Ordering::Relaxed)
    }

    /// Applies `change` under the lock. `change` reports whether it modified anything;
    /// with a snapshot path the change runs on a copy that replaces the live state only
    /// once the snapshot write succeeded.
    async fn mutate<T>(
        &self,
        change: impl FnOnce(&mut State) -> Result<(T, bool), StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.state.lock().await;
        let Some(path) = &self.snapshot_path else {
            return change(&mut *state).map(|(value, _)| value);
        };
        let mut next = state.clone();
        let (value, changed) = change(&mut next)?;
        if changed {
            let bytes =
                serde_json::to_vec_pretty(&next.to_snapshot()).context("serializing snapshot")?;
            write_atomically(path, &bytes).await?;
            self.snapshot_writes.fetch_add(1, Ordering::Relaxed);
            debug!(path = %path.display(), listings = next.listings.len(), "snapshot written");
            *state = next;
        }
        Ok(value)
    }
}

/// Temp file in the target directory, then rename over the target.
async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp snapshot {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp snapshot {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp snapshot {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn find_listing(&self, key: &ListingKey) -> Result<Option<PersistedListing>, StoreError> {
        Ok(self.state.lock().await.listings.get(key).cloned())
    }

    async fn upsert_listing(
        &self,
        listing: &ScrapedListing,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        self.mutate(|state| Ok((state.upsert(listing, run_id, now), true)))
            .await
    }

    async fn upsert_listings(
        &self,
        listings: &[ScrapedListing],
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<UpsertOutcome>, StoreError> {
        self.mutate(|state| {
            let outcomes: Vec<_> = listings
                .iter()
                .map(|listing| state.upsert(listing, run_id, now))
                .collect();
            let changed = !outcomes.is_empty();
            Ok((outcomes, changed))
        })
        .await
    }

    async fn active_external_ids(&self, source: Source) -> Result<BTreeSet<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .listings
            .values()
            .filter(|l| l.listing.source == source && l.is_active)
            .map(|l| l.listing.external_id.clone())
            .collect())
    }

    async fn mark_off_market(
        &self,
        source: Source,
        external_ids: &BTreeSet<String>,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.mutate(|state| {
            let mut changed = 0u64;
            for external_id in external_ids {
                let key = ListingKey::new(source, external_id.clone());
                if let Some(stored) = state.listings.get_mut(&key) {
                    if stored.deactivate(run_id, now) {
                        changed += 1;
                    }
                }
            }
            Ok((changed, changed > 0))
        })
        .await
    }

    async fn reactivate(
        &self,
        key: &ListingKey,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.mutate(|state| {
            let changed = state
                .listings
                .get_mut(key)
                .map(|stored| stored.reactivate(run_id, now))
                .unwrap_or(false);
            Ok((changed, changed))
        })
        .await
    }

    async fn off_market_stats(
        &self,
        source: Option<Source>,
        since: DateTime<Utc>,
    ) -> Result<OffMarketStats, StoreError> {
        let state = self.state.lock().await;
        let mut stats = OffMarketStats::default();
        for stored in state.listings.values() {
            if stored.is_active || source.is_some_and(|s| s != stored.listing.source) {
                continue;
            }
            stats.total_off_market += 1;
            if stored.deactivated_at.is_some_and(|at| at >= since) {
                stats.recent_off_market += 1;
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl RunLedger for MemoryStore {
    async fn begin_run(
        &self,
        source: Source,
        triggered_by: &str,
        now: DateTime<Utc>,
    ) -> Result<ScrapeRun, StoreError> {
        let stale_run_after = self.stale_run_after;
        self.mutate(|state| {
            let cutoff = now.checked_sub_signed(stale_run_after);
            for run in state
                .runs
                .iter_mut()
                .filter(|run| run.source == source && run.is_running())
            {
                if cutoff.is_some_and(|cutoff| run.started_at < cutoff) {
                    warn!(
                        run_id = %run.id,
                        source = %source,
                        started_at = %run.started_at,
                        "reclaiming abandoned scrape run"
                    );
                    run.fail(abandoned_run_message(stale_run_after), now);
                } else {
                    return Err(StoreError::RunInProgress {
                        site: source,
                        run_id: run.id,
                    });
                }
            }
            let run = ScrapeRun::start(source, triggered_by, now);
            state.runs.push(run.clone());
            Ok((run, true))
        })
        .await
    }

    async fn complete_run(
        &self,
        run_id: Uuid,
        counts: RunCounts,
        now: DateTime<Utc>,
    ) -> Result<ScrapeRun, StoreError> {
        self.mutate(|state| {
            let run = state.run_mut(run_id)?;
            run.complete(counts, now);
            Ok((run.clone(), true))
        })
        .await
    }

    async fn fail_run(
        &self,
        run_id: Uuid,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<ScrapeRun, StoreError> {
        self.mutate(|state| {
            let run = state.run_mut(run_id)?;
            run.fail(message, now);
            Ok((run.clone(), true))
        })
        .await
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<ScrapeRun>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.runs.iter().find(|run| run.id == run_id).cloned())
    }

    async fn recent_runs(
        &self,
        source: Option<Source>,
        limit: usize,
    ) -> Result<Vec<ScrapeRun>, StoreError> {
        let state = self.state.lock().await;
        let mut runs: Vec<_> = state
            .runs
            .iter()
            .filter(|run| source.map_or(true, |s| s == run.source))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }
}
#[cfg(test)]
mod tests {
    use super::*;
    use aptscan_core::{LaundryType, RunStatus};
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, minute, 0).single().unwrap()
    }

    fn listing(id: &str, price: u32) -> ScrapedListing {
        let mut listing = ScrapedListing::new(Source::Craigslist, id, format!("https://cl.test/{id}"));
        listing.price = price;
        listing
    }

    #[tokio::test]
    async fn upsert_inserts_then_updates_by_key() {
        let store = MemoryStore::new();
        let run = Uuid::new_v4();

        let first = store.upsert_listing(&listing("a", 2000), run, ts(0)).await.unwrap();
        let mut seen = listing("a", 2100);
        seen.laundry_type = Some(LaundryType::InUnit);
        let second = store.upsert_listing(&seen, run, ts(5)).await.unwrap();

        assert_eq!(first, UpsertOutcome::Inserted);
        assert_eq!(second, UpsertOutcome::Updated);

        let stored = store
            .find_listing(&ListingKey::new(Source::Craigslist, "a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.listing.price, 2100);
        assert_eq!(stored.listing.laundry_type, Some(LaundryType::InUnit));
        assert_eq!(stored.first_seen, ts(0));
        assert_eq!(stored.last_seen, ts(5));
        assert_eq!(store.snapshot().await.listings.len(), 1);
    }

    #[tokio::test]
    async fn same_external_id_on_other_source_is_a_distinct_listing() {
        let store = MemoryStore::new();
        let run = Uuid::new_v4();
        let mut other = listing("a", 2000);
        other.source = Source::StreetEasy;

        store.upsert_listing(&listing("a", 2000), run, ts(0)).await.unwrap();
        let outcome = store.upsert_listing(&other, run, ts(0)).await.unwrap();

        assert_eq!(outcome, UpsertOutcome::Inserted);
        assert_eq!(
            store.active_external_ids(Source::StreetEasy).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn off_market_is_filtered_by_activity_and_idempotent() {
        let store = MemoryStore::new();
        let run = Uuid::new_v4();
        for id in ["a", "b", "c"] {
            store.upsert_listing(&listing(id, 1500), run, ts(0)).await.unwrap();
        }
        let gone: BTreeSet<String> = ["a", "b", "zz"].iter().map(|s| s.to_string()).collect();

        assert_eq!(store.mark_off_market(Source::Craigslist, &gone, run, ts(1)).await.unwrap(), 2);
        assert_eq!(store.mark_off_market(Source::Craigslist, &gone, run, ts(2)).await.unwrap(), 0);

        let a = store
            .find_listing(&ListingKey::new(Source::Craigslist, "a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.deactivated_at, Some(ts(1)));
        assert!(a.activity_consistent());

        let active = store.active_external_ids(Source::Craigslist).await.unwrap();
        assert_eq!(active.into_iter().collect::<Vec<_>>(), vec!["c".to_string()]);

        let stats = store.off_market_stats(Some(Source::Craigslist), ts(1)).await.unwrap();
        assert_eq!(stats.total_off_market, 2);
        assert_eq!(stats.recent_off_market, 2);
        let stats = store.off_market_stats(None, ts(30)).await.unwrap();
        assert_eq!(stats.recent_off_market, 0);
    }

    #[tokio::test]
    async fn reactivate_only_touches_inactive_rows() {
        let store = MemoryStore::new();
        let run = Uuid::new_v4();
        let key = ListingKey::new(Source::Craigslist, "a");

        assert!(!store.reactivate(&key, run, ts(0)).await.unwrap());
        store.upsert_listing(&listing("a", 1500), run, ts(0)).await.unwrap();
        assert!(!store.reactivate(&key, run, ts(1)).await.unwrap());

        let ids = BTreeSet::from(["a".to_string()]);
        store.mark_off_market(Source::Craigslist, &ids, run, ts(2)).await.unwrap();
        assert!(store.reactivate(&key, run, ts(3)).await.unwrap());

        let stored = store.find_listing(&key).await.unwrap().unwrap();
        assert!(stored.is_active);
        assert_eq!(stored.deactivated_at, None);
        assert_eq!(stored.last_seen, ts(3));
    }

    #[tokio::test]
    async fn ledger_allows_one_running_run_per_source() {
        let store = MemoryStore::new();
        let run = store.begin_run(Source::Craigslist, "manual", ts(0)).await.unwrap();

        let err = store
            .begin_run(Source::Craigslist, "scheduled", ts(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RunInProgress { run_id, .. } if run_id == run.id));
        store.begin_run(Source::StreetEasy, "manual", ts(1)).await.unwrap();

        let closed = store
            .complete_run(run.id, RunCounts { found: 3, new: 3, updated: 0, marked_inactive: 0 }, ts(2))
            .await
            .unwrap();
        assert_eq!(closed.status, RunStatus::Completed);
        assert!(matches!(
            store.fail_run(run.id, "late", ts(3)).await.unwrap_err(),
            StoreError::RunClosed(_)
        ));

        store.begin_run(Source::Craigslist, "scheduled", ts(4)).await.unwrap();
        let recent = store.recent_runs(Some(Source::Craigslist), 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].started_at, ts(4));
    }

    #[tokio::test]
    async fn running_run_from_a_dead_process_is_reclaimed_once_stale() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("aptscan.json");
        let orphan = {
            let store = MemoryStore::open_snapshot(&path).await.unwrap();
            store.begin_run(Source::Craigslist, "scheduled", ts(0)).await.unwrap()
        };

        let reopened = MemoryStore::open_snapshot(&path)
            .await
            .unwrap()
            .with_stale_run_after(TimeDelta::minutes(30));
        let err = reopened
            .begin_run(Source::Craigslist, "scheduled", ts(29))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RunInProgress { run_id, .. } if run_id == orphan.id));

        let later = ts(0) + TimeDelta::days(30);
        let fresh = reopened.begin_run(Source::Craigslist, "scheduled", later).await.unwrap();
        assert!(fresh.is_running());

        let old = reopened.get_run(orphan.id).await.unwrap().unwrap();
        assert_eq!(old.status, RunStatus::Failed);
        assert_eq!(old.completed_at, Some(later));
        assert!(old.error_message.unwrap_or_default().starts_with("abandoned"));
        let running = reopened
            .recent_runs(Some(Source::Craigslist), 10)
            .await
            .unwrap()
            .into_iter()
            .filter(|run| run.is_running())
            .count();
        assert_eq!(running, 1);
    }

    #[tokio::test]
    async fn failed_snapshot_write_leaves_memory_untouched() {
        let dir = tempdir().expect("tempdir");
        let state_dir = dir.path().join("state");
        let store = MemoryStore::open_snapshot(state_dir.join("aptscan.json")).await.unwrap();
        let run = store.begin_run(Source::Craigslist, "manual", ts(0)).await.unwrap();
        let before = store.snapshot().await;

        // A plain file where the snapshot directory should be makes every write fail.
        std::fs::remove_dir_all(&state_dir).unwrap();
        std::fs::write(&state_dir, b"").unwrap();

        assert!(store.upsert_listing(&listing("a", 1900), run.id, ts(1)).await.is_err());
        assert!(store
            .upsert_listings(&[listing("b", 2000), listing("c", 2100)], run.id, ts(1))
            .await
            .is_err());
        assert!(store.fail_run(run.id, "browser crashed", ts(2)).await.is_err());

        assert_eq!(store.snapshot().await, before);
        assert_eq!(store.snapshot_writes(), 1);
        let stored = store.get_run(run.id).await.unwrap().unwrap();
        assert!(stored.is_running());
        assert!(store
            .find_listing(&ListingKey::new(Source::Craigslist, "a"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn batch_upsert_writes_one_snapshot() {
        let dir = tempdir().expect("tempdir");
        let store = MemoryStore::open_snapshot(dir.path().join("aptscan.json")).await.unwrap();
        let run = Uuid::new_v4();
        let batch: Vec<_> = ["a", "b", "a"].iter().map(|id| listing(id, 1800)).collect();

        let outcomes = store.upsert_listings(&batch, run, ts(0)).await.unwrap();
        assert_eq!(
            outcomes,
            vec![UpsertOutcome::Inserted, UpsertOutcome::Inserted, UpsertOutcome::Updated]
        );
        assert_eq!(store.snapshot_writes(), 1);

        assert!(store.upsert_listings(&[], run, ts(1)).await.unwrap().is_empty());
        let none = BTreeSet::new();
        store.mark_off_market(Source::Craigslist, &none, run, ts(1)).await.unwrap();
        assert_eq!(store.snapshot_writes(), 1);
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_disk() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state").join("aptscan.json");
        let run_id;
        {
            let store = MemoryStore::open_snapshot(&path).await.unwrap();
            let run = store.begin_run(Source::Craigslist, "manual", ts(0)).await.unwrap();
            run_id = run.id;
            store.upsert_listing(&listing("a", 1900), run.id, ts(0)).await.unwrap();
            store.fail_run(run.id, "browser crashed", ts(1)).await.unwrap();
        }

        let reopened = MemoryStore::open_snapshot(&path).await.unwrap();
        let run = reopened.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_message.as_deref(), Some("browser crashed"));
        assert_eq!(
            reopened.active_external_ids(Source::Craigslist).await.unwrap().len(),
            1
        );
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .map(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(leftovers, 0);
    }
}
