//! Core rental-listing model and merge rules for aptscan.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "aptscan-core";

/// Listing site a record was harvested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    StreetEasy,
    Zillow,
    Craigslist,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::StreetEasy, Source::Zillow, Source::Craigslist];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::StreetEasy => "streeteasy",
            Source::Zillow => "zillow",
            Source::Craigslist => "craigslist",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown source: {0}")]
pub struct UnknownSource(pub String);

impl FromStr for Source {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Source::ALL
            .into_iter()
            .find(|source| source.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownSource(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LaundryType {
    #[serde(rename = "in_unit")]
    InUnit,
    #[serde(rename = "building")]
    Building,
    #[serde(rename = "none")]
    NoLaundry,
}

impl LaundryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaundryType::InUnit => "in_unit",
            LaundryType::Building => "building",
            LaundryType::NoLaundry => "none",
        }
    }
}

impl FromStr for LaundryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_unit" => Ok(LaundryType::InUnit),
            "building" => Ok(LaundryType::Building),
            "none" => Ok(LaundryType::NoLaundry),
            other => Err(format!("unknown laundry type: {other}")),
        }
    }
}

/// Identity of a listing: unique and immutable once persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListingKey {
    pub source: Source,
    pub external_id: String,
}

impl ListingKey {
    pub fn new(source: Source, external_id: impl Into<String>) -> Self {
        Self {
            source,
            external_id: external_id.into(),
        }
    }
}

impl fmt::Display for ListingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.external_id)
    }
}

/// A listing as seen during one scrape: a search-result candidate, possibly enriched
/// from its detail page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedListing {
    pub external_id: String,
    pub source: Source,
    pub url: String,
    pub title: String,
    pub price: u32,
    pub bedrooms: u32,
    pub bathrooms: f64,
    pub neighborhood: String,
    pub address: String,
    #[serde(default)]
    pub sqft: Option<u32>,
    #[serde(default)]
    pub laundry_type: Option<LaundryType>,
    #[serde(default)]
    pub amenities: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

impl ScrapedListing {
    pub fn new(source: Source, external_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            source,
            url: url.into(),
            title: String::new(),
            price: 0,
            bedrooms: 0,
            bathrooms: 0.0,
            neighborhood: String::new(),
            address: String::new(),
            sqft: None,
            laundry_type: None,
            amenities: Vec::new(),
            images: Vec::new(),
            description: None,
            latitude: None,
            longitude: None,
        }
    }

    pub fn key(&self) -> ListingKey {
        ListingKey::new(self.source, self.external_id.clone())
    }

    /// `(lat, lon)` when both halves are known.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        self.latitude.zip(self.longitude)
    }
}

/// Stored listing state across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedListing {
    #[serde(flatten)]
    pub listing: ScrapedListing,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub is_active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub last_scrape_run_id: Option<Uuid>,
}

impl PersistedListing {
    pub fn first_sighting(listing: ScrapedListing, run_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            listing,
            first_seen: now,
            last_seen: now,
            is_active: true,
            deactivated_at: None,
            last_scrape_run_id: Some(run_id),
        }
    }

    pub fn key(&self) -> ListingKey {
        self.listing.key()
    }

    /// Folds a fresh sighting into the stored row. Only fields the sighting actually
    /// resolved overwrite stored values; price always follows the latest sighting.
    /// A sighting without coordinates cannot replace the neighborhood of a row that has
    /// them, since that name came from the geo lookup.
    pub fn absorb(&mut self, seen: &ScrapedListing, run_id: Uuid, now: DateTime<Utc>) {
        let may_rename = seen.coordinates().is_some() || self.listing.coordinates().is_none();
        self.listing.price = seen.price;
        if !seen.images.is_empty() {
            self.listing.images = seen.images.clone();
        }
        if let Some((lat, lon)) = seen.coordinates() {
            self.listing.latitude = Some(lat);
            self.listing.longitude = Some(lon);
        }
        if may_rename && !seen.neighborhood.trim().is_empty() {
            self.listing.neighborhood = seen.neighborhood.clone();
        }
        if seen.laundry_type.is_some() {
            self.listing.laundry_type = seen.laundry_type;
        }
        self.last_seen = now;
        self.is_active = true;
        self.deactivated_at = None;
        self.last_scrape_run_id = Some(run_id);
    }

    /// Returns `false` when the row was already inactive.
    pub fn deactivate(&mut self, run_id: Uuid, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        self.is_active = false;
        self.deactivated_at = Some(now);
        self.last_scrape_run_id = Some(run_id);
        true
    }

    /// Returns `false` when the row was already active.
    pub fn reactivate(&mut self, run_id: Uuid, now: DateTime<Utc>) -> bool {
        if self.is_active {
            return false;
        }
        self.is_active = true;
        self.deactivated_at = None;
        self.last_seen = now;
        self.last_scrape_run_id = Some(run_id);
        true
    }

    /// `is_active == false` exactly when `deactivated_at` is set.
    pub fn activity_consistent(&self) -> bool {
        self.is_active == self.deactivated_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub found: u64,
    pub new: u64,
    pub updated: u64,
    pub marked_inactive: u64,
}

/// Provenance record for one scrape execution. Created at start, closed once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeRun {
    pub id: Uuid,
    pub source: Source,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub listings_found: u64,
    pub listings_new: u64,
    pub listings_updated: u64,
    pub listings_marked_inactive: u64,
    pub triggered_by: String,
    pub error_message: Option<String>,
}

impl ScrapeRun {
    pub fn start(source: Source, triggered_by: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            started_at: now,
            completed_at: None,
            status: RunStatus::Running,
            listings_found: 0,
            listings_new: 0,
            listings_updated: 0,
            listings_marked_inactive: 0,
            triggered_by: triggered_by.into(),
            error_message: None,
        }
    }

    pub fn complete(&mut self, counts: RunCounts, now: DateTime<Utc>) {
        self.status = RunStatus::Completed;
        self.completed_at = Some(now);
        self.listings_found = counts.found;
        self.listings_new = counts.new;
        self.listings_updated = counts.updated;
        self.listings_marked_inactive = counts.marked_inactive;
    }

    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = RunStatus::Failed;
        self.completed_at = Some(now);
        self.error_message = Some(message.into());
    }

    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }
}

/// What a successful scrape hands back to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeSummary {
    pub source: Source,
    pub scraped: usize,
    pub new: usize,
    pub updated: usize,
    pub scraped_external_ids: BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    fn sample() -> ScrapedListing {
        let mut listing = ScrapedListing::new(Source::Craigslist, "7712", "https://example.test/7712");
        listing.price = 2400;
        listing.neighborhood = "Astoria".into();
        listing.images = vec!["https://img.test/a_600x450.jpg".into()];
        listing.latitude = Some(40.77);
        listing.longitude = Some(-73.92);
        listing.laundry_type = Some(LaundryType::Building);
        listing
    }

    #[test]
    fn source_parses_case_insensitively_and_rejects_unknown() {
        assert_eq!("Craigslist".parse::<Source>().unwrap(), Source::Craigslist);
        assert_eq!(" streeteasy ".parse::<Source>().unwrap(), Source::StreetEasy);
        let err = "renthop".parse::<Source>().unwrap_err();
        assert_eq!(err.to_string(), "unknown source: renthop");
    }

    #[test]
    fn laundry_serializes_with_wire_names() {
        let json = serde_json::to_string(&LaundryType::NoLaundry).unwrap();
        assert_eq!(json, "\"none\"");
        let parsed: LaundryType = serde_json::from_str("\"in_unit\"").unwrap();
        assert_eq!(parsed, LaundryType::InUnit);
    }

    #[test]
    fn absorb_keeps_stored_values_the_sighting_did_not_resolve() {
        let run_a = Uuid::new_v4();
        let run_b = Uuid::new_v4();
        let mut stored = PersistedListing::first_sighting(sample(), run_a, ts(1));

        let mut seen = ScrapedListing::new(Source::Craigslist, "7712", "https://example.test/7712");
        seen.price = 2350;
        stored.absorb(&seen, run_b, ts(2));

        assert_eq!(stored.listing.price, 2350);
        assert_eq!(stored.listing.images.len(), 1);
        assert_eq!(stored.listing.coordinates(), Some((40.77, -73.92)));
        assert_eq!(stored.listing.neighborhood, "Astoria");
        assert_eq!(stored.listing.laundry_type, Some(LaundryType::Building));
        assert_eq!(stored.first_seen, ts(1));
        assert_eq!(stored.last_seen, ts(2));
        assert_eq!(stored.last_scrape_run_id, Some(run_b));
    }

    #[test]
    fn raw_neighborhood_only_replaces_a_geo_name_when_it_brings_coordinates() {
        let run = Uuid::new_v4();
        let mut resolved = sample();
        resolved.neighborhood = "Astoria (Central)".into();
        let mut stored = PersistedListing::first_sighting(resolved, run, ts(1));

        let mut raw = ScrapedListing::new(Source::Craigslist, "7712", "https://example.test/7712");
        raw.neighborhood = "Astoria".into();
        stored.absorb(&raw, run, ts(2));
        assert_eq!(stored.listing.neighborhood, "Astoria (Central)");

        let mut moved = raw.clone();
        moved.neighborhood = "Ditmars-Steinway".into();
        moved.latitude = Some(40.78);
        moved.longitude = Some(-73.91);
        stored.absorb(&moved, run, ts(3));
        assert_eq!(stored.listing.neighborhood, "Ditmars-Steinway");

        let mut bare = PersistedListing::first_sighting(raw.clone(), run, ts(1));
        raw.neighborhood = "Long Island City".into();
        bare.absorb(&raw, run, ts(2));
        assert_eq!(bare.listing.neighborhood, "Long Island City");
    }

    #[test]
    fn deactivate_and_reactivate_preserve_activity_invariant() {
        let run = Uuid::new_v4();
        let mut stored = PersistedListing::first_sighting(sample(), run, ts(1));
        assert!(stored.activity_consistent());

        assert!(stored.deactivate(run, ts(2)));
        assert!(!stored.deactivate(run, ts(3)));
        assert_eq!(stored.deactivated_at, Some(ts(2)));
        assert!(stored.activity_consistent());

        assert!(stored.reactivate(run, ts(4)));
        assert!(!stored.reactivate(run, ts(5)));
        assert_eq!(stored.deactivated_at, None);
        assert_eq!(stored.last_seen, ts(4));
        assert!(stored.activity_consistent());
    }

    #[test]
    fn absorb_clears_deactivation() {
        let run = Uuid::new_v4();
        let mut stored = PersistedListing::first_sighting(sample(), run, ts(1));
        stored.deactivate(run, ts(2));
        stored.absorb(&sample(), run, ts(3));
        assert!(stored.is_active);
        assert!(stored.activity_consistent());
    }

    #[test]
    fn run_lifecycle_records_counts() {
        let mut run = ScrapeRun::start(Source::StreetEasy, "manual", ts(1));
        assert!(run.is_running());
        run.complete(
            RunCounts {
                found: 10,
                new: 4,
                updated: 6,
                marked_inactive: 2,
            },
            ts(2),
        );
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.listings_new + run.listings_updated, run.listings_found);
        assert_eq!(run.completed_at, Some(ts(2)));
    }
}
