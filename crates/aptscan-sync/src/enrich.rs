//! Detail-page enrichment under a bounded worker pool.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use aptscan_adapters::extract::looks_like_image_link;
use aptscan_adapters::{DetailLoader, DetailPage, ImageSizePattern};
use aptscan_core::{LaundryType, ScrapedListing};
use aptscan_geo::GeoClassifier;
use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

const IN_UNIT: &[&str] = &[
    "w/d in unit",
    "washer/dryer in unit",
    "washer & dryer in unit",
    "in-unit laundry",
    "in unit laundry",
];
const IN_BUILDING: &[&str] = &[
    "laundry in bldg",
    "laundry on site",
    "laundry in building",
    "w/d hookups",
];
const NO_LAUNDRY: &[&str] = &["no laundry"];

/// First matching rule wins, in the order in-unit, building, none, regardless of
/// which attribute carried the keyword.
pub fn classify_laundry<S: AsRef<str>>(attributes: &[S]) -> Option<LaundryType> {
    let lowered: Vec<String> = attributes
        .iter()
        .map(|a| a.as_ref().to_lowercase())
        .collect();
    let any = |keywords: &[&str]| {
        lowered
            .iter()
            .any(|text| keywords.iter().any(|k| text.contains(k)))
    };

    if any(IN_UNIT) {
        Some(LaundryType::InUnit)
    } else if any(IN_BUILDING) {
        Some(LaundryType::Building)
    } else if any(NO_LAUNDRY) {
        Some(LaundryType::NoLaundry)
    } else {
        None
    }
}

/// Rewrites the size token of a thumbnail URL to the largest served size.
#[derive(Debug, Clone)]
pub struct ImageUpgradeRule {
    pattern: Regex,
    replacement: String,
}

impl ImageUpgradeRule {
    pub fn new(pattern: &str, replacement: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            replacement: replacement.into(),
        })
    }

    pub fn from_size_pattern(size: ImageSizePattern) -> Result<Self, regex::Error> {
        Self::new(size.pattern, size.replacement)
    }

    pub fn apply(&self, url: &str) -> String {
        self.pattern
            .replace_all(url, self.replacement.as_str())
            .into_owned()
    }
}

/// Gallery images, upgraded and deduplicated in page order. Falls back to the
/// thumbnail links that point at image files when the gallery is empty.
pub fn merge_gallery(page: &DetailPage, rule: Option<&ImageUpgradeRule>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut images = Vec::new();
    for src in &page.gallery {
        let upgraded = match rule {
            Some(rule) => rule.apply(src),
            None => src.clone(),
        };
        if seen.insert(upgraded.clone()) {
            images.push(upgraded);
        }
    }
    if images.is_empty() {
        for href in page.thumb_links.iter().filter(|h| looks_like_image_link(h)) {
            if seen.insert(href.clone()) {
                images.push(href.clone());
            }
        }
    }
    images
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrichSettings {
    pub concurrency: usize,
    pub politeness_min: Duration,
    pub politeness_max: Duration,
    pub item_timeout: Duration,
}

impl Default for EnrichSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            politeness_min: Duration::from_millis(500),
            politeness_max: Duration::from_millis(1500),
            item_timeout: Duration::from_secs(30),
        }
    }
}

impl EnrichSettings {
    fn politeness_delay(&self) -> Duration {
        if self.politeness_max <= self.politeness_min {
            return self.politeness_min;
        }
        let min = self.politeness_min.as_millis() as u64;
        let max = self.politeness_max.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(min..=max))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichmentFailure {
    pub external_id: String,
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct EnrichmentReport {
    /// Every input listing exactly once, in completion order.
    pub listings: Vec<ScrapedListing>,
    pub failures: Vec<EnrichmentFailure>,
}

pub struct DetailEnricher {
    loader: Arc<dyn DetailLoader>,
    geo: Arc<GeoClassifier>,
    image_rule: Option<ImageUpgradeRule>,
    settings: EnrichSettings,
}

impl DetailEnricher {
    pub fn new(loader: Arc<dyn DetailLoader>, geo: Arc<GeoClassifier>, settings: EnrichSettings) -> Self {
        Self {
            loader,
            geo,
            image_rule: None,
            settings,
        }
    }

    pub fn with_image_rule(mut self, rule: Option<ImageUpgradeRule>) -> Self {
        self.image_rule = rule;
        self
    }

    /// At most `concurrency` detail loads are in flight. A worker slot is held
    /// through the politeness pause that follows its load, so the pause delays the
    /// next load rather than overlapping it. Per-listing failures are recorded and
    /// the listing passes through with its search-card fields.
    pub async fn enrich(&self, candidates: Vec<ScrapedListing>) -> EnrichmentReport {
        let total = candidates.len();
        let slots = Semaphore::new(self.settings.concurrency.max(1));
        info!(
            total,
            concurrency = self.settings.concurrency.max(1),
            "fetching detail pages"
        );

        let mut pending: FuturesUnordered<_> = candidates
            .into_iter()
            .map(|listing| self.enrich_one(&slots, listing))
            .collect();

        let mut report = EnrichmentReport {
            listings: Vec::with_capacity(total),
            failures: Vec::new(),
        };
        while let Some((listing, failure)) = pending.next().await {
            if let Some(failure) = failure {
                report.failures.push(failure);
            }
            report.listings.push(listing);
        }

        info!(
            total,
            failed = report.failures.len(),
            "detail pages done"
        );
        report
    }

    async fn enrich_one(
        &self,
        slots: &Semaphore,
        listing: ScrapedListing,
    ) -> (ScrapedListing, Option<EnrichmentFailure>) {
        let _slot = match slots.acquire().await {
            Ok(slot) => slot,
            Err(_) => {
                let failure = failure_for(&listing, "worker pool closed");
                return (listing, Some(failure));
            }
        };

        let loaded = tokio::time::timeout(
            self.settings.item_timeout,
            self.loader.load_detail(&listing.url),
        )
        .await;
        let outcome = match loaded {
            Ok(Ok(page)) => (self.apply_detail(listing, page), None),
            Ok(Err(err)) => {
                warn!(external_id = %listing.external_id, error = %err, "detail page failed");
                let failure = failure_for(&listing, err.to_string());
                (listing, Some(failure))
            }
            Err(_) => {
                warn!(external_id = %listing.external_id, "detail page timed out");
                let failure = failure_for(
                    &listing,
                    format!("timed out after {:?}", self.settings.item_timeout),
                );
                (listing, Some(failure))
            }
        };

        tokio::time::sleep(self.settings.politeness_delay()).await;
        outcome
    }

    fn apply_detail(&self, mut listing: ScrapedListing, page: DetailPage) -> ScrapedListing {
        if let (Some(lat), Some(lon)) = (page.latitude, page.longitude) {
            listing.latitude = Some(lat);
            listing.longitude = Some(lon);
        }

        let images = merge_gallery(&page, self.image_rule.as_ref());
        if !images.is_empty() {
            listing.images = images;
        }

        if let Some(address) = page.address.filter(|a| !a.trim().is_empty()) {
            listing.address = address;
        }
        if let Some(laundry) = classify_laundry(page.attributes.as_slice()) {
            listing.laundry_type = Some(laundry);
        }
        if listing.description.is_none() {
            listing.description = page.description;
        }

        if let Some((lat, lon)) = listing.coordinates() {
            match self.geo.classify(lat, lon) {
                Some(name) => {
                    debug!(external_id = %listing.external_id, %name, "neighborhood resolved");
                    listing.neighborhood = name;
                }
                None => debug!(external_id = %listing.external_id, lat, lon, "outside known neighborhoods"),
            }
        }
        listing
    }
}

fn failure_for(listing: &ScrapedListing, reason: impl Into<String>) -> EnrichmentFailure {
    EnrichmentFailure {
        external_id: listing.external_id.clone(),
        url: listing.url.clone(),
        reason: reason.into(),
    }
}
