use std::path::PathBuf;
use std::time::Duration;

use aptscan_adapters::BrowserSettings;
use aptscan_storage::{HttpClientConfig, DEFAULT_STALE_RUN_AFTER};
use chrono::TimeDelta;

use crate::enrich::EnrichSettings;
use crate::pagination::ScrollLimits;
use crate::reconcile::CoverageGate;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub database_url: Option<String>,
    pub state_path: PathBuf,
    pub nta_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub detail_concurrency: usize,
    pub detail_timeout_secs: u64,
    pub politeness_min_ms: u64,
    pub politeness_max_ms: u64,
    pub fetch_details: bool,
    pub max_listings: usize,
    pub max_load_actions: usize,
    pub load_timeout_secs: u64,
    pub coverage_threshold: f64,
    /// Overrides the adapter's own threshold when set.
    pub max_consecutive_empty: Option<usize>,
    pub headless: bool,
    /// Minutes after which a still-`running` run counts as abandoned.
    pub stale_run_after_mins: u64,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl ScrapeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset or unparseable values fall
    /// back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let flag = |key: &str| lookup(key).and_then(|v| parse_flag(&v));

        let politeness_min_ms = number("APTSCAN_POLITENESS_MIN_MS").unwrap_or(500);
        let politeness_max_ms = number("APTSCAN_POLITENESS_MAX_MS")
            .unwrap_or(1500)
            .max(politeness_min_ms);

        Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            state_path: lookup("APTSCAN_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/aptscan_state.json")),
            nta_path: lookup("APTSCAN_NTA_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/nyc_nta.geojson")),
            user_agent: lookup("APTSCAN_USER_AGENT")
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: number("APTSCAN_HTTP_TIMEOUT_SECS").unwrap_or(15),
            detail_concurrency: number("APTSCAN_DETAIL_CONCURRENCY")
                .map(|v| v as usize)
                .unwrap_or(2)
                .max(1),
            detail_timeout_secs: number("APTSCAN_DETAIL_TIMEOUT_SECS").unwrap_or(30),
            politeness_min_ms,
            politeness_max_ms,
            fetch_details: flag("APTSCAN_FETCH_DETAILS").unwrap_or(true),
            max_listings: number("APTSCAN_MAX_LISTINGS").map(|v| v as usize).unwrap_or(5000),
            max_load_actions: number("APTSCAN_MAX_LOAD_ACTIONS")
                .map(|v| v as usize)
                .unwrap_or(200),
            load_timeout_secs: number("APTSCAN_LOAD_TIMEOUT_SECS").unwrap_or(30),
            coverage_threshold: lookup("APTSCAN_COVERAGE_THRESHOLD")
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite() && (0.0..=1.0).contains(v))
                .unwrap_or(0.5),
            max_consecutive_empty: number("APTSCAN_MAX_CONSECUTIVE_EMPTY")
                .map(|v| (v as usize).max(1)),
            headless: flag("APTSCAN_HEADLESS").unwrap_or(true),
            stale_run_after_mins: number("APTSCAN_STALE_RUN_MINS")
                .unwrap_or(DEFAULT_STALE_RUN_AFTER.num_minutes().unsigned_abs())
                .max(1),
        }
    }

    pub fn http_client(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            per_source_concurrency: self.detail_concurrency,
            ..HttpClientConfig::default()
        }
    }

    pub fn browser(&self) -> BrowserSettings {
        BrowserSettings {
            headless: self.headless,
            user_agent: Some(self.user_agent.clone()),
            ..BrowserSettings::default()
        }
    }

    pub fn scroll_limits(&self, adapter_default_empty: usize) -> ScrollLimits {
        ScrollLimits {
            max_candidates: self.max_listings,
            max_load_actions: self.max_load_actions,
            max_consecutive_empty: self.max_consecutive_empty.unwrap_or(adapter_default_empty),
            load_timeout: Duration::from_secs(self.load_timeout_secs),
        }
    }

    pub fn enrich_settings(&self) -> EnrichSettings {
        EnrichSettings {
            concurrency: self.detail_concurrency,
            politeness_min: Duration::from_millis(self.politeness_min_ms),
            politeness_max: Duration::from_millis(self.politeness_max_ms),
            item_timeout: Duration::from_secs(self.detail_timeout_secs),
        }
    }

    pub fn coverage_gate(&self) -> CoverageGate {
        CoverageGate::new(self.coverage_threshold)
    }

    pub fn stale_run_after(&self) -> TimeDelta {
        i64::try_from(self.stale_run_after_mins)
            .ok()
            .and_then(TimeDelta::try_minutes)
            .unwrap_or(TimeDelta::MAX)
    }
}
