//! aptscan - rental listing scanner for New York City.
//!
//! Scrapes a listing source, enriches what it finds, folds the results into the
//! listing store and retires listings that have gone off the market.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use aptscan_adapters::SearchQuery;
use aptscan_core::{ListingKey, Source};
use aptscan_geo::{GeoClassifier, NeighborhoodIndex};
use aptscan_storage::{ListingStore, MemoryStore, PgStore, RunLedger};
use aptscan_sync::{ReconciliationEngine, ScrapeConfig, ScrapePipeline};
use chrono::{DateTime, TimeDelta, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "aptscan")]
#[command(about = "NYC apartment listing scanner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scrape for a source.
    Scrape {
        #[arg(long)]
        source: String,
        #[arg(long)]
        max_listings: Option<usize>,
        #[arg(long, default_value = "manual")]
        triggered_by: String,
        #[arg(long)]
        min_price: Option<u32>,
        #[arg(long)]
        max_price: Option<u32>,
        #[arg(long)]
        bedrooms: Option<u32>,
        /// Skip the detail-page pass.
        #[arg(long)]
        no_details: bool,
    },
    /// Put an off-market listing back on the market.
    Reactivate {
        #[arg(long)]
        source: String,
        #[arg(long)]
        external_id: String,
    },
    /// Show recent scrape runs, newest first.
    Runs {
        #[arg(long)]
        source: Option<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Off-market counts.
    Stats {
        #[arg(long)]
        source: Option<String>,
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
    /// List known neighborhoods, optionally for one borough.
    Neighborhoods {
        #[arg(long)]
        borough: Option<String>,
    },
    /// Resolve a coordinate to its neighborhood.
    Classify {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
    },
    /// Apply database migrations.
    Migrate,
}

struct Stores {
    listings: Arc<dyn ListingStore>,
    ledger: Arc<dyn RunLedger>,
}

/// Postgres when `DATABASE_URL` is set, otherwise the JSON snapshot at the state path.
async fn open_stores(config: &ScrapeConfig) -> Result<Stores> {
    match &config.database_url {
        Some(url) => {
            let store = Arc::new(
                PgStore::connect(url)
                    .await
                    .context("connecting to database")?
                    .with_stale_run_after(config.stale_run_after()),
            );
            Ok(Stores {
                listings: store.clone(),
                ledger: store,
            })
        }
        None => {
            let store = Arc::new(
                MemoryStore::open_snapshot(config.state_path.clone())
                    .await?
                    .with_stale_run_after(config.stale_run_after()),
            );
            info!(path = %config.state_path.display(), "using snapshot store");
            Ok(Stores {
                listings: store.clone(),
                ledger: store,
            })
        }
    }
}

/// Start of the `stats` window, `days` back from `now`.
fn window_start(now: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>> {
    if days < 0 {
        bail!("--days must not be negative (got {days})");
    }
    TimeDelta::try_days(days)
        .and_then(|window| now.checked_sub_signed(window))
        .with_context(|| format!("--days out of range: {days}"))
}

fn parse_source(raw: &str) -> Result<Source> {
    Ok(raw.parse::<Source>()?)
}

fn load_neighborhoods(config: &ScrapeConfig) -> Result<NeighborhoodIndex> {
    NeighborhoodIndex::from_path(&config.nta_path).with_context(|| {
        format!(
            "loading neighborhood boundaries from {}",
            config.nta_path.display()
        )
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = ScrapeConfig::from_env();

    match cli.command {
        Commands::Scrape {
            source,
            max_listings,
            triggered_by,
            min_price,
            max_price,
            bedrooms,
            no_details,
        } => {
            if let Some(max_listings) = max_listings {
                config.max_listings = max_listings;
            }
            if no_details {
                config.fetch_details = false;
            }
            let query = SearchQuery {
                min_price,
                max_price,
                bedrooms,
            };
            let stores = open_stores(&config).await?;
            let geo = Arc::new(GeoClassifier::from_path(config.nta_path.clone()));
            let pipeline = ScrapePipeline::from_config(config, stores.listings, stores.ledger, geo)?;

            let report = pipeline.run_once(&source, &query, &triggered_by).await?;
            println!(
                "scrape complete: run_id={} source={} found={} new={} updated={} marked_inactive={} termination={:?} load_actions={} enrichment_failures={}",
                report.run.id,
                report.run.source,
                report.run.listings_found,
                report.run.listings_new,
                report.run.listings_updated,
                report.run.listings_marked_inactive,
                report.termination,
                report.load_actions,
                report.enrichment_failures.len()
            );
            if !report.off_market.decision.is_open() {
                println!("off-market pass skipped: {:?}", report.off_market.decision);
            }
        }
        Commands::Reactivate {
            source,
            external_id,
        } => {
            let source = parse_source(&source)?;
            let stores = open_stores(&config).await?;
            // Reactivations are attributed to the source's latest run.
            let Some(run) = stores
                .ledger
                .recent_runs(Some(source), 1)
                .await?
                .into_iter()
                .next()
            else {
                bail!("no scrape run recorded for {source}; run a scrape first");
            };
            let engine = ReconciliationEngine::new(stores.listings, config.coverage_gate());
            let key = ListingKey::new(source, external_id);
            if engine.reactivate(&key, run.id).await? {
                println!("reactivated {key}");
            } else {
                println!("{key} is not an off-market listing");
            }
        }
        Commands::Runs { source, limit } => {
            let source = source.as_deref().map(parse_source).transpose()?;
            let stores = open_stores(&config).await?;
            let runs = stores.ledger.recent_runs(source, limit).await?;
            if runs.is_empty() {
                println!("no runs recorded");
            }
            for run in runs {
                println!(
                    "{} {} {} started={} found={} new={} updated={} marked_inactive={} by={}{}",
                    run.id,
                    run.source,
                    run.status.as_str(),
                    run.started_at.to_rfc3339(),
                    run.listings_found,
                    run.listings_new,
                    run.listings_updated,
                    run.listings_marked_inactive,
                    run.triggered_by,
                    run.error_message
                        .as_deref()
                        .map(|message| format!(" error={message:?}"))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Stats { source, days } => {
            let source = source.as_deref().map(parse_source).transpose()?;
            let since = window_start(Utc::now(), days)?;
            let stores = open_stores(&config).await?;
            let stats = stores.listings.off_market_stats(source, since).await?;
            println!(
                "off market: total={} last_{}_days={}",
                stats.total_off_market, days, stats.recent_off_market
            );
        }
        Commands::Neighborhoods { borough } => {
            let index = load_neighborhoods(&config)?;
            match borough {
                Some(borough) => {
                    let grouped = index.by_borough();
                    let Some((_, names)) = grouped
                        .iter()
                        .find(|(name, _)| name.eq_ignore_ascii_case(&borough))
                    else {
                        bail!("unknown borough: {borough}");
                    };
                    for name in names {
                        println!("{name}");
                    }
                }
                None => {
                    for name in index.names() {
                        println!("{name}");
                    }
                }
            }
        }
        Commands::Classify { lat, lon } => {
            let index = load_neighborhoods(&config)?;
            match index.classify(lat, lon) {
                Some(name) => match index.borough_of(name) {
                    Some(borough) => println!("{name} ({borough})"),
                    None => println!("{name}"),
                },
                None => {
                    println!("no neighborhood contains ({lat}, {lon})");
                }
            }
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                println!("DATABASE_URL is not set; the snapshot store needs no migrations");
                return Ok(());
            };
            let store = PgStore::connect(url).await.context("connecting to database")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}
