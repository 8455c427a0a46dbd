//! StreetEasy rentals: numbered result pages whose cards carry everything we keep,
//! so there is no detail pass.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use aptscan_core::{ScrapedListing, Source};
use async_trait::async_trait;
use regex::Regex;
use scraper::Html;
use tracing::debug;
use url::Url;

use crate::browser::ChromeSearchSession;
use crate::extract::{
    child_attr, child_text, parse_bathrooms, parse_bedrooms, parse_price, parse_sqft, selector,
    usable_image,
};
use crate::{
    AdapterError, AdapterSettings, DetailLoader, LoadAction, SearchQuery, SearchSession,
    SourceAdapter,
};

pub const SITE: &str = "https://streeteasy.com";
pub const SEARCH_URL: &str = "https://streeteasy.com/for-rent/nyc";

static LISTING_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/(\d+)(?:[?#]|$)").expect("listing id pattern"));

pub fn search_url(query: &SearchQuery) -> Result<Url, AdapterError> {
    let mut filters = Vec::new();
    match (query.min_price, query.max_price) {
        (Some(min), Some(max)) => filters.push(format!("price:{min}-{max}")),
        (Some(min), None) => filters.push(format!("price:{min}-")),
        (None, Some(max)) => filters.push(format!("price:-{max}")),
        (None, None) => {}
    }
    if let Some(beds) = query.bedrooms {
        filters.push(format!("beds:{beds}"));
    }

    let mut raw = SEARCH_URL.to_string();
    if !filters.is_empty() {
        raw.push('/');
        raw.push_str(&filters.join("%7C"));
    }
    Url::parse(&raw).map_err(|e| AdapterError::Message(format!("{raw}: {e}")))
}

/// The numeric id at the end of the listing path, or the whole href when the
/// path carries none.
pub fn external_id_from_href(href: &str) -> String {
    LISTING_ID
        .captures(href)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| href.to_string())
}

pub fn parse_search_results(html: &str) -> Result<Vec<ScrapedListing>, AdapterError> {
    let document = Html::parse_document(html);
    let cards = selector(".listingCard, [data-testid='listing-card']")?;
    let link = selector("a.listingCard-globalLink")?;
    let price = selector(".listingCard-price, [data-testid='price']")?;
    let address = selector(".listingCard-address, [data-testid='address']")?;
    let title = selector(".listingCard-title, h3")?;
    let beds_baths = selector(".listingCard-bedsBaths, [data-testid='beds-baths']")?;
    let neighborhood = selector(".listingCard-neighborhood, [data-testid='neighborhood']")?;
    let image = selector("img")?;

    let mut seen = HashSet::new();
    let mut listings = Vec::new();
    for card in document.select(&cards) {
        let Some(href) = child_attr(card, &link, "href") else {
            continue;
        };
        let url = if href.starts_with('/') {
            format!("{SITE}{href}")
        } else {
            href.clone()
        };
        let external_id = external_id_from_href(&href);

        let price_value = child_text(card, &price).map(|p| parse_price(&p)).unwrap_or(0);
        if price_value == 0 {
            debug!(%external_id, "card without price");
            continue;
        }
        if !seen.insert(external_id.clone()) {
            continue;
        }

        let address_text = child_text(card, &address).unwrap_or_else(|| "Unknown".to_string());
        let details = child_text(card, &beds_baths).unwrap_or_default();

        let mut listing = ScrapedListing::new(Source::StreetEasy, external_id, url);
        listing.title = child_text(card, &title).unwrap_or_else(|| address_text.clone());
        listing.address = address_text;
        listing.price = price_value;
        listing.bedrooms = parse_bedrooms(&details);
        listing.bathrooms = parse_bathrooms(&details);
        listing.sqft = parse_sqft(&details);
        listing.neighborhood = child_text(card, &neighborhood).unwrap_or_default();
        if let Some(src) = child_attr(card, &image, "src").filter(|s| usable_image(s)) {
            listing.images.push(src);
        }
        listings.push(listing);
    }
    Ok(listings)
}

#[derive(Debug, Clone)]
pub struct StreetEasyAdapter {
    settings: AdapterSettings,
}

impl StreetEasyAdapter {
    pub fn new(settings: AdapterSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl SourceAdapter for StreetEasyAdapter {
    fn source(&self) -> Source {
        Source::StreetEasy
    }

    fn max_consecutive_empty(&self) -> usize {
        3
    }

    fn detail_loader(&self) -> Option<Arc<dyn DetailLoader>> {
        None
    }

    async fn open_search(&self, query: &SearchQuery) -> Result<Box<dyn SearchSession>, AdapterError> {
        let first_page = search_url(query)?;
        let session = ChromeSearchSession::open(
            first_page.clone(),
            LoadAction::PageTurn { first_page },
            parse_search_results,
            self.settings.browser.clone(),
        )
        .await?;
        Ok(Box::new(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn fixture(name: &str) -> String {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/streeteasy")
            .join(name);
        std::fs::read_to_string(path).expect("fixture")
    }

    #[test]
    fn search_url_joins_filters_with_pipes() {
        let url = search_url(&SearchQuery {
            min_price: Some(2000),
            max_price: Some(3500),
            bedrooms: Some(2),
        })
        .expect("url");
        assert_eq!(
            url.as_str(),
            "https://streeteasy.com/for-rent/nyc/price:2000-3500%7Cbeds:2"
        );

        let upper_only = search_url(&SearchQuery {
            max_price: Some(3000),
            ..SearchQuery::default()
        })
        .expect("url");
        assert_eq!(upper_only.as_str(), "https://streeteasy.com/for-rent/nyc/price:-3000");
        assert_eq!(
            search_url(&SearchQuery::default()).expect("url").as_str(),
            SEARCH_URL
        );
    }

    #[test]
    fn ids_come_from_the_listing_path() {
        assert_eq!(external_id_from_href("/rental/4412345"), "4412345");
        assert_eq!(external_id_from_href("/rental/4412345?featured=1"), "4412345");
        assert_eq!(
            external_id_from_href("/building/the-ashley/12b"),
            "/building/the-ashley/12b"
        );
    }

    #[test]
    fn cards_become_candidates() {
        let listings = parse_search_results(&fixture("search_page1.html")).expect("parse");
        let ids: Vec<&str> = listings.iter().map(|l| l.external_id.as_str()).collect();
        assert_eq!(ids, vec!["4412345", "4412346"]);

        let first = &listings[0];
        assert_eq!(first.url, "https://streeteasy.com/rental/4412345");
        assert_eq!(first.price, 3150);
        assert_eq!(first.bedrooms, 1);
        assert_eq!(first.bathrooms, 1.0);
        assert_eq!(first.sqft, Some(700));
        assert_eq!(first.address, "21-15 33rd Street #4B");
        assert_eq!(first.title, "21-15 33rd Street #4B");
        assert_eq!(first.neighborhood, "Astoria");
        assert_eq!(first.images, vec!["https://photos.zillowstatic.com/se/a1.jpg".to_string()]);

        let studio = &listings[1];
        assert_eq!(studio.bedrooms, 0);
        assert_eq!(studio.title, "The Ashley");
        assert_eq!(studio.sqft, None);
        assert!(studio.images.is_empty());
    }
}
