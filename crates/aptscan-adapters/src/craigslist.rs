//! Craigslist NYC apartments: infinite-scroll search, static detail pages with
//! map geodata and a photo gallery.

use std::collections::HashSet;
use std::sync::Arc;

use aptscan_core::{ScrapedListing, Source};
use async_trait::async_trait;
use scraper::Html;
use tracing::debug;
use url::Url;

use crate::browser::ChromeSearchSession;
use crate::extract::{
    child_attr, child_text, neighborhood_in_parens, parse_bathrooms, parse_bedrooms, parse_price,
    parse_sqft, select_all_attrs, select_all_texts, select_first_attr, select_first_text,
    selector, usable_image,
};
use crate::{
    AdapterError, AdapterSettings, DetailLoader, DetailPage, HttpDetailLoader, ImageSizePattern,
    LoadAction, SearchQuery, SearchSession, SourceAdapter,
};

pub const SEARCH_URL: &str = "https://newyork.craigslist.org/search/apa";

/// Thumbnails come as `_50x50`, `_300x300` or `_600x450`; the last is the largest.
pub const IMAGE_SIZE: ImageSizePattern = ImageSizePattern {
    pattern: r"_\d+x\d+\.",
    replacement: "_600x450.",
};

const GALLERY_IMAGES: &str = ".gallery img, .swipe img, .iw img, [id*='image'] img";

pub fn search_url(query: &SearchQuery) -> Result<Url, AdapterError> {
    let mut url = Url::parse(SEARCH_URL).map_err(|e| AdapterError::Message(e.to_string()))?;
    {
        let mut pairs = url.query_pairs_mut();
        if let Some(min) = query.min_price {
            pairs.append_pair("min_price", &min.to_string());
        }
        if let Some(max) = query.max_price {
            pairs.append_pair("max_price", &max.to_string());
        }
        if let Some(beds) = query.bedrooms {
            pairs.append_pair("min_bedrooms", &beds.to_string());
            pairs.append_pair("max_bedrooms", &beds.to_string());
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }
    // Forces the list ("thumb") layout rather than the gallery grid.
    url.set_fragment(Some("search=2~thumb~0~0~0~0~0"));
    Ok(url)
}

/// Reads every `[data-pid]` result row currently in the document. Rows without an
/// id or link, or without a price, are dropped; repeats keep the first row.
pub fn parse_search_results(html: &str) -> Result<Vec<ScrapedListing>, AdapterError> {
    let document = Html::parse_document(html);
    let rows = selector("[data-pid]")?;
    let link = selector("a.main, a")?;
    let title = selector(".title, .posting-title, .label")?;
    let price = selector(".price, .priceinfo")?;
    let meta = selector(".meta")?;
    let location = selector(".meta .location, .meta")?;
    let image = selector("img")?;

    let mut seen = HashSet::new();
    let mut listings = Vec::new();
    for row in document.select(&rows) {
        let Some(pid) = row.value().attr("data-pid").map(str::trim).filter(|s| !s.is_empty())
        else {
            continue;
        };
        let Some(href) = child_attr(row, &link, "href") else {
            debug!(pid, "result row without link");
            continue;
        };

        let title_text = child_text(row, &title)
            .or_else(|| child_attr(row, &image, "alt"))
            .unwrap_or_default();
        let price_value = child_text(row, &price).map(|p| parse_price(&p)).unwrap_or(0);
        if price_value == 0 {
            debug!(pid, "result row without price");
            continue;
        }
        if !seen.insert(pid.to_string()) {
            continue;
        }

        let meta_text = child_text(row, &meta).unwrap_or_default();
        let facts = format!("{} {}", title_text, meta_text).to_lowercase();

        let mut listing = ScrapedListing::new(Source::Craigslist, pid, href);
        listing.title = title_text.trim().to_string();
        listing.price = price_value;
        listing.bedrooms = parse_bedrooms(&facts);
        listing.bathrooms = parse_bathrooms(&facts);
        listing.sqft = parse_sqft(&facts);
        listing.neighborhood = child_text(row, &location)
            .and_then(|t| neighborhood_in_parens(&t))
            .unwrap_or_default();
        if let Some(src) = child_attr(row, &image, "src").filter(|s| usable_image(s)) {
            listing.images.push(src);
        }
        listings.push(listing);
    }
    Ok(listings)
}

pub fn parse_detail_page(html: &str) -> Result<DetailPage, AdapterError> {
    let document = Html::parse_document(html);

    let coordinate = |attr: &str| -> Result<Option<f64>, AdapterError> {
        Ok(select_first_attr(&document, "#map", attr)?.and_then(|v| v.parse::<f64>().ok()))
    };
    let (latitude, longitude) = match (coordinate("data-latitude")?, coordinate("data-longitude")?) {
        (Some(lat), Some(lon)) => (Some(lat), Some(lon)),
        _ => (None, None),
    };

    let gallery = select_all_attrs(&document, GALLERY_IMAGES, "src")?
        .into_iter()
        .filter(|src| usable_image(src))
        .collect();

    Ok(DetailPage {
        latitude,
        longitude,
        gallery,
        thumb_links: select_all_attrs(&document, "a.thumb", "href")?,
        address: select_first_text(&document, ".mapaddress")?,
        attributes: select_all_texts(&document, ".attrgroup span")?,
        description: select_first_text(&document, "#postingbody")?,
    })
}

#[derive(Debug, Clone)]
pub struct CraigslistAdapter {
    settings: AdapterSettings,
}

impl CraigslistAdapter {
    pub fn new(settings: AdapterSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl SourceAdapter for CraigslistAdapter {
    fn source(&self) -> Source {
        Source::Craigslist
    }

    fn max_consecutive_empty(&self) -> usize {
        8
    }

    fn image_size_pattern(&self) -> Option<ImageSizePattern> {
        Some(IMAGE_SIZE)
    }

    fn detail_loader(&self) -> Option<Arc<dyn DetailLoader>> {
        Some(Arc::new(HttpDetailLoader::new(
            Arc::clone(&self.settings.fetcher),
            Source::Craigslist,
            parse_detail_page,
        )))
    }

    async fn open_search(&self, query: &SearchQuery) -> Result<Box<dyn SearchSession>, AdapterError> {
        let session = ChromeSearchSession::open(
            search_url(query)?,
            LoadAction::Scroll {
                min_px: 3000,
                max_px: 5000,
            },
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
    use std::path::{Path, PathBuf};

    fn fixture(name: &str) -> String {
        let path: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/craigslist")
            .join(name);
        std::fs::read_to_string(&path).expect("fixture")
    }

    #[test]
    fn search_url_encodes_filters_and_thumb_view() {
        let url = search_url(&SearchQuery {
            min_price: Some(1500),
            max_price: Some(3200),
            bedrooms: Some(1),
        })
        .expect("url");
        assert_eq!(
            url.as_str(),
            "https://newyork.craigslist.org/search/apa?min_price=1500&max_price=3200&min_bedrooms=1&max_bedrooms=1#search=2~thumb~0~0~0~0~0"
        );

        let bare = search_url(&SearchQuery::default()).expect("url");
        assert_eq!(
            bare.as_str(),
            "https://newyork.craigslist.org/search/apa#search=2~thumb~0~0~0~0~0"
        );
    }

    #[test]
    fn result_rows_become_candidates() {
        let listings = parse_search_results(&fixture("search.html")).expect("parse");
        let ids: Vec<&str> = listings.iter().map(|l| l.external_id.as_str()).collect();
        // 7800000003 has no price, 7800000004 no link, 7800000001 repeats.
        assert_eq!(ids, vec!["7800000001", "7800000002", "7800000005"]);

        let first = &listings[0];
        assert_eq!(first.source, Source::Craigslist);
        assert_eq!(first.price, 2450);
        assert_eq!(first.bedrooms, 1);
        assert_eq!(first.bathrooms, 1.0);
        assert_eq!(first.sqft, Some(650));
        assert_eq!(first.neighborhood, "Astoria");
        assert_eq!(first.title, "Sunny 1br near N/W, 1ba");
        assert_eq!(
            first.url,
            "https://newyork.craigslist.org/que/apa/d/astoria-sunny/7800000001.html"
        );
        assert_eq!(
            first.images,
            vec!["https://images.craigslist.org/00a0a_abc_300x300.jpg".to_string()]
        );

        let second = &listings[1];
        assert_eq!(second.bedrooms, 0);
        assert!(second.images.is_empty(), "data: placeholder is skipped");
        assert_eq!(second.neighborhood, "");
    }

    #[test]
    fn detail_page_yields_geodata_gallery_and_attributes() {
        let page = parse_detail_page(&fixture("detail.html")).expect("parse");
        assert_eq!(page.latitude, Some(40.7712));
        assert_eq!(page.longitude, Some(-73.9203));
        assert_eq!(
            page.gallery,
            vec![
                "https://images.craigslist.org/00a0a_abc_50x50.jpg".to_string(),
                "https://images.craigslist.org/00b0b_def_300x300.jpg".to_string(),
                "https://images.craigslist.org/00b0b_def_300x300.jpg".to_string(),
            ]
        );
        assert_eq!(page.address.as_deref(), Some("31-10 Ditmars Blvd"));
        assert_eq!(
            page.attributes,
            vec!["1BR / 1Ba", "cats are OK - purrr", "laundry in bldg", "w/d in unit"]
        );
        assert!(page
            .description
            .as_deref()
            .is_some_and(|d| d.contains("Bright one bedroom")));
    }

    #[test]
    fn detail_page_without_map_has_no_coordinates() {
        let page = parse_detail_page(
            r#"<html><body><div id="map" data-latitude="40.7"></div>
               <a class="thumb" href="https://images.craigslist.org/x_600x450.jpg">1</a></body></html>"#,
        )
        .expect("parse");
        assert_eq!(page.latitude, None);
        assert_eq!(page.longitude, None);
        assert!(page.gallery.is_empty());
        assert_eq!(
            page.thumb_links,
            vec!["https://images.craigslist.org/x_600x450.jpg".to_string()]
        );
        assert_eq!(page.address, None);
    }
}
