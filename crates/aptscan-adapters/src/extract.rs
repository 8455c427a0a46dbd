//! Text heuristics shared by the source-specific markup parsers.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::AdapterError;

static BEDROOMS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*(?:br\b|bd\b|bed)").expect("bedroom pattern"));
static BATHROOMS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(?:ba\b|bath)").expect("bathroom pattern"));
static SQFT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d{3,5})\s*(?:sq\.?\s*ft|ft2|sf\b)").expect("sqft pattern"));
static PARENTHESIZED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([^)]+)\)").expect("parenthesized pattern"));

pub(crate) fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

pub(crate) fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector(format!("{css}: {e}")))
}

pub(crate) fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<Vec<_>>().join(" "))
}

pub(crate) fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document.select(&sel).next().and_then(element_text))
}

pub(crate) fn select_all_texts(document: &Html, css: &str) -> Result<Vec<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document.select(&sel).filter_map(element_text).collect())
}

pub(crate) fn select_first_attr(
    document: &Html,
    css: &str,
    attr: &str,
) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

pub(crate) fn select_all_attrs(
    document: &Html,
    css: &str,
    attr: &str,
) -> Result<Vec<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| n.value().attr(attr))
        .filter_map(|s| text_or_none(s.to_string()))
        .collect())
}

/// Within one card: first text of `sel`.
pub(crate) fn child_text(card: ElementRef<'_>, sel: &Selector) -> Option<String> {
    card.select(sel).next().and_then(element_text)
}

pub(crate) fn child_attr(card: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    card.select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

/// Keeps only the digits, so "$3,250/mo" becomes 3250. Anything unparseable is 0.
pub fn parse_price(text: &str) -> u32 {
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

/// Bedrooms from "2br", "3 beds", "1 BD". "Studio" and unmatched text give 0.
pub fn parse_bedrooms(text: &str) -> u32 {
    BEDROOMS
        .captures(text)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0)
}

pub fn parse_bathrooms(text: &str) -> f64 {
    BATHROOMS
        .captures(text)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0.0)
}

pub fn parse_sqft(text: &str) -> Option<u32> {
    SQFT.captures(text).and_then(|c| c[1].parse().ok())
}

/// Craigslist puts the poster's neighborhood in parentheses: "(Astoria)".
pub fn neighborhood_in_parens(text: &str) -> Option<String> {
    PARENTHESIZED
        .captures(text)
        .and_then(|c| text_or_none(c[1].to_string()))
}

/// Inline `data:` placeholders are lazy-load stand-ins, not photos.
pub fn usable_image(src: &str) -> bool {
    let src = src.trim();
    !src.is_empty() && !src.starts_with("data:")
}

pub fn looks_like_image_link(href: &str) -> bool {
    let lower = href.to_ascii_lowercase();
    [".jpg", ".jpeg", ".png", ".webp"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_keeps_digits_only() {
        assert_eq!(parse_price("$3,250"), 3250);
        assert_eq!(parse_price("$2,100/mo"), 2100);
        assert_eq!(parse_price("call"), 0);
    }

    #[test]
    fn bed_and_bath_patterns() {
        assert_eq!(parse_bedrooms("2br - 900ft2"), 2);
        assert_eq!(parse_bedrooms("3 Beds"), 3);
        assert_eq!(parse_bedrooms("Studio"), 0);
        assert_eq!(parse_bathrooms("2 beds 1.5 baths"), 1.5);
        assert_eq!(parse_bathrooms("1ba"), 1.0);
        assert_eq!(parse_bathrooms("no info"), 0.0);
    }

    #[test]
    fn sqft_and_neighborhood() {
        assert_eq!(parse_sqft("1 bed 1 bath 750 sq ft"), Some(750));
        assert_eq!(parse_sqft("2br - 900ft2"), Some(900));
        assert_eq!(parse_sqft("2 beds"), None);
        assert_eq!(
            neighborhood_in_parens("$2,400 (Astoria) pic").as_deref(),
            Some("Astoria")
        );
        assert_eq!(neighborhood_in_parens("no location"), None);
    }

    #[test]
    fn image_filters() {
        assert!(!usable_image("data:image/gif;base64,R0lGOD"));
        assert!(usable_image("https://images.craigslist.org/a_300x300.jpg"));
        assert!(looks_like_image_link("https://x/y.JPG"));
        assert!(!looks_like_image_link("https://x/y.html"));
    }
}
