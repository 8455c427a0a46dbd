use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use aptscan_core::ScrapedListing;
use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use rand::Rng;
use tracing::{debug, info};
use url::Url;

use crate::{AdapterError, SearchSession};

pub(crate) type CardParser = fn(&str) -> Result<Vec<ScrapedListing>, AdapterError>;

#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub headless: bool,
    pub user_agent: Option<String>,
    /// Pause after each navigation or scroll so lazy content can render.
    pub settle_min: Duration,
    pub settle_max: Duration,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: None,
            settle_min: Duration::from_millis(1500),
            settle_max: Duration::from_millis(2500),
        }
    }
}

impl BrowserSettings {
    fn settle_delay(&self) -> Duration {
        if self.settle_max <= self.settle_min {
            return self.settle_min;
        }
        let min = self.settle_min.as_millis() as u64;
        let max = self.settle_max.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(min..=max))
    }
}

/// How a search view reveals more results.
#[derive(Debug, Clone)]
pub enum LoadAction {
    /// Infinite scroll: scroll the window by a random pixel amount.
    Scroll { min_px: u32, max_px: u32 },
    /// Numbered pages: navigate to `first_page` with `?page=N`.
    PageTurn { first_page: Url },
}

/// `page` 1 is the bare URL; later pages carry an explicit `page` parameter.
pub(crate) fn page_url(first_page: &Url, page: u32) -> Url {
    let mut url = first_page.clone();
    let kept: Vec<(String, String)> = first_page
        .query_pairs()
        .filter(|(k, _)| k != "page")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.set_query(None);
    if !kept.is_empty() || page > 1 {
        let mut pairs = url.query_pairs_mut();
        for (k, v) in &kept {
            pairs.append_pair(k, v);
        }
        if page > 1 {
            pairs.append_pair("page", &page.to_string());
        }
    }
    url
}

/// A headless Chrome tab parked on a search-results view. Chrome calls block, so
/// each one runs on the blocking pool.
pub struct ChromeSearchSession {
    _browser: Browser,
    tab: Arc<Tab>,
    action: LoadAction,
    parse: CardParser,
    settings: BrowserSettings,
    page: u32,
}

impl ChromeSearchSession {
    pub(crate) async fn open(
        start: Url,
        action: LoadAction,
        parse: CardParser,
        settings: BrowserSettings,
    ) -> Result<Self, AdapterError> {
        info!(url = %start, "launching headless Chrome");
        let launch = settings.clone();
        let (browser, tab) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            let options = LaunchOptions::default_builder()
                .headless(launch.headless)
                .build()
                .context("building Chrome launch options")?;
            let browser = Browser::new(options).context("launching Chrome")?;
            let tab = browser.new_tab().context("opening tab")?;
            if let Some(user_agent) = &launch.user_agent {
                tab.set_user_agent(user_agent, None, None)
                    .context("setting user agent")?;
            }
            tab.navigate_to(start.as_str())
                .and_then(|t| t.wait_until_navigated())
                .with_context(|| format!("loading {start}"))?;
            Ok((browser, tab))
        })
        .await??;

        tokio::time::sleep(settings.settle_delay()).await;

        Ok(Self {
            _browser: browser,
            tab,
            action,
            parse,
            settings,
            page: 1,
        })
    }

    async fn on_tab<T, F>(&self, f: F) -> Result<T, AdapterError>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> anyhow::Result<T> + Send + 'static,
    {
        let tab = Arc::clone(&self.tab);
        Ok(tokio::task::spawn_blocking(move || f(&tab)).await??)
    }
}

#[async_trait]
impl SearchSession for ChromeSearchSession {
    async fn load_next(&mut self) -> Result<(), AdapterError> {
        match &self.action {
            LoadAction::Scroll { min_px, max_px } => {
                let px = rand::rng().random_range(*min_px..=(*max_px).max(*min_px));
                debug!(px, "scrolling search view");
                self.on_tab(move |tab| {
                    tab.evaluate(&format!("window.scrollBy(0, {px})"), false)?;
                    Ok(())
                })
                .await?;
            }
            LoadAction::PageTurn { first_page } => {
                let next = page_url(first_page, self.page + 1);
                debug!(url = %next, "turning search page");
                self.on_tab(move |tab| {
                    tab.navigate_to(next.as_str())?.wait_until_navigated()?;
                    Ok(())
                })
                .await?;
                self.page += 1;
            }
        }
        tokio::time::sleep(self.settings.settle_delay()).await;
        Ok(())
    }

    async fn visible_candidates(&mut self) -> Result<Vec<ScrapedListing>, AdapterError> {
        let html = self
            .on_tab(|tab| {
                let rendered = tab.evaluate("document.documentElement.outerHTML", false)?;
                Ok(rendered
                    .value
                    .and_then(|v| v.as_str().map(str::to_string)))
            })
            .await?
            .ok_or_else(|| AdapterError::Browser("page returned no markup".to_string()))?;
        (self.parse)(&html)
    }

    async fn close(&mut self) -> Result<(), AdapterError> {
        self.on_tab(|tab| {
            tab.close(true)?;
            Ok(())
        })
        .await
    }
}
