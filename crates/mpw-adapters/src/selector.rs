//! CSS-selector adapters for product pages and keyword searches.

use async_trait::async_trait;
use mpw_core::{CheckResult, CrawlStatus, StockStatus, Target};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};

use crate::{
    AcquisitionAdapter, AcquisitionSession, AdapterError, FetchedPage, StoreDefinition, StoreKind,
};

/// First integer in a price label: `"¥12,800"` -> 12800, `"$1,299.00"` -> 1299.
pub fn parse_price(text: &str) -> Option<i64> {
    let mut digits = String::new();
    let mut started = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            started = true;
        } else if started && ch == ',' {
            continue;
        } else if started {
            break;
        }
    }
    digits.parse().ok()
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn parse_selector(store: &str, selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::InvalidDefinition {
        store: store.to_string(),
        reason: format!("selector `{selector}`: {e}"),
    })
}

fn optional_selector(store: &str, selector: Option<&str>) -> Result<Option<Selector>, AdapterError> {
    selector.map(|s| parse_selector(store, s)).transpose()
}

fn required(store: &str, field: &str, value: Option<&str>) -> Result<String, AdapterError> {
    value
        .map(str::to_string)
        .ok_or_else(|| AdapterError::InvalidDefinition {
            store: store.to_string(),
            reason: format!("missing `{field}`"),
        })
}

fn first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn image_source(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope.select(selector).next().and_then(|n| {
        let el = n.value();
        el.attr("src")
            .or_else(|| el.attr("content"))
            .or_else(|| el.attr("data-src"))
            .and_then(|s| text_or_none(s.to_string()))
    })
}

fn absolutize(base: &str, href: &str) -> Option<String> {
    Url::parse(base)
        .and_then(|base| base.join(href))
        .map(|u| u.to_string())
        .ok()
}

/// Reads one product page per target.
#[derive(Debug, Clone)]
pub struct UrlSelectorAdapter {
    definition: StoreDefinition,
    price: Selector,
    out_of_stock: Option<Selector>,
    thumbnail: Option<Selector>,
}

impl UrlSelectorAdapter {
    pub fn new(definition: StoreDefinition) -> Result<Self, AdapterError> {
        let store = definition.name.clone();
        let price = parse_selector(
            &store,
            &required(&store, "price_selector", definition.price_selector.as_deref())?,
        )?;
        let out_of_stock = optional_selector(&store, definition.out_of_stock_selector.as_deref())?;
        let thumbnail = optional_selector(&store, definition.thumbnail_selector.as_deref())?;
        Ok(Self {
            definition,
            price,
            out_of_stock,
            thumbnail,
        })
    }

    /// Out-of-stock markers win over a visible price. A page with neither is
    /// a failed read, since the layout no longer matches the definition.
    pub fn parse_product_page(&self, page: &FetchedPage) -> CheckResult {
        let document = Html::parse_document(&page.body);
        let root = document.root_element();

        let marked_by_selector = self
            .out_of_stock
            .as_ref()
            .is_some_and(|sel| root.select(sel).next().is_some());
        let marked_by_text = self
            .definition
            .out_of_stock_text
            .as_deref()
            .is_some_and(|needle| root.text().any(|t| t.contains(needle)));

        let thumbnail_url = self
            .thumbnail
            .as_ref()
            .and_then(|sel| image_source(root, sel))
            .and_then(|src| absolutize(&page.url, &src));
        let price = first_text(root, &self.price).and_then(|t| parse_price(&t));

        let (price, stock, crawl_status) = if marked_by_selector || marked_by_text {
            (None, StockStatus::OutOfStock, CrawlStatus::Success)
        } else if let Some(price) = price {
            (Some(price), StockStatus::InStock, CrawlStatus::Success)
        } else {
            (None, StockStatus::Unknown, CrawlStatus::Failure)
        };

        CheckResult {
            price,
            stock,
            crawl_status,
            thumbnail_url,
            resolved_url: Some(page.url.clone()),
        }
    }
}

#[async_trait]
impl AcquisitionAdapter for UrlSelectorAdapter {
    fn store(&self) -> &str {
        &self.definition.name
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Url
    }

    async fn check(
        &self,
        session: &dyn AcquisitionSession,
        target: &Target,
    ) -> Result<CheckResult, AdapterError> {
        let url = target
            .url
            .as_deref()
            .ok_or_else(|| AdapterError::Acquisition(format!("target `{}` has no url", target.name)))?;
        match session.fetch_page(&self.definition.name, url).await {
            Ok(page) => Ok(self.parse_product_page(&page)),
            Err(AdapterError::NotFound { url }) => Ok(CheckResult {
                resolved_url: Some(url),
                ..CheckResult::out_of_stock()
            }),
            Err(err) => Err(err),
        }
    }
}

/// Searches listings by keyword and reports the cheapest acceptable result.
#[derive(Debug, Clone)]
pub struct KeywordSearchAdapter {
    definition: StoreDefinition,
    search_url: String,
    result: Selector,
    title: Selector,
    price: Selector,
    link: Option<Selector>,
    thumbnail: Option<Selector>,
}

impl KeywordSearchAdapter {
    pub fn new(definition: StoreDefinition) -> Result<Self, AdapterError> {
        let store = definition.name.clone();
        let search_url = required(&store, "search_url", definition.search_url.as_deref())?;
        if !search_url.contains("{keyword}") {
            return Err(AdapterError::InvalidDefinition {
                store,
                reason: "search_url lacks a {keyword} placeholder".into(),
            });
        }
        let result = parse_selector(
            &store,
            &required(&store, "result_selector", definition.result_selector.as_deref())?,
        )?;
        let title = parse_selector(
            &store,
            &required(&store, "result_title_selector", definition.result_title_selector.as_deref())?,
        )?;
        let price = parse_selector(
            &store,
            &required(&store, "result_price_selector", definition.result_price_selector.as_deref())?,
        )?;
        let link = optional_selector(&store, definition.result_link_selector.as_deref())?;
        let thumbnail = optional_selector(&store, definition.thumbnail_selector.as_deref())?;
        Ok(Self {
            definition,
            search_url,
            result,
            title,
            price,
            link,
            thumbnail,
        })
    }

    pub fn search_url_for(&self, target: &Target) -> Option<String> {
        let keyword = target.search_keyword.as_deref()?.trim();
        let bound = |value: Option<i64>| value.map(|v| v.to_string()).unwrap_or_default();
        let range = target.price_range;
        Some(
            self.search_url
                .replace("{keyword}", &urlencoding::encode(keyword))
                .replace("{min_price}", &bound(range.and_then(|r| r.min)))
                .replace("{max_price}", &bound(range.and_then(|r| r.max))),
        )
    }

    /// Cheapest result that passes the exclusion and price-range filters;
    /// no such result means the watch is currently out of stock.
    pub fn parse_search_results(&self, page: &FetchedPage, target: &Target) -> CheckResult {
        let document = Html::parse_document(&page.body);
        let exclude = target
            .exclude_keyword
            .as_deref()
            .map(str::to_lowercase)
            .filter(|e| !e.trim().is_empty());

        let mut best: Option<(i64, Option<String>, Option<String>)> = None;
        for row in document.select(&self.result) {
            let Some(title) = first_text(row, &self.title) else {
                continue;
            };
            if exclude
                .as_deref()
                .is_some_and(|needle| title.to_lowercase().contains(needle))
            {
                continue;
            }
            let Some(price) = first_text(row, &self.price).and_then(|t| parse_price(&t)) else {
                continue;
            };
            if target.price_range.is_some_and(|range| !range.contains(price)) {
                continue;
            }
            if best.as_ref().is_some_and(|(lowest, _, _)| *lowest <= price) {
                continue;
            }
            let link = self
                .link
                .as_ref()
                .and_then(|sel| row.select(sel).next())
                .and_then(|n| n.value().attr("href"))
                .and_then(|href| absolutize(&page.url, href));
            let thumbnail = self
                .thumbnail
                .as_ref()
                .and_then(|sel| image_source(row, sel))
                .and_then(|src| absolutize(&page.url, &src));
            best = Some((price, link, thumbnail));
        }

        match best {
            Some((price, link, thumbnail)) => CheckResult {
                thumbnail_url: thumbnail,
                resolved_url: link,
                ..CheckResult::in_stock(price)
            },
            None => CheckResult::out_of_stock(),
        }
    }
}

#[async_trait]
impl AcquisitionAdapter for KeywordSearchAdapter {
    fn store(&self) -> &str {
        &self.definition.name
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Keyword
    }

    async fn check(
        &self,
        session: &dyn AcquisitionSession,
        target: &Target,
    ) -> Result<CheckResult, AdapterError> {
        let url = self.search_url_for(target).ok_or_else(|| {
            AdapterError::Acquisition(format!("target `{}` has no search keyword", target.name))
        })?;
        match session.fetch_page(&self.definition.name, &url).await {
            Ok(page) => Ok(self.parse_search_results(&page, target)),
            Err(AdapterError::NotFound { .. }) => Ok(CheckResult::out_of_stock()),
            Err(err) => Err(err),
        }
    }
}
