//! Generic HTML adapter: CSS-selector-driven scraping of paginated HTML
//! feeds (spec.md §4.4).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

use crate::adapters::{http_client, Adapter, LatestPage, PageResult, ValidationResult};
use crate::domain::source::UrlPatternStyle;
use crate::domain::{GenericHtmlConfig, MediaType, ScrapedItem, Source};
use crate::dedup::infer_media_type;
use crate::errors::AdapterError;

pub struct GenericHtmlAdapter {
    base_url: String,
    http: reqwest::Client,
    config: GenericHtmlConfig,
    extra_headers: HashMap<String, String>,
    extra_allowed_hosts: Vec<String>,
}

impl GenericHtmlAdapter {
    /// `thread.url` overrides the source's default `url_pattern` — one
    /// `generic-html` source's selectors/pattern style are shared across
    /// all of its threads, but each thread paginates from its own board
    /// path.
    pub fn new(source: &Source, thread: &crate::domain::Thread, http: reqwest::Client) -> anyhow::Result<Self> {
        let mut config = source
            .adapter_config
            .generic_html
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generic-html source missing generic_html config"))?;
        if !thread.url.is_empty() {
            config.url_pattern = thread.url.clone();
        }
        let extra_allowed_hosts = url::Url::parse(&source.base_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .into_iter()
            .collect();
        Ok(Self {
            base_url: source.base_url.clone(),
            http,
            config,
            extra_headers: source.adapter_config.extra_headers.clone(),
            extra_allowed_hosts,
        })
    }

    fn page_url(&self, page: i64) -> String {
        let param = self.config.page_param.as_deref().unwrap_or("page");
        match self.config.pattern_style {
            UrlPatternStyle::Query => {
                if page <= 1 {
                    self.config.url_pattern.clone()
                } else {
                    let sep = if self.config.url_pattern.contains('?') { '&' } else { '?' };
                    format!("{}{}{}={}", self.config.url_pattern, sep, param, page)
                }
            }
            UrlPatternStyle::Path => {
                if self.config.url_pattern.contains("{page}") {
                    self.config.url_pattern.replace("{page}", &page.to_string())
                } else if page <= 1 {
                    self.config.url_pattern.clone()
                } else {
                    format!("{}/page-{}", self.config.url_pattern.trim_end_matches('/'), page)
                }
            }
            UrlPatternStyle::Offset => {
                let per_page = self.config.items_per_page.unwrap_or(25) as i64;
                let offset = (page - 1) * per_page;
                let sep = if self.config.url_pattern.contains('?') { '&' } else { '?' };
                format!("{}{}offset={}", self.config.url_pattern, sep, offset)
            }
        }
    }

    async fn fetch_html(&self, page: i64) -> Result<String, AdapterError> {
        let url = self.page_url(page);
        let response = http_client::get_with_allowlist(&self.http, &url, &self.extra_headers, &self.extra_allowed_hosts).await?;
        response.text().await.map_err(|e| AdapterError::network(e.to_string()))
    }

    fn parse_page(&self, html: &str, page: i64) -> Result<PageResult, AdapterError> {
        let document = Html::parse_document(html);
        let selectors = &self.config.selectors;

        let container_sel = parse_selector(&selectors.item_container)?;
        let mut items = Vec::new();

        for element in document.select(&container_sel) {
            let Some(permalink) = select_attr_or_text(&element, &selectors.permalink, "href") else {
                continue;
            };
            let permalink = resolve_url(&self.base_url, &permalink);

            let media_urls = select_all_attr_or_text(&element, &selectors.media_url, "src");
            if media_urls.is_empty() {
                continue;
            }

            let mut seen_urls = std::collections::HashSet::new();
            let deduped: Vec<String> = media_urls
                .into_iter()
                .map(|u| resolve_url(&self.base_url, &u))
                .filter(|u| seen_urls.insert(u.clone()))
                .collect();

            let base_external_id = selectors
                .external_id
                .as_ref()
                .and_then(|sel| select_attr_or_text(&element, sel, "data-id"))
                .unwrap_or_else(|| fallback_external_id(&permalink));

            let author = selectors
                .author
                .as_ref()
                .and_then(|sel| select_attr_or_text(&element, sel, "text"))
                .unwrap_or_default();

            let posted_at = selectors
                .timestamp
                .as_ref()
                .and_then(|sel| select_attr_or_text(&element, sel, "datetime"))
                .and_then(|raw| parse_timestamp(&raw, Utc::now()))
                .unwrap_or_else(Utc::now);

            let title = selectors.title.as_ref().and_then(|sel| select_attr_or_text(&element, sel, "text"));
            let caption = selectors.caption.as_ref().and_then(|sel| select_attr_or_text(&element, sel, "text"));
            let thumbnail_url = selectors
                .thumbnail_url
                .as_ref()
                .and_then(|sel| select_attr_or_text(&element, sel, "src"))
                .map(|u| resolve_url(&self.base_url, &u));
            let tags = selectors
                .tags
                .as_ref()
                .map(|sel| select_all_attr_or_text(&element, sel, "text"))
                .unwrap_or_default();
            let width = selectors.width.as_ref().and_then(|sel| select_attr_or_text(&element, sel, "text")).and_then(|s| s.parse().ok());
            let height = selectors.height.as_ref().and_then(|sel| select_attr_or_text(&element, sel, "text")).and_then(|s| s.parse().ok());
            let duration_ms = selectors
                .duration
                .as_ref()
                .and_then(|sel| select_attr_or_text(&element, sel, "text"))
                .and_then(|s| s.parse().ok());

            if deduped.len() <= 1 {
                let media_url = deduped.into_iter().next();
                let media_type = media_url.as_deref().map(|u| infer_media_type(u, None)).unwrap_or(MediaType::Unknown);
                items.push(ScrapedItem {
                    external_id: base_external_id,
                    permalink,
                    posted_at,
                    author,
                    author_url: None,
                    title,
                    caption,
                    media_type,
                    media_url,
                    thumbnail_url,
                    duration_ms,
                    width,
                    height,
                    assets: vec![],
                    tags,
                    source_metrics: None,
                });
            } else {
                for (i, media_url) in deduped.into_iter().enumerate() {
                    let media_type = infer_media_type(&media_url, None);
                    items.push(ScrapedItem {
                        external_id: format!("{base_external_id}-img-{i}"),
                        permalink: permalink.clone(),
                        posted_at,
                        author: author.clone(),
                        author_url: None,
                        title: title.clone(),
                        caption: caption.clone(),
                        media_type,
                        media_url: Some(media_url),
                        thumbnail_url: thumbnail_url.clone(),
                        duration_ms,
                        width,
                        height,
                        assets: vec![],
                        tags: tags.clone(),
                        source_metrics: None,
                    });
                }
            }
        }

        if !self.config.newest_first {
            items.reverse();
        }

        let total_items = selectors
            .total_items
            .as_ref()
            .and_then(|sel| select_attr_or_text_from_doc(&document, sel, "text"))
            .and_then(|s| s.trim().parse().ok());

        let has_more_pages = discover_max_page(&document, &selectors.pagination_links).map(|max| page < max).unwrap_or(!items.is_empty());

        Ok(PageResult { items, page_number: page, has_more_pages, total_items })
    }
}

fn parse_selector(raw: &str) -> Result<Selector, AdapterError> {
    Selector::parse(raw).map_err(|e| AdapterError::parse(format!("bad selector '{raw}': {e:?}")))
}

fn select_attr_or_text(element: &scraper::ElementRef<'_>, selector: &str, attr: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    let found = element.select(&sel).next()?;
    attr_or_text(&found, attr)
}

fn select_all_attr_or_text(element: &scraper::ElementRef<'_>, selector: &str, attr: &str) -> Vec<String> {
    let Ok(sel) = Selector::parse(selector) else { return vec![] };
    element.select(&sel).filter_map(|el| attr_or_text(&el, attr)).collect()
}

fn select_attr_or_text_from_doc(doc: &Html, selector: &str, attr: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    let found = doc.select(&sel).next()?;
    attr_or_text(&found, attr)
}

fn attr_or_text(element: &scraper::ElementRef<'_>, attr: &str) -> Option<String> {
    if attr == "text" {
        let text: String = element.text().collect::<Vec<_>>().join(" ").trim().to_string();
        if text.is_empty() { None } else { Some(text) }
    } else {
        element.value().attr(attr).map(|s| s.to_string())
    }
}

fn resolve_url(base: &str, maybe_relative: &str) -> String {
    if maybe_relative.starts_with("http://") || maybe_relative.starts_with("https://") {
        return maybe_relative.to_string();
    }
    url::Url::parse(base)
        .ok()
        .and_then(|b| b.join(maybe_relative).ok())
        .map(|u| u.to_string())
        .unwrap_or_else(|| maybe_relative.to_string())
}

fn fallback_external_id(permalink: &str) -> String {
    permalink.rsplit('/').find(|s| !s.is_empty()).unwrap_or(permalink).to_string()
}

static PAGE_LINK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:page-|[?&]page=)(\d+)").unwrap());
static RELATIVE_TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(\d+)\s*(second|minute|hour|day|week|month|year)s?\s*ago\s*$").unwrap());

/// Derives pagination from explicit `pagination_links` selector if present,
/// else by scanning anchor hrefs for `/page-N` or `?page=N` and taking the
/// max.
fn discover_max_page(document: &Html, pagination_links_selector: &Option<String>) -> Option<i64> {
    let selector_str = pagination_links_selector.clone().unwrap_or_else(|| "a".to_string());
    let sel = Selector::parse(&selector_str).ok()?;
    document
        .select(&sel)
        .filter_map(|el| el.value().attr("href"))
        .filter_map(|href| PAGE_LINK_RE.captures(href))
        .filter_map(|caps| caps.get(1)?.as_str().parse::<i64>().ok())
        .max()
}

/// Recognizes ISO8601, Unix seconds, Unix milliseconds, and
/// natural-language relative times ("3 hours ago").
pub fn parse_timestamp(raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(n) = trimmed.parse::<i64>() {
        return if trimmed.len() >= 13 {
            Utc.timestamp_millis_opt(n).single()
        } else {
            Utc.timestamp_opt(n, 0).single()
        };
    }

    if let Some(caps) = RELATIVE_TIME_RE.captures(trimmed) {
        let amount: i64 = caps.get(1)?.as_str().parse().ok()?;
        let unit = caps.get(2)?.as_str().to_lowercase();
        let delta = match unit.as_str() {
            "second" => chrono::Duration::seconds(amount),
            "minute" => chrono::Duration::minutes(amount),
            "hour" => chrono::Duration::hours(amount),
            "day" => chrono::Duration::days(amount),
            "week" => chrono::Duration::weeks(amount),
            "month" => chrono::Duration::days(amount * 30),
            "year" => chrono::Duration::days(amount * 365),
            _ => return None,
        };
        return Some(now - delta);
    }

    None
}

#[async_trait]
impl Adapter for GenericHtmlAdapter {
    fn name(&self) -> &str {
        "generic-html"
    }

    async fn validate(&self) -> Result<ValidationResult, AdapterError> {
        match self.fetch_html(1).await {
            Ok(html) => {
                let doc = Html::parse_document(&html);
                let sel = parse_selector(&self.config.selectors.item_container)?;
                if doc.select(&sel).next().is_some() {
                    Ok(ValidationResult { valid: true, error: None })
                } else {
                    Ok(ValidationResult { valid: false, error: Some("item container selector matched nothing".to_string()) })
                }
            }
            Err(e) => Ok(ValidationResult { valid: false, error: Some(e.message) }),
        }
    }

    async fn get_latest_page(&self) -> Result<LatestPage, AdapterError> {
        let html = self.fetch_html(1).await?;
        let document = Html::parse_document(&html);
        let latest = discover_max_page(&document, &self.config.selectors.pagination_links).unwrap_or(1);
        Ok(LatestPage { latest_page: latest, total_pages: Some(latest), total_items: None })
    }

    async fn scan_page(&self, page_number: i64) -> Result<PageResult, AdapterError> {
        let html = self.fetch_html(page_number).await?;
        self.parse_page(&html, page_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_time_parses_hours_ago() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let parsed = parse_timestamp("2 hours ago", now).unwrap();
        let expected = now - chrono::Duration::hours(2);
        assert!((parsed - expected).num_seconds().abs() <= 1);
    }

    #[test]
    fn recognizes_unix_seconds_and_millis() {
        let now = Utc::now();
        let secs = parse_timestamp("1700000000", now).unwrap();
        assert_eq!(secs.timestamp(), 1_700_000_000);
        let millis = parse_timestamp("1700000000000", now).unwrap();
        assert_eq!(millis.timestamp(), 1_700_000_000);
    }

    #[test]
    fn recognizes_iso8601() {
        let now = Utc::now();
        let parsed = parse_timestamp("2024-01-01T00:00:00Z", now).unwrap();
        assert_eq!(parsed.timestamp(), 1_704_067_200);
    }

    #[test]
    fn query_pattern_omits_param_on_page_one() {
        let config = sample_config(UrlPatternStyle::Query);
        let adapter = GenericHtmlAdapter {
            base_url: "https://forum.example.com".to_string(),
            http: reqwest::Client::new(),
            config,
            extra_headers: HashMap::new(),
            extra_allowed_hosts: vec![],
        };
        assert_eq!(adapter.page_url(1), "https://forum.example.com/list");
        assert_eq!(adapter.page_url(3), "https://forum.example.com/list?page=3");
    }

    #[test]
    fn path_pattern_uses_page_suffix() {
        let config = sample_config(UrlPatternStyle::Path);
        let adapter = GenericHtmlAdapter {
            base_url: "https://forum.example.com".to_string(),
            http: reqwest::Client::new(),
            config,
            extra_headers: HashMap::new(),
            extra_allowed_hosts: vec![],
        };
        assert_eq!(adapter.page_url(1), "https://forum.example.com/thread");
        assert_eq!(adapter.page_url(2), "https://forum.example.com/thread/page-2");
    }

    #[test]
    fn offset_pattern_computes_offset() {
        let mut config = sample_config(UrlPatternStyle::Offset);
        config.items_per_page = Some(20);
        let adapter = GenericHtmlAdapter {
            base_url: "https://forum.example.com".to_string(),
            http: reqwest::Client::new(),
            config,
            extra_headers: HashMap::new(),
            extra_allowed_hosts: vec![],
        };
        assert_eq!(adapter.page_url(3), "https://forum.example.com/thread?offset=40");
    }

    fn sample_config(style: UrlPatternStyle) -> GenericHtmlConfig {
        let url_pattern = match style {
            UrlPatternStyle::Query => "https://forum.example.com/list".to_string(),
            UrlPatternStyle::Path => "https://forum.example.com/thread".to_string(),
            UrlPatternStyle::Offset => "https://forum.example.com/thread".to_string(),
        };
        GenericHtmlConfig {
            url_pattern,
            pattern_style: style,
            page_param: None,
            items_per_page: Some(25),
            newest_first: true,
            selectors: crate::domain::HtmlSelectors {
                item_container: ".item".to_string(),
                external_id: None,
                permalink: "a".to_string(),
                timestamp: None,
                author: None,
                media_url: "img".to_string(),
                thumbnail_url: None,
                title: None,
                caption: None,
                tags: None,
                width: None,
                height: None,
                duration: None,
                pagination_links: None,
                total_items: None,
            },
        }
    }

    #[test]
    fn parses_items_and_expands_gallery_posts() {
        let html = r#"
            <html><body>
              <div class="item" data-id="1">
                <a class="perm" href="/p/1">post</a>
                <span class="author">Alice</span>
                <time class="ts" datetime="2024-01-01T00:00:00Z"></time>
                <img class="media" src="https://cdn.example.com/a.jpg">
                <img class="media" src="https://cdn.example.com/b.jpg">
              </div>
              <div class="item" data-id="2">
                <a class="perm" href="/p/2">post</a>
                <span class="author">Bob</span>
                <time class="ts" datetime="2024-01-02T00:00:00Z"></time>
                <img class="media" src="https://cdn.example.com/c.jpg">
              </div>
            </body></html>
        "#;

        let config = GenericHtmlConfig {
            url_pattern: "https://forum.example.com/list".to_string(),
            pattern_style: UrlPatternStyle::Query,
            page_param: None,
            items_per_page: None,
            newest_first: true,
            selectors: crate::domain::HtmlSelectors {
                item_container: ".item".to_string(),
                external_id: None,
                permalink: "a.perm".to_string(),
                timestamp: Some("time.ts".to_string()),
                author: Some("span.author".to_string()),
                media_url: "img.media".to_string(),
                thumbnail_url: None,
                title: None,
                caption: None,
                tags: None,
                width: None,
                height: None,
                duration: None,
                pagination_links: None,
                total_items: None,
            },
        };

        let adapter = GenericHtmlAdapter {
            base_url: "https://forum.example.com".to_string(),
            http: reqwest::Client::new(),
            config,
            extra_headers: HashMap::new(),
            extra_allowed_hosts: vec![],
        };

        let result = adapter.parse_page(html, 1).unwrap();
        assert_eq!(result.items.len(), 3);
        assert_eq!(result.items[0].external_id, "1-img-0");
        assert_eq!(result.items[1].external_id, "1-img-1");
        assert_eq!(result.items[2].external_id, "2");
    }
}
