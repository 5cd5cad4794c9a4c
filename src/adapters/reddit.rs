//! Reddit adapter: a `/new.json` listing cursor wrapped in the Scanner's
//! dense-integer page contract (spec.md §4.4).

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::Value;

use crate::adapters::{http_client, Adapter, LatestPage, PageResult, ValidationResult};
use crate::domain::{MediaType, ScrapedAsset, ScrapedItem, Source, Thread};
use crate::errors::AdapterError;

/// `latest_page` is fixed at 10 (≈250 posts); deeper histories require
/// raising this constant or supporting dynamic expansion (spec.md §9 open
/// question — kept as a constant here per that note).
const LATEST_PAGE: i64 = 10;
const PAGE_SIZE: u32 = 25;

pub struct RedditAdapter {
    subreddit: String,
    http: reqwest::Client,
    base_url: String,
    /// `after_to_reach[k]` is the cursor required to fetch Reddit listing
    /// page `k` (1-indexed); `after_to_reach[1]` is always `None`.
    after_to_reach: Mutex<std::collections::HashMap<i64, Option<String>>>,
}

impl RedditAdapter {
    pub fn new(source: &Source, thread: &Thread, http: reqwest::Client) -> Self {
        let mut after_to_reach = std::collections::HashMap::new();
        after_to_reach.insert(1, None);
        Self {
            subreddit: thread.external_id.clone(),
            http,
            base_url: source.base_url.clone(),
            after_to_reach: Mutex::new(after_to_reach),
        }
    }

    /// Scanner page N maps to Reddit page `10 - N + 1`, so scanner page 10
    /// is the newest.
    fn reddit_page(scanner_page: i64) -> i64 {
        LATEST_PAGE - scanner_page + 1
    }

    async fn fetch_listing(&self, after: Option<&str>) -> Result<RedditListing, AdapterError> {
        let mut url = format!("{}/r/{}/new.json?limit={}&raw_json=1", self.base_url.trim_end_matches('/'), self.subreddit, PAGE_SIZE);
        if let Some(after) = after {
            url.push_str(&format!("&after={after}"));
        }

        let response = match http_client::get_with_allowlist(&self.http, &url, &Default::default(), &["reddit.com".to_string()]).await {
            Ok(r) => r,
            Err(e) if e.kind == crate::errors::AdapterErrorKind::RateLimited => {
                // A single bounded retry after 5s on HTTP 429, per spec.md §4.4.
                tokio::time::sleep(std::time::Duration::from_millis(5_000)).await;
                http_client::get_with_allowlist(&self.http, &url, &Default::default(), &["reddit.com".to_string()]).await?
            }
            Err(e) => return Err(e),
        };

        let body: Value = response.json().await.map_err(|e| AdapterError::parse(e.to_string()))?;
        parse_listing(&body)
    }

    /// Materializes `after_to_reach[reddit_page]`, walking forward hop by
    /// hop from the furthest cached page when a later page is requested
    /// first (spec.md §4.4).
    async fn after_for(&self, reddit_page: i64) -> Result<Option<String>, AdapterError> {
        if reddit_page <= 1 {
            return Ok(None);
        }
        if let Some(after) = self.after_to_reach.lock().unwrap().get(&reddit_page).cloned() {
            return Ok(after);
        }

        let furthest_known = (1..=reddit_page).rev().find_map(|p| self.after_to_reach.lock().unwrap().get(&p).cloned().map(|a| (p, a)));
        let (mut at_page, mut cursor) = furthest_known.unwrap_or((1, None));

        while at_page < reddit_page {
            let listing = self.fetch_listing(cursor.as_deref()).await?;
            at_page += 1;
            cursor = listing.after;
            self.after_to_reach.lock().unwrap().insert(at_page, cursor.clone());
        }

        Ok(cursor)
    }
}

struct RedditListing {
    items: Vec<ScrapedItem>,
    after: Option<String>,
}

#[async_trait]
impl Adapter for RedditAdapter {
    fn name(&self) -> &str {
        "reddit"
    }

    async fn validate(&self) -> Result<ValidationResult, AdapterError> {
        match self.fetch_listing(None).await {
            Ok(_) => Ok(ValidationResult { valid: true, error: None }),
            Err(e) => Ok(ValidationResult { valid: false, error: Some(e.message) }),
        }
    }

    async fn get_latest_page(&self) -> Result<LatestPage, AdapterError> {
        Ok(LatestPage { latest_page: LATEST_PAGE, total_pages: Some(LATEST_PAGE), total_items: None })
    }

    async fn scan_page(&self, page_number: i64) -> Result<PageResult, AdapterError> {
        let reddit_page = Self::reddit_page(page_number);
        let after = self.after_for(reddit_page).await?;
        let listing = self.fetch_listing(after.as_deref()).await?;
        self.after_to_reach.lock().unwrap().insert(reddit_page + 1, listing.after.clone());

        Ok(PageResult {
            items: listing.items,
            page_number,
            has_more_pages: page_number > 1,
            total_items: None,
        })
    }
}

fn parse_listing(body: &Value) -> Result<RedditListing, AdapterError> {
    let children = body
        .pointer("/data/children")
        .and_then(Value::as_array)
        .ok_or_else(|| AdapterError::parse("missing data.children"))?;

    let after = body.pointer("/data/after").and_then(Value::as_str).map(|s| s.to_string());

    let items = children.iter().filter_map(|c| c.get("data")).filter_map(extract_item).collect();

    Ok(RedditListing { items, after })
}

fn extract_item(post: &Value) -> Option<ScrapedItem> {
    let external_id = post.get("id")?.as_str()?.to_string();
    let permalink_path = post.get("permalink")?.as_str()?;
    let permalink = format!("https://www.reddit.com{permalink_path}");
    let author = post.get("author")?.as_str().unwrap_or("[deleted]").to_string();
    let created_utc = post.get("created_utc")?.as_f64()?;
    let posted_at = Utc.timestamp_opt(created_utc as i64, 0).single()?;
    let title = post.get("title").and_then(Value::as_str).map(|s| s.to_string());

    let (media_url, media_type, duration_ms, thumbnail_url, width, height, assets) = extract_media(post)?;

    Some(ScrapedItem {
        external_id,
        permalink,
        posted_at,
        author,
        author_url: Some(format!("https://www.reddit.com/user/{}", post.get("author").and_then(Value::as_str).unwrap_or(""))),
        title,
        caption: None,
        media_type,
        media_url: Some(media_url),
        thumbnail_url,
        duration_ms,
        width,
        height,
        assets,
        tags: vec![],
        source_metrics: Some(crate::domain::SourceMetrics {
            upvotes: post.get("ups").and_then(Value::as_i64),
            comments: post.get("num_comments").and_then(Value::as_i64),
            views: None,
        }),
    })
}

type MediaExtraction = (String, MediaType, Option<u64>, Option<String>, Option<u32>, Option<u32>, Vec<ScrapedAsset>);

/// Priority cascade from spec.md §4.4: reddit-hosted video -> crosspost
/// video -> external oEmbed (RedGifs dropped here, ingested via its own
/// adapter) -> gallery -> direct image/gif by extension or CDN host ->
/// preview mp4/gif variant -> imgur `.gifv` -> `.mp4` rewrite.
fn extract_media(post: &Value) -> Option<MediaExtraction> {
    if let Some(v) = post.pointer("/media/reddit_video") {
        return reddit_video(v);
    }

    if let Some(crossposts) = post.get("crosspost_parent_list").and_then(Value::as_array) {
        for parent in crossposts {
            if let Some(v) = parent.pointer("/media/reddit_video") {
                if let Some(m) = reddit_video(v) {
                    return Some(m);
                }
            }
        }
    }

    if let Some(oembed) = post.pointer("/media/oembed") {
        let provider = oembed.get("provider_name").and_then(Value::as_str).unwrap_or("");
        if !provider.eq_ignore_ascii_case("redgifs") {
            if let Some(thumb) = oembed.get("thumbnail_url").and_then(Value::as_str) {
                return Some((thumb.to_string(), MediaType::Image, None, None, None, None, vec![]));
            }
        }
    }

    if post.get("is_gallery").and_then(Value::as_bool).unwrap_or(false) {
        if let Some(m) = gallery_media(post) {
            return Some(m);
        }
    }

    if let Some(url) = post.get("url_overridden_by_dest").and_then(Value::as_str).or_else(|| post.get("url").and_then(Value::as_str)) {
        let mt = crate::dedup::infer_media_type(url, None);
        if matches!(mt, MediaType::Image | MediaType::Gif) {
            return Some((url.to_string(), mt, None, None, None, None, vec![]));
        }
        if let Some(rewritten) = url.strip_suffix(".gifv") {
            return Some((format!("{rewritten}.mp4"), MediaType::Video, None, None, None, None, vec![]));
        }
    }

    if let Some(preview) = post.pointer("/preview/images/0/variants/mp4/source/url").and_then(Value::as_str) {
        return Some((html_unescape(preview), MediaType::Video, None, None, None, None, vec![]));
    }
    if let Some(preview) = post.pointer("/preview/images/0/variants/gif/source/url").and_then(Value::as_str) {
        return Some((html_unescape(preview), MediaType::Gif, None, None, None, None, vec![]));
    }

    None
}

fn reddit_video(video: &Value) -> Option<MediaExtraction> {
    let url = video.get("fallback_url")?.as_str()?.to_string();
    let duration_ms = video.get("duration").and_then(Value::as_u64).map(|s| s * 1000);
    let width = video.get("width").and_then(Value::as_u64).map(|w| w as u32);
    let height = video.get("height").and_then(Value::as_u64).map(|h| h as u32);
    Some((url, MediaType::Video, duration_ms, None, width, height, vec![]))
}

/// Ordered by `gallery_data.items`, falling back to `media_metadata` key
/// order; the first valid asset becomes the primary `media_url`.
fn gallery_media(post: &Value) -> Option<MediaExtraction> {
    let metadata = post.get("media_metadata")?.as_object()?;
    let order: Vec<String> = if let Some(items) = post.pointer("/gallery_data/items").and_then(Value::as_array) {
        items.iter().filter_map(|i| i.get("media_id")).filter_map(Value::as_str).map(|s| s.to_string()).collect()
    } else {
        metadata.keys().cloned().collect()
    };

    let mut assets = Vec::new();
    for media_id in &order {
        let Some(entry) = metadata.get(media_id) else { continue };
        let Some(url) = entry.pointer("/s/u").or_else(|| entry.pointer("/s/gif")).and_then(Value::as_str) else { continue };
        let url = html_unescape(url);
        let width = entry.pointer("/s/x").and_then(Value::as_u64).map(|w| w as u32);
        let height = entry.pointer("/s/y").and_then(Value::as_u64).map(|h| h as u32);
        let mt = crate::dedup::infer_media_type(&url, None);
        assets.push((url, mt, width, height));
    }

    let (primary_url, primary_type, primary_w, primary_h) = assets.first().cloned()?;
    let remaining: Vec<ScrapedAsset> = assets
        .into_iter()
        .skip(1)
        .map(|(url, mt, w, h)| ScrapedAsset { url, media_type: mt, width: w, height: h })
        .collect();

    Some((primary_url, primary_type, None, None, primary_w, primary_h, remaining))
}

fn html_unescape(s: &str) -> String {
    s.replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_mapping_scanner_ten_is_reddit_page_one() {
        assert_eq!(RedditAdapter::reddit_page(10), 1);
        assert_eq!(RedditAdapter::reddit_page(1), 10);
    }

    #[test]
    fn gallery_primary_then_assets_in_order() {
        let post = serde_json::json!({
            "is_gallery": true,
            "gallery_data": {"items": [{"media_id": "a"}, {"media_id": "b"}, {"media_id": "c"}]},
            "media_metadata": {
                "a": {"s": {"u": "https://i.redd.it/a.jpg", "x": 100, "y": 200}},
                "b": {"s": {"u": "https://i.redd.it/b.jpg", "x": 100, "y": 200}},
                "c": {"status": "failed"},
            }
        });
        let (primary, _, _, _, _, _, assets) = gallery_media(&post).unwrap();
        assert_eq!(primary, "https://i.redd.it/a.jpg");
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].url, "https://i.redd.it/b.jpg");
    }
}
