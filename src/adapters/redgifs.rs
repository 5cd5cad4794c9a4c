//! RedGifs adapter: a bearer-token-authenticated user search, pages mapped
//! 1:1 onto the Scanner's contract (spec.md §4.4).

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::Value;

use crate::adapters::{http_client, Adapter, LatestPage, PageResult, ValidationResult};
use crate::domain::{MediaType, ScrapedItem, Source, Thread};
use crate::errors::AdapterError;

const PAGE_SIZE: u32 = 40;
/// Tokens are issued for ~24h; cached for one to stay well clear of expiry
/// without a refresh race on every request.
const TOKEN_TTL: Duration = Duration::from_secs(3600);

struct CachedToken {
    value: String,
    fetched_at: Instant,
}

pub struct RedGifsAdapter {
    username: String,
    http: reqwest::Client,
    base_url: String,
    token: Mutex<Option<CachedToken>>,
}

impl RedGifsAdapter {
    pub fn new(source: &Source, thread: &Thread, http: reqwest::Client) -> Self {
        Self {
            username: thread.external_id.clone(),
            http,
            base_url: source.base_url.clone(),
            token: Mutex::new(None),
        }
    }

    async fn bearer_token(&self) -> Result<String, AdapterError> {
        {
            let guard = self.token.lock().unwrap();
            if let Some(cached) = guard.as_ref() {
                if cached.fetched_at.elapsed() < TOKEN_TTL {
                    return Ok(cached.value.clone());
                }
            }
        }

        let url = format!("{}/v2/auth/temporary", self.base_url.trim_end_matches('/'));
        let response = http_client::get_with_allowlist(&self.http, &url, &Default::default(), &[]).await?;
        let body: Value = response.json().await.map_err(|e| AdapterError::parse(e.to_string()))?;
        let token = body
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| AdapterError::auth("redgifs temporary token response missing 'token'"))?
            .to_string();

        *self.token.lock().unwrap() = Some(CachedToken { value: token.clone(), fetched_at: Instant::now() });
        Ok(token)
    }

    async fn search_page(&self, page: i64) -> Result<(Vec<ScrapedItem>, i64), AdapterError> {
        let token = self.bearer_token().await?;
        let url = format!(
            "{}/v2/users/{}/search?order=new&count={}&page={}",
            self.base_url.trim_end_matches('/'),
            self.username,
            PAGE_SIZE,
            page
        );

        let mut headers = std::collections::HashMap::new();
        headers.insert("Authorization".to_string(), format!("Bearer {token}"));

        let response = http_client::get_with_allowlist(&self.http, &url, &headers, &[]).await?;
        let body: Value = response.json().await.map_err(|e| AdapterError::parse(e.to_string()))?;

        let pages = body.pointer("/pages").and_then(Value::as_i64).unwrap_or(page);
        let gifs = body.get("gifs").and_then(Value::as_array).cloned().unwrap_or_default();
        let items = gifs.iter().filter_map(extract_item).collect();

        Ok((items, pages))
    }
}

/// RedGifs never reports a duration for its gif entries; callers rely on
/// the adapter-specific default rather than treating `None` as unknown.
fn extract_item(gif: &Value) -> Option<ScrapedItem> {
    let external_id = gif.get("id")?.as_str()?.to_string();
    let media_url = gif.pointer("/urls/hd").or_else(|| gif.pointer("/urls/sd")).and_then(Value::as_str)?.to_string();
    let thumbnail_url = gif.pointer("/urls/poster").or_else(|| gif.pointer("/urls/thumbnail")).and_then(Value::as_str).map(|s| s.to_string());
    let created_ts = gif.get("createDate").and_then(Value::as_i64).unwrap_or(0);
    let posted_at = Utc.timestamp_opt(created_ts, 0).single().unwrap_or_else(Utc::now);
    let width = gif.get("width").and_then(Value::as_u64).map(|w| w as u32);
    let height = gif.get("height").and_then(Value::as_u64).map(|h| h as u32);
    let username = gif.get("userName").and_then(Value::as_str).unwrap_or("").to_string();
    let tags = gif.get("tags").and_then(Value::as_array).map(|t| t.iter().filter_map(Value::as_str).map(|s| s.to_string()).collect()).unwrap_or_default();

    Some(ScrapedItem {
        external_id: external_id.clone(),
        permalink: format!("https://www.redgifs.com/watch/{external_id}"),
        posted_at,
        author: username.clone(),
        author_url: Some(format!("https://www.redgifs.com/users/{username}")),
        title: None,
        caption: None,
        media_type: MediaType::Gif,
        media_url: Some(media_url),
        thumbnail_url,
        duration_ms: None,
        width,
        height,
        assets: vec![],
        tags,
        source_metrics: Some(crate::domain::SourceMetrics { upvotes: gif.get("likes").and_then(Value::as_i64), comments: None, views: gif.get("views").and_then(Value::as_i64) }),
    })
}

#[async_trait]
impl Adapter for RedGifsAdapter {
    fn name(&self) -> &str {
        "redgifs"
    }

    async fn validate(&self) -> Result<ValidationResult, AdapterError> {
        match self.search_page(1).await {
            Ok(_) => Ok(ValidationResult { valid: true, error: None }),
            Err(e) => Ok(ValidationResult { valid: false, error: Some(e.message) }),
        }
    }

    async fn get_latest_page(&self) -> Result<LatestPage, AdapterError> {
        let (_, pages) = self.search_page(1).await?;
        Ok(LatestPage { latest_page: pages.max(1), total_pages: Some(pages.max(1)), total_items: None })
    }

    async fn scan_page(&self, page_number: i64) -> Result<PageResult, AdapterError> {
        let (items, pages) = self.search_page(page_number).await?;
        Ok(PageResult { items, page_number, has_more_pages: page_number < pages, total_items: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_gif_item_with_no_duration() {
        let gif = serde_json::json!({
            "id": "abc123",
            "urls": {"hd": "https://thumbs.redgifs.com/abc.mp4", "poster": "https://thumbs.redgifs.com/abc.jpg"},
            "createDate": 1_700_000_000i64,
            "width": 1280,
            "height": 720,
            "userName": "someuser",
            "tags": ["tag1", "tag2"],
        });
        let item = extract_item(&gif).unwrap();
        assert_eq!(item.media_type, MediaType::Gif);
        assert!(item.duration_ms.is_none());
        assert_eq!(item.width, Some(1280));
        assert_eq!(item.permalink, "https://www.redgifs.com/watch/abc123");
    }

    #[test]
    fn falls_back_to_sd_when_hd_missing() {
        let gif = serde_json::json!({
            "id": "x",
            "urls": {"sd": "https://thumbs.redgifs.com/x.mp4"},
            "createDate": 1_700_000_000i64,
        });
        let item = extract_item(&gif).unwrap();
        assert_eq!(item.media_url, Some("https://thumbs.redgifs.com/x.mp4".to_string()));
    }
}
