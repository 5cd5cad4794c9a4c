use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of adapter a `Source` should be ingested with.
///
/// Resolution happens once, at source-load time, in
/// [`crate::adapters::build_adapter`]. An unrecognized value only ever
/// reaches this type via the (out-of-scope) admin API, which is expected to
/// reject unknown kinds before a `Source` row is created.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterKind {
    GenericHtml,
    Reddit,
    RedGifs,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::GenericHtml => "generic-html",
            AdapterKind::Reddit => "reddit",
            AdapterKind::RedGifs => "redgifs",
        }
    }
}

/// Rate-limit configuration for a source. Either an explicit bucket
/// (`bucket_size`/`refill_rate`) or `requests_per_minute` may be supplied;
/// see `RateLimiter::from_config` for the derivation rule when only rpm is
/// given. `crawl_delay_ms`, when set, lets a source bypass the bucket
/// entirely (spec.md §4.1).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_minute: Option<f64>,
    pub bucket_size: Option<f64>,
    pub refill_rate: Option<f64>,
    pub crawl_delay_ms: Option<u64>,
}

/// CSS-selector configuration consumed by the generic-html adapter.
/// Validated at source-creation time by the admin surface; the adapter
/// itself assumes the selectors parse.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HtmlSelectors {
    pub item_container: String,
    pub external_id: Option<String>,
    pub permalink: String,
    pub timestamp: Option<String>,
    pub author: Option<String>,
    pub media_url: String,
    pub thumbnail_url: Option<String>,
    pub title: Option<String>,
    pub caption: Option<String>,
    pub tags: Option<String>,
    pub width: Option<String>,
    pub height: Option<String>,
    pub duration: Option<String>,
    pub pagination_links: Option<String>,
    pub total_items: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlPatternStyle {
    Query,
    Path,
    Offset,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenericHtmlConfig {
    pub url_pattern: String,
    pub pattern_style: UrlPatternStyle,
    pub page_param: Option<String>,
    pub items_per_page: Option<u32>,
    pub newest_first: bool,
    pub selectors: HtmlSelectors,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub generic_html: Option<GenericHtmlConfig>,
    /// Extra headers merged into every outbound request for this source
    /// (cookies for authenticated forums, `Referer`/`Origin` for RedGifs).
    pub extra_headers: std::collections::HashMap<String, String>,
}

/// An origin site. Immutable under ingestion except for config edits made
/// by the (out-of-scope) admin surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub base_url: String,
    pub adapter_kind: AdapterKind,
    pub rate_limit: RateLimitConfig,
    pub adapter_config: AdapterConfig,
    pub user_agent: Option<String>,
    pub enabled: bool,
}
