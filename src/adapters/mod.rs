//! C4 — Adapter: source-specific plugin contract (spec.md §4.4).
//!
//! Resolution happens once at source-load time via [`build_adapter`],
//! following the tagged-enum/trait guidance in spec.md §9: unknown kinds
//! are rejected by the (out-of-scope) admin API before a job is ever
//! scheduled, so `build_adapter` failing here is itself a programming
//! error rather than a runtime condition to retry.

pub mod generic_html;
pub mod http_client;
pub mod reddit;
pub mod redgifs;

use async_trait::async_trait;

use crate::domain::{AdapterKind, ScrapedItem, Source, Thread};
use crate::errors::AdapterError;

#[derive(Clone, Debug)]
pub struct LatestPage {
    pub latest_page: i64,
    pub total_pages: Option<i64>,
    pub total_items: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct PageResult {
    pub items: Vec<ScrapedItem>,
    pub page_number: i64,
    pub has_more_pages: bool,
    pub total_items: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct ValidationResult {
    pub valid: bool,
    pub error: Option<String>,
}

#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;
    async fn validate(&self) -> Result<ValidationResult, AdapterError>;
    async fn get_latest_page(&self) -> Result<LatestPage, AdapterError>;
    async fn scan_page(&self, page_number: i64) -> Result<PageResult, AdapterError>;
}

pub fn build_adapter(source: &Source, thread: &Thread, http: reqwest::Client) -> anyhow::Result<Box<dyn Adapter>> {
    match source.adapter_kind {
        AdapterKind::GenericHtml => Ok(Box::new(generic_html::GenericHtmlAdapter::new(source, thread, http)?)),
        AdapterKind::Reddit => Ok(Box::new(reddit::RedditAdapter::new(source, thread, http))),
        AdapterKind::RedGifs => Ok(Box::new(redgifs::RedGifsAdapter::new(source, thread, http))),
    }
}
