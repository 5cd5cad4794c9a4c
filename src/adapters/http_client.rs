//! Shared outbound HTTP plumbing for adapters: a UA-carrying client with
//! redirects disabled so every hop can be re-validated against the
//! outbound allowlist (spec.md §6).

use std::collections::HashMap;
use std::time::Duration;

use crate::errors::AdapterError;
use crate::net;

const MAX_REDIRECTS: u8 = 5;
const DEFAULT_USER_AGENT: &str = "ingest-engine/0.1 (+https://example.invalid/bot)";

pub fn build_client(user_agent: Option<&str>) -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(user_agent.unwrap_or(DEFAULT_USER_AGENT))
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(30))
        .build()
        .expect("reqwest client configuration is valid")
}

/// GET `url`, following redirects manually (re-validating each hop against
/// the allowlist) and merging `extra_headers` (cookies/Referer/Origin for
/// sources that need them).
pub async fn get_with_allowlist(
    client: &reqwest::Client,
    url: &str,
    extra_headers: &HashMap<String, String>,
    extra_allowed_hosts: &[String],
) -> Result<reqwest::Response, AdapterError> {
    let mut current = url.to_string();
    for _ in 0..MAX_REDIRECTS {
        net::validate_outbound_url(&current, extra_allowed_hosts)
            .map_err(|e| AdapterError::network(format!("blocked outbound host: {e}")))?;

        let mut req = client.get(&current);
        for (k, v) in extra_headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let response = req.send().await.map_err(|e| AdapterError::network(e.to_string()))?;

        if response.status().is_redirection() {
            if let Some(location) = response.headers().get(reqwest::header::LOCATION) {
                let location = location.to_str().map_err(|e| AdapterError::network(e.to_string()))?;
                current = resolve_redirect(&current, location)?;
                continue;
            }
        }

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AdapterError::rate_limited("received 429"));
        }
        if !response.status().is_success() {
            return Err(AdapterError::network(format!("unexpected status {}", response.status())));
        }
        return Ok(response);
    }
    Err(AdapterError::network("too many redirects"))
}

fn resolve_redirect(base: &str, location: &str) -> Result<String, AdapterError> {
    let base_url = url::Url::parse(base).map_err(|e| AdapterError::network(e.to_string()))?;
    base_url.join(location).map(|u| u.to_string()).map_err(|e| AdapterError::network(e.to_string()))
}
