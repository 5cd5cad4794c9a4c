//! Shared SSRF-safe outbound allowlist, used by adapter fetches, the
//! RedGifs token exchange, and the CDN pre-cache downloader (spec.md §6).

use crate::errors::NetError;

/// Hosts that are never permitted regardless of the allowlist below.
const DENYLIST: &[&str] = &["localhost", "127.0.0.1", "0.0.0.0", "169.254.169.254", "::1"];

/// Known-good hosts, checked by exact match or suffix match (so
/// `foo.reddit.com` matches an allowlist entry of `reddit.com`).
const ALLOWLIST: &[&str] = &[
    "reddit.com",
    "redd.it",
    "redgifs.com",
    "imgur.com",
    "i.imgur.com",
    "gfycat.com",
];

fn is_denied(host: &str) -> bool {
    let host = host.trim_matches(|c| c == '[' || c == ']');
    if DENYLIST.iter().any(|d| host.eq_ignore_ascii_case(d)) {
        return true;
    }
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified() || is_link_local(&ip);
    }
    false
}

fn is_link_local(ip: &std::net::IpAddr) -> bool {
    match ip {
        std::net::IpAddr::V4(v4) => v4.is_link_local(),
        std::net::IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

fn is_allowed(host: &str) -> bool {
    ALLOWLIST
        .iter()
        .any(|a| host.eq_ignore_ascii_case(a) || host.to_ascii_lowercase().ends_with(&format!(".{a}")))
}

/// Validate a single host against the denylist and allowlist. Extra hosts
/// (forum domains configured per-source) are passed in by the caller so
/// admin-configured `generic-html` sources aren't limited to the fixed
/// built-in list.
pub fn validate_outbound_host(host: &str, extra_allowed: &[String]) -> Result<(), NetError> {
    if is_denied(host) {
        return Err(NetError::Disallowed(host.to_string()));
    }
    if is_allowed(host) || extra_allowed.iter().any(|a| host.eq_ignore_ascii_case(a) || host.ends_with(&format!(".{a}"))) {
        return Ok(());
    }
    Err(NetError::Disallowed(host.to_string()))
}

pub fn validate_outbound_url(url: &str, extra_allowed: &[String]) -> Result<url::Url, NetError> {
    let parsed = url::Url::parse(url).map_err(|e| NetError::InvalidUrl(e.to_string()))?;
    let host = parsed.host_str().ok_or_else(|| NetError::InvalidUrl(url.to_string()))?;
    validate_outbound_host(host, extra_allowed)?;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denies_loopback_and_metadata_hosts() {
        assert!(validate_outbound_host("localhost", &[]).is_err());
        assert!(validate_outbound_host("127.0.0.1", &[]).is_err());
        assert!(validate_outbound_host("169.254.169.254", &[]).is_err());
        assert!(validate_outbound_host("0.0.0.0", &[]).is_err());
    }

    #[test]
    fn allows_known_hosts_by_suffix() {
        assert!(validate_outbound_host("www.reddit.com", &[]).is_ok());
        assert!(validate_outbound_host("old.reddit.com", &[]).is_ok());
        assert!(validate_outbound_host("reddit.com", &[]).is_ok());
    }

    #[test]
    fn rejects_unknown_hosts_without_extra_allowlist() {
        assert!(validate_outbound_host("evil.example.com", &[]).is_err());
    }

    #[test]
    fn honors_per_source_extra_allowlist() {
        assert!(validate_outbound_host("forum.example.com", &["example.com".to_string()]).is_ok());
    }
}
