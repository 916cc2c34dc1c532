//! `browser.scrape_url`: fetch a page and return its readable text.
//!
//! Requests to private, loopback and link-local addresses are refused.
//! Results are cached in memory for a few minutes so a plan that scrapes
//! the same page twice pays once.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use converse_agent::{Tool, ToolError};
use moka::future::Cache;
use reqwest::Url;
use serde_json::{Value, json};
use tracing::debug;

use crate::html::{page_text, truncate_readable};
use crate::web_search::BROWSER_USER_AGENT;

const TOOL_NAME: &str = "browser.scrape_url";

const DEFAULT_MAX_CHARS: usize = 8_000;
const MAX_CHARS_CAP: usize = 50_000;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

const CACHE_TTL: Duration = Duration::from_secs(10 * 60);
const CACHE_MAX_ENTRIES: u64 = 100;

/// Page scraper with an SSRF guard and a short-lived cache.
pub struct ScrapeUrlTool {
    client: reqwest::Client,
    cache: Cache<String, (String, String)>,
}

impl ScrapeUrlTool {
    pub fn new() -> Result<Self, ToolError> {
        let client = reqwest::Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| ToolError::Registration {
                tool: TOOL_NAME.into(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        let cache = Cache::builder()
            .max_capacity(CACHE_MAX_ENTRIES)
            .time_to_live(CACHE_TTL)
            .build();
        Ok(Self { client, cache })
    }

    /// Fetch `url` and return `(content_type, text)`.
    async fn fetch(&self, url: &Url) -> Result<(String, String), ToolError> {
        if let Some(hit) = self.cache.get(url.as_str()).await {
            debug!(url = %url, "scrape cache hit");
            return Ok(hit);
        }

        let response = self
            .client
            .get(url.clone())
            .header("Accept", "text/html, application/xhtml+xml;q=0.9, */*;q=0.5")
            .send()
            .await
            .map_err(|e| ToolError::failed(TOOL_NAME, format!("request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::failed(TOOL_NAME, format!("server returned status {status}")));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/plain")
            .to_owned();
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::failed(TOOL_NAME, format!("failed to read body: {e}")))?;

        let text = if content_type.contains("html") {
            page_text(&body)
        } else {
            body
        };
        let entry = (content_type, text);
        self.cache.insert(url.to_string(), entry.clone()).await;
        Ok(entry)
    }
}

#[async_trait]
impl Tool for ScrapeUrlTool {
    fn name(&self) -> &str {
        TOOL_NAME
    }

    fn description(&self) -> &str {
        "Fetch a web page and return its readable text content."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "Absolute http(s) URL"},
                "max_chars": {
                    "type": "integer",
                    "minimum": 100,
                    "maximum": MAX_CHARS_CAP,
                    "description": "Maximum characters of text to return (default 8000)"
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let raw = arguments["url"]
            .as_str()
            .ok_or_else(|| ToolError::invalid(TOOL_NAME, "missing `url`"))?;
        let max_chars = arguments["max_chars"]
            .as_u64()
            .map_or(DEFAULT_MAX_CHARS, |n| (n as usize).min(MAX_CHARS_CAP));

        let url = Url::parse(raw.trim())
            .map_err(|e| ToolError::invalid(TOOL_NAME, format!("invalid URL `{raw}`: {e}")))?;
        check_public(&url).await?;

        let (content_type, text) = self.fetch(&url).await?;
        let total_chars = text.chars().count();
        let (content, truncated) = truncate_readable(&text, max_chars);
        debug!(url = %url, total_chars, truncated, "page scraped");

        Ok(json!({
            "url": url.as_str(),
            "content_type": content_type,
            "content": content,
            "total_chars": total_chars,
            "truncated": truncated,
        }))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  SSRF guard
// ═══════════════════════════════════════════════════════════════════════

/// Refuse non-http schemes and hosts that resolve to internal addresses.
async fn check_public(url: &Url) -> Result<(), ToolError> {
    let denied = |reason: String| Err(ToolError::denied(TOOL_NAME, reason));

    if !matches!(url.scheme(), "http" | "https") {
        return denied(format!("unsupported scheme `{}`", url.scheme()));
    }
    let Some(host) = url.host_str() else {
        return denied("URL has no host".into());
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.eq_ignore_ascii_case("localhost") {
        return denied("localhost is not reachable from tools".into());
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_internal(ip) {
            return denied(format!("{ip} is an internal address"));
        }
        return Ok(());
    }

    let port = url.port_or_known_default().unwrap_or(443);
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ToolError::failed(TOOL_NAME, format!("cannot resolve `{host}`: {e}")))?;
    for addr in addrs {
        if is_internal(addr.ip()) {
            return denied(format!("{host} resolves to internal address {}", addr.ip()));
        }
    }
    Ok(())
}

fn is_internal(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // 100.64.0.0/10, carrier-grade NAT
                || (a == 100 && (b & 0xC0) == 64)
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link local
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
                || v6.to_ipv4_mapped().is_some_and(|v4| is_internal(IpAddr::V4(v4)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_addresses_are_detected() {
        for ip in ["127.0.0.1", "10.1.2.3", "192.168.0.10", "169.254.1.1", "100.64.0.1", "::1", "fd00::1", "::ffff:10.0.0.1"] {
            assert!(is_internal(ip.parse().unwrap()), "{ip}");
        }
        for ip in ["1.1.1.1", "93.184.216.34", "2606:4700::1111"] {
            assert!(!is_internal(ip.parse().unwrap()), "{ip}");
        }
    }

    #[tokio::test]
    async fn private_targets_are_refused() {
        let tool = ScrapeUrlTool::new().unwrap();
        for url in ["http://127.0.0.1:8080/admin", "http://localhost/", "file:///etc/passwd", "http://[::1]/"] {
            let err = tool.execute(json!({"url": url})).await.unwrap_err();
            assert!(matches!(err, ToolError::Denied { .. }), "{url}: {err}");
        }
    }

    #[tokio::test]
    async fn malformed_url_is_invalid() {
        let tool = ScrapeUrlTool::new().unwrap();
        let err = tool.execute(json!({"url": "not a url"})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }
}
