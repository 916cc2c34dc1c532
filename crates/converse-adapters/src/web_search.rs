//! Web search with automatic engine fallback.
//!
//! Search priority:
//!   1. Brave Search API (if `BRAVE_API_KEY` is set)
//!   2. DuckDuckGo HTML results page (no key needed)
//!
//! [`WebSearchTool`] serves both as the `web_search` tool for research plans
//! and as the [`WebSearch`] collaborator of the retrieval engine.

use std::time::Duration;

use async_trait::async_trait;
use converse_agent::{SearchHit, Tool, ToolError, WebSearch};
use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::html::strip_tags;

// ═══════════════════════════════════════════════════════════════════════
//  Constants
// ═══════════════════════════════════════════════════════════════════════

const TOOL_NAME: &str = "web_search";

const DEFAULT_MAX_RESULTS: usize = 5;

/// Upper bound on what a caller may ask for.
const MAX_RESULTS_CAP: usize = 20;

const DUCKDUCKGO_HTML_URL: &str = "https://html.duckduckgo.com/html/";

const BRAVE_SEARCH_URL: &str = "https://api.search.brave.com/res/v1/web/search";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub(crate) const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

// ═══════════════════════════════════════════════════════════════════════
//  Tool
// ═══════════════════════════════════════════════════════════════════════

/// Brave-then-DuckDuckGo web search.
pub struct WebSearchTool {
    client: reqwest::Client,
    brave_api_key: Option<String>,
    parser: DuckDuckGoParser,
}

impl WebSearchTool {
    /// Build with an explicit Brave key; `None` uses DuckDuckGo only.
    pub fn new(brave_api_key: Option<String>) -> Result<Self, ToolError> {
        let client = reqwest::Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ToolError::Registration {
                tool: TOOL_NAME.into(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            brave_api_key: brave_api_key.filter(|k| !k.trim().is_empty()),
            parser: DuckDuckGoParser::new()?,
        })
    }

    /// Read the Brave key from `BRAVE_API_KEY`.
    pub fn from_env() -> Result<Self, ToolError> {
        Self::new(std::env::var("BRAVE_API_KEY").ok())
    }

    pub fn engine(&self) -> &'static str {
        if self.brave_api_key.is_some() {
            "brave+duckduckgo"
        } else {
            "duckduckgo"
        }
    }

    async fn run(&self, query: &str, count: usize) -> Result<(Vec<SearchHit>, &'static str), ToolError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ToolError::invalid(TOOL_NAME, "query must not be empty"));
        }
        let count = count.clamp(1, MAX_RESULTS_CAP);
        debug!(query, count, "performing web search");

        if let Some(key) = &self.brave_api_key {
            match self.search_brave(query, count, key).await {
                Ok(hits) if !hits.is_empty() => return Ok((hits, "brave")),
                Ok(_) => debug!("brave returned no results, falling back to duckduckgo"),
                Err(e) => warn!(error = %e, "brave search failed, falling back to duckduckgo"),
            }
        }

        let hits = self.search_duckduckgo(query, count).await?;
        Ok((hits, "duckduckgo"))
    }

    // ───────────────────────────────────────────────────────────────────
    //  Brave Search API
    // ───────────────────────────────────────────────────────────────────

    async fn search_brave(&self, query: &str, count: usize, key: &str) -> Result<Vec<SearchHit>, ToolError> {
        let response = self
            .client
            .get(BRAVE_SEARCH_URL)
            .header("X-Subscription-Token", key)
            .header("Accept", "application/json")
            .query(&[("q", query), ("count", &count.to_string())])
            .send()
            .await
            .map_err(|e| ToolError::failed(TOOL_NAME, format!("brave request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ToolError::failed(
                TOOL_NAME,
                format!("brave returned status {}", response.status()),
            ));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ToolError::failed(TOOL_NAME, format!("malformed brave response: {e}")))?;
        Ok(parse_brave_results(&body, count))
    }

    // ───────────────────────────────────────────────────────────────────
    //  DuckDuckGo HTML
    // ───────────────────────────────────────────────────────────────────

    async fn search_duckduckgo(&self, query: &str, count: usize) -> Result<Vec<SearchHit>, ToolError> {
        // The form POST is more reliable than GET for this endpoint.
        let response = self
            .client
            .post(DUCKDUCKGO_HTML_URL)
            .form(&[("q", query), ("kl", "")])
            .send()
            .await
            .map_err(|e| ToolError::failed(TOOL_NAME, format!("duckduckgo request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ToolError::failed(
                TOOL_NAME,
                format!("duckduckgo returned status {}", response.status()),
            ));
        }

        let html = response
            .text()
            .await
            .map_err(|e| ToolError::failed(TOOL_NAME, format!("failed to read duckduckgo response: {e}")))?;
        Ok(self.parser.parse(&html, count))
    }
}

#[async_trait]
impl WebSearch for WebSearchTool {
    async fn search(&self, query: &str, count: usize) -> Result<Vec<SearchHit>, ToolError> {
        let (hits, engine) = self.run(query, count).await?;
        debug!(engine, count = hits.len(), "search completed");
        Ok(hits)
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        TOOL_NAME
    }

    fn description(&self) -> &str {
        "Search the web and return titles, URLs and snippets of the top results."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "The search query"},
                "max_results": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": MAX_RESULTS_CAP,
                    "description": "Maximum number of results (default 5)"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let query = arguments["query"]
            .as_str()
            .ok_or_else(|| ToolError::invalid(TOOL_NAME, "missing `query`"))?;
        let count = arguments["max_results"]
            .as_u64()
            .map_or(DEFAULT_MAX_RESULTS, |n| n as usize);

        let (hits, engine) = self.run(query, count).await?;
        Ok(json!({
            "engine": engine,
            "results": hits,
        }))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Parsing
// ═══════════════════════════════════════════════════════════════════════

fn parse_brave_results(body: &Value, count: usize) -> Vec<SearchHit> {
    let Some(items) = body.pointer("/web/results").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let title = strip_tags(item["title"].as_str().unwrap_or_default());
            let url = item["url"].as_str().unwrap_or_default().to_owned();
            let snippet = strip_tags(item["description"].as_str().unwrap_or_default());
            (!title.is_empty() || !url.is_empty()).then_some(SearchHit { title, url, snippet })
        })
        .take(count)
        .collect()
}

/// Extracts results from the DuckDuckGo HTML page.
struct DuckDuckGoParser {
    anchor: Regex,
    href: Regex,
    snippet: Regex,
}

impl DuckDuckGoParser {
    fn new() -> Result<Self, ToolError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| ToolError::Registration {
                tool: TOOL_NAME.into(),
                reason: format!("invalid result pattern: {e}"),
            })
        };
        Ok(Self {
            anchor: compile(r#"(?s)<a\s([^>]*class="result__a"[^>]*)>(.*?)</a>"#)?,
            href: compile(r#"href="([^"]*)""#)?,
            snippet: compile(r#"(?s)class="result__snippet"[^>]*>(.*?)</(?:a|span|div|td)>"#)?,
        })
    }

    fn parse(&self, html: &str, count: usize) -> Vec<SearchHit> {
        let snippets: Vec<String> = self
            .snippet
            .captures_iter(html)
            .map(|c| strip_tags(&c[1]).trim().to_owned())
            .collect();

        self.anchor
            .captures_iter(html)
            .enumerate()
            .filter_map(|(i, c)| {
                let url = self
                    .href
                    .captures(&c[1])
                    .map(|h| clean_redirect_url(&h[1]))
                    .unwrap_or_default();
                let title = strip_tags(&c[2]).trim().to_owned();
                let snippet = snippets.get(i).cloned().unwrap_or_default();
                (!title.is_empty() || !url.is_empty()).then_some(SearchHit { title, url, snippet })
            })
            .take(count)
            .collect()
    }
}

/// Unwrap DuckDuckGo's `/l/?uddg=` redirect links and add a scheme to
/// protocol-relative URLs.
fn clean_redirect_url(raw: &str) -> String {
    let raw = raw.replace("&amp;", "&");
    if raw.contains("duckduckgo.com/l/")
        && let Some(start) = raw.find("uddg=")
    {
        let encoded = raw[start + 5..].split('&').next().unwrap_or_default();
        return percent_decode(encoded);
    }
    if raw.starts_with("//") {
        return format!("https:{raw}");
    }
    raw
}

/// Decode `%XX` escapes and `+` into UTF-8 text; malformed escapes are kept.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
