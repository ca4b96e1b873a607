//! Tools: web_search and web_fetch — outbound HTTP with a fixed timeout.

use async_trait::async_trait;

use super::{Tool, ToolResult};

/// Fixed timeout for external web calls (seconds).
const WEB_TIMEOUT_SECS: u64 = 30;
/// Maximum characters of page text returned to the LLM.
const MAX_FETCH_CHARS: usize = 20_000;
const MAX_SEARCH_RESULTS: usize = 8;

fn web_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(WEB_TIMEOUT_SECS))
        .user_agent("Mozilla/5.0 (compatible; CountBot/0.3)")
        .build()
        .unwrap_or_default()
}

pub struct WebSearchTool {
    client: reqwest::Client,
}

impl WebSearchTool {
    pub fn new() -> Self {
        Self {
            client: web_client(),
        }
    }
}

impl Default for WebSearchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web and return result titles with URLs."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query."
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, input: serde_json::Value, _session: Option<&str>) -> ToolResult {
        let Some(query) = input.get("query").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: query");
        };

        let url = format!(
            "https://html.duckduckgo.com/html/?q={}",
            urlencode(query)
        );
        let resp = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => return ToolResult::error(format!("search request failed: {e}")),
        };
        let body = match resp.text().await {
            Ok(b) => b,
            Err(e) => return ToolResult::error(format!("failed to read search response: {e}")),
        };

        let results = parse_search_results(&body, MAX_SEARCH_RESULTS);
        if results.is_empty() {
            ToolResult::success(format!("No results found for: {query}"))
        } else {
            ToolResult::success(results.join("\n"))
        }
    }
}

pub struct WebFetchTool {
    client: reqwest::Client,
}

impl WebFetchTool {
    pub fn new() -> Self {
        Self {
            client: web_client(),
        }
    }
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL and return its text content (HTML tags stripped)."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "Absolute http(s) URL to fetch."
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, input: serde_json::Value, _session: Option<&str>) -> ToolResult {
        let Some(url) = input.get("url").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: url");
        };
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return ToolResult::error("url must start with http:// or https://");
        }

        let resp = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => return ToolResult::error(format!("fetch failed: {e}")),
        };
        let status = resp.status();
        if !status.is_success() {
            return ToolResult::error(format!("fetch failed: HTTP {status}"));
        }
        let body = match resp.text().await {
            Ok(b) => b,
            Err(e) => return ToolResult::error(format!("failed to read response: {e}")),
        };

        let text = strip_html(&body);
        if text.chars().count() > MAX_FETCH_CHARS {
            let clipped: String = text.chars().take(MAX_FETCH_CHARS).collect();
            ToolResult::success(format!(
                "{clipped}\n\n[content truncated at {MAX_FETCH_CHARS} characters]"
            ))
        } else {
            ToolResult::success(text)
        }
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(*byte as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Pull `result__a` anchors out of the DuckDuckGo HTML page.
fn parse_search_results(html: &str, max: usize) -> Vec<String> {
    let mut results = Vec::new();
    for segment in html.split("result__a").skip(1) {
        if results.len() >= max {
            break;
        }
        let Some(href_start) = segment.find("href=\"") else {
            continue;
        };
        let after_href = &segment[href_start + 6..];
        let Some(href_end) = after_href.find('"') else {
            continue;
        };
        let href = &after_href[..href_end];

        let Some(text_start) = after_href.find('>') else {
            continue;
        };
        let after_text = &after_href[text_start + 1..];
        let Some(text_end) = after_text.find("</a>") else {
            continue;
        };
        let title = strip_html(&after_text[..text_end]);
        if !title.trim().is_empty() {
            results.push(format!("{}. {} — {}", results.len() + 1, title.trim(), href));
        }
    }
    results
}

/// Crude tag stripper: drops script/style blocks, removes tags, collapses
/// blank runs. Good enough for LLM consumption.
fn strip_html(html: &str) -> String {
    // Remove script and style blocks first.
    let mut buf = String::with_capacity(html.len());
    let mut rest = html;
    while let Some((start, end_marker)) = find_block_start(rest) {
        buf.push_str(&rest[..start]);
        match rest[start..].find(end_marker) {
            Some(end_rel) => rest = &rest[start + end_rel + end_marker.len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    buf.push_str(rest);

    let mut cleaned = String::with_capacity(buf.len());
    let mut in_tag = false;
    for c in buf.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                cleaned.push(' ');
            }
            c if !in_tag => cleaned.push(c),
            _ => {}
        }
    }

    cleaned
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&nbsp;", " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn find_block_start(html: &str) -> Option<(usize, &'static str)> {
    let script = html.find("<script").map(|i| (i, "</script>"));
    let style = html.find("<style").map(|i| (i, "</style>"));
    match (script, style) {
        (Some(s), Some(t)) => Some(if s.0 < t.0 { s } else { t }),
        (Some(s), None) => Some(s),
        (None, Some(t)) => Some(t),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencode_escapes_reserved_characters() {
        assert_eq!(urlencode("rust async"), "rust+async");
        assert_eq!(urlencode("a&b=c"), "a%26b%3Dc");
        assert_eq!(urlencode("天气"), "%E5%A4%A9%E6%B0%94");
    }

    #[test]
    fn strip_html_removes_tags_and_scripts() {
        let html = "<html><script>evil()</script><body><p>Hello <b>world</b></p></body></html>";
        let text = strip_html(html);
        assert!(text.contains("Hello world"));
        assert!(!text.contains("evil"));
        assert!(!text.contains('<'));
    }

    #[test]
    fn strip_html_decodes_entities() {
        assert_eq!(strip_html("a &amp; b"), "a & b");
    }

    #[test]
    fn parse_search_results_extracts_anchors() {
        let html = r#"
            <a class="result__a" href="https://example.com/1">First Result</a>
            <a class="result__a" href="https://example.com/2">Second <b>Result</b></a>
        "#;
        let results = parse_search_results(html, 8);
        assert_eq!(results.len(), 2);
        assert!(results[0].contains("First Result"));
        assert!(results[0].contains("https://example.com/1"));
        assert!(results[1].contains("Second Result"));
    }

    #[test]
    fn parse_search_results_respects_max() {
        let html = r#"
            <a class="result__a" href="u1">A</a>
            <a class="result__a" href="u2">B</a>
            <a class="result__a" href="u3">C</a>
        "#;
        assert_eq!(parse_search_results(html, 2).len(), 2);
    }
}
