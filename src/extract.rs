use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;
use std::collections::HashSet;

use crate::config::PipelineConfig;
use crate::listing::{epoch_to_datetime, listing_id};

// ============================================================================
// Field keys, in order of preference
// ============================================================================

pub const URL_KEYS: &[&str] = &["url", "href", "permalink", "path", "slug"];
pub const TITLE_KEYS: &[&str] = &["title", "name"];
pub const IMAGE_KEYS: &[&str] = &[
    "image",
    "img",
    "coverImage",
    "cover_image_url",
    "thumbnail",
    "cover",
    "thumbnailUrl",
];
pub const START_KEYS: &[&str] = &[
    "startAt",
    "start_at",
    "startsAt",
    "scheduled_start_time",
    "startTime",
    "start_time",
];
pub const LIVE_KEYS: &[&str] = &["isLive", "is_live", "live"];

/// A listing-shaped object pulled out of a page, before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Candidate {
    pub url: String,
    pub title: Option<String>,
    pub image: Option<String>,
    pub start_at: Option<String>,
    pub live: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    StructuredData,
    HtmlPattern,
    Nothing,
}

/// First non-empty string among `keys`.
pub fn pick_str<'a>(obj: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
}

/// Start time as RFC 3339: strings pass through, numbers are read as epochs.
pub fn pick_start(obj: &Value) -> Option<String> {
    START_KEYS.iter().find_map(|k| match obj.get(*k)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => n
            .as_i64()
            .and_then(epoch_to_datetime)
            .map(|dt| dt.to_rfc3339()),
        _ => None,
    })
}

pub fn pick_live(obj: &Value) -> Option<bool> {
    LIVE_KEYS
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_bool))
        .or_else(|| {
            obj.get("status")
                .and_then(Value::as_str)
                .map(|s| s.eq_ignore_ascii_case("live"))
        })
}

/// Absolute URL for a raw link found in page data.
pub fn resolve_url(raw: &str, base_url: &str) -> String {
    let raw = raw.trim();
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return raw.to_string();
    }
    if let Some(rest) = raw.strip_prefix("//") {
        let scheme = base_url.split("://").next().unwrap_or("https");
        return format!("{}://{}", scheme, rest);
    }
    let sep = if raw.starts_with('/') { "" } else { "/" };
    format!("{}{}{}", base_url, sep, raw)
}

/// `http(s)://<site host>/live/<segment>`.
pub fn is_detail_url(url: &str, cfg: &PipelineConfig) -> bool {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return false;
    };
    matches!(parsed.scheme(), "http" | "https")
        && parsed.host_str() == cfg.site_host().as_deref()
        && parsed.path().starts_with("/live/")
        && listing_id(url).is_some()
}

// ============================================================================
// Embedded JSON payload
// ============================================================================

static NEXT_DATA: Lazy<Selector> = Lazy::new(|| Selector::parse("script#__NEXT_DATA__").unwrap());

/// Parsed `__NEXT_DATA__` payload, or `None` when absent or malformed.
pub fn find_next_data(html: &str) -> Option<Value> {
    let document = Html::parse_document(html);
    let script = document.select(&NEXT_DATA).next()?;
    let json_text = script.text().collect::<String>();
    match serde_json::from_str(&json_text) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!(error = %e, "malformed __NEXT_DATA__ payload");
            None
        }
    }
}

/// Pre-order walk over every value reachable from `root`, visiting at most
/// `max_nodes` values. Returns how many were visited.
pub fn walk_values<'a, F>(root: &'a Value, max_nodes: usize, mut visit: F) -> usize
where
    F: FnMut(&'a Value),
{
    let mut stack = vec![root];
    let mut visited = 0usize;

    while let Some(value) = stack.pop() {
        if visited >= max_nodes {
            tracing::warn!(max_nodes, "json walk hit node cap, stopping early");
            break;
        }
        visited += 1;
        visit(value);

        match value {
            Value::Array(items) => stack.extend(items.iter().rev()),
            Value::Object(map) => {
                let children: Vec<&Value> = map.values().collect();
                stack.extend(children.into_iter().rev());
            }
            _ => {}
        }
    }
    visited
}

fn candidate_from_object(obj: &Value, cfg: &PipelineConfig) -> Option<Candidate> {
    let raw = pick_str(obj, URL_KEYS)?;
    let url = resolve_url(raw, &cfg.base_url);
    if !is_detail_url(&url, cfg) {
        return None;
    }

    Some(Candidate {
        url,
        title: pick_str(obj, TITLE_KEYS).map(str::to_string),
        image: pick_str(obj, IMAGE_KEYS).map(|s| resolve_url(s, &cfg.base_url)),
        start_at: pick_start(obj),
        live: pick_live(obj).unwrap_or(false),
    })
}

/// Listing candidates from the page's embedded JSON payload: every element of
/// every array in the tree is checked, first occurrence of a URL wins.
pub fn extract_structured(html: &str, cfg: &PipelineConfig) -> Vec<Candidate> {
    let Some(data) = find_next_data(html) else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    walk_values(&data, cfg.max_walk_nodes, |value| {
        let Value::Array(items) = value else {
            return;
        };
        for item in items.iter().filter(|v| v.is_object()) {
            if let Some(c) = candidate_from_object(item, cfg) {
                if seen.insert(c.url.clone()) {
                    out.push(c);
                }
            }
        }
    });

    tracing::debug!(found = out.len(), "structured extraction");
    out
}

// ============================================================================
// Anchor markup fallback
// ============================================================================

static ANCHOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<a\b([^>]*)>(.*?)</a\s*>").unwrap());
static IMG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<img\b([^>]*)>").unwrap());
static ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)([a-zA-Z_:][-a-zA-Z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
        .unwrap()
});
static TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

fn attr(attrs: &str, name: &str) -> Option<String> {
    ATTR.captures_iter(attrs)
        .find(|c| c[1].eq_ignore_ascii_case(name))
        .and_then(|c| c.get(2).or_else(|| c.get(3)).or_else(|| c.get(4)))
        .map(|m| clean_text(m.as_str()))
        .filter(|s| !s.is_empty())
}

/// Decode entities and collapse whitespace.
pub fn clean_text(s: &str) -> String {
    let decoded = html_escape::decode_html_entities(s);
    WS.replace_all(&decoded, " ").trim().to_string()
}

fn strip_tags(s: &str) -> String {
    clean_text(&TAGS.replace_all(s, " "))
}

fn join_href(href: &str, cfg: &PipelineConfig) -> Option<String> {
    let base = reqwest::Url::parse(&cfg.base_url).ok()?;
    base.join(href).ok().map(|u| u.to_string())
}

fn image_from(inner: &str, cfg: &PipelineConfig) -> (Option<String>, Option<String>) {
    let Some(img) = IMG.captures(inner) else {
        return (None, None);
    };
    let attrs = &img[1];
    let alt = attr(attrs, "alt");
    let src = attr(attrs, "src")
        .or_else(|| attr(attrs, "data-src"))
        .or_else(|| {
            attr(attrs, "srcset").and_then(|set| {
                set.split(',')
                    .next()
                    .and_then(|first| first.split_whitespace().next())
                    .map(str::to_string)
            })
        })
        .and_then(|s| join_href(&s, cfg));
    (src, alt)
}

/// Fallback when the embedded payload yields nothing: scan `<a>` markup for
/// links to detail pages. Deduplicated in discovery order, capped.
pub fn extract_anchors(html: &str, cfg: &PipelineConfig) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for cap in ANCHOR.captures_iter(html) {
        if out.len() >= cfg.max_pattern_listings {
            break;
        }
        let attrs = &cap[1];
        let inner = &cap[2];

        let Some(href) = attr(attrs, "href") else {
            continue;
        };
        if !href.contains("/live/") {
            continue;
        }
        let Some(url) = join_href(&href, cfg) else {
            continue;
        };
        if !is_detail_url(&url, cfg) || !seen.insert(url.clone()) {
            continue;
        }

        let (image, alt) = image_from(inner, cfg);
        let title = attr(attrs, "aria-label")
            .or(alt)
            .or_else(|| Some(strip_tags(inner)).filter(|t| !t.is_empty()))
            .unwrap_or_else(|| cfg.placeholder_title.clone());

        out.push(Candidate {
            url,
            title: Some(title),
            image,
            start_at: None,
            live: false,
        });
    }

    tracing::debug!(found = out.len(), "anchor extraction");
    out
}

/// Structured payload first; anchors only if it produced nothing.
pub fn discover(html: &str, cfg: &PipelineConfig) -> (Vec<Candidate>, Strategy) {
    let structured = extract_structured(html, cfg);
    if !structured.is_empty() {
        return (structured, Strategy::StructuredData);
    }
    let anchors = extract_anchors(html, cfg);
    if !anchors.is_empty() {
        return (anchors, Strategy::HtmlPattern);
    }
    (Vec::new(), Strategy::Nothing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cfg() -> PipelineConfig {
        PipelineConfig::default()
    }

    fn page_with_payload(payload: &Value) -> String {
        format!(
            r#"<html><head></head><body><div id="root"></div><script id="__NEXT_DATA__" type="application/json">{}</script></body></html>"#,
            payload
        )
    }

    #[test]
    fn structured_finds_nested_listings_and_resolves_paths() {
        let payload = json!({
            "props": { "pageProps": { "user": { "shows": [
                { "slug": "live/first", "title": "First", "coverImage": "/img/1.jpg", "startAt": "2030-01-01T10:00:00Z" },
                { "href": "https://www.whatnot.com/live/second", "name": "Second", "isLive": true },
                { "url": "/user/someone", "title": "Not a show" }
            ]}}}
        });
        let found = extract_structured(&page_with_payload(&payload), &cfg());

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].url, "https://www.whatnot.com/live/first");
        assert_eq!(found[0].title.as_deref(), Some("First"));
        assert_eq!(found[0].image.as_deref(), Some("https://www.whatnot.com/img/1.jpg"));
        assert_eq!(found[0].start_at.as_deref(), Some("2030-01-01T10:00:00Z"));
        assert!(!found[0].live);
        assert_eq!(found[1].url, "https://www.whatnot.com/live/second");
        assert!(found[1].live);
    }

    #[test]
    fn structured_keeps_first_of_duplicate_urls() {
        let payload = json!({
            "a": [ { "url": "/live/dup", "title": "first seen" } ],
            "b": { "c": [ { "permalink": "https://www.whatnot.com/live/dup", "title": "second seen" } ] }
        });
        let found = extract_structured(&page_with_payload(&payload), &cfg());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].title.as_deref(), Some("first seen"));
    }

    #[test]
    fn structured_tries_keys_in_order() {
        let payload = json!({ "list": [ {
            "url": "",
            "href": "/live/by-href",
            "path": "/live/by-path",
            "title": "",
            "name": "Fallback name",
            "startAt": 1_900_000_000
        } ] });
        let found = extract_structured(&page_with_payload(&payload), &cfg());
        assert_eq!(found[0].url, "https://www.whatnot.com/live/by-href");
        assert_eq!(found[0].title.as_deref(), Some("Fallback name"));
        assert_eq!(found[0].start_at.as_deref(), Some("2030-03-17T17:46:40+00:00"));
    }

    #[test]
    fn detail_urls_match_on_host_and_path() {
        let cfg = cfg();
        assert!(is_detail_url("https://www.whatnot.com/live/abc", &cfg));
        assert!(is_detail_url("http://www.whatnot.com/live/abc?ref=1", &cfg));
        assert!(is_detail_url("https://WWW.WHATNOT.COM/live/abc", &cfg));
        assert!(!is_detail_url("https://evil.example/live/abc", &cfg));
        assert!(!is_detail_url("https://www.whatnot.com/user/live/abc", &cfg));
        assert!(!is_detail_url("https://www.whatnot.com/live/", &cfg));
        assert!(!is_detail_url("ftp://www.whatnot.com/live/abc", &cfg));
    }

    #[test]
    fn structured_keeps_plain_http_links() {
        let payload = json!({ "shows": [ { "url": "http://www.whatnot.com/live/plain", "title": "Plain" } ] });
        let found = extract_structured(&page_with_payload(&payload), &cfg());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].url, "http://www.whatnot.com/live/plain");
    }

    #[test]
    fn malformed_or_missing_payload_yields_nothing() {
        let broken = r#"<script id="__NEXT_DATA__">{"props": [</script>"#;
        assert!(find_next_data(broken).is_none());
        assert!(extract_structured(broken, &cfg()).is_empty());
        assert!(extract_structured("<html><body>hi</body></html>", &cfg()).is_empty());
    }

    #[test]
    fn walk_stops_at_node_cap() {
        let deep = json!([[[[[[[[[[1]]]]]]]]]]);
        let visited = walk_values(&deep, 4, |_| {});
        assert_eq!(visited, 4);
    }

    #[test]
    fn anchors_without_labels_get_placeholder_titles() {
        let html = r#"
            <div><a href="/live/one"><span></span></a></div>
            <div><a class="card" href="https://www.whatnot.com/live/two?x=1"></a></div>
            <a href="/user/elsewhere">profile</a>
        "#;
        let found = extract_anchors(html, &cfg());
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].url, "https://www.whatnot.com/live/one");
        assert_eq!(found[1].url, "https://www.whatnot.com/live/two?x=1");
        assert!(found
            .iter()
            .all(|c| c.title.as_deref() == Some("Whatnot Show")));
    }

    #[test]
    fn anchor_title_prefers_aria_then_alt_then_text() {
        let html = r#"
            <a aria-label="Aria title" href="/live/a"><img alt="Alt a" src="/a.jpg">Text a</a>
            <a href="/live/b"><img alt="Alt &amp; b" data-src="https://cdn.example/b.jpg">Text b</a>
            <a href="/live/c"><img srcset="/c-1x.jpg 1x, /c-2x.jpg 2x"> <b>Text</b>   c </a>
        "#;
        let found = extract_anchors(html, &cfg());
        assert_eq!(found[0].title.as_deref(), Some("Aria title"));
        assert_eq!(found[0].image.as_deref(), Some("https://www.whatnot.com/a.jpg"));
        assert_eq!(found[1].title.as_deref(), Some("Alt & b"));
        assert_eq!(found[1].image.as_deref(), Some("https://cdn.example/b.jpg"));
        assert_eq!(found[2].title.as_deref(), Some("Text c"));
        assert_eq!(found[2].image.as_deref(), Some("https://www.whatnot.com/c-1x.jpg"));
    }

    #[test]
    fn anchors_are_deduplicated_and_capped() {
        let mut html = String::from(r#"<a href="/live/0">zero</a>"#);
        for i in 0..20 {
            html.push_str(&format!(r#"<a href="/live/{}">show {}</a>"#, i, i));
        }
        let found = extract_anchors(&html, &cfg());
        assert_eq!(found.len(), 12);
        assert_eq!(found[0].title.as_deref(), Some("zero"));
        assert_eq!(found[1].url, "https://www.whatnot.com/live/1");
    }

    #[test]
    fn discover_falls_back_only_when_payload_is_empty() {
        let payload = json!({ "shows": [ { "url": "/live/from-json" } ] });
        let html = format!(
            r#"{}<a href="/live/from-anchor">x</a>"#,
            page_with_payload(&payload)
        );
        let (found, strategy) = discover(&html, &cfg());
        assert_eq!(strategy, Strategy::StructuredData);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].url, "https://www.whatnot.com/live/from-json");

        let (found, strategy) = discover(r#"<a href="/live/only">x</a>"#, &cfg());
        assert_eq!(strategy, Strategy::HtmlPattern);
        assert_eq!(found.len(), 1);

        let (found, strategy) = discover("<p>nothing</p>", &cfg());
        assert_eq!(strategy, Strategy::Nothing);
        assert!(found.is_empty());
    }
}
