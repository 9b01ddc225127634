use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use serde_json::Value;

use crate::budget::Deadline;
use crate::config::PipelineConfig;
use crate::crawler::{FetchError, HtmlSource};
use crate::extract::{
    find_next_data, is_detail_url, pick_live, pick_start, pick_str, resolve_url, walk_values,
    IMAGE_KEYS, LIVE_KEYS, TITLE_KEYS, URL_KEYS,
};
use crate::listing::{derive_status, price_hint, Listing, Status};

static LD_JSON: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"script[type="application/ld+json"]"#).unwrap());
static META_TITLE: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(
        r#"meta[property="og:title"], meta[name="og:title"], meta[name="twitter:title"], meta[property="twitter:title"]"#,
    )
    .unwrap()
});
static META_IMAGE: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(
        r#"meta[property="og:image"], meta[name="og:image"], meta[name="twitter:image"], meta[property="twitter:image"]"#,
    )
    .unwrap()
});

/// Whatever a detail page told us. Stages only ever fill holes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetailFields {
    pub title: Option<String>,
    pub image: Option<String>,
    pub start_at: Option<String>,
    pub live: Option<bool>,
}

impl DetailFields {
    pub fn fill(&mut self, other: DetailFields) {
        self.title = self.title.take().or(other.title);
        self.image = self.image.take().or(other.image);
        self.start_at = self.start_at.take().or(other.start_at);
        self.live = self.live.or(other.live);
    }

    fn signals(&self) -> usize {
        [
            self.title.is_some(),
            self.image.is_some(),
            self.start_at.is_some(),
            self.live.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count()
    }

    fn is_complete(&self) -> bool {
        self.signals() == 4
    }
}

fn fields_of(obj: &Value, cfg: &PipelineConfig) -> DetailFields {
    DetailFields {
        title: pick_str(obj, TITLE_KEYS).map(str::to_string),
        image: pick_str(obj, IMAGE_KEYS).map(|s| resolve_url(s, &cfg.base_url)),
        start_at: pick_start(obj),
        live: pick_live(obj),
    }
}

fn references_listing(obj: &Value, listing: &Listing, cfg: &PipelineConfig) -> bool {
    if let (Some(id), Some(obj_id)) = (listing.id.as_deref(), obj.get("id").and_then(Value::as_str)) {
        if id == obj_id {
            return true;
        }
    }
    URL_KEYS
        .iter()
        .filter_map(|k| obj.get(*k).and_then(Value::as_str))
        .any(|raw| resolve_url(raw, &cfg.base_url) == listing.url)
}

/// Show-shaped: has a start time, a live flag, or links to some detail page.
/// Sellers and viewers carry a name and an avatar but none of these.
fn looks_like_listing(obj: &Value, found: &DetailFields, cfg: &PipelineConfig) -> bool {
    found.start_at.is_some()
        || found.live == Some(true)
        || LIVE_KEYS
            .iter()
            .any(|k| obj.get(*k).is_some_and(Value::is_boolean))
        || URL_KEYS
            .iter()
            .filter_map(|k| obj.get(*k).and_then(Value::as_str))
            .any(|raw| is_detail_url(&resolve_url(raw, &cfg.base_url), cfg))
}

/// Stage 1: the embedded JSON payload. Objects that point back at this
/// listing win; otherwise the first show-shaped objects carrying at least
/// two signals.
pub fn from_next_data(html: &str, listing: &Listing, cfg: &PipelineConfig) -> DetailFields {
    let Some(data) = find_next_data(html) else {
        return DetailFields::default();
    };

    let mut matched = DetailFields::default();
    let mut loose = DetailFields::default();
    walk_values(&data, cfg.max_walk_nodes, |value| {
        if !value.is_object() {
            return;
        }
        let found = fields_of(value, cfg);
        if found.signals() == 0 {
            return;
        }
        if references_listing(value, listing, cfg) {
            matched.fill(found);
        } else if found.signals() >= 2
            && !loose.is_complete()
            && looks_like_listing(value, &found, cfg)
        {
            loose.fill(found);
        }
    });

    matched.fill(loose);
    matched
}

fn is_event_like(obj: &Value) -> bool {
    match obj.get("@type") {
        Some(Value::String(t)) => t.ends_with("Event"),
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .any(|t| t.ends_with("Event")),
        _ => false,
    }
}

fn ld_image(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Array(items) => items.iter().find_map(ld_image),
        Value::Object(_) => v.get("url").and_then(ld_image),
        _ => None,
    }
}

fn ld_live(obj: &Value) -> Option<bool> {
    obj.get("isLiveBroadcast")
        .and_then(Value::as_bool)
        .or_else(|| {
            obj.get("publication")
                .and_then(|p| match p {
                    Value::Array(items) => items.first(),
                    other => Some(other),
                })
                .and_then(|p| p.get("isLiveBroadcast"))
                .and_then(Value::as_bool)
        })
}

fn ld_nodes(v: &Value) -> Vec<&Value> {
    match v {
        Value::Array(items) => items.iter().flat_map(ld_nodes).collect(),
        Value::Object(map) => {
            let mut out = vec![v];
            if let Some(graph) = map.get("@graph") {
                out.extend(ld_nodes(graph));
            }
            out
        }
        _ => Vec::new(),
    }
}

/// Stage 2: the first event-like JSON-LD block.
pub fn from_linked_data(document: &Html, cfg: &PipelineConfig) -> DetailFields {
    for script in document.select(&LD_JSON) {
        let json_text = script.text().collect::<String>();
        let Ok(data) = serde_json::from_str::<Value>(&json_text) else {
            continue;
        };
        if let Some(event) = ld_nodes(&data).into_iter().find(|n| is_event_like(n)) {
            return DetailFields {
                title: pick_str(event, &["name"]).map(str::to_string),
                image: event
                    .get("image")
                    .and_then(ld_image)
                    .map(|s| resolve_url(&s, &cfg.base_url)),
                start_at: pick_str(event, &["startDate"]).map(str::to_string),
                live: ld_live(event),
            };
        }
    }
    DetailFields::default()
}

fn meta_content(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .filter_map(|el| el.value().attr("content"))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Stage 3: social preview tags.
pub fn from_meta(document: &Html, cfg: &PipelineConfig) -> DetailFields {
    DetailFields {
        title: meta_content(document, &META_TITLE),
        image: meta_content(document, &META_IMAGE).map(|s| resolve_url(&s, &cfg.base_url)),
        start_at: None,
        live: None,
    }
}

/// Run all three stages over one detail page, first value per field wins.
pub fn extract_details(html: &str, listing: &Listing, cfg: &PipelineConfig) -> DetailFields {
    let mut fields = from_next_data(html, listing, cfg);
    if fields.is_complete() {
        return fields;
    }

    let document = Html::parse_document(html);
    fields.fill(from_linked_data(&document, cfg));
    if fields.title.is_none() || fields.image.is_none() {
        fields.fill(from_meta(&document, cfg));
    }
    fields
}

/// Build the enriched copy. Values already on the listing stay put; the
/// placeholder title counts as missing.
pub fn apply(listing: &Listing, fields: DetailFields, cfg: &PipelineConfig, now: DateTime<Utc>) -> Listing {
    let title = listing
        .title
        .clone()
        .filter(|t| *t != cfg.placeholder_title)
        .or(fields.title)
        .or_else(|| listing.title.clone());
    let image = listing.image.clone().or(fields.image);
    let start_at = listing.start_at.clone().or(fields.start_at);

    let live = listing.status == Status::Live || fields.live.unwrap_or(false);
    let status = derive_status(live, start_at.as_deref(), now);

    let (price_hint, currency) = match (listing.price_hint, &listing.currency) {
        (Some(p), Some(c)) => (Some(p), Some(c.clone())),
        _ => match title.as_deref().and_then(price_hint) {
            Some((p, c)) => (Some(p), Some(c)),
            None => (None, None),
        },
    };

    Listing {
        id: listing.id.clone(),
        title,
        url: listing.url.clone(),
        image,
        start_at,
        status,
        price_hint,
        currency,
    }
}

async fn fetch_detail(
    source: &dyn HtmlSource,
    listing: &Listing,
    deadline: &Deadline,
    cfg: &PipelineConfig,
) -> Result<String, FetchError> {
    let timeout = deadline.clamp(cfg.detail_timeout);
    let page = deadline
        .run(source.fetch(&listing.url, timeout))
        .await
        .map_err(|_| FetchError::DeadlineExceeded)??;
    if !page.is_success() {
        return Err(FetchError::Status(page.status));
    }
    Ok(page.body)
}

/// Fetch one detail page and fill in what the listing is missing. Any fetch
/// failure hands back the listing exactly as it came in.
pub async fn enrich(
    source: &dyn HtmlSource,
    listing: &Listing,
    deadline: &Deadline,
    cfg: &PipelineConfig,
) -> Listing {
    match fetch_detail(source, listing, deadline, cfg).await {
        Ok(html) => {
            let fields = extract_details(&html, listing, cfg);
            tracing::debug!(url = %listing.url, ?fields, "detail fields");
            apply(listing, fields, cfg, Utc::now())
        }
        Err(e) => {
            tracing::warn!(url = %listing.url, error = %e, "detail fetch failed, keeping listing as is");
            listing.clone()
        }
    }
}
