use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Live,
    Upcoming,
    Unknown,
}

/// One show discovered on a profile page. Field order here is the wire order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Listing {
    pub id: Option<String>,
    pub title: Option<String>,
    pub url: String,
    pub image: Option<String>,
    pub start_at: Option<String>,
    pub status: Status,
    pub price_hint: Option<f64>,
    pub currency: Option<String>,
}

impl Listing {
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_at.as_deref().and_then(parse_timestamp)
    }
}

/// `live` wins; otherwise a start time in the future means upcoming.
pub fn derive_status(live: bool, start_at: Option<&str>, now: DateTime<Utc>) -> Status {
    if live {
        return Status::Live;
    }
    match start_at.and_then(parse_timestamp) {
        Some(ts) if ts > now => Status::Upcoming,
        _ => Status::Unknown,
    }
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    s.parse::<i64>().ok().and_then(epoch_to_datetime)
}

/// Epoch seconds or milliseconds, guessed by magnitude.
pub fn epoch_to_datetime(n: i64) -> Option<DateTime<Utc>> {
    if n.abs() >= 100_000_000_000 {
        Utc.timestamp_millis_opt(n).single()
    } else {
        Utc.timestamp_opt(n, 0).single()
    }
}

/// Opaque id: the path segment right after `/live/`.
pub fn listing_id(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("/live/")?;
    let segment = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .trim();
    (!segment.is_empty()).then(|| segment.to_string())
}

static PRICE_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([$€£])\s?(\d{1,6}(?:[.,]\d{1,2})?)").unwrap());
static PRICE_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(\d{1,6}(?:[.,]\d{1,2})?)\s?(€|eur\b|usd\b|gbp\b)").unwrap()
});

/// First price-looking amount in a title, as (amount, ISO currency).
pub fn price_hint(title: &str) -> Option<(f64, String)> {
    let (symbol, amount) = if let Some(c) = PRICE_PREFIX.captures(title) {
        (c[1].to_string(), c[2].to_string())
    } else {
        let c = PRICE_SUFFIX.captures(title)?;
        (c[2].to_string(), c[1].to_string())
    };

    let currency = match symbol.to_ascii_uppercase().as_str() {
        "$" | "USD" => "USD",
        "€" | "EUR" => "EUR",
        "£" | "GBP" => "GBP",
        _ => return None,
    };
    let value = amount.replace(',', ".").parse::<f64>().ok()?;
    Some((value, currency.to_string()))
}

/// Stable sort: live, then upcoming, then unknown; inside a status the
/// earliest start first; listings without a start time keep discovery order last.
pub fn rank(listings: &mut [Listing]) {
    listings.sort_by(|a, b| {
        a.status.cmp(&b.status).then_with(|| {
            match (a.start_time(), b.start_time()) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
        })
    });
}
