use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::extract::{clean_text, Candidate};
use crate::listing::{derive_status, listing_id, price_hint, Listing};

/// Turn extractor candidates into canonical listings: first occurrence of a
/// URL wins, discovery order is kept, and the result is cut at `limit`.
pub fn normalize(candidates: &[Candidate], limit: usize, now: DateTime<Utc>) -> Vec<Listing> {
    let mut seen = HashSet::new();
    candidates
        .iter()
        .filter(|c| seen.insert(c.url.as_str()))
        .take(limit)
        .map(|c| to_listing(c, now))
        .collect()
}

fn to_listing(c: &Candidate, now: DateTime<Utc>) -> Listing {
    let title = c
        .title
        .as_deref()
        .map(clean_text)
        .filter(|t| !t.is_empty());
    let (price_hint, currency) = match title.as_deref().and_then(price_hint) {
        Some((p, cur)) => (Some(p), Some(cur)),
        None => (None, None),
    };

    Listing {
        id: listing_id(&c.url),
        title,
        url: c.url.clone(),
        image: c.image.clone(),
        start_at: c.start_at.clone(),
        status: derive_status(c.live, c.start_at.as_deref(), now),
        price_hint,
        currency,
    }
}

/// Positive integer or the default. Zero, negatives and junk all fall back.
pub fn parse_positive(raw: Option<&str>, default: usize) -> usize {
    raw.and_then(|s| s.trim().parse::<i64>().ok())
        .filter(|n| *n > 0)
        .map(|n| usize::try_from(n).unwrap_or(default))
        .unwrap_or(default)
}

/// Boolean-ish query flag; only explicit "off" spellings turn it off.
pub fn parse_flag(raw: Option<&str>, default: bool) -> bool {
    match raw.map(|s| s.trim().to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on" | "") => true,
        Some(_) | None => default,
    }
}
