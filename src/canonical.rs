use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use url::Url;

use crate::models::{NormalizedItem, RawItem};

/// Query parameters that only identify the click, not the article.
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "utm_name",
    "mc_cid",
    "mc_eid",
    "gclid",
    "igshid",
];

/// Strip tracking params and lowercase the host. `None` means the link was
/// not a usable URL and the item should be dropped.
pub fn canonical_url(raw: &str) -> Option<String> {
    let mut parsed = Url::parse(raw.trim()).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    parsed.set_host(Some(&host)).ok()?;

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !TRACKING_PARAMS.contains(&k.to_ascii_lowercase().as_str()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        let q = kept
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        parsed.set_query(Some(&q));
    }
    Some(parsed.to_string())
}

/// Trim, lowercase, and collapse every run of whitespace/punctuation to a
/// single space so cosmetic edits don't change the hash.
pub fn normalize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut in_gap = false;
    for c in title.trim().chars() {
        if c.is_alphanumeric() {
            if in_gap && !out.is_empty() {
                out.push(' ');
            }
            in_gap = false;
            for lc in c.to_lowercase() {
                out.push(lc);
            }
        } else {
            in_gap = true;
        }
    }
    out
}

fn date_only(published: Option<DateTime<Utc>>) -> String {
    published
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

/// Deterministic identity: SHA-256 over normalized title, canonical URL,
/// the UTC publish date (day precision), and the source host.
pub fn content_hash(
    title_norm: &str,
    canonical: &str,
    published: Option<DateTime<Utc>>,
    host: &str,
) -> String {
    let mut h = Sha256::new();
    h.update(title_norm.as_bytes());
    h.update(b"|");
    h.update(canonical.as_bytes());
    h.update(b"|");
    h.update(date_only(published).as_bytes());
    h.update(b"|");
    h.update(host.as_bytes());
    hex::encode(h.finalize())
}

/// Full canonicalization of one raw feed item.
pub fn normalize(raw: &RawItem) -> Option<NormalizedItem> {
    let canonical = canonical_url(&raw.link)?;
    let host = Url::parse(&canonical).ok()?.host_str()?.to_string();
    let title_norm = normalize_title(&raw.title);
    let hash = content_hash(&title_norm, &canonical, raw.published, &host);
    Some(NormalizedItem {
        title: raw.title.trim().to_string(),
        title_norm,
        canonical_url: canonical,
        source: host,
        content_hash: hash,
        published_at: raw.published,
        summary: raw.summary.clone(),
    })
}
