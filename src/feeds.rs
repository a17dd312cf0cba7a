use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use feed_rs::model::Entry;
use reqwest::Client;
use reqwest::header::ACCEPT;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::models::RawItem;

pub const DEFAULT_MAX_IN_FLIGHT: usize = 6;
pub const DEFAULT_FEED_TIMEOUT: Duration = Duration::from_secs(10);

const FEED_ACCEPT: &str = "application/rss+xml, application/atom+xml, application/xml;q=0.9";

/// Why a feed produced nothing this round.
#[derive(Debug, thiserror::Error)]
pub enum FeedFailure {
    #[error("{0}")]
    Unreachable(String),
    #[error("{0}")]
    ParseInvalid(String),
}

/// Per-feed result; one failing feed never fails another.
#[derive(Debug)]
pub struct FeedFetchOutcome {
    pub feed_url: String,
    pub result: Result<Vec<RawItem>, FeedFailure>,
}

impl FeedFetchOutcome {
    pub fn ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Fetch every feed with at most `max_in_flight` requests outstanding and
/// wait for all of them (all-settled).
pub async fn fetch_all(
    http: &Client,
    urls: Vec<String>,
    max_in_flight: usize,
    timeout: Duration,
) -> Vec<FeedFetchOutcome> {
    let sem = Arc::new(Semaphore::new(max_in_flight.max(1)));
    let mut set = JoinSet::new();

    for url in urls {
        let sem = Arc::clone(&sem);
        let http = http.clone();
        set.spawn(async move {
            let _slot = sem.acquire_owned().await.expect("semaphore open");
            let result = fetch_feed(&http, &url, timeout).await;
            FeedFetchOutcome { feed_url: url, result }
        });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => outcomes.push(FeedFetchOutcome {
                feed_url: String::new(),
                result: Err(FeedFailure::Unreachable(format!("fetch task panicked: {e}"))),
            }),
        }
    }
    outcomes
}

async fn fetch_feed(
    http: &Client,
    url: &str,
    timeout: Duration,
) -> Result<Vec<RawItem>, FeedFailure> {
    let resp = http
        .get(url)
        .header(ACCEPT, FEED_ACCEPT)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| FeedFailure::Unreachable(format!("GET {url}: {e}")))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(FeedFailure::Unreachable(format!("HTTP {status}")));
    }
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| FeedFailure::Unreachable(format!("read body: {e}")))?;
    parse_feed(&bytes).map_err(|e| FeedFailure::ParseInvalid(format!("{e:#}")))
}

/// RSS 2.0 / Atom 1.0 via feed-rs; unknown elements are ignored and no
/// external entities are resolved.
pub fn parse_feed(bytes: &[u8]) -> Result<Vec<RawItem>> {
    let feed = feed_rs::parser::parse(bytes).context("parse feed")?;
    Ok(feed.entries.iter().filter_map(entry_to_raw).collect())
}

/// Items missing either a title or a link are dropped silently.
fn entry_to_raw(entry: &Entry) -> Option<RawItem> {
    let title = entry
        .title
        .as_ref()
        .map(|t| t.content.trim().to_string())
        .filter(|s| !s.is_empty())?;

    let link = entry_link(entry)?;

    let published = entry
        .published
        .or(entry.updated)
        .map(|dt| dt.with_timezone(&Utc));

    let summary = entry
        .summary
        .as_ref()
        .map(|s| s.content.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            entry
                .content
                .as_ref()
                .and_then(|c| c.body.as_ref())
                .map(|b| b.trim().to_string())
                .filter(|s| !s.is_empty())
        });

    Some(RawItem {
        title,
        link,
        published,
        summary,
    })
}

/// Prefer the alternate link, then any href, then a guid that is a URL.
fn entry_link(entry: &Entry) -> Option<String> {
    if let Some(href) = entry
        .links
        .iter()
        .find(|l| l.rel.as_deref().unwrap_or("alternate") == "alternate")
        .map(|l| l.href.clone())
    {
        return Some(href);
    }
    if let Some(href) = entry.links.first().map(|l| l.href.clone()) {
        return Some(href);
    }
    if entry.id.starts_with("http://") || entry.id.starts_with("https://") {
        return Some(entry.id.clone());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Wire</title>
  <item>
    <title>Fed holds rates &amp; markets rally</title>
    <link>https://wire.example.com/fed</link>
    <pubDate>Thu, 30 Jul 2026 09:00:00 GMT</pubDate>
    <description>Central bank stands pat.</description>
  </item>
  <item>
    <title>No link item</title>
  </item>
  <item>
    <link>https://wire.example.com/untitled</link>
  </item>
</channel></rss>"#;

    const ATOM: &str = r#"<?xml version="1.0"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Desk</title>
  <id>urn:desk</id>
  <updated>2026-07-30T10:00:00Z</updated>
  <entry>
    <title>Chip maker guides higher</title>
    <id>urn:desk:1</id>
    <link rel="self" href="https://desk.example.com/self"/>
    <link rel="alternate" href="https://desk.example.com/chips"/>
    <updated>2026-07-30T08:30:00Z</updated>
    <summary>Guidance raised for Q3.</summary>
  </entry>
</feed>"#;

    #[test]
    fn rss_items_parse_and_incomplete_ones_drop() {
        let items = parse_feed(RSS.as_bytes()).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Fed holds rates & markets rally");
        assert_eq!(items[0].link, "https://wire.example.com/fed");
        assert!(items[0].published.is_some());
        assert_eq!(items[0].summary.as_deref(), Some("Central bank stands pat."));
    }

    #[test]
    fn atom_prefers_alternate_link_and_updated_date() {
        let items = parse_feed(ATOM.as_bytes()).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].link, "https://desk.example.com/chips");
        assert!(items[0].published.is_some());
    }

    #[test]
    fn garbage_is_a_parse_error_not_a_panic() {
        assert!(parse_feed(b"this is not xml").is_err());
    }

    #[tokio::test]
    async fn fetch_all_isolates_unreachable_feeds() {
        // Port 9 on localhost is expected to refuse the connection.
        let http = Client::new();
        let outcomes = fetch_all(
            &http,
            vec!["http://127.0.0.1:9/feed.xml".to_string()],
            2,
            Duration::from_millis(500),
        )
        .await;
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].ok());
    }
}
