use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal + initial run states. Stored as lowercase strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Started,
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Started => "started",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Low,
    Medium,
    High,
}

impl Verbosity {
    pub fn parse(s: &str) -> Self {
        match s {
            "low" => Verbosity::Low,
            "high" => Verbosity::High,
            _ => Verbosity::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verbosity::Low => "low",
            Verbosity::Medium => "medium",
            Verbosity::High => "high",
        }
    }
}

/// Newsletter flavor; picks the analyst vs. editor framing in the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewsletterType {
    Markets,
    General,
}

impl NewsletterType {
    pub fn parse(s: &str) -> Self {
        match s {
            "general" => NewsletterType::General,
            _ => NewsletterType::Markets,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NewsletterType::Markets => "markets",
            NewsletterType::General => "general",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Newsletter {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub timezone: String,
    pub schedule_times: Vec<String>,
    pub active: bool,
    pub include_watchlist: bool,
    #[serde(serialize_with = "ser_newsletter_type")]
    pub newsletter_type: NewsletterType,
    #[serde(serialize_with = "ser_verbosity")]
    pub verbosity: Verbosity,
    pub custom_prompt: String,
    pub created_at: String,
    pub updated_at: String,
}

fn ser_newsletter_type<S: serde::Serializer>(v: &NewsletterType, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(v.as_str())
}

fn ser_verbosity<S: serde::Serializer>(v: &Verbosity, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(v.as_str())
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedRow {
    pub id: i64,
    pub newsletter_id: i64,
    pub url: String,
    pub title: Option<String>,
    pub category: Option<String>,
    pub enabled: bool,
    pub order_index: i64,
}

/// One entry as it came off a feed, before canonicalization.
#[derive(Debug, Clone)]
pub struct RawItem {
    pub title: String,
    pub link: String,
    pub published: Option<DateTime<Utc>>,
    pub summary: Option<String>,
}

/// An item after canonicalization; `content_hash` is its dedupe identity.
#[derive(Debug, Clone)]
pub struct NormalizedItem {
    pub title: String,
    pub title_norm: String,
    pub canonical_url: String,
    pub source: String,
    pub content_hash: String,
    pub published_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
}

/// A ranked item accepted into a run.
#[derive(Debug, Clone)]
pub struct SelectedArticle {
    pub article_id: i64,
    pub rank: usize,
    pub score: f64,
    pub item: NormalizedItem,
}

#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    pub change_amount: f64,
    pub change_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub run_id: String,
    pub newsletter_id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub feeds_total: i64,
    pub feeds_ok: i64,
    pub articles_seen: i64,
    pub articles_used: i64,
    pub ai_tokens_in: i64,
    pub ai_tokens_out: i64,
    pub ai_provider_label: Option<String>,
    pub email_sent: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunLogRow {
    pub ts: String,
    pub level: String,
    pub message: String,
    pub context_json: Option<String>,
}

/// What the scheduler (or the manual-run endpoint) gets back from a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: String,
    pub status: String,
    pub feeds_total: i64,
    pub feeds_ok: i64,
    pub articles_seen: i64,
    pub articles_used: i64,
    pub email_sent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetSeenOutcome {
    pub before: i64,
    pub deleted: i64,
    pub after: i64,
}
