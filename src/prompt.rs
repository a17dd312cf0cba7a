use chrono::{DateTime, Datelike, NaiveDate, Timelike, Weekday};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{Newsletter, NewsletterType, Quote, SelectedArticle, Verbosity};

const SNIPPET_MAX: usize = 220;

/// The two halves handed to the cascade: a system-role instruction and the
/// user-role context + headlines.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

// ----------------------- market calendar -----------------------

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u32) -> NaiveDate {
    let first = NaiveDate::from_ymd_opt(year, month, 1).expect("valid month");
    let offset = (7 + weekday.num_days_from_monday() - first.weekday().num_days_from_monday()) % 7;
    first + chrono::Duration::days((offset + (n - 1) * 7) as i64)
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> NaiveDate {
    let next_month = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .expect("valid month");
    let mut d = next_month - chrono::Duration::days(1);
    while d.weekday() != weekday {
        d -= chrono::Duration::days(1);
    }
    d
}

/// Fixed-date holidays shift to the nearest weekday when they land on a
/// weekend (Sat -> Fri, Sun -> Mon).
fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - chrono::Duration::days(1),
        Weekday::Sun => date + chrono::Duration::days(1),
        _ => date,
    }
}

/// US federal market holidays the engine knows about.
pub fn is_market_holiday(d: NaiveDate) -> bool {
    let y = d.year();
    let fixed = [
        NaiveDate::from_ymd_opt(y, 1, 1).unwrap(),
        NaiveDate::from_ymd_opt(y, 6, 19).unwrap(),
        NaiveDate::from_ymd_opt(y, 7, 4).unwrap(),
        NaiveDate::from_ymd_opt(y, 12, 25).unwrap(),
        // Next New Year observed on Dec 31 when Jan 1 is a Saturday.
        NaiveDate::from_ymd_opt(y + 1, 1, 1).unwrap(),
    ];
    if fixed.iter().any(|&f| observed(f) == d) {
        return true;
    }
    d == nth_weekday(y, 1, Weekday::Mon, 3)
        || d == nth_weekday(y, 2, Weekday::Mon, 3)
        || d == last_weekday(y, 5, Weekday::Mon)
        || d == nth_weekday(y, 9, Weekday::Mon, 1)
        || d == nth_weekday(y, 11, Weekday::Thu, 4)
}

pub fn is_market_day(d: NaiveDate) -> bool {
    !matches!(d.weekday(), Weekday::Sat | Weekday::Sun) && !is_market_holiday(d)
}

/// Session hint for the prompt context: weekends/holidays are closed; a
/// market day outside roughly 09:00-17:00 local counts as quiet.
pub fn market_status(local: &DateTime<Tz>) -> &'static str {
    if !is_market_day(local.date_naive()) {
        return "closed";
    }
    let hour = local.hour();
    if (9..17).contains(&hour) { "open" } else { "quiet" }
}

// ----------------------- prompt assembly -----------------------

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());

/// Plain-text snippet for the per-source grouping; tags stripped,
/// whitespace collapsed, truncated to the snippet budget.
pub fn snippet_text(summary: &str) -> String {
    let stripped = TAG_RE.replace_all(summary, " ");
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= SNIPPET_MAX {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(SNIPPET_MAX - 1).collect();
    format!("{cut}…")
}

fn verbosity_instruction(v: Verbosity) -> &'static str {
    match v {
        Verbosity::Low => "Keep every story to a single tight sentence.",
        Verbosity::Medium => "Use two to three sentences per story.",
        Verbosity::High => {
            "Write a fuller paragraph per story, including context and likely second-order effects."
        }
    }
}

pub fn build_prompt(
    newsletter: &Newsletter,
    local_now: &DateTime<Tz>,
    symbols: &[String],
    quotes: &[Quote],
    selected: &[SelectedArticle],
) -> Prompt {
    let role = match newsletter.newsletter_type {
        NewsletterType::Markets => "You are a seasoned financial analyst writing a morning brief.",
        NewsletterType::General => "You are a senior news editor writing a daily briefing.",
    };

    let system = format!(
        "{role} Produce Markdown using exactly these headings, in this order:\n\
         ## SECTION 1 - MARKET PERFORMANCE\n\
         ## SECTION 2 - TOP MARKET & ECONOMY STORIES (5 stories)\n\
         ## SECTION 3 - GENERAL NEWS STORIES (10 stories)\n\
         ### LOOKING AHEAD (Tomorrow)\n\
         Cite stories with Markdown links using ONLY the URLs provided in the input. \
         {verbosity} Always write literal calendar dates; never emit placeholder tokens \
         such as [Today] or [Tomorrow].",
        role = role,
        verbosity = verbosity_instruction(newsletter.verbosity),
    );

    let mut user = String::new();
    user.push_str(&format!(
        "Today is {} ({}). Market status: {}.\n",
        local_now.format("%A, %B %-d, %Y"),
        newsletter.timezone,
        market_status(local_now),
    ));

    if !symbols.is_empty() {
        user.push_str(&format!("Tracked tickers: {}.\n", symbols.join(", ")));
    }
    if !quotes.is_empty() {
        user.push_str("Latest quotes (symbol | price | change | %):\n");
        for q in quotes {
            user.push_str(&format!(
                "{} | {:.2} | {:+.2} | {:+.2}%\n",
                q.symbol, q.price, q.change_amount, q.change_percent
            ));
        }
    }
    if !newsletter.custom_prompt.trim().is_empty() {
        user.push('\n');
        user.push_str(newsletter.custom_prompt.trim());
        user.push('\n');
    }

    user.push_str("\nHeadlines:\n");
    for s in selected {
        user.push_str(&format!(
            "{}. {} [{}]\n",
            s.rank, s.item.title, s.item.canonical_url
        ));
    }

    user.push_str("\nBy source:\n");
    let mut current_source = "";
    for s in selected_by_source(selected) {
        if s.item.source != current_source {
            current_source = &s.item.source;
            user.push_str(&format!("\n{current_source}:\n"));
        }
        match s.item.summary.as_deref() {
            Some(summary) if !summary.trim().is_empty() => {
                user.push_str(&format!("- {} — {}\n", s.item.title, snippet_text(summary)));
            }
            _ => user.push_str(&format!("- {}\n", s.item.title)),
        }
    }

    Prompt { system, user }
}

fn selected_by_source(selected: &[SelectedArticle]) -> Vec<&SelectedArticle> {
    let mut by_source: Vec<&SelectedArticle> = selected.iter().collect();
    by_source.sort_by(|a, b| a.item.source.cmp(&b.item.source).then(a.rank.cmp(&b.rank)));
    by_source
}
