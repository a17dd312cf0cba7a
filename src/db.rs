use std::{env, fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::{
    FeedRow, Newsletter, NewsletterType, Quote, ResetSeenOutcome, Run, RunLogRow, RunStatus,
    Verbosity,
};

// Embed the schema so any entrypoint can initialize the DB.
const SCHEMA: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/db/schema.sql"));

pub fn db_path() -> String {
    let dir = env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    format!("{}/briefcast.db", dir.trim_end_matches('/'))
}

fn ensure_parent_dir(path: &str) -> Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).context("create DB parent dir")?;
        }
    }
    Ok(())
}

pub fn open_db() -> Result<Connection> {
    let path = db_path();
    ensure_parent_dir(&path)?;
    let conn = Connection::open(&path).with_context(|| format!("open sqlite at {path}"))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_millis(250))?;
    conn.execute_batch(SCHEMA).context("apply schema.sql")?;
    Ok(conn)
}

/// In-memory store with the full schema, for tests and dry runs.
pub fn open_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(SCHEMA).context("apply schema.sql")?;
    Ok(conn)
}

fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

/// Retry a write a few times on busy/locked before giving up; persistent
/// failure is surfaced to the caller, which aborts the run.
pub fn with_retry<T, F>(mut f: F) -> rusqlite::Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    let mut last = None;
    for _ in 0..3 {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(&e) => {
                last = Some(e);
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.expect("retry loop ran"))
}

// ----------------------- newsletters & feeds -----------------------

fn row_to_newsletter(r: &rusqlite::Row<'_>) -> rusqlite::Result<Newsletter> {
    let times_json: String = r.get("schedule_times")?;
    let schedule_times: Vec<String> = serde_json::from_str(&times_json).unwrap_or_default();
    let nl_type: String = r.get("newsletter_type")?;
    let verbosity: String = r.get("verbosity")?;
    Ok(Newsletter {
        id: r.get("id")?,
        slug: r.get("slug")?,
        name: r.get("name")?,
        timezone: r.get("timezone")?,
        schedule_times,
        active: r.get::<_, i64>("active")? != 0,
        include_watchlist: r.get::<_, i64>("include_watchlist")? != 0,
        newsletter_type: NewsletterType::parse(&nl_type),
        verbosity: Verbosity::parse(&verbosity),
        custom_prompt: r.get("custom_prompt")?,
        created_at: r.get("created_at")?,
        updated_at: r.get("updated_at")?,
    })
}

const NEWSLETTER_COLS: &str = "id, slug, name, timezone, schedule_times, active, \
     include_watchlist, newsletter_type, verbosity, custom_prompt, created_at, updated_at";

pub fn insert_newsletter(
    conn: &Connection,
    slug: &str,
    name: &str,
    timezone: &str,
    schedule_times: &[String],
) -> Result<i64> {
    let times = serde_json::to_string(schedule_times)?;
    conn.execute(
        "INSERT INTO newsletters (slug, name, timezone, schedule_times) VALUES (?1, ?2, ?3, ?4)",
        params![slug, name, timezone, times],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn newsletter_by_id(conn: &Connection, id: i64) -> Result<Option<Newsletter>> {
    let sql = format!("SELECT {NEWSLETTER_COLS} FROM newsletters WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![id], |r| row_to_newsletter(r))
        .optional()?)
}

pub fn newsletter_by_slug(conn: &Connection, slug: &str) -> Result<Option<Newsletter>> {
    let sql = format!("SELECT {NEWSLETTER_COLS} FROM newsletters WHERE slug = ?1");
    Ok(conn
        .query_row(&sql, params![slug], |r| row_to_newsletter(r))
        .optional()?)
}

pub fn active_newsletters(conn: &Connection) -> Result<Vec<Newsletter>> {
    let sql = format!("SELECT {NEWSLETTER_COLS} FROM newsletters WHERE active = 1 ORDER BY id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |r| row_to_newsletter(r))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn insert_feed(conn: &Connection, newsletter_id: i64, url: &str, title: Option<&str>) -> Result<()> {
    conn.execute(
        "INSERT INTO feeds (newsletter_id, url, title, order_index)
         VALUES (?1, ?2, ?3, (SELECT COALESCE(MAX(order_index), -1) + 1 FROM feeds WHERE newsletter_id = ?1))
         ON CONFLICT(newsletter_id, url) DO NOTHING",
        params![newsletter_id, url, title],
    )?;
    Ok(())
}

pub fn enabled_feeds(conn: &Connection, newsletter_id: i64) -> Result<Vec<FeedRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, newsletter_id, url, title, category, enabled, order_index
         FROM feeds WHERE newsletter_id = ?1 AND enabled = 1 ORDER BY order_index, id",
    )?;
    let rows = stmt
        .query_map(params![newsletter_id], |r| {
            Ok(FeedRow {
                id: r.get(0)?,
                newsletter_id: r.get(1)?,
                url: r.get(2)?,
                title: r.get(3)?,
                category: r.get(4)?,
                enabled: r.get::<_, i64>(5)? != 0,
                order_index: r.get(6)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn add_watchlist_symbol(conn: &Connection, newsletter_id: i64, symbol: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO watchlist_symbols (newsletter_id, symbol) VALUES (?1, ?2)
         ON CONFLICT(newsletter_id, symbol) DO NOTHING",
        params![newsletter_id, symbol.to_ascii_uppercase()],
    )?;
    Ok(())
}

pub fn watchlist(conn: &Connection, newsletter_id: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT symbol FROM watchlist_symbols WHERE newsletter_id = ?1 ORDER BY symbol",
    )?;
    let rows = stmt
        .query_map(params![newsletter_id], |r| r.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// ----------------------- runs -----------------------

pub fn insert_run_started(conn: &Connection, run_id: &str, newsletter_id: i64) -> Result<()> {
    with_retry(|| {
        conn.execute(
            "INSERT INTO runs (run_id, newsletter_id, status) VALUES (?1, ?2, 'started')",
            params![run_id, newsletter_id],
        )
    })?;
    Ok(())
}

pub struct RunTotals {
    pub feeds_total: i64,
    pub feeds_ok: i64,
    pub articles_seen: i64,
    pub articles_used: i64,
    pub ai_tokens_in: i64,
    pub ai_tokens_out: i64,
    pub ai_provider_label: Option<String>,
    pub email_sent: bool,
}

/// Terminal transition; single UPDATE so the status flip is atomic.
pub fn finish_run(
    conn: &Connection,
    run_id: &str,
    status: RunStatus,
    totals: &RunTotals,
    error: Option<&str>,
) -> Result<()> {
    with_retry(|| {
        conn.execute(
            "UPDATE runs SET finished_at = datetime('now'), status = ?2,
                    feeds_total = ?3, feeds_ok = ?4, articles_seen = ?5, articles_used = ?6,
                    ai_tokens_in = ?7, ai_tokens_out = ?8, ai_provider_label = ?9,
                    email_sent = ?10, error = ?11
             WHERE run_id = ?1",
            params![
                run_id,
                status.as_str(),
                totals.feeds_total,
                totals.feeds_ok,
                totals.articles_seen,
                totals.articles_used,
                totals.ai_tokens_in,
                totals.ai_tokens_out,
                totals.ai_provider_label,
                totals.email_sent as i64,
                error,
            ],
        )
    })?;
    Ok(())
}

fn row_to_run(r: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        run_id: r.get("run_id")?,
        newsletter_id: r.get("newsletter_id")?,
        started_at: r.get("started_at")?,
        finished_at: r.get("finished_at")?,
        status: r.get("status")?,
        feeds_total: r.get("feeds_total")?,
        feeds_ok: r.get("feeds_ok")?,
        articles_seen: r.get("articles_seen")?,
        articles_used: r.get("articles_used")?,
        ai_tokens_in: r.get("ai_tokens_in")?,
        ai_tokens_out: r.get("ai_tokens_out")?,
        ai_provider_label: r.get("ai_provider_label")?,
        email_sent: r.get::<_, i64>("email_sent")? != 0,
        error: r.get("error")?,
    })
}

const RUN_COLS: &str = "run_id, newsletter_id, started_at, finished_at, status, feeds_total, \
     feeds_ok, articles_seen, articles_used, ai_tokens_in, ai_tokens_out, ai_provider_label, \
     email_sent, error";

pub fn run_by_id(conn: &Connection, run_id: &str) -> Result<Option<Run>> {
    let sql = format!("SELECT {RUN_COLS} FROM runs WHERE run_id = ?1");
    Ok(conn
        .query_row(&sql, params![run_id], |r| row_to_run(r))
        .optional()?)
}

pub fn list_runs(conn: &Connection, limit: i64) -> Result<Vec<Run>> {
    let sql = format!("SELECT {RUN_COLS} FROM runs ORDER BY started_at DESC, run_id DESC LIMIT ?1");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![limit], |r| row_to_run(r))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// ----------------------- dedupe & selection -----------------------

pub fn is_seen(conn: &Connection, newsletter_id: i64, content_hash: &str) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM seen_hashes WHERE newsletter_id = ?1 AND content_hash = ?2",
        params![newsletter_id, content_hash],
        |r| r.get(0),
    )?;
    Ok(n > 0)
}

pub fn insert_seen(conn: &Connection, newsletter_id: i64, content_hash: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO seen_hashes (content_hash, newsletter_id) VALUES (?1, ?2)
         ON CONFLICT(content_hash, newsletter_id) DO NOTHING",
        params![content_hash, newsletter_id],
    )?;
    Ok(())
}

/// First-seen-wins insert; returns the surviving article id.
pub fn insert_article_ignore(
    conn: &Connection,
    content_hash: &str,
    source: &str,
    title: &str,
    canonical_url: &str,
    published_at: Option<&str>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO articles (content_hash, source, title, canonical_url, published_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(content_hash) DO NOTHING",
        params![content_hash, source, title, canonical_url, published_at],
    )?;
    let id: i64 = conn.query_row(
        "SELECT id FROM articles WHERE content_hash = ?1",
        params![content_hash],
        |r| r.get(0),
    )?;
    Ok(id)
}

pub fn insert_run_article(
    conn: &Connection,
    run_id: &str,
    article_id: i64,
    rank: usize,
    score: f64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO run_articles (run_id, article_id, rank, score) VALUES (?1, ?2, ?3, ?4)",
        params![run_id, article_id, rank as i64, score],
    )?;
    Ok(())
}

pub fn reset_seen(conn: &Connection, newsletter_id: i64, hours: u32) -> Result<ResetSeenOutcome> {
    let window = format!("-{hours} hours");
    let before: i64 = conn.query_row(
        "SELECT COUNT(*) FROM seen_hashes
         WHERE newsletter_id = ?1 AND first_seen_at >= datetime('now', ?2)",
        params![newsletter_id, window],
        |r| r.get(0),
    )?;
    let deleted = conn.execute(
        "DELETE FROM seen_hashes
         WHERE newsletter_id = ?1 AND first_seen_at >= datetime('now', ?2)",
        params![newsletter_id, window],
    )? as i64;
    let after: i64 = conn.query_row(
        "SELECT COUNT(*) FROM seen_hashes
         WHERE newsletter_id = ?1 AND first_seen_at >= datetime('now', ?2)",
        params![newsletter_id, window],
        |r| r.get(0),
    )?;
    Ok(ResetSeenOutcome { before, deleted, after })
}

// ----------------------- quotes, digests, logs -----------------------

pub fn upsert_quote(conn: &Connection, run_id: &str, q: &Quote) -> Result<()> {
    conn.execute(
        "INSERT INTO market_data (run_id, symbol, price, change_amount, change_percent)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(run_id, symbol) DO UPDATE SET
           price = excluded.price,
           change_amount = excluded.change_amount,
           change_percent = excluded.change_percent,
           captured_at = datetime('now')",
        params![run_id, q.symbol, q.price, q.change_amount, q.change_percent],
    )?;
    Ok(())
}

pub fn upsert_digest(conn: &Connection, run_id: &str, subject: &str, html: &str) -> Result<()> {
    with_retry(|| {
        conn.execute(
            "INSERT INTO digests (run_id, subject, html) VALUES (?1, ?2, ?3)
             ON CONFLICT(run_id) DO UPDATE SET subject = excluded.subject, html = excluded.html",
            params![run_id, subject, html],
        )
    })?;
    Ok(())
}

pub fn digest_html(conn: &Connection, run_id: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT html FROM digests WHERE run_id = ?1",
            params![run_id],
            |r| r.get(0),
        )
        .optional()?)
}

pub fn latest_digest_html(conn: &Connection) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT d.html FROM digests d JOIN runs r ON r.run_id = d.run_id
             ORDER BY r.started_at DESC, r.run_id DESC LIMIT 1",
            [],
            |r| r.get(0),
        )
        .optional()?)
}

pub fn insert_run_log(
    conn: &Connection,
    run_id: &str,
    level: &str,
    message: &str,
    context_json: Option<&str>,
) -> Result<()> {
    with_retry(|| {
        conn.execute(
            "INSERT INTO run_logs (run_id, level, message, context_json) VALUES (?1, ?2, ?3, ?4)",
            params![run_id, level, message, context_json],
        )
    })?;
    Ok(())
}

pub fn logs_for_run(conn: &Connection, run_id: &str) -> Result<Vec<RunLogRow>> {
    let mut stmt = conn.prepare(
        "SELECT ts, level, message, context_json FROM run_logs
         WHERE run_id = ?1 ORDER BY ts, id",
    )?;
    let rows = stmt
        .query_map(params![run_id], |r| {
            Ok(RunLogRow {
                ts: r.get(0)?,
                level: r.get(1)?,
                message: r.get(2)?,
                context_json: r.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Retention: drop runs older than N days; digests, logs, run_articles and
/// market rows go with them via ON DELETE CASCADE.
pub fn prune_runs_older_than(conn: &Connection, days: i64) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM runs WHERE started_at < datetime('now', ?1)",
        params![format!("-{days} days")],
    )?;
    Ok(n)
}

// ----------------------- settings bag -----------------------

pub fn get_setting(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |r| r.get(0),
        )
        .optional()?)
}

pub fn put_setting(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}
