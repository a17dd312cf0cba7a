use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use chrono_tz::Tz;
use serde_json::json;
use uuid::Uuid;

use crate::ai::{self, CascadeConfig, CascadeFailure};
use crate::canonical;
use crate::db::{self, RunTotals};
use crate::feeds::{self, DEFAULT_FEED_TIMEOUT};
use crate::mailer::{EmailMessage, EmailTransport};
use crate::market::MarketClient;
use crate::models::{Newsletter, Quote, RunResult, RunStatus, SelectedArticle};
use crate::prompt;
use crate::render;
use crate::runlog::RunLogger;
use crate::select;
use crate::settings::EngineSettings;
use crate::state::{AppState, RunPermit};

const DEFAULT_DEADLINE_SECS: u64 = 8 * 60;

fn run_deadline() -> Duration {
    let secs = std::env::var("RUN_DEADLINE_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_DEADLINE_SECS);
    Duration::from_secs(secs)
}

/// How a run ended before the terminal row write.
#[derive(Debug, thiserror::Error)]
enum RunAbort {
    #[error("cancelled")]
    Cancelled,
    #[error("deadline_exceeded")]
    DeadlineExceeded,
    #[error("no feeds succeeded")]
    NoFeeds,
}

struct RunOutcome {
    status: RunStatus,
    totals: RunTotals,
    error: Option<String>,
}

/// Execute one newsletter run end to end. The caller holds the
/// per-newsletter permit; dropping it (on any exit path) frees the slot.
pub async fn run(
    state: Arc<AppState>,
    newsletter_id: i64,
    _permit: RunPermit,
) -> Result<RunResult> {
    let run_id = Uuid::new_v4().to_string();

    let (newsletter, settings, feed_urls, symbols) = {
        let conn = state.db.lock().unwrap();
        let newsletter = db::newsletter_by_id(&conn, newsletter_id)?
            .with_context(|| format!("newsletter {newsletter_id} not found"))?;
        let settings = EngineSettings::load(&conn);
        let feed_urls: Vec<String> = db::enabled_feeds(&conn, newsletter_id)?
            .into_iter()
            .map(|f| f.url)
            .collect();
        let symbols = db::watchlist(&conn, newsletter_id)?;
        (newsletter, settings, feed_urls, symbols)
    };

    {
        let conn = state.db.lock().unwrap();
        db::insert_run_started(&conn, &run_id, newsletter_id)?;
    }
    let logger = RunLogger::new(Arc::clone(&state.db), Arc::clone(&state.logs), &run_id);
    logger.info(
        "run.started",
        Some(json!({"newsletter": newsletter.slug, "feeds": feed_urls.len()})),
    );

    let outcome = drive(&state, &logger, &newsletter, &settings, feed_urls, symbols).await;

    let (status, totals, error) = match outcome {
        Ok(o) => (o.status, o.totals, o.error),
        Err(e) => {
            // Uncaught pipeline error: terminal failed, nothing else mutates.
            let msg = crate::utils::snippet(&format!("{e:#}"), 500);
            logger.error("run.failed", Some(json!({"error": msg})));
            (
                RunStatus::Failed,
                RunTotals {
                    feeds_total: 0,
                    feeds_ok: 0,
                    articles_seen: 0,
                    articles_used: 0,
                    ai_tokens_in: 0,
                    ai_tokens_out: 0,
                    ai_provider_label: None,
                    email_sent: false,
                },
                Some(msg),
            )
        }
    };

    {
        let conn = state.db.lock().unwrap();
        db::finish_run(&conn, &run_id, status, &totals, error.as_deref())?;
    }
    logger.info("run.finished", Some(json!({"status": status.as_str()})));
    state.clear_cancel(&run_id);

    Ok(RunResult {
        run_id,
        status: status.as_str().to_string(),
        feeds_total: totals.feeds_total,
        feeds_ok: totals.feeds_ok,
        articles_seen: totals.articles_seen,
        articles_used: totals.articles_used,
        email_sent: totals.email_sent,
    })
}

async fn drive(
    state: &Arc<AppState>,
    logger: &RunLogger,
    newsletter: &Newsletter,
    settings: &EngineSettings,
    feed_urls: Vec<String>,
    symbols: Vec<String>,
) -> Result<RunOutcome> {
    let run_id = logger.run_id().to_string();
    let started = Instant::now();
    let deadline = run_deadline();

    let mut totals = RunTotals {
        feeds_total: feed_urls.len() as i64,
        feeds_ok: 0,
        articles_seen: 0,
        articles_used: 0,
        ai_tokens_in: 0,
        ai_tokens_out: 0,
        ai_provider_label: None,
        email_sent: false,
    };

    let abort = |kind: RunAbort, totals: RunTotals| -> Result<RunOutcome> {
        let status = match kind {
            RunAbort::Cancelled | RunAbort::NoFeeds => RunStatus::Failed,
            RunAbort::DeadlineExceeded => {
                if totals.feeds_ok > 0 {
                    RunStatus::Partial
                } else {
                    RunStatus::Failed
                }
            }
        };
        Ok(RunOutcome {
            status,
            totals,
            error: Some(kind.to_string()),
        })
    };

    // --- ingest ---
    let outcomes = feeds::fetch_all(
        &state.http,
        feed_urls,
        settings.max_concurrency,
        DEFAULT_FEED_TIMEOUT,
    )
    .await;

    let mut raw_items = Vec::new();
    for o in outcomes {
        match o.result {
            Ok(items) => {
                totals.feeds_ok += 1;
                logger.info(
                    "feed.fetched",
                    Some(json!({"feed": o.feed_url, "items": items.len()})),
                );
                raw_items.extend(items);
            }
            Err(err) => {
                let event = match err {
                    feeds::FeedFailure::Unreachable(_) => "feed.unreachable",
                    feeds::FeedFailure::ParseInvalid(_) => "feed.parse_invalid",
                };
                logger.warn(event, Some(json!({"feed": o.feed_url, "error": err.to_string()})));
            }
        }
    }

    if totals.feeds_ok == 0 {
        logger.error("run.no_feeds", None);
        return abort(RunAbort::NoFeeds, totals);
    }

    // --- normalize + dedupe + rank ---
    let mut normalized: Vec<_> = raw_items.iter().filter_map(canonical::normalize).collect();
    normalized.truncate(settings.max_articles_considered);
    totals.articles_seen = normalized.len() as i64;

    if state.is_cancelled(&run_id) {
        return abort(RunAbort::Cancelled, totals);
    }

    let now = Utc::now();
    let selected: Vec<SelectedArticle> = {
        let conn = state.db.lock().unwrap();
        select::select_for_run(
            &conn,
            newsletter.id,
            &run_id,
            &normalized,
            now,
            settings.max_articles_for_ai,
            settings.per_source_cap,
        )?
    };
    totals.articles_used = selected.len() as i64;
    logger.info("select.ranked", Some(json!({"ranked": selected.len()})));

    if started.elapsed() > deadline {
        logger.warn("run.deadline_exceeded", Some(json!({"stage": "select"})));
        return abort(RunAbort::DeadlineExceeded, totals);
    }

    // --- market data (best effort, sequential) ---
    let mut quotes: Vec<Quote> = Vec::new();
    if newsletter.include_watchlist && !symbols.is_empty() {
        match MarketClient::from_env(&state.http) {
            Some(client) => {
                for symbol in &symbols {
                    match client.quote(symbol).await {
                        Ok(q) => {
                            let conn = state.db.lock().unwrap();
                            db::upsert_quote(&conn, &run_id, &q)?;
                            drop(conn);
                            quotes.push(q);
                        }
                        Err(e) => logger.warn(
                            "market.lookup_failure",
                            Some(json!({"symbol": symbol, "error": format!("{e:#}")})),
                        ),
                    }
                }
            }
            None => logger.info("market.disabled", None),
        }
    }

    if state.is_cancelled(&run_id) {
        return abort(RunAbort::Cancelled, totals);
    }
    if started.elapsed() > deadline {
        logger.warn("run.deadline_exceeded", Some(json!({"stage": "market"})));
        return abort(RunAbort::DeadlineExceeded, totals);
    }

    // --- the cascade ---
    let tz = Tz::from_str(&newsletter.timezone)
        .or_else(|_| Tz::from_str(&settings.default_timezone))
        .unwrap_or(chrono_tz::America::New_York);
    let local_now = Utc::now().with_timezone(&tz);
    let the_prompt = prompt::build_prompt(newsletter, &local_now, &symbols, &quotes, &selected);

    let cascade = CascadeConfig::from_settings(settings);
    let mut ai_ok = false;
    let summary_md = match ai::run_cascade(&state.http, &cascade, &the_prompt, logger, || {
        state.is_cancelled(&run_id)
    })
    .await
    {
        Ok(success) => {
            ai_ok = true;
            totals.ai_tokens_in = success.tokens_in;
            totals.ai_tokens_out = success.tokens_out;
            totals.ai_provider_label = Some(success.provider_label);
            success.text
        }
        Err(CascadeFailure::Cancelled) => return abort(RunAbort::Cancelled, totals),
        Err(CascadeFailure::Exhausted) => {
            logger.warn("ai.exhausted", Some(json!({"providers": cascade.attempts.len()})));
            totals.ai_provider_label = Some(ai::HEADLINES_LABEL.to_string());
            ai::headlines_fallback(&selected)
        }
    };

    // --- render + archive (digest persists whatever delivery does) ---
    let digest = render::render_digest(newsletter, &local_now, &quotes, &summary_md, &symbols);
    {
        let conn = state.db.lock().unwrap();
        db::upsert_digest(&conn, &run_id, &digest.subject, &digest.html)?;
    }
    logger.info("digest.archived", Some(json!({"subject": digest.subject})));

    if started.elapsed() > deadline {
        logger.warn("run.deadline_exceeded", Some(json!({"stage": "render"})));
        return abort(RunAbort::DeadlineExceeded, totals);
    }

    // --- delivery ---
    let recipients = settings.default_recipients.clone();
    let from = resolve_from(settings);
    match (EmailTransport::from_env(), from) {
        (Some(transport), Some(from)) if !recipients.is_empty() => {
            let message = EmailMessage {
                from,
                to: recipients,
                subject: digest.subject.clone(),
                html: digest.html.clone(),
                text: digest.text.clone(),
            };
            match transport.send(&state.http, &message).await {
                Ok(()) => {
                    totals.email_sent = true;
                    logger.info("email.sent", Some(json!({"recipients": message.to.len()})));
                }
                Err(e) => logger.error(
                    "email.transport_failure",
                    Some(json!({"error": crate::utils::snippet(&format!("{e:#}"), 500)})),
                ),
            }
        }
        _ => logger.info("email.skipped", None),
    }

    let status = if ai_ok && totals.email_sent && totals.feeds_ok > 0 {
        RunStatus::Success
    } else {
        RunStatus::Partial
    };
    Ok(RunOutcome {
        status,
        totals,
        error: None,
    })
}

fn resolve_from(settings: &EngineSettings) -> Option<String> {
    let address = settings
        .from_address
        .clone()
        .or_else(|| std::env::var("FROM_EMAIL").ok())
        .filter(|s| !s.is_empty())?;
    match std::env::var("FROM_NAME") {
        Ok(name) if !name.is_empty() && !address.contains('<') => {
            Some(format!("{name} <{address}>"))
        }
        _ => Some(address),
    }
}
