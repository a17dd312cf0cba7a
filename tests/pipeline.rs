use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use briefcast::state::AppState;
use briefcast::{db, pipeline};

/// Minimal HTTP server handing every connection the same RSS document.
async fn spawn_feed_server(body: String) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let body = body.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let resp = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/rss+xml\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(resp.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

fn rss_fixture() -> String {
    let recent = (Utc::now() - Duration::hours(1)).to_rfc2822();
    format!(
        r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Test Wire</title>
  <item><title>Alpha earnings beat estimates</title>
    <link>https://a.example/alpha?utm_source=rss</link>
    <pubDate>{recent}</pubDate>
    <description>Alpha posted strong results.</description></item>
  <item><title>Beta announces new factory</title>
    <link>https://b.example/beta</link>
    <pubDate>{recent}</pubDate>
    <description>Beta expands capacity.</description></item>
  <item><title>Gamma recalls flagship product</title>
    <link>https://c.example/gamma</link>
    <pubDate>{recent}</pubDate>
    <description>Gamma issues a recall.</description></item>
</channel></rss>"#
    )
}

fn seed_state(feed_url: &str) -> (Arc<AppState>, i64) {
    let conn = db::open_memory().unwrap();
    let id = db::insert_newsletter(
        &conn,
        "test-brief",
        "Test Brief",
        "America/New_York",
        &["07:00".to_string()],
    )
    .unwrap();
    db::insert_feed(&conn, id, feed_url, None).unwrap();
    (Arc::new(AppState::new(conn)), id)
}

async fn run_once(state: &Arc<AppState>, newsletter_id: i64) -> briefcast::models::RunResult {
    let permit = state.try_begin_run(newsletter_id).expect("gate free");
    pipeline::run(Arc::clone(state), newsletter_id, permit)
        .await
        .expect("pipeline runs")
}

/// All providers absent: the run still archives a headlines digest and ends
/// partial, never failed.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn degenerate_run_archives_headlines_digest() {
    let addr = spawn_feed_server(rss_fixture()).await;
    let (state, id) = seed_state(&format!("http://{addr}/feed.xml"));

    let result = run_once(&state, id).await;
    assert_eq!(result.status, "partial");
    assert_eq!(result.feeds_total, 1);
    assert_eq!(result.feeds_ok, 1);
    assert_eq!(result.articles_seen, 3);
    assert_eq!(result.articles_used, 3);
    assert!(!result.email_sent);

    let conn = state.db.lock().unwrap();
    let run = db::run_by_id(&conn, &result.run_id).unwrap().unwrap();
    assert_eq!(run.ai_provider_label.as_deref(), Some("headlines-only"));
    assert_eq!(run.ai_tokens_in, 0);
    assert_eq!(run.ai_tokens_out, 0);

    let html = db::digest_html(&conn, &result.run_id).unwrap().unwrap();
    assert!(html.contains("Headlines"));
    assert_eq!(html.matches("<li").count(), 3);
    // Tracking params were stripped before the link landed in the digest.
    assert!(html.contains("https://a.example/alpha"));
    assert!(!html.contains("utm_source"));

    let logs = db::logs_for_run(&conn, &result.run_id).unwrap();
    assert!(logs.iter().any(|l| l.message == "ai.exhausted"));
    assert!(logs.iter().any(|l| l.message == "select.ranked"));

    // The archived digest is also the site-wide latest.
    assert_eq!(db::latest_digest_html(&conn).unwrap().unwrap(), html);
}

/// The seen set suppresses re-selection on the next fire: items are counted
/// in the normalized input but never re-used.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_run_is_deduplicated() {
    let addr = spawn_feed_server(rss_fixture()).await;
    let (state, id) = seed_state(&format!("http://{addr}/feed.xml"));

    let first = run_once(&state, id).await;
    assert_eq!(first.articles_used, 3);

    let second = run_once(&state, id).await;
    assert_eq!(second.articles_seen, 3);
    assert_eq!(second.articles_used, 0);
    assert_eq!(second.status, "partial");

    let conn = state.db.lock().unwrap();
    let rank_rows: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM run_articles WHERE run_id = ?1",
            [&second.run_id],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(rank_rows, 0);
}

/// Reset-seen re-opens the window: the same stories are selected again in a
/// fresh run and earlier run rows stay untouched.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reset_seen_then_rerun_reselects() {
    let addr = spawn_feed_server(rss_fixture()).await;
    let (state, id) = seed_state(&format!("http://{addr}/feed.xml"));

    let first = run_once(&state, id).await;
    let _second = run_once(&state, id).await;

    {
        let conn = state.db.lock().unwrap();
        let outcome = db::reset_seen(&conn, id, 24).unwrap();
        assert_eq!(outcome.deleted, 3);
        assert_eq!(outcome.after, 0);
    }

    let third = run_once(&state, id).await;
    assert_eq!(third.articles_used, 3);

    let conn = state.db.lock().unwrap();
    assert_eq!(db::list_runs(&conn, 10).unwrap().len(), 3);
    let first_row = db::run_by_id(&conn, &first.run_id).unwrap().unwrap();
    assert_eq!(first_row.articles_used, 3);
}

/// No reachable feed: terminal failed, no digest.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_feed_fails_the_run() {
    let (state, id) = seed_state("http://127.0.0.1:9/feed.xml");
    let result = run_once(&state, id).await;
    assert_eq!(result.status, "failed");
    assert_eq!(result.feeds_ok, 0);

    let conn = state.db.lock().unwrap();
    let run = db::run_by_id(&conn, &result.run_id).unwrap().unwrap();
    assert_eq!(run.error.as_deref(), Some("no feeds succeeded"));
    assert!(db::digest_html(&conn, &result.run_id).unwrap().is_none());
}
