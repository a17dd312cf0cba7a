use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use briefcast::state::AppState;
use briefcast::{db, pipeline, settings};

#[derive(Parser, Debug)]
#[command(name = "briefcast-admin", about = "Operate the briefcast newsletter engine")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Create (or migrate) the database at $DATA_DIR.
    Init,
    /// Create a newsletter with feeds and watchlist symbols.
    AddNewsletter {
        slug: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "America/New_York")]
        timezone: String,
        /// Send time(s), HH:MM in the newsletter's timezone. Repeatable.
        #[arg(long = "time", default_values_t = vec!["07:00".to_string()])]
        times: Vec<String>,
        /// Feed URL(s). Repeatable.
        #[arg(long = "feed")]
        feeds: Vec<String>,
        /// Watchlist symbol(s). Repeatable.
        #[arg(long = "symbol")]
        symbols: Vec<String>,
    },
    /// Write one settings key (validated).
    SetSetting { key: String, value: String },
    /// Run a newsletter now, with scheduled-fire semantics.
    RunOnce { slug: String },
    /// Forget recently seen articles so they can be re-selected.
    ResetSeen {
        slug: String,
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },
    /// Delete runs (and their digests/logs) older than N days.
    Prune {
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Init => {
            db::open_db()?;
            println!("OK: database ready at {}", db::db_path());
        }
        Cmd::AddNewsletter {
            slug,
            name,
            timezone,
            times,
            feeds,
            symbols,
        } => {
            if !slug.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
                bail!("slug must match [a-z0-9-]+");
            }
            for t in &times {
                settings::parse_hhmm(t)?;
            }
            let conn = db::open_db()?;
            let id = db::insert_newsletter(&conn, &slug, &name, &timezone, &times)
                .with_context(|| format!("create newsletter {slug}"))?;
            for url in &feeds {
                db::insert_feed(&conn, id, url, None)?;
            }
            for sym in &symbols {
                db::add_watchlist_symbol(&conn, id, sym)?;
            }
            println!(
                "OK: newsletter {slug} (id {id}) with {} feed(s), {} symbol(s)",
                feeds.len(),
                symbols.len()
            );
        }
        Cmd::SetSetting { key, value } => {
            let conn = db::open_db()?;
            settings::set(&conn, &key, &value)?;
            println!("OK: {key} set");
        }
        Cmd::RunOnce { slug } => {
            let conn = db::open_db()?;
            let newsletter = db::newsletter_by_slug(&conn, &slug)?
                .with_context(|| format!("no newsletter with slug {slug}"))?;
            let state = Arc::new(AppState::new(conn));
            let permit = state
                .try_begin_run(newsletter.id)
                .context("a run for this newsletter is already in flight")?;
            let result = pipeline::run(Arc::clone(&state), newsletter.id, permit).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Cmd::ResetSeen { slug, hours } => {
            if !(1..=168).contains(&hours) {
                bail!("hours must be between 1 and 168");
            }
            let conn = db::open_db()?;
            let newsletter = db::newsletter_by_slug(&conn, &slug)?
                .with_context(|| format!("no newsletter with slug {slug}"))?;
            let outcome = db::reset_seen(&conn, newsletter.id, hours)?;
            println!(
                "OK: window {}h — before {}, deleted {}, after {}",
                hours, outcome.before, outcome.deleted, outcome.after
            );
        }
        Cmd::Prune { days } => {
            let conn = db::open_db()?;
            let n = db::prune_runs_older_than(&conn, days)?;
            println!("OK: pruned {n} run(s) older than {days} day(s)");
        }
    }
    Ok(())
}
