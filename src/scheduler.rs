use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tracing::{error, info, warn};

use crate::db;
use crate::models::Newsletter;
use crate::pipeline;
use crate::settings::{EngineSettings, parse_hhmm};
use crate::state::AppState;

/// Upper bound on one scheduler nap so newsletter edits and DST shifts are
/// picked up without a restart.
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// Earliest upcoming fire instant for one newsletter, strictly after
/// `after`. Each HH:MM is interpreted in the newsletter's IANA timezone;
/// resolution is delegated to the timezone database every time, which is
/// what handles DST transitions.
pub fn next_fire(
    newsletter: &Newsletter,
    default_times: &[String],
    default_tz: &str,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let tz = Tz::from_str(&newsletter.timezone)
        .or_else(|_| Tz::from_str(default_tz))
        .ok()?;
    let times = if newsletter.schedule_times.is_empty() {
        default_times
    } else {
        &newsletter.schedule_times
    };

    let after_local = after.with_timezone(&tz);
    let mut soonest: Option<DateTime<Utc>> = None;
    for raw in times {
        let Ok((h, m)) = parse_hhmm(raw) else {
            warn!(newsletter = %newsletter.slug, time = %raw, "unparseable schedule time");
            continue;
        };
        let Ok(schedule) = Schedule::from_str(&format!("0 {m} {h} * * *")) else {
            continue;
        };
        if let Some(fire) = schedule.after(&after_local).next() {
            let fire_utc = fire.with_timezone(&Utc);
            if soonest.is_none_or(|s| fire_utc < s) {
                soonest = Some(fire_utc);
            }
        }
    }
    soonest
}

/// One logical job per (newsletter, time-of-day): sleep until the soonest
/// fire across all active newsletters, dispatch everything due, recompute.
/// A newsletter with a run already in flight coalesces (skips) the fire.
pub async fn run_scheduler(state: Arc<AppState>) {
    let mut last_check = Utc::now();
    info!("scheduler started");

    loop {
        let (newsletters, settings) = {
            let conn = state.db.lock().unwrap();
            let newsletters = db::active_newsletters(&conn).unwrap_or_else(|e| {
                error!("scheduler could not list newsletters: {e:#}");
                Vec::new()
            });
            (newsletters, EngineSettings::load(&conn))
        };

        let now = Utc::now();
        for nl in &newsletters {
            let due = next_fire(nl, &settings.default_send_times, &settings.default_timezone, last_check)
                .is_some_and(|fire| fire <= now);
            if !due {
                continue;
            }
            match state.try_begin_run(nl.id) {
                Some(permit) => {
                    info!(newsletter = %nl.slug, "scheduled fire");
                    let state = Arc::clone(&state);
                    let id = nl.id;
                    let slug = nl.slug.clone();
                    tokio::spawn(async move {
                        match pipeline::run(state, id, permit).await {
                            Ok(result) => info!(
                                newsletter = %slug,
                                run_id = %result.run_id,
                                status = %result.status,
                                "run complete"
                            ),
                            Err(e) => error!(newsletter = %slug, "run crashed: {e:#}"),
                        }
                    });
                }
                None => {
                    warn!(newsletter = %nl.slug, "schedule.overlap: run in flight, fire coalesced");
                }
            }
        }
        last_check = now;

        let soonest = newsletters
            .iter()
            .filter_map(|nl| {
                next_fire(nl, &settings.default_send_times, &settings.default_timezone, now)
            })
            .min();
        let nap = match soonest {
            Some(fire) => (fire - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(MAX_SLEEP),
            None => MAX_SLEEP,
        };
        tokio::time::sleep(nap).await;
    }
}
