use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, info};

use crate::db;
use crate::models::ResetSeenOutcome;
use crate::pipeline;
use crate::state::AppState;
use crate::utils::{internalize, not_found};

pub async fn health(State(st): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "logs": st.logs.snapshot(),
    }))
}

#[derive(Serialize)]
pub struct ManualRunStarted {
    pub newsletter_id: i64,
    pub started: bool,
}

/// Same semantics as a scheduled fire: pass the serialization gate, then
/// run in the background. 409 means a run is already in flight.
pub async fn manual_run(
    State(st): State<Arc<AppState>>,
    Path(newsletter_id): Path<i64>,
) -> Result<(StatusCode, Json<ManualRunStarted>), (StatusCode, String)> {
    {
        let conn = st.db.lock().unwrap();
        if db::newsletter_by_id(&conn, newsletter_id)
            .map_err(internalize)?
            .is_none()
        {
            return Err(not_found("newsletter"));
        }
    }

    let Some(permit) = st.try_begin_run(newsletter_id) else {
        return Err((
            StatusCode::CONFLICT,
            "a run for this newsletter is already in flight".to_string(),
        ));
    };

    info!(newsletter_id, "manual run requested");
    let state = Arc::clone(&st);
    tokio::spawn(async move {
        match pipeline::run(state, newsletter_id, permit).await {
            Ok(result) => info!(run_id = %result.run_id, status = %result.status, "manual run complete"),
            Err(e) => error!(newsletter_id, "manual run crashed: {e:#}"),
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(ManualRunStarted {
            newsletter_id,
            started: true,
        }),
    ))
}

#[derive(Deserialize)]
pub struct ResetSeenReq {
    pub hours: u32,
}

/// Windowed seen-set reset; reports counts so the operator can confirm the
/// blast radius.
pub async fn reset_seen(
    State(st): State<Arc<AppState>>,
    Path(newsletter_id): Path<i64>,
    Json(req): Json<ResetSeenReq>,
) -> Result<Json<ResetSeenOutcome>, (StatusCode, String)> {
    if !(1..=168).contains(&req.hours) {
        return Err((
            StatusCode::BAD_REQUEST,
            "hours must be between 1 and 168".to_string(),
        ));
    }
    let conn = st.db.lock().unwrap();
    if db::newsletter_by_id(&conn, newsletter_id)
        .map_err(internalize)?
        .is_none()
    {
        return Err(not_found("newsletter"));
    }
    let outcome = db::reset_seen(&conn, newsletter_id, req.hours).map_err(internalize)?;
    info!(
        newsletter_id,
        hours = req.hours,
        deleted = outcome.deleted,
        "seen window reset"
    );
    Ok(Json(outcome))
}

/// Flag an in-flight run for cancellation; the pipeline notices between
/// steps and between cascade providers.
pub async fn cancel_run(
    State(st): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, String)> {
    {
        let conn = st.db.lock().unwrap();
        match db::run_by_id(&conn, &run_id).map_err(internalize)? {
            None => return Err(not_found("run")),
            Some(run) if run.status != "started" => {
                return Err((
                    StatusCode::CONFLICT,
                    format!("run is already terminal ({})", run.status),
                ));
            }
            Some(_) => {}
        }
    }
    st.request_cancel(&run_id);
    Ok(Json(json!({"run_id": run_id, "cancel_requested": true})))
}
