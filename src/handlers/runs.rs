use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::Json;
use serde::Deserialize;

use crate::models::{Run, RunLogRow};
use crate::state::AppState;
use crate::utils::{internalize, not_found};
use crate::db;

/// Most recent digest, unauthenticated-safe.
pub async fn latest(
    State(st): State<Arc<AppState>>,
) -> Result<Html<String>, (StatusCode, String)> {
    let conn = st.db.lock().unwrap();
    match db::latest_digest_html(&conn).map_err(internalize)? {
        Some(html) => Ok(Html(html)),
        None => Err(not_found("digest")),
    }
}

/// One run's archived digest HTML.
pub async fn run_digest(
    State(st): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Html<String>, (StatusCode, String)> {
    let conn = st.db.lock().unwrap();
    match db::digest_html(&conn, &run_id).map_err(internalize)? {
        Some(html) => Ok(Html(html)),
        None => Err(not_found("digest")),
    }
}

#[derive(Deserialize)]
pub struct RunListQ {
    pub limit: Option<i64>,
}

pub async fn list_runs(
    State(st): State<Arc<AppState>>,
    Query(q): Query<RunListQ>,
) -> Result<Json<Vec<Run>>, (StatusCode, String)> {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let conn = st.db.lock().unwrap();
    Ok(Json(db::list_runs(&conn, limit).map_err(internalize)?))
}

pub async fn get_run(
    State(st): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<Run>, (StatusCode, String)> {
    let conn = st.db.lock().unwrap();
    match db::run_by_id(&conn, &run_id).map_err(internalize)? {
        Some(run) => Ok(Json(run)),
        None => Err(not_found("run")),
    }
}

pub async fn run_logs(
    State(st): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<Vec<RunLogRow>>, (StatusCode, String)> {
    let conn = st.db.lock().unwrap();
    if db::run_by_id(&conn, &run_id).map_err(internalize)?.is_none() {
        return Err(not_found("run"));
    }
    Ok(Json(db::logs_for_run(&conn, &run_id).map_err(internalize)?))
}
