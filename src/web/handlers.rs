//! HTTP request handlers.

use super::AppState;
use crate::db::{daily_totals, DailyTraffic, HourlyRollup, Sample};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

const DEFAULT_DAILY_DAYS: i64 = 7;
const MAX_DAILY_DAYS: i64 = 366;

// ============================================================================
// Health and live speeds
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: String,
    pub buffered_samples: usize,
}

pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        database: state.store.dialect().to_string(),
        buffered_samples: state.buffer.pending_len(),
    })
}

pub async fn handle_recent_speeds(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.buffer.snapshot())
}

/// Last sample per client. A client that stopped answering keeps its old
/// sample; callers judge staleness from the timestamp.
pub async fn handle_latest_speeds(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.buffer.latest())
}

// ============================================================================
// Traffic history
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TrafficQuery {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TrafficResponse {
    pub hourly: Vec<HourlyRollup>,
    pub raw: Vec<Sample>,
}

fn parse_time(s: Option<&String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

pub async fn handle_traffic(State(state): State<AppState>, Query(query): Query<TrafficQuery>) -> impl IntoResponse {
    let end = parse_time(query.end.as_ref()).unwrap_or_else(Utc::now);
    let start = parse_time(query.start.as_ref()).unwrap_or_else(|| end - ChronoDuration::hours(24));
    if start >= end {
        return (StatusCode::BAD_REQUEST, "start must be before end").into_response();
    }

    let client_id = query.client_id.as_deref();
    let hourly = match state.store.get_hourly_rollups(client_id, start, end).await {
        Ok(r) => r,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let raw = match state.store.get_raw_samples(client_id, start, end).await {
        Ok(r) => r,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    Json(TrafficResponse { hourly, raw }).into_response()
}

#[derive(Debug, Deserialize)]
pub struct DailyQuery {
    #[serde(default)]
    pub days: Option<i64>,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Start of the UTC day `days - 1` days before `now`.
fn daily_window_start(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    let first = now.date_naive() - ChronoDuration::days(days - 1);
    first.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc()).unwrap_or(now)
}

pub async fn handle_daily_traffic(State(state): State<AppState>, Query(query): Query<DailyQuery>) -> impl IntoResponse {
    let days = query.days.unwrap_or(DEFAULT_DAILY_DAYS).clamp(1, MAX_DAILY_DAYS);
    let end = Utc::now();
    let start = daily_window_start(end, days);
    let client_id = query.client_id.as_deref();

    let hourly = match state.store.get_hourly_rollups(client_id, start, end).await {
        Ok(r) => r,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let raw = match state.store.get_raw_samples(client_id, start, end).await {
        Ok(r) => r,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    let totals: Vec<DailyTraffic> = daily_totals(&hourly, &raw);
    Json(totals).into_response()
}

// ============================================================================
// Clients and jobs
// ============================================================================

pub async fn handle_clients(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get_clients().await {
        Ok(clients) => Json(clients).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    #[serde(default)]
    pub client_id: Option<String>,
}

pub async fn handle_jobs(State(state): State<AppState>, Query(query): Query<JobsQuery>) -> impl IntoResponse {
    match state.store.get_jobs(query.client_id.as_deref()).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_job(State(state): State<AppState>, Path(hash): Path<String>) -> impl IntoResponse {
    match state.store.get_job(&hash).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Job not found").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
