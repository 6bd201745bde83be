// =============================================================================
// REST API Endpoints: Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health is public; everything else
// requires a Bearer token checked by the `AdminAuth` extractor.
//
// `POST /api/v1/features` is the ingest path for the external feature
// pipeline. It accepts a single snapshot or an array.
//
// CORS is permissive; the API is read-mostly and token-guarded.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::debug;

use crate::api::auth::AdminAuth;
use crate::app_state::AppState;
use crate::feature_source::IngestOutcome;
use crate::types::FeatureSnapshot;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/scores", get(scores))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/positions/closed", get(closed_positions))
        .route("/api/v1/signals", get(signals))
        .route("/api/v1/decisions", get(decisions))
        .route("/api/v1/journal/stats", get(journal_stats))
        .route("/api/v1/features", post(ingest_features))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

impl ListQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
    }
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
    ticks_completed: u64,
    tracked_feeds: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
        ticks_completed: state
            .ticks_completed
            .load(std::sync::atomic::Ordering::Relaxed),
        tracked_feeds: state.features.len(),
    })
}

// =============================================================================
// Read endpoints (authenticated)
// =============================================================================

async fn full_state(_auth: AdminAuth, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

async fn scores(_auth: AdminAuth, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.ranked_scores())
}

async fn positions(_auth: AdminAuth, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.positions.open_positions())
}

async fn closed_positions(
    _auth: AdminAuth,
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> impl IntoResponse {
    Json(state.positions.closed_positions(q.limit()))
}

async fn signals(
    _auth: AdminAuth,
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> impl IntoResponse {
    Json(state.recent_signals(q.limit()))
}

async fn decisions(
    _auth: AdminAuth,
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> impl IntoResponse {
    Json(state.recent_decisions(q.limit()))
}

async fn journal_stats(
    _auth: AdminAuth,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(state.positions.journal_stats())
}

// =============================================================================
// Feature ingest (authenticated)
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeatureBatch {
    One(FeatureSnapshot),
    Many(Vec<FeatureSnapshot>),
}

#[derive(Debug, Default, Serialize, PartialEq, Eq, Deserialize)]
struct IngestResponse {
    accepted: usize,
    outdated: usize,
    rejected: usize,
}

async fn ingest_features(
    _auth: AdminAuth,
    State(state): State<Arc<AppState>>,
    Json(batch): Json<FeatureBatch>,
) -> impl IntoResponse {
    let snapshots = match batch {
        FeatureBatch::One(s) => vec![s],
        FeatureBatch::Many(v) => v,
    };

    let mut resp = IngestResponse::default();
    for snapshot in snapshots {
        match state.features.ingest(snapshot) {
            IngestOutcome::Accepted => resp.accepted += 1,
            IngestOutcome::Outdated => resp.outdated += 1,
            IngestOutcome::Rejected => resp.rejected += 1,
        }
    }

    debug!(
        accepted = resp.accepted,
        outdated = resp.outdated,
        rejected = resp.rejected,
        "feature batch ingested"
    );
    Json(resp)
}
