//! Queue, coordinator and progress statistics.

use axum::{Json, Router, extract::State, routing::get};

use crate::api::error::ApiResult;
use crate::api::server::AppState;
use crate::pipeline::ProcessingMetrics;
use crate::progress::ProgressAnalytics;
use crate::queue::QueueMetrics;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/queue/metrics", get(queue_metrics))
        .route("/api/processing/metrics", get(processing_metrics))
        .route("/api/progress/analytics", get(progress_analytics))
}

async fn queue_metrics(State(state): State<AppState>) -> ApiResult<Json<QueueMetrics>> {
    Ok(Json(state.services.queue.metrics().await?))
}

async fn processing_metrics(State(state): State<AppState>) -> ApiResult<Json<ProcessingMetrics>> {
    Ok(Json(state.services.coordinator.processing_metrics().await?))
}

async fn progress_analytics(State(state): State<AppState>) -> Json<ProgressAnalytics> {
    Json(state.services.tracker.analytics())
}
