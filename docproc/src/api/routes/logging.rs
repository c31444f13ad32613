//! `GET`/`PUT /api/logging`: inspect or replace the active log filter.

use axum::{Json, Router, extract::State, routing::get};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::logging::{LOG_TARGETS, LoggingConfig};

#[derive(Debug, Deserialize)]
pub struct SetFilter {
    pub filter: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterView {
    pub filter: String,
    pub log_dir: String,
    pub targets: Vec<LogTarget>,
}

#[derive(Debug, Serialize)]
pub struct LogTarget {
    pub target: &'static str,
    pub description: &'static str,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(show_filter).put(replace_filter))
}

fn installed(state: &AppState) -> ApiResult<&LoggingConfig> {
    state
        .logging_config
        .as_deref()
        .ok_or_else(|| ApiError::service_unavailable("Runtime log filtering is not enabled"))
}

fn view(config: &LoggingConfig) -> FilterView {
    FilterView {
        filter: config.current_filter(),
        log_dir: config.log_dir().display().to_string(),
        targets: LOG_TARGETS
            .iter()
            .map(|&(target, description)| LogTarget {
                target,
                description,
            })
            .collect(),
    }
}

async fn show_filter(State(state): State<AppState>) -> ApiResult<Json<FilterView>> {
    Ok(Json(view(installed(&state)?)))
}

async fn replace_filter(
    State(state): State<AppState>,
    Json(body): Json<SetFilter>,
) -> ApiResult<Json<FilterView>> {
    let config = installed(&state)?;
    config.set_filter(&body.filter)?;
    Ok(Json(view(config)))
}
