//! HTTP handlers for the thin REST surface next to the control channel.

use axum::{Json, extract::State};
use log::info;
use serde::{Deserialize, Serialize};

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::settings::ProxySetting;
use crate::sync::{ContainerRecord, SyncReport};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub engine: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
    pub version: String,
    pub sessions: usize,
}

/// GET /api/health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let (status, engine, engine_version) = match state.engine.health_check().await {
        Ok(version) => ("ok", "available", Some(version)),
        Err(_) => ("degraded", "unavailable", None),
    };
    Json(HealthResponse {
        status: status.to_string(),
        engine: engine.to_string(),
        engine_version,
        version: env!("CARGO_PKG_VERSION").to_string(),
        sessions: state.sessions.len(),
    })
}

/// GET /api/containers
pub async fn list_containers(State(state): State<AppState>) -> ApiResult<Json<Vec<ContainerRecord>>> {
    Ok(Json(state.sync.get_container_list().await?))
}

/// POST /api/containers/sync
pub async fn sync_containers(State(state): State<AppState>) -> ApiResult<Json<SyncReport>> {
    let report = state.sync.sync().await?;
    Ok(Json(report))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResponse {
    pub removed: u64,
}

/// POST /api/containers/cleanup-duplicates
pub async fn cleanup_duplicates(State(state): State<AppState>) -> ApiResult<Json<CleanupResponse>> {
    let removed = state.sync.cleanup_duplicate_records().await?;
    Ok(Json(CleanupResponse { removed }))
}

/// GET /api/settings/proxy
pub async fn get_proxy(State(state): State<AppState>) -> Json<ProxySetting> {
    Json(state.proxy.get())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProxyRequest {
    #[serde(default)]
    pub url: Option<String>,
    /// Left unchanged when absent.
    #[serde(default)]
    pub mirror_urls: Option<Vec<String>>,
}

/// PUT /api/settings/proxy
pub async fn update_proxy(
    State(state): State<AppState>,
    Json(request): Json<UpdateProxyRequest>,
) -> ApiResult<Json<ProxySetting>> {
    let mirrors = request
        .mirror_urls
        .unwrap_or_else(|| state.proxy.get().mirror_urls);
    let setting = ProxySetting::new(request.url).with_mirrors(mirrors);
    setting.validate().map_err(ApiError::bad_request)?;
    if state.proxy.set(setting.clone()) {
        info!(
            "Proxy setting changed to {} ({} mirror(s))",
            setting.url.as_deref().unwrap_or("<none>"),
            setting.mirror_urls.len()
        );
    }
    Ok(Json(setting))
}
