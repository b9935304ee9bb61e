//! History query API.

use crate::clients::DeviceRegistry;
use crate::config::ApiConfig;
use crate::error::{HistoryError, Result};
use crate::index_manager::IndexManager;
use crate::logging::{LogControl, LogLevel};
use crate::partition::PartitionKey;
use crate::query::{self, HistoryParams};
use crate::response::{self, ResponseFormat};
use crate::store::HistoryStore;
use anyhow::Context;
use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, HeaderMap},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn HistoryStore>,
    pub registry: Arc<dyn DeviceRegistry>,
    pub indexes: IndexManager,
    pub log_control: LogControl,
}

/// Tenant and raw token of an authenticated request
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub tenant: String,
    pub token: String,
}

/// `service` claim of a JWT payload segment. The signature is not checked;
/// padding is optional and both base64 alphabets are accepted.
pub fn tenant_from_token(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let mut padded = payload.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }

    let decoded = STANDARD
        .decode(&padded)
        .or_else(|_| URL_SAFE.decode(&padded))
        .ok()?;
    let claims: Value = serde_json::from_slice(&decoded).ok()?;
    claims.get("service")?.as_str().map(str::to_string)
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AuthContext {
    type Rejection = HistoryError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                HistoryError::Unauthorized(
                    "Please provide an auth token as part of the request.".to_string(),
                )
            })?;

        let tenant = tenant_from_token(token).ok_or_else(|| {
            HistoryError::Unauthorized(
                "The provided auth token is not valid. Please request a new token and try again."
                    .to_string(),
            )
        })?;

        Ok(Self {
            tenant,
            token: token.to_string(),
        })
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/device/:device_id/history", get(device_history))
        .route("/device/:device_id/sharding", post(enable_sharding))
        .route("/notifications/history", get(notification_history))
        .route(
            "/STH/v1/contextEntities/type/:device_type/id/:device_id/attributes/:attr",
            get(sth_history),
        )
        .route("/log", get(get_log_level).put(set_log_level))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "history"
    }))
}

fn negotiate(headers: &HeaderMap) -> Result<ResponseFormat> {
    ResponseFormat::negotiate(
        headers
            .get(header::ACCEPT)
            .and_then(|value| value.to_str().ok()),
    )
}

async fn require_partition(state: &AppState, partition: &PartitionKey) -> Result<()> {
    if state.store.partition_exists(partition).await? {
        Ok(())
    } else {
        Err(HistoryError::not_found(
            "Device not found",
            "No data for the given device could be found",
        ))
    }
}

/// Attribute history of one device
#[instrument(skip(state, auth, headers, pairs), fields(tenant = %auth.tenant))]
async fn device_history(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Response> {
    let format = negotiate(&headers)?;
    let partition = PartitionKey::resolve(&auth.tenant, &device_id);
    require_partition(&state, &partition).await?;

    let params = HistoryParams::from_pairs(pairs);
    let base = query::translate(&params, None)?;

    if let [attr] = params.attrs.as_slice() {
        let samples = state
            .store
            .find_samples(&partition, &base.for_attr(attr))
            .await?;
        if samples.is_empty() {
            return Err(HistoryError::not_found(
                "Attr not found",
                "No data for the given attribute could be found",
            ));
        }
        return response::render_samples(format, &samples);
    }

    let attrs = if params.attrs.is_empty() {
        let discovered = state.registry.attrs(&device_id, &auth.token).await?;
        debug!(device_id = %device_id, count = discovered.len(), "Discovered attributes");
        discovered
    } else {
        params.attrs.clone()
    };

    let mut history = Vec::with_capacity(attrs.len());
    for attr in attrs {
        let samples = state
            .store
            .find_samples(&partition, &base.for_attr(&attr))
            .await?;
        history.push((attr, samples));
    }

    response::render_keyed(format, &history)
}

/// Tenant notification history
#[instrument(skip(state, auth, headers, pairs), fields(tenant = %auth.tenant))]
async fn notification_history(
    State(state): State<AppState>,
    auth: AuthContext,
    headers: HeaderMap,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Response> {
    let format = negotiate(&headers)?;
    let partition = PartitionKey::notifications(&auth.tenant);
    require_partition(&state, &partition).await?;

    let query = query::translate_notifications(pairs)?;
    let records = state.store.find_notifications(&partition, &query).await?;
    response::render_notifications(format, &records)
}

/// Deprecated NGSI-like view of one attribute
#[instrument(skip(state, auth, pairs), fields(tenant = %auth.tenant))]
async fn sth_history(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((device_type, device_id, attr)): Path<(String, String, String)>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Response> {
    let partition = PartitionKey::resolve(&auth.tenant, &device_id);
    require_partition(&state, &partition).await?;

    let params = HistoryParams::from_pairs(pairs);
    let samples = state
        .store
        .find_samples(&partition, &query::translate(&params, Some(&attr))?)
        .await?;

    response::render_sth(&response::sth_envelope(
        &device_type,
        &device_id,
        &attr,
        &samples,
    ))
}

async fn get_log_level(State(state): State<AppState>, _auth: AuthContext) -> impl IntoResponse {
    Json(serde_json::json!({ "log_level": state.log_control.level().name() }))
}

async fn set_log_level(
    State(state): State<AppState>,
    _auth: AuthContext,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>> {
    let level: LogLevel = params
        .get("level")
        .map(String::as_str)
        .unwrap_or_default()
        .parse()?;

    state.log_control.set_level(level)?;
    info!(level = %level, "Log level changed");

    Ok(Json(serde_json::json!({ "new_log_level": level.name() })))
}

/// Shard a device partition on its hashed `attr` key. Meant to be called
/// once per partition.
#[instrument(skip(state, auth), fields(tenant = %auth.tenant))]
async fn enable_sharding(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(device_id): Path<String>,
) -> Result<Json<Value>> {
    let partition = PartitionKey::resolve(&auth.tenant, &device_id);
    state.indexes.enable_sharding(&partition).await?;

    Ok(Json(serde_json::json!({
        "partition": partition.as_str(),
        "sharded": true
    })))
}

/// Start the API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> anyhow::Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting history API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
