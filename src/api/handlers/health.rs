//! Liveness probe with build information.

use crate::GIT_COMMIT_HASH;
use crate::api::state::AppState;
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{Instrument, debug, error, info_span};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    /// `ok` or `error`, from a round trip to the credential store.
    store: String,
    issuer: String,
}

impl Health {
    fn new(issuer: &str, store_ok: bool) -> Self {
        Self {
            commit: GIT_COMMIT_HASH.to_string(),
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            store: if store_ok { "ok" } else { "error" }.to_string(),
            issuer: issuer.to_string(),
        }
    }

    /// `name:version:short-commit`, empty commit outside a git checkout.
    fn app_header(&self) -> Option<HeaderValue> {
        let short_hash = self.commit.get(..7).unwrap_or_default();
        HeaderValue::from_str(&format!("{}:{}:{short_hash}", self.name, self.version))
            .map_err(|err| error!("Failed to build X-App header: {err}"))
            .ok()
    }
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Store is reachable", body = Health),
        (status = 503, description = "Store is unreachable", body = Health)
    ),
    tag = "health"
)]
pub async fn health(method: Method, state: Extension<Arc<AppState>>) -> Response {
    let ping_span = info_span!("db.ping", db.operation = "PING");
    let store_ok = match state.store().ping().instrument(ping_span).await {
        Ok(()) => true,
        Err(err) => {
            error!("Failed to ping store: {err}");
            false
        }
    };
    let health = Health::new(state.config().issuer(), store_ok);

    let mut headers = HeaderMap::new();
    if let Some(value) = health.app_header() {
        debug!("X-App header: {value:?}");
        headers.insert("X-App", value);
    }
    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    // OPTIONS gets the headers only.
    if method == Method::GET {
        (status, headers, Json(health)).into_response()
    } else {
        (status, headers, Body::empty()).into_response()
    }
}
