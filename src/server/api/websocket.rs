// src/server/api/websocket.rs

//! The websocket upgrade endpoint. Authentication happens inside the
//! session via panel-signed tokens; the only gate here is the origin
//! check against the panel URL and the configured allow-list.

use super::ApiError;
use crate::core::errors::HelmsmanError;
use crate::core::state::AgentState;
use crate::core::websocket::WebsocketSession;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, header};
use axum::response::Response;
use std::sync::Arc;
use url::Url;
use uuid::Uuid;

pub async fn upgrade(
    State(state): State<Arc<AgentState>>,
    Path(server): Path<Uuid>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let server = state.servers.get_or_err(server)?;

    if let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        if !origin_allowed(&state, origin) {
            return Err(HelmsmanError::InvalidRequest(
                "origin is not allowed to connect to this node".to_string(),
            )
            .into());
        }
    }

    let validator = state.validator.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        WebsocketSession::new(server, validator).run(socket).await;
    }))
}

/// An origin is allowed when it matches the panel URL's host or any
/// entry in the allow-list (`*` allows everything).
fn origin_allowed(state: &AgentState, origin: &str) -> bool {
    let config = state.config.get();

    let origin_host = Url::parse(origin)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string));
    let panel_host = Url::parse(&config.remote)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string));
    if origin_host.is_some() && origin_host == panel_host {
        return true;
    }

    config.allowed_origins.iter().any(|allowed| {
        allowed == "*" || Some(allowed.as_str()) == origin_host.as_deref() || allowed == origin
    })
}
