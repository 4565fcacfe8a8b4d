//! HTTP handlers: the disconnected page render, broadcast trigger and health.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{OriginalUri, State},
    http::{HeaderMap, StatusCode},
    response::Html,
    Json,
};
use serde_json::json;
use tracing::{debug, info};

use crate::error::{LiveError, LiveResult};
use crate::live::{query_params, MountRequest};
use crate::models::BroadcastRequest;
use crate::pubsub::PubSub;
use crate::services::ViewRegistry;
use crate::session::{Session, SessionSerializer};
use crate::template::{escape_html, Rendered};

/// Shared application state for HTTP and WS.
#[derive(Clone)]
pub struct AppState {
    pub app_key: String,
    pub registry: Arc<ViewRegistry>,
    pub sessions: Arc<dyn SessionSerializer>,
    pub pubsub: Arc<dyn PubSub>,
    pub heartbeat_timeout: Duration,
}

const HEADER_APP_KEY: &str = "x-app-key";
pub const SOCKET_PATH: &str = "/live/websocket";

/// POST /api/broadcast. Requires header `x-app-key: <app_key>`.
pub async fn broadcast(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<BroadcastRequest>,
) -> LiveResult<Json<serde_json::Value>> {
    let key = headers
        .get(HEADER_APP_KEY)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if key.is_empty() || key != state.app_key {
        return Err(LiveError::Auth("invalid or missing x-app-key".to_string()));
    }

    let count = state.pubsub.broadcast(&body.topic, body.data).await?;
    info!(topic = %body.topic, count, "broadcast via http");

    Ok(Json(json!({
        "ok": true,
        "topic": body.topic,
        "subscriber_count": count
    })))
}

/// Fallback route: mount the view registered for the request path in
/// disconnected mode and return the full page with its session token.
pub async fn live_page(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
) -> LiveResult<Html<String>> {
    let url = uri.to_string();
    let view = state
        .registry
        .get(&url)
        .ok_or_else(|| LiveError::NotFound(uri.path().to_string()))?;

    let session = Session::new();
    let token = state.sessions.serialize(&session).await?;
    let csrf_token = session.csrf_token.clone();
    let rendered = view
        .render_disconnected(MountRequest {
            params: query_params(&url),
            session,
            url: url.clone(),
        })
        .await?;
    debug!(url = %url, view = %view.name(), "rendered page");

    Ok(Html(page(view.name(), &csrf_token, &token, &rendered)?))
}

fn page(title: &str, csrf_token: &str, session_token: &str, rendered: &Rendered) -> LiveResult<String> {
    // `</` inside a script block would end it early
    let tree = serde_json::to_string(rendered)?.replace("</", "<\\/");
    Ok(format!(
        "<!doctype html>\
<html><head><meta charset=\"utf-8\">\
<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
<meta name=\"csrf-token\" content=\"{csrf}\">\
<title>{title}</title>\
</head><body>\
<div id=\"phx-root\" data-phx-main data-phx-session=\"{session}\" data-phx-socket=\"{socket}\">{body}</div>\
<script id=\"phx-rendered\" type=\"application/json\">{tree}</script>\
</body></html>",
        csrf = escape_html(csrf_token),
        title = escape_html(title),
        session = escape_html(session_token),
        socket = SOCKET_PATH,
        body = rendered.to_html(),
        tree = tree,
    ))
}

/// GET /health: liveness probe.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "service": "liveview" })),
    )
}
