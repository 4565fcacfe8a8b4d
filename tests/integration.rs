//! Integration tests over the HTTP surface: health, disconnected page render,
//! broadcast (app key).
//!
//! Run with `cargo test`. Nothing here needs external services.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use liveview::pubsub::{InMemoryPubSub, PubSub};
use liveview::session::{JwtSessionSerializer, SessionSerializer};
use liveview::{create_app, AppState, LiveView, Rendered, Socket, ViewRegistry};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

const APP_KEY: &str = "test-key";
const SECRET: &str = "test-session-secret";

#[derive(Default)]
struct Greeting {
    name: String,
}

fn greeter() -> LiveView<Greeting, Value> {
    LiveView::new("greeter", |socket: &Socket<Greeting>| {
        Ok(Rendered::builder()
            .text("<h1>Hello, ")
            .dynamic(socket.context().name.as_str())
            .text("!</h1>")
            .build())
    })
    .on_params(|mut socket, params, _url| async move {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("stranger")
            .to_string();
        socket.assign(|g| g.name = name);
        Ok(socket)
    })
}

fn test_state(pubsub: Arc<InMemoryPubSub>) -> AppState {
    AppState {
        app_key: APP_KEY.to_string(),
        registry: Arc::new(ViewRegistry::new().route("/hello", greeter())),
        sessions: Arc::new(JwtSessionSerializer::new(SECRET.to_string())),
        pubsub,
        heartbeat_timeout: Duration::from_secs(60),
    }
}

async fn body_string(res: axum::response::Response) -> String {
    let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

fn attr<'a>(html: &'a str, marker: &str) -> &'a str {
    let start = html.find(marker).unwrap() + marker.len();
    let len = html[start..].find('"').unwrap();
    &html[start..start + len]
}

#[tokio::test]
async fn health_returns_ok() {
    let app = create_app(test_state(Arc::new(InMemoryPubSub::new())));
    let req = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let json: Value = serde_json::from_str(&body_string(res).await).unwrap();
    assert_eq!(json.get("status").and_then(|v| v.as_str()), Some("ok"));
}

#[tokio::test]
async fn page_embeds_render_session_and_csrf() {
    let app = create_app(test_state(Arc::new(InMemoryPubSub::new())));
    let req = Request::builder()
        .uri("/hello?name=%3Cb%3EAda")
        .body(Body::empty())
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let html = body_string(res).await;

    assert!(html.contains("<h1>Hello, &lt;b&gt;Ada!</h1>"), "{html}");
    assert!(html.contains(r#"id="phx-rendered""#));

    let csrf = attr(&html, r#"<meta name="csrf-token" content=""#);
    let token = attr(&html, r#"data-phx-session=""#);
    let session = JwtSessionSerializer::new(SECRET.to_string())
        .deserialize(token)
        .await
        .unwrap();
    assert_eq!(session.csrf_token, csrf);
}

#[tokio::test]
async fn unknown_path_is_not_found() {
    let app = create_app(test_state(Arc::new(InMemoryPubSub::new())));
    let req = Request::builder()
        .uri("/nowhere")
        .body(Body::empty())
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn broadcast_requires_app_key() {
    let pubsub = Arc::new(InMemoryPubSub::new());
    let app = create_app(test_state(pubsub.clone()));
    let body = serde_json::json!({ "topic": "news", "data": { "headline": "hi" } });

    let req = Request::builder()
        .method("POST")
        .uri("/api/broadcast")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let res = app.clone().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    pubsub
        .subscribe("news", Arc::new(move |data| sink.lock().unwrap().push(data)))
        .await
        .unwrap();

    let req = Request::builder()
        .method("POST")
        .uri("/api/broadcast")
        .header("content-type", "application/json")
        .header("x-app-key", APP_KEY)
        .body(Body::from(body.to_string()))
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let json: Value = serde_json::from_str(&body_string(res).await).unwrap();
    assert_eq!(json["subscriber_count"], 1);
    assert_eq!(seen.lock().unwrap().len(), 1);
}
