//! Socket protocol tests: drive a `MessageRouter` with raw frames and read
//! what it writes to the outbox.
//!
//! The Redis test runs only when `TEST_REDIS_URL` is set.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use liveview::live::Outbox;
use liveview::models::Frame;
use liveview::pubsub::{Callback, InMemoryPubSub, PubSub, RedisPubSub};
use liveview::session::{JwtSessionSerializer, Session, SessionSerializer};
use liveview::uploads::UploadOptions;
use liveview::{Info, LiveView, MessageRouter, Rendered, Socket, ViewError, ViewRegistry};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::timeout;

const SECRET: &str = "protocol-test-secret";

struct Harness {
    router: MessageRouter,
    rx: UnboundedReceiver<Frame>,
    sessions: JwtSessionSerializer,
    pubsub: Arc<InMemoryPubSub>,
}

impl Harness {
    fn new(registry: ViewRegistry) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let sessions = JwtSessionSerializer::new(SECRET.to_string());
        let pubsub = Arc::new(InMemoryPubSub::new());
        let router = MessageRouter::new(
            Arc::new(registry),
            Arc::new(sessions.clone()),
            pubsub.clone(),
            Outbox::new(tx),
        );
        Self {
            router,
            rx,
            sessions,
            pubsub,
        }
    }

    async fn send(&mut self, frame: Value) {
        self.router.handle_text(&frame.to_string()).await;
    }

    async fn next(&mut self) -> Frame {
        timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("outbox closed")
    }

    async fn assert_quiet(&mut self, millis: u64) {
        if let Ok(Some(frame)) = timeout(Duration::from_millis(millis), self.rx.recv()).await {
            panic!("unexpected frame {:?}", frame);
        }
    }

    async fn join(&mut self, topic: &str, url: &str) -> Frame {
        self.send_join(topic, url).await;
        self.next().await
    }

    async fn send_join(&mut self, topic: &str, url: &str) {
        let session = Session::new();
        let token = self.sessions.serialize(&session).await.unwrap();
        self.send(json!([
            "1",
            "1",
            topic,
            "phx_join",
            { "session": token, "url": url, "params": { "_csrf_token": session.csrf_token } }
        ]))
        .await;
    }

    async fn event(&mut self, topic: &str, payload: Value) {
        self.send(json!(["1", "2", topic, "event", payload])).await;
    }
}

#[derive(Default)]
struct Counter {
    count: i64,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CounterEvent {
    Increment,
    Boom,
    Away { to: String },
}

fn counter_view() -> LiveView<Counter, CounterEvent> {
    LiveView::new("counter", |socket: &Socket<Counter>| {
        Ok(Rendered::builder()
            .text("<p>Count: ")
            .dynamic(socket.context().count)
            .text("</p>")
            .build())
    })
    .on_event(|mut socket, event| async move {
        match event {
            CounterEvent::Increment => socket.assign(|c| c.count += 1),
            CounterEvent::Boom => return Err(ViewError::msg("boom")),
            CounterEvent::Away { to } => socket.push_redirect(to, true),
        }
        Ok(socket)
    })
}

#[tokio::test]
async fn increments_push_only_the_changed_slot() {
    let mut h = Harness::new(ViewRegistry::new().route("/counter", counter_view()));

    let reply = h.join("lv:counter", "/counter").await;
    assert_eq!(reply.event, "phx_reply");
    assert_eq!(reply.payload["status"], "ok");
    assert_eq!(
        reply.payload["response"]["rendered"],
        json!({ "s": ["<p>Count: ", "</p>"], "0": "0" })
    );

    for expected in ["1", "2", "3"] {
        h.event("lv:counter", json!({ "type": "increment" })).await;
        let diff = h.next().await;
        assert_eq!(diff.event, "diff");
        assert_eq!(diff.payload, json!({ "0": expected }));
    }
    h.assert_quiet(50).await;
}

#[tokio::test]
async fn heartbeat_is_answered_directly() {
    let mut h = Harness::new(ViewRegistry::new());
    h.send(json!([null, "7", "phoenix", "heartbeat", {}])).await;
    let reply = h.next().await;
    assert_eq!(reply.event, "phx_reply");
    assert_eq!(reply.msg_ref.as_deref(), Some("7"));
    assert_eq!(reply.payload["status"], "ok");
}

#[derive(Default)]
struct Sleepy;

fn sleepy_view() -> LiveView<Sleepy, Value> {
    LiveView::new("sleepy", |_socket: &Socket<Sleepy>| {
        Ok(Rendered::builder().text("<p>zzz</p>").build())
    })
    .on_event(|socket, _event| async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(socket)
    })
}

#[tokio::test]
async fn slow_leave_does_not_hold_up_heartbeats() {
    let mut h = Harness::new(ViewRegistry::new().route("/sleepy", sleepy_view()));
    h.join("lv:sleepy", "/sleepy").await;

    h.event("lv:sleepy", json!({ "type": "nap" })).await;
    h.send(json!(["1", "3", "lv:sleepy", "phx_leave", {}])).await;
    let started = tokio::time::Instant::now();
    h.send(json!([null, "4", "phoenix", "heartbeat", {}])).await;

    let first = h.next().await;
    assert_eq!(first.msg_ref.as_deref(), Some("4"));
    assert!(started.elapsed() < Duration::from_millis(250));

    let leave = h.next().await;
    assert_eq!(leave.event, "phx_reply");
    assert_eq!(leave.msg_ref.as_deref(), Some("3"));
    assert_eq!(h.router.topics().count(), 0);
    h.router.shutdown().await;
}

#[tokio::test]
async fn protocol_errors_keep_the_connection_alive() {
    let mut h = Harness::new(ViewRegistry::new().route("/counter", counter_view()));
    h.join("lv:counter", "/counter").await;

    h.event("lv:nope", json!({ "type": "increment" })).await;
    let error = h.next().await;
    assert_eq!(error.event, "error");
    assert_eq!(error.topic, "lv:nope");
    assert_eq!(error.payload["reason"], "unknown_topic");

    h.router.handle_text("not json").await;
    let error = h.next().await;
    assert_eq!(error.topic, "phoenix");
    assert_eq!(error.payload["reason"], "malformed_frame");

    h.event("lv:counter", json!({ "type": "no_such_event" })).await;
    assert_eq!(h.next().await.payload["reason"], "invalid_payload");

    h.send(json!(["1", "3", "lv:counter", "wat", {}])).await;
    assert_eq!(h.next().await.payload["reason"], "unknown_event");

    h.event("lv:counter", json!({ "type": "increment" })).await;
    let diff = h.next().await;
    assert_eq!(diff.event, "diff");
    assert_eq!(diff.payload, json!({ "0": "1" }));
}

#[tokio::test]
async fn handler_failure_closes_the_connection() {
    let mut h = Harness::new(ViewRegistry::new().route("/counter", counter_view()));
    h.join("lv:counter", "/counter").await;

    h.event("lv:counter", json!({ "type": "boom" })).await;
    let error = h.next().await;
    assert_eq!(error.event, "error");
    assert_eq!(error.payload["reason"], "lifecycle_error");
    assert_eq!(error.payload["message"], "boom");

    h.event("lv:counter", json!({ "type": "increment" })).await;
    assert_eq!(h.next().await.payload["reason"], "unknown_topic");
}

#[tokio::test]
async fn push_redirect_sends_redirect_frame() {
    let mut h = Harness::new(ViewRegistry::new().route("/counter", counter_view()));
    h.join("lv:counter", "/counter").await;

    h.event("lv:counter", json!({ "type": "away", "to": "/login" })).await;
    let redirect = h.next().await;
    assert_eq!(redirect.event, "redirect");
    assert_eq!(redirect.payload, json!({ "to": "/login", "kind": "replace" }));
}

#[tokio::test]
async fn join_is_rejected_without_valid_session_and_csrf() {
    let mut h = Harness::new(ViewRegistry::new().route("/counter", counter_view()));

    let session = Session::new();
    let token = h.sessions.serialize(&session).await.unwrap();
    h.send(json!([
        "1", "1", "lv:a", "phx_join",
        { "session": token, "url": "/counter", "params": { "_csrf_token": "forged" } }
    ]))
    .await;
    assert_eq!(h.next().await.payload["reason"], "invalid_csrf");

    h.send(json!([
        "1", "1", "lv:a", "phx_join",
        { "session": "garbage", "url": "/counter", "params": {} }
    ]))
    .await;
    assert_eq!(h.next().await.payload["reason"], "invalid_session");

    let error = h.join("lv:a", "/missing").await;
    assert_eq!(error.payload["reason"], "unknown_view");

    h.send(json!(["1", "1", "lv:a", "phx_join", { "url": "/counter" }]))
        .await;
    assert_eq!(h.next().await.payload["reason"], "invalid_payload");

    assert_eq!(h.router.topics().count(), 0);
}

#[derive(Default)]
struct Room {
    last: String,
}

fn room_view(seen: Arc<Mutex<Vec<(String, Value)>>>) -> LiveView<Room, Value> {
    LiveView::new("room", |socket: &Socket<Room>| {
        Ok(Rendered::builder()
            .text("<p>")
            .dynamic(socket.context().last.as_str())
            .text("</p>")
            .build())
    })
    .on_mount(|mut socket, params, _session| async move {
        let room = params
            .get("room")
            .and_then(Value::as_str)
            .unwrap_or("lobby")
            .to_string();
        socket.subscribe(room);
        Ok(socket)
    })
    .on_info(move |mut socket, info| {
        let seen = seen.clone();
        async move {
            if let Info::Broadcast { data, .. } = info {
                seen.lock()
                    .unwrap()
                    .push((socket.url().to_string(), data.clone()));
                socket.assign(|room| room.last = data.to_string());
            }
            Ok(socket)
        }
    })
}

#[tokio::test]
async fn broadcast_reaches_only_subscribed_connections() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut h = Harness::new(ViewRegistry::new().route("/room", room_view(seen.clone())));
    h.join("lv:a", "/room?room=a").await;
    h.join("lv:b", "/room?room=b").await;

    let count = h.pubsub.broadcast("a", json!("hello")).await.unwrap();
    assert_eq!(count, 1);

    let diff = h.next().await;
    assert_eq!(diff.topic, "lv:a");
    assert_eq!(diff.payload, json!({ "0": "&quot;hello&quot;" }));
    h.assert_quiet(50).await;
    assert_eq!(
        *seen.lock().unwrap(),
        vec![("/room?room=a".to_string(), json!("hello"))]
    );

    h.send(json!(["1", "9", "lv:a", "phx_leave", {}])).await;
    let reply = h.next().await;
    assert_eq!(reply.event, "phx_reply");
    assert_eq!(h.pubsub.subscriber_count("a").await, 0);
    assert_eq!(h.pubsub.subscriber_count("b").await, 1);

    h.router.shutdown().await;
    assert_eq!(h.pubsub.subscriber_count("b").await, 0);
}

#[derive(Default)]
struct Clock {
    ticks: u32,
}

fn clock_view(mounts: Arc<AtomicUsize>) -> LiveView<Clock, Value, &'static str> {
    LiveView::new("clock", |socket: &Socket<Clock, &'static str>| {
        Ok(Rendered::builder()
            .text("<time>")
            .dynamic(socket.context().ticks)
            .text("</time>")
            .build())
    })
    .on_mount(move |mut socket, _params, _session| {
        mounts.fetch_add(1, Ordering::SeqCst);
        async move {
            socket.repeat(Duration::from_millis(10), || "tick");
            Ok(socket)
        }
    })
    .on_info(|mut socket, info| async move {
        if let Info::Local("tick") = info {
            socket.assign(|clock| clock.ticks += 1);
        }
        Ok(socket)
    })
}

#[tokio::test]
async fn timers_enqueue_info_until_leave() {
    let mounts = Arc::new(AtomicUsize::new(0));
    let mut h = Harness::new(ViewRegistry::new().route("/clock", clock_view(mounts.clone())));
    h.join("lv:clock", "/clock").await;

    assert_eq!(h.next().await.payload, json!({ "0": "1" }));
    assert_eq!(h.next().await.payload, json!({ "0": "2" }));

    h.send(json!(["1", "5", "lv:clock", "phx_leave", {}])).await;
    loop {
        let frame = h.next().await;
        if frame.event == "phx_reply" {
            assert_eq!(frame.msg_ref.as_deref(), Some("5"));
            break;
        }
        assert_eq!(frame.event, "diff");
    }
    h.assert_quiet(60).await;
    assert_eq!(mounts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejoin_replaces_the_previous_connection() {
    let mounts = Arc::new(AtomicUsize::new(0));
    let mut h = Harness::new(ViewRegistry::new().route("/clock", clock_view(mounts.clone())));
    h.join("lv:clock", "/clock").await;
    h.send_join("lv:clock", "/clock").await;
    let reply = loop {
        let frame = h.next().await;
        if frame.event == "phx_reply" {
            break frame;
        }
    };
    assert_eq!(reply.payload["response"]["rendered"]["0"], "0");
    assert_eq!(mounts.load(Ordering::SeqCst), 2);
    assert_eq!(h.router.topics().count(), 1);
    h.router.shutdown().await;
}

#[derive(Default)]
struct Gallery;

fn gallery_view() -> LiveView<Gallery, Value> {
    LiveView::new("gallery", |socket: &Socket<Gallery>| {
        let errors = socket
            .uploads()
            .get("photos")
            .map(|config| config.errors.join(","))
            .unwrap_or_default();
        let count = socket
            .uploads()
            .get("photos")
            .map_or(0, |config| config.entries.len());
        Ok(Rendered::builder()
            .text("<p>")
            .dynamic(count)
            .text("</p><p>")
            .dynamic(errors)
            .text("</p>")
            .build())
    })
    .on_mount(|mut socket, _params, _session| async move {
        socket
            .allow_upload(
                "photos",
                UploadOptions {
                    accept: vec![".png".to_string()],
                    max_entries: 2,
                    max_file_size: 1000,
                },
            )
            .map_err(|e| ViewError::msg(e.to_string()))?;
        Ok(socket)
    })
}

fn file(entry_ref: &str) -> Value {
    json!({ "ref": entry_ref, "name": format!("{entry_ref}.png"), "size": 500, "type": "image/png" })
}

#[tokio::test]
async fn upload_entry_limit_is_reported_and_cleared() {
    let mut h = Harness::new(ViewRegistry::new().route("/gallery", gallery_view()));
    h.join("lv:gallery", "/gallery").await;

    h.send(json!([
        "1", "2", "lv:gallery", "allow_upload",
        { "name": "photos", "entries": [file("e1"), file("e2"), file("e3")] }
    ]))
    .await;
    let diff = h.next().await;
    assert_eq!(diff.payload, json!({ "0": "3", "1": "Too many files" }));

    h.send(json!(["1", "3", "lv:gallery", "cancel_upload", { "name": "photos", "ref": "e1" }]))
        .await;
    let diff = h.next().await;
    assert_eq!(diff.payload, json!({ "0": "2", "1": "" }));

    h.send(json!(["1", "4", "lv:gallery", "cancel_upload", { "name": "photos", "ref": "e3" }]))
        .await;
    assert_eq!(h.next().await.payload, json!({ "0": "1" }));

    h.send(json!([
        "1", "5", "lv:gallery", "allow_upload",
        { "name": "photos", "entries": [file("e3")] }
    ]))
    .await;
    assert_eq!(h.next().await.payload, json!({ "0": "2" }));

    h.send(json!(["1", "6", "lv:gallery", "progress", { "name": "videos", "ref": "e2", "progress": 10 }]))
        .await;
    assert_eq!(h.next().await.payload["reason"], "invalid_payload");
}

#[tokio::test]
async fn redis_pubsub_round_trip() {
    let redis_url = match std::env::var("TEST_REDIS_URL") {
        Ok(u) => u,
        Err(_) => {
            eprintln!("Skip redis test: set TEST_REDIS_URL");
            return;
        }
    };
    let pubsub = RedisPubSub::new(&redis_url).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let callback: Callback = Arc::new(move |data| {
        let _ = tx.send(data);
    });
    let topic = format!("test-{}", uuid::Uuid::new_v4());
    let id = pubsub.subscribe(&topic, callback).await.unwrap();

    pubsub.broadcast(&topic, json!({ "n": 1 })).await.unwrap();
    let data = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for redis message")
        .unwrap();
    assert_eq!(data, json!({ "n": 1 }));

    pubsub.unsubscribe(&topic, id).await.unwrap();
}
