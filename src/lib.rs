//! Server-driven reactive UI engine built with Rust.
//!
//! Views render to template trees; after the first render only the changed
//! dynamic slots travel to the browser over a WebSocket. Connections are
//! sequential actors fed by client events, pub/sub broadcasts and timers.

pub mod changeset;
pub mod config;
pub mod error;
pub mod handlers;
pub mod live;
pub mod models;
pub mod pubsub;
pub mod services;
pub mod session;
pub mod template;
pub mod uploads;

pub use changeset::Changeset;
pub use config::Config;
pub use error::{LiveError, ProtocolError, ViewError};
pub use handlers::http::AppState;
pub use live::{Info, LiveView, Socket};
pub use pubsub::{InMemoryPubSub, PubSub, RedisPubSub};
pub use services::{MessageRouter, ViewRegistry};
pub use session::{JwtSessionSerializer, Session, SessionSerializer};
pub use template::{diff, Dynamic, Patch, Rendered};

use axum::routing::{get, post};
use handlers::http;
use tower_http::trace::TraceLayer;

/// Build the app router (socket, broadcast, health, pages). Used by main and by integration tests.
pub fn create_app(state: AppState) -> axum::Router {
    axum::Router::new()
        .route(http::SOCKET_PATH, get(handlers::ws_handler))
        .route("/api/broadcast", post(handlers::broadcast))
        .route("/health", get(http::health))
        .fallback(http::live_page)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
