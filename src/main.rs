//! Entry point: load config, wire dependencies, and run the server.

use std::sync::Arc;
use std::time::Duration;

use liveview::config::Config;
use liveview::pubsub::{InMemoryPubSub, PubSub, RedisPubSub};
use liveview::session::JwtSessionSerializer;
use liveview::{create_app, AppState, Info, LiveView, Rendered, Socket, ViewRegistry};
use serde::Deserialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Default)]
struct Counter {
    count: i64,
    uptime: u64,
    note: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CounterEvent {
    Increment,
    Decrement,
    Reset,
}

/// Demo view at `/`: a shared counter page that also shows uptime and the
/// last message broadcast on the `counter` topic.
fn counter_view() -> LiveView<Counter, CounterEvent> {
    LiveView::new("counter", |socket: &Socket<Counter>| {
        let counter = socket.context();
        Ok(Rendered::builder()
            .text("<section><h1>Count: ")
            .dynamic(counter.count)
            .text("</h1><button phx-click=\"decrement\">-</button>")
            .text("<button phx-click=\"increment\">+</button>")
            .text("<button phx-click=\"reset\">reset</button><p>Up for ")
            .dynamic(counter.uptime)
            .text("s</p><p>")
            .dynamic(counter.note.as_deref().unwrap_or(""))
            .text("</p></section>")
            .build())
    })
    .on_mount(|mut socket, _params, _session| async move {
        socket.subscribe("counter");
        socket.repeat(Duration::from_secs(1), || ());
        Ok(socket)
    })
    .on_event(|mut socket, event| async move {
        match event {
            CounterEvent::Increment => socket.assign(|c| c.count += 1),
            CounterEvent::Decrement => socket.assign(|c| c.count -= 1),
            CounterEvent::Reset => socket.assign(|c| c.count = 0),
        }
        Ok(socket)
    })
    .on_info(|mut socket, info| async move {
        match info {
            Info::Local(()) => socket.assign(|c| c.uptime += 1),
            Info::Broadcast { data, .. } => {
                let note = data.to_string();
                socket.assign(|c| c.note = Some(note));
            }
        }
        Ok(socket)
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("config: {}", e))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let pubsub: Arc<dyn PubSub> = match &config.redis_url {
        Some(url) => {
            tracing::info!("pub/sub via redis");
            Arc::new(RedisPubSub::new(url)?)
        }
        None => Arc::new(InMemoryPubSub::new()),
    };
    let registry = ViewRegistry::new().route("/", counter_view());

    let state = AppState {
        app_key: config.app_key.clone(),
        registry: Arc::new(registry),
        sessions: Arc::new(JwtSessionSerializer::new(config.session_secret.clone())),
        pubsub,
        heartbeat_timeout: config.heartbeat_timeout,
    };

    let app = create_app(state);

    tracing::info!(addr = %config.server_addr, "listening");
    let listener = tokio::net::TcpListener::bind(config.server_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
