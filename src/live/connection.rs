//! Per-connection actor. All inputs (client events, pub/sub broadcasts, timer
//! ticks, navigation) go through one queue and are handled to completion in
//! arrival order, so a view's context only ever has one writer.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::outbox::Outbox;
use super::socket::{Command, Socket};
use super::view::{JoinRequest, Joined, LiveView, Mailbox, MountRequest, Params};
use crate::error::{ProtocolError, ViewError, ViewResult};
use crate::models::{
    AllowUploadPayload, CancelUploadPayload, Frame, ProgressPayload, DIFF, LIFECYCLE_ERROR,
    LIVE_PATCH, REDIRECT,
};
use crate::pubsub::{Callback, PubSub, SubscriptionId};
use crate::template::{diff, Patch, Rendered};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initializing,
    DisconnectedRendered,
    Connected,
    ShuttingDown,
}

/// Messages delivered to `handle_info`.
#[derive(Debug, Clone)]
pub enum Info<I> {
    /// A pub/sub broadcast on a topic the view subscribed to.
    Broadcast { topic: String, data: Value },
    /// A message produced by a `repeat` timer.
    Local(I),
}

/// Client frames the router forwards to a joined connection.
#[derive(Debug)]
pub enum ClientInput {
    Event {
        msg_ref: Option<String>,
        payload: Value,
    },
    LivePatch {
        url: String,
    },
    AllowUpload {
        msg_ref: Option<String>,
        payload: AllowUploadPayload,
    },
    UploadProgress {
        msg_ref: Option<String>,
        payload: ProgressPayload,
    },
    CancelUpload(CancelUploadPayload),
    Leave,
}

pub(crate) enum Input<I> {
    Client(ClientInput),
    Info(Info<I>),
}

struct Inbox<I>(UnboundedSender<Input<I>>);

impl<I: Send + 'static> Mailbox for Inbox<I> {
    fn deliver(&self, input: ClientInput) -> bool {
        self.0.send(Input::Client(input)).is_ok()
    }

    fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

enum Navigation {
    Patch { to: String, replace: bool },
    Redirect { to: String, replace: bool },
}

/// Query string of `url` as a params map. Relative URLs are resolved against
/// a placeholder origin.
pub(crate) fn query_params(url: &str) -> Params {
    let mut params = Params::new();
    if let Some(parsed) = parse_url(url) {
        for (key, value) in parsed.query_pairs() {
            params.insert(key.into_owned(), Value::String(value.into_owned()));
        }
    }
    params
}

pub(crate) fn parse_url(url: &str) -> Option<Url> {
    Url::parse(url)
        .or_else(|_| Url::parse(&format!("http://localhost{url}")))
        .ok()
}

/// `mount` then `handle_params`. Shared by both paths so the connected mount
/// reproduces the disconnected context before any connected-only effect runs.
async fn mount_socket<C, E, I>(
    view: &LiveView<C, E, I>,
    mut socket: Socket<C, I>,
    request: MountRequest,
) -> ViewResult<Socket<C, I>>
where
    C: Default + Send + 'static,
    E: DeserializeOwned + Send + 'static,
    I: Send + 'static,
{
    if let Some(mount) = view.mount.clone() {
        socket = mount(socket, request.params, request.session).await?;
    }
    if let Some(handle_params) = view.handle_params.clone() {
        let params = query_params(&request.url);
        socket = handle_params(socket, params, request.url).await?;
    }
    Ok(socket)
}

pub(crate) async fn render_disconnected<C, E, I>(
    view: &LiveView<C, E, I>,
    request: MountRequest,
) -> ViewResult<Rendered>
where
    C: Default + Send + 'static,
    E: DeserializeOwned + Send + 'static,
    I: Send + 'static,
{
    let id = Uuid::new_v4().to_string();
    debug!(conn_id = %id, view = %view.name, state = ?ConnectionState::Initializing, "mounting");
    let socket = Socket::new(id.clone(), false, request.url.clone());
    let socket = mount_socket(view, socket, request).await?;
    let rendered = (view.render)(&socket)?;
    debug!(conn_id = %id, view = %view.name, state = ?ConnectionState::DisconnectedRendered, "rendered");
    Ok(rendered)
}

pub(crate) fn spawn<C, E, I>(view: LiveView<C, E, I>, request: JoinRequest) -> Joined
where
    C: Default + Send + 'static,
    E: DeserializeOwned + Send + 'static,
    I: Send + 'static,
{
    let JoinRequest {
        topic,
        join_ref,
        msg_ref,
        mount,
        pubsub,
        outbox,
    } = request;
    let (tx, rx) = mpsc::unbounded_channel();
    let connection = Connection {
        id: Uuid::new_v4().to_string(),
        view,
        topic,
        join_ref,
        state: ConnectionState::Initializing,
        socket: None,
        last_render: None,
        pubsub,
        outbox,
        inbox: tx.downgrade(),
        subscriptions: Vec::new(),
        timers: Vec::new(),
    };
    let task = tokio::spawn(connection.run(msg_ref, mount, rx));
    Joined {
        mailbox: Box::new(Inbox(tx)),
        task,
    }
}

struct Connection<C, E, I> {
    id: String,
    view: LiveView<C, E, I>,
    topic: String,
    join_ref: Option<String>,
    state: ConnectionState,
    socket: Option<Socket<C, I>>,
    last_render: Option<Rendered>,
    pubsub: Arc<dyn PubSub>,
    outbox: Outbox,
    /// Weak so timers and pub/sub callbacks never keep a dead connection alive.
    inbox: WeakUnboundedSender<Input<I>>,
    subscriptions: Vec<(String, SubscriptionId)>,
    timers: Vec<JoinHandle<()>>,
}

impl<C, E, I> Connection<C, E, I>
where
    C: Default + Send + 'static,
    E: DeserializeOwned + Send + 'static,
    I: Send + 'static,
{
    async fn run(
        mut self,
        msg_ref: Option<String>,
        request: MountRequest,
        mut rx: UnboundedReceiver<Input<I>>,
    ) {
        info!(conn_id = %self.id, topic = %self.topic, view = %self.view.name, "joining");
        match self.join(msg_ref.clone(), request).await {
            Ok(()) => {
                while let Some(input) = rx.recv().await {
                    let result = match input {
                        Input::Client(ClientInput::Leave) => break,
                        Input::Client(input) => self.handle_client(input).await,
                        Input::Info(info) => self.handle_info(info).await,
                    };
                    if let Err(error) = result {
                        rx.close();
                        self.fail(None, &error);
                        break;
                    }
                }
            }
            Err(error) => {
                rx.close();
                self.fail(msg_ref, &error);
            }
        }
        self.shutdown(&mut rx).await;
    }

    async fn join(&mut self, msg_ref: Option<String>, request: MountRequest) -> ViewResult<()> {
        let view = self.view.clone();
        let socket = Socket::new(self.id.clone(), true, request.url.clone());
        let mut socket = mount_socket(&view, socket, request).await?;
        socket.take_changed();
        let rendered = (view.render)(&socket)?;
        let commands = socket.take_commands();
        self.socket = Some(socket);

        let navigation = self.apply_commands(commands).await;
        let tree = serde_json::to_value(&rendered).map_err(anyhow::Error::from)?;
        self.outbox.push(Frame::ok(
            self.join_ref.clone(),
            msg_ref,
            &self.topic,
            json!({ "rendered": tree }),
        ));
        self.last_render = Some(rendered);
        self.transition(ConnectionState::Connected);

        if self.navigate(navigation).await? {
            self.settle().await?;
        }
        Ok(())
    }

    async fn handle_client(&mut self, input: ClientInput) -> ViewResult<()> {
        match input {
            ClientInput::Event { msg_ref, payload } => {
                let Some(handler) = self.view.handle_event.clone() else {
                    self.reject(msg_ref, ProtocolError::NoHandler("event"));
                    return Ok(());
                };
                let event: E = match serde_json::from_value(payload) {
                    Ok(event) => event,
                    Err(e) => {
                        self.reject(msg_ref, ProtocolError::InvalidPayload(e.to_string()));
                        return Ok(());
                    }
                };
                let socket = self.take_socket()?;
                self.socket = Some(handler(socket, event).await?);
            }
            ClientInput::LivePatch { url } => self.run_params(url).await?,
            ClientInput::AllowUpload { msg_ref, payload } => {
                let added = self
                    .socket_mut()?
                    .uploads_mut()
                    .add_entries(&payload.name, payload.entries);
                if let Err(e) = added {
                    self.reject(msg_ref, ProtocolError::InvalidPayload(e.to_string()));
                    return Ok(());
                }
                self.socket_mut()?.mark_changed();
            }
            ClientInput::UploadProgress { msg_ref, payload } => {
                let updated = self.socket_mut()?.uploads_mut().update_progress(
                    &payload.name,
                    &payload.entry_ref,
                    payload.progress,
                );
                match updated {
                    Ok(true) => self.socket_mut()?.mark_changed(),
                    Ok(false) => {}
                    Err(e) => {
                        self.reject(msg_ref, ProtocolError::InvalidPayload(e.to_string()));
                        return Ok(());
                    }
                }
            }
            ClientInput::CancelUpload(payload) => {
                let socket = self.socket_mut()?;
                if socket
                    .uploads_mut()
                    .cancel(&payload.name, &payload.entry_ref)
                    .is_some()
                {
                    socket.mark_changed();
                }
            }
            ClientInput::Leave => return Ok(()),
        }
        self.settle().await
    }

    async fn handle_info(&mut self, info: Info<I>) -> ViewResult<()> {
        let Some(handler) = self.view.handle_info.clone() else {
            debug!(conn_id = %self.id, "no info handler, message dropped");
            return Ok(());
        };
        let socket = self.take_socket()?;
        self.socket = Some(handler(socket, info).await?);
        self.settle().await
    }

    /// Push the diff for any assign, then apply recorded commands. A
    /// `push_patch` runs `handle_params`, which may assign again, so loop.
    async fn settle(&mut self) -> ViewResult<()> {
        loop {
            let socket = self.socket_mut()?;
            let changed = socket.take_changed();
            let commands = socket.take_commands();
            if changed {
                self.push_diff()?;
            }
            let navigation = self.apply_commands(commands).await;
            if !self.navigate(navigation).await? {
                return Ok(());
            }
        }
    }

    fn push_diff(&mut self) -> ViewResult<()> {
        let socket = self.socket.as_ref().ok_or_else(not_mounted)?;
        let next = (self.view.render)(socket)?;
        let patch = match &self.last_render {
            Some(previous) => diff(previous, &next),
            None => Patch::Replace(next.clone()),
        };
        self.last_render = Some(next);
        if patch.is_empty() {
            debug!(conn_id = %self.id, "render produced no changes");
            return Ok(());
        }
        let payload = serde_json::to_value(&patch).map_err(anyhow::Error::from)?;
        self.outbox
            .push(Frame::push(self.join_ref.clone(), &self.topic, DIFF, payload));
        Ok(())
    }

    async fn run_params(&mut self, url: String) -> ViewResult<()> {
        let mut socket = self.take_socket()?;
        socket.set_url(url.clone());
        if let Some(handler) = self.view.handle_params.clone() {
            socket = handler(socket, query_params(&url), url).await?;
        }
        self.socket = Some(socket);
        Ok(())
    }

    /// Apply subscriptions and timers now; hand navigation back to the caller,
    /// which has to order it after any reply.
    async fn apply_commands(&mut self, commands: Vec<Command<I>>) -> Vec<Navigation> {
        let mut navigation = Vec::new();
        for command in commands {
            match command {
                Command::Subscribe(topic) => self.subscribe(topic).await,
                Command::Repeat { every, make } => self.start_timer(every, make),
                Command::PushPatch { to, replace } => {
                    navigation.push(Navigation::Patch { to, replace })
                }
                Command::PushRedirect { to, replace } => {
                    navigation.push(Navigation::Redirect { to, replace })
                }
            }
        }
        navigation
    }

    /// Returns whether any patch ran `handle_params`.
    async fn navigate(&mut self, navigation: Vec<Navigation>) -> ViewResult<bool> {
        let mut patched = false;
        for step in navigation {
            match step {
                Navigation::Redirect { to, replace } => {
                    info!(conn_id = %self.id, to = %to, "redirecting");
                    self.outbox.push(Frame::push(
                        self.join_ref.clone(),
                        &self.topic,
                        REDIRECT,
                        navigation_payload(&to, replace),
                    ));
                }
                Navigation::Patch { to, replace } => {
                    self.outbox.push(Frame::push(
                        self.join_ref.clone(),
                        &self.topic,
                        LIVE_PATCH,
                        navigation_payload(&to, replace),
                    ));
                    self.run_params(to).await?;
                    patched = true;
                }
            }
        }
        Ok(patched)
    }

    async fn subscribe(&mut self, topic: String) {
        if self.subscriptions.iter().any(|(t, _)| *t == topic) {
            debug!(conn_id = %self.id, topic = %topic, "already subscribed");
            return;
        }
        let inbox = self.inbox.clone();
        let source = topic.clone();
        let callback: Callback = Arc::new(move |data| {
            if let Some(tx) = inbox.upgrade() {
                let _ = tx.send(Input::Info(Info::Broadcast {
                    topic: source.clone(),
                    data,
                }));
            }
        });
        let pubsub = self.pubsub.clone();
        match pubsub.subscribe(&topic, callback).await {
            Ok(id) => {
                info!(conn_id = %self.id, topic = %topic, "subscribed");
                self.subscriptions.push((topic, id));
            }
            Err(e) => warn!(conn_id = %self.id, topic = %topic, error = %e, "subscribe failed"),
        }
    }

    fn start_timer(&mut self, every: Duration, make: Arc<dyn Fn() -> I + Send + Sync>) {
        let every = every.max(Duration::from_millis(1));
        let inbox = self.inbox.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(tx) = inbox.upgrade() else { break };
                if tx.send(Input::Info(Info::Local(make()))).is_err() {
                    break;
                }
            }
        });
        debug!(conn_id = %self.id, every_ms = every.as_millis() as u64, "timer registered");
        self.timers.push(handle);
    }

    fn reject(&self, msg_ref: Option<String>, error: ProtocolError) {
        warn!(conn_id = %self.id, topic = %self.topic, reason = error.code(), "rejected input: {}", error);
        self.outbox.push(Frame::error(
            self.join_ref.clone(),
            msg_ref,
            &self.topic,
            error.code(),
            error.to_string(),
        ));
    }

    fn fail(&self, msg_ref: Option<String>, error: &ViewError) {
        warn!(conn_id = %self.id, topic = %self.topic, error = %error, "view failed, closing connection");
        self.outbox.push(Frame::error(
            self.join_ref.clone(),
            msg_ref,
            &self.topic,
            LIFECYCLE_ERROR,
            error.to_string(),
        ));
    }

    /// Timers and subscriptions go first, then the view's own shutdown hook.
    /// Anything still queued is dropped.
    async fn shutdown(&mut self, rx: &mut UnboundedReceiver<Input<I>>) {
        self.transition(ConnectionState::ShuttingDown);
        rx.close();
        for timer in self.timers.drain(..) {
            timer.abort();
        }
        let pubsub = self.pubsub.clone();
        for (topic, id) in std::mem::take(&mut self.subscriptions) {
            match pubsub.unsubscribe(&topic, id).await {
                Ok(()) => debug!(conn_id = %self.id, topic = %topic, "unsubscribed"),
                Err(e) => warn!(conn_id = %self.id, topic = %topic, error = %e, "unsubscribe failed"),
            }
        }
        if let (Some(handler), Some(socket)) = (self.view.shutdown.clone(), self.socket.take()) {
            handler(socket).await;
        }
        let mut dropped = 0usize;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        info!(conn_id = %self.id, topic = %self.topic, dropped, "connection closed");
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(conn_id = %self.id, topic = %self.topic, from = ?self.state, to = ?next, "state transition");
        self.state = next;
    }

    fn socket_mut(&mut self) -> ViewResult<&mut Socket<C, I>> {
        self.socket.as_mut().ok_or_else(not_mounted)
    }

    fn take_socket(&mut self) -> ViewResult<Socket<C, I>> {
        self.socket.take().ok_or_else(not_mounted)
    }
}

fn not_mounted() -> ViewError {
    ViewError::msg("socket is not mounted")
}

fn navigation_payload(to: &str, replace: bool) -> Value {
    json!({ "to": to, "kind": if replace { "replace" } else { "push" } })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::InMemoryPubSub;
    use crate::session::Session;
    use crate::template::Rendered;
    use serde::Deserialize;

    #[derive(Default)]
    struct Page {
        tab: String,
        mounts: u32,
    }

    #[derive(Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    enum PageEvent {
        Go { tab: String },
    }

    fn page_view() -> LiveView<Page, PageEvent> {
        LiveView::new("page", |socket: &Socket<Page>| {
            Ok(Rendered::builder()
                .text("<nav>")
                .dynamic(socket.context().tab.as_str())
                .text("</nav><!-- ")
                .dynamic(socket.context().mounts)
                .text(" -->")
                .build())
        })
        .on_mount(|mut socket, _params, _session| async move {
            socket.assign(|page| page.mounts += 1);
            Ok(socket)
        })
        .on_params(|mut socket, params, _url| async move {
            let tab = params
                .get("tab")
                .and_then(Value::as_str)
                .unwrap_or("home")
                .to_string();
            socket.assign(|page| page.tab = tab);
            Ok(socket)
        })
        .on_event(|mut socket, event| async move {
            match event {
                PageEvent::Go { tab } => socket.push_patch(format!("/?tab={tab}"), false),
            }
            Ok(socket)
        })
    }

    fn request(url: &str) -> MountRequest {
        MountRequest {
            params: query_params(url),
            session: Session::new(),
            url: url.to_string(),
        }
    }

    #[test]
    fn query_params_from_relative_url() {
        let params = query_params("/items?page=2&q=a%20b");
        assert_eq!(params.get("page"), Some(&json!("2")));
        assert_eq!(params.get("q"), Some(&json!("a b")));
        assert!(query_params("/").is_empty());
    }

    #[tokio::test]
    async fn disconnected_render_runs_params() {
        let view = page_view();
        let rendered = render_disconnected(&view, request("/?tab=settings"))
            .await
            .unwrap();
        assert_eq!(rendered.to_html(), "<nav>settings</nav><!-- 1 -->");
    }

    #[tokio::test]
    async fn push_patch_sends_live_patch_then_diff() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let joined = spawn(
            page_view(),
            JoinRequest {
                topic: "lv:page".to_string(),
                join_ref: Some("1".to_string()),
                msg_ref: Some("1".to_string()),
                mount: request("/"),
                pubsub: Arc::new(InMemoryPubSub::new()),
                outbox: Outbox::new(tx),
            },
        );

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.event, "phx_reply");
        assert_eq!(reply.payload["response"]["rendered"]["0"], "home");

        assert!(joined.mailbox.deliver(ClientInput::Event {
            msg_ref: Some("2".to_string()),
            payload: json!({ "type": "go", "tab": "billing" }),
        }));
        let patch = rx.recv().await.unwrap();
        assert_eq!(patch.event, LIVE_PATCH);
        assert_eq!(patch.payload, json!({ "to": "/?tab=billing", "kind": "push" }));
        let diff = rx.recv().await.unwrap();
        assert_eq!(diff.event, DIFF);
        assert_eq!(diff.payload, json!({ "0": "billing" }));

        joined.close().await;
    }
}
