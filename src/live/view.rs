//! A view is a capability set: `render` plus whichever lifecycle handlers it
//! supplies. Dispatch checks for the handler's presence.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use super::connection::{self, ClientInput, Info};
use super::outbox::Outbox;
use super::socket::Socket;
use crate::error::ViewResult;
use crate::pubsub::PubSub;
use crate::session::Session;
use crate::template::Rendered;

pub type Params = Map<String, Value>;

pub(crate) type MountFn<C, I> =
    Arc<dyn Fn(Socket<C, I>, Params, Session) -> BoxFuture<'static, ViewResult<Socket<C, I>>> + Send + Sync>;
pub(crate) type ParamsFn<C, I> =
    Arc<dyn Fn(Socket<C, I>, Params, String) -> BoxFuture<'static, ViewResult<Socket<C, I>>> + Send + Sync>;
pub(crate) type EventFn<C, E, I> =
    Arc<dyn Fn(Socket<C, I>, E) -> BoxFuture<'static, ViewResult<Socket<C, I>>> + Send + Sync>;
pub(crate) type InfoFn<C, I> =
    Arc<dyn Fn(Socket<C, I>, Info<I>) -> BoxFuture<'static, ViewResult<Socket<C, I>>> + Send + Sync>;
pub(crate) type RenderFn<C, I> = Arc<dyn Fn(&Socket<C, I>) -> ViewResult<Rendered> + Send + Sync>;
pub(crate) type ShutdownFn<C, I> = Arc<dyn Fn(Socket<C, I>) -> BoxFuture<'static, ()> + Send + Sync>;

/// `C` is the context, `E` the event union decoded from `{type, ...}`
/// payloads, `I` the local info messages produced by timers.
pub struct LiveView<C, E, I = ()> {
    pub(crate) name: String,
    pub(crate) mount: Option<MountFn<C, I>>,
    pub(crate) handle_params: Option<ParamsFn<C, I>>,
    pub(crate) handle_event: Option<EventFn<C, E, I>>,
    pub(crate) handle_info: Option<InfoFn<C, I>>,
    pub(crate) render: RenderFn<C, I>,
    pub(crate) shutdown: Option<ShutdownFn<C, I>>,
}

impl<C, E, I> Clone for LiveView<C, E, I> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            mount: self.mount.clone(),
            handle_params: self.handle_params.clone(),
            handle_event: self.handle_event.clone(),
            handle_info: self.handle_info.clone(),
            render: self.render.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<C, E, I> LiveView<C, E, I>
where
    C: Default + Send + 'static,
    E: DeserializeOwned + Send + 'static,
    I: Send + 'static,
{
    pub fn new(
        name: impl Into<String>,
        render: impl Fn(&Socket<C, I>) -> ViewResult<Rendered> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            mount: None,
            handle_params: None,
            handle_event: None,
            handle_info: None,
            render: Arc::new(render),
            shutdown: None,
        }
    }

    pub fn on_mount<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Socket<C, I>, Params, Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ViewResult<Socket<C, I>>> + Send + 'static,
    {
        self.mount = Some(Arc::new(move |socket, params, session| {
            Box::pin(handler(socket, params, session))
        }));
        self
    }

    /// Receives the URL's query params and the URL itself.
    pub fn on_params<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Socket<C, I>, Params, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ViewResult<Socket<C, I>>> + Send + 'static,
    {
        self.handle_params = Some(Arc::new(move |socket, params, url| {
            Box::pin(handler(socket, params, url))
        }));
        self
    }

    pub fn on_event<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Socket<C, I>, E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ViewResult<Socket<C, I>>> + Send + 'static,
    {
        self.handle_event = Some(Arc::new(move |socket, event| Box::pin(handler(socket, event))));
        self
    }

    pub fn on_info<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Socket<C, I>, Info<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ViewResult<Socket<C, I>>> + Send + 'static,
    {
        self.handle_info = Some(Arc::new(move |socket, info| Box::pin(handler(socket, info))));
        self
    }

    pub fn on_shutdown<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Socket<C, I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.shutdown = Some(Arc::new(move |socket| Box::pin(handler(socket))));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// What a mount needs from the request, for both the HTTP and socket paths.
#[derive(Debug, Clone)]
pub struct MountRequest {
    pub params: Params,
    pub session: Session,
    pub url: String,
}

/// Everything a connection needs when a socket joins a view's topic.
pub struct JoinRequest {
    pub(crate) topic: String,
    pub(crate) join_ref: Option<String>,
    pub(crate) msg_ref: Option<String>,
    pub(crate) mount: MountRequest,
    pub(crate) pubsub: Arc<dyn PubSub>,
    pub(crate) outbox: Outbox,
}

/// Inbound side of a running connection, as seen by the message router.
pub trait Mailbox: Send + Sync {
    /// False when the connection has already stopped.
    fn deliver(&self, input: ClientInput) -> bool;
    fn is_closed(&self) -> bool;
}

pub struct Joined {
    pub(crate) mailbox: Box<dyn Mailbox>,
    pub(crate) task: JoinHandle<()>,
}

impl Joined {
    /// Ask the connection to leave and wait for its teardown to finish.
    pub(crate) async fn close(self) {
        self.mailbox.deliver(ClientInput::Leave);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "connection task ended abnormally");
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished() || self.mailbox.is_closed()
    }
}

/// A view with its context, event and info types erased, so views of
/// different types can share one registry.
#[async_trait]
pub trait Mountable: Send + Sync {
    fn name(&self) -> &str;

    /// Mount and render for the initial HTTP response; the instance is discarded.
    async fn render_disconnected(&self, request: MountRequest) -> ViewResult<Rendered>;

    /// Spawn a connected instance serving `request.topic`.
    fn join(&self, request: JoinRequest) -> Joined;
}

#[async_trait]
impl<C, E, I> Mountable for LiveView<C, E, I>
where
    C: Default + Send + 'static,
    E: DeserializeOwned + Send + 'static,
    I: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn render_disconnected(&self, request: MountRequest) -> ViewResult<Rendered> {
        connection::render_disconnected(self, request).await
    }

    fn join(&self, request: JoinRequest) -> Joined {
        connection::spawn(self.clone(), request)
    }
}
