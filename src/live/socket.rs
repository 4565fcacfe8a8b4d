//! The handle a view's handlers receive: its context plus side-channel commands.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::uploads::{UploadEntry, UploadError, UploadOptions, Uploads};

/// Side-channel requests recorded by handlers and applied by the connection
/// once the handler returns.
pub(crate) enum Command<I> {
    Subscribe(String),
    Repeat {
        every: Duration,
        make: Arc<dyn Fn() -> I + Send + Sync>,
    },
    PushPatch {
        to: String,
        replace: bool,
    },
    PushRedirect {
        to: String,
        replace: bool,
    },
}

/// One view instance's state. Handlers take it by value and hand it back.
pub struct Socket<C, I = ()> {
    id: String,
    connected: bool,
    url: String,
    context: C,
    changed: bool,
    uploads: Uploads,
    flash: BTreeMap<String, String>,
    commands: Vec<Command<I>>,
}

impl<C: Default, I> Socket<C, I> {
    pub(crate) fn new(id: String, connected: bool, url: String) -> Self {
        Self {
            id,
            connected,
            url,
            context: C::default(),
            changed: false,
            uploads: Uploads::default(),
            flash: BTreeMap::new(),
            commands: Vec::new(),
        }
    }
}

impl<C, I> Socket<C, I> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// False while rendering the initial HTTP response.
    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    /// The only way to mutate context. Any assign schedules a re-render.
    pub fn assign(&mut self, update: impl FnOnce(&mut C)) {
        update(&mut self.context);
        self.changed = true;
    }

    /// Receive broadcasts on `topic` as `Info::Broadcast`. Connected only.
    pub fn subscribe(&mut self, topic: impl Into<String>) {
        let topic = topic.into();
        if !self.connected {
            debug!(socket = %self.id, topic = %topic, "subscribe ignored while disconnected");
            return;
        }
        self.commands.push(Command::Subscribe(topic));
    }

    /// Enqueue `make()` as `Info::Local` every `every`. Connected only.
    pub fn repeat(&mut self, every: Duration, make: impl Fn() -> I + Send + Sync + 'static) {
        if !self.connected {
            debug!(socket = %self.id, "repeat ignored while disconnected");
            return;
        }
        self.commands.push(Command::Repeat {
            every,
            make: Arc::new(make),
        });
    }

    /// Client-side navigation within this view; runs `handle_params` with `to`.
    pub fn push_patch(&mut self, to: impl Into<String>, replace: bool) {
        if self.connected {
            self.commands.push(Command::PushPatch {
                to: to.into(),
                replace,
            });
        }
    }

    /// Tell the client to navigate to another page.
    pub fn push_redirect(&mut self, to: impl Into<String>, replace: bool) {
        if self.connected {
            self.commands.push(Command::PushRedirect {
                to: to.into(),
                replace,
            });
        }
    }

    pub fn allow_upload(&mut self, name: &str, options: UploadOptions) -> Result<(), UploadError> {
        self.uploads.allow(name, options)?;
        self.changed = true;
        Ok(())
    }

    pub fn uploads(&self) -> &Uploads {
        &self.uploads
    }

    /// Take the finished entries of an upload, e.g. after the form is submitted.
    pub fn consume_uploaded_entries(&mut self, name: &str) -> Vec<UploadEntry> {
        let done = self.uploads.consume_done(name);
        if !done.is_empty() {
            self.changed = true;
        }
        done
    }

    pub fn put_flash(&mut self, kind: impl Into<String>, message: impl Into<String>) {
        self.flash.insert(kind.into(), message.into());
        self.changed = true;
    }

    pub fn flash(&self, kind: &str) -> Option<&str> {
        self.flash.get(kind).map(String::as_str)
    }

    pub fn clear_flash(&mut self) {
        if !self.flash.is_empty() {
            self.flash.clear();
            self.changed = true;
        }
    }

    pub(crate) fn uploads_mut(&mut self) -> &mut Uploads {
        &mut self.uploads
    }

    pub(crate) fn mark_changed(&mut self) {
        self.changed = true;
    }

    pub(crate) fn set_url(&mut self, url: String) {
        self.url = url;
    }

    pub(crate) fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    pub(crate) fn take_commands(&mut self) -> Vec<Command<I>> {
        std::mem::take(&mut self.commands)
    }
}
