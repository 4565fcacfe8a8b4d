//! Demultiplexes one socket's frames onto the connections it has joined.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ProtocolError;
use crate::live::{query_params, ClientInput, JoinRequest, Joined, MountRequest, Outbox};
use crate::models::{
    AllowUploadPayload, CancelUploadPayload, Frame, JoinPayload, LivePatchPayload,
    ProgressPayload, ALLOW_UPLOAD, CANCEL_UPLOAD, EVENT, HEARTBEAT, LIVE_PATCH, PHOENIX_TOPIC,
    PHX_JOIN, PHX_LEAVE, PROGRESS,
};
use crate::pubsub::PubSub;
use crate::services::ViewRegistry;
use crate::session::SessionSerializer;

/// Owned by a single socket task. Heartbeats and leaves are answered here;
/// everything else lands in the owning connection's queue.
///
/// Teardown of a left or replaced connection runs in its own task so a slow
/// handler on one topic never holds up the read loop.
pub struct MessageRouter {
    registry: Arc<ViewRegistry>,
    sessions: Arc<dyn SessionSerializer>,
    pubsub: Arc<dyn PubSub>,
    outbox: Outbox,
    connections: HashMap<String, Joined>,
    closing: Vec<JoinHandle<()>>,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<ViewRegistry>,
        sessions: Arc<dyn SessionSerializer>,
        pubsub: Arc<dyn PubSub>,
        outbox: Outbox,
    ) -> Self {
        Self {
            registry,
            sessions,
            pubsub,
            outbox,
            connections: HashMap::new(),
            closing: Vec::new(),
        }
    }

    /// Topics with a live connection.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.connections
            .iter()
            .filter(|(_, joined)| !joined.is_finished())
            .map(|(topic, _)| topic.as_str())
    }

    pub async fn handle_text(&mut self, text: &str) {
        match Frame::parse(text) {
            Ok(frame) => self.handle_frame(frame).await,
            Err(error) => {
                warn!(reason = error.code(), "{}", error);
                self.outbox.push(Frame::error(
                    None,
                    None,
                    PHOENIX_TOPIC,
                    error.code(),
                    error.to_string(),
                ));
            }
        }
    }

    /// A rejected frame gets an `error` reply; the socket stays up either way.
    pub async fn handle_frame(&mut self, frame: Frame) {
        self.prune();
        if let Err(error) = self.dispatch(&frame).await {
            warn!(topic = %frame.topic, event = %frame.event, reason = error.code(), "{}", error);
            self.outbox.push(frame.reply_error(&error));
        }
    }

    async fn dispatch(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        match frame.event.as_str() {
            HEARTBEAT => {
                self.outbox.push(frame.reply_ok(json!({})));
                Ok(())
            }
            PHX_JOIN => self.join(frame).await,
            PHX_LEAVE => self.leave(frame).await,
            EVENT => {
                self.ensure_joined(&frame.topic)?;
                self.forward(
                    &frame.topic,
                    ClientInput::Event {
                        msg_ref: frame.msg_ref.clone(),
                        payload: frame.payload.clone(),
                    },
                )
            }
            LIVE_PATCH => {
                self.ensure_joined(&frame.topic)?;
                let payload: LivePatchPayload = decode(&frame.payload)?;
                self.forward(&frame.topic, ClientInput::LivePatch { url: payload.url })
            }
            ALLOW_UPLOAD => {
                self.ensure_joined(&frame.topic)?;
                let payload: AllowUploadPayload = decode(&frame.payload)?;
                self.forward(
                    &frame.topic,
                    ClientInput::AllowUpload {
                        msg_ref: frame.msg_ref.clone(),
                        payload,
                    },
                )
            }
            PROGRESS => {
                self.ensure_joined(&frame.topic)?;
                let payload: ProgressPayload = decode(&frame.payload)?;
                self.forward(
                    &frame.topic,
                    ClientInput::UploadProgress {
                        msg_ref: frame.msg_ref.clone(),
                        payload,
                    },
                )
            }
            CANCEL_UPLOAD => {
                self.ensure_joined(&frame.topic)?;
                let payload: CancelUploadPayload = decode(&frame.payload)?;
                self.forward(&frame.topic, ClientInput::CancelUpload(payload))
            }
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }

    async fn join(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        let payload: JoinPayload = decode(&frame.payload)?;
        let session = self
            .sessions
            .deserialize(&payload.session)
            .await
            .map_err(|e| ProtocolError::InvalidSession(e.to_string()))?;
        let csrf = payload.params.get("_csrf_token").and_then(Value::as_str);
        if csrf != Some(session.csrf_token.as_str()) {
            return Err(ProtocolError::InvalidCsrf);
        }
        let view = self
            .registry
            .get(&payload.url)
            .ok_or_else(|| ProtocolError::UnknownView(payload.url.clone()))?;

        // Frames the old instance still emits carry its join ref, so the
        // client can tell them apart from the new one.
        if let Some(previous) = self.connections.remove(&frame.topic) {
            info!(topic = %frame.topic, "rejoin, closing previous connection");
            self.closing.push(tokio::spawn(previous.close()));
        }

        let joined = view.join(JoinRequest {
            topic: frame.topic.clone(),
            join_ref: frame.join_ref.clone(),
            msg_ref: frame.msg_ref.clone(),
            mount: MountRequest {
                params: query_params(&payload.url),
                session,
                url: payload.url,
            },
            pubsub: self.pubsub.clone(),
            outbox: self.outbox.clone(),
        });
        self.connections.insert(frame.topic.clone(), joined);
        Ok(())
    }

    async fn leave(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        let joined = self
            .connections
            .remove(&frame.topic)
            .ok_or_else(|| ProtocolError::UnknownTopic(frame.topic.clone()))?;
        let outbox = self.outbox.clone();
        let reply = frame.reply_ok(json!({}));
        self.closing.push(tokio::spawn(async move {
            joined.close().await;
            outbox.push(reply);
        }));
        Ok(())
    }

    fn ensure_joined(&self, topic: &str) -> Result<(), ProtocolError> {
        match self.connections.get(topic) {
            Some(joined) if !joined.is_finished() => Ok(()),
            _ => Err(ProtocolError::UnknownTopic(topic.to_string())),
        }
    }

    fn forward(&mut self, topic: &str, input: ClientInput) -> Result<(), ProtocolError> {
        let delivered = self
            .connections
            .get(topic)
            .is_some_and(|joined| joined.mailbox.deliver(input));
        if !delivered {
            self.connections.remove(topic);
            return Err(ProtocolError::UnknownTopic(topic.to_string()));
        }
        Ok(())
    }

    fn prune(&mut self) {
        self.connections.retain(|topic, joined| {
            let finished = joined.is_finished();
            if finished {
                debug!(topic = %topic, "dropping finished connection");
            }
            !finished
        });
        self.closing.retain(|task| !task.is_finished());
    }

    /// Close every connection and wait until each has released its
    /// subscriptions and timers.
    pub async fn shutdown(&mut self) {
        let count = self.connections.len();
        join_all(self.connections.drain().map(|(_, joined)| joined.close())).await;
        for result in join_all(self.closing.drain(..)).await {
            if let Err(e) = result {
                warn!(error = %e, "connection teardown task failed");
            }
        }
        debug!(count, "router shut down");
    }
}

fn decode<T: DeserializeOwned>(payload: &Value) -> Result<T, ProtocolError> {
    T::deserialize(payload).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
}
