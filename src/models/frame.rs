//! Socket wire format: `[joinRef, msgRef, topic, event, payload]` JSON arrays.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

use crate::error::ProtocolError;
use crate::uploads::ClientFile;

pub const PHOENIX_TOPIC: &str = "phoenix";

pub const PHX_JOIN: &str = "phx_join";
pub const PHX_LEAVE: &str = "phx_leave";
pub const PHX_REPLY: &str = "phx_reply";
pub const HEARTBEAT: &str = "heartbeat";
pub const EVENT: &str = "event";
pub const LIVE_PATCH: &str = "live_patch";
pub const ALLOW_UPLOAD: &str = "allow_upload";
pub const PROGRESS: &str = "progress";
pub const CANCEL_UPLOAD: &str = "cancel_upload";

pub const DIFF: &str = "diff";
pub const REDIRECT: &str = "redirect";
pub const ERROR: &str = "error";

/// Reason code of the error frame sent when a view handler fails.
pub const LIFECYCLE_ERROR: &str = "lifecycle_error";

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub join_ref: Option<String>,
    pub msg_ref: Option<String>,
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

impl Frame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
    }

    /// Server-initiated push on a joined topic (no msg ref).
    pub fn push(join_ref: Option<String>, topic: &str, event: &str, payload: Value) -> Self {
        Self {
            join_ref,
            msg_ref: None,
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
        }
    }

    /// `phx_reply` with status ok.
    pub fn ok(join_ref: Option<String>, msg_ref: Option<String>, topic: &str, response: Value) -> Self {
        Self {
            join_ref,
            msg_ref,
            topic: topic.to_string(),
            event: PHX_REPLY.to_string(),
            payload: json!({ "status": "ok", "response": response }),
        }
    }

    pub fn error(
        join_ref: Option<String>,
        msg_ref: Option<String>,
        topic: &str,
        reason: &str,
        message: String,
    ) -> Self {
        Self {
            join_ref,
            msg_ref,
            topic: topic.to_string(),
            event: ERROR.to_string(),
            payload: json!({ "reason": reason, "message": message }),
        }
    }

    pub fn reply_ok(&self, response: Value) -> Self {
        Self::ok(self.join_ref.clone(), self.msg_ref.clone(), &self.topic, response)
    }

    pub fn reply_error(&self, error: &ProtocolError) -> Self {
        Self::error(
            self.join_ref.clone(),
            self.msg_ref.clone(),
            &self.topic,
            error.code(),
            error.to_string(),
        )
    }
}

impl Serialize for Frame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (
            &self.join_ref,
            &self.msg_ref,
            &self.topic,
            &self.event,
            &self.payload,
        )
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Frame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (join_ref, msg_ref, topic, event, payload) =
            <(Option<String>, Option<String>, String, String, Value)>::deserialize(deserializer)?;
        Ok(Self {
            join_ref,
            msg_ref,
            topic,
            event,
            payload,
        })
    }
}

/// `phx_join` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct JoinPayload {
    /// Signed session token embedded in the page.
    pub session: String,
    pub url: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LivePatchPayload {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AllowUploadPayload {
    pub name: String,
    pub entries: Vec<ClientFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressPayload {
    pub name: String,
    #[serde(rename = "ref")]
    pub entry_ref: String,
    pub progress: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelUploadPayload {
    pub name: String,
    #[serde(rename = "ref")]
    pub entry_ref: String,
}

/// Payload for the HTTP API to trigger a broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastRequest {
    pub topic: String,
    pub data: Value,
}
