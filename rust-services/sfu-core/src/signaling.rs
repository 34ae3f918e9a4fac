//! Signaling wire format
//!
//! Requests arrive as JSON bodies tagged by `"request"`; replies and
//! notifications go back through the port as `{"sfu": "event", ...}`.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::error::{SfuError, SfuResult};
use crate::handle::PeerHandle;
use crate::policy::MediaSelector;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Signaling message as delivered by the host
#[derive(Debug, Clone, PartialEq)]
pub struct SignalingEnvelope {
    /// Echoed on the reply so the peer can correlate it
    pub transaction: Option<String>,
    pub body: Value,
    /// Session description, passed back untouched
    pub jsep: Option<Value>,
}

impl SignalingEnvelope {
    pub fn new(transaction: impl Into<String>, body: Value) -> Self {
        SignalingEnvelope {
            transaction: Some(transaction.into()),
            body,
            jsep: None,
        }
    }

    pub fn with_jsep(mut self, jsep: Value) -> Self {
        self.jsep = Some(jsep);
        self
    }
}

/// JSEP type marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JsepType {
    Offer,
    Answer,
}

/// The only parts of a JSEP the core looks at
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JsepMarkers {
    #[serde(rename = "type")]
    pub jsep_type: JsepType,
    /// Renegotiation of an established connection
    #[serde(default)]
    pub update: bool,
}

impl JsepMarkers {
    pub fn inspect(jsep: &Value) -> SfuResult<Self> {
        JsepMarkers::deserialize(jsep).map_err(|e| SfuError::InvalidMessage(format!("invalid jsep: {}", e)))
    }
}

/// Requests a peer can make
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum SignalingRequest {
    Join {
        #[serde(default)]
        token: Option<String>,
    },
    Subscribe {
        source: PeerHandle,
        #[serde(default)]
        media: Option<Vec<MediaSelector>>,
    },
    Unsubscribe {
        source: PeerHandle,
    },
    List,
    Hangup,
}

impl SignalingRequest {
    pub fn parse(body: &Value) -> SfuResult<Self> {
        if body.get("request").and_then(Value::as_str).is_none() {
            return Err(SfuError::InvalidMessage("missing request".to_string()));
        }
        Ok(SignalingRequest::deserialize(body)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SignalingRequest::Join { .. } => "join",
            SignalingRequest::Subscribe { .. } => "subscribe",
            SignalingRequest::Unsubscribe { .. } => "unsubscribe",
            SignalingRequest::List => "list",
            SignalingRequest::Hangup => "hangup",
        }
    }
}

fn event(name: &str, fields: Value) -> Value {
    let mut reply = json!({ "sfu": "event", "event": name });
    if let (Some(reply), Value::Object(fields)) = (reply.as_object_mut(), fields) {
        reply.extend(fields);
    }
    reply
}

pub fn joined(handle: PeerHandle, peers: &[PeerHandle]) -> Value {
    event("joined", json!({ "id": handle, "peers": peers }))
}

pub fn peer_joined(handle: PeerHandle) -> Value {
    event("peer_joined", json!({ "id": handle }))
}

pub fn peer_left(handle: PeerHandle) -> Value {
    event("peer_left", json!({ "id": handle }))
}

pub fn subscribed(source: PeerHandle, media: &[MediaSelector]) -> Value {
    event("subscribed", json!({ "source": source, "media": media }))
}

pub fn unsubscribed(source: PeerHandle) -> Value {
    event("unsubscribed", json!({ "source": source }))
}

pub fn peers(peers: &[PeerHandle]) -> Value {
    event("peers", json!({ "peers": peers }))
}

pub fn hanging_up() -> Value {
    event("hangingup", json!({}))
}

pub fn error_reply(err: &SfuError) -> Value {
    json!({
        "sfu": "event",
        "error_code": err.code(),
        "error": err.to_string(),
    })
}
