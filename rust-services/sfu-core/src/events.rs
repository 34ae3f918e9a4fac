//! Telemetry events handed to the host's event handlers
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


use crate::handle::PeerHandle;
use crate::packet::MediaKind;
use crate::plugin::PLUGIN_PACKAGE;
use crate::policy::MediaSelector;
use crate::port::CoreCommunicationPort;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle and control actions worth reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Created,
    MediaSetup,
    Active,
    TornDown,
    Destroyed,
    Subscribed {
        source: PeerHandle,
        media: Vec<MediaSelector>,
    },
    Unsubscribed {
        source: PeerHandle,
    },
    KeyframeRequested {
        reporter: PeerHandle,
        kind: MediaKind,
    },
    BitrateCapped {
        bitrate_bps: u32,
    },
    Unauthorized {
        reason: String,
    },
}

/// Envelope around every event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Unique event identifier
    pub event_id: Uuid,
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
    /// Package of the plugin that produced the event
    pub plugin: String,
    pub event: SessionEvent,
}

impl TelemetryEvent {
    pub fn new(event: SessionEvent) -> Self {
        TelemetryEvent {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            plugin: PLUGIN_PACKAGE.to_string(),
            event,
        }
    }
}

/// Hand `event` to the host, if it listens for events at all
pub(crate) fn emit(port: &dyn CoreCommunicationPort, handle: PeerHandle, event: SessionEvent) {
    if !port.events_is_enabled() {
        return;
    }
    match serde_json::to_value(TelemetryEvent::new(event)) {
        Ok(value) => port.notify_event(handle, value),
        Err(e) => tracing::debug!(handle = %handle, error = %e, "Dropping unserializable event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{PortCall, RecordingPort};

    #[test]
    fn test_event_serialization() {
        let event = TelemetryEvent::new(SessionEvent::Subscribed {
            source: PeerHandle::new(7),
            media: vec![MediaSelector::Audio],
        });
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["plugin"], PLUGIN_PACKAGE);
        assert_eq!(json["event"]["event"], "subscribed");
        assert_eq!(json["event"]["source"], 7);
        assert_eq!(json["event"]["media"][0], "audio");

        let deserialized: TelemetryEvent = serde_json::from_value(json).unwrap();
        assert_eq!(deserialized.event_id, event.event_id);
        assert_eq!(deserialized.event, event.event);
    }

    #[test]
    fn test_emit_respects_host_switch() {
        let port = RecordingPort::new();
        emit(&port, PeerHandle::new(1), SessionEvent::Created);
        assert!(port.calls().is_empty());

        port.set_events_enabled(true);
        emit(&port, PeerHandle::new(1), SessionEvent::Created);
        match port.calls().as_slice() {
            [PortCall::NotifyEvent { handle, event }] => {
                assert_eq!(*handle, PeerHandle::new(1));
                assert_eq!(event["event"]["event"], "created");
            }
            other => panic!("unexpected calls: {:?}", other),
        }
    }
}
