//! Admin and diagnostics requests
//!
//! Admin never touches routing state itself: `hangup` and `kick` only ask
//! the host, which later calls back into the normal teardown path.
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


use crate::error::SfuResult;
use crate::handle::PeerHandle;
use crate::registry::SessionRegistry;
use crate::session::{SessionState, SessionStatsSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::info;

/// Requests accepted on the admin surface
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum AdminRequest {
    ListSessions,
    QuerySession { handle: PeerHandle },
    Stats,
    Hangup { handle: PeerHandle },
    Kick { handle: PeerHandle },
}

/// Registry-wide totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub sessions: usize,
    pub by_state: BTreeMap<&'static str, usize>,
    pub totals: SessionStatsSnapshot,
}

impl RegistryStats {
    fn add(&mut self, state: SessionState, stats: SessionStatsSnapshot) {
        self.sessions += 1;
        *self.by_state.entry(state.as_str()).or_default() += 1;
        let totals = &mut self.totals;
        totals.rtp_received += stats.rtp_received;
        totals.rtcp_received += stats.rtcp_received;
        totals.data_received += stats.data_received;
        totals.bytes_received += stats.bytes_received;
        totals.relayed += stats.relayed;
        totals.dropped += stats.dropped;
        totals.keyframe_requests += stats.keyframe_requests;
        totals.remb_sent += stats.remb_sent;
        // Most recent activity across sessions
        totals.last_rtp_at = totals.last_rtp_at.max(stats.last_rtp_at);
        totals.last_rtcp_at = totals.last_rtcp_at.max(stats.last_rtcp_at);
        totals.last_data_at = totals.last_data_at.max(stats.last_data_at);
    }
}

pub fn stats(registry: &SessionRegistry) -> RegistryStats {
    let mut stats = RegistryStats::default();
    for session in registry.list_sessions() {
        stats.add(session.state(), session.stats());
    }
    stats
}

pub(crate) fn handle(registry: &SessionRegistry, message: Value) -> Value {
    match dispatch(registry, message) {
        Ok(reply) => reply,
        Err(err) => json!({ "error": err.to_string(), "error_code": err.code() }),
    }
}

fn dispatch(registry: &SessionRegistry, message: Value) -> SfuResult<Value> {
    let request = AdminRequest::deserialize(&message)?;
    match request {
        AdminRequest::ListSessions => {
            let sessions: Vec<Value> = registry
                .list_sessions()
                .iter()
                .map(|session| json!({ "handle": session.handle(), "state": session.state() }))
                .collect();
            Ok(json!({ "sessions": sessions }))
        }
        AdminRequest::QuerySession { handle } => {
            let snapshot = registry.get_session(handle)?.query();
            Ok(json!({ "session": serde_json::to_value(snapshot)? }))
        }
        AdminRequest::Stats => Ok(json!({ "stats": serde_json::to_value(stats(registry))? })),
        AdminRequest::Hangup { handle } => {
            ensure_exists(registry, handle)?;
            info!(handle = %handle, "Admin hangup");
            registry.port().close_pc(handle);
            Ok(json!({ "result": "ok" }))
        }
        AdminRequest::Kick { handle } => {
            ensure_exists(registry, handle)?;
            info!(handle = %handle, "Admin kick");
            registry.port().end_session(handle);
            Ok(json!({ "result": "ok" }))
        }
    }
}

fn ensure_exists(registry: &SessionRegistry, handle: PeerHandle) -> SfuResult<()> {
    registry.get_session(handle).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{MediaKind, RtcpPacket, RtpExtensions, RtpPacket};
    use crate::policy::ContentKind;
    use crate::port::{PortCall, RecordingPort};
    use crate::rtcp::{ReceiverReport, ReceptionReport};
    use sfu_config::SfuConfig;
    use std::sync::Arc;

    fn registry() -> (Arc<RecordingPort>, SessionRegistry) {
        let port = Arc::new(RecordingPort::new());
        (port.clone(), SessionRegistry::new(port, SfuConfig::default()))
    }

    #[test]
    fn test_list_and_query() {
        let (_, registry) = registry();
        registry.create_session(PeerHandle::new(2)).unwrap();
        registry.create_session(PeerHandle::new(1)).unwrap().setup_media().unwrap();

        let reply = registry.handle_admin(json!({"request": "list_sessions"}));
        assert_eq!(
            reply,
            json!({"sessions": [
                {"handle": 1, "state": "media_setup"},
                {"handle": 2, "state": "created"},
            ]})
        );

        let reply = registry.handle_admin(json!({"request": "query_session", "handle": 1}));
        assert_eq!(reply["session"]["state"], "media_setup");
        assert_eq!(reply["session"]["stats"]["relayed"], 0);
    }

    #[test]
    fn test_query_shows_activity_and_loss() {
        let (_, registry) = registry();
        let source = registry.create_session(PeerHandle::new(1)).unwrap();
        let viewer = registry.create_session(PeerHandle::new(2)).unwrap();
        let header = vec![0x80, 96, 0, 1, 0, 0, 0, 0, 0, 0, 0x0A, 0x0A];
        for session in [&source, &viewer] {
            session.setup_media().unwrap();
            session.handle_rtp(RtpPacket::new(MediaKind::Video, header.clone(), RtpExtensions::default()));
        }
        registry
            .subscribe(viewer.handle(), source.handle(), ContentKind::VIDEO)
            .unwrap();

        let reply = registry.handle_admin(json!({"request": "query_session", "handle": 2}));
        assert!(reply["session"]["stats"]["last_rtp_at"].is_string());
        assert!(reply["session"]["stats"]["last_rtcp_at"].is_null());
        assert!(reply["session"]["subscriptions"][0].get("loss").is_none());

        let block = ReceptionReport {
            ssrc: 0x0A0A,
            fraction_lost: 192,
            cumulative_packets_lost: 40,
            extended_sequence_number: 100,
            jitter: 0,
            last_sr_timestamp: 0,
            delay_since_last_sr: 0,
        };
        let report = ReceiverReport::new(7, vec![block]).serialize().freeze();
        viewer.handle_rtcp(RtcpPacket::new(MediaKind::Video, report));

        let reply = registry.handle_admin(json!({"request": "query_session", "handle": 2}));
        let session = &reply["session"];
        assert!(session["stats"]["last_rtcp_at"].is_string());
        assert_eq!(session["subscriptions"][0]["peer"], 1);
        assert_eq!(session["subscriptions"][0]["loss"]["in_loss_event"], true);
        assert_eq!(session["subscriptions"][0]["loss"]["last_loss"], 0.75);

        let totals = stats(&registry).totals;
        assert_eq!(totals.last_rtp_at, source.stats().last_rtp_at.max(viewer.stats().last_rtp_at));
        assert!(totals.last_rtcp_at.is_some());
        assert_eq!(totals.last_data_at, None);
    }

    #[test]
    fn test_stats_totals() {
        let (_, registry) = registry();
        registry.create_session(PeerHandle::new(1)).unwrap();
        registry.create_session(PeerHandle::new(2)).unwrap();

        let stats = stats(&registry);
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.by_state.get("created"), Some(&2));

        let reply = registry.handle_admin(json!({"request": "stats"}));
        assert_eq!(reply["stats"]["sessions"], 2);
    }

    #[test]
    fn test_hangup_and_kick_only_ask_the_host() {
        let (port, registry) = registry();
        let handle = PeerHandle::new(1);
        let session = registry.create_session(handle).unwrap();
        session.setup_media().unwrap();

        assert_eq!(registry.handle_admin(json!({"request": "hangup", "handle": 1})), json!({"result": "ok"}));
        assert_eq!(registry.handle_admin(json!({"request": "kick", "handle": 1})), json!({"result": "ok"}));

        assert_eq!(
            port.calls(),
            vec![PortCall::ClosePc { handle }, PortCall::EndSession { handle }]
        );
        assert_eq!(session.state(), SessionState::MediaSetup);
        assert!(registry.get_session(handle).is_ok());
    }

    #[test]
    fn test_errors() {
        let (port, registry) = registry();

        let unknown = registry.handle_admin(json!({"request": "reboot"}));
        assert_eq!(unknown["error_code"], 400);

        let missing = registry.handle_admin(json!({"request": "kick", "handle": 7}));
        assert_eq!(missing["error"], "Session not found: 0x7");
        assert!(port.calls().is_empty());
    }
}
