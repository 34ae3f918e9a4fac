//! Session registry
//!
//! Single authoritative map from peer handle to session. The map lock only
//! guards membership; everything a session does happens on its own locks
//! after the map lock has been released.
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


use crate::admin;
use crate::error::{SfuError, SfuResult};
use crate::events::{self, SessionEvent};
use crate::handle::PeerHandle;
use crate::policy::ContentKind;
use crate::port::CoreCommunicationPort;
use crate::session::Session;
use crate::signaling::{self, JsepMarkers, SignalingEnvelope, SignalingRequest};
use parking_lot::RwLock;
use serde_json::Value;
use sfu_config::SfuConfig;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Registry of all live sessions
pub struct SessionRegistry {
    sessions: RwLock<HashMap<PeerHandle, Arc<Session>>>,
    port: Arc<dyn CoreCommunicationPort>,
    config: Arc<SfuConfig>,
}

impl SessionRegistry {
    pub fn new(port: Arc<dyn CoreCommunicationPort>, config: SfuConfig) -> Self {
        SessionRegistry {
            sessions: RwLock::new(HashMap::new()),
            port,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    pub(crate) fn port(&self) -> &dyn CoreCommunicationPort {
        self.port.as_ref()
    }

    /// Register a new session for `handle`
    pub fn create_session(&self, handle: PeerHandle) -> SfuResult<Arc<Session>> {
        let session = {
            let mut sessions = self.sessions.write();
            match sessions.entry(handle) {
                Entry::Occupied(_) => return Err(SfuError::Conflict { handle }),
                Entry::Vacant(entry) => {
                    let session = Arc::new(Session::new(
                        handle,
                        Arc::clone(&self.port),
                        Arc::clone(&self.config),
                    ));
                    entry.insert(Arc::clone(&session));
                    session
                }
            }
        };

        info!(handle = %handle, "Session created");
        events::emit(self.port(), handle, SessionEvent::Created);
        Ok(session)
    }

    pub fn get_session(&self, handle: PeerHandle) -> SfuResult<Arc<Session>> {
        self.sessions
            .read()
            .get(&handle)
            .cloned()
            .ok_or(SfuError::NotFound { handle })
    }

    /// Unregister and destroy the session for `handle`
    ///
    /// Returns false when no session was registered. Holders of the session
    /// keep a valid, destroyed object until they drop it.
    pub fn remove_session(&self, handle: PeerHandle) -> bool {
        let Some(session) = self.sessions.write().remove(&handle) else {
            return false;
        };
        self.retire(&session);
        true
    }

    /// Remove every session, e.g. when the plugin is unloaded
    pub fn shutdown(&self) {
        let drained: Vec<Arc<Session>> = self.sessions.write().drain().map(|(_, s)| s).collect();
        info!(sessions = drained.len(), "Shutting down session registry");
        for session in drained {
            self.retire(&session);
        }
    }

    fn retire(&self, session: &Arc<Session>) {
        session.destroy();
        if session.is_joined() {
            let left = signaling::peer_left(session.handle());
            self.notify_joined(session.handle(), left);
        }
    }

    /// All sessions, ordered by handle
    pub fn list_sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        sessions.sort_by_key(|session| session.handle());
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    fn other_handles(&self, handle: PeerHandle, joined_only: bool) -> Vec<PeerHandle> {
        self.list_sessions()
            .iter()
            .filter(|session| session.handle() != handle)
            .filter(|session| !joined_only || session.is_joined())
            .map(|session| session.handle())
            .collect()
    }

    /// Push an unsolicited notification to every joined peer except `origin`
    fn notify_joined(&self, origin: PeerHandle, message: Value) {
        for peer in self.other_handles(origin, true) {
            if let Err(e) = self.port.push_event(peer, None, message.clone(), None) {
                debug!(handle = %peer, error = %e, "Notification not delivered");
            }
        }
    }

    /// Make `subscriber` receive `kinds` from `source`
    pub fn subscribe(
        &self,
        subscriber: PeerHandle,
        source: PeerHandle,
        kinds: ContentKind,
    ) -> SfuResult<ContentKind> {
        let subscriber_session = self.get_session(subscriber)?;
        let source_session = self.get_session(source)?;
        let granted = Session::subscribe(&subscriber_session, &source_session, kinds)?;
        events::emit(
            self.port(),
            subscriber,
            SessionEvent::Subscribed {
                source,
                media: granted.selectors(),
            },
        );
        Ok(granted)
    }

    /// Stop `subscriber` receiving from `source`
    ///
    /// The source may already be gone. Returns whether a subscription existed.
    pub fn unsubscribe(&self, subscriber: PeerHandle, source: PeerHandle) -> SfuResult<bool> {
        let removed = self.get_session(subscriber)?.unsubscribe(source);
        if removed {
            events::emit(self.port(), subscriber, SessionEvent::Unsubscribed { source });
        }
        Ok(removed)
    }

    /// Host slow-link notification for `handle`
    pub fn slow_link(&self, handle: PeerHandle, uplink: bool, video: bool) -> SfuResult<()> {
        let session = self.get_session(handle)?;
        warn!(handle = %handle, uplink, video, "Slow link reported");
        session.slow_link(uplink, video);
        Ok(())
    }

    /// Handle a signaling request and push the reply
    ///
    /// Failures are pushed to the peer as an error reply on the same
    /// transaction and returned.
    pub fn handle_message(&self, handle: PeerHandle, envelope: SignalingEnvelope) -> SfuResult<()> {
        let session = self.get_session(handle)?;
        let SignalingEnvelope {
            transaction,
            body,
            jsep,
        } = envelope;

        match self.process_request(&session, &body, jsep.as_ref()) {
            Ok(reply) => self.port.push_event(handle, transaction.as_deref(), reply, jsep),
            Err(err) => {
                warn!(handle = %handle, error = %err, "Signaling request failed");
                if let SfuError::Unauthorized(reason) = &err {
                    events::emit(
                        self.port(),
                        handle,
                        SessionEvent::Unauthorized {
                            reason: reason.clone(),
                        },
                    );
                }
                if let Err(e) = self.port.push_event(
                    handle,
                    transaction.as_deref(),
                    signaling::error_reply(&err),
                    None,
                ) {
                    debug!(handle = %handle, error = %e, "Error reply not delivered");
                }
                Err(err)
            }
        }
    }

    fn process_request(&self, session: &Arc<Session>, body: &Value, jsep: Option<&Value>) -> SfuResult<Value> {
        let request = SignalingRequest::parse(body)?;
        if let Some(jsep) = jsep {
            let markers = JsepMarkers::inspect(jsep)?;
            debug!(handle = %session.handle(), jsep = ?markers.jsep_type, update = markers.update, "JSEP attached");
        }
        debug!(handle = %session.handle(), request = request.name(), "Signaling request");

        let handle = session.handle();
        match request {
            SignalingRequest::Join { token } => {
                self.authorize(token.as_deref())?;
                if session.mark_joined() {
                    info!(handle = %handle, "Peer joined");
                    self.notify_joined(handle, signaling::peer_joined(handle));
                }
                Ok(signaling::joined(handle, &self.other_handles(handle, true)))
            }
            SignalingRequest::Subscribe { source, media } => {
                require_joined(session)?;
                let kinds = ContentKind::from_selectors(media.as_deref());
                if kinds.is_empty() {
                    return Err(SfuError::InvalidMessage("no media selected".to_string()));
                }
                let granted = self.subscribe(handle, source, kinds)?;
                Ok(signaling::subscribed(source, &granted.selectors()))
            }
            SignalingRequest::Unsubscribe { source } => {
                require_joined(session)?;
                self.unsubscribe(handle, source)?;
                Ok(signaling::unsubscribed(source))
            }
            SignalingRequest::List => {
                require_joined(session)?;
                Ok(signaling::peers(&self.other_handles(handle, false)))
            }
            SignalingRequest::Hangup => {
                self.port.close_pc(handle);
                Ok(signaling::hanging_up())
            }
        }
    }

    fn authorize(&self, token: Option<&str>) -> SfuResult<()> {
        let auth = &self.config.auth;
        if !auth.require_token {
            return Ok(());
        }
        let token = token.ok_or_else(|| SfuError::Unauthorized("missing token".to_string()))?;
        if !self.port.auth_is_signature_valid(token) {
            return Err(SfuError::Unauthorized("invalid token".to_string()));
        }
        if let Some(descriptor) = &auth.descriptor {
            if !self.port.auth_signature_contains(token, descriptor) {
                return Err(SfuError::Unauthorized(format!(
                    "token does not grant {}",
                    descriptor
                )));
            }
        }
        Ok(())
    }

    /// Out-of-band administration, see [`admin`]
    pub fn handle_admin(&self, message: Value) -> Value {
        admin::handle(self, message)
    }
}

fn require_joined(session: &Session) -> SfuResult<()> {
    if session.is_joined() {
        Ok(())
    } else {
        Err(SfuError::Unauthorized("join first".to_string()))
    }
}
