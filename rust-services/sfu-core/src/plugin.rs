//! Plugin context
//!
//! [`SfuPlugin`] is the object a host runtime creates when it loads the
//! plugin. Host callbacks map one to one onto its methods; the thin glue that
//! converts host-native structures lives with the host.
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
use crate::packet::{DataMessage, RtcpPacket, RtpPacket};
use crate::port::CoreCommunicationPort;
use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::signaling::SignalingEnvelope;
use anyhow::Context;
use serde_json::Value;
use sfu_config::SfuConfig;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

pub const PLUGIN_VERSION: u32 = 8;
pub const PLUGIN_VERSION_STRING: &str = env!("CARGO_PKG_VERSION");
pub const PLUGIN_DESCRIPTION: &str = "Selective forwarding of audio, video and data between peers.";
pub const PLUGIN_NAME: &str = "SFU";
pub const PLUGIN_AUTHOR: &str = "SFU Contributors";
/// Package identifier; also the realm every signed token must carry
pub const PLUGIN_PACKAGE: &str = "sfu.plugin.core";

/// Loaded plugin instance
pub struct SfuPlugin {
    registry: SessionRegistry,
}

impl SfuPlugin {
    /// Load configuration and logging, then build the registry
    pub fn init(port: Arc<dyn CoreCommunicationPort>, config_path: Option<&Path>) -> anyhow::Result<Self> {
        let config = SfuConfig::load(config_path).context("Failed to load SFU configuration")?;
        Ok(Self::with_config(port, config))
    }

    /// Build the plugin from an already loaded configuration
    pub fn with_config(port: Arc<dyn CoreCommunicationPort>, config: SfuConfig) -> Self {
        if !sfu_logging::init(PLUGIN_NAME, config.log_level(), config.logging.format) {
            debug!("Logging already initialized by the host process");
        }
        info!(
            version = PLUGIN_VERSION_STRING,
            require_token = config.auth.require_token,
            "{} initialized",
            PLUGIN_NAME
        );
        SfuPlugin {
            registry: SessionRegistry::new(port, config),
        }
    }

    /// Tear down every session
    pub fn destroy(self) {
        self.registry.shutdown();
        info!("{} destroyed", PLUGIN_NAME);
    }

    pub fn version(&self) -> u32 {
        PLUGIN_VERSION
    }

    pub fn version_string(&self) -> &'static str {
        PLUGIN_VERSION_STRING
    }

    pub fn description(&self) -> &'static str {
        PLUGIN_DESCRIPTION
    }

    pub fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    pub fn author(&self) -> &'static str {
        PLUGIN_AUTHOR
    }

    pub fn package(&self) -> &'static str {
        PLUGIN_PACKAGE
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn create_session(&self, handle: PeerHandle) -> SfuResult<()> {
        self.registry.create_session(handle).map(|_| ())
    }

    pub fn destroy_session(&self, handle: PeerHandle) -> SfuResult<()> {
        if self.registry.remove_session(handle) {
            Ok(())
        } else {
            Err(SfuError::NotFound { handle })
        }
    }

    pub fn handle_message(
        &self,
        handle: PeerHandle,
        transaction: Option<String>,
        message: Value,
        jsep: Option<Value>,
    ) -> SfuResult<()> {
        self.registry.handle_message(
            handle,
            SignalingEnvelope {
                transaction,
                body: message,
                jsep,
            },
        )
    }

    pub fn handle_admin_message(&self, message: Value) -> Value {
        self.registry.handle_admin(message)
    }

    pub fn setup_media(&self, handle: PeerHandle) -> SfuResult<()> {
        self.registry.get_session(handle)?.setup_media()
    }

    pub fn hangup_media(&self, handle: PeerHandle) -> SfuResult<()> {
        self.registry.get_session(handle)?.cleanup_media();
        Ok(())
    }

    pub fn query_session(&self, handle: PeerHandle) -> SfuResult<Value> {
        let snapshot = self.registry.get_session(handle)?.query();
        Ok(serde_json::to_value(snapshot)?)
    }

    pub fn incoming_rtp(&self, handle: PeerHandle, packet: RtpPacket) {
        if let Some(session) = self.media_session(handle) {
            session.handle_rtp(packet);
        }
    }

    pub fn incoming_rtcp(&self, handle: PeerHandle, packet: RtcpPacket) {
        if let Some(session) = self.media_session(handle) {
            session.handle_rtcp(packet);
        }
    }

    pub fn incoming_data(&self, handle: PeerHandle, message: DataMessage) {
        if let Some(session) = self.media_session(handle) {
            session.handle_data(message);
        }
    }

    /// The peer's data channel can take more messages
    ///
    /// Nothing is buffered here, so there is nothing to flush.
    pub fn data_ready(&self, handle: PeerHandle) {
        if let Some(session) = self.media_session(handle) {
            debug!(handle = %handle, state = session.state().as_str(), "Data channel ready");
        }
    }

    pub fn slow_link(&self, handle: PeerHandle, uplink: bool, video: bool) {
        if self.media_session(handle).is_some() {
            if let Err(e) = self.registry.slow_link(handle, uplink, video) {
                debug!(handle = %handle, error = %e, "Slow link ignored");
            }
        }
    }

    /// Media callbacks may race with session destruction; unknown handles
    /// are dropped quietly
    fn media_session(&self, handle: PeerHandle) -> Option<Arc<Session>> {
        match self.registry.get_session(handle) {
            Ok(session) => Some(session),
            Err(e) => {
                debug!(handle = %handle, error = %e, "Media for unknown session");
                None
            }
        }
    }
}
