//! Media-routing core of a Selective Forwarding Unit
//!
//! This crate sits between a host runtime, which owns ICE, DTLS, SRTP and
//! SDP, and the forwarding decisions:
//! - Session registry and per-peer state machine
//! - Subscription based forwarding of RTP, RTCP and data channel messages
//! - Feedback driven keyframe requests and bitrate ceilings
//! - Signaling and admin requests
//!
//! Everything the core asks of the host goes through
//! [`CoreCommunicationPort`]. Entry points are synchronous and may be called
//! concurrently from any host thread.
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


pub mod admin;
pub mod error;
pub mod events;
pub mod handle;
pub mod media_control;
pub mod packet;
pub mod plugin;
pub mod policy;
pub mod port;
pub mod registry;
pub mod rtcp;
pub mod session;
pub mod signaling;

// Re-export main types
pub use error::{SfuError, SfuResult};
pub use handle::PeerHandle;
pub use packet::{DataMessage, MediaKind, RtcpPacket, RtpExtensions, RtpPacket};
pub use plugin::{SfuPlugin, PLUGIN_PACKAGE};
pub use policy::{ContentKind, MediaSelector};
pub use port::{CoreCommunicationPort, PortCall, RecordingPort};
pub use registry::SessionRegistry;
pub use session::{Session, SessionSnapshot, SessionState};
pub use signaling::SignalingEnvelope;
pub use sfu_config::SfuConfig;
