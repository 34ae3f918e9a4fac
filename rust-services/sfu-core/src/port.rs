//! Outbound contract towards the host runtime
//!
//! Everything the core asks of the host goes through
//! [`CoreCommunicationPort`]. Relay and control calls are fire-and-forget:
//! the host queues them on the peer's transport and the core never waits.
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
use parking_lot::Mutex;
use serde_json::Value;
use sfu_tokens::TokenVerifier;
use std::sync::atomic::{AtomicBool, Ordering};

/// Calls the core makes into the host runtime
///
/// Implementations must be callable from any thread. The core never calls
/// the port while holding one of its own locks, so implementations may call
/// back into the registry.
pub trait CoreCommunicationPort: Send + Sync {
    /// Push a signaling message (and optional JSEP) to the peer
    ///
    /// An error means the host did not accept the message for delivery.
    fn push_event(
        &self,
        handle: PeerHandle,
        transaction: Option<&str>,
        message: Value,
        jsep: Option<Value>,
    ) -> SfuResult<()>;

    /// Send an RTP packet to the peer, unmodified
    fn relay_rtp(&self, handle: PeerHandle, packet: RtpPacket);

    /// Send an RTCP compound to the peer; the host rewrites SSRCs
    fn relay_rtcp(&self, handle: PeerHandle, packet: RtcpPacket);

    /// Send a data channel message to the peer
    ///
    /// A message carrying a protocol creates the channel on the peer's side.
    fn relay_data(&self, handle: PeerHandle, message: DataMessage);

    /// Ask the peer for a keyframe (RTCP PLI)
    fn send_pli(&self, handle: PeerHandle);

    /// Tell the peer the bitrate it may send at (RTCP REMB)
    fn send_remb(&self, handle: PeerHandle, bitrate_bps: u32);

    /// Close the peer's transport; the host later calls back `hangup_media`
    fn close_pc(&self, handle: PeerHandle);

    /// End the host-side session; the host later calls back `destroy_session`
    fn end_session(&self, handle: PeerHandle);

    /// Whether the host collects telemetry events at all
    fn events_is_enabled(&self) -> bool;

    /// Hand a telemetry event about the peer to the host's event handlers
    fn notify_event(&self, handle: PeerHandle, event: Value);

    /// Check a signed token's signature, realm and expiry
    fn auth_is_signature_valid(&self, token: &str) -> bool;

    /// Check a valid signed token grants `descriptor`
    fn auth_signature_contains(&self, token: &str, descriptor: &str) -> bool;
}

/// One recorded port invocation
#[derive(Debug, Clone, PartialEq)]
pub enum PortCall {
    PushEvent {
        handle: PeerHandle,
        transaction: Option<String>,
        message: Value,
        jsep: Option<Value>,
    },
    RelayRtp {
        handle: PeerHandle,
        packet: RtpPacket,
    },
    RelayRtcp {
        handle: PeerHandle,
        packet: RtcpPacket,
    },
    RelayData {
        handle: PeerHandle,
        message: DataMessage,
    },
    SendPli {
        handle: PeerHandle,
    },
    SendRemb {
        handle: PeerHandle,
        bitrate_bps: u32,
    },
    ClosePc {
        handle: PeerHandle,
    },
    EndSession {
        handle: PeerHandle,
    },
    NotifyEvent {
        handle: PeerHandle,
        event: Value,
    },
}

/// Port that records every call
///
/// Used by tests and by host integrations that want to observe the core
/// without a transport. Auth calls are answered by the configured verifier;
/// without one every token is rejected.
#[derive(Default)]
pub struct RecordingPort {
    calls: Mutex<Vec<PortCall>>,
    events_enabled: AtomicBool,
    push_failure: AtomicBool,
    verifier: Option<TokenVerifier>,
}

impl RecordingPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_verifier(verifier: TokenVerifier) -> Self {
        RecordingPort {
            verifier: Some(verifier),
            ..Self::default()
        }
    }

    pub fn set_events_enabled(&self, enabled: bool) {
        self.events_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Refuse (and do not record) every `push_event` while set
    pub fn set_push_failure(&self, failing: bool) {
        self.push_failure.store(failing, Ordering::Relaxed);
    }

    pub fn calls(&self) -> Vec<PortCall> {
        self.calls.lock().clone()
    }

    /// Return and forget everything recorded so far
    pub fn take(&self) -> Vec<PortCall> {
        std::mem::take(&mut *self.calls.lock())
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    pub fn rtp_to(&self, target: PeerHandle) -> Vec<RtpPacket> {
        self.filter(|call| match call {
            PortCall::RelayRtp { handle, packet } if *handle == target => Some(packet.clone()),
            _ => None,
        })
    }

    pub fn rtcp_to(&self, target: PeerHandle) -> Vec<RtcpPacket> {
        self.filter(|call| match call {
            PortCall::RelayRtcp { handle, packet } if *handle == target => Some(packet.clone()),
            _ => None,
        })
    }

    pub fn data_to(&self, target: PeerHandle) -> Vec<DataMessage> {
        self.filter(|call| match call {
            PortCall::RelayData { handle, message } if *handle == target => Some(message.clone()),
            _ => None,
        })
    }

    pub fn plis_to(&self, target: PeerHandle) -> usize {
        self.filter(|call| match call {
            PortCall::SendPli { handle } if *handle == target => Some(()),
            _ => None,
        })
        .len()
    }

    pub fn rembs_to(&self, target: PeerHandle) -> Vec<u32> {
        self.filter(|call| match call {
            PortCall::SendRemb { handle, bitrate_bps } if *handle == target => Some(*bitrate_bps),
            _ => None,
        })
    }

    /// Signaling messages pushed to `target` as (transaction, message, jsep)
    pub fn pushed_to(&self, target: PeerHandle) -> Vec<(Option<String>, Value, Option<Value>)> {
        self.filter(|call| match call {
            PortCall::PushEvent {
                handle,
                transaction,
                message,
                jsep,
            } if *handle == target => Some((transaction.clone(), message.clone(), jsep.clone())),
            _ => None,
        })
    }

    /// Names of the telemetry events reported for `target`
    pub fn events_for(&self, target: PeerHandle) -> Vec<String> {
        self.filter(|call| match call {
            PortCall::NotifyEvent { handle, event } if *handle == target => {
                event["event"]["event"].as_str().map(str::to_string)
            }
            _ => None,
        })
    }

    fn filter<T>(&self, f: impl FnMut(&PortCall) -> Option<T>) -> Vec<T> {
        self.calls.lock().iter().filter_map(f).collect()
    }

    fn record(&self, call: PortCall) {
        self.calls.lock().push(call);
    }
}

impl CoreCommunicationPort for RecordingPort {
    fn push_event(
        &self,
        handle: PeerHandle,
        transaction: Option<&str>,
        message: Value,
        jsep: Option<Value>,
    ) -> SfuResult<()> {
        if self.push_failure.load(Ordering::Relaxed) {
            return Err(SfuError::Port("push rejected by host".to_string()));
        }
        self.record(PortCall::PushEvent {
            handle,
            transaction: transaction.map(str::to_string),
            message,
            jsep,
        });
        Ok(())
    }

    fn relay_rtp(&self, handle: PeerHandle, packet: RtpPacket) {
        self.record(PortCall::RelayRtp { handle, packet });
    }

    fn relay_rtcp(&self, handle: PeerHandle, packet: RtcpPacket) {
        self.record(PortCall::RelayRtcp { handle, packet });
    }

    fn relay_data(&self, handle: PeerHandle, message: DataMessage) {
        self.record(PortCall::RelayData { handle, message });
    }

    fn send_pli(&self, handle: PeerHandle) {
        self.record(PortCall::SendPli { handle });
    }

    fn send_remb(&self, handle: PeerHandle, bitrate_bps: u32) {
        self.record(PortCall::SendRemb { handle, bitrate_bps });
    }

    fn close_pc(&self, handle: PeerHandle) {
        self.record(PortCall::ClosePc { handle });
    }

    fn end_session(&self, handle: PeerHandle) {
        self.record(PortCall::EndSession { handle });
    }

    fn events_is_enabled(&self) -> bool {
        self.events_enabled.load(Ordering::Relaxed)
    }

    fn notify_event(&self, handle: PeerHandle, event: Value) {
        self.record(PortCall::NotifyEvent { handle, event });
    }

    fn auth_is_signature_valid(&self, token: &str) -> bool {
        self.verifier
            .as_ref()
            .map(|verifier| verifier.is_valid(token))
            .unwrap_or(false)
    }

    fn auth_signature_contains(&self, token: &str, descriptor: &str) -> bool {
        self.verifier
            .as_ref()
            .map(|verifier| verifier.contains(token, descriptor))
            .unwrap_or(false)
    }
}
