//! Shared helpers for sfu-core integration tests

#![allow(dead_code)]

use sfu_core::rtcp::{PayloadFeedback, ReceiverReport, ReceptionReport};
use sfu_core::{
    MediaKind, PeerHandle, RecordingPort, RtcpPacket, RtpExtensions, RtpPacket, SessionRegistry,
    SfuConfig,
};
use std::sync::Arc;

pub fn registry() -> (Arc<RecordingPort>, SessionRegistry) {
    registry_with(SfuConfig::default())
}

pub fn registry_with(config: SfuConfig) -> (Arc<RecordingPort>, SessionRegistry) {
    let port = Arc::new(RecordingPort::new());
    let registry = SessionRegistry::new(port.clone(), config);
    (port, registry)
}

pub fn handle(raw: u64) -> PeerHandle {
    PeerHandle::new(raw)
}

/// Minimal RTP packet: fixed header plus a marker payload
pub fn rtp(kind: MediaKind, sequence: u16) -> RtpPacket {
    let mut payload = vec![0x80, 96];
    payload.extend_from_slice(&sequence.to_be_bytes());
    payload.extend_from_slice(&[0, 0, 0x10, 0, 0xDE, 0xAD, 0xBE, 0xEF]);
    payload.extend_from_slice(b"media");
    RtpPacket::new(kind, payload, RtpExtensions::default())
}

pub fn receiver_report(kind: MediaKind, fraction_lost: u8) -> RtcpPacket {
    let block = ReceptionReport {
        ssrc: 0xDEADBEEF,
        fraction_lost,
        cumulative_packets_lost: 0,
        extended_sequence_number: 1,
        jitter: 0,
        last_sr_timestamp: 0,
        delay_since_last_sr: 0,
    };
    RtcpPacket::new(kind, ReceiverReport::new(1, vec![block]).serialize().freeze())
}

pub fn picture_loss() -> RtcpPacket {
    let pli = PayloadFeedback::PictureLoss {
        sender_ssrc: 1,
        media_ssrc: 0xDEADBEEF,
    };
    RtcpPacket::new(MediaKind::Video, pli.serialize().freeze())
}

/// Register `raw`, negotiate media and send one packet so it becomes active
pub fn active_session(registry: &SessionRegistry, raw: u64) -> PeerHandle {
    let h = handle(raw);
    let session = registry.create_session(h).unwrap();
    session.setup_media().unwrap();
    session.handle_rtp(rtp(MediaKind::Audio, 0));
    h
}
