//! Packet and message model
//!
//! Values handed over by the host runtime after decryption. Payloads are
//! kept as shared immutable [`Bytes`], so handing the same packet to several
//! destinations never copies or re-encodes it.
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


use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// RTP version carried in the two top bits of the first octet
const RTP_VERSION: u8 = 2;

/// Media type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// Audio stream
    Audio,
    /// Video stream
    Video,
}

impl MediaKind {
    /// Map the host's `video` flag
    pub fn from_video_flag(video: bool) -> Self {
        if video {
            MediaKind::Video
        } else {
            MediaKind::Audio
        }
    }

    pub fn is_video(self) -> bool {
        self == MediaKind::Video
    }
}

/// Metadata the host extracted from RTP header extensions
///
/// Raw values are kept exactly as delivered so they can be relayed
/// unmodified; the accessors apply the interpretation rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpExtensions {
    /// Audio level in dB (0-127, 127 = silence); -1 when absent
    pub audio_level: i8,
    /// Voice activity flag. Browsers set it unconditionally, advisory only
    pub audio_level_vad: bool,
    /// Video rotation (0, 90, 180, 270); -1 when absent
    pub video_rotation: i16,
    /// Back camera flag, only meaningful with a rotation value
    pub video_back_camera: bool,
    /// Horizontal flip flag, only meaningful with a rotation value
    pub video_flipped: bool,
}

impl Default for RtpExtensions {
    fn default() -> Self {
        RtpExtensions {
            audio_level: -1,
            audio_level_vad: false,
            video_rotation: -1,
            video_back_camera: false,
            video_flipped: false,
        }
    }
}

impl RtpExtensions {
    pub fn audio_level(&self) -> Option<u8> {
        if self.audio_level >= 0 {
            Some(self.audio_level as u8)
        } else {
            None
        }
    }

    pub fn video_rotation(&self) -> Option<u16> {
        match self.video_rotation {
            0 | 90 | 180 | 270 => Some(self.video_rotation as u16),
            _ => None,
        }
    }

    pub fn is_back_camera(&self) -> bool {
        self.video_rotation().is_some() && self.video_back_camera
    }

    pub fn is_flipped(&self) -> bool {
        self.video_rotation().is_some() && self.video_flipped
    }
}

/// RTP packet as received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    kind: MediaKind,
    payload: Bytes,
    extensions: RtpExtensions,
}

impl RtpPacket {
    /// Minimum RTP header size (12 bytes)
    pub const MIN_SIZE: usize = 12;

    pub fn new(kind: MediaKind, payload: impl Into<Bytes>, extensions: RtpExtensions) -> Self {
        RtpPacket {
            kind,
            payload: payload.into(),
            extensions,
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn extensions(&self) -> &RtpExtensions {
        &self.extensions
    }

    /// Cheap structural check: fixed header present and version 2
    pub fn is_well_formed(&self) -> bool {
        self.payload.len() >= Self::MIN_SIZE && self.payload[0] >> 6 == RTP_VERSION
    }

    /// Synchronization source from the fixed header
    pub fn ssrc(&self) -> Option<u32> {
        let bytes = self.payload.get(8..12)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// RTCP compound packet as received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpPacket {
    kind: MediaKind,
    payload: Bytes,
}

impl RtcpPacket {
    /// Minimum RTCP header size (4 bytes)
    pub const MIN_SIZE: usize = 4;

    pub fn new(kind: MediaKind, payload: impl Into<Bytes>) -> Self {
        RtcpPacket {
            kind,
            payload: payload.into(),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_well_formed(&self) -> bool {
        self.payload.len() >= Self::MIN_SIZE && self.payload[0] >> 6 == RTP_VERSION
    }
}

/// Data channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    /// Channel label
    pub label: String,
    /// Subprotocol, only used when the channel gets created
    pub protocol: Option<String>,
    /// Binary (true) or text (false) payload
    pub binary: bool,
    /// Message data
    pub payload: Bytes,
}

impl DataMessage {
    pub fn text(label: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        DataMessage {
            label: label.into(),
            protocol: None,
            binary: false,
            payload: payload.into(),
        }
    }

    pub fn binary(label: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        DataMessage {
            binary: true,
            ..DataMessage::text(label, payload)
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_defaults_are_absent() {
        let ext = RtpExtensions::default();
        assert_eq!(ext.audio_level(), None);
        assert_eq!(ext.video_rotation(), None);
    }

    #[test]
    fn test_orientation_flags_ignored_without_rotation() {
        let ext = RtpExtensions {
            video_back_camera: true,
            video_flipped: true,
            ..RtpExtensions::default()
        };
        assert!(!ext.is_back_camera());
        assert!(!ext.is_flipped());

        let rotated = RtpExtensions {
            video_rotation: 90,
            ..ext
        };
        assert_eq!(rotated.video_rotation(), Some(90));
        assert!(rotated.is_back_camera());
        assert!(rotated.is_flipped());
    }

    #[test]
    fn test_unknown_rotation_treated_as_absent() {
        let ext = RtpExtensions {
            video_rotation: 45,
            video_flipped: true,
            ..RtpExtensions::default()
        };
        assert_eq!(ext.video_rotation(), None);
        assert!(!ext.is_flipped());
    }

    #[test]
    fn test_rtp_well_formed() {
        let mut header = vec![0x80, 96, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1];
        let packet = RtpPacket::new(MediaKind::Video, header.clone(), RtpExtensions::default());
        assert!(packet.is_well_formed());

        header[0] = 0x40; // version 1
        let packet = RtpPacket::new(MediaKind::Video, header, RtpExtensions::default());
        assert!(!packet.is_well_formed());

        let short = RtpPacket::new(MediaKind::Audio, vec![0x80, 0], RtpExtensions::default());
        assert!(!short.is_well_formed());
        assert_eq!(short.ssrc(), None);
    }

    #[test]
    fn test_rtp_ssrc() {
        let header = vec![0x80, 96, 0, 1, 0, 0, 0, 0, 0xAA, 0xBB, 0xCC, 0xDD];
        let packet = RtpPacket::new(MediaKind::Video, header, RtpExtensions::default());
        assert_eq!(packet.ssrc(), Some(0xAABBCCDD));
    }

    #[test]
    fn test_clone_shares_payload() {
        let packet = RtpPacket::new(
            MediaKind::Audio,
            vec![0x80u8; 20],
            RtpExtensions::default(),
        );
        let copy = packet.clone();
        assert_eq!(packet.payload().as_ptr(), copy.payload().as_ptr());
    }
}
