//! RTCP feedback inspection
//!
//! The core never rewrites RTCP. It only walks a compound packet far enough
//! to learn what the receiver is telling us: loss in reception report
//! blocks (RFC 3550), picture loss / full intra requests (RFC 4585,
//! RFC 5104) and receiver estimated maximum bitrate (REMB).
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


use bytes::{BufMut, BytesMut};

/// RTCP packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpPacketType {
    /// Sender Report (SR) - 200
    SenderReport,
    /// Receiver Report (RR) - 201
    ReceiverReport,
    /// Source Description (SDES) - 202
    SourceDescription,
    /// Goodbye (BYE) - 203
    Goodbye,
    /// Application Defined (APP) - 204
    ApplicationDefined,
    /// Transport layer feedback (RTPFB) - 205
    TransportFeedback,
    /// Payload specific feedback (PSFB) - 206
    PayloadFeedback,
    /// Anything else, carried through untouched
    Other(u8),
}

impl RtcpPacketType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            200 => RtcpPacketType::SenderReport,
            201 => RtcpPacketType::ReceiverReport,
            202 => RtcpPacketType::SourceDescription,
            203 => RtcpPacketType::Goodbye,
            204 => RtcpPacketType::ApplicationDefined,
            205 => RtcpPacketType::TransportFeedback,
            206 => RtcpPacketType::PayloadFeedback,
            other => RtcpPacketType::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            RtcpPacketType::SenderReport => 200,
            RtcpPacketType::ReceiverReport => 201,
            RtcpPacketType::SourceDescription => 202,
            RtcpPacketType::Goodbye => 203,
            RtcpPacketType::ApplicationDefined => 204,
            RtcpPacketType::TransportFeedback => 205,
            RtcpPacketType::PayloadFeedback => 206,
            RtcpPacketType::Other(other) => other,
        }
    }
}

/// PSFB format: Picture Loss Indication
const FMT_PLI: u8 = 1;
/// PSFB format: Full Intra Request
const FMT_FIR: u8 = 4;
/// PSFB format: Application layer feedback (REMB lives here)
const FMT_AFB: u8 = 15;

const REMB_IDENTIFIER: &[u8; 4] = b"REMB";
const REPORT_BLOCK_SIZE: usize = 24;
/// Header, sender SSRC and media SSRC of a feedback message
const FEEDBACK_HEADER_SIZE: usize = 12;
/// FIR FCI entry: SSRC, sequence number, reserved
const FIR_ENTRY_SIZE: usize = 8;

/// RTCP packet header (RFC 3550 Section 6.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpHeader {
    /// Version (must be 2)
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Reception report count, source count or feedback message type
    pub count: u8,
    /// Packet type
    pub packet_type: RtcpPacketType,
    /// Length in 32-bit words minus 1
    pub length: u16,
}

impl RtcpHeader {
    pub const SIZE: usize = 4;

    /// Parse RTCP header from bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }

        let first_byte = data[0];
        let version = (first_byte >> 6) & 0x03;
        if version != 2 {
            return None;
        }

        Some(RtcpHeader {
            version,
            padding: (first_byte & 0x20) != 0,
            count: first_byte & 0x1F,
            packet_type: RtcpPacketType::from_u8(data[1]),
            length: u16::from_be_bytes([data[2], data[3]]),
        })
    }

    /// Size of the whole packet this header introduces, in bytes
    pub fn packet_size(&self) -> usize {
        (self.length as usize + 1) * 4
    }

    /// Serialize RTCP header to bytes
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SIZE);

        let mut first_byte = (self.version & 0x03) << 6;
        if self.padding {
            first_byte |= 0x20;
        }
        first_byte |= self.count & 0x1F;

        buf.put_u8(first_byte);
        buf.put_u8(self.packet_type.as_u8());
        buf.put_u16(self.length);

        buf
    }
}

/// Reception report block (RFC 3550 Section 6.4.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceptionReport {
    /// SSRC of source
    pub ssrc: u32,
    /// Fraction lost (8 bits, fixed point / 256)
    pub fraction_lost: u8,
    /// Cumulative number of packets lost (24 bits, signed)
    pub cumulative_packets_lost: i32,
    /// Extended highest sequence number received
    pub extended_sequence_number: u32,
    /// Interarrival jitter
    pub jitter: u32,
    /// Last SR timestamp (LSR)
    pub last_sr_timestamp: u32,
    /// Delay since last SR (DLSR)
    pub delay_since_last_sr: u32,
}

impl ReceptionReport {
    fn parse(block: &[u8]) -> Self {
        let word = |offset: usize| {
            u32::from_be_bytes([block[offset], block[offset + 1], block[offset + 2], block[offset + 3]])
        };
        // Sign-extend the 24-bit cumulative loss
        let cumulative = ((word(4) << 8) as i32) >> 8;

        ReceptionReport {
            ssrc: word(0),
            fraction_lost: block[4],
            cumulative_packets_lost: cumulative,
            extended_sequence_number: word(8),
            jitter: word(12),
            last_sr_timestamp: word(16),
            delay_since_last_sr: word(20),
        }
    }

    fn serialize_into(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ssrc);
        buf.put_u8(self.fraction_lost);
        // Cumulative packets lost (24 bits signed)
        let lost_bytes = self.cumulative_packets_lost.to_be_bytes();
        buf.put_u8(lost_bytes[1]);
        buf.put_u8(lost_bytes[2]);
        buf.put_u8(lost_bytes[3]);
        buf.put_u32(self.extended_sequence_number);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sr_timestamp);
        buf.put_u32(self.delay_since_last_sr);
    }

    /// Loss as a fraction in [0, 1)
    pub fn loss_fraction(&self) -> f32 {
        self.fraction_lost as f32 / 256.0
    }
}

/// RTCP Receiver Report (RFC 3550 Section 6.4.2)
#[derive(Debug, Clone)]
pub struct ReceiverReport {
    /// SSRC of receiver
    pub ssrc: u32,
    /// Reception report blocks (0-31)
    pub reception_reports: Vec<ReceptionReport>,
}

impl ReceiverReport {
    pub fn new(ssrc: u32, reception_reports: Vec<ReceptionReport>) -> Self {
        ReceiverReport {
            ssrc,
            reception_reports,
        }
    }

    /// Serialize Receiver Report to bytes (RFC 3550 compliant)
    pub fn serialize(&self) -> BytesMut {
        let header = RtcpHeader {
            version: 2,
            padding: false,
            count: self.reception_reports.len().min(31) as u8,
            packet_type: RtcpPacketType::ReceiverReport,
            length: 0,
        };

        let mut buf = BytesMut::new();
        buf.put_slice(&header.serialize());
        buf.put_u32(self.ssrc);
        for report in self.reception_reports.iter().take(31) {
            report.serialize_into(&mut buf);
        }

        finish_length(buf)
    }
}

/// Payload specific feedback message without FCI (PLI) or with a REMB FCI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadFeedback {
    PictureLoss { sender_ssrc: u32, media_ssrc: u32 },
    Remb { sender_ssrc: u32, bitrate_bps: u64, ssrcs: Vec<u32> },
}

impl PayloadFeedback {
    pub fn serialize(&self) -> BytesMut {
        let (fmt, sender_ssrc, media_ssrc) = match self {
            PayloadFeedback::PictureLoss { sender_ssrc, media_ssrc } => (FMT_PLI, *sender_ssrc, *media_ssrc),
            PayloadFeedback::Remb { sender_ssrc, .. } => (FMT_AFB, *sender_ssrc, 0),
        };
        let header = RtcpHeader {
            version: 2,
            padding: false,
            count: fmt,
            packet_type: RtcpPacketType::PayloadFeedback,
            length: 0,
        };

        let mut buf = BytesMut::new();
        buf.put_slice(&header.serialize());
        buf.put_u32(sender_ssrc);
        buf.put_u32(media_ssrc);

        if let PayloadFeedback::Remb { bitrate_bps, ssrcs, .. } = self {
            // Smallest exponent that fits the mantissa in 18 bits
            let mut exponent = 0u32;
            let mut mantissa = *bitrate_bps;
            while mantissa > 0x3FFFF {
                mantissa >>= 1;
                exponent += 1;
            }
            buf.put_slice(REMB_IDENTIFIER);
            buf.put_u8(ssrcs.len() as u8);
            buf.put_u8(((exponent as u8) << 2) | ((mantissa >> 16) as u8 & 0x03));
            buf.put_u16((mantissa & 0xFFFF) as u16);
            for ssrc in ssrcs {
                buf.put_u32(*ssrc);
            }
        }

        finish_length(buf)
    }
}

fn finish_length(mut buf: BytesMut) -> BytesMut {
    let length_words = (buf.len() / 4) - 1;
    buf[2..4].copy_from_slice(&(length_words as u16).to_be_bytes());
    buf
}

/// What a compound RTCP packet asks of the SFU
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedbackSummary {
    /// Reception report blocks found in SR and RR packets
    pub reports: Vec<ReceptionReport>,
    /// A PLI was present
    pub picture_loss: bool,
    /// A FIR was present
    pub full_intra_request: bool,
    /// Media SSRCs named by the PLI and FIR messages
    pub keyframe_ssrcs: Vec<u32>,
    /// Lowest REMB value found, in bps
    pub remb_bps: Option<u64>,
    /// At least one packet that is not receiver feedback (SR, SDES, BYE, ...)
    pub has_sender_information: bool,
    /// The walk stopped early on a truncated or invalid packet
    pub truncated: bool,
}

impl FeedbackSummary {
    /// Highest loss fraction over all report blocks
    pub fn max_loss_fraction(&self) -> Option<f32> {
        self.reports
            .iter()
            .map(ReceptionReport::loss_fraction)
            .reduce(f32::max)
    }

    pub fn wants_keyframe(&self) -> bool {
        self.picture_loss || self.full_intra_request
    }

    /// Nothing in the compound is useful to anyone but the SFU
    pub fn is_feedback_only(&self) -> bool {
        !self.has_sender_information && !self.truncated
    }
}

/// Walk a compound RTCP packet and summarise its feedback
pub fn inspect(mut data: &[u8]) -> FeedbackSummary {
    let mut summary = FeedbackSummary::default();

    while !data.is_empty() {
        let header = match RtcpHeader::parse(data) {
            Some(header) if header.packet_size() <= data.len() => header,
            _ => {
                summary.truncated = true;
                break;
            }
        };
        let (packet, rest) = data.split_at(header.packet_size());
        data = rest;

        match header.packet_type {
            RtcpPacketType::SenderReport => {
                summary.has_sender_information = true;
                // SSRC + 20 bytes of sender info precede the blocks
                read_report_blocks(&packet[RtcpHeader::SIZE..], 24, header.count, &mut summary);
            }
            RtcpPacketType::ReceiverReport => {
                read_report_blocks(&packet[RtcpHeader::SIZE..], 4, header.count, &mut summary);
            }
            RtcpPacketType::PayloadFeedback => match header.count {
                FMT_PLI => {
                    summary.picture_loss = true;
                    if let Some(ssrc) = read_u32(packet, 8) {
                        summary.keyframe_ssrcs.push(ssrc);
                    }
                }
                FMT_FIR => {
                    summary.full_intra_request = true;
                    let entries = packet.get(FEEDBACK_HEADER_SIZE..).unwrap_or_default();
                    for entry in entries.chunks_exact(FIR_ENTRY_SIZE) {
                        summary.keyframe_ssrcs.push(u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]));
                    }
                }
                FMT_AFB => {
                    if let Some(bitrate) = parse_remb(packet) {
                        summary.remb_bps = Some(summary.remb_bps.map_or(bitrate, |b| b.min(bitrate)));
                    }
                }
                _ => {}
            },
            // NACKs and transport-cc are answered by the host
            RtcpPacketType::TransportFeedback => {}
            _ => summary.has_sender_information = true,
        }
    }

    summary
}

fn read_report_blocks(body: &[u8], skip: usize, count: u8, summary: &mut FeedbackSummary) {
    let Some(blocks) = body.get(skip..) else {
        summary.truncated = true;
        return;
    };
    for block in blocks.chunks_exact(REPORT_BLOCK_SIZE).take(count as usize) {
        summary.reports.push(ReceptionReport::parse(block));
    }
}

fn read_u32(packet: &[u8], offset: usize) -> Option<u32> {
    let bytes = packet.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn parse_remb(packet: &[u8]) -> Option<u64> {
    // header(4) + sender ssrc(4) + media ssrc(4) + "REMB"(4) + num/exp/mantissa(4)
    let fci = packet.get(12..20)?;
    if &fci[0..4] != REMB_IDENTIFIER {
        return None;
    }
    let exponent = (fci[5] >> 2) as u32;
    let mantissa = (((fci[5] & 0x03) as u64) << 16) | ((fci[6] as u64) << 8) | fci[7] as u64;
    mantissa.checked_shl(exponent)
}
