//! Per-peer session
//!
//! A session owns its lifecycle state, the table of peers it forwards to,
//! the record of peers it receives from and the media-control state on
//! both sides of those relationships.
//!
//! Lock order is own state, then own subscriptions, then any other lock.
//! Subscriber tables, media-control, SSRC and data-channel locks are
//! leaves: nothing is acquired while holding them. The port is only called
//! with no lock held.
//!
//! Receiver feedback is routed by SSRC: every session remembers the SSRCs it
//! sends, and a report block or PLI/FIR only reaches the source owning the
//! SSRC it names. Feedback about an SSRC no subscribed source owns falls
//! back to every source of that media kind.
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
use crate::events::{self, SessionEvent};
use crate::handle::PeerHandle;
use crate::media_control::{FeedbackDecision, LossIndicator, ReceiverFeedback, SourceControl};
use crate::packet::{DataMessage, MediaKind, RtcpPacket, RtpPacket};
use crate::policy::{resolve_destinations, ContentKind, MediaSelector, SubscriberSnapshot, SubscriberTable};
use crate::port::CoreCommunicationPort;
use crate::rtcp::{self, FeedbackSummary};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sfu_config::SfuConfig;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// SSRCs remembered per session; simulcast needs a handful per kind
const MAX_TRACKED_SSRCS: usize = 16;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Registered, no media negotiated yet
    Created,
    /// Transport is up, waiting for the first packet
    MediaSetup,
    /// Media is flowing and gets forwarded
    Active,
    /// Media released; may be set up again
    TornDown,
    /// Removed from the registry
    Destroyed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::MediaSetup => "media_setup",
            SessionState::Active => "active",
            SessionState::TornDown => "torn_down",
            SessionState::Destroyed => "destroyed",
        }
    }
}

/// Receive side of a subscription, held by the subscriber
#[derive(Debug, Clone)]
struct Subscription {
    source: Weak<Session>,
    kinds: ContentKind,
}

/// Outbound channel of one label towards this session
#[derive(Debug)]
enum OutboundChannel {
    /// The channel-creating message is with the port; later messages wait
    Opening(Vec<DataMessage>),
    Open,
}

/// Data channel bookkeeping
#[derive(Debug, Default)]
struct DataChannels {
    /// Subprotocol latched from the first inbound message of each label
    inbound: HashMap<String, Option<String>>,
    /// Channels relayed to this session, by label
    outbound: HashMap<String, OutboundChannel>,
}

#[derive(Debug, Default)]
struct SessionStats {
    rtp_received: AtomicU64,
    rtcp_received: AtomicU64,
    data_received: AtomicU64,
    bytes_received: AtomicU64,
    relayed: AtomicU64,
    dropped: AtomicU64,
    keyframe_requests: AtomicU64,
    remb_sent: AtomicU64,
    /// Unix milliseconds of the last accepted packet, 0 when none
    last_rtp_ms: AtomicI64,
    last_rtcp_ms: AtomicI64,
    last_data_ms: AtomicI64,
}

fn load_instant(millis: &AtomicI64) -> Option<DateTime<Utc>> {
    match millis.load(Ordering::Relaxed) {
        0 => None,
        ms => Utc.timestamp_millis_opt(ms).single(),
    }
}

impl SessionStats {
    fn snapshot(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            rtp_received: self.rtp_received.load(Ordering::Relaxed),
            rtcp_received: self.rtcp_received.load(Ordering::Relaxed),
            data_received: self.data_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            keyframe_requests: self.keyframe_requests.load(Ordering::Relaxed),
            remb_sent: self.remb_sent.load(Ordering::Relaxed),
            last_rtp_at: load_instant(&self.last_rtp_ms),
            last_rtcp_at: load_instant(&self.last_rtcp_ms),
            last_data_at: load_instant(&self.last_data_ms),
        }
    }
}

/// Counters of one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatsSnapshot {
    /// RTP packets received from the peer
    pub rtp_received: u64,
    /// RTCP compounds received from the peer
    pub rtcp_received: u64,
    /// Data channel messages received from the peer
    pub data_received: u64,
    /// Bytes of accepted packets and messages
    pub bytes_received: u64,
    /// Relays handed to the port, one per destination
    pub relayed: u64,
    /// Packets dropped by state gating or validation
    pub dropped: u64,
    /// Keyframe requests sent to the peer
    pub keyframe_requests: u64,
    /// REMB messages sent to the peer
    pub remb_sent: u64,
    /// Arrival of the last accepted RTP packet
    pub last_rtp_at: Option<DateTime<Utc>>,
    /// Arrival of the last accepted RTCP compound
    pub last_rtcp_at: Option<DateTime<Utc>>,
    /// Arrival of the last accepted data channel message
    pub last_data_at: Option<DateTime<Utc>>,
}

/// One side of a forwarding relationship in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerLink {
    /// The other session
    pub peer: PeerHandle,
    /// Media kinds forwarded over this link
    pub media: Vec<MediaSelector>,
    /// What this session last reported about the peer, on subscriptions only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<LossIndicator>,
}

/// Serializable view of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Host handle of the session
    pub handle: PeerHandle,
    /// Lifecycle state at the time of the query
    pub state: SessionState,
    /// Whether the peer completed a signaling `join`
    pub joined: bool,
    /// When the registry created the session
    pub created_at: DateTime<Utc>,
    /// Peers this session forwards to
    pub subscribers: Vec<PeerLink>,
    /// Peers this session receives from, with loss indicators
    pub subscriptions: Vec<PeerLink>,
    /// REMB value last sent to this peer
    pub bitrate_cap_bps: Option<u32>,
    /// Counters and last-seen times
    pub stats: SessionStatsSnapshot,
}

/// REMB updates decided under a lock, sent after it
type PendingRembs = Vec<(Arc<Session>, u32)>;

fn send_pending(rembs: PendingRembs) {
    for (session, bitrate_bps) in rembs {
        session.send_remb(bitrate_bps);
    }
}

/// Media session of one peer
pub struct Session {
    handle: PeerHandle,
    created_at: DateTime<Utc>,
    port: Arc<dyn CoreCommunicationPort>,
    config: Arc<SfuConfig>,
    state: RwLock<SessionState>,
    joined: AtomicBool,
    subscribers: RwLock<SubscriberTable>,
    subscriptions: Mutex<BTreeMap<PeerHandle, Subscription>>,
    feedback: Mutex<ReceiverFeedback>,
    control: Mutex<SourceControl>,
    data: Mutex<DataChannels>,
    /// SSRCs seen on this session's RTP
    ssrcs: RwLock<HashSet<u32>>,
    stats: SessionStats,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.handle)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(handle: PeerHandle, port: Arc<dyn CoreCommunicationPort>, config: Arc<SfuConfig>) -> Self {
        Session {
            handle,
            created_at: Utc::now(),
            port,
            config,
            state: RwLock::new(SessionState::Created),
            joined: AtomicBool::new(false),
            subscribers: RwLock::new(SubscriberTable::new()),
            subscriptions: Mutex::new(BTreeMap::new()),
            feedback: Mutex::new(ReceiverFeedback::new()),
            control: Mutex::new(SourceControl::new()),
            data: Mutex::new(DataChannels::default()),
            ssrcs: RwLock::new(HashSet::new()),
            stats: SessionStats::default(),
        }
    }

    pub fn handle(&self) -> PeerHandle {
        self.handle
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::Acquire)
    }

    /// Returns true the first time the session joins
    pub(crate) fn mark_joined(&self) -> bool {
        !self.joined.swap(true, Ordering::AcqRel)
    }

    pub fn stats(&self) -> SessionStatsSnapshot {
        self.stats.snapshot()
    }

    /// Transport negotiated: get ready to accept media
    pub fn setup_media(&self) -> SfuResult<()> {
        {
            let mut state = self.state.write();
            match *state {
                SessionState::Created | SessionState::TornDown => *state = SessionState::MediaSetup,
                SessionState::MediaSetup | SessionState::Active => return Ok(()),
                SessionState::Destroyed => {
                    return Err(SfuError::InvalidStateTransition {
                        from: SessionState::Destroyed,
                        to: SessionState::MediaSetup,
                    })
                }
            }
        }
        info!(handle = %self.handle, "Media setup");
        events::emit(self.port.as_ref(), self.handle, SessionEvent::MediaSetup);
        Ok(())
    }

    /// Release media and the forwarding policy
    ///
    /// Returns false when there was nothing to tear down.
    pub fn cleanup_media(&self) -> bool {
        let pending = {
            let mut state = self.state.write();
            if matches!(*state, SessionState::TornDown | SessionState::Destroyed) {
                return false;
            }
            *state = SessionState::TornDown;
            let released = self.subscribers.write().clear();
            self.release_policy(released)
        };
        info!(handle = %self.handle, "Media torn down");
        events::emit(self.port.as_ref(), self.handle, SessionEvent::TornDown);
        send_pending(pending);
        true
    }

    /// Final teardown once the registry dropped the session
    pub(crate) fn destroy(&self) {
        let (pending, was_torn_down) = {
            let mut state = self.state.write();
            if *state == SessionState::Destroyed {
                return;
            }
            let was_torn_down = *state == SessionState::TornDown;
            *state = SessionState::Destroyed;
            let released = self.subscribers.write().close();
            (self.release_policy(released), was_torn_down)
        };
        if !was_torn_down {
            events::emit(self.port.as_ref(), self.handle, SessionEvent::TornDown);
        }
        send_pending(pending);
        info!(handle = %self.handle, "Session destroyed");
        events::emit(self.port.as_ref(), self.handle, SessionEvent::Destroyed);
    }

    /// Detach both directions of every forwarding relationship
    ///
    /// Runs with the state write lock held and the own subscriber table
    /// already emptied; `released` is what the table held.
    fn release_policy(&self, released: SubscriberSnapshot) -> PendingRembs {
        let mut pending = PendingRembs::new();
        let config = &self.config.media;

        // Sources we received from
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for (source_handle, subscription) in subscriptions {
            let Some(source) = subscription.source.upgrade() else {
                continue;
            };
            source.subscribers.write().remove(self.handle);
            if let Some(bps) = source.control.lock().remove_reporter(self.handle, config) {
                pending.push((Arc::clone(&source), bps));
            }
            debug!(handle = %self.handle, source = %source_handle, "Subscription released");
        }

        // Subscribers we forwarded to
        for (subscriber_handle, entry) in released.iter() {
            let Some(subscriber) = entry.session.upgrade() else {
                continue;
            };
            let mut their_subscriptions = subscriber.subscriptions.lock();
            // A fresh subscription may have been made since the table was cleared
            if !self.subscribers.read().contains(*subscriber_handle) {
                their_subscriptions.remove(&self.handle);
                subscriber.feedback.lock().forget(self.handle);
            }
        }

        self.feedback.lock().clear();
        self.control.lock().clear();
        *self.data.lock() = DataChannels::default();
        self.ssrcs.write().clear();

        pending
    }

    /// Gate media on the lifecycle; the first packet in MediaSetup promotes
    fn admit(&self) -> bool {
        match self.state() {
            SessionState::Active => return true,
            SessionState::MediaSetup => {}
            _ => return false,
        }
        {
            let mut state = self.state.write();
            match *state {
                SessionState::MediaSetup => *state = SessionState::Active,
                SessionState::Active => return true,
                _ => return false,
            }
        }
        info!(handle = %self.handle, "Session active");
        events::emit(self.port.as_ref(), self.handle, SessionEvent::Active);
        true
    }

    fn drop_packet(&self, what: &'static str, reason: &'static str) {
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        debug!(handle = %self.handle, state = self.state().as_str(), reason, "Dropping {}", what);
    }

    fn count_received(&self, counter: &AtomicU64, last_seen: &AtomicI64, bytes: usize) {
        counter.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        last_seen.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn note_ssrc(&self, ssrc: u32) {
        if self.ssrcs.read().contains(&ssrc) {
            return;
        }
        let mut ssrcs = self.ssrcs.write();
        if ssrcs.len() < MAX_TRACKED_SSRCS {
            ssrcs.insert(ssrc);
        }
    }

    /// Whether this session's peer sends the stream `ssrc`
    pub fn sends_ssrc(&self, ssrc: u32) -> bool {
        self.ssrcs.read().contains(&ssrc)
    }

    fn destinations(&self, kind: ContentKind) -> Vec<Arc<Session>> {
        let snapshot = self.subscribers.read().snapshot();
        resolve_destinations(&snapshot, self.handle, kind)
    }

    /// Sources this session receives `kind` from
    fn sources_for(&self, kind: ContentKind) -> Vec<Arc<Session>> {
        self.subscriptions
            .lock()
            .values()
            .filter(|subscription| subscription.kinds.contains(kind))
            .filter_map(|subscription| subscription.source.upgrade())
            .collect()
    }

    /// Forward an RTP packet to every subscriber of its kind
    pub fn handle_rtp(&self, packet: RtpPacket) {
        if !packet.is_well_formed() {
            return self.drop_packet("rtp", "malformed");
        }
        if !self.admit() {
            return self.drop_packet("rtp", "not active");
        }
        self.count_received(&self.stats.rtp_received, &self.stats.last_rtp_ms, packet.payload().len());
        if let Some(ssrc) = packet.ssrc() {
            self.note_ssrc(ssrc);
        }

        for destination in self.destinations(packet.kind().into()) {
            self.port.relay_rtp(destination.handle, packet.clone());
            self.stats.relayed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Act on receiver feedback and relay everything else
    pub fn handle_rtcp(&self, packet: RtcpPacket) {
        if !packet.is_well_formed() {
            return self.drop_packet("rtcp", "malformed");
        }
        if !self.admit() {
            return self.drop_packet("rtcp", "not active");
        }
        self.count_received(&self.stats.rtcp_received, &self.stats.last_rtcp_ms, packet.payload().len());

        let summary = rtcp::inspect(packet.payload());
        if summary.wants_keyframe() || !summary.reports.is_empty() || summary.remb_bps.is_some() {
            self.apply_feedback(packet.kind(), &summary);
        }
        if summary.is_feedback_only() {
            trace!(handle = %self.handle, "Feedback consumed");
            return;
        }

        for destination in self.destinations(packet.kind().into()) {
            self.port.relay_rtcp(destination.handle, packet.clone());
            self.stats.relayed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn apply_feedback(&self, kind: MediaKind, summary: &FeedbackSummary) {
        let sources = self.sources_for(kind.into());
        if sources.is_empty() {
            return;
        }
        let config = &self.config.media;

        let mut loss_by_source: HashMap<PeerHandle, f32> = HashMap::new();
        let mut unmatched_loss: Option<f32> = None;
        for block in &summary.reports {
            let loss = block.loss_fraction();
            let owners = owners_of(&sources, block.ssrc);
            if owners.is_empty() {
                let slot = unmatched_loss.get_or_insert(loss);
                *slot = (*slot).max(loss);
            }
            for owner in owners {
                let slot = loss_by_source.entry(owner).or_insert(loss);
                *slot = (*slot).max(loss);
            }
        }

        let mut keyframe_for: HashSet<PeerHandle> = HashSet::new();
        // A PLI/FIR without a usable media SSRC targets every source
        let mut keyframe_for_all = summary.wants_keyframe() && summary.keyframe_ssrcs.is_empty();
        for ssrc in &summary.keyframe_ssrcs {
            let owners = owners_of(&sources, *ssrc);
            if owners.is_empty() {
                keyframe_for_all = true;
            }
            keyframe_for.extend(owners);
        }

        for source in sources {
            let loss = loss_by_source.get(&source.handle).copied().or(unmatched_loss);
            let decision = if loss.is_some() || summary.remb_bps.is_some() {
                self.feedback
                    .lock()
                    .on_report(source.handle, loss, summary.remb_bps, config)
            } else {
                FeedbackDecision::default()
            };
            let explicit = keyframe_for_all || keyframe_for.contains(&source.handle);
            // Keyframes only exist for video
            if kind.is_video() && (explicit || decision.request_keyframe) {
                source.request_keyframe(self.handle, kind);
            }
            if let Some(ceiling) = decision.ceiling_bps {
                source.apply_ceiling(self.handle, ceiling);
            }
        }
    }

    /// Relay a data channel message, creating channels on first use
    pub fn handle_data(&self, message: DataMessage) {
        if !self.admit() {
            return self.drop_packet("data", "not active");
        }
        self.count_received(&self.stats.data_received, &self.stats.last_data_ms, message.payload.len());

        let protocol = self
            .data
            .lock()
            .inbound
            .entry(message.label.clone())
            .or_insert_with(|| message.protocol.clone())
            .clone();

        for destination in self.destinations(ContentKind::DATA) {
            self.relay_data_to(&destination, &message, &protocol);
        }
    }

    /// Relay one message, passing `protocol` only when it creates the channel
    ///
    /// Messages on a label whose creating message is still with the port are
    /// queued and flushed by the creator, so the host always sees the
    /// channel-creating message first.
    fn relay_data_to(&self, destination: &Session, message: &DataMessage, protocol: &Option<String>) {
        let plain = DataMessage {
            protocol: None,
            ..message.clone()
        };
        let creates_channel = match destination.data.lock().outbound.entry(message.label.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(OutboundChannel::Opening(Vec::new()));
                true
            }
            Entry::Occupied(mut entry) => match entry.get_mut() {
                OutboundChannel::Opening(waiting) => {
                    waiting.push(plain);
                    self.stats.relayed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                OutboundChannel::Open => false,
            },
        };
        self.stats.relayed.fetch_add(1, Ordering::Relaxed);

        if !creates_channel {
            self.port.relay_data(destination.handle, plain);
            return;
        }

        let creating = DataMessage {
            protocol: protocol.clone(),
            ..plain
        };
        self.port.relay_data(destination.handle, creating);

        loop {
            let waiting = {
                let mut data = destination.data.lock();
                // Gone when the destination was torn down meanwhile
                let Some(channel) = data.outbound.get_mut(&message.label) else {
                    break;
                };
                let waiting = match &mut *channel {
                    OutboundChannel::Opening(waiting) => std::mem::take(waiting),
                    OutboundChannel::Open => break,
                };
                if waiting.is_empty() {
                    *channel = OutboundChannel::Open;
                    break;
                }
                waiting
            };
            for queued in waiting {
                self.port.relay_data(destination.handle, queued);
            }
        }
    }

    /// Ask this session's peer for a keyframe, subject to throttling
    pub fn request_keyframe(&self, reporter: PeerHandle, kind: MediaKind) -> bool {
        if !self.is_active() {
            return false;
        }
        let interval = Duration::from_millis(self.config.media.keyframe_min_interval_ms);
        if !self.control.lock().allow_keyframe(Instant::now(), interval) {
            trace!(handle = %self.handle, reporter = %reporter, "Keyframe request throttled");
            return false;
        }

        self.port.send_pli(self.handle);
        self.stats.keyframe_requests.fetch_add(1, Ordering::Relaxed);
        debug!(handle = %self.handle, reporter = %reporter, "Keyframe requested");
        events::emit(
            self.port.as_ref(),
            self.handle,
            SessionEvent::KeyframeRequested { reporter, kind },
        );
        true
    }

    fn apply_ceiling(&self, reporter: PeerHandle, bitrate_bps: u32) {
        let remb = self
            .control
            .lock()
            .update_ceiling(reporter, bitrate_bps, &self.config.media);
        if let Some(bps) = remb {
            self.send_remb(bps);
        }
    }

    fn send_remb(&self, bitrate_bps: u32) {
        if matches!(self.state(), SessionState::TornDown | SessionState::Destroyed) {
            return;
        }
        self.port.send_remb(self.handle, bitrate_bps);
        self.stats.remb_sent.fetch_add(1, Ordering::Relaxed);
        debug!(handle = %self.handle, bitrate_bps, "REMB sent");
        events::emit(
            self.port.as_ref(),
            self.handle,
            SessionEvent::BitrateCapped { bitrate_bps },
        );
    }

    /// React to the host's slow-link notification
    ///
    /// A slow uplink means this peer sends more than its link carries, so it
    /// is asked to slow down. A slow downlink lowers what this peer's
    /// sources may send towards it.
    pub fn slow_link(&self, uplink: bool, video: bool) {
        if !self.is_active() {
            return;
        }
        let config = &self.config.media;
        if uplink {
            let bps = self.control.lock().on_slow_uplink(config);
            self.send_remb(bps);
            return;
        }
        let kind = MediaKind::from_video_flag(video);
        for source in self.sources_for(kind.into()) {
            let ceiling = self.feedback.lock().on_slow_link(source.handle, config);
            source.apply_ceiling(self.handle, ceiling);
        }
    }

    /// Make `subscriber` receive `kinds` from `source`
    ///
    /// Subscribing again widens the kinds. Returns the resulting kinds.
    pub(crate) fn subscribe(
        subscriber: &Arc<Session>,
        source: &Arc<Session>,
        kinds: ContentKind,
    ) -> SfuResult<ContentKind> {
        if subscriber.handle == source.handle {
            return Err(SfuError::InvalidMessage(
                "a session cannot subscribe to itself".to_string(),
            ));
        }

        let state = subscriber.state.read();
        if *state == SessionState::Destroyed {
            return Err(SfuError::NotFound {
                handle: subscriber.handle,
            });
        }
        let mut subscriptions = subscriber.subscriptions.lock();
        let granted = source
            .subscribers
            .write()
            .insert(subscriber.handle, Arc::downgrade(subscriber), kinds)
            .ok_or(SfuError::NotFound {
                handle: source.handle,
            })?;
        subscriptions.insert(
            source.handle,
            Subscription {
                source: Arc::downgrade(source),
                kinds: granted,
            },
        );
        drop(subscriptions);
        drop(state);

        debug!(handle = %subscriber.handle, source = %source.handle, kinds = ?granted, "Subscribed");
        Ok(granted)
    }

    /// Stop receiving from `source`; returns whether a subscription existed
    pub(crate) fn unsubscribe(&self, source: PeerHandle) -> bool {
        let source_session = {
            let mut subscriptions = self.subscriptions.lock();
            let Some(subscription) = subscriptions.remove(&source) else {
                return false;
            };
            let source_session = subscription.source.upgrade();
            if let Some(source_session) = &source_session {
                source_session.subscribers.write().remove(self.handle);
            }
            source_session
        };
        self.feedback.lock().forget(source);

        if let Some(source_session) = source_session {
            let remb = source_session
                .control
                .lock()
                .remove_reporter(self.handle, &self.config.media);
            if let Some(bps) = remb {
                source_session.send_remb(bps);
            }
        }
        debug!(handle = %self.handle, source = %source, "Unsubscribed");
        true
    }

    /// Point-in-time view for diagnostics
    pub fn query(&self) -> SessionSnapshot {
        let state = self.state();
        let subscribers = self
            .subscribers
            .read()
            .snapshot()
            .iter()
            .map(|(peer, entry)| PeerLink {
                peer: *peer,
                media: entry.kinds.selectors(),
                loss: None,
            })
            .collect();
        let mut subscriptions: Vec<PeerLink> = self
            .subscriptions
            .lock()
            .iter()
            .map(|(peer, subscription)| PeerLink {
                peer: *peer,
                media: subscription.kinds.selectors(),
                loss: None,
            })
            .collect();
        {
            let feedback = self.feedback.lock();
            for link in &mut subscriptions {
                link.loss = feedback.indicator(link.peer);
            }
        }
        let bitrate_cap_bps = self.control.lock().last_sent_bps();

        SessionSnapshot {
            handle: self.handle,
            state,
            joined: self.is_joined(),
            created_at: self.created_at,
            subscribers,
            subscriptions,
            bitrate_cap_bps,
            stats: self.stats.snapshot(),
        }
    }
}

fn owners_of(sources: &[Arc<Session>], ssrc: u32) -> Vec<PeerHandle> {
    sources
        .iter()
        .filter(|source| source.sends_ssrc(ssrc))
        .map(|source| source.handle)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::RtpExtensions;
    use crate::port::RecordingPort;
    use crate::rtcp::{PayloadFeedback, ReceiverReport, ReceptionReport};

    fn session(port: &Arc<RecordingPort>, raw: u64) -> Arc<Session> {
        let port: Arc<dyn CoreCommunicationPort> = port.clone();
        Arc::new(Session::new(PeerHandle::new(raw), port, Arc::new(SfuConfig::default())))
    }

    fn rtp(kind: MediaKind) -> RtpPacket {
        let mut payload = vec![0x80, 96, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1];
        payload.extend_from_slice(b"frame");
        RtpPacket::new(kind, payload, RtpExtensions::default())
    }

    fn rtp_from(kind: MediaKind, ssrc: u32) -> RtpPacket {
        let mut payload = vec![0x80, 96, 0, 1, 0, 0, 0, 0];
        payload.extend_from_slice(&ssrc.to_be_bytes());
        payload.extend_from_slice(b"frame");
        RtpPacket::new(kind, payload, RtpExtensions::default())
    }

    fn lossy_report(fraction_lost: u8) -> RtcpPacket {
        report_about(0x1234, fraction_lost)
    }

    fn report_about(ssrc: u32, fraction_lost: u8) -> RtcpPacket {
        let block = ReceptionReport {
            ssrc,
            fraction_lost,
            cumulative_packets_lost: 10,
            extended_sequence_number: 500,
            jitter: 0,
            last_sr_timestamp: 0,
            delay_since_last_sr: 0,
        };
        RtcpPacket::new(MediaKind::Video, ReceiverReport::new(0x5678, vec![block]).serialize().freeze())
    }

    fn activate(session: &Session) {
        session.setup_media().unwrap();
        session.handle_rtp(rtp(MediaKind::Audio));
        assert!(session.is_active());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let port = Arc::new(RecordingPort::new());
        let s = session(&port, 1);
        assert_eq!(s.state(), SessionState::Created);

        s.setup_media().unwrap();
        s.setup_media().unwrap();
        assert_eq!(s.state(), SessionState::MediaSetup);

        assert!(s.cleanup_media());
        assert!(!s.cleanup_media());
        assert_eq!(s.state(), SessionState::TornDown);

        // Renegotiation on the same handle
        s.setup_media().unwrap();
        assert_eq!(s.state(), SessionState::MediaSetup);

        s.destroy();
        assert_eq!(s.state(), SessionState::Destroyed);
        assert_eq!(
            s.setup_media(),
            Err(SfuError::InvalidStateTransition {
                from: SessionState::Destroyed,
                to: SessionState::MediaSetup,
            })
        );
        assert!(!s.cleanup_media());
    }

    #[test]
    fn test_media_before_setup_dropped() {
        let port = Arc::new(RecordingPort::new());
        let source = session(&port, 1);
        let viewer = session(&port, 2);
        activate(&viewer);
        Session::subscribe(&viewer, &source, ContentKind::all()).unwrap();

        source.handle_rtp(rtp(MediaKind::Video));
        source.handle_data(DataMessage::text("chat", "hi"));
        source.handle_rtcp(lossy_report(0));

        assert_eq!(source.state(), SessionState::Created);
        assert_eq!(source.stats().dropped, 3);
        assert!(port.rtp_to(viewer.handle()).is_empty());
        assert!(port.data_to(viewer.handle()).is_empty());
    }

    #[test]
    fn test_malformed_packet_does_not_promote() {
        let port = Arc::new(RecordingPort::new());
        let s = session(&port, 1);
        s.setup_media().unwrap();

        s.handle_rtp(RtpPacket::new(MediaKind::Audio, vec![0x80, 0], RtpExtensions::default()));
        assert_eq!(s.state(), SessionState::MediaSetup);
        assert_eq!(s.stats().dropped, 1);
    }

    #[test]
    fn test_rtp_relayed_verbatim_to_active_subscribers() {
        let port = Arc::new(RecordingPort::new());
        let source = session(&port, 1);
        let viewer = session(&port, 2);
        let idle = session(&port, 3);
        let audio_only = session(&port, 4);
        activate(&viewer);
        activate(&audio_only);
        idle.setup_media().unwrap();

        Session::subscribe(&viewer, &source, ContentKind::all()).unwrap();
        Session::subscribe(&idle, &source, ContentKind::all()).unwrap();
        Session::subscribe(&audio_only, &source, ContentKind::AUDIO).unwrap();

        source.setup_media().unwrap();
        let extensions = RtpExtensions {
            video_rotation: 90,
            video_flipped: true,
            ..RtpExtensions::default()
        };
        let packet = RtpPacket::new(MediaKind::Video, rtp(MediaKind::Video).payload().clone(), extensions);
        source.handle_rtp(packet.clone());

        assert!(source.is_active());
        assert_eq!(port.rtp_to(viewer.handle()), vec![packet]);
        assert!(port.rtp_to(idle.handle()).is_empty());
        assert!(port.rtp_to(audio_only.handle()).is_empty());
        assert_eq!(source.stats().relayed, 1);
    }

    #[test]
    fn test_subscribe_to_self_rejected() {
        let port = Arc::new(RecordingPort::new());
        let s = session(&port, 1);
        let err = Session::subscribe(&s, &s, ContentKind::all()).unwrap_err();
        assert_eq!(err.code(), 400);
    }

    #[test]
    fn test_subscribe_to_destroyed_source_rejected() {
        let port = Arc::new(RecordingPort::new());
        let source = session(&port, 1);
        let viewer = session(&port, 2);
        source.destroy();

        assert_eq!(
            Session::subscribe(&viewer, &source, ContentKind::all()),
            Err(SfuError::NotFound { handle: source.handle() })
        );
        assert!(viewer.query().subscriptions.is_empty());
    }

    #[test]
    fn test_data_protocol_latched_per_label_and_destination() {
        let port = Arc::new(RecordingPort::new());
        let source = session(&port, 1);
        let early = session(&port, 2);
        let late = session(&port, 3);
        activate(&source);
        activate(&early);
        activate(&late);
        Session::subscribe(&early, &source, ContentKind::DATA).unwrap();

        source.handle_data(DataMessage::text("chat", "one").with_protocol("json"));
        source.handle_data(DataMessage::text("chat", "two").with_protocol("ignored"));
        Session::subscribe(&late, &source, ContentKind::DATA).unwrap();
        source.handle_data(DataMessage::binary("chat", "three"));

        let early_messages = port.data_to(early.handle());
        assert_eq!(early_messages.len(), 3);
        assert_eq!(early_messages[0].protocol.as_deref(), Some("json"));
        assert_eq!(early_messages[1].protocol, None);
        assert_eq!(early_messages[2].protocol, None);
        assert!(early_messages[2].binary);

        let late_messages = port.data_to(late.handle());
        assert_eq!(late_messages.len(), 1);
        assert_eq!(late_messages[0].protocol.as_deref(), Some("json"));
        assert_eq!(late_messages[0].payload, bytes::Bytes::from_static(b"three"));
    }

    /// Delivers a second message on the label from inside the first relay,
    /// the way another host thread could while the first is in flight
    #[derive(Default)]
    struct ReentrantPort {
        inner: RecordingPort,
        source: Mutex<Option<Weak<Session>>>,
        fired: AtomicBool,
    }

    impl CoreCommunicationPort for ReentrantPort {
        fn push_event(
            &self,
            handle: PeerHandle,
            transaction: Option<&str>,
            message: serde_json::Value,
            jsep: Option<serde_json::Value>,
        ) -> SfuResult<()> {
            self.inner.push_event(handle, transaction, message, jsep)
        }
        fn relay_rtp(&self, handle: PeerHandle, packet: RtpPacket) {
            self.inner.relay_rtp(handle, packet)
        }
        fn relay_rtcp(&self, handle: PeerHandle, packet: RtcpPacket) {
            self.inner.relay_rtcp(handle, packet)
        }
        fn relay_data(&self, handle: PeerHandle, message: DataMessage) {
            if !self.fired.swap(true, Ordering::SeqCst) {
                let source = self.source.lock().as_ref().and_then(Weak::upgrade);
                if let Some(source) = source {
                    source.handle_data(DataMessage::text("chat", "second"));
                }
            }
            self.inner.relay_data(handle, message)
        }
        fn send_pli(&self, handle: PeerHandle) {
            self.inner.send_pli(handle)
        }
        fn send_remb(&self, handle: PeerHandle, bitrate_bps: u32) {
            self.inner.send_remb(handle, bitrate_bps)
        }
        fn close_pc(&self, handle: PeerHandle) {
            self.inner.close_pc(handle)
        }
        fn end_session(&self, handle: PeerHandle) {
            self.inner.end_session(handle)
        }
        fn events_is_enabled(&self) -> bool {
            false
        }
        fn notify_event(&self, handle: PeerHandle, event: serde_json::Value) {
            self.inner.notify_event(handle, event)
        }
        fn auth_is_signature_valid(&self, _token: &str) -> bool {
            false
        }
        fn auth_signature_contains(&self, _token: &str, _descriptor: &str) -> bool {
            false
        }
    }

    #[test]
    fn test_channel_creating_message_reaches_host_first() {
        let port = Arc::new(ReentrantPort::default());
        let dyn_port: Arc<dyn CoreCommunicationPort> = port.clone();
        let config = Arc::new(SfuConfig::default());
        let source = Arc::new(Session::new(PeerHandle::new(1), Arc::clone(&dyn_port), Arc::clone(&config)));
        let viewer = Arc::new(Session::new(PeerHandle::new(2), dyn_port, config));
        activate(&source);
        activate(&viewer);
        Session::subscribe(&viewer, &source, ContentKind::DATA).unwrap();
        *port.source.lock() = Some(Arc::downgrade(&source));

        source.handle_data(DataMessage::text("chat", "first").with_protocol("json"));

        let relayed = port.inner.data_to(viewer.handle());
        assert_eq!(relayed.len(), 2);
        assert_eq!(relayed[0].payload, bytes::Bytes::from_static(b"first"));
        assert_eq!(relayed[0].protocol.as_deref(), Some("json"));
        assert_eq!(relayed[1].payload, bytes::Bytes::from_static(b"second"));
        assert_eq!(relayed[1].protocol, None);
        assert_eq!(source.stats().relayed, 2);

        // The channel is open now; later messages go straight through
        source.handle_data(DataMessage::text("chat", "third"));
        assert_eq!(port.inner.data_to(viewer.handle()).len(), 3);
    }

    #[test]
    fn test_loss_event_requests_one_keyframe() {
        let port = Arc::new(RecordingPort::new());
        let source = session(&port, 1);
        let viewer = session(&port, 2);
        activate(&source);
        activate(&viewer);
        Session::subscribe(&viewer, &source, ContentKind::VIDEO).unwrap();

        viewer.handle_rtcp(lossy_report(64));
        viewer.handle_rtcp(lossy_report(80));

        assert_eq!(port.plis_to(source.handle()), 1);
        assert_eq!(port.plis_to(viewer.handle()), 0);
        // 1 Mbps * (1 - 0.5 * 0.25), then * (1 - 0.5 * 0.3125)
        assert_eq!(port.rembs_to(source.handle()), vec![875_000, 738_281]);
        // Receiver reports are consumed, not relayed
        assert!(port.rtcp_to(source.handle()).is_empty());
        assert_eq!(source.query().bitrate_cap_bps, Some(738_281));
    }

    #[test]
    fn test_feedback_reaches_only_the_reported_source() {
        let port = Arc::new(RecordingPort::new());
        let a = session(&port, 1);
        let b = session(&port, 2);
        let viewer = session(&port, 3);
        for source in [&a, &b] {
            source.setup_media().unwrap();
        }
        a.handle_rtp(rtp_from(MediaKind::Video, 0xAAAA));
        b.handle_rtp(rtp_from(MediaKind::Video, 0xBBBB));
        activate(&viewer);
        Session::subscribe(&viewer, &a, ContentKind::VIDEO).unwrap();
        Session::subscribe(&viewer, &b, ContentKind::VIDEO).unwrap();
        assert!(a.sends_ssrc(0xAAAA));
        assert!(!a.sends_ssrc(0xBBBB));

        viewer.handle_rtcp(report_about(0xAAAA, 128));
        assert_eq!(port.plis_to(a.handle()), 1);
        assert_eq!(port.rembs_to(a.handle()), vec![750_000]);
        assert_eq!(port.plis_to(b.handle()), 0);
        assert!(port.rembs_to(b.handle()).is_empty());

        // An explicit PLI names its media SSRC as well
        let pli = PayloadFeedback::PictureLoss {
            sender_ssrc: 3,
            media_ssrc: 0xBBBB,
        };
        viewer.handle_rtcp(RtcpPacket::new(MediaKind::Video, pli.serialize().freeze()));
        assert_eq!(port.plis_to(a.handle()), 1);
        assert_eq!(port.plis_to(b.handle()), 1);
    }

    #[test]
    fn test_feedback_about_unknown_ssrc_reaches_every_source() {
        let port = Arc::new(RecordingPort::new());
        let a = session(&port, 1);
        let b = session(&port, 2);
        let viewer = session(&port, 3);
        for s in [&a, &b, &viewer] {
            activate(s);
        }
        Session::subscribe(&viewer, &a, ContentKind::VIDEO).unwrap();
        Session::subscribe(&viewer, &b, ContentKind::VIDEO).unwrap();

        viewer.handle_rtcp(report_about(0x9999, 128));
        assert_eq!(port.plis_to(a.handle()), 1);
        assert_eq!(port.plis_to(b.handle()), 1);
    }

    #[test]
    fn test_query_reports_last_seen_and_loss() {
        let port = Arc::new(RecordingPort::new());
        let source = session(&port, 1);
        let viewer = session(&port, 2);
        source.setup_media().unwrap();
        viewer.setup_media().unwrap();

        let before = viewer.query();
        assert_eq!(before.stats.last_rtp_at, None);
        assert_eq!(before.stats.last_rtcp_at, None);
        assert_eq!(before.stats.last_data_at, None);

        let start = Utc::now() - chrono::Duration::milliseconds(1);
        source.handle_rtp(rtp_from(MediaKind::Video, 0xAAAA));
        let stats = source.query().stats;
        assert!(stats.last_rtp_at.unwrap() >= start);
        assert_eq!(stats.last_rtcp_at, None);

        viewer.handle_rtp(rtp(MediaKind::Audio));
        viewer.handle_data(DataMessage::text("chat", "hi"));
        Session::subscribe(&viewer, &source, ContentKind::VIDEO).unwrap();
        viewer.handle_rtcp(report_about(0xAAAA, 128));

        let stats = viewer.query().stats;
        assert!(stats.last_rtcp_at.unwrap() >= start);
        assert!(stats.last_data_at.unwrap() >= start);

        let snapshot = viewer.query();
        assert_eq!(
            snapshot.subscriptions[0].loss,
            Some(LossIndicator {
                in_loss_event: true,
                last_loss: Some(0.5),
            })
        );
        assert_eq!(source.query().subscribers[0].loss, None);
    }

    #[test]
    fn test_sender_report_relayed_to_subscribers() {
        let port = Arc::new(RecordingPort::new());
        let source = session(&port, 1);
        let viewer = session(&port, 2);
        activate(&source);
        activate(&viewer);
        Session::subscribe(&viewer, &source, ContentKind::VIDEO).unwrap();

        let mut sender_report = vec![0x80, 200, 0, 6];
        sender_report.extend_from_slice(&[0u8; 24]);
        let packet = RtcpPacket::new(MediaKind::Video, sender_report);
        source.handle_rtcp(packet.clone());

        assert_eq!(port.rtcp_to(viewer.handle()), vec![packet]);
    }

    #[test]
    fn test_cleanup_releases_both_directions() {
        let port = Arc::new(RecordingPort::new());
        let a = session(&port, 1);
        let b = session(&port, 2);
        let c = session(&port, 3);
        Session::subscribe(&b, &a, ContentKind::all()).unwrap();
        Session::subscribe(&a, &c, ContentKind::all()).unwrap();

        assert!(a.cleanup_media());

        let a_view = a.query();
        assert!(a_view.subscribers.is_empty());
        assert!(a_view.subscriptions.is_empty());
        assert!(b.query().subscriptions.is_empty());
        assert!(c.query().subscribers.is_empty());

        // The table stays open for renegotiation
        Session::subscribe(&b, &a, ContentKind::AUDIO).unwrap();
        assert_eq!(a.query().subscribers.len(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let port = Arc::new(RecordingPort::new());
        let source = session(&port, 1);
        let viewer = session(&port, 2);
        Session::subscribe(&viewer, &source, ContentKind::all()).unwrap();

        assert!(viewer.unsubscribe(source.handle()));
        assert!(!viewer.unsubscribe(source.handle()));
        assert!(source.query().subscribers.is_empty());
    }

    #[test]
    fn test_slow_uplink_sends_reduced_remb() {
        let port = Arc::new(RecordingPort::new());
        let s = session(&port, 1);
        s.slow_link(true, true);
        assert!(port.rembs_to(s.handle()).is_empty());

        activate(&s);
        s.slow_link(true, true);
        assert_eq!(port.rembs_to(s.handle()), vec![500_000]);
    }
}
