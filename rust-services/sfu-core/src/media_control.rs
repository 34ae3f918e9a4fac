//! Feedback-driven media control
//!
//! Two halves cooperate here:
//! - [`ReceiverFeedback`] lives on a subscribing session and turns its
//!   receiver reports into loss events and per-source bitrate ceilings.
//! - [`SourceControl`] lives on the sending session and throttles keyframe
//!   requests and aggregates the ceilings of all its receivers into a single
//!   REMB value.
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
use serde::{Deserialize, Serialize};
use sfu_config::MediaControlConfig;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Loss above which the estimate is decreased
const DECREASE_LOSS: f32 = 0.10;
/// Loss below which the estimate is increased
const INCREASE_LOSS: f32 = 0.02;
/// Multiplicative increase applied on a clean report
const INCREASE_FACTOR: f64 = 1.05;
/// Factor applied to an estimate when the host reports a slow link
const SLOW_LINK_FACTOR: f64 = 0.5;

fn clamp_bps(bps: f64, config: &MediaControlConfig) -> u32 {
    bps.round()
        .clamp(config.min_bitrate_bps as f64, config.max_bitrate_bps as f64) as u32
}

/// Reporter-side view of one source
#[derive(Debug, Clone)]
struct LossState {
    in_loss_event: bool,
    last_loss: Option<f32>,
    estimate_bps: f64,
}

impl LossState {
    fn new(config: &MediaControlConfig) -> Self {
        LossState {
            in_loss_event: false,
            last_loss: None,
            estimate_bps: clamp_bps(config.initial_bitrate_bps as f64, config) as f64,
        }
    }
}

/// Loss as last reported about one source
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossIndicator {
    /// Loss is above the threshold and a keyframe was already asked for
    pub in_loss_event: bool,
    /// Fraction lost (0.0 - 1.0) in the latest report block
    pub last_loss: Option<f32>,
}

/// What a receiver report asks for, for one source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedbackDecision {
    /// A loss event just opened
    pub request_keyframe: bool,
    /// Updated ceiling this reporter imposes on the source
    pub ceiling_bps: Option<u32>,
}

/// Loss tracking of one subscribing session, keyed by source
#[derive(Debug, Default)]
pub struct ReceiverFeedback {
    per_source: HashMap<PeerHandle, LossState>,
}

impl ReceiverFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one receiver report about `source`
    ///
    /// `loss` is the fraction lost (0.0 - 1.0) if the compound carried report
    /// blocks, `remb_bps` the receiver's own estimate if it sent one.
    pub fn on_report(
        &mut self,
        source: PeerHandle,
        loss: Option<f32>,
        remb_bps: Option<u64>,
        config: &MediaControlConfig,
    ) -> FeedbackDecision {
        let state = self
            .per_source
            .entry(source)
            .or_insert_with(|| LossState::new(config));
        let mut decision = FeedbackDecision::default();

        if let Some(loss) = loss {
            state.last_loss = Some(loss);
            if loss > config.loss_threshold {
                // Only the rising edge asks for a keyframe
                decision.request_keyframe = !state.in_loss_event;
                state.in_loss_event = true;
            } else {
                state.in_loss_event = false;
            }

            if loss > DECREASE_LOSS {
                state.estimate_bps *= 1.0 - 0.5 * loss as f64;
            } else if loss < INCREASE_LOSS {
                state.estimate_bps *= INCREASE_FACTOR;
            }
        }

        if let Some(remb) = remb_bps {
            state.estimate_bps = state.estimate_bps.min(remb as f64);
        }

        if loss.is_some() || remb_bps.is_some() {
            let ceiling = clamp_bps(state.estimate_bps, config);
            state.estimate_bps = ceiling as f64;
            decision.ceiling_bps = Some(ceiling);
        }

        decision
    }

    /// Halve the estimate for `source` after the host reported a slow downlink
    pub fn on_slow_link(&mut self, source: PeerHandle, config: &MediaControlConfig) -> u32 {
        let state = self
            .per_source
            .entry(source)
            .or_insert_with(|| LossState::new(config));
        let ceiling = clamp_bps(state.estimate_bps * SLOW_LINK_FACTOR, config);
        state.estimate_bps = ceiling as f64;
        ceiling
    }

    /// Loss indicators for `source`, if it was ever reported on
    pub fn indicator(&self, source: PeerHandle) -> Option<LossIndicator> {
        self.per_source.get(&source).map(|state| LossIndicator {
            in_loss_event: state.in_loss_event,
            last_loss: state.last_loss,
        })
    }

    pub fn forget(&mut self, source: PeerHandle) {
        self.per_source.remove(&source);
    }

    pub fn clear(&mut self) {
        self.per_source.clear();
    }
}

/// Control state of one sending session
#[derive(Debug, Default)]
pub struct SourceControl {
    last_keyframe_request: Option<Instant>,
    /// Ceiling imposed by each receiver (bps)
    ceilings: BTreeMap<PeerHandle, u32>,
    /// Last REMB value sent to this source
    last_sent_bps: Option<u32>,
}

impl SourceControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a keyframe request may be forwarded at `now`
    ///
    /// Records the request when allowed, so the interval is shared by every
    /// reporter of this source.
    pub fn allow_keyframe(&mut self, now: Instant, min_interval: Duration) -> bool {
        match self.last_keyframe_request {
            Some(last) if now.saturating_duration_since(last) < min_interval => false,
            _ => {
                self.last_keyframe_request = Some(now);
                true
            }
        }
    }

    /// Record a receiver's ceiling; returns the REMB to send, if any
    pub fn update_ceiling(
        &mut self,
        reporter: PeerHandle,
        bps: u32,
        config: &MediaControlConfig,
    ) -> Option<u32> {
        self.ceilings.insert(reporter, bps);
        self.reaggregate(config)
    }

    /// Drop a receiver's ceiling; returns the REMB to send, if any
    pub fn remove_reporter(&mut self, reporter: PeerHandle, config: &MediaControlConfig) -> Option<u32> {
        self.ceilings.remove(&reporter)?;
        self.reaggregate(config)
    }

    /// Reduced bitrate to ask of this source after a slow uplink
    pub fn on_slow_uplink(&mut self, config: &MediaControlConfig) -> u32 {
        let base = self
            .aggregate()
            .or(self.last_sent_bps)
            .unwrap_or(config.initial_bitrate_bps);
        let bps = clamp_bps(base as f64 * SLOW_LINK_FACTOR, config);
        self.last_sent_bps = Some(bps);
        bps
    }

    /// Lowest ceiling over all receivers
    pub fn aggregate(&self) -> Option<u32> {
        self.ceilings.values().copied().min()
    }

    pub fn last_sent_bps(&self) -> Option<u32> {
        self.last_sent_bps
    }

    pub fn clear(&mut self) {
        self.ceilings.clear();
        self.last_sent_bps = None;
        self.last_keyframe_request = None;
    }

    fn reaggregate(&mut self, config: &MediaControlConfig) -> Option<u32> {
        let target = match self.aggregate() {
            Some(bps) => bps,
            // Nobody constrains the source any more: lift a previous cap
            None => {
                let last = self.last_sent_bps.take()?;
                return (last < config.max_bitrate_bps).then_some(config.max_bitrate_bps);
            }
        };

        let changed = match self.last_sent_bps {
            None => true,
            Some(last) => {
                let delta = (target as f64 - last as f64).abs() / last.max(1) as f64;
                delta > config.bitrate_hysteresis as f64
            }
        };
        if !changed {
            return None;
        }
        self.last_sent_bps = Some(target);
        Some(target)
    }
}
