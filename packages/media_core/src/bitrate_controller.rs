//! Per-subscriber bitrate controller.
//!
//! Owns one claim per client track and reconciles the claimed qualities
//! against either the congestion controller's bandwidth estimate or the
//! receiver-report loss ratio, one quality tier at a time, requesting a
//! keyframe on every transition.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sfu_protocol::media::MediaCodec;
use sfu_protocol::quality::{BitrateConfig, QualityLevel};
use sfu_utils::Timer;

use crate::errors::ControllerError;
use crate::track::ClientTrack;
use crate::transport::{BandwidthEstimator, StatsSource, VideoSize};

/// Loss-mode tick period.
pub const ADJUSTMENT_TICK: Duration = Duration::from_secs(3);

/// Both directions are suppressed this long after a claim's last change.
const ADJUSTMENT_RATE_LIMIT_MS: u64 = 2_000;

/// A decrease this soon after an increase pushes the delay counter back.
const UP_SWITCH_GUARD_MS: u64 = 10_000;

/// One delay-counter unit of increase hold-off.
const DELAY_STEP_MS: u64 = 10_000;

/// Estimate assumed until the first estimator callback arrives.
const DEFAULT_BANDWIDTH_BPS: u32 = 2_500_000;

const LOSS_INCREASE_BELOW: f32 = 0.02;
const LOSS_DECREASE_ABOVE: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BitrateAdjustment {
    Keep,
    Increase,
    Decrease,
}

struct ClaimState {
    quality: QualityLevel,
    bitrate: u32,
    simulcast: bool,
    delay_counter: u32,
    last_increase_ms: u64,
    last_decrease_ms: u64,
}

/// The controller's commitment of one client track to one quality.
pub struct BitrateClaim {
    track: ClientTrack,
    state: RwLock<ClaimState>,
}

impl BitrateClaim {
    fn new(track: ClientTrack, quality: QualityLevel, bitrate: u32) -> Self {
        let simulcast = track.is_simulcast();
        Self {
            track,
            state: RwLock::new(ClaimState {
                quality,
                bitrate,
                simulcast,
                delay_counter: 0,
                last_increase_ms: 0,
                last_decrease_ms: 0,
            }),
        }
    }

    pub fn track(&self) -> &ClientTrack {
        &self.track
    }

    pub fn quality(&self) -> QualityLevel {
        self.state.read().quality
    }

    pub fn bitrate(&self) -> u32 {
        self.state.read().bitrate
    }

    pub fn is_simulcast(&self) -> bool {
        self.state.read().simulcast
    }

    /// Collapsed simulcast clears the claim flag and pins the claim, so the
    /// flag participates here, not only the track variant.
    pub fn is_adjustable(&self) -> bool {
        self.track.is_scalable() || (self.track.is_simulcast() && self.is_simulcast())
    }

    fn is_allowed_to_increase(&self, now_ms: u64) -> bool {
        let state = self.state.read();
        if state.delay_counter > 0 && now_ms.saturating_sub(state.last_decrease_ms) < state.delay_counter as u64 * DELAY_STEP_MS {
            log::info!("[BitrateController] delay increase, delay counter {}", state.delay_counter);
            return false;
        }
        true
    }

    fn pushback_delay_counter(&self) {
        let mut state = self.state.write();
        state.delay_counter = if state.delay_counter == 0 {
            1
        } else {
            (state.delay_counter * 3 + 1) / 2
        };
        log::info!("[BitrateController] pushback delay counter to {}", state.delay_counter);
    }

    fn last_increase_ms(&self) -> u64 {
        self.state.read().last_increase_ms
    }
}

/// Claims keyed by client-track id. The controller owns admission and
/// removal; tracks hold a clone to read their committed quality per packet.
#[derive(Clone, Default)]
pub struct ClaimMap {
    inner: Arc<RwLock<HashMap<String, Arc<BitrateClaim>>>>,
}

impl ClaimMap {
    pub fn get(&self, id: &str) -> Option<Arc<BitrateClaim>> {
        self.inner.read().get(id).cloned()
    }

    /// Committed quality for a track, or `MissingClaim` once it was removed.
    pub fn quality_of(&self, id: &str) -> Result<QualityLevel, ControllerError> {
        self.get(id).map(|claim| claim.quality()).ok_or(ControllerError::MissingClaim)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    fn insert(&self, id: &str, claim: Arc<BitrateClaim>) {
        self.inner.write().insert(id.to_string(), claim);
    }

    fn remove(&self, id: &str) -> Option<Arc<BitrateClaim>> {
        self.inner.write().remove(id)
    }

    /// Snapshot in stable id order, so sweeps visit claims deterministically.
    fn snapshot(&self) -> Vec<Arc<BitrateClaim>> {
        let map = self.inner.read();
        let mut ids: Vec<&String> = map.keys().collect();
        ids.sort();
        ids.iter().map(|id| map[*id].clone()).collect()
    }
}

#[cfg(test)]
impl ClaimMap {
    pub(crate) fn insert_for_test(&self, id: &str, track: ClientTrack, quality: QualityLevel) {
        let bitrate = BitrateConfig::default().quality_to_bitrate(quality);
        self.insert(id, Arc::new(BitrateClaim::new(track, quality, bitrate)));
    }

    pub(crate) fn set_quality_for_test(&self, id: &str, quality: QualityLevel) {
        let claim = self.get(id).expect("claim should exist");
        let mut state = claim.state.write();
        state.quality = quality;
        state.bitrate = BitrateConfig::default().quality_to_bitrate(quality);
    }
}

/// How quality adjustments are driven, chosen at construction.
pub enum ControlMode {
    /// Event driven from the congestion controller's estimate.
    BandwidthEstimation,
    /// Periodic ticks sampling receiver-report loss ratios.
    LossBased(Arc<dyn StatsSource>),
}

pub struct BitrateController {
    config: BitrateConfig,
    timer: Arc<dyn Timer>,
    mode: ControlMode,
    claims: ClaimMap,
    estimated_bandwidth: AtomicU32,
}

impl BitrateController {
    pub fn new(config: BitrateConfig, timer: Arc<dyn Timer>, mode: ControlMode) -> Self {
        Self {
            config,
            timer,
            mode,
            claims: ClaimMap::default(),
            estimated_bandwidth: AtomicU32::new(DEFAULT_BANDWIDTH_BPS),
        }
    }

    pub fn is_loss_based(&self) -> bool {
        matches!(self.mode, ControlMode::LossBased(_))
    }

    /// Shared read view for client tracks.
    pub fn claims_handle(&self) -> ClaimMap {
        self.claims.clone()
    }

    pub fn claims(&self) -> Vec<Arc<BitrateClaim>> {
        self.claims.snapshot()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.claims.contains(id)
    }

    pub fn get_claim(&self, id: &str) -> Option<Arc<BitrateClaim>> {
        self.claims.get(id)
    }

    pub fn total_bitrates(&self) -> u32 {
        self.claims.snapshot().iter().map(|claim| claim.bitrate()).sum()
    }

    pub fn estimated_bandwidth(&self) -> u32 {
        self.estimated_bandwidth.load(Ordering::Relaxed)
    }

    pub fn set_estimated_bandwidth(&self, bandwidth: u32) {
        self.estimated_bandwidth.store(bandwidth, Ordering::Relaxed);
    }

    /// Commit a claim to a quality, stamping the direction of the change.
    /// Re-committing the current quality is a no-op.
    pub fn set_quality(&self, id: &str, quality: QualityLevel) {
        let Some(claim) = self.claims.get(id) else {
            return;
        };
        let now_ms = self.timer.now_ms();
        let bitrate = self.config.quality_to_bitrate(quality);
        let mut state = claim.state.write();
        if state.quality < quality {
            state.last_increase_ms = now_ms;
        } else if state.quality > quality {
            state.last_decrease_ms = now_ms;
        }
        state.quality = quality;
        state.bitrate = bitrate;
    }

    pub fn set_simulcast_claim(&self, id: &str, simulcast: bool) {
        if let Some(claim) = self.claims.get(id) {
            claim.state.write().simulcast = simulcast;
        }
    }

    /// Admit a batch of tracks: audio first at fixed qualities, then video at
    /// a quality distributed from the remaining bandwidth. Returns the first
    /// error once the whole batch was processed.
    pub fn add_claims(&self, tracks: Vec<ClientTrack>) -> Result<(), ControllerError> {
        let mut first_error = None;
        let mut video = Vec::new();

        for track in tracks {
            if track.kind().is_audio() {
                let quality = if track.codec() == MediaCodec::Red {
                    QualityLevel::AudioRed
                } else {
                    QualityLevel::Audio
                };
                let bitrate = self.config.quality_to_bitrate(quality);
                if self.total_bitrates() + bitrate > self.estimated_bandwidth() {
                    log::warn!("[BitrateController] no bandwidth left for audio track {}", track.id());
                    first_error.get_or_insert(ControllerError::InsufficientBandwidth);
                    continue;
                }
                if self.exists(track.id()) {
                    first_error.get_or_insert(ControllerError::AlreadyClaimed);
                    continue;
                }
                self.add_claim(track, quality);
            } else {
                video.push(track);
            }
        }

        let mut remaining = video.len();
        for track in video {
            if self.exists(track.id()) {
                first_error.get_or_insert(ControllerError::AlreadyClaimed);
                remaining -= 1;
                continue;
            }

            let quality = if track.is_adjustable() {
                self.distributed_quality(remaining)
            } else {
                QualityLevel::High
            };

            // delivered quality starts where the claim starts
            track.set_last_quality(quality);
            self.add_claim(track, quality);
            remaining -= 1;
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn add_claim(&self, track: ClientTrack, quality: QualityLevel) {
        let bitrate = self.config.quality_to_bitrate(quality);
        log::info!("[BitrateController] claim track {} at {:?} ({} bps)", track.id(), quality, bitrate);
        let id = track.id().to_string();
        self.claims.insert(&id, Arc::new(BitrateClaim::new(track, quality, bitrate)));
    }

    /// Idempotent; the packet loop calls this when a track's loop exits.
    pub fn remove_claim(&self, id: &str) {
        if self.claims.remove(id).is_none() {
            log::warn!("[BitrateController] remove unknown claim {}", id);
            return;
        }
        log::info!("[BitrateController] claim {} removed", id);
    }

    /// Quality an incoming video track starts at, spreading the remaining
    /// bandwidth over the tracks still waiting for admission. Never `None` so
    /// the subscriber's on-track event is not suppressed.
    fn distributed_quality(&self, tracks_to_admit: usize) -> QualityLevel {
        if tracks_to_admit == 0 {
            return QualityLevel::None;
        }
        let available = self.estimated_bandwidth().saturating_sub(self.total_bitrates());
        let distributed = available / tracks_to_admit as u32;
        if distributed < self.config.video_mid {
            QualityLevel::Low
        } else if distributed < self.config.video_high {
            QualityLevel::Mid
        } else {
            QualityLevel::High
        }
    }

    /// Register for estimate changes; bandwidth-estimation mode's only drive.
    pub fn monitor_bandwidth(self: &Arc<Self>, estimator: &dyn BandwidthEstimator) {
        let controller = self.clone();
        estimator.on_target_bitrate(Box::new(move |bandwidth| {
            controller.on_target_bitrate(bandwidth);
        }));
    }

    pub fn on_target_bitrate(&self, bandwidth: u32) {
        self.set_estimated_bandwidth(bandwidth);
        let total = self.total_bitrates();

        let need_adjustment = if total < bandwidth {
            // ignore head-room smaller than one low-to-mid step
            if bandwidth - total <= self.config.video_mid - self.config.video_low {
                return;
            }
            self.need_increase_bitrate(bandwidth - total)
        } else {
            self.can_decrease_bitrate()
        };

        if !need_adjustment {
            return;
        }

        log::info!("[BitrateController] available bandwidth {} total bitrate {}", bandwidth, total);
        self.fit_bitrates_to_bandwidth(bandwidth);
    }

    fn can_decrease_bitrate(&self) -> bool {
        self.claims
            .snapshot()
            .iter()
            .any(|claim| claim.is_adjustable() && claim.quality() > QualityLevel::Low)
    }

    fn need_increase_bitrate(&self, available: u32) -> bool {
        self.claims
            .snapshot()
            .iter()
            .any(|claim| claim.is_adjustable() && claim.quality() < claim.track().max_quality() && self.enough_bandwidth_to_increase(available, claim))
    }

    fn enough_bandwidth_to_increase(&self, available: u32, claim: &BitrateClaim) -> bool {
        let Some(next) = claim.quality().up() else {
            return false;
        };
        let gap = self.config.quality_to_bitrate(next) - self.config.quality_to_bitrate(claim.quality());
        gap < available
    }

    /// Walk the quality tiers until the committed bitrates fit the estimate.
    ///
    /// Reducing sweeps from High downwards and keeps stepping until the sum
    /// fits, so the worst case leaves every adjustable claim at Low.
    /// Expanding sweeps from Low upwards, raises each claim at most one tier
    /// per pass and keeps the staircase: a claim is not lifted further while
    /// another one still sits below its starting tier.
    pub fn fit_bitrates_to_bandwidth(&self, bandwidth: u32) {
        let mut total = self.total_bitrates();
        let claims = self.claims.snapshot();

        if total > bandwidth {
            for tier in [QualityLevel::High, QualityLevel::Mid] {
                for claim in &claims {
                    if claim.is_adjustable() && claim.quality() == tier {
                        let reduced = tier.down().expect("tier above low");
                        claim.track().request_pli();
                        log::info!("[BitrateController] reduce track {} {:?} => {:?}", claim.track().id(), tier, reduced);
                        self.set_quality(claim.track().id(), reduced);

                        total = self.total_bitrates();
                        if total <= bandwidth {
                            return;
                        }
                    }
                }
            }
        } else {
            let mut none_count = 0;
            let mut low_count = 0;
            for claim in &claims {
                match claim.quality() {
                    QualityLevel::None => none_count += 1,
                    QualityLevel::Low => low_count += 1,
                    _ => {}
                }
            }

            let mut stepped: Vec<&str> = Vec::new();
            for tier in [QualityLevel::Low, QualityLevel::Mid] {
                for claim in &claims {
                    if !claim.is_adjustable() || claim.quality() != tier || stepped.contains(&claim.track().id()) {
                        continue;
                    }
                    if claim.quality() >= claim.track().max_quality() {
                        continue;
                    }
                    match tier {
                        QualityLevel::Low if none_count > 0 => continue,
                        QualityLevel::Mid if none_count + low_count > 0 => continue,
                        _ => {}
                    }

                    let increased = tier.up().expect("tier below high");
                    let gap = self.config.quality_to_bitrate(increased) - self.config.quality_to_bitrate(tier);
                    if total + gap >= bandwidth {
                        return;
                    }

                    claim.track().request_pli();
                    log::info!("[BitrateController] increase track {} {:?} => {:?}", claim.track().id(), tier, increased);
                    self.set_quality(claim.track().id(), increased);
                    stepped.push(claim.track().id());
                    total = self.total_bitrates();
                }
            }
        }
    }

    /// Loss-mode tick: reconcile collapsed simulcast, clamp to the per-track
    /// ceilings, then apply at most one quality change across all claims.
    pub fn check_and_adjust(&self) {
        let claims = self.claims.snapshot();

        let mut lowest = QualityLevel::High;
        let mut highest = QualityLevel::None;
        let mut none_count = 0;
        let mut low_count = 0;
        let mut high_count = 0;

        for claim in &claims {
            self.reconcile_simulcast(claim);

            let quality = claim.quality();
            if quality < lowest {
                lowest = quality;
            }
            if quality > highest {
                highest = quality;
            }
            match quality {
                QualityLevel::None => none_count += 1,
                QualityLevel::Low => low_count += 1,
                QualityLevel::High => high_count += 1,
                _ => {}
            }
        }

        for claim in &claims {
            if !claim.is_adjustable() {
                continue;
            }

            let max_quality = claim.track().max_quality();
            if claim.quality() > max_quality {
                self.set_quality(claim.track().id(), max_quality);
            }

            let mut adjustment = self.bitrate_adjustment(claim);

            if adjustment == BitrateAdjustment::Keep {
                let deliverable = match claim.track() {
                    ClientTrack::Simulcast(track) => track.is_active(claim.quality()),
                    _ => true,
                };
                if deliverable {
                    continue;
                }
                // held quality cannot be delivered upstream, step down instead
                adjustment = BitrateAdjustment::Decrease;
            }

            match adjustment {
                BitrateAdjustment::Decrease => {
                    if claim.quality() > QualityLevel::Low {
                        if claim.quality() == QualityLevel::Mid && high_count > 0 {
                            continue;
                        }
                        if claim.track().is_screen() && self.non_screen_can_decrease(lowest) {
                            continue;
                        }

                        let reduced = claim.quality().down().expect("quality above low");
                        match claim.track().as_simulcast() {
                            Some(track) => track.request_layer_pli(reduced),
                            None => claim.track().request_pli(),
                        }
                        log::info!("[BitrateController] decrease track {} {:?} => {:?}", claim.track().id(), claim.quality(), reduced);
                        self.set_quality(claim.track().id(), reduced);
                        return;
                    }
                }
                BitrateAdjustment::Increase => {
                    if claim.quality() < max_quality {
                        if claim.quality() == QualityLevel::Mid && none_count + low_count > 0 {
                            continue;
                        }
                        if claim.quality() == QualityLevel::Low && none_count > 0 {
                            continue;
                        }
                        if !claim.track().is_screen() && self.screen_need_increase(highest) {
                            continue;
                        }

                        let increased = claim.quality().up().expect("quality below high");
                        match claim.track().as_simulcast() {
                            Some(track) => track.request_layer_pli(increased),
                            None => claim.track().request_pli(),
                        }
                        log::info!("[BitrateController] increase track {} {:?} => {:?}", claim.track().id(), claim.quality(), increased);
                        self.set_quality(claim.track().id(), increased);
                        return;
                    }
                }
                BitrateAdjustment::Keep => {}
            }
        }
    }

    /// A simulcast publisher that lost all but one encoding pins the claim to
    /// that encoding and clears the simulcast flag.
    fn reconcile_simulcast(&self, claim: &Arc<BitrateClaim>) {
        let Some(track) = claim.track().as_simulcast() else {
            return;
        };
        let Some(quality) = track.collapsed_encoding() else {
            return;
        };
        if claim.quality() != quality {
            log::info!("[BitrateController] simulcast collapsed, pin track {} to {:?}", claim.track().id(), quality);
            self.set_quality(claim.track().id(), quality);
        }
        if claim.is_simulcast() {
            self.set_simulcast_claim(claim.track().id(), false);
        }
    }

    fn screen_need_increase(&self, highest: QualityLevel) -> bool {
        self.claims
            .snapshot()
            .iter()
            .any(|claim| claim.track().is_screen() && claim.quality() <= highest)
    }

    fn non_screen_can_decrease(&self, lowest: QualityLevel) -> bool {
        self.claims
            .snapshot()
            .iter()
            .any(|claim| !claim.track().is_screen() && claim.is_adjustable() && claim.quality() > lowest)
    }

    fn bitrate_adjustment(&self, claim: &Arc<BitrateClaim>) -> BitrateAdjustment {
        let now_ms = self.timer.now_ms();
        let (last_increase_ms, last_decrease_ms) = {
            let state = claim.state.read();
            (state.last_increase_ms, state.last_decrease_ms)
        };
        if now_ms.saturating_sub(last_decrease_ms) < ADJUSTMENT_RATE_LIMIT_MS || now_ms.saturating_sub(last_increase_ms) < ADJUSTMENT_RATE_LIMIT_MS {
            return BitrateAdjustment::Keep;
        }

        // a simulcast claim parked on a dead encoding moves regardless of loss
        if let Some(track) = claim.track().as_simulcast() {
            match claim.quality() {
                QualityLevel::High | QualityLevel::Mid if !track.is_active(claim.quality()) => {
                    return BitrateAdjustment::Decrease;
                }
                QualityLevel::Low if !track.is_active(QualityLevel::Low) => {
                    return BitrateAdjustment::Increase;
                }
                _ => {}
            }
        }

        let ControlMode::LossBased(stats) = &self.mode else {
            return BitrateAdjustment::Keep;
        };
        let Some(fraction_lost) = stats.fraction_lost(claim.track().id()) else {
            log::warn!("[BitrateController] no sender stats for track {}", claim.track().id());
            return BitrateAdjustment::Keep;
        };

        if fraction_lost < LOSS_INCREASE_BELOW && claim.quality() != QualityLevel::High {
            if !claim.is_allowed_to_increase(now_ms) {
                return BitrateAdjustment::Keep;
            }
            BitrateAdjustment::Increase
        } else if fraction_lost > LOSS_DECREASE_ABOVE && claim.quality() != QualityLevel::None {
            if now_ms.saturating_sub(claim.last_increase_ms()) < UP_SWITCH_GUARD_MS {
                // ping-pong around a congestion cliff, hold future increases
                claim.pushback_delay_counter();
            }
            BitrateAdjustment::Decrease
        } else {
            BitrateAdjustment::Keep
        }
    }

    /// Cap a track's quality from the size the subscriber actually renders.
    pub fn on_remote_viewed_size_changed(&self, size: VideoSize) {
        let Some(claim) = self.claims.get(&size.track_id) else {
            log::warn!("[BitrateController] viewport change for unknown track {}", size.track_id);
            return;
        };
        if !claim.track().kind().is_video() {
            log::warn!("[BitrateController] viewport change for non-video track {}", size.track_id);
            return;
        }

        let quality = if size.width == 0 || size.height == 0 {
            QualityLevel::None
        } else {
            let pixels = size.width * size.height;
            if pixels <= self.config.video_low_pixels {
                QualityLevel::Low
            } else if pixels <= self.config.video_mid_pixels {
                QualityLevel::Mid
            } else {
                QualityLevel::High
            }
        };

        log::info!("[BitrateController] viewport {}x{} caps track {} at {:?}", size.width, size.height, size.track_id, quality);
        claim.track().set_max_quality(quality);
    }
}
