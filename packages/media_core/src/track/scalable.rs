//! Forwarder for a single scalable (VP9 SVC) stream.
//!
//! All spatial layers share one RTP sequence space, so every internally
//! dropped packet shifts the emitted sequence numbers down by one. The shift
//! in force at emission time is remembered per packet in the cache, which is
//! what keeps late retransmissions renumbered consistently with their
//! neighbours.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rtp::packet::Packet;
use sfu_protocol::media::MediaCodec;
use sfu_protocol::quality::{QualityLevel, QualityPreset};
use sfu_protocol::vp9::Vp9Descriptor;
use sfu_utils::{is_late, normalize_seq, ErrorDebugger};
use tokio_util::sync::CancellationToken;

use crate::bitrate_controller::ClaimMap;
use crate::packet_cache::{PacketCache, DEFAULT_CACHE_SIZE};
use crate::track::{SubscriberQuality, TrackType};
use crate::transport::{PublisherTrack, TrackSink};

#[derive(Default)]
struct ForwardState {
    last_seq: u16,
    last_timestamp: u32,
    sid: u8,
    tid: u8,
    spatial_count: u8,
    temporal_count: u8,
    drop_counter: u16,
}

pub struct ScalableClientTrack {
    id: String,
    remote: Arc<dyn PublisherTrack>,
    sink: Arc<dyn TrackSink>,
    claims: ClaimMap,
    subscriber_quality: SubscriberQuality,
    preset: QualityPreset,
    token: CancellationToken,
    cache: PacketCache,
    state: Mutex<ForwardState>,
    last_quality: AtomicU8,
    max_quality: AtomicU8,
    is_screen: AtomicBool,
    ended: AtomicBool,
    on_ended: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl ScalableClientTrack {
    pub fn new(
        id: &str,
        remote: Arc<dyn PublisherTrack>,
        sink: Arc<dyn TrackSink>,
        claims: ClaimMap,
        subscriber_quality: SubscriberQuality,
        preset: QualityPreset,
    ) -> Self {
        Self::with_cache_size(id, remote, sink, claims, subscriber_quality, preset, DEFAULT_CACHE_SIZE)
    }

    pub fn with_cache_size(
        id: &str,
        remote: Arc<dyn PublisherTrack>,
        sink: Arc<dyn TrackSink>,
        claims: ClaimMap,
        subscriber_quality: SubscriberQuality,
        preset: QualityPreset,
        cache_size: usize,
    ) -> Self {
        let token = remote.token().child_token();
        let is_screen = remote.is_screen();
        Self {
            id: id.to_string(),
            remote,
            sink,
            claims,
            subscriber_quality,
            preset,
            token,
            cache: PacketCache::new(cache_size),
            state: Mutex::new(ForwardState::default()),
            last_quality: AtomicU8::new(QualityLevel::High.into()),
            max_quality: AtomicU8::new(QualityLevel::High.into()),
            is_screen: AtomicBool::new(is_screen),
            ended: AtomicBool::new(false),
            on_ended: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn codec(&self) -> MediaCodec {
        self.remote.codec()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_screen(&self) -> bool {
        self.is_screen.load(Ordering::Relaxed)
    }

    pub fn set_source_type(&self, source_type: TrackType) {
        self.is_screen.store(source_type == TrackType::Screen, Ordering::Relaxed);
    }

    pub fn last_quality(&self) -> QualityLevel {
        QualityLevel::from_raw(self.last_quality.load(Ordering::Relaxed))
    }

    pub fn set_last_quality(&self, quality: QualityLevel) {
        self.last_quality.store(quality.into(), Ordering::Relaxed);
    }

    pub fn max_quality(&self) -> QualityLevel {
        QualityLevel::from_raw(self.max_quality.load(Ordering::Relaxed))
    }

    pub fn set_max_quality(&self, quality: QualityLevel) {
        self.max_quality.store(quality.into(), Ordering::Relaxed);
        self.remote.request_pli();
    }

    pub fn request_pli(&self) {
        self.remote.request_pli();
    }

    /// Timestamp of the last packet handed to the sink.
    pub fn last_timestamp(&self) -> u32 {
        self.state.lock().last_timestamp
    }

    /// `(spatial, temporal)` layer counts announced by the stream, recorded
    /// from the first parsed descriptor. `(0, 0)` until then.
    pub fn layer_counts(&self) -> (u8, u8) {
        let state = self.state.lock();
        (state.spatial_count, state.temporal_count)
    }

    pub fn on_track_ended(&self, callback: Box<dyn FnOnce() + Send>) {
        self.on_ended.lock().push(callback);
    }

    pub fn mark_ended(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        for callback in self.on_ended.lock().drain(..) {
            callback();
        }
    }

    /// Quality this track should deliver right now: the controller's claim
    /// capped by the per-track and per-subscriber ceilings. A missing claim
    /// suppresses the track.
    fn effective_quality(&self) -> QualityLevel {
        let claimed = match self.claims.quality_of(&self.id) {
            Ok(quality) => quality,
            Err(err) => {
                log::warn!("[ScalableTrack] {} {}", self.id, err.to_string());
                return QualityLevel::None;
            }
        };
        self.max_quality().min(claimed).min(self.subscriber_quality.get())
    }

    /// Decide whether one upstream packet reaches the subscriber, rewriting
    /// its sequence number and frame marker as layers are filtered out.
    pub fn push(&self, mut pkt: Packet) {
        let mut state = self.state.lock();
        let upstream_seq = pkt.header.sequence_number;

        let mut late = false;
        if is_late(state.last_seq, upstream_seq) {
            log::info!("[ScalableTrack] {} late packet {} previously {}", self.id, upstream_seq, state.last_seq);
            late = true;
            if self.cache.lookup(upstream_seq).is_some() {
                log::info!("[ScalableTrack] {} packet {} already forwarded", self.id, upstream_seq);
                return;
            }
        } else {
            state.last_seq = upstream_seq;
        }

        let desc = match Vp9Descriptor::parse(&pkt.payload) {
            Ok(desc) => desc,
            Err(_) => {
                // not an SVC payload, forward as-is
                self.send(&mut state, pkt, upstream_seq, late);
                return;
            }
        };

        if state.spatial_count == 0 || state.temporal_count == 0 {
            state.spatial_count = desc.ns + 1;
            state.temporal_count = desc.ng + 1;
        }

        let quality = self.effective_quality();
        if quality == QualityLevel::None {
            state.drop_counter = state.drop_counter.wrapping_add(1);
            return;
        }

        let target = self.preset.layer(quality);

        let keyframe = desc.is_keyframe(&pkt.payload);
        if keyframe {
            self.remote.key_frame_received();
        }

        // spatial switch only at a frame boundary, and only once the target
        // layer no longer predicts from layers we are not forwarding
        if desc.begin_frame && state.sid != target.spatial && desc.spatial == target.spatial && !desc.predicted_frame {
            state.sid = target.spatial;
        }

        // temporal switch on a keyframe, an up-switch point, or any down-switch
        if desc.begin_frame && state.tid != target.temporal && (keyframe || state.tid > target.temporal || desc.switching_point) {
            state.tid = target.temporal;
        }

        if state.tid == target.temporal && state.sid == target.spatial {
            self.set_last_quality(quality);
        }

        // the highest forwarded spatial layer carries the frame marker
        if desc.end_frame && state.sid == desc.spatial {
            pkt.header.marker = true;
        }

        // base layer always goes through
        if desc.temporal == 0 && desc.spatial == 0 {
            self.send(&mut state, pkt, upstream_seq, late);
            return;
        }

        if state.tid < desc.temporal || state.sid < desc.spatial || (state.sid > desc.spatial && desc.discardable) {
            state.drop_counter = state.drop_counter.wrapping_add(1);
            return;
        }

        self.send(&mut state, pkt, upstream_seq, late);
    }

    fn send(&self, state: &mut ForwardState, mut pkt: Packet, upstream_seq: u16, late: bool) {
        let drop_counter = if late {
            // renumber with the shift that applied around the packet's
            // original position, not the drops that happened since
            self.cache
                .lookup_at_or_before(upstream_seq)
                .map(|cached| cached.drop_counter)
                .unwrap_or(state.drop_counter)
        } else {
            state.drop_counter
        };

        pkt.header.sequence_number = normalize_seq(upstream_seq, drop_counter);
        if !late {
            self.cache.push(upstream_seq, pkt.header.timestamp, drop_counter);
        }
        state.last_timestamp = pkt.header.timestamp;

        self.sink.write_rtp(&pkt).log_error("[ScalableTrack] write rtp failed");
    }

    #[cfg(test)]
    pub(crate) fn cache_len(&self) -> usize {
        self.cache.len()
    }
}
