//! Forwarder for a publisher uploading up to three independent encodings.
//!
//! Unlike the scalable track this never filters inside a stream: it picks one
//! of the upstream encodings and forwards its packets unmodified, asking for
//! a keyframe whenever the selection moves to another encoding.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rtp::packet::Packet;
use sfu_protocol::media::MediaCodec;
use sfu_protocol::quality::QualityLevel;
use sfu_utils::ErrorDebugger;
use tokio_util::sync::CancellationToken;

use crate::bitrate_controller::ClaimMap;
use crate::track::{SubscriberQuality, TrackType};
use crate::transport::{PublisherTrack, TrackSink};

pub struct SimulcastClientTrack {
    id: String,
    remote: Arc<dyn PublisherTrack>,
    sink: Arc<dyn TrackSink>,
    claims: ClaimMap,
    subscriber_quality: SubscriberQuality,
    token: CancellationToken,
    last_quality: AtomicU8,
    max_quality: AtomicU8,
    is_screen: AtomicBool,
    ended: AtomicBool,
    on_ended: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl SimulcastClientTrack {
    pub fn new(id: &str, remote: Arc<dyn PublisherTrack>, sink: Arc<dyn TrackSink>, claims: ClaimMap, subscriber_quality: SubscriberQuality) -> Self {
        let token = remote.token().child_token();
        let is_screen = remote.is_screen();
        Self {
            id: id.to_string(),
            remote,
            sink,
            claims,
            subscriber_quality,
            token,
            last_quality: AtomicU8::new(QualityLevel::None.into()),
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

    /// Keyframe request targeted at one simulcast encoding.
    pub fn request_layer_pli(&self, quality: QualityLevel) {
        self.remote.request_layer_pli(quality);
    }

    /// Whether the upstream encoding for this quality currently sends media.
    pub fn is_active(&self, quality: QualityLevel) -> bool {
        self.remote.is_active(quality)
    }

    /// The single remaining encoding when simulcast collapsed upstream.
    pub fn collapsed_encoding(&self) -> Option<QualityLevel> {
        let mut count = 0;
        let mut single = QualityLevel::None;
        for quality in [QualityLevel::High, QualityLevel::Mid, QualityLevel::Low] {
            if self.remote.is_active(quality) {
                count += 1;
                single = quality;
            }
        }
        (count == 1).then_some(single)
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

    /// Claimed quality capped by the ceilings, then bumped to whichever
    /// encoding is actually alive when the wanted one is not.
    fn effective_quality(&self) -> QualityLevel {
        let claimed = match self.claims.quality_of(&self.id) {
            Ok(quality) => quality,
            Err(err) => {
                log::warn!("[SimulcastTrack] {} {}", self.id, err.to_string());
                return QualityLevel::None;
            }
        };
        let quality = claimed.min(self.max_quality()).min(self.subscriber_quality.get());

        if quality != QualityLevel::None && !self.remote.is_active(quality) {
            for fallback in [QualityLevel::Low, QualityLevel::Mid, QualityLevel::High] {
                if fallback != quality && self.remote.is_active(fallback) {
                    return fallback;
                }
            }
        }

        quality
    }

    /// Forward the packet when it belongs to the selected encoding.
    pub fn push(&self, pkt: Packet, source: QualityLevel) {
        let quality = self.effective_quality();
        if quality == QualityLevel::None || quality != source {
            return;
        }

        let previous = self.last_quality();
        if previous != quality {
            log::info!("[SimulcastTrack] {} switch encoding {:?} => {:?}", self.id, previous, quality);
            self.set_last_quality(quality);
            self.remote.request_layer_pli(quality);
        }

        self.sink.write_rtp(&pkt).log_error("[SimulcastTrack] write rtp failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{media_packet, FakePublisher, MemorySink};
    use crate::track::ClientTrack;

    fn build_track(claims: &ClaimMap) -> (Arc<SimulcastClientTrack>, Arc<FakePublisher>, Arc<MemorySink>) {
        let remote = Arc::new(FakePublisher::new(MediaCodec::Vp8));
        let sink = Arc::new(MemorySink::default());
        let track = Arc::new(SimulcastClientTrack::new(
            "video-sim",
            remote.clone(),
            sink.clone(),
            claims.clone(),
            SubscriberQuality::default(),
        ));
        (track, remote, sink)
    }

    #[test]
    fn forwards_only_the_selected_encoding() {
        let claims = ClaimMap::default();
        let (track, _remote, sink) = build_track(&claims);
        claims.insert_for_test("video-sim", ClientTrack::Simulcast(track.clone()), QualityLevel::Mid);

        track.push(media_packet(1, 0), QualityLevel::Low);
        track.push(media_packet(2, 0), QualityLevel::Mid);
        track.push(media_packet(3, 0), QualityLevel::High);
        track.push(media_packet(4, 0), QualityLevel::Mid);

        let seqs: Vec<u16> = sink.packets().iter().map(|p| p.header.sequence_number).collect();
        assert_eq!(seqs, vec![2, 4]);
    }

    #[test]
    fn switching_encodings_requests_layer_keyframe() {
        let claims = ClaimMap::default();
        let (track, remote, _sink) = build_track(&claims);
        claims.insert_for_test("video-sim", ClientTrack::Simulcast(track.clone()), QualityLevel::Mid);

        track.push(media_packet(1, 0), QualityLevel::Mid);
        assert_eq!(remote.layer_plis(), vec![QualityLevel::Mid]);

        // steady state, no further requests
        track.push(media_packet(2, 0), QualityLevel::Mid);
        assert_eq!(remote.layer_plis(), vec![QualityLevel::Mid]);

        claims.set_quality_for_test("video-sim", QualityLevel::High);
        track.push(media_packet(3, 0), QualityLevel::High);
        assert_eq!(remote.layer_plis(), vec![QualityLevel::Mid, QualityLevel::High]);
    }

    #[test]
    fn inactive_encoding_falls_back_to_a_live_one() {
        let claims = ClaimMap::default();
        let (track, remote, sink) = build_track(&claims);
        claims.insert_for_test("video-sim", ClientTrack::Simulcast(track.clone()), QualityLevel::High);

        // only the low encoding survives upstream
        remote.set_active(&[QualityLevel::Low]);

        track.push(media_packet(1, 0), QualityLevel::High);
        assert!(sink.packets().is_empty());

        track.push(media_packet(2, 0), QualityLevel::Low);
        let seqs: Vec<u16> = sink.packets().iter().map(|p| p.header.sequence_number).collect();
        assert_eq!(seqs, vec![2]);
    }

    #[test]
    fn collapsed_simulcast_is_detected() {
        let claims = ClaimMap::default();
        let (track, remote, _sink) = build_track(&claims);

        assert_eq!(track.collapsed_encoding(), None);

        remote.set_active(&[QualityLevel::Mid]);
        assert_eq!(track.collapsed_encoding(), Some(QualityLevel::Mid));

        remote.set_active(&[QualityLevel::Low, QualityLevel::Mid]);
        assert_eq!(track.collapsed_encoding(), None);
    }

    #[test]
    fn missing_claim_drops_packets() {
        let claims = ClaimMap::default();
        let (track, _remote, sink) = build_track(&claims);

        track.push(media_packet(1, 0), QualityLevel::Mid);
        assert!(sink.packets().is_empty());
    }
}
