//! Forwarder for streams with nothing to select: audio, and plain video
//! without simulcast or scalable layers. Packets go to the sink untouched.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rtp::packet::Packet;
use sfu_protocol::media::MediaCodec;
use sfu_protocol::quality::QualityLevel;
use sfu_utils::ErrorDebugger;
use tokio_util::sync::CancellationToken;

use crate::track::TrackType;
use crate::transport::{PublisherTrack, TrackSink};

pub struct PassthroughClientTrack {
    id: String,
    remote: Arc<dyn PublisherTrack>,
    sink: Arc<dyn TrackSink>,
    token: CancellationToken,
    last_quality: AtomicU8,
    max_quality: AtomicU8,
    is_screen: AtomicBool,
    ended: AtomicBool,
    on_ended: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl PassthroughClientTrack {
    pub fn new(id: &str, remote: Arc<dyn PublisherTrack>, sink: Arc<dyn TrackSink>) -> Self {
        let token = remote.token().child_token();
        let is_screen = remote.is_screen();
        Self {
            id: id.to_string(),
            remote,
            sink,
            token,
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
    }

    pub fn request_pli(&self) {
        self.remote.request_pli();
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

    pub fn push(&self, pkt: Packet) {
        self.sink.write_rtp(&pkt).log_error("[PassthroughTrack] write rtp failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{media_packet, FakePublisher, MemorySink};

    #[test]
    fn forwards_everything_untouched() {
        let remote = Arc::new(FakePublisher::new(MediaCodec::Opus));
        let sink = Arc::new(MemorySink::default());
        let track = PassthroughClientTrack::new("audio-0", remote, sink.clone());

        for seq in 0..5u16 {
            track.push(media_packet(seq, seq as u32 * 960));
        }

        let seqs: Vec<u16> = sink.packets().iter().map(|p| p.header.sequence_number).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }
}
