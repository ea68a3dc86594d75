//! Fakes and packet builders shared by the crate's tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rtp::packet::Packet;
use sfu_protocol::media::MediaCodec;
use sfu_protocol::quality::{QualityLevel, QualityPreset};
use sfu_utils::MediaError;
use tokio_util::sync::CancellationToken;

use crate::bitrate_controller::ClaimMap;
use crate::track::{ClientTrack, PassthroughClientTrack, ScalableClientTrack, SimulcastClientTrack, SubscriberQuality};
use crate::transport::{BandwidthEstimator, PublisherTrack, StatsSource, TrackSink};

pub struct FakePublisher {
    codec: MediaCodec,
    token: CancellationToken,
    screen: AtomicBool,
    key_frames: AtomicUsize,
    plis: AtomicUsize,
    layer_plis: Mutex<Vec<QualityLevel>>,
    /// None means every encoding is live.
    active: Mutex<Option<Vec<QualityLevel>>>,
}

impl FakePublisher {
    pub fn new(codec: MediaCodec) -> Self {
        Self {
            codec,
            token: CancellationToken::new(),
            screen: AtomicBool::new(false),
            key_frames: AtomicUsize::new(0),
            plis: AtomicUsize::new(0),
            layer_plis: Mutex::new(Vec::new()),
            active: Mutex::new(None),
        }
    }

    pub fn set_active(&self, encodings: &[QualityLevel]) {
        *self.active.lock() = Some(encodings.to_vec());
    }

    pub fn key_frames_received(&self) -> usize {
        self.key_frames.load(Ordering::SeqCst)
    }

    pub fn pli_count(&self) -> usize {
        self.plis.load(Ordering::SeqCst)
    }

    pub fn layer_plis(&self) -> Vec<QualityLevel> {
        self.layer_plis.lock().clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl PublisherTrack for FakePublisher {
    fn key_frame_received(&self) {
        self.key_frames.fetch_add(1, Ordering::SeqCst);
    }

    fn request_pli(&self) {
        self.plis.fetch_add(1, Ordering::SeqCst);
    }

    fn request_layer_pli(&self, quality: QualityLevel) {
        self.layer_plis.lock().push(quality);
    }

    fn is_active(&self, quality: QualityLevel) -> bool {
        match &*self.active.lock() {
            None => true,
            Some(encodings) => encodings.contains(&quality),
        }
    }

    fn is_screen(&self) -> bool {
        self.screen.load(Ordering::Relaxed)
    }

    fn codec(&self) -> MediaCodec {
        self.codec
    }

    fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

#[derive(Default)]
pub struct MemorySink {
    packets: Mutex<Vec<Packet>>,
}

impl MemorySink {
    pub fn packets(&self) -> Vec<Packet> {
        self.packets.lock().clone()
    }
}

impl TrackSink for MemorySink {
    fn write_rtp(&self, pkt: &Packet) -> Result<(), MediaError> {
        self.packets.lock().push(pkt.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct StubStats {
    lost: Mutex<HashMap<String, f32>>,
}

impl StubStats {
    pub fn set(&self, track_id: &str, fraction_lost: f32) {
        self.lost.lock().insert(track_id.to_string(), fraction_lost);
    }
}

impl StatsSource for StubStats {
    fn fraction_lost(&self, track_id: &str) -> Option<f32> {
        self.lost.lock().get(track_id).copied()
    }
}

#[derive(Default)]
pub struct FakeEstimator {
    callback: Mutex<Option<Box<dyn Fn(u32) + Send + Sync>>>,
}

impl FakeEstimator {
    pub fn fire(&self, bandwidth: u32) {
        if let Some(callback) = &*self.callback.lock() {
            callback(bandwidth);
        }
    }
}

impl BandwidthEstimator for FakeEstimator {
    fn on_target_bitrate(&self, callback: Box<dyn Fn(u32) + Send + Sync>) {
        *self.callback.lock() = Some(callback);
    }
}

#[derive(Default, Clone, Copy)]
pub struct SvcFlags {
    pub key: bool,
    pub begin: bool,
    pub end: bool,
    pub switching_point: bool,
    pub predicted: bool,
    pub discardable: bool,
}

/// RTP packet carrying a flexible-mode VP9 payload descriptor.
pub fn svc_packet(seq: u16, ts: u32, spatial: u8, temporal: u8, flags: SvcFlags) -> Packet {
    let mut b0 = 0x20 | 0x10; // L + F
    if flags.predicted {
        b0 |= 0x40;
    }
    if flags.begin {
        b0 |= 0x08;
    }
    if flags.end {
        b0 |= 0x04;
    }
    if flags.discardable {
        b0 |= 0x01;
    }

    let mut b1 = (temporal << 5) | (spatial << 1);
    if flags.switching_point {
        b1 |= 0x10;
    }

    let mut payload = vec![b0, b1];
    if flags.predicted {
        // single reference index, chain terminated
        payload.push(0x02);
    }
    payload.push(if flags.key { 0xb0 } else { 0x00 });

    let mut pkt = Packet::default();
    pkt.header.payload_type = 98;
    pkt.header.sequence_number = seq;
    pkt.header.timestamp = ts;
    pkt.payload = Bytes::from(payload);
    pkt
}

/// Plain RTP packet with an opaque payload.
pub fn media_packet(seq: u16, ts: u32) -> Packet {
    let mut pkt = Packet::default();
    pkt.header.payload_type = 111;
    pkt.header.sequence_number = seq;
    pkt.header.timestamp = ts;
    pkt.payload = Bytes::from_static(&[0xde, 0xad]);
    pkt
}

pub struct TrackHarness {
    pub track: ClientTrack,
    pub remote: Arc<FakePublisher>,
    pub sink: Arc<MemorySink>,
}

pub fn scalable_harness(id: &str, claims: &ClaimMap) -> TrackHarness {
    let remote = Arc::new(FakePublisher::new(MediaCodec::Vp9));
    let sink = Arc::new(MemorySink::default());
    let track = Arc::new(ScalableClientTrack::new(
        id,
        remote.clone(),
        sink.clone(),
        claims.clone(),
        SubscriberQuality::default(),
        QualityPreset::default(),
    ));
    TrackHarness {
        track: ClientTrack::Scalable(track),
        remote,
        sink,
    }
}

pub fn simulcast_harness(id: &str, claims: &ClaimMap) -> TrackHarness {
    let remote = Arc::new(FakePublisher::new(MediaCodec::Vp8));
    let sink = Arc::new(MemorySink::default());
    let track = Arc::new(SimulcastClientTrack::new(id, remote.clone(), sink.clone(), claims.clone(), SubscriberQuality::default()));
    TrackHarness {
        track: ClientTrack::Simulcast(track),
        remote,
        sink,
    }
}

pub fn passthrough_harness(id: &str, codec: MediaCodec) -> TrackHarness {
    let remote = Arc::new(FakePublisher::new(codec));
    let sink = Arc::new(MemorySink::default());
    let track = Arc::new(PassthroughClientTrack::new(id, remote.clone(), sink.clone()));
    TrackHarness {
        track: ClientTrack::Passthrough(track),
        remote,
        sink,
    }
}
