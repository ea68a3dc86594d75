//! Client tracks: the per-subscriber forwarders sitting between one
//! publisher track and one local track sink.
//!
//! The three variants share one capability surface behind a tagged enum; the
//! controller stays variant-agnostic except where it downcasts to issue
//! layer-targeted keyframe requests on simulcast.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use rtp::packet::Packet;
use sfu_protocol::media::{MediaCodec, MediaKind};
use sfu_protocol::quality::QualityLevel;
use tokio_util::sync::CancellationToken;

pub use passthrough::PassthroughClientTrack;
pub use scalable::ScalableClientTrack;
pub use simulcast::SimulcastClientTrack;

mod passthrough;
mod scalable;
mod simulcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackType {
    Media,
    Screen,
}

/// Subscriber-level quality cap, shared between the session layer and every
/// track of that subscriber.
#[derive(Clone)]
pub struct SubscriberQuality(Arc<AtomicU8>);

impl Default for SubscriberQuality {
    fn default() -> Self {
        Self(Arc::new(AtomicU8::new(QualityLevel::High.into())))
    }
}

impl SubscriberQuality {
    pub fn get(&self) -> QualityLevel {
        QualityLevel::from_raw(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, quality: QualityLevel) {
        self.0.store(quality.into(), Ordering::Relaxed);
    }
}

#[derive(Clone)]
pub enum ClientTrack {
    Scalable(Arc<ScalableClientTrack>),
    Simulcast(Arc<SimulcastClientTrack>),
    Passthrough(Arc<PassthroughClientTrack>),
}

impl ClientTrack {
    pub fn id(&self) -> &str {
        match self {
            ClientTrack::Scalable(track) => track.id(),
            ClientTrack::Simulcast(track) => track.id(),
            ClientTrack::Passthrough(track) => track.id(),
        }
    }

    pub fn codec(&self) -> MediaCodec {
        match self {
            ClientTrack::Scalable(track) => track.codec(),
            ClientTrack::Simulcast(track) => track.codec(),
            ClientTrack::Passthrough(track) => track.codec(),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.codec().kind()
    }

    pub fn is_scalable(&self) -> bool {
        matches!(self, ClientTrack::Scalable(_))
    }

    pub fn is_simulcast(&self) -> bool {
        matches!(self, ClientTrack::Simulcast(_))
    }

    /// Whether the controller may move this track between quality tiers.
    pub fn is_adjustable(&self) -> bool {
        self.is_scalable() || self.is_simulcast()
    }

    pub fn is_screen(&self) -> bool {
        match self {
            ClientTrack::Scalable(track) => track.is_screen(),
            ClientTrack::Simulcast(track) => track.is_screen(),
            ClientTrack::Passthrough(track) => track.is_screen(),
        }
    }

    pub fn set_source_type(&self, source_type: TrackType) {
        match self {
            ClientTrack::Scalable(track) => track.set_source_type(source_type),
            ClientTrack::Simulcast(track) => track.set_source_type(source_type),
            ClientTrack::Passthrough(track) => track.set_source_type(source_type),
        }
    }

    pub fn max_quality(&self) -> QualityLevel {
        match self {
            ClientTrack::Scalable(track) => track.max_quality(),
            ClientTrack::Simulcast(track) => track.max_quality(),
            ClientTrack::Passthrough(track) => track.max_quality(),
        }
    }

    pub fn set_max_quality(&self, quality: QualityLevel) {
        match self {
            ClientTrack::Scalable(track) => track.set_max_quality(quality),
            ClientTrack::Simulcast(track) => track.set_max_quality(quality),
            ClientTrack::Passthrough(track) => track.set_max_quality(quality),
        }
    }

    pub fn last_quality(&self) -> QualityLevel {
        match self {
            ClientTrack::Scalable(track) => track.last_quality(),
            ClientTrack::Simulcast(track) => track.last_quality(),
            ClientTrack::Passthrough(track) => track.last_quality(),
        }
    }

    pub fn set_last_quality(&self, quality: QualityLevel) {
        match self {
            ClientTrack::Scalable(track) => track.set_last_quality(quality),
            ClientTrack::Simulcast(track) => track.set_last_quality(quality),
            ClientTrack::Passthrough(track) => track.set_last_quality(quality),
        }
    }

    pub fn request_pli(&self) {
        match self {
            ClientTrack::Scalable(track) => track.request_pli(),
            ClientTrack::Simulcast(track) => track.request_pli(),
            ClientTrack::Passthrough(track) => track.request_pli(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        match self {
            ClientTrack::Scalable(track) => track.token(),
            ClientTrack::Simulcast(track) => track.token(),
            ClientTrack::Passthrough(track) => track.token(),
        }
    }

    /// Feed one upstream packet. `source` tags which simulcast encoding the
    /// packet belongs to; single-stream tracks ignore it.
    pub fn push(&self, pkt: Packet, source: QualityLevel) {
        match self {
            ClientTrack::Scalable(track) => track.push(pkt),
            ClientTrack::Simulcast(track) => track.push(pkt, source),
            ClientTrack::Passthrough(track) => track.push(pkt),
        }
    }

    /// Register a callback fired once when the track ends.
    pub fn on_track_ended(&self, callback: Box<dyn FnOnce() + Send>) {
        match self {
            ClientTrack::Scalable(track) => track.on_track_ended(callback),
            ClientTrack::Simulcast(track) => track.on_track_ended(callback),
            ClientTrack::Passthrough(track) => track.on_track_ended(callback),
        }
    }

    /// Fire the end-of-track callbacks, once.
    pub fn mark_ended(&self) {
        match self {
            ClientTrack::Scalable(track) => track.mark_ended(),
            ClientTrack::Simulcast(track) => track.mark_ended(),
            ClientTrack::Passthrough(track) => track.mark_ended(),
        }
    }

    pub fn as_simulcast(&self) -> Option<&Arc<SimulcastClientTrack>> {
        match self {
            ClientTrack::Simulcast(track) => Some(track),
            _ => None,
        }
    }
}
