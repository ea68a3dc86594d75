//! Interfaces between the forwarding core and its collaborators: publisher
//! tracks feeding RTP in, local track sinks taking RTP out, the congestion
//! controller's bandwidth estimator and the receiver-report stats.

use rtp::packet::Packet;
use sfu_protocol::media::MediaCodec;
use sfu_protocol::quality::QualityLevel;
use sfu_utils::MediaError;
use tokio_util::sync::CancellationToken;

/// Publisher-side track a client track forwards from.
pub trait PublisherTrack: Send + Sync {
    /// Notified whenever the forwarder observes a keyframe in the stream.
    fn key_frame_received(&self);

    /// Ask the publisher for a keyframe.
    fn request_pli(&self);

    /// Ask the publisher for a keyframe on one simulcast encoding. Streams
    /// without per-encoding feedback fall back to a plain PLI.
    fn request_layer_pli(&self, quality: QualityLevel) {
        let _ = quality;
        self.request_pli();
    }

    /// Whether the encoding for the given quality currently produces media.
    /// Single-encoding publishers report every video tier as active.
    fn is_active(&self, quality: QualityLevel) -> bool;

    fn is_screen(&self) -> bool;

    fn codec(&self) -> MediaCodec;

    /// Fires when the publisher track ends; client tracks derive their own
    /// token from it.
    fn token(&self) -> CancellationToken;
}

/// Outgoing leg towards one subscriber.
pub trait TrackSink: Send + Sync {
    fn write_rtp(&self, pkt: &Packet) -> Result<(), MediaError>;
}

/// Congestion-controller estimate feed. The controller registers one
/// callback; the estimator invokes it whenever its target changes.
pub trait BandwidthEstimator: Send + Sync {
    fn on_target_bitrate(&self, callback: Box<dyn Fn(u32) + Send + Sync>);
}

/// Receiver-report view, sampled by the loss-based adjuster.
pub trait StatsSource: Send + Sync {
    /// Fraction of this sender's packets reported lost, in `[0, 1]`.
    fn fraction_lost(&self, track_id: &str) -> Option<f32>;
}

/// Rendered size reported by the subscriber for one of its tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSize {
    pub track_id: String,
    pub width: u32,
    pub height: u32,
}
