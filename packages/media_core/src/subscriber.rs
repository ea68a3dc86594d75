//! Per-subscriber task layer.
//!
//! One packet loop per attached client track, each reading from a bounded
//! queue, plus one adjustment ticker in loss mode. Cancellation fans out from
//! the subscriber's token; the publisher side cancels individual tracks
//! through the track's own token. A loop's exit removes the track's claim,
//! so controller state never outlives the track.

use std::sync::Arc;
use std::time::Duration;

use async_std::channel::{bounded, Sender};
use async_std::stream::StreamExt;
use futures::FutureExt;
use rtp::packet::Packet;
use sfu_protocol::quality::QualityLevel;
use tokio_util::sync::CancellationToken;

use crate::bitrate_controller::{BitrateController, ADJUSTMENT_TICK};
use crate::track::{ClientTrack, SubscriberQuality};

const PACKET_QUEUE_LEN: usize = 16;

pub struct Subscriber {
    controller: Arc<BitrateController>,
    quality: SubscriberQuality,
    token: CancellationToken,
    tick_interval: Duration,
}

impl Subscriber {
    pub fn new(controller: Arc<BitrateController>, quality: SubscriberQuality) -> Self {
        Self {
            controller,
            quality,
            token: CancellationToken::new(),
            tick_interval: ADJUSTMENT_TICK,
        }
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn controller(&self) -> &Arc<BitrateController> {
        &self.controller
    }

    pub fn quality(&self) -> SubscriberQuality {
        self.quality.clone()
    }

    pub fn set_quality(&self, quality: QualityLevel) {
        self.quality.set(quality);
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Start the adjustment ticker. Bandwidth-estimation mode has no loop;
    /// the estimator callback drives everything.
    pub fn start(&self) {
        if !self.controller.is_loss_based() {
            return;
        }
        let controller = self.controller.clone();
        let token = self.token.clone();
        let tick_interval = self.tick_interval;
        async_std::task::spawn(async move {
            let mut tick = async_std::stream::interval(tick_interval);
            let cancelled = token.cancelled().fuse();
            futures::pin_mut!(cancelled);
            loop {
                futures::select! {
                    _ = tick.next().fuse() => controller.check_and_adjust(),
                    _ = cancelled => break,
                }
            }
        });
    }

    /// Spawn the packet loop for one attached track and hand its queue back
    /// to the session layer. The loop exits on cancellation (either side) or
    /// when the queue's senders are gone, then removes the claim once.
    pub fn attach(&self, track: ClientTrack) -> Sender<(Packet, QualityLevel)> {
        let (tx, rx) = bounded::<(Packet, QualityLevel)>(PACKET_QUEUE_LEN);
        let controller = self.controller.clone();
        let subscriber_token = self.token.clone();

        async_std::task::spawn(async move {
            let track_token = track.token();
            let track_cancelled = track_token.cancelled().fuse();
            let subscriber_cancelled = subscriber_token.cancelled().fuse();
            futures::pin_mut!(track_cancelled, subscriber_cancelled);
            loop {
                futures::select! {
                    pkt = rx.recv().fuse() => match pkt {
                        Ok((pkt, source)) => track.push(pkt, source),
                        Err(_) => break,
                    },
                    _ = track_cancelled => break,
                    _ = subscriber_cancelled => break,
                }
            }

            log::info!("[Subscriber] track {} packet loop ended", track.id());
            controller.remove_claim(track.id());
            track.mark_ended();
        });

        tx
    }

    /// Cancel every loop belonging to this subscriber.
    pub fn close(&self) {
        self.token.cancel();
    }
}
