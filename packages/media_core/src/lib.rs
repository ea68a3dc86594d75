//! Subscriber-side forwarding core of the SFU: per-track packet selection
//! over scalable and simulcast streams, and the per-subscriber bitrate
//! controller that retunes every track to the available bandwidth.

pub mod bitrate_controller;
pub mod errors;
pub mod packet_cache;
pub mod subscriber;
pub mod track;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_utils;
