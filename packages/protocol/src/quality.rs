use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Quality a subscriber track is committed to.
///
/// Video uses the `None..=High` tiers; audio claims are pinned to `Audio` or
/// `AudioRed` and never adjusted. Audio sits above the video tiers so
/// fleet-wide lowest/highest scans over mixed claims ignore audio claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum QualityLevel {
    None = 0,
    Low = 1,
    Mid = 2,
    High = 3,
    AudioRed = 10,
    Audio = 11,
}

impl QualityLevel {
    /// Recover a level from an atomic cell; unknown raw values read as None.
    pub fn from_raw(value: u8) -> Self {
        QualityLevel::try_from(value).unwrap_or(QualityLevel::None)
    }

    pub fn is_video(&self) -> bool {
        matches!(self, QualityLevel::None | QualityLevel::Low | QualityLevel::Mid | QualityLevel::High)
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, QualityLevel::Audio | QualityLevel::AudioRed)
    }

    /// Next video tier up, staying inside `None..=High`.
    pub fn up(&self) -> Option<QualityLevel> {
        match self {
            QualityLevel::None => Some(QualityLevel::Low),
            QualityLevel::Low => Some(QualityLevel::Mid),
            QualityLevel::Mid => Some(QualityLevel::High),
            _ => None,
        }
    }

    /// Next video tier down, staying inside `None..=High`.
    pub fn down(&self) -> Option<QualityLevel> {
        match self {
            QualityLevel::High => Some(QualityLevel::Mid),
            QualityLevel::Mid => Some(QualityLevel::Low),
            QualityLevel::Low => Some(QualityLevel::None),
            _ => None,
        }
    }
}

/// Spatial/temporal layer pair a quality tier maps to inside one SVC stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerPreset {
    pub spatial: u8,
    pub temporal: u8,
}

impl LayerPreset {
    pub const fn new(spatial: u8, temporal: u8) -> Self {
        Self { spatial, temporal }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityPreset {
    pub high: LayerPreset,
    pub mid: LayerPreset,
    pub low: LayerPreset,
}

impl Default for QualityPreset {
    fn default() -> Self {
        Self {
            high: LayerPreset::new(2, 2),
            mid: LayerPreset::new(1, 1),
            low: LayerPreset::new(0, 0),
        }
    }
}

impl QualityPreset {
    /// Target layers for a video tier. Anything at or below Low maps to the
    /// low preset; callers suppress `None` before forwarding.
    pub fn layer(&self, quality: QualityLevel) -> LayerPreset {
        match quality {
            QualityLevel::High => self.high,
            QualityLevel::Mid => self.mid,
            _ => self.low,
        }
    }
}

/// Bitrate and viewport thresholds shared by admission and adjustment.
#[derive(Debug, Clone, Copy)]
pub struct BitrateConfig {
    pub audio: u32,
    pub audio_red: u32,
    pub video_low: u32,
    pub video_mid: u32,
    pub video_high: u32,
    pub video_low_pixels: u32,
    pub video_mid_pixels: u32,
}

impl Default for BitrateConfig {
    fn default() -> Self {
        Self {
            audio: 48_000,
            audio_red: 65_000,
            video_low: 100_000,
            video_mid: 500_000,
            video_high: 2_000_000,
            video_low_pixels: 320 * 240,
            video_mid_pixels: 640 * 480,
        }
    }
}

impl BitrateConfig {
    /// Bitrate a claim commits to at the given quality.
    pub fn quality_to_bitrate(&self, quality: QualityLevel) -> u32 {
        match quality {
            QualityLevel::None => 0,
            QualityLevel::Low => self.video_low,
            QualityLevel::Mid => self.video_mid,
            QualityLevel::High => self.video_high,
            QualityLevel::AudioRed => self.audio_red,
            QualityLevel::Audio => self.audio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_tiers_are_ordered() {
        assert!(QualityLevel::None < QualityLevel::Low);
        assert!(QualityLevel::Low < QualityLevel::Mid);
        assert!(QualityLevel::Mid < QualityLevel::High);
        assert!(QualityLevel::AudioRed <= QualityLevel::Audio);
    }

    #[test]
    fn audio_does_not_perturb_video_scans() {
        // lowest-quality scans start at High and take the min; audio claims
        // must never drag the fleet minimum down
        assert!(QualityLevel::Audio > QualityLevel::High);
        assert!(QualityLevel::AudioRed > QualityLevel::High);
    }

    #[test]
    fn up_down_walk_the_video_ladder() {
        assert_eq!(QualityLevel::Low.up(), Some(QualityLevel::Mid));
        assert_eq!(QualityLevel::High.up(), None);
        assert_eq!(QualityLevel::High.down(), Some(QualityLevel::Mid));
        assert_eq!(QualityLevel::None.down(), None);
        assert_eq!(QualityLevel::Audio.up(), None);
    }

    #[test]
    fn from_raw_falls_back_to_none() {
        assert_eq!(QualityLevel::from_raw(3), QualityLevel::High);
        assert_eq!(QualityLevel::from_raw(7), QualityLevel::None);
        assert_eq!(QualityLevel::from_raw(11), QualityLevel::Audio);
    }

    #[test]
    fn preset_defaults() {
        let preset = QualityPreset::default();
        assert_eq!(preset.layer(QualityLevel::High), LayerPreset::new(2, 2));
        assert_eq!(preset.layer(QualityLevel::Mid), LayerPreset::new(1, 1));
        assert_eq!(preset.layer(QualityLevel::Low), LayerPreset::new(0, 0));
    }

    #[test]
    fn bitrate_map() {
        let config = BitrateConfig::default();
        assert_eq!(config.quality_to_bitrate(QualityLevel::None), 0);
        assert_eq!(config.quality_to_bitrate(QualityLevel::Mid), 500_000);
        assert_eq!(config.quality_to_bitrate(QualityLevel::Audio), 48_000);
    }
}
