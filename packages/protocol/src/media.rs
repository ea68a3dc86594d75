#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn is_audio(&self) -> bool {
        matches!(self, MediaKind::Audio)
    }

    pub fn is_video(&self) -> bool {
        matches!(self, MediaKind::Video)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaCodec {
    Opus,
    Red,
    Vp8,
    Vp9,
    H264,
}

impl MediaCodec {
    pub fn kind(&self) -> MediaKind {
        match self {
            MediaCodec::Opus | MediaCodec::Red => MediaKind::Audio,
            MediaCodec::Vp8 | MediaCodec::Vp9 | MediaCodec::H264 => MediaKind::Video,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            MediaCodec::Opus => "audio/opus",
            MediaCodec::Red => "audio/red",
            MediaCodec::Vp8 => "video/VP8",
            MediaCodec::Vp9 => "video/VP9",
            MediaCodec::H264 => "video/H264",
        }
    }
}
