use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Webm,
    Mp4,
    Json,
}

impl ExportFormat {
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Webm => "webm",
            Self::Mp4 => "mp4",
            Self::Json => "json",
        }
    }

    #[must_use]
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Webm => "video/webm",
            Self::Mp4 => "video/mp4",
            Self::Json => "application/json",
        }
    }

    #[must_use]
    pub fn is_video(self) -> bool {
        !matches!(self, Self::Json)
    }

    #[must_use]
    pub fn default_strategy(self) -> Option<CaptureStrategy> {
        match self {
            Self::Webm => Some(CaptureStrategy::Streaming),
            Self::Mp4 => Some(CaptureStrategy::FrameExact),
            Self::Json => None,
        }
    }
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStrategy {
    Streaming,
    FrameExact,
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Low,
    Medium,
    #[default]
    High,
    Ultra,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct EncoderParams {
    pub scale: f64,
    pub video_bitrate_kbps: u32,
    pub preset: &'static str,
    pub crf: u8,
    pub pixel_format: &'static str,
}

impl QualityTier {
    #[must_use]
    pub fn params(self) -> EncoderParams {
        match self {
            Self::Low => EncoderParams {
                scale: 0.5,
                video_bitrate_kbps: 1_500,
                preset: "ultrafast",
                crf: 30,
                pixel_format: "yuv420p",
            },
            Self::Medium => EncoderParams {
                scale: 0.75,
                video_bitrate_kbps: 4_000,
                preset: "veryfast",
                crf: 25,
                pixel_format: "yuv420p",
            },
            Self::High => EncoderParams {
                scale: 1.0,
                video_bitrate_kbps: 8_000,
                preset: "medium",
                crf: 20,
                pixel_format: "yuv420p",
            },
            // Full chroma keeps thin fret wires from smearing.
            Self::Ultra => EncoderParams {
                scale: 1.0,
                video_bitrate_kbps: 16_000,
                preset: "slow",
                crf: 16,
                pixel_format: "yuv444p",
            },
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Ultra => "ultra",
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_tiers_never_lower_fidelity() {
        let tiers = [
            QualityTier::Low,
            QualityTier::Medium,
            QualityTier::High,
            QualityTier::Ultra,
        ];
        for pair in tiers.windows(2) {
            let lower = pair[0].params();
            let higher = pair[1].params();
            assert!(higher.scale >= lower.scale);
            assert!(higher.video_bitrate_kbps > lower.video_bitrate_kbps);
            assert!(higher.crf < lower.crf);
        }
        assert_eq!(QualityTier::Ultra.params().pixel_format, "yuv444p");
    }

    #[test]
    fn formats_pick_their_capture_strategy() {
        assert_eq!(
            ExportFormat::Webm.default_strategy(),
            Some(CaptureStrategy::Streaming)
        );
        assert_eq!(
            ExportFormat::Mp4.default_strategy(),
            Some(CaptureStrategy::FrameExact)
        );
        assert_eq!(ExportFormat::Json.default_strategy(), None);
    }

    #[test]
    fn serde_uses_lowercase_names() {
        let json = serde_json::to_string(&(ExportFormat::Mp4, QualityTier::Ultra))
            .expect("serialize");
        assert_eq!(json, r#"["mp4","ultra"]"#);
    }
}
