//! Capture and encoder configuration.

use serde::{Deserialize, Serialize};

use crate::error::StreamError;

/// Video codec selection. H264 is the only codec with a real pipeline;
/// anything else is rejected at the setter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
}

impl Codec {
    pub fn parse(name: &str) -> Result<Self, StreamError> {
        match name.to_ascii_lowercase().as_str() {
            "h264" => Ok(Codec::H264),
            other => Err(StreamError::InvalidCodec(other.to_string())),
        }
    }
}

/// Coarse encoder quality preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Low,
    Medium,
    High,
    Ultra,
}

impl QualityPreset {
    pub fn parse(name: &str) -> Result<Self, StreamError> {
        match name.to_ascii_lowercase().as_str() {
            "low" => Ok(QualityPreset::Low),
            "medium" => Ok(QualityPreset::Medium),
            "high" => Ok(QualityPreset::High),
            "ultra" => Ok(QualityPreset::Ultra),
            other => Err(StreamError::InvalidQuality(other.to_string())),
        }
    }

    /// Default JPEG quality associated with the preset, used by the
    /// still-frame path.
    pub fn jpeg_quality(self) -> u8 {
        match self {
            QualityPreset::Low => 40,
            QualityPreset::Medium => 60,
            QualityPreset::High => 75,
            QualityPreset::Ultra => 90,
        }
    }
}

/// Per-session capture configuration. Immutable after session start
/// except through a monitor switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub display_index: u32,
    /// JPEG quality for the still-frame path, 1..=100.
    pub quality: u8,
    /// Output scale relative to native resolution, >= 0.1.
    pub scale_factor: f32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            display_index: 0,
            quality: 75,
            scale_factor: 1.0,
        }
    }
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.quality == 0 || self.quality > 100 {
            return Err(StreamError::InvalidQuality(format!(
                "quality {} out of range 1..=100",
                self.quality
            )));
        }
        if self.scale_factor < 0.1 {
            return Err(StreamError::InvalidQuality(format!(
                "scale factor {} below 0.1",
                self.scale_factor
            )));
        }
        Ok(())
    }
}

/// Encoder parameters. Mutated only through the validating setters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub codec: Codec,
    pub quality: QualityPreset,
    /// Target bitrate in bits per second.
    pub bitrate: u32,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
}

impl EncoderConfig {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            codec: Codec::H264,
            quality: QualityPreset::High,
            bitrate: 4_000_000,
            fps: 30,
            width,
            height,
        }
    }

    pub fn set_codec(&mut self, name: &str) -> Result<(), StreamError> {
        self.codec = Codec::parse(name)?;
        Ok(())
    }

    pub fn set_quality(&mut self, name: &str) -> Result<(), StreamError> {
        self.quality = QualityPreset::parse(name)?;
        Ok(())
    }

    pub fn set_bitrate(&mut self, bps: u32) -> Result<(), StreamError> {
        if bps == 0 {
            return Err(StreamError::InvalidBitrate("bitrate must be > 0".into()));
        }
        self.bitrate = bps;
        Ok(())
    }

    pub fn set_fps(&mut self, fps: u32) -> Result<(), StreamError> {
        if fps == 0 || fps > 60 {
            return Err(StreamError::InvalidFps(format!(
                "fps {} out of range 1..=60",
                fps
            )));
        }
        self.fps = fps;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_parse() {
        assert_eq!(Codec::parse("h264").unwrap(), Codec::H264);
        assert_eq!(Codec::parse("H264").unwrap(), Codec::H264);
        assert!(matches!(
            Codec::parse("vp9"),
            Err(StreamError::InvalidCodec(_))
        ));
    }

    #[test]
    fn test_encoder_setter_validation() {
        let mut config = EncoderConfig::new(1920, 1080);

        assert!(matches!(
            config.set_bitrate(0),
            Err(StreamError::InvalidBitrate(_))
        ));
        config.set_bitrate(2_500_000).unwrap();
        assert_eq!(config.bitrate, 2_500_000);

        assert!(matches!(config.set_fps(0), Err(StreamError::InvalidFps(_))));
        assert!(matches!(config.set_fps(61), Err(StreamError::InvalidFps(_))));
        config.set_fps(60).unwrap();
        assert_eq!(config.fps, 60);

        assert!(matches!(
            config.set_quality("insane"),
            Err(StreamError::InvalidQuality(_))
        ));
        config.set_quality("ultra").unwrap();
        assert_eq!(config.quality, QualityPreset::Ultra);
    }

    #[test]
    fn test_preset_jpeg_quality_is_ordered() {
        let presets = [
            QualityPreset::Low,
            QualityPreset::Medium,
            QualityPreset::High,
            QualityPreset::Ultra,
        ];
        let qualities: Vec<u8> = presets.iter().map(|p| p.jpeg_quality()).collect();
        let mut sorted = qualities.clone();
        sorted.sort_unstable();
        assert_eq!(qualities, sorted);
    }

    #[test]
    fn test_capture_config_validate() {
        assert!(CaptureConfig::default().validate().is_ok());

        let bad = CaptureConfig {
            quality: 0,
            ..CaptureConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = CaptureConfig {
            scale_factor: 0.05,
            ..CaptureConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
