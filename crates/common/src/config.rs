//! Decoder configuration.

use serde::{Deserialize, Serialize};

use crate::codec::VideoCodec;
use crate::error::DecodeError;

/// Deinterlacing applied by the hardware when mapping a surface.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeinterlaceMode {
    /// Fields are woven together; field flags travel on the output buffer.
    #[default]
    Weave,
    Bob,
    Adaptive,
}

/// Which NVDEC engine path the decoder instance is created on.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateFlags {
    Default,
    PreferCuda,
    PreferDxva,
    /// Dedicated video engine (the path the decoder was validated on).
    #[default]
    PreferCuvid,
}

/// Hardware decoder configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub codec: VideoCodec,
    /// CUDA device used when no external context is injected.
    pub device_ordinal: u32,
    /// Parser error tolerance, 0..=100 (100 = keep going on corrupt data).
    pub error_threshold: u32,
    /// Frames the parser may hold back for reordering (0 = lowest latency).
    pub max_display_delay: u32,
    /// Timestamp ticks per second; the default keeps timestamps in nanoseconds.
    pub clock_rate: u32,
    /// Surfaces that may be mapped at once.
    pub num_output_surfaces: u32,
    pub deinterlace: DeinterlaceMode,
    pub create_flags: CreateFlags,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            device_ordinal: 0,
            error_threshold: 100,
            max_display_delay: 0,
            clock_rate: 1_000_000_000,
            num_output_surfaces: 1,
            deinterlace: DeinterlaceMode::Weave,
            create_flags: CreateFlags::PreferCuvid,
        }
    }
}

impl DecoderConfig {
    pub fn new(codec: VideoCodec) -> Self {
        Self {
            codec,
            ..Self::default()
        }
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, DecodeError> {
        serde_json::from_str(json).map_err(|e| DecodeError::InvalidConfig(e.to_string()))
    }

    /// Decode surface count for the configured codec.
    pub fn num_decode_surfaces(&self) -> u32 {
        self.codec.min_decode_surfaces()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = DecoderConfig::default();
        assert_eq!(config.codec, VideoCodec::H264);
        assert_eq!(config.error_threshold, 100);
        assert_eq!(config.max_display_delay, 0);
        assert_eq!(config.clock_rate, 1_000_000_000);
        assert_eq!(config.deinterlace, DeinterlaceMode::Weave);
        assert_eq!(config.create_flags, CreateFlags::PreferCuvid);
    }

    #[test]
    fn json_with_partial_fields() {
        let config = DecoderConfig::from_json(r#"{ "codec": "jpeg", "device_ordinal": 1 }"#)
            .expect("valid config");
        assert_eq!(config.codec, VideoCodec::Jpeg);
        assert_eq!(config.device_ordinal, 1);
        assert_eq!(config.num_decode_surfaces(), 1);
        assert_eq!(config.error_threshold, 100);
    }

    #[test]
    fn json_rejects_unknown_codec() {
        let err = DecoderConfig::from_json(r#"{ "codec": "vp9" }"#).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidConfig(_)));
    }

    #[test]
    fn surfaces_follow_codec() {
        assert_eq!(DecoderConfig::new(VideoCodec::H265).num_decode_surfaces(), 20);
    }
}
