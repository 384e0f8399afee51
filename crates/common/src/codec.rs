//! Video codec identifiers accepted by the hardware decoder.

use serde::{Deserialize, Serialize};

/// Video codec identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
    Mpeg1,
    Mpeg2,
    Mpeg4,
    Jpeg,
}

impl VideoCodec {
    /// Human-readable name for logging.
    pub fn display_name(self) -> &'static str {
        match self {
            Self::H264 => "AVC/H.264",
            Self::H265 => "H.265/HEVC",
            Self::Mpeg1 => "MPEG-1",
            Self::Mpeg2 => "MPEG-2",
            Self::Mpeg4 => "MPEG-4 (ASP)",
            Self::Jpeg => "M-JPEG",
        }
    }

    /// Minimum number of decode surfaces NVIDIA documents for this codec.
    ///
    /// These are hard floors: the decoder is always created with exactly
    /// this many surfaces and the value is never lowered by configuration.
    pub fn min_decode_surfaces(self) -> u32 {
        match self {
            Self::H264 | Self::H265 => 20,
            Self::Mpeg1 | Self::Mpeg2 | Self::Mpeg4 => 20,
            Self::Jpeg => 1,
        }
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_display() {
        assert_eq!(VideoCodec::H264.display_name(), "AVC/H.264");
        assert_eq!(VideoCodec::Jpeg.to_string(), "M-JPEG");
    }

    #[test]
    fn surface_minimums() {
        assert_eq!(VideoCodec::H264.min_decode_surfaces(), 20);
        assert_eq!(VideoCodec::H265.min_decode_surfaces(), 20);
        assert_eq!(VideoCodec::Mpeg2.min_decode_surfaces(), 20);
        assert_eq!(VideoCodec::Jpeg.min_decode_surfaces(), 1);
    }
}
