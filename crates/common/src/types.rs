//! Small value types shared between the decoder core and its collaborators.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Rational number for frame rates (e.g., 30000/1001 for 29.97fps).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub num: u32,
    pub den: u32,
}

impl Rational {
    pub const FPS_25: Self = Self { num: 25, den: 1 };
    pub const FPS_30: Self = Self { num: 30, den: 1 };
    pub const FPS_29_97: Self = Self {
        num: 30000,
        den: 1001,
    };

    /// Unknown frame rate (0/1).
    pub const UNKNOWN: Self = Self { num: 0, den: 1 };

    pub fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    pub fn is_unknown(self) -> bool {
        self.num == 0
    }

    /// Duration of one frame, or zero when the rate is unknown.
    pub fn frame_duration(self) -> Duration {
        if self.num == 0 {
            return Duration::ZERO;
        }
        let nanos = 1_000_000_000u128 * u128::from(self.den.max(1)) / u128::from(self.num);
        Duration::from_nanos(nanos as u64)
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Chroma subsampling reported by the bitstream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChromaFormat {
    Monochrome,
    Yuv420,
    Yuv422,
    Yuv444,
}

impl ChromaFormat {
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Monochrome => "YUV 400 (Monochrome)",
            Self::Yuv420 => "YUV 420",
            Self::Yuv422 => "YUV 422",
            Self::Yuv444 => "YUV 444",
        }
    }
}

impl fmt::Display for ChromaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Interlace mode announced on the output format.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterlaceMode {
    Progressive,
    Interleaved,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_duration_at_30fps() {
        assert_eq!(Rational::FPS_30.frame_duration(), Duration::from_nanos(33_333_333));
    }

    #[test]
    fn frame_duration_ntsc() {
        assert_eq!(
            Rational::FPS_29_97.frame_duration(),
            Duration::from_nanos(33_366_666)
        );
    }

    #[test]
    fn unknown_rate_has_zero_duration() {
        assert!(Rational::UNKNOWN.is_unknown());
        assert_eq!(Rational::UNKNOWN.frame_duration(), Duration::ZERO);
        assert_eq!(Rational::new(0, 0).frame_duration(), Duration::ZERO);
    }

    #[test]
    fn zero_denominator_treated_as_one() {
        assert_eq!(Rational::new(25, 0).frame_duration(), Duration::from_millis(40));
    }
}
