//! The surrounding media pipeline, as seen by the decoder.
//!
//! The pipeline owns the list of pending frames, negotiates the output
//! format with downstream, hands out output buffers, and receives
//! finished frames. The decoder drives it only through this trait.

use std::time::Duration;

use nvsync_common::{InterlaceMode, PipelineError, Rational};

use crate::frame::{OutputBuffer, PendingFrame};

/// Pixel layout of output buffers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit luma plane followed by an interleaved UV plane at half height.
    #[default]
    Nv12,
}

/// Output format announced downstream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OutputFormat {
    pub width: u32,
    pub height: u32,
    pub framerate: Rational,
    pub interlace_mode: InterlaceMode,
    pub pixel_format: PixelFormat,
}

impl OutputFormat {
    /// Default NV12 luma stride for this width (rows padded to 4 bytes).
    pub fn default_stride(&self) -> u32 {
        (self.width + 3) & !3
    }

    /// Size of an NV12 image at the given stride.
    pub fn nv12_size(&self, stride: u32) -> usize {
        let chroma_rows = self.height.div_ceil(2);
        stride as usize * (self.height + chroma_rows) as usize
    }
}

/// Pipeline-side operations the decoder depends on.
pub trait VideoPipeline {
    /// Announce a new output format. Returns the luma row stride the
    /// pipeline will use for output buffers.
    fn set_output_format(&mut self, format: &OutputFormat) -> Result<u32, PipelineError>;

    /// Allocate the output buffer for `frame`.
    fn allocate_output_frame(&mut self, frame: &PendingFrame) -> Result<OutputBuffer, PipelineError>;

    /// Push a completed frame downstream and drop it from the pending list.
    fn finish_frame(&mut self, frame: PendingFrame) -> Result<(), PipelineError>;

    /// Drop a frame from the pending list without emitting it.
    fn release_frame(&mut self, frame: &PendingFrame);

    /// Frames accepted but not yet finished, oldest first.
    fn pending_frames(&self) -> Vec<PendingFrame>;

    /// Report the decoder's latency.
    fn set_latency(&mut self, min: Duration, max: Duration);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(width: u32, height: u32) -> OutputFormat {
        OutputFormat {
            width,
            height,
            framerate: Rational::FPS_30,
            interlace_mode: InterlaceMode::Progressive,
            pixel_format: PixelFormat::Nv12,
        }
    }

    #[test]
    fn stride_is_padded() {
        assert_eq!(format(640, 480).default_stride(), 640);
        assert_eq!(format(642, 480).default_stride(), 644);
    }

    #[test]
    fn nv12_size_includes_chroma() {
        assert_eq!(format(640, 480).nv12_size(640), 640 * 720);
        // Odd heights round the chroma plane up.
        assert_eq!(format(4, 3).nv12_size(4), 4 * 5);
    }
}
