//! Sequence handling: output geometry tracking and renegotiation.
//!
//! The engine re-creates its decoder instance inside its own sequence
//! callback; by the time a [`SequenceInfo`] reaches the pipeline thread the
//! only remaining work is deciding whether downstream needs a new output
//! format.

use std::time::Duration;

use nvsync_common::{DecodeError, DecodeResult, InterlaceMode, Rational};
use tracing::{debug, info, warn};

use crate::engine::DecodeEngine;
use crate::event::SequenceInfo;
use crate::pipeline::{OutputFormat, PixelFormat, VideoPipeline};

/// Whether the engine must tear down and re-create its decoder instance for
/// a sequence of `width`x`height`.
pub fn needs_new_decoder(current: Option<(u32, u32)>, width: u32, height: u32) -> bool {
    current != Some((width, height))
}

/// The negotiated output, derived from the most recent sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputState {
    pub width: u32,
    pub height: u32,
    pub framerate: Rational,
    pub interlace_mode: InterlaceMode,
    /// Luma row stride of output buffers, as chosen by the pipeline.
    pub stride: u32,
    /// Highest latency reported to the pipeline so far.
    pub min_latency: Duration,
    negotiated: bool,
}

impl Default for OutputState {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            framerate: Rational::UNKNOWN,
            interlace_mode: InterlaceMode::Progressive,
            stride: 0,
            min_latency: Duration::ZERO,
            negotiated: false,
        }
    }
}

impl OutputState {
    pub fn is_negotiated(&self) -> bool {
        self.negotiated
    }

    /// Forget the current output so the next sequence renegotiates.
    pub fn invalidate(&mut self) {
        self.negotiated = false;
    }

    /// Whether `seq` describes a different output than the one negotiated.
    pub fn needs_renegotiation(&self, seq: &SequenceInfo) -> bool {
        let rate = seq.normalized_frame_rate();
        !self.negotiated
            || seq.width != self.width
            || seq.height != self.height
            || rate != self.framerate
    }

    pub fn format(&self) -> OutputFormat {
        OutputFormat {
            width: self.width,
            height: self.height,
            framerate: self.framerate,
            interlace_mode: self.interlace_mode,
            pixel_format: PixelFormat::Nv12,
        }
    }

    /// Duration of one frame at the negotiated rate (zero if unknown).
    pub fn frame_duration(&self) -> Duration {
        self.framerate.frame_duration()
    }

    /// Apply a sequence event. Returns `true` when a new output format was
    /// announced downstream.
    pub fn apply<E, P>(&mut self, seq: &SequenceInfo, engine: &E, pipeline: &mut P) -> DecodeResult<bool>
    where
        E: DecodeEngine + ?Sized,
        P: VideoPipeline + ?Sized,
    {
        if !engine.has_decoder() {
            warn!(
                width = seq.width,
                height = seq.height,
                "Sequence event without a decoder instance"
            );
            return Err(DecodeError::DecoderNotReady);
        }

        if !self.needs_renegotiation(seq) {
            debug!(
                width = seq.width,
                height = seq.height,
                "Sequence unchanged, keeping output format"
            );
            return Ok(false);
        }

        self.width = seq.width;
        self.height = seq.height;
        self.framerate = seq.normalized_frame_rate();
        self.interlace_mode = if seq.progressive {
            InterlaceMode::Progressive
        } else {
            InterlaceMode::Interleaved
        };

        let format = self.format();
        match pipeline.set_output_format(&format) {
            Ok(stride) => {
                self.stride = stride;
                self.negotiated = true;
                info!(
                    width = format.width,
                    height = format.height,
                    framerate = %format.framerate,
                    interlace = ?format.interlace_mode,
                    stride,
                    "Output format negotiated"
                );
                Ok(true)
            }
            Err(e) => {
                self.negotiated = false;
                warn!(error = %e, "Failed to negotiate with downstream");
                Err(DecodeError::RenegotiationFailed(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{BitstreamPacket, PlaneCopy};
    use crate::event::DisplayInfo;
    use crate::frame::{OutputBuffer, PendingFrame};
    use nvsync_common::{ChromaFormat, DecoderConfig, PipelineError};

    struct StubEngine {
        ready: bool,
    }

    impl DecodeEngine for StubEngine {
        fn configure(&mut self, _config: &DecoderConfig) -> DecodeResult<()> {
            Ok(())
        }
        fn submit(&mut self, _packet: &BitstreamPacket<'_>) -> DecodeResult<()> {
            Ok(())
        }
        fn has_decoder(&self) -> bool {
            self.ready
        }
        fn copy_planes(&mut self, _: &DisplayInfo, _: &[PlaneCopy], _: &mut [u8]) -> DecodeResult<()> {
            Ok(())
        }
        fn close(&mut self) {}
    }

    #[derive(Default)]
    struct FormatRecorder {
        formats: Vec<OutputFormat>,
        reject: bool,
    }

    impl VideoPipeline for FormatRecorder {
        fn set_output_format(&mut self, format: &OutputFormat) -> Result<u32, PipelineError> {
            if self.reject {
                return Err(PipelineError::NotNegotiated("no common caps".into()));
            }
            self.formats.push(*format);
            Ok(format.default_stride())
        }
        fn allocate_output_frame(&mut self, _: &PendingFrame) -> Result<OutputBuffer, PipelineError> {
            Ok(OutputBuffer::default())
        }
        fn finish_frame(&mut self, _: PendingFrame) -> Result<(), PipelineError> {
            Ok(())
        }
        fn release_frame(&mut self, _: &PendingFrame) {}
        fn pending_frames(&self) -> Vec<PendingFrame> {
            Vec::new()
        }
        fn set_latency(&mut self, _: Duration, _: Duration) {}
    }

    fn seq(width: u32, height: u32, rate: Rational) -> SequenceInfo {
        SequenceInfo {
            width,
            height,
            coded_width: width,
            coded_height: height,
            frame_rate: rate,
            chroma_format: ChromaFormat::Yuv420,
            bit_depth: 8,
            progressive: true,
        }
    }

    #[test]
    fn first_sequence_negotiates() {
        let mut state = OutputState::default();
        let mut pipeline = FormatRecorder::default();
        let engine = StubEngine { ready: true };

        let changed = state
            .apply(&seq(640, 480, Rational::FPS_30), &engine, &mut pipeline)
            .expect("negotiation");
        assert!(changed);
        assert!(state.is_negotiated());
        assert_eq!(state.stride, 640);
        assert_eq!(pipeline.formats.len(), 1);
        assert_eq!(pipeline.formats[0].interlace_mode, InterlaceMode::Progressive);
    }

    #[test]
    fn same_geometry_does_not_renegotiate() {
        let mut state = OutputState::default();
        let mut pipeline = FormatRecorder::default();
        let engine = StubEngine { ready: true };

        state
            .apply(&seq(640, 480, Rational::FPS_30), &engine, &mut pipeline)
            .expect("first");
        let changed = state
            .apply(&seq(640, 480, Rational::FPS_30), &engine, &mut pipeline)
            .expect("second");
        assert!(!changed);
        assert_eq!(pipeline.formats.len(), 1);
    }

    #[test]
    fn rate_change_renegotiates() {
        let mut state = OutputState::default();
        let mut pipeline = FormatRecorder::default();
        let engine = StubEngine { ready: true };

        state
            .apply(&seq(640, 480, Rational::FPS_30), &engine, &mut pipeline)
            .expect("first");
        state
            .apply(&seq(640, 480, Rational::FPS_25), &engine, &mut pipeline)
            .expect("second");
        assert_eq!(pipeline.formats.len(), 2);
        assert_eq!(state.frame_duration(), Duration::from_millis(40));
    }

    #[test]
    fn zero_denominator_compares_as_one() {
        let mut state = OutputState::default();
        let mut pipeline = FormatRecorder::default();
        let engine = StubEngine { ready: true };

        state
            .apply(&seq(320, 240, Rational::new(30, 0)), &engine, &mut pipeline)
            .expect("first");
        assert_eq!(state.framerate, Rational::new(30, 1));
        assert!(!state.needs_renegotiation(&seq(320, 240, Rational::new(30, 1))));
    }

    #[test]
    fn missing_decoder_is_an_error() {
        let mut state = OutputState::default();
        let mut pipeline = FormatRecorder::default();
        let engine = StubEngine { ready: false };

        let err = state
            .apply(&seq(640, 480, Rational::FPS_30), &engine, &mut pipeline)
            .unwrap_err();
        assert!(matches!(err, DecodeError::DecoderNotReady));
        assert!(pipeline.formats.is_empty());
    }

    #[test]
    fn rejected_format_leaves_state_unnegotiated() {
        let mut state = OutputState::default();
        let mut pipeline = FormatRecorder {
            reject: true,
            ..Default::default()
        };
        let engine = StubEngine { ready: true };

        let err = state
            .apply(&seq(640, 480, Rational::FPS_30), &engine, &mut pipeline)
            .unwrap_err();
        assert!(matches!(err, DecodeError::RenegotiationFailed(_)));
        assert!(!state.is_negotiated());

        // The next identical sequence retries.
        pipeline.reject = false;
        assert!(state
            .apply(&seq(640, 480, Rational::FPS_30), &engine, &mut pipeline)
            .expect("retry"));
    }

    #[test]
    fn decoder_recreation_only_on_resize() {
        assert!(needs_new_decoder(None, 640, 480));
        assert!(!needs_new_decoder(Some((640, 480)), 640, 480));
        assert!(needs_new_decoder(Some((640, 480)), 1280, 720));
    }
}
