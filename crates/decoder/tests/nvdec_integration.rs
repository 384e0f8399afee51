//! Smoke tests against a real NVIDIA GPU. Run with `--ignored` on a machine
//! with the driver installed.

use std::sync::Arc;
use std::time::Duration;

use nvsync_common::{DecodeError, DecoderConfig, PipelineError, VideoCodec};
use nvsync_decoder::nvdec::{NvcuvidLibrary, NvdecEngine, SessionOptions};
use nvsync_decoder::{DecodeEngine, OutputBuffer, OutputFormat, PendingFrame, VideoDecoder, VideoPipeline};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct CollectingPipeline {
    pending: Vec<PendingFrame>,
    finished: Vec<PendingFrame>,
    format: Option<(OutputFormat, u32)>,
}

impl VideoPipeline for CollectingPipeline {
    fn set_output_format(&mut self, format: &OutputFormat) -> Result<u32, PipelineError> {
        let stride = format.default_stride();
        self.format = Some((*format, stride));
        Ok(stride)
    }

    fn allocate_output_frame(&mut self, _: &PendingFrame) -> Result<OutputBuffer, PipelineError> {
        let (format, stride) = self
            .format
            .ok_or_else(|| PipelineError::Allocation("no format".into()))?;
        Ok(OutputBuffer::with_size(format.nv12_size(stride)))
    }

    fn finish_frame(&mut self, frame: PendingFrame) -> Result<(), PipelineError> {
        self.pending.retain(|f| !f.ptr_eq(&frame));
        self.finished.push(frame);
        Ok(())
    }

    fn release_frame(&mut self, frame: &PendingFrame) {
        self.pending.retain(|f| !f.ptr_eq(frame));
    }

    fn pending_frames(&self) -> Vec<PendingFrame> {
        self.pending.clone()
    }

    fn set_latency(&mut self, _: Duration, _: Duration) {}
}

#[test]
#[ignore = "requires an NVIDIA GPU and driver"]
fn library_loads() {
    init_tracing();
    let lib = NvcuvidLibrary::load();
    assert!(lib.is_ok(), "nvcuvid should load: {:?}", lib.err());
}

#[test]
#[ignore = "requires an NVIDIA GPU and driver"]
fn configure_h264_creates_parser() {
    init_tracing();
    let mut decoder = NvdecEngine::start_decoder(DecoderConfig::new(VideoCodec::H264), None)
        .expect("H.264 4:2:0 8-bit is supported on every NVDEC generation");
    assert_eq!(decoder.engine().codec(), Some(VideoCodec::H264));
    assert!(!decoder.engine().has_decoder());
    decoder.stop();
    assert!(!decoder.engine().session().is_open());
}

#[test]
#[ignore = "requires an NVIDIA GPU and driver"]
fn garbage_bitstream_produces_no_frames() {
    init_tracing();
    let lib = Arc::new(NvcuvidLibrary::load().expect("load nvcuvid"));
    let mut decoder = VideoDecoder::start(|events| NvdecEngine::new(lib, SessionOptions::default(), events))
        .expect("start");
    decoder
        .set_format(DecoderConfig::new(VideoCodec::H264))
        .expect("set_format");

    let mut pipeline = CollectingPipeline::default();
    let frame = PendingFrame::new(1, 0, Some(Duration::from_millis(33)));
    pipeline.pending.push(frame.clone());

    let pass = decoder
        .handle_frame(&mut pipeline, &frame, &[0xde, 0xad, 0xbe, 0xef], false)
        .expect("pass");
    assert_eq!(pass.finished, 0);
    assert!(pipeline.finished.is_empty());
    assert!(frame.is_awaiting_decode());
}

#[test]
#[ignore = "requires an NVIDIA GPU and driver"]
fn submit_after_stop_is_rejected() {
    init_tracing();
    let mut decoder =
        NvdecEngine::start_decoder(DecoderConfig::new(VideoCodec::H265), None).expect("start");
    decoder.stop();

    let mut pipeline = CollectingPipeline::default();
    let frame = PendingFrame::new(1, 0, None);
    let err = decoder
        .handle_frame(&mut pipeline, &frame, &[0, 0, 1], false)
        .unwrap_err();
    assert!(matches!(err, DecodeError::SessionClosed));
}

#[test]
#[ignore = "requires an NVIDIA GPU and driver"]
fn set_format_rejects_another_device() {
    init_tracing();
    let mut decoder = NvdecEngine::start_decoder(DecoderConfig::new(VideoCodec::H264), None).expect("start");
    let err = decoder
        .set_format(DecoderConfig {
            device_ordinal: 7,
            ..DecoderConfig::new(VideoCodec::H264)
        })
        .unwrap_err();
    assert!(matches!(err, DecodeError::InvalidConfig(_)));
}
