//! NVDEC implementation of [`DecodeEngine`].
//!
//! The CUVID parser reports sequences, pictures to decode and pictures to
//! display through C callbacks, invoked from inside `cuvidParseVideoData`.
//! The callbacks do only what cannot wait: the sequence callback
//! (re)creates the decoder instance and the decode callback kicks off
//! hardware decoding, both under the context lock. Every notification is
//! then pushed onto the event queue and reconciled later on the pipeline
//! thread.

use std::ffi::{c_int, c_ulong, c_void};
use std::ptr;
use std::sync::Arc;

use cudarc::driver::sys;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use nvsync_common::{ChromaFormat, DecodeError, DecodeResult, DecoderConfig, Rational, VideoCodec};

use super::ffi::{
    check_cuvid_result, creation_flags, packet_flags, CUdeviceptr, CUresult, CUvideodecoder, CUvideoparser, CuVideoFormat,
    CudaVideoChromaFormat, CudaVideoCodec, CudaVideoSurfaceFormat, CuvidDecodeCaps, CuvidDecodeCreateInfo,
    CuvidParserDispInfo, CuvidParserParams, CuvidPicParams, CuvidProcParams, CuvidSourceDataPacket, NvcuvidLibrary,
    ShortRect, CUDA_SUCCESS,
};
use super::session::{ContextLock, CurrentContext, ExternalSession, HardwareSession};
use crate::decoder::VideoDecoder;
use crate::engine::{BitstreamPacket, DecodeEngine, PlaneCopy};
use crate::event::{DecodeEvent, DisplayInfo, PictureDecoded, SequenceInfo};
use crate::queue::EventSender;
use crate::sequence::needs_new_decoder;

/// A [`VideoDecoder`] driving NVDEC.
pub type NvDecoder = VideoDecoder<NvdecEngine>;

// ---------------------------------------------------------------------------
// Decoder instance parameters
// ---------------------------------------------------------------------------

/// Settings applied whenever the sequence callback creates a decoder.
#[derive(Clone, Debug)]
struct InstanceSettings {
    num_decode_surfaces: u32,
    num_output_surfaces: u32,
    creation_flags: u32,
    deinterlace: nvsync_common::DeinterlaceMode,
}

impl From<&DecoderConfig> for InstanceSettings {
    fn from(config: &DecoderConfig) -> Self {
        Self {
            num_decode_surfaces: config.num_decode_surfaces(),
            num_output_surfaces: config.num_output_surfaces.max(1),
            creation_flags: creation_flags(config.create_flags),
            deinterlace: config.deinterlace,
        }
    }
}

fn clamp_i16(v: i32) -> i16 {
    v.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

fn create_info(
    fmt: &CuVideoFormat,
    width: u32,
    height: u32,
    settings: &InstanceSettings,
    lock: &ContextLock,
) -> CuvidDecodeCreateInfo {
    CuvidDecodeCreateInfo {
        width: width as c_ulong,
        height: height as c_ulong,
        num_decode_surfaces: settings.num_decode_surfaces as c_ulong,
        codec_type: fmt.codec,
        chroma_format: fmt.chroma_format,
        creation_flags: settings.creation_flags as c_ulong,
        display_area: ShortRect {
            left: clamp_i16(fmt.display_area_left),
            top: clamp_i16(fmt.display_area_top),
            right: clamp_i16(fmt.display_area_right),
            bottom: clamp_i16(fmt.display_area_bottom),
        },
        output_format: CudaVideoSurfaceFormat::Nv12,
        deinterlace_mode: settings.deinterlace.into(),
        target_width: width as c_ulong,
        target_height: height as c_ulong,
        num_output_surfaces: settings.num_output_surfaces as c_ulong,
        vid_lock: lock.raw(),
        target_rect: ShortRect {
            left: 0,
            top: 0,
            right: clamp_i16(width as i32),
            bottom: clamp_i16(height as i32),
        },
        ..CuvidDecodeCreateInfo::default()
    }
}

fn sequence_info(fmt: &CuVideoFormat) -> SequenceInfo {
    let (width, height) = SequenceInfo::display_size(
        fmt.display_area_left,
        fmt.display_area_top,
        fmt.display_area_right,
        fmt.display_area_bottom,
        fmt.coded_width,
        fmt.coded_height,
    );
    SequenceInfo {
        width,
        height,
        coded_width: fmt.coded_width,
        coded_height: fmt.coded_height,
        frame_rate: Rational::new(fmt.frame_rate_num, fmt.frame_rate_den),
        chroma_format: ChromaFormat::from(fmt.chroma_format),
        bit_depth: u32::from(fmt.bit_depth_luma_minus8) + 8,
        progressive: fmt.progressive_sequence != 0,
    }
}

// ---------------------------------------------------------------------------
// Shared state for parser callbacks
// ---------------------------------------------------------------------------

/// State reachable from the parser callbacks through `user_data`.
struct CallbackState {
    lib: Arc<NvcuvidLibrary>,
    lock: ContextLock,
    context: CurrentContext,
    events: EventSender,
    /// Created by the sequence callback.
    decoder: CUvideodecoder,
    /// Size the current decoder was created for.
    decoder_size: Option<(u32, u32)>,
    settings: InstanceSettings,
}

// SAFETY: The decoder handle is only touched under the state mutex and
// the context lock.
unsafe impl Send for CallbackState {}

/// Destroy `*handle` at most once. The handle is cleared before the call,
/// so a handle whose destroy fails is leaked and never retried.
fn release_once<F>(handle: &mut *mut c_void, call: &'static str, destroy: F) -> DecodeResult<()>
where
    F: FnOnce(*mut c_void) -> CUresult,
{
    if handle.is_null() {
        return Ok(());
    }
    let raw = std::mem::replace(handle, ptr::null_mut());
    check_cuvid_result(destroy(raw), call)
}

impl CallbackState {
    /// Destroy the decoder instance. The caller holds the context lock.
    fn destroy_decoder(&mut self) -> DecodeResult<()> {
        self.decoder_size = None;
        let lib = &self.lib;
        release_once(&mut self.decoder, "cuvidDestroyDecoder", |decoder| {
            debug!("Destroying decoder");
            // SAFETY: decoder came from cuvidCreateDecoder and no surface is
            // mapped outside copy_planes.
            unsafe { (lib.cuvidDestroyDecoder)(decoder) }
        })
    }

    fn recreate_decoder(&mut self, fmt: &CuVideoFormat, width: u32, height: u32) -> DecodeResult<()> {
        let lock = self.lock.clone();
        let _guard = lock.acquire()?;
        self.destroy_decoder()?;

        let mut info = create_info(fmt, width, height, &self.settings, &lock);
        let _pushed = self.context.push()?;
        let mut decoder: CUvideodecoder = ptr::null_mut();
        // SAFETY: info is fully initialised; the driver writes the handle.
        let result = unsafe { (self.lib.cuvidCreateDecoder)(&mut decoder, &mut info) };
        check_cuvid_result(result, "cuvidCreateDecoder")?;
        self.decoder = decoder;
        self.decoder_size = Some((width, height));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Parser callbacks (extern "C")
// ---------------------------------------------------------------------------

/// # Safety
///
/// `user_data` must point to the engine's `Mutex<CallbackState>`, which
/// outlives the parser. `format` is valid for the duration of the call.
unsafe extern "C" fn sequence_callback(user_data: *mut c_void, format: *mut CuVideoFormat) -> c_int {
    // SAFETY: See function contract.
    let state = &*(user_data as *const Mutex<CallbackState>);
    let mut state = state.lock();
    // SAFETY: The parser passes a valid format.
    let fmt = &*format;

    let seq = sequence_info(fmt);
    info!(
        codec = ?fmt.codec,
        width = seq.width,
        height = seq.height,
        chroma = %seq.chroma_format,
        bit_depth = seq.bit_depth,
        framerate = %seq.frame_rate,
        "NVDEC sequence callback: new sequence detected"
    );

    let mut ok = true;
    if state.decoder.is_null() || needs_new_decoder(state.decoder_size, seq.width, seq.height) {
        match state.recreate_decoder(fmt, seq.width, seq.height) {
            Ok(()) => info!(
                width = seq.width,
                height = seq.height,
                surfaces = state.settings.num_decode_surfaces,
                "NVDEC decoder created"
            ),
            Err(e) => {
                error!(error = %e, "Failed to create decoder");
                ok = false;
            }
        }
    }

    state.events.push(DecodeEvent::Sequence(seq));

    if ok {
        state.settings.num_decode_surfaces as c_int
    } else {
        0
    }
}

/// # Safety
///
/// As for [`sequence_callback`]; `pic_params` is valid for the call.
unsafe extern "C" fn decode_picture_callback(user_data: *mut c_void, pic_params: *mut CuvidPicParams) -> c_int {
    // SAFETY: See function contract.
    let state = &*(user_data as *const Mutex<CallbackState>);
    let state = state.lock();
    // SAFETY: The parser passes valid picture parameters.
    let params = &*pic_params;
    trace!(pic_idx = params.curr_pic_idx, "Decode callback");

    if state.decoder.is_null() {
        warn!(pic_idx = params.curr_pic_idx, "Decode callback without a decoder");
    } else {
        match state.lock.acquire() {
            Ok(_guard) => {
                // SAFETY: decoder is live and the context lock is held.
                let result = (state.lib.cuvidDecodePicture)(state.decoder, pic_params);
                if result != CUDA_SUCCESS {
                    warn!(error_code = result, pic_idx = params.curr_pic_idx, "Failed to decode picture");
                }
            }
            Err(e) => warn!(error = %e, "Failed to lock CUDA context"),
        }
    }

    state.events.push(DecodeEvent::Decode(PictureDecoded {
        picture_index: params.curr_pic_idx,
        is_sync_point: params.intra_pic_flag != 0,
    }));
    1
}

/// # Safety
///
/// As for [`sequence_callback`]; `disp_info` is null at end of stream.
unsafe extern "C" fn display_picture_callback(
    user_data: *mut c_void,
    disp_info: *mut CuvidParserDispInfo,
) -> c_int {
    if disp_info.is_null() {
        debug!("Display callback: end of stream");
        return 1;
    }
    // SAFETY: See function contract.
    let state = &*(user_data as *const Mutex<CallbackState>);
    let state = state.lock();
    // SAFETY: Non-null display info from the parser.
    let info = &*disp_info;
    trace!(pic_idx = info.picture_index, pts = info.timestamp, "Display callback");

    state.events.push(DecodeEvent::Display(DisplayInfo {
        picture_index: info.picture_index,
        timestamp: info.timestamp,
        progressive: info.progressive_frame != 0,
        top_field_first: info.top_field_first != 0,
        repeat_first_field: info.repeat_first_field,
    }));
    1
}

// ---------------------------------------------------------------------------
// Mapped surface (RAII)
// ---------------------------------------------------------------------------

/// A decoded surface mapped for copying; unmapped on drop.
struct MappedSurface<'a> {
    lib: &'a NvcuvidLibrary,
    decoder: CUvideodecoder,
    device_ptr: CUdeviceptr,
    pitch: u32,
}

impl Drop for MappedSurface<'_> {
    fn drop(&mut self) {
        // SAFETY: device_ptr came from cuvidMapVideoFrame64 on decoder.
        let result = unsafe { (self.lib.cuvidUnmapVideoFrame64)(self.decoder, self.device_ptr) };
        if result != CUDA_SUCCESS {
            warn!(
                error_code = result,
                dev_ptr = format_args!("0x{:x}", self.device_ptr),
                "Failed to unmap video frame"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// NvdecEngine
// ---------------------------------------------------------------------------

/// How the device context and lock are obtained.
#[derive(Copy, Clone, Debug, Default)]
pub struct SessionOptions {
    pub device_ordinal: u32,
    pub external: Option<ExternalSession>,
}

impl From<&DecoderConfig> for SessionOptions {
    fn from(config: &DecoderConfig) -> Self {
        Self {
            device_ordinal: config.device_ordinal,
            external: None,
        }
    }
}

/// A configuration may not move an owned session to another device.
fn check_device(session_device: Option<u32>, config: &DecoderConfig) -> DecodeResult<()> {
    match session_device {
        Some(device) if device != config.device_ordinal => Err(DecodeError::InvalidConfig(format!(
            "device_ordinal {} does not match the open session on device {device}",
            config.device_ordinal
        ))),
        _ => Ok(()),
    }
}

/// NVDEC parser, decoder instance and device session.
pub struct NvdecEngine {
    lib: Arc<NvcuvidLibrary>,
    session: HardwareSession,
    parser: CUvideoparser,
    /// Boxed so the pointer handed to the parser stays stable.
    callback_state: Box<Mutex<CallbackState>>,
    codec: Option<VideoCodec>,
    /// Device of an owned session; `None` for an injected context.
    device_ordinal: Option<u32>,
    /// Set once teardown has run, successfully or not.
    closed: bool,
}

// SAFETY: The parser handle is used only from the thread driving the
// engine; callback state is behind a mutex.
unsafe impl Send for NvdecEngine {}

impl std::fmt::Debug for NvdecEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.callback_state.lock();
        f.debug_struct("NvdecEngine")
            .field("codec", &self.codec)
            .field("parser", &!self.parser.is_null())
            .field("decoder", &!state.decoder.is_null())
            .field("decoder_size", &state.decoder_size)
            .field("session", &self.session)
            .field("closed", &self.closed)
            .finish()
    }
}

impl NvdecEngine {
    /// Open the device session. No parser exists until `configure`.
    pub fn new(lib: Arc<NvcuvidLibrary>, options: SessionOptions, events: EventSender) -> DecodeResult<Self> {
        let session = HardwareSession::open(lib.clone(), options.device_ordinal, options.external)?;
        let callback_state = Box::new(Mutex::new(CallbackState {
            lib: lib.clone(),
            lock: session.context_lock()?,
            context: session.current_context()?,
            events,
            decoder: ptr::null_mut(),
            decoder_size: None,
            settings: InstanceSettings::from(&DecoderConfig::default()),
        }));
        Ok(Self {
            lib,
            session,
            parser: ptr::null_mut(),
            callback_state,
            codec: None,
            device_ordinal: options.external.is_none().then_some(options.device_ordinal),
            closed: false,
        })
    }

    /// Load nvcuvid, open a session on the configured device (or on
    /// `external`) and apply `config`.
    pub fn start_decoder(config: DecoderConfig, external: Option<ExternalSession>) -> DecodeResult<NvDecoder> {
        let lib = Arc::new(NvcuvidLibrary::load()?);
        let options = SessionOptions {
            external,
            ..SessionOptions::from(&config)
        };
        let mut decoder = VideoDecoder::start(|events| Self::new(lib, options, events))?;
        decoder.set_format(config)?;
        Ok(decoder)
    }

    pub fn codec(&self) -> Option<VideoCodec> {
        self.codec
    }

    pub fn session(&self) -> &HardwareSession {
        &self.session
    }

    fn query_caps(&self, codec: CudaVideoCodec, config: &DecoderConfig) -> DecodeResult<()> {
        let mut caps = CuvidDecodeCaps::query(codec, CudaVideoChromaFormat::Yuv420, 8);
        {
            let _pushed = self.session.current_context()?.push()?;
            // SAFETY: caps is initialised; the context is current.
            let result = unsafe { (self.lib.cuvidGetDecoderCaps)(&mut caps) };
            check_cuvid_result(result, "cuvidGetDecoderCaps")?;
        }
        if caps.is_supported == 0 {
            error!(
                codec = config.codec.display_name(),
                chroma = %ChromaFormat::Yuv420,
                "Format not supported"
            );
            return Err(DecodeError::UnsupportedFormat {
                codec: config.codec,
                chroma: ChromaFormat::Yuv420,
                bit_depth: 8,
            });
        }
        debug!(
            codec = config.codec.display_name(),
            max_width = caps.max_width,
            max_height = caps.max_height,
            "Format is supported"
        );
        Ok(())
    }

    /// Destroy the decoder (under the context lock), then the parser. The
    /// parser is destroyed even when the decoder destroy fails; the first
    /// error is returned.
    fn destroy_decoder_and_parser(&mut self) -> DecodeResult<()> {
        let decoder_result = {
            // Same order as the sequence callback: state, then context lock.
            let mut state = self.callback_state.lock();
            if state.decoder.is_null() {
                Ok(())
            } else {
                let lock = state.lock.clone();
                let result = match lock.acquire() {
                    Ok(_guard) => state.destroy_decoder(),
                    Err(e) => Err(e),
                };
                result
            }
        };

        let lib = &self.lib;
        let parser_result = release_once(&mut self.parser, "cuvidDestroyVideoParser", |parser| {
            debug!("Destroying parser");
            // SAFETY: parser came from cuvidCreateVideoParser; no parse is
            // in progress.
            unsafe { (lib.cuvidDestroyVideoParser)(parser) }
        });

        decoder_result.and(parser_result)
    }
}

impl DecodeEngine for NvdecEngine {
    fn configure(&mut self, config: &DecoderConfig) -> DecodeResult<()> {
        if self.closed {
            return Err(DecodeError::SessionClosed);
        }
        check_device(self.device_ordinal, config)?;
        self.destroy_decoder_and_parser()?;

        let codec = CudaVideoCodec::from_common(config.codec);
        self.query_caps(codec, config)?;

        let settings = InstanceSettings::from(config);
        let surfaces = settings.num_decode_surfaces;
        self.callback_state.lock().settings = settings;

        let state_ptr: *const Mutex<CallbackState> = &*self.callback_state;
        let mut params = CuvidParserParams {
            codec_type: codec,
            max_num_decode_surfaces: surfaces,
            clock_rate: config.clock_rate,
            error_threshold: config.error_threshold.min(100),
            max_display_delay: config.max_display_delay,
            user_data: state_ptr as *mut c_void,
            pfn_sequence_callback: Some(sequence_callback),
            pfn_decode_picture: Some(decode_picture_callback),
            pfn_display_picture: Some(display_picture_callback),
            ..CuvidParserParams::default()
        };

        let mut parser: CUvideoparser = ptr::null_mut();
        // SAFETY: params is initialised and user_data points into a Box
        // owned by self, which outlives the parser.
        let result = unsafe { (self.lib.cuvidCreateVideoParser)(&mut parser, &mut params) };
        check_cuvid_result(result, "cuvidCreateVideoParser")?;
        self.parser = parser;
        self.codec = Some(config.codec);

        info!(
            codec = config.codec.display_name(),
            surfaces,
            error_threshold = config.error_threshold,
            delay = config.max_display_delay,
            "NVDEC parser created"
        );
        Ok(())
    }

    fn submit(&mut self, packet: &BitstreamPacket<'_>) -> DecodeResult<()> {
        if self.parser.is_null() {
            return Err(DecodeError::SessionClosed);
        }
        let mut flags = packet_flags::CUVID_PKT_TIMESTAMP;
        if packet.discontinuity {
            debug!("Adding discontinuity");
            flags |= packet_flags::CUVID_PKT_DISCONTINUITY;
        }
        let mut raw = CuvidSourceDataPacket {
            flags,
            payload_size: packet.data.len() as c_ulong,
            payload: packet.data.as_ptr(),
            timestamp: packet.timestamp,
        };

        // SAFETY: parser is live; the payload outlives this synchronous
        // call. Callbacks lock the callback state themselves, so it must
        // not be held here.
        let result = unsafe { (self.lib.cuvidParseVideoData)(self.parser, &mut raw) };
        check_cuvid_result(result, "cuvidParseVideoData")
    }

    fn has_decoder(&self) -> bool {
        !self.callback_state.lock().decoder.is_null()
    }

    fn copy_planes(&mut self, picture: &DisplayInfo, planes: &[PlaneCopy], dst: &mut [u8]) -> DecodeResult<()> {
        if let Some(plane) = planes.iter().find(|p| p.dst_end() > dst.len()) {
            return Err(DecodeError::OutputBufferTooSmall {
                needed: plane.dst_end(),
                got: dst.len(),
            });
        }

        let decoder = self.callback_state.lock().decoder;
        if self.closed || decoder.is_null() {
            return Err(DecodeError::DecoderNotReady);
        }

        let lock = self.session.context_lock()?;
        let _guard = lock.acquire()?;

        let mut proc_params = CuvidProcParams {
            progressive_frame: c_int::from(picture.progressive),
            top_field_first: c_int::from(picture.top_field_first),
            unpaired_field: c_int::from(picture.repeat_first_field == -1),
            output_stream: self.session.stream(),
            ..CuvidProcParams::default()
        };
        let mut device_ptr: CUdeviceptr = 0;
        let mut pitch: u32 = 0;
        // SAFETY: decoder is live, the lock is held and the out-params are
        // valid for writes.
        let result = unsafe {
            (self.lib.cuvidMapVideoFrame64)(
                decoder,
                picture.picture_index,
                &mut device_ptr,
                &mut pitch,
                &mut proc_params,
            )
        };
        check_cuvid_result(result, "cuvidMapVideoFrame64")?;
        let surface = MappedSurface {
            lib: &self.lib,
            decoder,
            device_ptr,
            pitch,
        };

        let _pushed = self.session.current_context()?.push()?;
        let stream = self.session.stream() as sys::CUstream;
        for plane in planes {
            let copy = sys::CUDA_MEMCPY2D {
                srcXInBytes: 0,
                srcY: 0,
                srcMemoryType: sys::CUmemorytype::CU_MEMORYTYPE_DEVICE,
                srcHost: ptr::null(),
                srcDevice: surface.device_ptr + (plane.src_row as u64) * u64::from(surface.pitch),
                srcArray: ptr::null_mut(),
                srcPitch: surface.pitch as usize,
                dstXInBytes: 0,
                dstY: 0,
                dstMemoryType: sys::CUmemorytype::CU_MEMORYTYPE_HOST,
                dstHost: dst[plane.dst_offset..].as_mut_ptr() as *mut c_void,
                dstDevice: 0,
                dstArray: ptr::null_mut(),
                dstPitch: plane.dst_stride,
                WidthInBytes: plane.width_bytes,
                Height: plane.rows,
            };
            // SAFETY: The source lies inside the mapped surface and the
            // destination range was bounds-checked above; the host buffer
            // stays borrowed until the stream is synchronised below.
            unsafe { sys::cuMemcpy2DAsync_v2(&copy, stream) }
                .result()
                .map_err(|e| DecodeError::HardwareCallFailed {
                    call: "cuMemcpy2DAsync",
                    code: e.0 as i32,
                })?;
        }
        self.session.synchronize()?;

        trace!(
            pic_idx = picture.picture_index,
            pitch = surface.pitch,
            planes = planes.len(),
            "Copied decoded picture"
        );
        Ok(())
    }

    /// Runs once. If the decoder or parser cannot be destroyed, the
    /// session's lock, stream and context are leaked instead of destroyed
    /// underneath them.
    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.codec = None;

        match self.destroy_decoder_and_parser() {
            Ok(()) => {
                self.session.close();
                info!("NVDEC engine closed");
            }
            Err(e) => {
                error!(error = %e, "Failed to destroy decoder and parser, leaking CUDA session");
                self.session.leak();
            }
        }
    }
}

impl Drop for NvdecEngine {
    fn drop(&mut self) {
        self.close();
    }
}
