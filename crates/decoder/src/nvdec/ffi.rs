//! Raw FFI bindings for NVIDIA's CUVID (nvcuvid) library.
//!
//! The library is loaded dynamically at runtime via `libloading`. Struct
//! layouts follow `cuviddec.h` and `nvcuvid.h` from the Video Codec SDK;
//! `unsigned long` fields are `c_ulong` so the layouts hold on both LP64
//! and LLP64 targets.

use std::ffi::{c_int, c_uint, c_ulong, c_void};
use std::path::Path;

use libloading::Library;
use nvsync_common::{ChromaFormat, CreateFlags, DecodeError, DecodeResult, DeinterlaceMode, VideoCodec};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// CUDA context handle (opaque pointer).
pub type CUcontext = *mut c_void;

/// CUDA stream handle (opaque pointer).
pub type CUstream = *mut c_void;

/// CUDA device pointer (GPU virtual address).
pub type CUdeviceptr = u64;

/// Driver API result code; 0 is success.
pub type CUresult = i32;

pub const CUDA_SUCCESS: CUresult = 0;

/// Opaque NVDEC decoder handle.
pub type CUvideodecoder = *mut c_void;

/// Opaque CUVID video parser handle.
pub type CUvideoparser = *mut c_void;

/// Context lock shared between the decoder instance and its callers.
pub type CUvideoctxlock = *mut c_void;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// `cudaVideoCodec`.
#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CudaVideoCodec {
    Mpeg1 = 0,
    Mpeg2 = 1,
    Mpeg4 = 2,
    Vc1 = 3,
    H264 = 4,
    Jpeg = 5,
    H264Svc = 6,
    H264Mvc = 7,
    Hevc = 8,
    Vp8 = 9,
    Vp9 = 10,
    Av1 = 11,
}

impl CudaVideoCodec {
    pub fn from_common(codec: VideoCodec) -> Self {
        match codec {
            VideoCodec::H264 => Self::H264,
            VideoCodec::H265 => Self::Hevc,
            VideoCodec::Mpeg1 => Self::Mpeg1,
            VideoCodec::Mpeg2 => Self::Mpeg2,
            VideoCodec::Mpeg4 => Self::Mpeg4,
            VideoCodec::Jpeg => Self::Jpeg,
        }
    }
}

/// `cudaVideoSurfaceFormat`.
#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CudaVideoSurfaceFormat {
    Nv12 = 0,
    P016 = 1,
    Yuv444 = 2,
    Yuv444_16bit = 3,
}

/// `cudaVideoDeinterlaceMode`.
#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CudaVideoDeinterlaceMode {
    Weave = 0,
    Bob = 1,
    Adaptive = 2,
}

impl From<DeinterlaceMode> for CudaVideoDeinterlaceMode {
    fn from(mode: DeinterlaceMode) -> Self {
        match mode {
            DeinterlaceMode::Weave => Self::Weave,
            DeinterlaceMode::Bob => Self::Bob,
            DeinterlaceMode::Adaptive => Self::Adaptive,
        }
    }
}

/// `cudaVideoChromaFormat`.
#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CudaVideoChromaFormat {
    Monochrome = 0,
    Yuv420 = 1,
    Yuv422 = 2,
    Yuv444 = 3,
}

impl From<CudaVideoChromaFormat> for ChromaFormat {
    fn from(format: CudaVideoChromaFormat) -> Self {
        match format {
            CudaVideoChromaFormat::Monochrome => Self::Monochrome,
            CudaVideoChromaFormat::Yuv420 => Self::Yuv420,
            CudaVideoChromaFormat::Yuv422 => Self::Yuv422,
            CudaVideoChromaFormat::Yuv444 => Self::Yuv444,
        }
    }
}

/// `cudaVideoCreateFlags` values for `ulCreationFlags`.
pub mod create_flags {
    pub const DEFAULT: u32 = 0x00;
    pub const PREFER_CUDA: u32 = 0x01;
    pub const PREFER_DXVA: u32 = 0x02;
    pub const PREFER_CUVID: u32 = 0x04;
}

pub fn creation_flags(flags: CreateFlags) -> u32 {
    match flags {
        CreateFlags::Default => create_flags::DEFAULT,
        CreateFlags::PreferCuda => create_flags::PREFER_CUDA,
        CreateFlags::PreferDxva => create_flags::PREFER_DXVA,
        CreateFlags::PreferCuvid => create_flags::PREFER_CUVID,
    }
}

// ---------------------------------------------------------------------------
// CUVIDDECODECAPS
// ---------------------------------------------------------------------------

/// Capability query for one (codec, chroma, bit depth) combination.
#[repr(C)]
#[derive(Clone, Debug)]
pub struct CuvidDecodeCaps {
    pub codec_type: CudaVideoCodec,
    pub chroma_format: CudaVideoChromaFormat,
    pub bit_depth_minus8: c_uint,
    pub reserved1: [c_uint; 3],
    /// Set by the driver.
    pub is_supported: u8,
    pub num_nvdecs: u8,
    pub output_format_mask: u16,
    pub max_width: c_uint,
    pub max_height: c_uint,
    pub max_mb_count: c_uint,
    pub min_width: u16,
    pub min_height: u16,
    pub is_histogram_supported: u8,
    pub counter_bit_depth: u8,
    pub max_histogram_bins: u16,
    pub reserved3: [c_uint; 10],
}

impl CuvidDecodeCaps {
    pub fn query(codec: CudaVideoCodec, chroma: CudaVideoChromaFormat, bit_depth: u32) -> Self {
        Self {
            codec_type: codec,
            chroma_format: chroma,
            bit_depth_minus8: bit_depth.saturating_sub(8),
            reserved1: [0; 3],
            is_supported: 0,
            num_nvdecs: 0,
            output_format_mask: 0,
            max_width: 0,
            max_height: 0,
            max_mb_count: 0,
            min_width: 0,
            min_height: 0,
            is_histogram_supported: 0,
            counter_bit_depth: 0,
            max_histogram_bins: 0,
            reserved3: [0; 10],
        }
    }
}

// ---------------------------------------------------------------------------
// CUVIDDECODECREATEINFO
// ---------------------------------------------------------------------------

/// Short rectangle used by `CUVIDDECODECREATEINFO`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ShortRect {
    pub left: i16,
    pub top: i16,
    pub right: i16,
    pub bottom: i16,
}

/// Decoder instance parameters. Matches `CUVIDDECODECREATEINFO`.
#[repr(C)]
#[derive(Clone)]
pub struct CuvidDecodeCreateInfo {
    pub width: c_ulong,
    pub height: c_ulong,
    pub num_decode_surfaces: c_ulong,
    pub codec_type: CudaVideoCodec,
    pub chroma_format: CudaVideoChromaFormat,
    pub creation_flags: c_ulong,
    pub bit_depth_minus8: c_ulong,
    pub intra_decode_only: c_ulong,
    pub max_width: c_ulong,
    pub max_height: c_ulong,
    pub reserved1: c_ulong,
    pub display_area: ShortRect,
    pub output_format: CudaVideoSurfaceFormat,
    pub deinterlace_mode: CudaVideoDeinterlaceMode,
    pub target_width: c_ulong,
    pub target_height: c_ulong,
    pub num_output_surfaces: c_ulong,
    pub vid_lock: CUvideoctxlock,
    pub target_rect: ShortRect,
    pub enable_histogram: c_ulong,
    pub reserved2: [c_ulong; 4],
}

// SAFETY: Plain data; vid_lock is only read by the driver.
unsafe impl Send for CuvidDecodeCreateInfo {}

impl Default for CuvidDecodeCreateInfo {
    fn default() -> Self {
        // SAFETY: All-zeros is valid: enums have a zero discriminant and
        // the lock pointer becomes null.
        unsafe { std::mem::zeroed() }
    }
}

// ---------------------------------------------------------------------------
// CUVIDPICPARAMS
// ---------------------------------------------------------------------------

/// Picture parameters handed to the decode callback. Only the common
/// header is named; the codec-specific union is kept opaque.
#[repr(C)]
pub struct CuvidPicParams {
    pub pic_width_in_mbs: c_int,
    pub frame_height_in_mbs: c_int,
    pub curr_pic_idx: c_int,
    pub field_pic_flag: c_int,
    pub bottom_field_flag: c_int,
    pub second_field: c_int,
    pub bitstream_data_len: c_uint,
    pub bitstream_data: *const u8,
    pub num_slices: c_uint,
    pub slice_data_offsets: *const c_uint,
    pub ref_pic_flag: c_int,
    pub intra_pic_flag: c_int,
    pub reserved: [c_uint; 30],
    pub codec_specific: [c_uint; 1024],
}

// ---------------------------------------------------------------------------
// CUVIDPROCPARAMS
// ---------------------------------------------------------------------------

/// Surface mapping parameters. Matches `CUVIDPROCPARAMS`.
#[repr(C)]
pub struct CuvidProcParams {
    pub progressive_frame: c_int,
    pub second_field: c_int,
    pub top_field_first: c_int,
    pub unpaired_field: c_int,
    pub reserved_flags: c_uint,
    pub reserved_zero: c_uint,
    pub raw_input_dptr: u64,
    pub raw_input_pitch: c_uint,
    pub raw_input_format: c_uint,
    pub raw_output_dptr: u64,
    pub raw_output_pitch: c_uint,
    pub reserved1: c_uint,
    /// Stream the post-processing runs on.
    pub output_stream: CUstream,
    pub reserved: [c_uint; 46],
    pub histogram_dptr: *mut u64,
    pub reserved2: [*mut c_void; 1],
}

impl Default for CuvidProcParams {
    fn default() -> Self {
        // SAFETY: All-zeros is valid; pointers become null.
        unsafe { std::mem::zeroed() }
    }
}

// ---------------------------------------------------------------------------
// CUVIDEOFORMAT
// ---------------------------------------------------------------------------

/// Video format passed to the sequence callback. Matches `CUVIDEOFORMAT`.
#[repr(C)]
#[derive(Clone, Debug)]
pub struct CuVideoFormat {
    pub codec: CudaVideoCodec,
    pub frame_rate_num: c_uint,
    pub frame_rate_den: c_uint,
    pub progressive_sequence: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub min_num_decode_surfaces: u8,
    pub coded_width: c_uint,
    pub coded_height: c_uint,
    pub display_area_left: c_int,
    pub display_area_top: c_int,
    pub display_area_right: c_int,
    pub display_area_bottom: c_int,
    pub chroma_format: CudaVideoChromaFormat,
    pub bitrate: c_uint,
    pub display_aspect_ratio_x: c_int,
    pub display_aspect_ratio_y: c_int,
    /// Packed video signal description bit fields.
    pub video_signal_description: [u8; 4],
    pub seqhdr_data_length: c_uint,
}

impl Default for CuVideoFormat {
    fn default() -> Self {
        // SAFETY: All-zeros is valid for this POD struct.
        unsafe { std::mem::zeroed() }
    }
}

// ---------------------------------------------------------------------------
// CUVIDPARSERDISPINFO
// ---------------------------------------------------------------------------

/// Display info from the display callback. Matches `CUVIDPARSERDISPINFO`.
#[repr(C)]
#[derive(Clone, Debug, Default)]
pub struct CuvidParserDispInfo {
    pub picture_index: c_int,
    pub progressive_frame: c_int,
    pub top_field_first: c_int,
    pub repeat_first_field: c_int,
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// Parser callbacks and CUVIDPARSERPARAMS
// ---------------------------------------------------------------------------

/// Returns 0 on failure, 1 on success, or >1 to override the parser's
/// decode surface count.
pub type PfnCuvidSequenceCallback =
    unsafe extern "C" fn(user_data: *mut c_void, format: *mut CuVideoFormat) -> c_int;

pub type PfnCuvidDecodePicture =
    unsafe extern "C" fn(user_data: *mut c_void, pic_params: *mut CuvidPicParams) -> c_int;

/// `disp_info` is null at end of stream.
pub type PfnCuvidDisplayPicture =
    unsafe extern "C" fn(user_data: *mut c_void, disp_info: *mut CuvidParserDispInfo) -> c_int;

pub type PfnCuvidOpaqueCallback = unsafe extern "C" fn(user_data: *mut c_void, info: *mut c_void) -> c_int;

/// Parser creation parameters. Matches `CUVIDPARSERPARAMS`.
#[repr(C)]
pub struct CuvidParserParams {
    pub codec_type: CudaVideoCodec,
    pub max_num_decode_surfaces: c_uint,
    pub clock_rate: c_uint,
    pub error_threshold: c_uint,
    pub max_display_delay: c_uint,
    /// `bAnnexb`/`uReserved` bit field word followed by `uReserved1[4]`.
    pub reserved1: [c_uint; 5],
    pub user_data: *mut c_void,
    pub pfn_sequence_callback: Option<PfnCuvidSequenceCallback>,
    pub pfn_decode_picture: Option<PfnCuvidDecodePicture>,
    pub pfn_display_picture: Option<PfnCuvidDisplayPicture>,
    pub pfn_get_operating_point: Option<PfnCuvidOpaqueCallback>,
    pub pfn_get_sei_msg: Option<PfnCuvidOpaqueCallback>,
    pub reserved2: [*mut c_void; 5],
    pub ext_video_info: *mut c_void,
}

impl Default for CuvidParserParams {
    fn default() -> Self {
        // SAFETY: All-zeros is valid: callbacks become None and raw
        // pointers become null.
        unsafe { std::mem::zeroed() }
    }
}

// ---------------------------------------------------------------------------
// CUVIDSOURCEDATAPACKET
// ---------------------------------------------------------------------------

/// Data packet fed to the parser. Matches `CUVIDSOURCEDATAPACKET`.
#[repr(C)]
pub struct CuvidSourceDataPacket {
    pub flags: c_ulong,
    pub payload_size: c_ulong,
    pub payload: *const u8,
    pub timestamp: i64,
}

/// Flags for `CuvidSourceDataPacket`.
pub mod packet_flags {
    use std::ffi::c_ulong;

    pub const CUVID_PKT_ENDOFSTREAM: c_ulong = 0x01;
    pub const CUVID_PKT_TIMESTAMP: c_ulong = 0x02;
    pub const CUVID_PKT_DISCONTINUITY: c_ulong = 0x04;
    pub const CUVID_PKT_ENDOFPICTURE: c_ulong = 0x08;
    pub const CUVID_PKT_NOTIFY_EOS: c_ulong = 0x10;
}

// ---------------------------------------------------------------------------
// Dynamic library wrapper
// ---------------------------------------------------------------------------

/// Dynamically loaded nvcuvid library with typed function pointers.
#[allow(non_snake_case)]
pub struct NvcuvidLibrary {
    /// Keeps the symbols below valid.
    _lib: Library,

    // -- Context lock --
    pub cuvidCtxLockCreate: unsafe extern "C" fn(lock: *mut CUvideoctxlock, ctx: CUcontext) -> CUresult,
    pub cuvidCtxLockDestroy: unsafe extern "C" fn(lock: CUvideoctxlock) -> CUresult,
    pub cuvidCtxLock: unsafe extern "C" fn(lock: CUvideoctxlock, flags: c_uint) -> CUresult,
    pub cuvidCtxUnlock: unsafe extern "C" fn(lock: CUvideoctxlock, flags: c_uint) -> CUresult,

    // -- Decoder --
    pub cuvidGetDecoderCaps: unsafe extern "C" fn(caps: *mut CuvidDecodeCaps) -> CUresult,
    pub cuvidCreateDecoder:
        unsafe extern "C" fn(decoder: *mut CUvideodecoder, params: *mut CuvidDecodeCreateInfo) -> CUresult,
    pub cuvidDestroyDecoder: unsafe extern "C" fn(decoder: CUvideodecoder) -> CUresult,
    pub cuvidDecodePicture: unsafe extern "C" fn(decoder: CUvideodecoder, params: *mut CuvidPicParams) -> CUresult,
    pub cuvidMapVideoFrame64: unsafe extern "C" fn(
        decoder: CUvideodecoder,
        pic_idx: c_int,
        dev_ptr: *mut CUdeviceptr,
        pitch: *mut c_uint,
        params: *mut CuvidProcParams,
    ) -> CUresult,
    pub cuvidUnmapVideoFrame64: unsafe extern "C" fn(decoder: CUvideodecoder, dev_ptr: CUdeviceptr) -> CUresult,

    // -- Parser --
    pub cuvidCreateVideoParser:
        unsafe extern "C" fn(parser: *mut CUvideoparser, params: *mut CuvidParserParams) -> CUresult,
    pub cuvidDestroyVideoParser: unsafe extern "C" fn(parser: CUvideoparser) -> CUresult,
    pub cuvidParseVideoData:
        unsafe extern "C" fn(parser: CUvideoparser, packet: *mut CuvidSourceDataPacket) -> CUresult,
}

// SAFETY: The function pointers refer to the driver library, which stays
// loaded for as long as `_lib` lives. Calls that need serialization go
// through the context lock.
unsafe impl Send for NvcuvidLibrary {}
unsafe impl Sync for NvcuvidLibrary {}

impl std::fmt::Debug for NvcuvidLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvcuvidLibrary").field("loaded", &true).finish()
    }
}

/// Copy one symbol out of `lib` as a plain function pointer.
///
/// # Safety
///
/// `T` must match the C signature of `name`.
unsafe fn symbol<T: Copy>(lib: &Library, name: &'static str) -> Result<T, NvcuvidLoadError> {
    let mut cname = Vec::with_capacity(name.len() + 1);
    cname.extend_from_slice(name.as_bytes());
    cname.push(0);
    lib.get::<T>(&cname)
        .map(|sym| *sym)
        .map_err(|e| NvcuvidLoadError::SymbolNotFound(format!("{name}: {e}")))
}

impl NvcuvidLibrary {
    /// Load nvcuvid from the default system search path.
    pub fn load() -> Result<Self, NvcuvidLoadError> {
        let lib_name = Self::library_name();
        info!(library = %lib_name, "Loading NVDEC library");

        // SAFETY: Loading the NVIDIA driver's video library; its
        // initialisers only register driver entry points.
        let lib = unsafe { Library::new(lib_name) }.map_err(|e| {
            NvcuvidLoadError::LibraryNotFound(format!(
                "Failed to load {lib_name}: {e}. Is the NVIDIA driver installed?"
            ))
        })?;
        Self::from_library(lib)
    }

    /// Load nvcuvid from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self, NvcuvidLoadError> {
        info!(path = %path.display(), "Loading NVDEC library from custom path");

        // SAFETY: The caller asserts `path` is an nvcuvid build.
        let lib = unsafe { Library::new(path) }.map_err(|e| {
            NvcuvidLoadError::LibraryNotFound(format!("Failed to load {}: {e}", path.display()))
        })?;
        Self::from_library(lib)
    }

    fn from_library(lib: Library) -> Result<Self, NvcuvidLoadError> {
        // SAFETY: Every signature below matches the Video Codec SDK headers.
        // The pointers are copied out of their `Symbol`s and stay valid
        // because `lib` is moved into the returned struct.
        unsafe {
            let loaded = Self {
                cuvidCtxLockCreate: symbol(&lib, "cuvidCtxLockCreate")?,
                cuvidCtxLockDestroy: symbol(&lib, "cuvidCtxLockDestroy")?,
                cuvidCtxLock: symbol(&lib, "cuvidCtxLock")?,
                cuvidCtxUnlock: symbol(&lib, "cuvidCtxUnlock")?,
                cuvidGetDecoderCaps: symbol(&lib, "cuvidGetDecoderCaps")?,
                cuvidCreateDecoder: symbol(&lib, "cuvidCreateDecoder")?,
                cuvidDestroyDecoder: symbol(&lib, "cuvidDestroyDecoder")?,
                cuvidDecodePicture: symbol(&lib, "cuvidDecodePicture")?,
                cuvidMapVideoFrame64: symbol(&lib, "cuvidMapVideoFrame64")?,
                cuvidUnmapVideoFrame64: symbol(&lib, "cuvidUnmapVideoFrame64")?,
                cuvidCreateVideoParser: symbol(&lib, "cuvidCreateVideoParser")?,
                cuvidDestroyVideoParser: symbol(&lib, "cuvidDestroyVideoParser")?,
                cuvidParseVideoData: symbol(&lib, "cuvidParseVideoData")?,
                _lib: lib,
            };
            debug!("All NVDEC symbols loaded");
            Ok(loaded)
        }
    }

    fn library_name() -> &'static str {
        if cfg!(target_os = "windows") {
            "nvcuvid.dll"
        } else if cfg!(target_os = "linux") {
            "libnvcuvid.so.1"
        } else {
            "libnvcuvid.so"
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur when loading the nvcuvid library.
#[derive(Debug, thiserror::Error)]
pub enum NvcuvidLoadError {
    #[error("NVDEC library not found: {0}")]
    LibraryNotFound(String),

    #[error("Required symbol not found: {0}")]
    SymbolNotFound(String),
}

impl From<NvcuvidLoadError> for DecodeError {
    fn from(e: NvcuvidLoadError) -> Self {
        DecodeError::LibraryUnavailable(e.to_string())
    }
}

/// Map a CUVID result code to `HardwareCallFailed` naming `call`.
pub fn check_cuvid_result(result: CUresult, call: &'static str) -> DecodeResult<()> {
    if result == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(DecodeError::HardwareCallFailed { call, code: result })
    }
}
