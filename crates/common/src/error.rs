//! Central error types for the decoder (thiserror-based).

use thiserror::Error;

use crate::codec::VideoCodec;
use crate::types::ChromaFormat;

/// Errors reported by the surrounding pipeline through the pipeline seam.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("downstream rejected the output format: {0}")]
    NotNegotiated(String),

    #[error("output frame allocation failed: {0}")]
    Allocation(String),

    #[error("downstream error: {0}")]
    Downstream(String),
}

/// Hardware decoder errors.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("{call} failed with error code {code}")]
    HardwareCallFailed { call: &'static str, code: i32 },

    #[error("output renegotiation failed: {0}")]
    RenegotiationFailed(String),

    #[error("display event references unknown frame number {frame_number}")]
    ProtocolViolation { frame_number: u32 },

    #[error("{codec} with {chroma} at {bit_depth}-bit is not supported by this GPU")]
    UnsupportedFormat {
        codec: VideoCodec,
        chroma: ChromaFormat,
        bit_depth: u32,
    },

    #[error("sequence reported but no decoder instance exists")]
    DecoderNotReady,

    #[error("output frame allocation failed: {0}")]
    OutputAllocation(String),

    #[error("output buffer too small: need {needed} bytes, got {got}")]
    OutputBufferTooSmall { needed: usize, got: usize },

    #[error("decoder session is closed or not configured")]
    SessionClosed,

    #[error("invalid decoder configuration: {0}")]
    InvalidConfig(String),

    #[error("hardware decode library unavailable: {0}")]
    LibraryUnavailable(String),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

impl DecodeError {
    /// Whether the session may keep running after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RenegotiationFailed(_) | Self::ProtocolViolation { .. } | Self::Pipeline(_)
        )
    }
}

/// Convenience Result type for decoder operations.
pub type DecodeResult<T> = Result<T, DecodeError>;
