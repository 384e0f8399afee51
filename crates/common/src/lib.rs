//! `nvsync-common` — Shared types, configuration, and errors for the nvsync decoder.
//!
//! - **Codec**: `VideoCodec` and its NVDEC surface minimums
//! - **Types**: `Rational`, `ChromaFormat`, `InterlaceMode`
//! - **Config**: `DecoderConfig` (serde, loadable from JSON)
//! - **Errors**: `DecodeError`, `PipelineError` (thiserror-based)

pub mod codec;
pub mod config;
pub mod error;
pub mod types;

pub use codec::VideoCodec;
pub use config::{CreateFlags, DecoderConfig, DeinterlaceMode};
pub use error::{DecodeError, DecodeResult, PipelineError};
pub use types::{ChromaFormat, InterlaceMode, Rational};
