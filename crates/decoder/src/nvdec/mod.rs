//! NVIDIA NVDEC backend.
//!
//! - [`ffi`]: nvcuvid bindings, loaded at runtime with `libloading`
//! - [`session`]: CUDA context, context lock and copy stream
//! - [`engine`]: [`NvdecEngine`], the parser and decoder behind [`DecodeEngine`](crate::engine::DecodeEngine)

pub mod engine;
pub mod ffi;
pub mod session;

pub use engine::{NvDecoder, NvdecEngine, SessionOptions};
pub use ffi::{NvcuvidLibrary, NvcuvidLoadError};
pub use session::{ContextLock, ExternalSession, HardwareSession};
