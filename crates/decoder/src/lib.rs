//! `nvsync-decoder` — Hardware decode with frame reconciliation.
//!
//! The decode engine reports what it did (new sequence, picture decoded,
//! picture ready for display) as [`DecodeEvent`]s on a queue. The pipeline
//! thread drains that queue after every submitted access unit and pairs
//! each event with one of the pipeline's pending frames:
//!
//! - **Sequence**: renegotiate the output format when the size or rate changes
//! - **Decode**: tag the oldest frame still awaiting decode with its picture slot
//! - **Display**: copy the picture out and finish the frame in presentation order
//!
//! Frames released by a flush stay on drop-lists until their events come
//! back, so late events never resolve to a recycled frame.
//!
//! [`VideoDecoder`] ties this together over any [`DecodeEngine`];
//! [`nvdec::NvdecEngine`] is the NVDEC implementation.

pub mod decoder;
pub mod engine;
pub mod event;
pub mod flush;
pub mod frame;
pub mod materialize;
pub mod nvdec;
pub mod pipeline;
pub mod queue;
pub mod reconcile;
pub mod sequence;

pub use decoder::{DecoderStats, VideoDecoder};
pub use engine::{BitstreamPacket, DecodeEngine, PlaneCopy};
pub use event::{DecodeEvent, DisplayInfo, PictureDecoded, SequenceInfo, UNASSIGNED_FRAME_NUMBER};
pub use flush::{DropLists, FlushSummary};
pub use frame::{OutputBuffer, PendingFrame, VideoBufferFlags, WeakFrame};
pub use materialize::FrameLayout;
pub use pipeline::{OutputFormat, PixelFormat, VideoPipeline};
pub use queue::{EventQueue, EventSender};
pub use reconcile::{PassStats, Reconciler};
pub use sequence::OutputState;

pub use nvsync_common::{DecodeError, DecodeResult, DecoderConfig, VideoCodec};
