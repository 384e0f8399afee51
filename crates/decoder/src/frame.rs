//! Pending frames and the output buffers attached to them.
//!
//! A [`PendingFrame`] is owned by the surrounding pipeline, which keeps
//! one per bitstream unit it has accepted but not yet finished. The
//! decoder only borrows frames for the length of a reconciliation pass,
//! except for frames it retains on a drop-list after a flush. Cloning a
//! `PendingFrame` takes another reference to the same frame.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::event::UNASSIGNED_FRAME_NUMBER;

/// Interlace flags carried on an output buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VideoBufferFlags {
    pub interlaced: bool,
    /// Top field first.
    pub tff: bool,
    /// Repeat first field.
    pub rff: bool,
    /// Only one field is present.
    pub one_field: bool,
}

/// Destination for the decoded pixels of one frame.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct OutputBuffer {
    pub data: Vec<u8>,
    pub flags: VideoBufferFlags,
}

impl OutputBuffer {
    pub fn with_size(size: usize) -> Self {
        Self {
            data: vec![0; size],
            flags: VideoBufferFlags::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for OutputBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputBuffer")
            .field("len", &self.data.len())
            .field("flags", &self.flags)
            .finish()
    }
}

#[derive(Debug)]
struct FrameData {
    /// Identifier assigned by the pipeline.
    system_frame_number: u32,
    pts: i64,
    duration: Option<Duration>,
    /// `picture_index + 1` once a decode event claimed this frame.
    frame_number: u32,
    sync_point: bool,
    output: Option<OutputBuffer>,
}

/// Shared handle to a frame the pipeline is waiting on.
#[derive(Clone)]
pub struct PendingFrame {
    inner: Arc<Mutex<FrameData>>,
}

impl PendingFrame {
    pub fn new(system_frame_number: u32, pts: i64, duration: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FrameData {
                system_frame_number,
                pts,
                duration,
                frame_number: UNASSIGNED_FRAME_NUMBER,
                sync_point: false,
                output: None,
            })),
        }
    }

    pub fn system_frame_number(&self) -> u32 {
        self.inner.lock().system_frame_number
    }

    pub fn pts(&self) -> i64 {
        self.inner.lock().pts
    }

    pub fn duration(&self) -> Option<Duration> {
        self.inner.lock().duration
    }

    pub fn set_duration(&self, duration: Duration) {
        self.inner.lock().duration = Some(duration);
    }

    pub fn frame_number(&self) -> u32 {
        self.inner.lock().frame_number
    }

    pub fn set_frame_number(&self, frame_number: u32) {
        self.inner.lock().frame_number = frame_number;
    }

    pub fn is_awaiting_decode(&self) -> bool {
        self.frame_number() == UNASSIGNED_FRAME_NUMBER
    }

    pub fn is_sync_point(&self) -> bool {
        self.inner.lock().sync_point
    }

    pub fn mark_sync_point(&self) {
        self.inner.lock().sync_point = true;
    }

    pub fn set_output(&self, buffer: OutputBuffer) {
        self.inner.lock().output = Some(buffer);
    }

    pub fn output(&self) -> Option<OutputBuffer> {
        self.inner.lock().output.clone()
    }

    /// Whether both handles refer to the same frame.
    pub fn ptr_eq(&self, other: &PendingFrame) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of live references to this frame.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// A weak handle that does not keep the frame alive.
    pub fn downgrade(&self) -> WeakFrame {
        WeakFrame {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl fmt::Debug for PendingFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.inner.lock();
        f.debug_struct("PendingFrame")
            .field("system_frame_number", &data.system_frame_number)
            .field("pts", &data.pts)
            .field("duration", &data.duration)
            .field("frame_number", &data.frame_number)
            .field("sync_point", &data.sync_point)
            .field("has_output", &data.output.is_some())
            .finish()
    }
}

/// Non-owning frame handle, used to observe when a frame is freed.
#[derive(Clone, Debug)]
pub struct WeakFrame {
    inner: Weak<Mutex<FrameData>>,
}

impl WeakFrame {
    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

/// Total duration of a run of frames, counting unknown durations as zero.
pub fn total_duration<'a>(frames: impl IntoIterator<Item = &'a PendingFrame>) -> Duration {
    frames
        .into_iter()
        .map(|f| f.duration().unwrap_or(Duration::ZERO))
        .sum()
}
