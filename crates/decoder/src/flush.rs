//! Drop-lists for frames released by a flush while still in flight.
//!
//! The engine cannot abandon work it has accepted, so a flush cannot simply
//! forget pending frames: their decode and display events will still
//! arrive. Each released frame is retained here until its own event shows
//! up, and is then discarded instead of being emitted.
//!
//! A frame without a frame number waits on the decode list for the next
//! decode event, which moves it onto the display list. A frame that already
//! has a number goes straight to the display list. Both lists are freed
//! unconditionally when the session stops.

use std::collections::VecDeque;

use tracing::debug;

use crate::frame::PendingFrame;
use crate::pipeline::VideoPipeline;

/// How many frames a flush placed on each list.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub awaiting_decode: usize,
    pub awaiting_display: usize,
}

#[derive(Debug, Default)]
pub struct DropLists {
    decode: VecDeque<PendingFrame>,
    display: Vec<PendingFrame>,
}

impl DropLists {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release every pending frame back to the pipeline while keeping a
    /// reference to each until its engine event arrives.
    pub fn flush<P: VideoPipeline + ?Sized>(&mut self, pipeline: &mut P) -> FlushSummary {
        let mut summary = FlushSummary::default();
        for frame in pipeline.pending_frames() {
            if frame.is_awaiting_decode() {
                self.decode.push_back(frame.clone());
                summary.awaiting_decode += 1;
            } else {
                self.display.push(frame.clone());
                summary.awaiting_display += 1;
            }
            pipeline.release_frame(&frame);
        }
        debug!(
            awaiting_decode = summary.awaiting_decode,
            awaiting_display = summary.awaiting_display,
            "Flushed pending frames onto drop-lists"
        );
        summary
    }

    /// Give the oldest decode-phase frame the number `frame_number` and move
    /// it to the display list. Returns it, or `None` if no frame waits for a
    /// decode event.
    pub fn claim_decode_slot(&mut self, frame_number: u32) -> Option<PendingFrame> {
        let frame = self.decode.pop_front()?;
        frame.set_frame_number(frame_number);
        self.display.push(frame.clone());
        Some(frame)
    }

    /// Remove and return the display-phase frame carrying `frame_number`.
    pub fn take_displayed(&mut self, frame_number: u32) -> Option<PendingFrame> {
        let pos = self
            .display
            .iter()
            .position(|f| f.frame_number() == frame_number)?;
        Some(self.display.remove(pos))
    }

    pub fn decode_len(&self) -> usize {
        self.decode.len()
    }

    pub fn display_len(&self) -> usize {
        self.display.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decode.is_empty() && self.display.is_empty()
    }

    /// Free every retained frame. Returns how many were released.
    pub fn clear(&mut self) -> usize {
        let freed = self.decode.len() + self.display.len();
        self.decode.clear();
        self.display.clear();
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::OutputBuffer;
    use crate::pipeline::OutputFormat;
    use nvsync_common::PipelineError;
    use std::time::Duration;

    #[derive(Default)]
    struct Frames {
        pending: Vec<PendingFrame>,
        released: usize,
    }

    impl VideoPipeline for Frames {
        fn set_output_format(&mut self, _: &OutputFormat) -> Result<u32, PipelineError> {
            Ok(0)
        }
        fn allocate_output_frame(&mut self, _: &PendingFrame) -> Result<OutputBuffer, PipelineError> {
            Ok(OutputBuffer::default())
        }
        fn finish_frame(&mut self, _: PendingFrame) -> Result<(), PipelineError> {
            Ok(())
        }
        fn release_frame(&mut self, frame: &PendingFrame) {
            self.pending.retain(|f| !f.ptr_eq(frame));
            self.released += 1;
        }
        fn pending_frames(&self) -> Vec<PendingFrame> {
            self.pending.clone()
        }
        fn set_latency(&mut self, _: Duration, _: Duration) {}
    }

    #[test]
    fn flush_sorts_by_phase() {
        let decoded = PendingFrame::new(1, 0, None);
        decoded.set_frame_number(3);
        let waiting = PendingFrame::new(2, 33, None);
        let mut pipeline = Frames {
            pending: vec![decoded.clone(), waiting.clone()],
            released: 0,
        };

        let mut drops = DropLists::new();
        let summary = drops.flush(&mut pipeline);

        assert_eq!(
            summary,
            FlushSummary {
                awaiting_decode: 1,
                awaiting_display: 1
            }
        );
        assert_eq!(pipeline.released, 2);
        assert!(pipeline.pending.is_empty());
        // Retained by the drop-list plus the local handle.
        assert_eq!(waiting.ref_count(), 2);
    }

    #[test]
    fn decode_slot_moves_frame_to_display_list() {
        let frame = PendingFrame::new(1, 0, None);
        let mut pipeline = Frames {
            pending: vec![frame.clone()],
            released: 0,
        };
        let mut drops = DropLists::new();
        drops.flush(&mut pipeline);

        let claimed = drops.claim_decode_slot(5).expect("frame waiting");
        assert!(claimed.ptr_eq(&frame));
        assert_eq!(frame.frame_number(), 5);
        assert_eq!(drops.decode_len(), 0);
        assert_eq!(drops.display_len(), 1);

        assert!(drops.take_displayed(4).is_none());
        assert!(drops.take_displayed(5).is_some());
        assert!(drops.is_empty());
    }

    #[test]
    fn claim_on_empty_list() {
        let mut drops = DropLists::new();
        assert!(drops.claim_decode_slot(1).is_none());
    }

    #[test]
    fn clear_frees_retained_frames() {
        let frame = PendingFrame::new(1, 0, None);
        let weak = frame.downgrade();
        let mut pipeline = Frames {
            pending: vec![frame],
            released: 0,
        };
        let mut drops = DropLists::new();
        drops.flush(&mut pipeline);
        assert!(weak.is_alive());
        assert_eq!(drops.clear(), 1);
        assert!(!weak.is_alive());
    }
}
