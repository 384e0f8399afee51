//! The reconciliation pass.
//!
//! Pairs engine events with the pipeline's pending frames. A decode event
//! tags the next frame awaiting decode with `picture_index + 1`; a display
//! event looks that number up again, first among flushed frames (which are
//! discarded silently) and then among pending frames (which are copied out
//! and finished).
//!
//! Picture indices are recycled by the engine, so frames are always
//! resolved against the pending list fetched for the current pass and
//! finished frames leave that list immediately.

use std::time::Duration;

use nvsync_common::{DecodeError, DecodeResult, PipelineError};
use tracing::{debug, info, trace, warn};

use crate::engine::DecodeEngine;
use crate::event::{DecodeEvent, DisplayInfo, PictureDecoded};
use crate::flush::DropLists;
use crate::frame::{total_duration, PendingFrame};
use crate::materialize::{materialize, FrameLayout};
use crate::pipeline::VideoPipeline;
use crate::queue::EventQueue;
use crate::sequence::OutputState;

/// What one pass did.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PassStats {
    pub sequences: u32,
    pub decoded: u32,
    pub finished: u32,
    /// Flushed frames discarded at their display event.
    pub dropped: u32,
    pub protocol_violations: u32,
    pub timestamp_mismatches: u32,
    /// Frames whose `finish_frame` call failed.
    pub finish_failures: u32,
    /// A decode event is waiting for a frame to arrive.
    pub decode_deferred: bool,
}

/// Consumer-side state that survives between passes.
#[derive(Debug, Default)]
pub struct Reconciler {
    output: OutputState,
    /// Decode event popped while no frame was available to receive it.
    deferred: Option<PictureDecoded>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(&self) -> &OutputState {
        &self.output
    }

    pub fn has_deferred_decode(&self) -> bool {
        self.deferred.is_some()
    }

    /// Force renegotiation on the next sequence event.
    pub fn invalidate_output(&mut self) {
        self.output.invalidate();
    }

    /// Drop all consumer-side state, including the latency high-water mark.
    pub fn reset(&mut self) {
        self.output = OutputState::default();
        self.deferred = None;
    }

    /// Apply queued events in order until the queue runs dry, a decode
    /// event finds no frame to claim, or an error aborts the pass.
    pub fn run<E, P>(
        &mut self,
        queue: &EventQueue,
        drops: &mut DropLists,
        engine: &mut E,
        pipeline: &mut P,
    ) -> DecodeResult<PassStats>
    where
        E: DecodeEngine + ?Sized,
        P: VideoPipeline + ?Sized,
    {
        let mut stats = PassStats::default();
        let mut pending = pipeline.pending_frames();

        let first_unassigned = pending
            .iter()
            .position(PendingFrame::is_awaiting_decode)
            .unwrap_or(pending.len());
        let mut latency = total_duration(&pending[..first_unassigned]);

        trace!(
            pending = pending.len(),
            queued = queue.len(),
            baseline_ms = latency.as_millis() as u64,
            "Starting reconciliation pass"
        );

        loop {
            let event = match self.deferred.take() {
                Some(picture) => DecodeEvent::Decode(picture),
                None => match queue.pop() {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                DecodeEvent::Sequence(seq) => {
                    stats.sequences += 1;
                    self.output.apply(&seq, &*engine, pipeline)?;
                }
                DecodeEvent::Decode(picture) => {
                    if !self.apply_decode(picture, &pending, drops, &mut latency, &mut stats) {
                        self.deferred = Some(picture);
                        stats.decode_deferred = true;
                        debug!(
                            pic_idx = picture.picture_index,
                            "No frame awaiting decode, holding decode event"
                        );
                        break;
                    }
                }
                DecodeEvent::Display(info) => {
                    self.apply_display(
                        &info,
                        &mut pending,
                        drops,
                        &mut latency,
                        engine,
                        pipeline,
                        &mut stats,
                    )?;
                }
            }
        }

        Ok(stats)
    }

    /// Returns `false` when no frame can take the event.
    fn apply_decode(
        &mut self,
        picture: PictureDecoded,
        pending: &[PendingFrame],
        drops: &mut DropLists,
        latency: &mut Duration,
        stats: &mut PassStats,
    ) -> bool {
        let Some(frame_number) = picture.frame_number() else {
            warn!(pic_idx = picture.picture_index, "Decode event with invalid picture index");
            stats.protocol_violations += 1;
            return true;
        };

        let frame = match drops.claim_decode_slot(frame_number) {
            Some(frame) => {
                debug!(frame_number, "Decode event claimed by flushed frame");
                frame
            }
            None => match pending.iter().find(|f| f.is_awaiting_decode()) {
                Some(frame) => {
                    frame.set_frame_number(frame_number);
                    frame.clone()
                }
                None => return false,
            },
        };

        if picture.is_sync_point {
            frame.mark_sync_point();
        }
        let duration = match frame.duration() {
            Some(d) => d,
            None => {
                let d = self.output.frame_duration();
                frame.set_duration(d);
                d
            }
        };
        *latency += duration;
        stats.decoded += 1;

        trace!(
            frame_number,
            sync_point = picture.is_sync_point,
            latency_ms = latency.as_millis() as u64,
            "Decode event applied"
        );
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_display<E, P>(
        &mut self,
        info: &DisplayInfo,
        pending: &mut Vec<PendingFrame>,
        drops: &mut DropLists,
        latency: &mut Duration,
        engine: &mut E,
        pipeline: &mut P,
        stats: &mut PassStats,
    ) -> DecodeResult<()>
    where
        E: DecodeEngine + ?Sized,
        P: VideoPipeline + ?Sized,
    {
        let Some(frame_number) = info.frame_number() else {
            warn!(pic_idx = info.picture_index, "Display event with invalid picture index");
            stats.protocol_violations += 1;
            return Ok(());
        };

        if drops.take_displayed(frame_number).is_some() {
            debug!(frame_number, "Discarding flushed frame");
            stats.dropped += 1;
            return Ok(());
        }

        let Some(pos) = pending.iter().position(|f| f.frame_number() == frame_number) else {
            let violation = DecodeError::ProtocolViolation { frame_number };
            warn!(frame_number, error = %violation, "No pending frame for display event");
            stats.protocol_violations += 1;
            return Ok(());
        };
        let frame = pending.remove(pos);

        if frame.pts() != info.timestamp {
            warn!(
                frame_number,
                frame_pts = frame.pts(),
                event_pts = info.timestamp,
                "Display timestamp does not match frame, keeping frame timestamp"
            );
            stats.timestamp_mismatches += 1;
        }

        if *latency > self.output.min_latency {
            self.output.min_latency = *latency;
            pipeline.set_latency(*latency, *latency);
            debug!(latency_ms = latency.as_millis() as u64, "Reporting new latency");
        }
        *latency = latency.saturating_sub(frame.duration().unwrap_or(Duration::ZERO));

        let mut buffer = pipeline.allocate_output_frame(&frame).map_err(|e| match e {
            PipelineError::Allocation(reason) => DecodeError::OutputAllocation(reason),
            other => DecodeError::from(other),
        })?;

        let layout = FrameLayout::new(self.output.width, self.output.height, self.output.stride);
        materialize(engine, &layout, info, &mut buffer)?;
        frame.set_output(buffer);

        match pipeline.finish_frame(frame) {
            Ok(()) => stats.finished += 1,
            Err(e) => {
                info!(frame_number, error = %e, "Downstream did not accept frame");
                stats.finish_failures += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{BitstreamPacket, PlaneCopy};
    use crate::event::SequenceInfo;
    use crate::frame::OutputBuffer;
    use crate::pipeline::OutputFormat;
    use nvsync_common::{ChromaFormat, DecoderConfig, PipelineError, Rational};

    struct NullEngine;

    impl DecodeEngine for NullEngine {
        fn configure(&mut self, _: &DecoderConfig) -> DecodeResult<()> {
            Ok(())
        }
        fn submit(&mut self, _: &BitstreamPacket<'_>) -> DecodeResult<()> {
            Ok(())
        }
        fn has_decoder(&self) -> bool {
            true
        }
        fn copy_planes(&mut self, _: &DisplayInfo, _: &[PlaneCopy], _: &mut [u8]) -> DecodeResult<()> {
            Ok(())
        }
        fn close(&mut self) {}
    }

    #[derive(Default)]
    struct ListPipeline {
        pending: Vec<PendingFrame>,
        finished: Vec<PendingFrame>,
        latency: Vec<Duration>,
    }

    impl VideoPipeline for ListPipeline {
        fn set_output_format(&mut self, format: &OutputFormat) -> Result<u32, PipelineError> {
            Ok(format.default_stride())
        }
        fn allocate_output_frame(&mut self, _: &PendingFrame) -> Result<OutputBuffer, PipelineError> {
            Ok(OutputBuffer::with_size(4 * 3))
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
        fn set_latency(&mut self, min: Duration, _: Duration) {
            self.latency.push(min);
        }
    }

    fn sequence() -> DecodeEvent {
        DecodeEvent::Sequence(SequenceInfo {
            width: 4,
            height: 2,
            coded_width: 4,
            coded_height: 2,
            frame_rate: Rational::FPS_25,
            chroma_format: ChromaFormat::Yuv420,
            bit_depth: 8,
            progressive: true,
        })
    }

    fn decode(idx: i32) -> DecodeEvent {
        DecodeEvent::Decode(PictureDecoded {
            picture_index: idx,
            is_sync_point: idx == 0,
        })
    }

    fn display(idx: i32, ts: i64) -> DecodeEvent {
        DecodeEvent::Display(DisplayInfo {
            picture_index: idx,
            timestamp: ts,
            progressive: true,
            top_field_first: false,
            repeat_first_field: 0,
        })
    }

    #[test]
    fn baseline_counts_frames_before_first_unassigned() {
        let a = PendingFrame::new(1, 0, Some(Duration::from_millis(40)));
        a.set_frame_number(1);
        let b = PendingFrame::new(2, 40, None);
        let mut pipeline = ListPipeline {
            pending: vec![a, b],
            ..Default::default()
        };
        let queue = EventQueue::new();
        let tx = queue.sender();
        tx.push(sequence());
        tx.push(decode(1));
        tx.push(display(0, 0));

        let mut reconciler = Reconciler::new();
        let stats = reconciler
            .run(&queue, &mut DropLists::new(), &mut NullEngine, &mut pipeline)
            .expect("pass");

        assert_eq!(stats.finished, 1);
        // 40ms baseline from the first frame plus 40ms derived for the second.
        assert_eq!(pipeline.latency, vec![Duration::from_millis(80)]);
        assert_eq!(pipeline.pending.len(), 1);
        assert_eq!(pipeline.pending[0].duration(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn decode_without_frame_is_held_for_next_pass() {
        let mut pipeline = ListPipeline::default();
        let queue = EventQueue::new();
        let tx = queue.sender();
        tx.push(sequence());
        tx.push(decode(0));
        tx.push(display(0, 0));

        let mut reconciler = Reconciler::new();
        let mut drops = DropLists::new();
        let stats = reconciler
            .run(&queue, &mut drops, &mut NullEngine, &mut pipeline)
            .expect("first pass");
        assert!(stats.decode_deferred);
        assert!(reconciler.has_deferred_decode());
        assert_eq!(queue.len(), 1);

        pipeline.pending.push(PendingFrame::new(1, 0, None));
        let stats = reconciler
            .run(&queue, &mut drops, &mut NullEngine, &mut pipeline)
            .expect("second pass");
        assert_eq!(stats.decoded, 1);
        assert_eq!(stats.finished, 1);
        assert!(!reconciler.has_deferred_decode());
        assert!(pipeline.finished[0].is_sync_point());
    }

    #[test]
    fn recycled_index_matches_the_new_frame() {
        let first = PendingFrame::new(1, 0, None);
        let second = PendingFrame::new(2, 40, None);
        let mut pipeline = ListPipeline {
            pending: vec![first.clone(), second.clone()],
            ..Default::default()
        };
        let queue = EventQueue::new();
        let tx = queue.sender();
        tx.push(sequence());
        tx.push(decode(0));
        tx.push(display(0, 0));
        tx.push(decode(0));
        tx.push(display(0, 40));

        let stats = Reconciler::new()
            .run(&queue, &mut DropLists::new(), &mut NullEngine, &mut pipeline)
            .expect("pass");

        assert_eq!(stats.finished, 2);
        assert_eq!(stats.timestamp_mismatches, 0);
        assert!(pipeline.finished[0].ptr_eq(&first));
        assert!(pipeline.finished[1].ptr_eq(&second));
    }

    #[test]
    fn negative_index_is_a_protocol_violation() {
        let mut pipeline = ListPipeline {
            pending: vec![PendingFrame::new(1, 0, None)],
            ..Default::default()
        };
        let queue = EventQueue::new();
        let tx = queue.sender();
        tx.push(display(-1, 0));
        tx.push(decode(-1));

        let stats = Reconciler::new()
            .run(&queue, &mut DropLists::new(), &mut NullEngine, &mut pipeline)
            .expect("pass");
        assert_eq!(stats.protocol_violations, 2);
        assert!(pipeline.pending[0].is_awaiting_decode());
    }

    #[test]
    fn reset_clears_latency_and_deferred() {
        let mut reconciler = Reconciler::new();
        let queue = EventQueue::new();
        queue.sender().push(decode(0));
        reconciler
            .run(&queue, &mut DropLists::new(), &mut NullEngine, &mut ListPipeline::default())
            .expect("pass");
        assert!(reconciler.has_deferred_decode());
        reconciler.reset();
        assert!(!reconciler.has_deferred_decode());
        assert_eq!(reconciler.output().min_latency, Duration::ZERO);
    }
}
