//! The decoder driver.
//!
//! [`VideoDecoder`] owns the engine, the event queue and the consumer-side
//! state. The pipeline thread calls [`VideoDecoder::handle_frame`] for every
//! accepted access unit; each call submits the unit and then runs one
//! reconciliation pass.

use nvsync_common::{DecodeError, DecodeResult, DecoderConfig};
use tracing::{debug, info, warn};

use crate::engine::{BitstreamPacket, DecodeEngine};
use crate::flush::{DropLists, FlushSummary};
use crate::frame::PendingFrame;
use crate::pipeline::VideoPipeline;
use crate::queue::{EventQueue, EventSender};
use crate::reconcile::{PassStats, Reconciler};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Lifecycle {
    /// Started, no codec selected yet.
    Started,
    Configured,
    Stopped,
}

/// Cumulative counters over the life of a decoder.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub passes: u64,
    pub frames_finished: u64,
    pub frames_dropped: u64,
    pub protocol_violations: u64,
    pub timestamp_mismatches: u64,
    /// Frames downstream refused in `finish_frame`.
    pub finish_failures: u64,
    pub submit_failures: u64,
    pub latency_ms: u64,
    pub decode_drop_list: usize,
    pub display_drop_list: usize,
    pub queued_events: usize,
}

pub struct VideoDecoder<E: DecodeEngine> {
    engine: E,
    queue: EventQueue,
    drops: DropLists,
    reconciler: Reconciler,
    config: Option<DecoderConfig>,
    lifecycle: Lifecycle,
    stats: DecoderStats,
}

impl<E: DecodeEngine> std::fmt::Debug for VideoDecoder<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoDecoder")
            .field("lifecycle", &self.lifecycle)
            .field("codec", &self.config.as_ref().map(|c| c.codec))
            .field("queued_events", &self.queue.len())
            .field("decode_drop_list", &self.drops.decode_len())
            .field("display_drop_list", &self.drops.display_len())
            .finish()
    }
}

impl<E: DecodeEngine> VideoDecoder<E> {
    /// Create the event queue and build the engine around its producer side.
    pub fn start<F>(make_engine: F) -> DecodeResult<Self>
    where
        F: FnOnce(EventSender) -> DecodeResult<E>,
    {
        let queue = EventQueue::new();
        let engine = make_engine(queue.sender())?;
        debug!("Decoder started");
        Ok(Self {
            engine,
            queue,
            drops: DropLists::new(),
            reconciler: Reconciler::new(),
            config: None,
            lifecycle: Lifecycle::Started,
            stats: DecoderStats::default(),
        })
    }

    /// Select the codec. Tears down any existing decoder instance and
    /// parser and creates a fresh parser.
    pub fn set_format(&mut self, config: DecoderConfig) -> DecodeResult<()> {
        if self.lifecycle == Lifecycle::Stopped {
            return Err(DecodeError::SessionClosed);
        }
        self.engine.configure(&config)?;
        self.reconciler.invalidate_output();
        info!(
            codec = config.codec.display_name(),
            surfaces = config.num_decode_surfaces(),
            "Decoder format set"
        );
        self.config = Some(config);
        self.lifecycle = Lifecycle::Configured;
        Ok(())
    }

    /// Submit the access unit for `frame` and reconcile whatever the engine
    /// reported. `frame` must already be in the pipeline's pending list.
    pub fn handle_frame<P: VideoPipeline + ?Sized>(
        &mut self,
        pipeline: &mut P,
        frame: &PendingFrame,
        data: &[u8],
        discontinuity: bool,
    ) -> DecodeResult<PassStats> {
        if self.lifecycle != Lifecycle::Configured {
            return Err(DecodeError::SessionClosed);
        }

        let packet = BitstreamPacket {
            data,
            timestamp: frame.pts(),
            discontinuity,
        };
        if let Err(e) = self.engine.submit(&packet) {
            self.stats.submit_failures += 1;
            warn!(
                system_frame_number = frame.system_frame_number(),
                error = %e,
                "Failed to submit bitstream"
            );
        }

        self.run_pass(pipeline)
    }

    /// Release all pending frames. Frames still in flight inside the engine
    /// are retained until their events arrive.
    pub fn flush<P: VideoPipeline + ?Sized>(&mut self, pipeline: &mut P) -> FlushSummary {
        self.drops.flush(pipeline)
    }

    /// Reconcile events already queued without submitting new work.
    pub fn drain<P: VideoPipeline + ?Sized>(&mut self, pipeline: &mut P) -> DecodeResult<PassStats> {
        if self.lifecycle != Lifecycle::Configured {
            return Err(DecodeError::SessionClosed);
        }
        self.run_pass(pipeline)
    }

    /// Release every hardware resource, purge the queue and free both
    /// drop-lists. Calling it again is a no-op.
    pub fn stop(&mut self) {
        if self.lifecycle == Lifecycle::Stopped {
            return;
        }
        self.engine.close();

        let purged = self.queue.purge();
        if purged > 0 {
            info!(purged, "Discarded queued events on stop");
        }
        let freed = self.drops.clear();
        if freed > 0 {
            debug!(freed, "Freed flushed frames on stop");
        }
        self.reconciler.reset();
        self.config = None;
        self.lifecycle = Lifecycle::Stopped;
        debug!("Decoder stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.lifecycle == Lifecycle::Stopped
    }

    pub fn config(&self) -> Option<&DecoderConfig> {
        self.config.as_ref()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            latency_ms: self.reconciler.output().min_latency.as_millis() as u64,
            decode_drop_list: self.drops.decode_len(),
            display_drop_list: self.drops.display_len(),
            queued_events: self.queue.len(),
            ..self.stats.clone()
        }
    }

    fn run_pass<P: VideoPipeline + ?Sized>(&mut self, pipeline: &mut P) -> DecodeResult<PassStats> {
        self.stats.passes += 1;
        let pass = self
            .reconciler
            .run(&self.queue, &mut self.drops, &mut self.engine, pipeline)?;

        self.stats.frames_finished += u64::from(pass.finished);
        self.stats.frames_dropped += u64::from(pass.dropped);
        self.stats.protocol_violations += u64::from(pass.protocol_violations);
        self.stats.timestamp_mismatches += u64::from(pass.timestamp_mismatches);
        self.stats.finish_failures += u64::from(pass.finish_failures);
        Ok(pass)
    }
}

impl<E: DecodeEngine> Drop for VideoDecoder<E> {
    fn drop(&mut self) {
        self.stop();
    }
}
