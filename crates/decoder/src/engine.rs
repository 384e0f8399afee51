//! The hardware decode engine seam.
//!
//! An engine parses bitstream units and reports what happened through the
//! [`EventSender`](crate::queue::EventSender) it was built with. Events may
//! be pushed from inside [`DecodeEngine::submit`] or from any other thread;
//! the decoder only relies on their FIFO order.
//!
//! [`crate::nvdec::NvdecEngine`] implements this against NVDEC.

use nvsync_common::{DecodeResult, DecoderConfig};

use crate::event::DisplayInfo;

/// One compressed access unit.
#[derive(Copy, Clone, Debug)]
pub struct BitstreamPacket<'a> {
    pub data: &'a [u8],
    /// Presentation timestamp in the configured clock rate.
    pub timestamp: i64,
    pub discontinuity: bool,
}

/// One rectangular region to copy out of a decoded surface.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PlaneCopy {
    /// First source row, counted in surface pitches from the mapped base.
    pub src_row: usize,
    /// Byte offset of the first destination row.
    pub dst_offset: usize,
    /// Destination row stride in bytes.
    pub dst_stride: usize,
    pub width_bytes: usize,
    pub rows: usize,
}

impl PlaneCopy {
    /// Bytes of the destination touched by this copy.
    pub fn dst_end(&self) -> usize {
        if self.rows == 0 {
            return self.dst_offset;
        }
        self.dst_offset + self.dst_stride * (self.rows - 1) + self.width_bytes
    }
}

/// Operations the decoder performs on the hardware engine.
///
/// Every call into the engine is expected to hold the engine's own
/// serialization lock internally.
pub trait DecodeEngine {
    /// Prepare the engine for a codec: tear down any previous decoder
    /// instance, query capabilities, and create a fresh parser.
    fn configure(&mut self, config: &DecoderConfig) -> DecodeResult<()>;

    /// Feed one access unit. Events it triggers are queued before return.
    fn submit(&mut self, packet: &BitstreamPacket<'_>) -> DecodeResult<()>;

    /// Whether a decoder instance currently exists.
    fn has_decoder(&self) -> bool;

    /// Copy the decoded picture named by `picture` into `dst` and wait for
    /// the copy to complete.
    fn copy_planes(
        &mut self,
        picture: &DisplayInfo,
        planes: &[PlaneCopy],
        dst: &mut [u8],
    ) -> DecodeResult<()>;

    /// Release every hardware resource. Best effort; failures are logged.
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dst_end_accounts_for_last_row_width() {
        let plane = PlaneCopy {
            src_row: 0,
            dst_offset: 100,
            dst_stride: 64,
            width_bytes: 60,
            rows: 3,
        };
        assert_eq!(plane.dst_end(), 100 + 64 * 2 + 60);
    }

    #[test]
    fn dst_end_empty_plane() {
        let plane = PlaneCopy {
            src_row: 0,
            dst_offset: 8,
            dst_stride: 64,
            width_bytes: 60,
            rows: 0,
        };
        assert_eq!(plane.dst_end(), 8);
    }
}
