//! Copying a displayed picture into its output buffer.

use nvsync_common::{DecodeError, DecodeResult};
use tracing::trace;

use crate::engine::{DecodeEngine, PlaneCopy};
use crate::event::DisplayInfo;
use crate::frame::{OutputBuffer, VideoBufferFlags};

/// NV12 geometry of one output frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameLayout {
    pub width: u32,
    pub height: u32,
    /// Destination row stride for both planes.
    pub stride: u32,
}

impl FrameLayout {
    pub fn new(width: u32, height: u32, stride: u32) -> Self {
        Self {
            width,
            height,
            stride,
        }
    }

    pub fn chroma_rows(&self) -> u32 {
        self.height.div_ceil(2)
    }

    /// Minimum destination size in bytes.
    pub fn required_size(&self) -> usize {
        self.stride as usize * (self.height + self.chroma_rows()) as usize
    }

    /// Luma then interleaved chroma. The chroma plane of the mapped surface
    /// starts `height` pitches after its base.
    pub fn plane_copies(&self) -> [PlaneCopy; 2] {
        let stride = self.stride as usize;
        let width = self.width as usize;
        let height = self.height as usize;
        [
            PlaneCopy {
                src_row: 0,
                dst_offset: 0,
                dst_stride: stride,
                width_bytes: width,
                rows: height,
            },
            PlaneCopy {
                src_row: height,
                dst_offset: stride * height,
                dst_stride: stride,
                width_bytes: width,
                rows: self.chroma_rows() as usize,
            },
        ]
    }
}

/// Interlace flags for a displayed picture.
pub fn buffer_flags(info: &DisplayInfo) -> VideoBufferFlags {
    if info.progressive {
        return VideoBufferFlags::default();
    }
    VideoBufferFlags {
        interlaced: true,
        tff: info.top_field_first,
        rff: info.repeat_first_field > 0,
        one_field: info.repeat_first_field == -1,
    }
}

/// Fill `buffer` with the picture named by `info` and tag its flags.
pub fn materialize<E: DecodeEngine + ?Sized>(
    engine: &mut E,
    layout: &FrameLayout,
    info: &DisplayInfo,
    buffer: &mut OutputBuffer,
) -> DecodeResult<()> {
    let needed = layout.required_size();
    if buffer.len() < needed {
        return Err(DecodeError::OutputBufferTooSmall {
            needed,
            got: buffer.len(),
        });
    }

    trace!(
        pic_idx = info.picture_index,
        width = layout.width,
        height = layout.height,
        stride = layout.stride,
        "Copying decoded picture"
    );
    engine.copy_planes(info, &layout.plane_copies(), &mut buffer.data)?;
    buffer.flags = buffer_flags(info);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BitstreamPacket;
    use nvsync_common::DecoderConfig;

    fn display(progressive: bool, tff: bool, rff: i32) -> DisplayInfo {
        DisplayInfo {
            picture_index: 0,
            timestamp: 0,
            progressive,
            top_field_first: tff,
            repeat_first_field: rff,
        }
    }

    /// Fills luma rows with 0x10 and chroma rows with 0x80, as a surface
    /// copy would.
    #[derive(Default)]
    struct FillEngine {
        copies: Vec<PlaneCopy>,
    }

    impl DecodeEngine for FillEngine {
        fn configure(&mut self, _: &DecoderConfig) -> DecodeResult<()> {
            Ok(())
        }
        fn submit(&mut self, _: &BitstreamPacket<'_>) -> DecodeResult<()> {
            Ok(())
        }
        fn has_decoder(&self) -> bool {
            true
        }
        fn copy_planes(&mut self, _: &DisplayInfo, planes: &[PlaneCopy], dst: &mut [u8]) -> DecodeResult<()> {
            for (i, plane) in planes.iter().enumerate() {
                let value = if i == 0 { 0x10 } else { 0x80 };
                for row in 0..plane.rows {
                    let start = plane.dst_offset + row * plane.dst_stride;
                    dst[start..start + plane.width_bytes].fill(value);
                }
                self.copies.push(*plane);
            }
            Ok(())
        }
        fn close(&mut self) {}
    }

    #[test]
    fn progressive_has_no_flags() {
        assert_eq!(buffer_flags(&display(true, true, 1)), VideoBufferFlags::default());
    }

    #[test]
    fn interlaced_flags() {
        let flags = buffer_flags(&display(false, true, 0));
        assert!(flags.interlaced);
        assert!(flags.tff);
        assert!(!flags.rff);
        assert!(!flags.one_field);

        let flags = buffer_flags(&display(false, false, 1));
        assert!(flags.rff);
        assert!(!flags.one_field);

        let flags = buffer_flags(&display(false, false, -1));
        assert!(flags.one_field);
        assert!(!flags.rff);
    }

    #[test]
    fn two_planes_for_odd_height() {
        let layout = FrameLayout::new(6, 5, 8);
        let [luma, chroma] = layout.plane_copies();
        assert_eq!(luma.rows, 5);
        assert_eq!(chroma.rows, 3);
        assert_eq!(chroma.src_row, 5);
        assert_eq!(chroma.dst_offset, 40);
        assert_eq!(layout.required_size(), 64);
        assert!(chroma.dst_end() <= layout.required_size());
    }

    #[test]
    fn materialize_fills_both_planes_and_padding_stays() {
        let layout = FrameLayout::new(4, 2, 6);
        let mut buffer = OutputBuffer::with_size(layout.required_size());
        let mut engine = FillEngine::default();

        materialize(&mut engine, &layout, &display(false, true, 0), &mut buffer).expect("copy");

        assert_eq!(engine.copies.len(), 2);
        assert_eq!(&buffer.data[0..4], &[0x10; 4]);
        assert_eq!(&buffer.data[4..6], &[0, 0]);
        assert_eq!(&buffer.data[12..16], &[0x80; 4]);
        assert!(buffer.flags.interlaced);
    }

    #[test]
    fn small_buffer_is_rejected() {
        let layout = FrameLayout::new(640, 480, 640);
        let mut buffer = OutputBuffer::with_size(640 * 480);
        let mut engine = FillEngine::default();

        let err = materialize(&mut engine, &layout, &display(true, false, 0), &mut buffer).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::OutputBufferTooSmall { needed, got } if needed == 640 * 720 && got == 640 * 480
        ));
        assert!(engine.copies.is_empty());
    }
}
