//! Notifications produced by the decode engine.
//!
//! The engine reports three kinds of events while it parses a bitstream:
//! a new sequence (resolution / rate change), a picture handed to the
//! hardware for decoding, and a picture ready to display. Events are
//! plain owned values so they can cross from the engine's callback
//! thread to the pipeline thread through the [`EventQueue`](crate::queue::EventQueue).

use nvsync_common::{ChromaFormat, Rational};

/// Correlation key meaning "no decode event assigned yet".
pub const UNASSIGNED_FRAME_NUMBER: u32 = 0;

/// Convert an engine picture index into the frame number used to tag
/// pending frames. Returns `None` for indices that cannot be tagged.
pub fn frame_number_for(picture_index: i32) -> Option<u32> {
    u32::try_from(picture_index)
        .ok()
        .and_then(|idx| idx.checked_add(1))
}

/// A new sequence header was parsed.
#[derive(Clone, Debug, PartialEq)]
pub struct SequenceInfo {
    /// Display width (from the display rectangle).
    pub width: u32,
    /// Display height (from the display rectangle).
    pub height: u32,
    pub coded_width: u32,
    pub coded_height: u32,
    pub frame_rate: Rational,
    pub chroma_format: ChromaFormat,
    pub bit_depth: u32,
    pub progressive: bool,
}

impl SequenceInfo {
    /// Display dimensions from a display rectangle, falling back to the
    /// coded size when the rectangle is empty.
    pub fn display_size(
        left: i32,
        top: i32,
        right: i32,
        bottom: i32,
        coded_width: u32,
        coded_height: u32,
    ) -> (u32, u32) {
        let w = (right - left).max(0) as u32;
        let h = (bottom - top).max(0) as u32;
        (
            if w > 0 { w } else { coded_width },
            if h > 0 { h } else { coded_height },
        )
    }

    /// Frame rate with a zero denominator normalised to one.
    pub fn normalized_frame_rate(&self) -> Rational {
        Rational::new(self.frame_rate.num, self.frame_rate.den.max(1))
    }
}

/// A picture was submitted to the hardware for decoding.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PictureDecoded {
    pub picture_index: i32,
    /// Intra / key picture.
    pub is_sync_point: bool,
}

impl PictureDecoded {
    pub fn frame_number(&self) -> Option<u32> {
        frame_number_for(self.picture_index)
    }
}

/// A decoded picture is ready to be displayed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DisplayInfo {
    pub picture_index: i32,
    /// Timestamp the engine carried through; advisory only.
    pub timestamp: i64,
    pub progressive: bool,
    pub top_field_first: bool,
    /// Field repeat count; -1 marks a single unpaired field.
    pub repeat_first_field: i32,
}

impl DisplayInfo {
    pub fn frame_number(&self) -> Option<u32> {
        frame_number_for(self.picture_index)
    }
}

/// One engine notification.
#[derive(Clone, Debug, PartialEq)]
pub enum DecodeEvent {
    Sequence(SequenceInfo),
    Decode(PictureDecoded),
    Display(DisplayInfo),
}

impl DecodeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sequence(_) => "sequence",
            Self::Decode(_) => "decode",
            Self::Display(_) => "display",
        }
    }
}
