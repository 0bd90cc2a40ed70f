// This module manages the three kinds of memory a value can be homed in. Frames tracks
// every function frame as a forward-growing byte counter: slots are handed out at the
// current end of the frame, so an offset stays valid while the frame keeps growing, and the
// final size is only read by the assembler. StaticSegment is the same idea for the process
// wide static area at the bottom of the VM stack. ConstantPool collects the read-only
// blobs laid out after the code. Every blob is the home of exactly one named value, so
// two literals with the same bytes still get separate blobs.

//! Frame, static segment and code-segment storage.

use crate::core::{ConstId, FrameId, StackSlot, WORD_SIZE};
use thiserror::Error;

fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// Why a frame slot could not be handed out.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame {0} does not exist")]
    UnknownFrame(u32),
    #[error("frame {0} would grow past {max} bytes", max = u32::MAX)]
    TooLarge(u32),
}

/// Growing sizes of all function frames in a module.
#[derive(Debug, Clone, Default)]
pub struct Frames {
    sizes: Vec<u32>,
}

impl Frames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a frame whose first `initial` bytes (header and parameters) are taken.
    pub fn new_frame(&mut self, initial: u32) -> FrameId {
        let id = FrameId(self.sizes.len() as u32);
        self.sizes.push(align_up(initial as u64, WORD_SIZE) as u32);
        id
    }

    pub fn size(&self, frame: FrameId) -> Option<u32> {
        self.sizes.get(frame.0 as usize).copied()
    }

    /// Allocate a new spill slot and return it. Slots are 8-byte aligned.
    pub fn allocate_spill_slot(&mut self, frame: FrameId, size: u64) -> Result<StackSlot, FrameError> {
        let current = self
            .sizes
            .get_mut(frame.0 as usize)
            .ok_or(FrameError::UnknownFrame(frame.0))?;
        let offset = *current;
        let end = size
            .max(1)
            .checked_next_multiple_of(WORD_SIZE)
            .and_then(|padded| padded.checked_add(offset as u64))
            .and_then(|end| u32::try_from(end).ok())
            .ok_or(FrameError::TooLarge(frame.0))?;
        *current = end;
        Ok(StackSlot::frame(frame, offset))
    }

    /// Final sizes, indexed by frame id.
    pub fn into_sizes(self) -> Vec<u32> {
        self.sizes
    }

    pub fn sizes(&self) -> &[u32] {
        &self.sizes
    }
}

/// Process-wide static area at the base of the VM stack.
#[derive(Debug, Clone, Default)]
pub struct StaticSegment {
    size: u64,
}

impl StaticSegment {
    /// Reserve `size` bytes with natural alignment (capped at a word).
    pub fn allocate(&mut self, size: u64, align: u64) -> u64 {
        let offset = align_up(self.size, align.clamp(1, WORD_SIZE));
        self.size = offset + size.max(1);
        offset
    }

    pub fn size(&self) -> u64 {
        align_up(self.size, WORD_SIZE)
    }
}

/// Read-only blobs appended after the code.
#[derive(Debug, Default)]
pub struct ConstantPool<'s> {
    blobs: Vec<&'s [u8]>,
}

impl<'s> ConstantPool<'s> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a blob that is never shared with another home.
    pub fn push_unique(&mut self, bytes: &'s [u8]) -> ConstId {
        let id = ConstId(self.blobs.len() as u32);
        self.blobs.push(bytes);
        id
    }

    pub fn get(&self, id: ConstId) -> Option<&'s [u8]> {
        self.blobs.get(id.0 as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Blobs in layout order.
    pub fn blobs(&self) -> Vec<(ConstId, &'s [u8])> {
        self.blobs
            .iter()
            .enumerate()
            .map(|(i, bytes)| (ConstId(i as u32), *bytes))
            .collect()
    }
}
