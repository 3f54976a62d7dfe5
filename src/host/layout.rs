//! Direct reads of string payloads from object memory.
//!
//! Runtimes report where a string keeps its character count and its first
//! character relative to the object start; with that layout the agent can
//! read a payload without a callback per allocation.

use super::traits::ObjectAddress;

/// Field offsets of the runtime's string type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct StringLayout {
    /// Offset of the 32-bit character count.
    pub length_offset: u32,
    /// Offset of the first character.
    pub buffer_offset: u32,
    /// Bytes per character (2 for UTF-16 runtimes).
    pub char_width: u32,
}

impl StringLayout {
    /// Layout of a 64-bit runtime with a header word, method table pointer,
    /// length and inline UTF-16 buffer.
    pub const UTF16_X64: Self = Self {
        length_offset: 8,
        buffer_offset: 12,
        char_width: 2,
    };

    /// Check the layout is usable at all.
    pub fn is_valid(&self) -> bool {
        self.char_width > 0 && self.buffer_offset >= self.length_offset.saturating_add(4)
    }

    /// Payload bytes of the string at `object`.
    ///
    /// # Safety
    ///
    /// `object` must be the address of a live string object with this layout,
    /// and the collector must not move or free it during `'a`.
    pub unsafe fn contents<'a>(&self, object: ObjectAddress) -> Option<&'a [u8]> {
        if object.is_null() || !self.is_valid() {
            return None;
        }

        let base = object.get() as *const u8;
        let chars = std::ptr::read_unaligned(base.add(self.length_offset as usize) as *const u32);
        let len = (chars as usize).checked_mul(self.char_width as usize)?;
        Some(std::slice::from_raw_parts(
            base.add(self.buffer_offset as usize),
            len,
        ))
    }
}
