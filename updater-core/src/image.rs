//! Cortex-M vector table sanity check applied when an image is finalized.
//!
//! The first two words of a bootable image are the initial stack pointer and
//! the reset handler. Anything that fails these checks would fault on the first
//! instruction, so it is rejected before the partition can be activated.

use core::fmt;

/// Bytes of the vector table inspected by [`ImageCheck`].
pub const VECTOR_HEADER_LEN: usize = 8;

/// Half-open address range `[start, end)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AddressRange {
    pub start: u32,
    pub end: u32,
}

impl AddressRange {
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub const fn contains(&self, address: u32) -> bool {
        address >= self.start && address < self.end
    }
}

/// Reason an image header was rejected.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ImageCheckError {
    /// Fewer than [`VECTOR_HEADER_LEN`] bytes were written.
    Truncated,
    StackPointerOutOfRange(u32),
    ResetVectorOutOfRange(u32),
    /// Reset handler address lacks the Thumb bit.
    ResetVectorNotThumb(u32),
}

impl fmt::Display for ImageCheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageCheckError::Truncated => f.write_str("vector table truncated"),
            ImageCheckError::StackPointerOutOfRange(sp) => {
                write!(f, "initial stack pointer {sp:#010x} outside RAM")
            }
            ImageCheckError::ResetVectorOutOfRange(rv) => {
                write!(f, "reset vector {rv:#010x} outside image")
            }
            ImageCheckError::ResetVectorNotThumb(rv) => {
                write!(f, "reset vector {rv:#010x} is not a Thumb address")
            }
        }
    }
}

/// Platform header check run by the partition table when finalizing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ImageCheck {
    /// RAM window; the initial stack pointer may sit at its very end.
    pub ram: AddressRange,
    /// Address range the image executes from once activated.
    pub exec: AddressRange,
}

impl ImageCheck {
    pub const fn new(ram: AddressRange, exec: AddressRange) -> Self {
        Self { ram, exec }
    }

    /// Validates the leading vector table words of `header`.
    pub fn check(&self, header: &[u8]) -> Result<(), ImageCheckError> {
        let (Some(sp), Some(rv)) = (read_word(header, 0), read_word(header, 4)) else {
            return Err(ImageCheckError::Truncated);
        };

        if sp <= self.ram.start || sp > self.ram.end {
            return Err(ImageCheckError::StackPointerOutOfRange(sp));
        }
        if rv & 1 == 0 {
            return Err(ImageCheckError::ResetVectorNotThumb(rv));
        }
        if !self.exec.contains(rv & !1) {
            return Err(ImageCheckError::ResetVectorOutOfRange(rv));
        }
        Ok(())
    }
}

fn read_word(bytes: &[u8], offset: usize) -> Option<u32> {
    let word = bytes.get(offset..offset + 4)?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(word);
    Some(u32::from_le_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECK: ImageCheck = ImageCheck::new(
        AddressRange::new(0x2000_0000, 0x2002_4000),
        AddressRange::new(0x0800_0000, 0x0804_0000),
    );

    fn header(sp: u32, rv: u32) -> [u8; VECTOR_HEADER_LEN] {
        let mut bytes = [0u8; VECTOR_HEADER_LEN];
        bytes[..4].copy_from_slice(&sp.to_le_bytes());
        bytes[4..].copy_from_slice(&rv.to_le_bytes());
        bytes
    }

    #[test]
    fn accepts_stack_at_top_of_ram() {
        assert_eq!(CHECK.check(&header(0x2002_4000, 0x0800_00C1)), Ok(()));
    }

    #[test]
    fn rejects_erased_flash() {
        assert_eq!(
            CHECK.check(&[0xFF; VECTOR_HEADER_LEN]),
            Err(ImageCheckError::StackPointerOutOfRange(0xFFFF_FFFF))
        );
    }

    #[test]
    fn rejects_arm_mode_reset_vector() {
        assert_eq!(
            CHECK.check(&header(0x2000_8000, 0x0800_00C0)),
            Err(ImageCheckError::ResetVectorNotThumb(0x0800_00C0))
        );
    }

    #[test]
    fn rejects_reset_vector_outside_image() {
        assert_eq!(
            CHECK.check(&header(0x2000_8000, 0x0900_0001)),
            Err(ImageCheckError::ResetVectorOutOfRange(0x0900_0001))
        );
    }

    #[test]
    fn short_header_is_truncated() {
        assert_eq!(CHECK.check(&[0u8; 6]), Err(ImageCheckError::Truncated));
    }
}
