//! Growable output buffer with an append cursor
//!
//! Objects are appended at the cursor; fields are patched in place
//! once their values are known. All access is bounds checked.

use crate::image::{round_up, DUMP_ALIGNMENT};

use super::error::DumpError;

#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current write position
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Current write position as an image offset
    pub fn offset(&self) -> Result<u32, DumpError> {
        to_offset(self.position())
    }

    /// Zero-pad to the next multiple of `alignment`
    pub fn align(&mut self, alignment: usize) {
        let target = round_up(self.buf.len(), alignment);
        self.buf.resize(target, 0);
    }

    /// Append `size` zeroed bytes at an aligned position and return
    /// where they start
    pub fn reserve(&mut self, size: usize) -> Result<usize, DumpError> {
        self.align(DUMP_ALIGNMENT);
        let start = self.buf.len();
        let end = start
            .checked_add(size)
            .ok_or(DumpError::ImageTooLarge(u64::MAX))?;
        to_offset(end)?;
        self.buf.resize(end, 0);
        Ok(start)
    }

    /// Append bytes at an aligned position and return where they start
    pub fn append(&mut self, bytes: &[u8]) -> Result<usize, DumpError> {
        let start = self.reserve(bytes.len())?;
        self.buf[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(start)
    }

    pub fn put_u64(&mut self, at: usize, value: u64) -> Result<(), DumpError> {
        self.put_bytes(at, &value.to_le_bytes())
    }

    pub fn put_bytes(&mut self, at: usize, bytes: &[u8]) -> Result<(), DumpError> {
        let end = at.checked_add(bytes.len());
        match end.and_then(|end| self.buf.get_mut(at..end)) {
            Some(dst) => {
                dst.copy_from_slice(bytes);
                Ok(())
            }
            None => Err(DumpError::Internal(format!(
                "write of {} bytes at {:#x} beyond cursor {:#x}",
                bytes.len(),
                at,
                self.buf.len()
            ))),
        }
    }

    pub fn get_u64(&self, at: usize) -> Option<u64> {
        let bytes = self.buf.get(at..at.checked_add(8)?)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(bytes);
        Some(u64::from_le_bytes(word))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Convert a buffer position to a 32 bit image offset
pub fn to_offset(position: usize) -> Result<u32, DumpError> {
    u32::try_from(position).map_err(|_| DumpError::ImageTooLarge(position as u64))
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    pub fn test_reserve_aligns() {
        let mut enc = Encoder::new();
        enc.append(&[1, 2, 3]).unwrap();
        assert_eq!(enc.position(), 3);
        let at = enc.reserve(16).unwrap();
        assert_eq!(at, 8);
        assert_eq!(enc.position(), 24);
        assert_eq!(&enc.as_bytes()[3..8], &[0; 5]);
    }

    #[test]
    pub fn test_patch_in_bounds_only() {
        let mut enc = Encoder::new();
        let at = enc.reserve(8).unwrap();
        enc.put_u64(at, 0x0102030405060708).unwrap();
        assert_eq!(enc.get_u64(at), Some(0x0102030405060708));
        assert!(enc.put_u64(4, 1).is_err());
        assert!(enc.put_u64(usize::MAX - 2, 1).is_err());
    }

    #[test]
    pub fn test_align_to_page() {
        let mut enc = Encoder::new();
        enc.reserve(10).unwrap();
        enc.align(4096);
        assert_eq!(enc.position(), 4096);
        enc.align(4096);
        assert_eq!(enc.position(), 4096);
    }
}
