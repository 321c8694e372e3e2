//! Build fingerprint
//!
//! An image is only usable by the exact build that produced it. The
//! fingerprint is a SHA-256 over everything that determines the binary
//! layout: this crate's version and format version, the target's word
//! size and endianness, and an identity supplied by the host describing
//! its static storage.

use std::fmt;

use sha2::{Digest, Sha256};

use super::FORMAT_VERSION;

pub const FINGERPRINT_LEN: usize = 32;

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// Fingerprint of this build combined with the host identity
    pub fn of_build(host_identity: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(env!("CARGO_PKG_NAME").as_bytes());
        hasher.update(env!("CARGO_PKG_VERSION").as_bytes());
        hasher.update(FORMAT_VERSION.to_le_bytes());
        hasher.update((usize::BITS as u8).to_le_bytes());
        hasher.update([cfg!(target_endian = "little") as u8]);
        hasher.update(host_identity);
        Fingerprint(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Fingerprint(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    pub fn test_fingerprint_depends_on_host_identity() {
        let a = Fingerprint::of_build(b"host-a");
        let b = Fingerprint::of_build(b"host-b");
        assert_ne!(a, b);
        assert_eq!(a, Fingerprint::of_build(b"host-a"));
    }

    #[test]
    pub fn test_hex() {
        let fp = Fingerprint::from_bytes([0xab; FINGERPRINT_LEN]);
        assert_eq!(fp.to_hex().len(), 64);
        assert!(fp.to_hex().starts_with("abab"));
    }
}
