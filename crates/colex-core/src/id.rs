use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Length in bytes of a silo's unique ID.
pub const ID_BYTES: usize = 4;

/// Unique identifier for a silo: 4 cryptographically random bytes,
/// rendered as 8 lowercase hex characters everywhere user-visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiloId([u8; ID_BYTES]);

impl SiloId {
    /// Generate a fresh random ID from the OS entropy source.
    pub fn generate() -> Self {
        let mut buf = [0u8; ID_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut buf);
        SiloId(buf)
    }

    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        SiloId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// The canonical 8-character lowercase hex rendering.
    pub fn hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for SiloId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_is_eight_lowercase_chars() {
        let id = SiloId::from_bytes([0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(id.hex(), "deadbeef");
        assert_eq!(id.hex().len(), 8);
    }

    #[test]
    fn test_display_matches_hex() {
        let id = SiloId::from_bytes([0x00, 0x01, 0xa0, 0xff]);
        assert_eq!(format!("{}", id), "0001a0ff");
        assert_eq!(format!("{}", id), id.hex());
    }

    #[test]
    fn test_generate_produces_distinct_ids() {
        // Collision probability over 32 bits in 16 draws is negligible.
        let ids: Vec<String> = (0..16).map(|_| SiloId::generate().hex()).collect();
        let mut dedup = ids.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(ids.len(), dedup.len());
    }
}
