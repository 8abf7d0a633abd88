//! BattlEye identity derivation
//!
//! Converts a 64-bit Steam ID into the BattlEye identifier ("BUID") the
//! RCon side of the world reports, so pushed player samples and polled
//! player samples can be joined on one label.

use md5::{Digest, Md5};

/// Derive the BattlEye identifier for a Steam ID.
///
/// The recipe is fixed by the BattlEye client: a `BE` discriminator
/// followed by the little-endian bytes of the id, digested with MD5 and
/// rendered as lowercase hex.
pub fn battleye_derive(steam_id: i64) -> String {
    let mut hasher = Md5::new();
    hasher.update(b"BE");
    hasher.update(steam_id.to_le_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_shape() {
        let buid = battleye_derive(76561198000000000);
        assert_eq!(buid.len(), 32);
        assert!(buid.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(buid, buid.to_lowercase());
    }

    #[test]
    fn test_derivation_is_deterministic() {
        assert_eq!(
            battleye_derive(76561198000000000),
            battleye_derive(76561198000000000)
        );
    }

    #[test]
    fn test_distinct_ids_diverge() {
        assert_ne!(
            battleye_derive(76561198000000000),
            battleye_derive(76561198000000001)
        );
    }
}
