//! Core types for poolmux.
//!
//! Re-exports the rust-bitcoin types used across job sources and defines the
//! few mining-specific helpers shared by both protocol families.

pub use bitcoin::block::Version;
pub use bitcoin::{BlockHash, CompactTarget, Target, TxMerkleNode};

use bitcoin::hashes::Hash;

mod difficulty;

pub use difficulty::Difficulty;

/// Decode a 32-byte hash transmitted as eight byte-swapped 32-bit words.
///
/// Both getwork header data and Stratum v1 `prevhash` fields use this layout:
/// each 4-byte word is little-endian internally but serialized big-endian.
/// Reversing the bytes of every word yields Bitcoin's internal byte order.
pub fn block_hash_from_swapped_words(bytes: &[u8]) -> Result<BlockHash, String> {
    if bytes.len() != 32 {
        return Err(format!("block hash wrong length: {}", bytes.len()));
    }

    let mut internal = [0u8; 32];
    internal.copy_from_slice(bytes);
    for chunk in internal.chunks_mut(4) {
        chunk.reverse();
    }

    Ok(BlockHash::from_byte_array(internal))
}

/// Parse a target sent as 64 hex characters in little-endian byte order.
pub fn target_from_le_hex(hex_str: &str) -> Result<Target, String> {
    let bytes = hex::decode(hex_str).map_err(|e| format!("target hex: {}", e))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("target wrong length: {}", b.len()))?;
    Ok(Target::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swapped_words_match_display_order() {
        let raw = hex::decode("6b6455fd6db962c101f2d4fc0d67f4a3bc96391d000152960000000000000000")
            .unwrap();
        let hash = block_hash_from_swapped_words(&raw).unwrap();

        assert_eq!(&hash.as_byte_array()[0..4], &[0xfd, 0x55, 0x64, 0x6b]);
        assert_eq!(
            hash.to_string(),
            "000000000000000000015296bc96391d0d67f4a301f2d4fc6db962c16b6455fd"
        );
    }

    #[test]
    fn test_swapped_words_rejects_short_input() {
        assert!(block_hash_from_swapped_words(&[0u8; 31]).is_err());
    }

    #[test]
    fn test_target_from_le_hex() {
        let mut le = [0u8; 32];
        le[28] = 0xff;
        le[29] = 0xff;
        let target = target_from_le_hex(&hex::encode(le)).unwrap();
        assert_eq!(target, Target::from_le_bytes(le));

        assert!(target_from_le_hex("abcd").is_err());
        assert!(target_from_le_hex("zz").is_err());
    }
}
