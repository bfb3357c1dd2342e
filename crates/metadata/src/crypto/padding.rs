//! Size-bucket padding for block payloads.
//!
//! ```text
//! [ len: u32 LE ][ payload: len bytes ][ random filler ]
//! ```
//!
//! The payload plus filler is rounded up to the next power of two (at least
//! [`MIN_PADDED_BLOCK_SIZE`]), so a ciphertext's length reveals only its
//! bucket.

use rand::RngCore;

use super::CryptoError;

/// Length prefix size in bytes
pub const PAD_PREFIX_SIZE: usize = 4;
/// Smallest padded payload size (excluding the prefix)
pub const MIN_PADDED_BLOCK_SIZE: usize = 256;

fn padded_len(n: usize) -> usize {
    n.max(MIN_PADDED_BLOCK_SIZE).next_power_of_two()
}

/// Pad `block` into its size bucket
pub fn pad_block(block: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let len = u32::try_from(block.len())
        .map_err(|_| anyhow::anyhow!("block too large to pad: {} bytes", block.len()))?;
    let total = padded_len(block.len());

    let mut buf = vec![0u8; PAD_PREFIX_SIZE + total];
    buf[..PAD_PREFIX_SIZE].copy_from_slice(&len.to_le_bytes());
    buf[PAD_PREFIX_SIZE..PAD_PREFIX_SIZE + block.len()].copy_from_slice(block);
    rand::rng().fill_bytes(&mut buf[PAD_PREFIX_SIZE + block.len()..]);
    Ok(buf)
}

/// Strip padding added by [`pad_block`]
pub fn depad_block(padded: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if padded.len() < PAD_PREFIX_SIZE {
        return Err(CryptoError::PaddedBlockRead {
            actual: padded.len(),
            expected: PAD_PREFIX_SIZE,
        });
    }
    let mut prefix = [0u8; PAD_PREFIX_SIZE];
    prefix.copy_from_slice(&padded[..PAD_PREFIX_SIZE]);
    let block_len = u32::from_le_bytes(prefix) as usize;
    let end = PAD_PREFIX_SIZE + block_len;
    if padded.len() < end {
        return Err(CryptoError::PaddedBlockRead {
            actual: padded.len(),
            expected: end,
        });
    }
    Ok(padded[PAD_PREFIX_SIZE..end].to_vec())
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_padding_buckets() {
        assert_eq!(pad_block(b"").unwrap().len(), PAD_PREFIX_SIZE + 256);
        assert_eq!(pad_block(&[1u8; 256]).unwrap().len(), PAD_PREFIX_SIZE + 256);
        assert_eq!(pad_block(&[1u8; 257]).unwrap().len(), PAD_PREFIX_SIZE + 512);
        assert_eq!(pad_block(&[1u8; 4000]).unwrap().len(), PAD_PREFIX_SIZE + 4096);
    }

    #[test]
    fn test_depad_short_input() {
        assert!(matches!(
            depad_block(&[1, 0]),
            Err(CryptoError::PaddedBlockRead {
                actual: 2,
                expected: PAD_PREFIX_SIZE
            })
        ));

        // prefix claims more bytes than are present
        let mut padded = pad_block(b"abc").unwrap();
        padded[..PAD_PREFIX_SIZE].copy_from_slice(&10_000u32.to_le_bytes());
        assert!(matches!(
            depad_block(&padded),
            Err(CryptoError::PaddedBlockRead { .. })
        ));
    }

    proptest! {
        #[test]
        fn pad_depad_round_trip(data in proptest::collection::vec(any::<u8>(), 0..=5000)) {
            let padded = pad_block(&data).unwrap();
            prop_assert_eq!(
                padded.len(),
                PAD_PREFIX_SIZE + data.len().max(MIN_PADDED_BLOCK_SIZE).next_power_of_two()
            );
            prop_assert_eq!(depad_block(&padded).unwrap(), data);
        }
    }
}
