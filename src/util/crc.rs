//! CRC32 checksum utilities.

use crc32fast::Hasher;

const MASK_DELTA: u32 = 0xa282_ead8;

/// Compute the CRC32 checksum of the given data.
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Compute the CRC32 checksum over a sequence of slices.
pub fn crc32_multi(slices: &[&[u8]]) -> u32 {
    let mut hasher = Hasher::new();
    for slice in slices {
        hasher.update(slice);
    }
    hasher.finalize()
}

/// Mask a CRC value for storage.
///
/// Stored checksums are masked so that a run of zero bytes (or a stored
/// CRC embedded in later-checksummed data) cannot accidentally form a
/// valid checksum.
pub fn mask_crc(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

/// Undo [`mask_crc`].
pub fn unmask_crc(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(MASK_DELTA);
    (rot >> 17) | (rot << 15)
}

/// Verify that data matches a stored masked CRC.
pub fn verify_masked_crc(data: &[u8], masked: u32) -> bool {
    crc32(data) == unmask_crc(masked)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_stability() {
        let data = b"hello world";
        let crc = crc32(data);
        assert_ne!(crc, 0);
        assert_eq!(crc32(data), crc);
        assert_ne!(crc32(b"hello"), crc32(b"world"));
    }

    #[test]
    fn test_crc32_multi_matches_concat() {
        assert_eq!(crc32(b"hello world"), crc32_multi(&[b"hello ", b"world"]));
        assert_eq!(crc32(b""), crc32_multi(&[]));
    }

    #[test]
    fn test_mask_unmask() {
        for &crc in &[0u32, 1, 0x1234_5678, u32::MAX] {
            let masked = mask_crc(crc);
            assert_ne!(masked, crc);
            assert_eq!(unmask_crc(masked), crc);
        }
    }

    #[test]
    fn test_zero_is_not_its_own_mask() {
        // A zero-filled header must not look like a valid checksum of
        // zero-filled payload.
        assert_ne!(mask_crc(crc32(&[0u8; 16])), 0);
    }

    #[test]
    fn test_verify_masked_crc() {
        let data = b"test data";
        let masked = mask_crc(crc32(data));

        assert!(verify_masked_crc(data, masked));
        assert!(!verify_masked_crc(data, masked ^ 1));
        assert!(!verify_masked_crc(b"other data", masked));
    }
}
