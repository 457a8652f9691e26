//! Byte-level helpers shared by the codec and security layers.

use crate::error::{KnxError, Result};

/// Parse an unsigned big-endian integer from 1 to 6 bytes.
///
/// Used for the 48-bit sequence numbers of KNX Data Secure and the
/// KNXnet/IP secure wrapper.
///
/// # Errors
///
/// Returns `KnxError::Argument` if `bytes` is empty or longer than 6 bytes.
pub fn unsigned_be(bytes: &[u8]) -> Result<u64> {
    if bytes.is_empty() || bytes.len() > 6 {
        return Err(KnxError::length_out_of_range());
    }
    let mut value = 0u64;
    for &b in bytes {
        value = (value << 8) | u64::from(b);
    }
    Ok(value)
}

/// Emit a 48-bit unsigned integer as 6 big-endian bytes.
///
/// # Errors
///
/// Returns `KnxError::Argument` if `value` does not fit in 48 bits.
pub fn six_bytes(value: u64) -> Result<[u8; 6]> {
    if value > 0xFFFF_FFFF_FFFF {
        return Err(KnxError::value_out_of_range());
    }
    let b = value.to_be_bytes();
    Ok([b[2], b[3], b[4], b[5], b[6], b[7]])
}

/// Format a byte slice as contiguous lowercase hex for log lines.
pub(crate) fn hex_str(bytes: &[u8]) -> String {
    use core::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_be_widths() {
        assert_eq!(unsigned_be(&[0x01]).unwrap(), 1);
        assert_eq!(unsigned_be(&[0x01, 0x00]).unwrap(), 256);
        assert_eq!(
            unsigned_be(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]).unwrap(),
            0xFFFF_FFFF_FFFF
        );
    }

    #[test]
    fn unsigned_be_rejects_bad_lengths() {
        assert!(unsigned_be(&[]).is_err());
        assert!(unsigned_be(&[0; 7]).is_err());
    }

    #[test]
    fn six_bytes_roundtrip() {
        let v = 0x0102_0304_0506u64;
        let b = six_bytes(v).unwrap();
        assert_eq!(b, [1, 2, 3, 4, 5, 6]);
        assert_eq!(unsigned_be(&b).unwrap(), v);
    }

    #[test]
    fn six_bytes_rejects_overflow() {
        assert!(six_bytes(0x1_0000_0000_0000).is_err());
        assert!(six_bytes(0xFFFF_FFFF_FFFF).is_ok());
    }

    #[test]
    fn hex_formatting() {
        assert_eq!(hex_str(&[0xBC, 0xE0, 0x00]), "bce000");
    }
}
