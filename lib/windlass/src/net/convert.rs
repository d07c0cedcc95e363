//! Big-endian integer conversions for the wire format. The represented form
//! is independent of host endianness.

use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, ByteOrder};

/// Encodes `value` as 8 big-endian bytes.
#[inline]
pub fn u64_to_bytes(value: u64) -> [u8; 8] {
    let mut buffer = [0u8; 8];
    BigEndian::write_u64(&mut buffer, value);
    buffer
}

/// Decodes 8 big-endian bytes from the front of `bytes`.
#[inline]
pub fn u64_from_bytes(bytes: &[u8]) -> NetworkResult<u64> {
    if bytes.len() < 8 {
        return Err(NetworkError::Fatal(ErrorType::Truncated));
    }

    Ok(BigEndian::read_u64(bytes))
}

/// Encodes `value` as 2 big-endian bytes.
#[inline]
pub fn u16_to_bytes(value: u16) -> [u8; 2] {
    let mut buffer = [0u8; 2];
    BigEndian::write_u16(&mut buffer, value);
    buffer
}

/// Decodes 2 big-endian bytes from the front of `bytes`.
#[inline]
pub fn u16_from_bytes(bytes: &[u8]) -> NetworkResult<u16> {
    if bytes.len() < 2 {
        return Err(NetworkError::Fatal(ErrorType::Truncated));
    }

    Ok(BigEndian::read_u16(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u64_layout_is_big_endian() {
        let bytes = u64_to_bytes(0x0102_0304_0506_0708);

        assert_eq!(bytes, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_u64_roundtrip() {
        for &value in &[0u64, 1, 1023, 1024 * 1024, u64::max_value()] {
            assert_eq!(u64_from_bytes(&u64_to_bytes(value)).unwrap(), value);
        }
    }

    #[test]
    fn test_u64_ignores_trailing_bytes() {
        let mut buffer = u64_to_bytes(42).to_vec();
        buffer.extend_from_slice(&[0xFF; 4]);

        assert_eq!(u64_from_bytes(&buffer).unwrap(), 42);
    }

    #[test]
    fn test_u64_short_input() {
        assert_eq!(
            u64_from_bytes(&[0; 7]),
            Err(NetworkError::Fatal(ErrorType::Truncated))
        );
    }

    #[test]
    fn test_u16_layout_is_big_endian() {
        assert_eq!(u16_to_bytes(0xABCD), [0xAB, 0xCD]);
    }

    #[test]
    fn test_u16_roundtrip() {
        for &value in &[0u16, 1, 1024, u16::max_value()] {
            assert_eq!(u16_from_bytes(&u16_to_bytes(value)).unwrap(), value);
        }
    }

    #[test]
    fn test_u16_short_input() {
        assert_eq!(
            u16_from_bytes(&[7]),
            Err(NetworkError::Fatal(ErrorType::Truncated))
        );
    }
}
