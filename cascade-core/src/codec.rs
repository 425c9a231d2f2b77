//! Fixed-width big-endian integer packing, used for frame and packet length prefixes.

/// Pack `value` into exactly `width` big-endian bytes, zero-padded on the left.
pub fn pack_value(width: usize, value: u64) -> Result<Vec<u8>, CodecError> {
    if width < 8 && value >> (width * 8) != 0 {
        return Err(CodecError::ValueTooLarge { width, value });
    }
    let mut out = vec![0u8; width];
    for (i, byte) in out.iter_mut().rev().enumerate().take(8) {
        *byte = (value >> (i * 8)) as u8;
    }
    Ok(out)
}

/// Interpret `bytes` as a big-endian unsigned integer.
/// Every integer field on the wire fits a u64; wider input is rejected.
pub fn unpack_value(bytes: &[u8]) -> Result<u64, CodecError> {
    if bytes.len() > 8 {
        return Err(CodecError::InputTooLong { len: bytes.len() });
    }
    let mut val = 0u64;
    for &byte in bytes {
        val = (val << 8) | u64::from(byte);
    }
    Ok(val)
}

/// Error packing or unpacking a fixed-width integer.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("value {value} does not fit in {width} bytes")]
    ValueTooLarge { width: usize, value: u64 },
    #[error("input of {len} bytes exceeds 64-bit range")]
    InputTooLong { len: usize },
}
