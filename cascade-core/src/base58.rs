//! Base58 rendering (Bitcoin alphabet) for timestamps and identifiers.
//!
//! Integers are encoded through their minimal big-endian byte form, so zero
//! renders as `"1"` and every non-negative value round-trips exactly.

/// Encode a u64 as base58 text.
pub fn to_base58(value: u64) -> String {
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(7);
    bs58::encode(&bytes[first..]).into_string()
}

/// Decode base58 text into a u64.
pub fn from_base58(text: &str) -> Result<u64, Base58Error> {
    let bytes = bs58::decode(text)
        .into_vec()
        .map_err(Base58Error::InvalidCharacter)?;
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    let significant = &bytes[first..];
    if significant.len() > 8 {
        return Err(Base58Error::Overflow);
    }
    let mut val = 0u64;
    for &byte in significant {
        val = (val << 8) | u64::from(byte);
    }
    Ok(val)
}

/// Error decoding base58 text.
#[derive(Debug, thiserror::Error)]
pub enum Base58Error {
    #[error("invalid base58 character: {0}")]
    InvalidCharacter(bs58::decode::Error),
    #[error("value does not fit in 64 bits")]
    Overflow,
    #[error("expected a {expected}-byte value, got {actual} bytes")]
    BadLength { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_renders_as_one() {
        assert_eq!(to_base58(0), "1");
        assert_eq!(from_base58("1").unwrap(), 0);
    }

    #[test]
    fn known_values() {
        assert_eq!(to_base58(1), "2");
        assert_eq!(to_base58(57), "z");
        assert_eq!(to_base58(58), "21");
    }

    #[test]
    fn roundtrip() {
        for v in [0u64, 1, 57, 58, 255, 3364, 1_468_000_000, u64::MAX] {
            assert_eq!(from_base58(&to_base58(v)).unwrap(), v, "value {v}");
        }
    }

    #[test]
    fn rejects_excluded_characters() {
        for bad in ["0", "O", "I", "l", "4O4"] {
            assert!(
                matches!(from_base58(bad), Err(Base58Error::InvalidCharacter(_))),
                "input {bad:?}"
            );
        }
    }

    #[test]
    fn empty_input_is_zero() {
        assert_eq!(from_base58("").unwrap(), 0);
    }

    #[test]
    fn oversized_value_rejected() {
        // 2^64 encoded by hand: one byte past u64 range.
        let over = bs58::encode([1u8, 0, 0, 0, 0, 0, 0, 0, 0]).into_string();
        assert!(matches!(from_base58(&over), Err(Base58Error::Overflow)));
    }
}
