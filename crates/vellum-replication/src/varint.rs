//! Variable-length signed integers.
//!
//! Each byte carries 7 data bits; the high bit marks continuation. The
//! last byte carries 6 data bits and a sign bit (0x40). Negative values
//! are stored as `-(v + 1)` so that small magnitudes of either sign fit in
//! one byte.

use bytes::BufMut;

use crate::error::{ParseError, ParseResult};

/// Longest encoding of a 64-bit value.
pub const MAX_ENC_BYTES_PER_INT: usize = 10;

const CONTINUATION: u8 = 0x80;
const SIGN: u8 = 0x40;

/// Appends the encoding of `value` to `out`.
pub fn encode_int(out: &mut impl BufMut, value: i64) {
    let negative = value < 0;
    // !v == -(v + 1) without overflow at i64::MIN
    let mut v = if negative { !value as u64 } else { value as u64 };
    while v >> 6 != 0 {
        out.put_u8(CONTINUATION | (v & 0x7F) as u8);
        v >>= 7;
    }
    out.put_u8(if negative { SIGN | v as u8 } else { v as u8 });
}

/// Number of bytes `encode_int` writes for `value`.
#[must_use]
pub fn encoded_len(value: i64) -> usize {
    let mut v = if value < 0 { !value as u64 } else { value as u64 };
    let mut n = 1;
    while v >> 6 != 0 {
        v >>= 7;
        n += 1;
    }
    n
}

/// Decodes one integer from the front of `input`, returning the value and
/// the number of bytes consumed.
pub fn decode_int(input: &[u8]) -> ParseResult<(i64, usize)> {
    let mut acc: u128 = 0;
    let mut shift = 0u32;
    for (i, &b) in input.iter().enumerate() {
        if i >= MAX_ENC_BYTES_PER_INT {
            return Err(ParseError::BadVarint { offset: i });
        }
        if b & CONTINUATION != 0 {
            acc |= u128::from(b & 0x7F) << shift;
            shift += 7;
            continue;
        }
        acc |= u128::from(b & 0x3F) << shift;
        if acc > i64::MAX as u128 {
            return Err(ParseError::BadVarint { offset: i });
        }
        let v = acc as i64;
        let value = if b & SIGN != 0 { !v } else { v };
        return Ok((value, i + 1));
    }
    Err(ParseError::UnexpectedEnd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn roundtrip(v: i64) -> usize {
        let mut buf = Vec::new();
        encode_int(&mut buf, v);
        assert_eq!(buf.len(), encoded_len(v));
        let (decoded, used) = decode_int(&buf).unwrap();
        assert_eq!(decoded, v);
        assert_eq!(used, buf.len());
        used
    }

    #[test]
    fn test_boundary_values() {
        assert_eq!(roundtrip(0), 1);
        assert_eq!(roundtrip(1), 1);
        assert_eq!(roundtrip(-1), 1);
        assert_eq!(roundtrip(63), 1);
        assert_eq!(roundtrip(-64), 1);
        assert_eq!(roundtrip(64), 2);
        assert_eq!(roundtrip(i64::MAX), MAX_ENC_BYTES_PER_INT);
        assert_eq!(roundtrip(i64::MIN), MAX_ENC_BYTES_PER_INT);
    }

    #[test]
    fn test_random_values() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..1000 {
            let bits = rng.gen_range(0..64);
            let v: i64 = rng.gen::<i64>() >> bits;
            roundtrip(v);
        }
    }

    #[test]
    fn test_malformed_input() {
        assert_eq!(decode_int(&[]), Err(ParseError::UnexpectedEnd));
        assert_eq!(decode_int(&[0x80, 0x80]), Err(ParseError::UnexpectedEnd));
        assert!(matches!(
            decode_int(&[0xFF; 11]),
            Err(ParseError::BadVarint { .. })
        ));
        // 2^63 does not fit
        let mut too_big = vec![0x80; 9];
        too_big.push(0x01);
        assert!(matches!(
            decode_int(&too_big),
            Err(ParseError::BadVarint { .. })
        ));
    }
}
