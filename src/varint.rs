//! Variable-length integer codecs.
//!
//! Two encodings are used by the pair codecs:
//!
//! - **VByte**: a header byte packs the encoded length (3 bits) and the low
//!   5 value bits; the remaining bytes follow little-endian. Values up to
//!   61 bits, 1 to 8 bytes.
//! - **VLQ**: 7-bit groups, least significant first, continuation bit set on
//!   every byte except the last. The clear high bit on the final byte is what
//!   makes binary search over raw compressed bytes possible: the start of the
//!   next value is found by skipping bytes whose high bit is set.

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};

/// Largest value representable in the VByte encoding (61 bits).
pub const MAX_VBYTE: u64 = (32u64 << 56) - 1;

/// Number of bytes the VByte encoding of `value` takes.
///
/// Returns 9 for values beyond [`MAX_VBYTE`], which never win a size
/// comparison against the VLQ encoding.
pub fn vbyte_len(value: u64) -> usize {
    let mut max = 32u64;
    for i in 1..8 {
        if value < max {
            return i;
        }
        max <<= 8;
    }
    if value <= MAX_VBYTE {
        8
    } else {
        9
    }
}

/// Number of bytes the VLQ encoding of `value` takes (1 to 10).
pub fn vlq_len(value: u64) -> usize {
    let mut n = value;
    let mut len = 0;
    loop {
        n >>= 7;
        len += 1;
        if n == 0 {
            return len;
        }
    }
}

/// Appends the VByte encoding of `value` to `buf`.
pub fn put_vbyte(buf: &mut BytesMut, value: u64) -> Result<()> {
    let nbytes = vbyte_len(value);
    if nbytes > 8 {
        return Err(Error::invalid_argument(format!(
            "value {} does not fit the VByte encoding",
            value
        )));
    }
    buf.put_u8((((nbytes - 1) as u8) << 5) | (value & 31) as u8);
    let mut rest = value >> 5;
    for _ in 1..nbytes {
        buf.put_u8((rest & 255) as u8);
        rest >>= 8;
    }
    Ok(())
}

/// Decodes a VByte value from `b` at `*pos`, advancing `*pos` past it.
pub fn get_vbyte(b: &[u8], pos: &mut usize) -> Result<u64> {
    let first = *b
        .get(*pos)
        .ok_or_else(|| Error::corruption("truncated VByte value"))?;
    let nbytes = ((first >> 5) as usize) + 1;
    if *pos + nbytes > b.len() {
        return Err(Error::corruption("truncated VByte value"));
    }
    let mut value = (first & 31) as u64;
    let mut shift = 5;
    for i in 1..nbytes {
        value |= (b[*pos + i] as u64) << shift;
        shift += 8;
    }
    *pos += nbytes;
    Ok(value)
}

/// Appends the VLQ encoding of `value` to `buf`.
pub fn put_vlq(buf: &mut BytesMut, value: u64) {
    let mut n = value;
    while n >= 128 {
        buf.put_u8(((n & 127) as u8) | 128);
        n >>= 7;
    }
    buf.put_u8(n as u8);
}

/// Decodes a VLQ value from `b` at `*pos`, advancing `*pos` past it.
pub fn get_vlq(b: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *b
            .get(*pos)
            .ok_or_else(|| Error::corruption("truncated VLQ value"))?;
        *pos += 1;
        if shift >= 64 {
            return Err(Error::corruption("VLQ value exceeds 64 bits"));
        }
        value |= ((byte & 127) as u64) << shift;
        if byte & 128 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vbyte_roundtrip(value: u64) -> (u64, usize) {
        let mut buf = BytesMut::new();
        put_vbyte(&mut buf, value).unwrap();
        let mut pos = 0;
        let decoded = get_vbyte(&buf, &mut pos).unwrap();
        assert_eq!(pos, buf.len());
        (decoded, pos)
    }

    fn vlq_roundtrip(value: u64) -> (u64, usize) {
        let mut buf = BytesMut::new();
        put_vlq(&mut buf, value);
        let mut pos = 0;
        let decoded = get_vlq(&buf, &mut pos).unwrap();
        assert_eq!(pos, buf.len());
        (decoded, pos)
    }

    #[test]
    fn test_vbyte_boundaries() {
        for &(value, expected_len) in &[
            (0u64, 1usize),
            (31, 1),
            (32, 2),
            (8191, 2),
            (8192, 3),
            (MAX_VBYTE, 8),
        ] {
            assert_eq!(vbyte_len(value), expected_len, "len of {}", value);
            let (decoded, len) = vbyte_roundtrip(value);
            assert_eq!(decoded, value);
            assert_eq!(len, expected_len);
        }
        assert_eq!(vbyte_len(MAX_VBYTE + 1), 9);

        let mut buf = BytesMut::new();
        assert!(put_vbyte(&mut buf, u64::MAX).is_err());
    }

    #[test]
    fn test_vlq_boundaries() {
        for &(value, expected_len) in &[
            (0u64, 1usize),
            (127, 1),
            (128, 2),
            (16383, 2),
            (16384, 3),
            (u64::MAX, 10),
        ] {
            assert_eq!(vlq_len(value), expected_len, "len of {}", value);
            let (decoded, len) = vlq_roundtrip(value);
            assert_eq!(decoded, value);
            assert_eq!(len, expected_len);
        }
    }

    #[test]
    fn test_roundtrip_walk() {
        let mut value = 1u64;
        while value < MAX_VBYTE / 3 {
            assert_eq!(vbyte_roundtrip(value).0, value);
            assert_eq!(vlq_roundtrip(value).0, value);
            assert_eq!(vbyte_roundtrip(value - 1).0, value - 1);
            assert_eq!(vlq_roundtrip(value + 1).0, value + 1);
            value *= 3;
        }
    }

    #[test]
    fn test_vlq_continuation_bits() {
        // Every byte except the last carries the continuation bit.
        let mut buf = BytesMut::new();
        put_vlq(&mut buf, 300);
        assert_eq!(buf.len(), 2);
        assert_ne!(buf[0] & 128, 0);
        assert_eq!(buf[1] & 128, 0);
    }

    #[test]
    fn test_truncated_input() {
        let mut buf = BytesMut::new();
        put_vbyte(&mut buf, 100_000).unwrap();
        let truncated = &buf[..buf.len() - 1];
        let mut pos = 0;
        assert!(get_vbyte(truncated, &mut pos).is_err());

        let mut buf = BytesMut::new();
        put_vlq(&mut buf, 100_000);
        let truncated = &buf[..buf.len() - 1];
        let mut pos = 0;
        assert!(get_vlq(truncated, &mut pos).is_err());
    }
}
