//! Order-preserving byte codec.
//!
//! Every encoding here is built so that unsigned lexicographic
//! comparison of the encoded bytes matches the natural ordering of the
//! decoded value. This is what lets index keys double as range-query
//! keys.

use crate::error::{Error, Result};

/// Smallest byte string strictly greater than every byte string that
/// starts with `prefix`.
///
/// Used to bound range scans over a key prefix (e.g. all content keys
/// for one object, or all index keys for one indexed value).
pub fn key_after_prefix(prefix: &[u8]) -> Vec<u8> {
    let mut out = prefix.to_vec();
    while matches!(out.last(), Some(0xFF)) {
        out.pop();
    }
    match out.last_mut() {
        Some(b) => {
            *b += 1;
            out
        }
        None => {
            // prefix was empty or all 0xFF bytes; there is no finite
            // successor within this scheme, so return a key guaranteed
            // to sort after anything of length <= prefix.len() + 1.
            vec![0xFF; prefix.len() + 1]
        }
    }
}

/// A cursor over an encoded key/value byte string, used by decoders.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Wrap a byte slice for sequential decoding.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes remaining.
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// True when every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::codec("unexpected end of input"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_one(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read and consume exactly `n` bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Read and consume a single byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        self.take_one()
    }
}

/// Encode an unsigned integer with an order-preserving, self-delimiting
/// variable-length scheme: the first byte alone determines the total
/// encoded length.
///
/// - `0..=240`             -> 1 byte: the value itself.
/// - `241..=2287`           -> 2 bytes.
/// - `2288..=67823`         -> 3 bytes.
/// - larger                -> a length byte in `250..=255` (3..=8
///   trailing big-endian bytes), followed by the minimal big-endian
///   encoding of the value.
pub fn encode_uvarint(value: u64, out: &mut Vec<u8>) {
    if value <= 240 {
        out.push(value as u8);
    } else if value <= 2287 {
        let v = value - 241;
        out.push(241 + (v >> 8) as u8);
        out.push((v & 0xFF) as u8);
    } else if value <= 67_823 {
        let v = value - 2288;
        out.push(249);
        out.push((v >> 8) as u8);
        out.push((v & 0xFF) as u8);
    } else {
        let bytes = value.to_be_bytes();
        let mut n = 8usize;
        while n > 3 && bytes[8 - n] == 0 {
            n -= 1;
        }
        out.push(250 + (n as u8 - 3));
        out.extend_from_slice(&bytes[8 - n..]);
    }
}

/// Decode a value written by [`encode_uvarint`].
pub fn decode_uvarint(r: &mut Reader<'_>) -> Result<u64> {
    let first = r.take_one()?;
    match first {
        0..=240 => Ok(first as u64),
        241..=248 => {
            let b1 = r.take_one()?;
            Ok(241 + ((first as u64 - 241) << 8) + b1 as u64)
        }
        249 => {
            let rest = r.take(2)?;
            Ok(2288 + ((rest[0] as u64) << 8) + rest[1] as u64)
        }
        250..=255 => {
            let n = (first - 250) as usize + 3;
            let rest = r.take(n)?;
            let mut bytes = [0u8; 8];
            bytes[8 - n..].copy_from_slice(rest);
            Ok(u64::from_be_bytes(bytes))
        }
    }
}

/// Convenience: encode to a fresh `Vec<u8>`.
pub fn encode_uvarint_vec(value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    encode_uvarint(value, &mut out);
    out
}

/// Encode a signed 64-bit integer so that unsigned byte comparison
/// matches signed numeric order: flip the sign bit, then write 8 bytes
/// big-endian.
pub fn encode_i64(value: i64, out: &mut Vec<u8>) {
    let flipped = (value as u64) ^ (1u64 << 63);
    out.extend_from_slice(&flipped.to_be_bytes());
}

/// Decode a value written by [`encode_i64`].
pub fn decode_i64(r: &mut Reader<'_>) -> Result<i64> {
    let bytes = r.take(8)?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(bytes);
    let flipped = u64::from_be_bytes(arr);
    Ok((flipped ^ (1u64 << 63)) as i64)
}

/// Encode a signed 32-bit integer, same scheme as [`encode_i64`] but
/// 4 bytes wide.
pub fn encode_i32(value: i32, out: &mut Vec<u8>) {
    let flipped = (value as u32) ^ (1u32 << 31);
    out.extend_from_slice(&flipped.to_be_bytes());
}

/// Decode a value written by [`encode_i32`].
pub fn decode_i32(r: &mut Reader<'_>) -> Result<i32> {
    let bytes = r.take(4)?;
    let mut arr = [0u8; 4];
    arr.copy_from_slice(bytes);
    let flipped = u32::from_be_bytes(arr);
    Ok((flipped ^ (1u32 << 31)) as i32)
}

/// Encode an `f64` so that unsigned byte comparison matches IEEE-754
/// total order for non-NaN values: flip the sign bit for non-negative
/// numbers, flip every bit for negative numbers.
pub fn encode_f64(value: f64, out: &mut Vec<u8>) {
    let bits = value.to_bits();
    let mapped = if bits & (1u64 << 63) != 0 { !bits } else { bits | (1u64 << 63) };
    out.extend_from_slice(&mapped.to_be_bytes());
}

/// Decode a value written by [`encode_f64`].
pub fn decode_f64(r: &mut Reader<'_>) -> Result<f64> {
    let bytes = r.take(8)?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(bytes);
    let mapped = u64::from_be_bytes(arr);
    let bits = if mapped & (1u64 << 63) != 0 { mapped & !(1u64 << 63) } else { !mapped };
    Ok(f64::from_bits(bits))
}

/// Encode a `bool` as a single byte (`0x00`/`0x01`).
pub fn encode_bool(value: bool, out: &mut Vec<u8>) {
    out.push(if value { 1 } else { 0 });
}

/// Decode a value written by [`encode_bool`].
pub fn decode_bool(r: &mut Reader<'_>) -> Result<bool> {
    Ok(r.take_one()? != 0)
}

/// Encode a UTF-8 string using a memcomparable scheme: every literal
/// `0x00` byte is escaped as `0x00 0xFF`, and the whole string is
/// terminated by `0x00 0x00`. `0x00` sorts below every other byte, so
/// the terminator sorts before any continuation of a longer string
/// with the same prefix.
pub fn encode_str(value: &str, out: &mut Vec<u8>) {
    for &b in value.as_bytes() {
        if b == 0x00 {
            out.push(0x00);
            out.push(0xFF);
        } else {
            out.push(b);
        }
    }
    out.push(0x00);
    out.push(0x00);
}

/// Decode a value written by [`encode_str`].
pub fn decode_string(r: &mut Reader<'_>) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let b = r.take_one()?;
        if b == 0x00 {
            let next = r.take_one()?;
            match next {
                0x00 => break,
                0xFF => bytes.push(0x00),
                _ => return Err(Error::codec("invalid string escape sequence")),
            }
        } else {
            bytes.push(b);
        }
    }
    String::from_utf8(bytes).map_err(|e| Error::codec(e.to_string()))
}

/// Encode an enum ordinal as an unsigned varint.
pub fn encode_enum_ordinal(ordinal: u64, out: &mut Vec<u8>) {
    encode_uvarint(ordinal, out);
}

/// Decode an enum ordinal written by [`encode_enum_ordinal`].
pub fn decode_enum_ordinal(r: &mut Reader<'_>) -> Result<u64> {
    decode_uvarint(r)
}

/// Encode raw bytes with the same escape/terminator scheme as
/// [`encode_str`], so byte blobs remain orderable and embeddable in a
/// larger encoded key (e.g. a composite index tuple).
pub fn encode_bytes(value: &[u8], out: &mut Vec<u8>) {
    for &b in value {
        if b == 0x00 {
            out.push(0x00);
            out.push(0xFF);
        } else {
            out.push(b);
        }
    }
    out.push(0x00);
    out.push(0x00);
}

/// Decode a value written by [`encode_bytes`].
pub fn decode_bytes(r: &mut Reader<'_>) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    loop {
        let b = r.take_one()?;
        if b == 0x00 {
            let next = r.take_one()?;
            match next {
                0x00 => break,
                0xFF => bytes.push(0x00),
                _ => return Err(Error::codec("invalid byte-string escape sequence")),
            }
        } else {
            bytes.push(b);
        }
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn uvarint_round_trip_boundaries() {
        for v in [0u64, 1, 240, 241, 2287, 2288, 67823, 67824, u32::MAX as u64, u64::MAX] {
            let bytes = encode_uvarint_vec(v);
            let mut r = Reader::new(&bytes);
            assert_eq!(decode_uvarint(&mut r).unwrap(), v);
            assert!(r.is_empty());
        }
    }

    #[test]
    fn key_after_prefix_bounds() {
        assert!(key_after_prefix(b"abc").as_slice() > b"abc".as_slice());
        assert!(key_after_prefix(b"abc").as_slice() > b"abczzzz".as_slice());
        assert_eq!(key_after_prefix(b"ab\xff"), b"ac".to_vec());
        assert_eq!(key_after_prefix(b"\xff\xff"), vec![0xFF, 0xFF, 0xFF]);
    }

    proptest! {
        #[test]
        fn uvarint_order_preserving(a: u64, b: u64) {
            let ea = encode_uvarint_vec(a);
            let eb = encode_uvarint_vec(b);
            prop_assert_eq!(a.cmp(&b), ea.cmp(&eb));
        }

        #[test]
        fn uvarint_round_trip(v: u64) {
            let bytes = encode_uvarint_vec(v);
            let mut r = Reader::new(&bytes);
            prop_assert_eq!(decode_uvarint(&mut r).unwrap(), v);
        }

        #[test]
        fn i64_order_preserving(a: i64, b: i64) {
            let mut ea = Vec::new();
            encode_i64(a, &mut ea);
            let mut eb = Vec::new();
            encode_i64(b, &mut eb);
            prop_assert_eq!(a.cmp(&b), ea.cmp(&eb));
        }

        #[test]
        fn i64_round_trip(v: i64) {
            let mut buf = Vec::new();
            encode_i64(v, &mut buf);
            let mut r = Reader::new(&buf);
            prop_assert_eq!(decode_i64(&mut r).unwrap(), v);
        }

        #[test]
        fn i32_order_preserving(a: i32, b: i32) {
            let mut ea = Vec::new();
            encode_i32(a, &mut ea);
            let mut eb = Vec::new();
            encode_i32(b, &mut eb);
            prop_assert_eq!(a.cmp(&b), ea.cmp(&eb));
        }

        #[test]
        fn f64_order_preserving(a in -1.0e30f64..1.0e30, b in -1.0e30f64..1.0e30) {
            let mut ea = Vec::new();
            encode_f64(a, &mut ea);
            let mut eb = Vec::new();
            encode_f64(b, &mut eb);
            prop_assert_eq!(a.partial_cmp(&b).unwrap(), ea.cmp(&eb));
        }

        #[test]
        fn f64_round_trip(v in -1.0e30f64..1.0e30) {
            let mut buf = Vec::new();
            encode_f64(v, &mut buf);
            let mut r = Reader::new(&buf);
            prop_assert_eq!(decode_f64(&mut r).unwrap(), v);
        }

        #[test]
        fn string_round_trip(s in ".*") {
            let mut buf = Vec::new();
            encode_str(&s, &mut buf);
            let mut r = Reader::new(&buf);
            prop_assert_eq!(decode_string(&mut r).unwrap(), s);
        }

        #[test]
        fn string_order_preserving(a in ".*", b in ".*") {
            let mut ea = Vec::new();
            encode_str(&a, &mut ea);
            let mut eb = Vec::new();
            encode_str(&b, &mut eb);
            prop_assert_eq!(a.cmp(&b), ea.cmp(&eb));
        }

        #[test]
        fn bool_round_trip(v: bool) {
            let mut buf = Vec::new();
            encode_bool(v, &mut buf);
            let mut r = Reader::new(&buf);
            prop_assert_eq!(decode_bool(&mut r).unwrap(), v);
        }
    }
}
