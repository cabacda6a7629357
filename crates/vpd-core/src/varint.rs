//! Length codec for the VPD 2.0 stream.
//!
//! Lengths are written as 7-bit groups, most significant group first. Every
//! group except the last carries the continuation bit (0x80).

use crate::error::{Result, VpdError};

/// Largest length the stream format can carry.
pub const MAX_LEN: u32 = 0x7FFF_FFFF;

const MORE_BIT: u8 = 0x80;
const GROUP_MASK: u8 = 0x7F;

/// Number of bytes `encode_len` produces for `value`.
pub fn encoded_size(value: u32) -> usize {
    let mut n = 1;
    while n < 5 && (value >> (7 * n)) != 0 {
        n += 1;
    }
    n
}

/// Encodes `value` into at most `capacity` bytes.
///
/// Fails with `Invalid` for negative values (or values above [`MAX_LEN`]) and
/// with `Overflow` when the encoding does not fit; nothing is produced on
/// failure.
pub fn encode_len(value: i64, capacity: usize) -> Result<Vec<u8>> {
    if value < 0 {
        return Err(VpdError::Invalid(format!("negative length {value}")));
    }
    if value > MAX_LEN as i64 {
        return Err(VpdError::Invalid(format!("length {value:#x} too large")));
    }
    let value = value as u32;
    let size = encoded_size(value);
    if size > capacity {
        return Err(VpdError::Overflow(format!(
            "length {value:#x} needs {size} bytes, {capacity} available"
        )));
    }
    let mut out = Vec::with_capacity(size);
    for i in (0..size).rev() {
        let group = ((value >> (7 * i)) as u8) & GROUP_MASK;
        out.push(if i > 0 { group | MORE_BIT } else { group });
    }
    Ok(out)
}

/// Decodes a length from the start of `bytes`, reading at most `max_len`
/// bytes. Returns the value and the number of bytes consumed.
pub fn decode_len(bytes: &[u8], max_len: usize) -> Result<(u32, usize)> {
    let limit = max_len.min(bytes.len());
    if limit == 0 {
        return Err(VpdError::Decode("no bytes left for a length field".into()));
    }
    let mut value: u64 = 0;
    for (i, &b) in bytes[..limit].iter().enumerate() {
        value = (value << 7) | u64::from(b & GROUP_MASK);
        if value > u64::from(MAX_LEN) {
            return Err(VpdError::Decode(format!(
                "length field exceeds {MAX_LEN:#x}"
            )));
        }
        if b & MORE_BIT == 0 {
            return Ok((value as u32, i + 1));
        }
    }
    Err(VpdError::Decode(format!(
        "length field truncated after {limit} byte(s)"
    )))
}
