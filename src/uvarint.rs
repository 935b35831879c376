//! LEB128 encoding for `u64`, used throughout the on-disk formats for lengths and counts.
//!
//! Overlong encodings and truncated inputs fail with `invalid_encoding` rather than
//! returning a partial value.

use crate::error::{Error, Result};

/// Maximum number of bytes a ULEB128-encoded `u64` can occupy.
pub const MAX_LEN: usize = 10;

/// Returns the number of bytes needed to encode `v`.
pub fn encoded_len(v: u64) -> usize {
    let mut v = v;
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

/// Encodes `v` into `buf`, returning the number of bytes written.
///
/// `buf` must have room for at least [`MAX_LEN`] bytes.
pub fn encode(buf: &mut [u8], v: u64) -> usize {
    let mut v = v;
    let mut n = 0;
    loop {
        let mut b = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            b |= 0x80;
        }
        buf[n] = b;
        n += 1;
        if v == 0 {
            break;
        }
    }
    n
}

/// Writes `v` to `dst` as ULEB128, returning the number of bytes written.
pub fn write<W: std::io::Write>(dst: &mut W, v: u64) -> Result<usize> {
    let mut buf = [0u8; MAX_LEN];
    let n = encode(&mut buf, v);
    dst.write_all(&buf[..n])?;
    Ok(n)
}

/// Decodes a ULEB128 value from the head of `buf`, returning the value and the
/// remaining unread tail.
///
/// Rejects the 11th continuation byte and overlong final bytes (the value must not
/// have been encodable in fewer bytes via the top bit of the 10th byte).
pub fn read(buf: &[u8]) -> Result<(u64, &[u8])> {
    let mut x: u64 = 0;
    let mut s: u32 = 0;

    for (i, &b) in buf.iter().enumerate() {
        if i == MAX_LEN {
            return Err(Error::invalid_encoding(0, "uvarint exceeds 10 bytes"));
        }

        if b < 0x80 {
            if i == MAX_LEN - 1 && b > 1 {
                return Err(Error::invalid_encoding(0, "uvarint overlong final byte"));
            }
            x |= (b as u64) << s;
            return Ok((x, &buf[i + 1..]));
        }

        x |= ((b & 0x7f) as u64) << s;
        s += 7;
    }

    Err(Error::invalid_encoding(
        0,
        "uvarint truncated: ran out of input before a terminating byte",
    ))
}
