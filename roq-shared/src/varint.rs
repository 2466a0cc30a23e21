//! QUIC variable-length integers (RFC 9000, section 16).
//!
//! The two most significant bits of the first byte select the length:
//!
//! | prefix | length | usable bits | range |
//! |--------|--------|-------------|-------|
//! | `00` | 1 | 6 | `0..=63` |
//! | `01` | 2 | 14 | `0..=16383` |
//! | `10` | 4 | 30 | `0..=1073741823` |
//! | `11` | 8 | 62 | `0..=4611686018427387903` |

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

/// Largest value a varint can carry.
pub const VARINT_MAX: u64 = (1 << 62) - 1;

/// Number of bytes `v` occupies on the wire.
pub fn varint_len(v: u64) -> usize {
    if v < 0x40 {
        1
    } else if v < 0x4000 {
        2
    } else if v < 0x4000_0000 {
        4
    } else {
        8
    }
}

pub fn put_varint<B: BufMut>(buf: &mut B, v: u64) -> Result<usize> {
    if v > VARINT_MAX {
        return Err(Error::ErrVarIntOverflow(v));
    }
    let n = varint_len(v);
    if buf.remaining_mut() < n {
        return Err(Error::ErrBufferTooSmall);
    }
    match n {
        1 => buf.put_u8(v as u8),
        2 => buf.put_u16(0x4000 | v as u16),
        4 => buf.put_u32(0x8000_0000 | v as u32),
        _ => buf.put_u64(0xC000_0000_0000_0000 | v),
    }
    Ok(n)
}

pub fn get_varint<B: Buf>(buf: &mut B) -> Result<u64> {
    if !buf.has_remaining() {
        return Err(Error::ErrVarIntTruncated);
    }

    let len = 1usize << (buf.chunk()[0] >> 6);
    if buf.remaining() < len {
        return Err(Error::ErrVarIntTruncated);
    }

    Ok(match len {
        1 => (buf.get_u8() & 0x3F) as u64,
        2 => (buf.get_u16() & 0x3FFF) as u64,
        4 => (buf.get_u32() & 0x3FFF_FFFF) as u64,
        _ => buf.get_u64() & VARINT_MAX,
    })
}

/// Maps signed values onto unsigned ones so that small magnitudes of either
/// sign stay short on the wire.
pub fn zigzag_encode(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

pub fn zigzag_decode(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}
