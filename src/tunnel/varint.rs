//! QUIC variable-length integers (RFC 9000 §16)
//!
//! The two most significant bits of the first byte give the encoded length:
//! 1, 2, 4 or 8 bytes, leaving 6, 14, 30 or 62 bits for the value.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest encodable value
pub const MAX_VARINT: u64 = (1 << 62) - 1;

/// Bytes needed to encode `value`
pub fn encoded_len(value: u64) -> usize {
    match value {
        0..=0x3f => 1,
        0x40..=0x3fff => 2,
        0x4000..=0x3fff_ffff => 4,
        _ => 8,
    }
}

/// Append `value` to `buf`. Values above [`MAX_VARINT`] are rejected.
pub fn encode(value: u64, buf: &mut Vec<u8>) -> io::Result<()> {
    if value > MAX_VARINT {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "varint value out of range",
        ));
    }
    match encoded_len(value) {
        1 => buf.push(value as u8),
        2 => buf.extend_from_slice(&(value as u16 | 0x4000).to_be_bytes()),
        4 => buf.extend_from_slice(&(value as u32 | 0x8000_0000).to_be_bytes()),
        _ => buf.extend_from_slice(&(value | 0xc000_0000_0000_0000).to_be_bytes()),
    }
    Ok(())
}

/// Decode a varint from the front of `buf`, returning it and its length
pub fn decode(buf: &[u8]) -> Option<(u64, usize)> {
    let first = *buf.first()?;
    let len = 1usize << (first >> 6);
    if buf.len() < len {
        return None;
    }
    let mut value = u64::from(first & 0x3f);
    for byte in &buf[1..len] {
        value = (value << 8) | u64::from(*byte);
    }
    Some((value, len))
}

/// Read one varint from `reader`. `Ok(None)` means EOF before the first byte.
pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<u64>> {
    let mut first = [0u8; 1];
    if reader.read(&mut first).await? == 0 {
        return Ok(None);
    }
    let len = 1usize << (first[0] >> 6);
    let mut value = u64::from(first[0] & 0x3f);
    if len > 1 {
        let mut rest = [0u8; 7];
        reader.read_exact(&mut rest[..len - 1]).await?;
        for byte in &rest[..len - 1] {
            value = (value << 8) | u64::from(*byte);
        }
    }
    Ok(Some(value))
}
