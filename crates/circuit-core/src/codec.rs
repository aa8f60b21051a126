//! Length-delimited message framing.
//!
//! Two framings share the uvarint length prefix:
//!
//! 1. Delimited protobuf frames (`uvarint(len) ‖ bytes`), capped at
//!    [`MAX_MESSAGE_SIZE`].
//! 2. Length-prefixed multiaddr records used by the legacy v1 status
//!    framing, capped at [`MAX_ADDR_LEN`].
//!
//! The length prefix is read **one byte at a time**. After the handshake
//! the same stream carries raw spliced circuit bytes, so a buffered
//! reader here would eat past the frame and lose data.

use multiaddr::Multiaddr;
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted protobuf frame.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Largest accepted length-prefixed multiaddr.
pub const MAX_ADDR_LEN: usize = 1024;

const MAX_VARINT_LEN: usize = 10;

/// Framing errors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message decode failed: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("message too large: {0} bytes (max {1})")]
    MessageTooLarge(usize, usize),

    #[error("empty length-prefixed record")]
    EmptyRecord,

    #[error("varint overflow")]
    VarintOverflow,

    #[error("invalid multiaddr bytes")]
    InvalidAddr,
}

/// Append `v` to `buf` as an unsigned varint.
pub fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Decode an unsigned varint from the front of `buf`, returning the
/// value and the number of bytes consumed.
pub fn get_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= MAX_VARINT_LEN {
            return None;
        }
        value |= u64::from(byte & 0x7f) << (7 * i as u32);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

async fn read_uvarint<R: AsyncRead + Unpin>(r: &mut R) -> Result<u64, CodecError> {
    let mut value: u64 = 0;
    for i in 0..MAX_VARINT_LEN {
        let byte = r.read_u8().await?;
        value |= u64::from(byte & 0x7f) << (7 * i as u32);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(CodecError::VarintOverflow)
}

/// Read one length-delimited protobuf frame.
pub async fn read_delimited<M, R>(r: &mut R) -> Result<M, CodecError>
where
    M: Message + Default,
    R: AsyncRead + Unpin,
{
    let len = read_uvarint(r).await? as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
    }

    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(M::decode(buf.as_slice())?)
}

/// Write one length-delimited protobuf frame.
pub async fn write_delimited<M, W>(w: &mut W, msg: &M) -> Result<(), CodecError>
where
    M: Message,
    W: AsyncWrite + Unpin,
{
    let len = msg.encoded_len();
    if len > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
    }

    let mut frame = Vec::with_capacity(len + MAX_VARINT_LEN);
    put_uvarint(&mut frame, len as u64);
    frame.extend_from_slice(&msg.encode_to_vec());

    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

/// Read one length-prefixed multiaddr record (legacy v1 framing).
pub async fn read_lp_addr<R: AsyncRead + Unpin>(r: &mut R) -> Result<Multiaddr, CodecError> {
    let len = read_uvarint(r).await? as usize;
    if len == 0 {
        return Err(CodecError::EmptyRecord);
    }
    if len > MAX_ADDR_LEN {
        return Err(CodecError::MessageTooLarge(len, MAX_ADDR_LEN));
    }

    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Multiaddr::try_from(buf).map_err(|_| CodecError::InvalidAddr)
}

/// Write one length-prefixed multiaddr record (legacy v1 framing).
pub async fn write_lp_addr<W: AsyncWrite + Unpin>(
    w: &mut W,
    addr: &Multiaddr,
) -> Result<(), CodecError> {
    let bytes = addr.to_vec();
    if bytes.is_empty() {
        return Err(CodecError::EmptyRecord);
    }
    if bytes.len() > MAX_ADDR_LEN {
        return Err(CodecError::MessageTooLarge(bytes.len(), MAX_ADDR_LEN));
    }

    let mut frame = Vec::with_capacity(bytes.len() + MAX_VARINT_LEN);
    put_uvarint(&mut frame, bytes.len() as u64);
    frame.extend_from_slice(&bytes);

    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}
