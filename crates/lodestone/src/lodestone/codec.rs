//! Primitive wire types of the Minecraft Java Edition protocol: VarInts,
//! length-prefixed UTF-8 strings, big-endian fixed-width integers, UTF-16BE
//! strings and length-framed packets.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame payload accepted on the wire (2^21 - 1 bytes).
pub const MAX_FRAME_LEN: usize = (1 << 21) - 1;

/// Largest string length the protocol permits.
pub const MAX_STRING_LEN: i32 = 32767;

const VARINT_MAX_BYTES: usize = 5;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("varint continues past {VARINT_MAX_BYTES} bytes")]
    MalformedVarInt,
    #[error("frame length {0} out of range")]
    OversizeFrame(i32),
    #[error("stream ended inside a frame ({got}/{want} bytes)")]
    TruncatedFrame { got: usize, want: usize },
    #[error("string length {0} out of range")]
    StringTooLong(i32),
    #[error("expected handshake packet id 0x00, got {0:#04x}")]
    UnexpectedPacket(i32),
    #[error("unknown next state {0}")]
    UnknownNextState(i32),
    #[error("malformed legacy server list ping: {0}")]
    MalformedLegacyPing(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One length-delimited unit on the wire. The VarInt length prefix is not
/// part of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Reads a VarInt: 1..5 bytes of 7-bit groups, least significant first,
/// continuation flag in the high bit. The result is the signed 32-bit
/// interpretation of the accumulated pattern.
pub async fn read_varint<R>(r: &mut R) -> Result<i32, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut result: u32 = 0;
    for group in 0..VARINT_MAX_BYTES {
        let b = r.read_u8().await?;
        result |= u32::from(b & 0x7F) << (7 * group);
        if b & 0x80 == 0 {
            return Ok(result as i32);
        }
    }
    Err(ProtocolError::MalformedVarInt)
}

/// Appends the minimal VarInt encoding of `n` to `out` and returns the
/// number of bytes written. The value is treated as unsigned for bit
/// extraction, so negative inputs always take five bytes.
pub fn put_varint(n: i32, out: &mut Vec<u8>) -> usize {
    let mut v = n as u32;
    let mut written = 0;
    loop {
        let mut b = (v & 0x7F) as u8;
        v >>= 7;
        if v != 0 {
            b |= 0x80;
        }
        out.push(b);
        written += 1;
        if v == 0 {
            return written;
        }
    }
}

pub async fn write_varint<W>(n: i32, w: &mut W) -> Result<usize, ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(VARINT_MAX_BYTES);
    let written = put_varint(n, &mut buf);
    w.write_all(&buf).await?;
    Ok(written)
}

/// Reads a VarInt length followed by that many bytes of UTF-8.
pub async fn read_string<R>(r: &mut R) -> Result<String, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let len = read_varint(r).await?;
    if !(0..=MAX_STRING_LEN).contains(&len) {
        return Err(ProtocolError::StringTooLong(len));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

pub async fn write_string<W>(s: &str, w: &mut W) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(VARINT_MAX_BYTES + s.len());
    put_varint(s.len() as i32, &mut buf);
    buf.extend_from_slice(s.as_bytes());
    w.write_all(&buf).await?;
    Ok(())
}

pub async fn read_u16<R>(r: &mut R) -> Result<u16, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    Ok(r.read_u16().await?)
}

pub async fn read_u32<R>(r: &mut R) -> Result<u32, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    Ok(r.read_u32().await?)
}

/// Reads `code_units * 2` bytes and decodes them as UTF-16BE. A BOM is not
/// interpreted; it decodes like any other code unit.
pub async fn read_utf16be_string<R>(r: &mut R, code_units: u16) -> Result<String, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; usize::from(code_units) * 2];
    r.read_exact(&mut buf).await?;
    let units: Vec<u16> = buf
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&units))
}

/// Reads one frame: a VarInt length then exactly that many payload bytes.
///
/// The payload is filled with a read-until-full loop; a single read is never
/// assumed to deliver the full count, and a zero-byte read mid-payload means
/// the stream ended early.
pub async fn read_frame<R>(r: &mut R) -> Result<Frame, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let length = read_varint(r).await?;
    if length < 0 || length as usize > MAX_FRAME_LEN {
        return Err(ProtocolError::OversizeFrame(length));
    }

    let want = length as usize;
    let mut payload = vec![0u8; want];
    let mut got = 0usize;
    while got < want {
        let n = r.read(&mut payload[got..]).await?;
        if n == 0 {
            return Err(ProtocolError::TruncatedFrame { got, want });
        }
        got += n;
    }

    Ok(Frame { payload })
}

/// Appends a VarInt length prefix and the payload to `out`.
pub fn put_frame(payload: &[u8], out: &mut Vec<u8>) {
    put_varint(payload.len() as i32, out);
    out.extend_from_slice(payload);
}
