//! Decodes the first packet of a client connection into a routing [`Intent`],
//! keeping the exact consumed bytes so they can be replayed to the backend.
//!
//! Two wire shapes arrive here: the modern framed `Handshake` packet, and the
//! pre-1.7 legacy server list ping, recognised by its `0xFE` lead byte.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use crate::lodestone::codec::{self, Frame, ProtocolError};

pub const PACKET_ID_HANDSHAKE: i32 = 0x00;
pub const LEGACY_PING_LEAD_BYTE: u8 = 0xFE;

const LEGACY_PING_CHANNEL: &str = "MC|PingHost";
const LEGACY_PING_CHANNEL_UNITS: u16 = 11;

/// What the client asked for after the handshake completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    Status,
    Login,
    LegacyPing,
}

/// The parsed first packet, sufficient to pick a backend and to replay the
/// consumed bytes verbatim.
#[derive(Debug, Clone)]
pub struct Intent {
    pub server_address: String,
    pub port: u16,
    pub protocol_version: i32,
    pub next_state: NextState,
    /// Byte-exact sequence consumed from the client socket.
    pub raw: Vec<u8>,
}

/// Fields of the modern `Handshake` packet (id 0x00 in the Handshaking state).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: i32,
}

/// Frame payload, either opaque or upgraded to a parsed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketData {
    Raw(Vec<u8>),
    Handshake(Handshake),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub data: PacketData,
}

impl Packet {
    /// Splits a frame payload into packet id and raw data.
    pub async fn from_frame(frame: &Frame) -> Result<Packet, ProtocolError> {
        let mut payload = frame.payload.as_slice();
        let id = codec::read_varint(&mut payload).await?;
        Ok(Packet {
            id,
            data: PacketData::Raw(payload.to_vec()),
        })
    }

    /// Upgrades raw handshake data to its parsed form. The packet id must be
    /// the handshake id; anything else in the Handshaking state is a protocol
    /// violation.
    pub async fn parse_handshake(self) -> Result<Packet, ProtocolError> {
        if self.id != PACKET_ID_HANDSHAKE {
            return Err(ProtocolError::UnexpectedPacket(self.id));
        }
        let data = match self.data {
            PacketData::Raw(bytes) => {
                let mut cursor = bytes.as_slice();
                let handshake = Handshake {
                    protocol_version: codec::read_varint(&mut cursor).await?,
                    server_address: codec::read_string(&mut cursor).await?,
                    server_port: codec::read_u16(&mut cursor).await?,
                    next_state: codec::read_varint(&mut cursor).await?,
                };
                PacketData::Handshake(handshake)
            }
            parsed @ PacketData::Handshake(_) => parsed,
        };
        Ok(Packet { id: self.id, data })
    }
}

/// `AsyncRead` adapter over the accepted socket that records every consumed
/// byte and can peek at the first byte without consuming it. The peeked byte
/// is recorded only once a reader actually takes it, so the capture always
/// equals what downstream parsing consumed.
#[derive(Debug)]
pub struct CaptureReader<R> {
    inner: R,
    peeked: Option<u8>,
    captured: Vec<u8>,
}

impl<R: AsyncRead + Unpin> CaptureReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            peeked: None,
            captured: Vec::with_capacity(256),
        }
    }

    /// Returns the next byte on the stream without consuming it.
    pub async fn peek_first(&mut self) -> io::Result<u8> {
        if let Some(b) = self.peeked {
            return Ok(b);
        }
        let b = self.inner.read_u8().await?;
        self.peeked = Some(b);
        Ok(b)
    }

    pub fn captured(&self) -> &[u8] {
        &self.captured
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CaptureReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(b) = this.peeked.take() {
            buf.put_slice(&[b]);
            this.captured.push(b);
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.captured.extend_from_slice(&buf.filled()[before..]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Reads the client's first packet and produces its routing intent.
///
/// Consumes exactly the handshake bytes; anything the client pipelines after
/// them is left unread for the splice phase.
pub async fn read_intent<R>(r: &mut CaptureReader<R>) -> Result<Intent, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    if r.peek_first().await? == LEGACY_PING_LEAD_BYTE {
        read_legacy_intent(r).await
    } else {
        read_modern_intent(r).await
    }
}

async fn read_modern_intent<R>(r: &mut CaptureReader<R>) -> Result<Intent, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let frame = codec::read_frame(r).await?;
    let packet = Packet::from_frame(&frame).await?.parse_handshake().await?;
    let handshake = match packet.data {
        PacketData::Handshake(h) => h,
        PacketData::Raw(_) => unreachable!("parse_handshake returns parsed data"),
    };

    let next_state = match handshake.next_state {
        1 => NextState::Status,
        2 => NextState::Login,
        other => return Err(ProtocolError::UnknownNextState(other)),
    };

    Ok(Intent {
        server_address: handshake.server_address,
        port: handshake.server_port,
        protocol_version: handshake.protocol_version,
        next_state,
        raw: r.captured().to_vec(),
    })
}

/// Legacy server list ping, fixed layout:
/// `FE 01 FA`, u16 channel-name length (always 11), UTF-16BE "MC|PingHost",
/// u16 remaining length, u8 protocol version, u16 hostname length, UTF-16BE
/// hostname, u32 port.
async fn read_legacy_intent<R>(r: &mut CaptureReader<R>) -> Result<Intent, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    if r.read_u8().await? != LEGACY_PING_LEAD_BYTE {
        return Err(ProtocolError::MalformedLegacyPing("packet id"));
    }
    if r.read_u8().await? != 0x01 {
        return Err(ProtocolError::MalformedLegacyPing("payload byte"));
    }
    if r.read_u8().await? != 0xFA {
        return Err(ProtocolError::MalformedLegacyPing("plugin message id"));
    }

    let channel_units = codec::read_u16(r).await?;
    if channel_units != LEGACY_PING_CHANNEL_UNITS {
        return Err(ProtocolError::MalformedLegacyPing("channel name length"));
    }
    let channel = codec::read_utf16be_string(r, channel_units).await?;
    if channel != LEGACY_PING_CHANNEL {
        return Err(ProtocolError::MalformedLegacyPing("channel name"));
    }

    let remaining = codec::read_u16(r).await?;
    let protocol_version = i32::from(r.read_u8().await?);
    let hostname_units = codec::read_u16(r).await?;

    // remaining spans protocol byte + hostname length + hostname + port.
    if usize::from(remaining) != 7 + usize::from(hostname_units) * 2 {
        return Err(ProtocolError::MalformedLegacyPing("remaining length"));
    }

    let server_address = codec::read_utf16be_string(r, hostname_units).await?;
    let port = codec::read_u32(r).await?;

    Ok(Intent {
        server_address,
        port: port as u16,
        protocol_version,
        next_state: NextState::LegacyPing,
        raw: r.captured().to_vec(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::lodestone::codec::put_varint;

    pub(crate) fn build_handshake(host: &str, port: u16, proto: i32, next: i32) -> Vec<u8> {
        let mut inner = Vec::new();
        put_varint(PACKET_ID_HANDSHAKE, &mut inner);
        put_varint(proto, &mut inner);
        put_varint(host.len() as i32, &mut inner);
        inner.extend_from_slice(host.as_bytes());
        inner.extend_from_slice(&port.to_be_bytes());
        put_varint(next, &mut inner);

        let mut out = Vec::new();
        codec::put_frame(&inner, &mut out);
        out
    }

    pub(crate) fn build_legacy_ping(host: &str, port: u32, proto: u8) -> Vec<u8> {
        let mut out = vec![0xFE, 0x01, 0xFA];
        let channel: Vec<u8> = LEGACY_PING_CHANNEL
            .encode_utf16()
            .flat_map(|u| u.to_be_bytes())
            .collect();
        out.extend_from_slice(&LEGACY_PING_CHANNEL_UNITS.to_be_bytes());
        out.extend_from_slice(&channel);

        let host_units: Vec<u16> = host.encode_utf16().collect();
        let remaining = (7 + host_units.len() * 2) as u16;
        out.extend_from_slice(&remaining.to_be_bytes());
        out.push(proto);
        out.extend_from_slice(&(host_units.len() as u16).to_be_bytes());
        for u in host_units {
            out.extend_from_slice(&u.to_be_bytes());
        }
        out.extend_from_slice(&port.to_be_bytes());
        out
    }

    #[tokio::test]
    async fn modern_status_handshake() {
        let wire = build_handshake("my.srv", 25565, 764, 1);
        let mut r = CaptureReader::new(wire.as_slice());
        let intent = read_intent(&mut r).await.unwrap();

        assert_eq!(intent.server_address, "my.srv");
        assert_eq!(intent.port, 25565);
        assert_eq!(intent.protocol_version, 764);
        assert_eq!(intent.next_state, NextState::Status);
        assert_eq!(intent.raw, wire);
    }

    #[tokio::test]
    async fn modern_login_handshake() {
        let wire = build_handshake("Play.Example.Com", 25566, 763, 2);
        let mut r = CaptureReader::new(wire.as_slice());
        let intent = read_intent(&mut r).await.unwrap();

        // Case is preserved here; routing folds it later.
        assert_eq!(intent.server_address, "Play.Example.Com");
        assert_eq!(intent.next_state, NextState::Login);
        assert_eq!(intent.raw, wire);
    }

    #[tokio::test]
    async fn pipelined_bytes_stay_unconsumed() {
        let mut wire = build_handshake("my.srv", 25565, 764, 1);
        let handshake_len = wire.len();
        wire.extend_from_slice(b"status request follows");

        let mut r = CaptureReader::new(wire.as_slice());
        let intent = read_intent(&mut r).await.unwrap();
        assert_eq!(intent.raw, wire[..handshake_len].to_vec());

        let mut rest = Vec::new();
        r.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"status request follows");
    }

    #[tokio::test]
    async fn rejects_non_handshake_packet_id() {
        let mut inner = Vec::new();
        put_varint(0x05, &mut inner);
        put_varint(764, &mut inner);
        let mut wire = Vec::new();
        codec::put_frame(&inner, &mut wire);

        let mut r = CaptureReader::new(wire.as_slice());
        let err = read_intent(&mut r).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedPacket(0x05)));
    }

    #[tokio::test]
    async fn rejects_unknown_next_state() {
        let wire = build_handshake("my.srv", 25565, 764, 3);
        let mut r = CaptureReader::new(wire.as_slice());
        let err = read_intent(&mut r).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownNextState(3)));
    }

    #[tokio::test]
    async fn rejects_oversize_length_varint() {
        let wire = [0xFFu8; 6];
        let mut r = CaptureReader::new(wire.as_slice());
        let err = read_intent(&mut r).await.unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedVarInt));
    }

    #[tokio::test]
    async fn legacy_ping_parses_and_captures() {
        let wire = build_legacy_ping("example", 25565, 0x4A);
        let mut r = CaptureReader::new(wire.as_slice());
        let intent = read_intent(&mut r).await.unwrap();

        assert_eq!(intent.server_address, "example");
        assert_eq!(intent.port, 25565);
        assert_eq!(intent.protocol_version, 0x4A);
        assert_eq!(intent.next_state, NextState::LegacyPing);
        assert_eq!(intent.raw, wire);
    }

    #[tokio::test]
    async fn legacy_ping_port_narrows_like_the_wire() {
        let wire = build_legacy_ping("example", 0x0001_63DD, 0x4A);
        let mut r = CaptureReader::new(wire.as_slice());
        let intent = read_intent(&mut r).await.unwrap();
        assert_eq!(intent.port, 25565);
    }

    #[tokio::test]
    async fn legacy_ping_rejects_wrong_channel_length() {
        let mut wire = build_legacy_ping("example", 25565, 0x4A);
        // Corrupt the channel-name length field.
        wire[3] = 0x00;
        wire[4] = 0x0A;

        let mut r = CaptureReader::new(wire.as_slice());
        let err = read_intent(&mut r).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::MalformedLegacyPing("channel name length")
        ));
    }

    #[tokio::test]
    async fn legacy_ping_rejects_wrong_plugin_message_id() {
        let mut wire = build_legacy_ping("example", 25565, 0x4A);
        wire[2] = 0xFB;

        let mut r = CaptureReader::new(wire.as_slice());
        let err = read_intent(&mut r).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::MalformedLegacyPing("plugin message id")
        ));
    }

    #[tokio::test]
    async fn legacy_ping_rejects_inconsistent_remaining_length() {
        let mut wire = build_legacy_ping("example", 25565, 0x4A);
        // The remaining-length field sits right after the channel name.
        let pos = 3 + 2 + usize::from(LEGACY_PING_CHANNEL_UNITS) * 2;
        wire[pos] = 0x00;
        wire[pos + 1] = 0x03;

        let mut r = CaptureReader::new(wire.as_slice());
        let err = read_intent(&mut r).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::MalformedLegacyPing("remaining length")
        ));
    }

    #[tokio::test]
    async fn packet_data_upgrade_round_trip() {
        let wire = build_handshake("my.srv", 25565, 764, 1);
        let mut r = CaptureReader::new(wire.as_slice());
        let frame = codec::read_frame(&mut r).await.unwrap();

        let packet = Packet::from_frame(&frame).await.unwrap();
        assert_eq!(packet.id, PACKET_ID_HANDSHAKE);
        assert!(matches!(packet.data, PacketData::Raw(_)));

        let packet = packet.parse_handshake().await.unwrap();
        let PacketData::Handshake(h) = packet.data else {
            panic!("expected parsed handshake");
        };
        assert_eq!(h.server_address, "my.srv");
        assert_eq!(h.server_port, 25565);
        assert_eq!(h.next_state, 1);
    }
}
