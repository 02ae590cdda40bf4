//! The tunnel's wire format.
//!
//! Every frame on `proto-TCP` begins with a one-byte [`OpCode`]; `proto-UDP`
//! carries a narrower subset of the same opcodes. All multi-byte integers are
//! little-endian. Header-region helpers (`encode_*_header`) are pure
//! functions over caller-owned buffers so the engine can reuse one allocation
//! across a session (see `connection.rs` and `engine.rs`).

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes reserved ahead of a TCP sub-connection read so the MESSAGE (or
/// UDP-bypass MESSAGE) header can be written in place before the payload is
/// forwarded. Sized for the worst case: opcode + protocol byte + two u64s +
/// u32 length.
pub const TCP_MESSAGE_HEADER_SIZE: usize = 1 + 1 + 8 + 8 + 4;

/// Bytes reserved ahead of a UDP bridge read for the same reason. Sized for
/// the bypass variant (opcode + protocol byte + bridge + length); the direct
/// `proto-UDP` variant uses one byte less and leaves one byte of padding.
pub const UDP_MESSAGE_HEADER_SIZE: usize = 1 + 1 + 2 + 4;

/// Capacity of the reusable per-task message buffer: the largest payload
/// this build forwards, plus header room.
pub const MESSAGE_BUFFER_SIZE: usize = 16384 + TCP_MESSAGE_HEADER_SIZE;

/// Largest payload a single MESSAGE frame may declare. A declared length
/// beyond this is rejected before any allocation, rather than trusting a
/// peer-supplied `u32` as an allocation size.
pub const MAX_MESSAGE_PAYLOAD: usize = MESSAGE_BUFFER_SIZE - TCP_MESSAGE_HEADER_SIZE;

const MAX_HOSTNAME_LEN: usize = 255;

fn check_payload_len(len: u32) -> Result<usize, WireError> {
    let len = len as usize;
    if len > MAX_MESSAGE_PAYLOAD {
        return Err(WireError::Malformed("message payload exceeds MAX_MESSAGE_PAYLOAD"));
    }
    Ok(len)
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("unknown opcode {0}")]
    UnknownOpCode(u8),
    #[error("opcode {0:?} is not valid on this channel")]
    WrongChannel(OpCode),
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("peer closed the connection")]
    Eof,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Nop = 0,
    Config = 1,
    Message = 2,
    Connect = 3,
    UdpConnected = 4,
    TcpDisconnected = 5,
    TcpEstablished = 6,
    TcpTimeout = 7,
    Establish = 8,
}

impl TryFrom<u8> for OpCode {
    type Error = WireError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => OpCode::Nop,
            1 => OpCode::Config,
            2 => OpCode::Message,
            3 => OpCode::Connect,
            4 => OpCode::UdpConnected,
            5 => OpCode::TcpDisconnected,
            6 => OpCode::TcpEstablished,
            7 => OpCode::TcpTimeout,
            8 => OpCode::Establish,
            other => return Err(WireError::UnknownOpCode(other)),
        })
    }
}

/// Tags the body of a bypassed UDP `MESSAGE` so it can be told apart from a
/// sub-connection `MESSAGE` on the same `proto-TCP` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Protocol {
    Tcp = 0,
    Udp = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Connection {
    Fresh = 0,
    Resume = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UdpBypass {
    NoBypass = 0,
    Bypass = 1,
}

/// A decoded frame arriving on `proto-TCP`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpFrame {
    Nop,
    Config {
        proto: super::bridge::BridgeProtocol,
        dst_port: u16,
        host: String,
    },
    Message {
        sk: u64,
        uk: u64,
        payload: Bytes,
    },
    UdpBypassMessage {
        bridge: u16,
        payload: Bytes,
    },
    Connect {
        bridge: u16,
        sk: u64,
        uk: u64,
    },
    TcpEstablished {
        client_sk: u64,
        client_uk: u64,
        server_sk: u64,
    },
    TcpDisconnected {
        sk: u64,
        uk: u64,
    },
    TcpTimeout,
}

/// A decoded frame arriving on `proto-UDP`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpFrame {
    Nop,
    Message { bridge: u16, payload: Bytes },
    UdpConnected,
}

/// Reads one frame from `proto-TCP`. `bypass` controls whether a `MESSAGE`
/// may carry the UDP-bypass variant (leading [`Protocol::Udp`] byte).
pub async fn read_tcp_frame<R>(r: &mut R, bypass: bool) -> Result<TcpFrame, WireError>
where
    R: AsyncRead + Unpin,
{
    let op = read_opcode(r).await?;
    match op {
        OpCode::Nop => Ok(TcpFrame::Nop),
        OpCode::Config => {
            let size = r.read_u16_le().await?;
            let mut body = vec![0u8; size as usize];
            r.read_exact(&mut body).await?;
            decode_config_body(&body)
        }
        OpCode::Message => {
            if bypass {
                let tag = r.read_u8().await?;
                if tag == Protocol::Udp as u8 {
                    let bridge = r.read_u16_le().await?;
                    let len = check_payload_len(r.read_u32_le().await?)?;
                    let mut payload = vec![0u8; len];
                    r.read_exact(&mut payload).await?;
                    return Ok(TcpFrame::UdpBypassMessage {
                        bridge,
                        payload: Bytes::from(payload),
                    });
                }
                // Non-bypassed sub-connection message: `tag` is the low byte of `sk`.
                let sk = u64::from_le_bytes(read_u64_with_known_byte0(r, tag).await?);
                let uk = r.read_u64_le().await?;
                let len = check_payload_len(r.read_u32_le().await?)?;
                let mut payload = vec![0u8; len];
                r.read_exact(&mut payload).await?;
                Ok(TcpFrame::Message {
                    sk,
                    uk,
                    payload: Bytes::from(payload),
                })
            } else {
                let sk = r.read_u64_le().await?;
                let uk = r.read_u64_le().await?;
                let len = check_payload_len(r.read_u32_le().await?)?;
                let mut payload = vec![0u8; len];
                r.read_exact(&mut payload).await?;
                Ok(TcpFrame::Message {
                    sk,
                    uk,
                    payload: Bytes::from(payload),
                })
            }
        }
        OpCode::Connect => {
            let bridge = r.read_u16_le().await?;
            let sk = r.read_u64_le().await?;
            let uk = r.read_u64_le().await?;
            Ok(TcpFrame::Connect { bridge, sk, uk })
        }
        OpCode::TcpEstablished => {
            let client_sk = r.read_u64_le().await?;
            let client_uk = r.read_u64_le().await?;
            let server_sk = r.read_u64_le().await?;
            Ok(TcpFrame::TcpEstablished {
                client_sk,
                client_uk,
                server_sk,
            })
        }
        OpCode::TcpDisconnected => {
            let sk = r.read_u64_le().await?;
            let uk = r.read_u64_le().await?;
            Ok(TcpFrame::TcpDisconnected { sk, uk })
        }
        OpCode::TcpTimeout => Ok(TcpFrame::TcpTimeout),
        OpCode::UdpConnected | OpCode::Establish => Err(WireError::WrongChannel(op)),
    }
}

/// Reads one byte past the opcode when we suspect it's actually the first
/// byte of a little-endian `u64` (the non-bypass MESSAGE path re-enters the
/// bypass decoder's opcode-then-tag read; this helper stitches it back
/// together without a second buffered byte).
async fn read_u64_with_known_byte0<R: AsyncRead + Unpin>(
    r: &mut R,
    byte0: u8,
) -> Result<[u8; 8], WireError> {
    let mut buf = [0u8; 8];
    buf[0] = byte0;
    r.read_exact(&mut buf[1..]).await?;
    Ok(buf)
}

async fn read_opcode<R: AsyncRead + Unpin>(r: &mut R) -> Result<OpCode, WireError> {
    let b = r.read_u8().await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            WireError::Eof
        } else {
            WireError::Io(e)
        }
    })?;
    OpCode::try_from(b)
}

fn decode_config_body(body: &[u8]) -> Result<TcpFrame, WireError> {
    if body.len() < 3 {
        return Err(WireError::Malformed("config body too short"));
    }
    let proto = match body[0] {
        0 => super::bridge::BridgeProtocol::Tcp,
        1 => super::bridge::BridgeProtocol::Udp,
        _ => return Err(WireError::Malformed("config: unknown protocol byte")),
    };
    let dst_port = u16::from_le_bytes([body[1], body[2]]);
    let host_bytes = &body[3..];
    let nul = host_bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or(WireError::Malformed("config: host not NUL-terminated"))?;
    let host = String::from_utf8(host_bytes[..nul].to_vec())
        .map_err(|_| WireError::Malformed("config: host is not valid utf-8"))?;
    Ok(TcpFrame::Config {
        proto,
        dst_port,
        host,
    })
}

/// Reads one frame from `proto-UDP` out of a single received datagram.
pub fn decode_udp_frame(datagram: &[u8]) -> Result<UdpFrame, WireError> {
    let (&op_byte, rest) = datagram.split_first().ok_or(WireError::Eof)?;
    let op = OpCode::try_from(op_byte)?;
    match op {
        OpCode::Nop => Ok(UdpFrame::Nop),
        OpCode::Message => {
            if rest.len() < 6 {
                return Err(WireError::Malformed("udp message too short"));
            }
            let bridge = u16::from_le_bytes([rest[0], rest[1]]);
            let len = u32::from_le_bytes([rest[2], rest[3], rest[4], rest[5]]) as usize;
            let payload = &rest[6..];
            if payload.len() < len {
                return Err(WireError::Malformed("udp message shorter than declared length"));
            }
            Ok(UdpFrame::Message {
                bridge,
                payload: Bytes::copy_from_slice(&payload[..len]),
            })
        }
        OpCode::UdpConnected => Ok(UdpFrame::UdpConnected),
        other => Err(WireError::WrongChannel(other)),
    }
}

pub async fn write_nop<W: AsyncWrite + Unpin>(w: &mut W) -> Result<(), WireError> {
    w.write_u8(OpCode::Nop as u8).await?;
    Ok(())
}

pub async fn write_establish<W: AsyncWrite + Unpin>(w: &mut W) -> Result<(), WireError> {
    w.write_u8(OpCode::Establish as u8).await?;
    Ok(())
}

pub async fn write_connection_choice<W: AsyncWrite + Unpin>(
    w: &mut W,
    choice: Connection,
) -> Result<(), WireError> {
    w.write_u8(choice as u8).await?;
    Ok(())
}

pub async fn write_udp_bypass_choice<W: AsyncWrite + Unpin>(
    w: &mut W,
    choice: UdpBypass,
) -> Result<(), WireError> {
    w.write_u8(choice as u8).await?;
    Ok(())
}

pub async fn write_udp_port<W: AsyncWrite + Unpin>(w: &mut W, port: u16) -> Result<(), WireError> {
    w.write_u16_le(port).await?;
    Ok(())
}

pub async fn write_config<W: AsyncWrite + Unpin>(
    w: &mut W,
    proto: super::bridge::BridgeProtocol,
    dst_port: u16,
    host: &str,
) -> Result<(), WireError> {
    if host.len() > MAX_HOSTNAME_LEN {
        return Err(WireError::Malformed("hostname too long"));
    }
    let mut body = Vec::with_capacity(3 + host.len() + 1);
    body.push(match proto {
        super::bridge::BridgeProtocol::Tcp => 0,
        super::bridge::BridgeProtocol::Udp => 1,
    });
    body.extend_from_slice(&dst_port.to_le_bytes());
    body.extend_from_slice(host.as_bytes());
    body.push(0);

    w.write_u8(OpCode::Config as u8).await?;
    w.write_u16_le(body.len() as u16).await?;
    w.write_all(&body).await?;
    Ok(())
}

pub async fn write_connect<W: AsyncWrite + Unpin>(
    w: &mut W,
    bridge: u16,
    sk: u64,
    uk: u64,
) -> Result<(), WireError> {
    w.write_u8(OpCode::Connect as u8).await?;
    w.write_u16_le(bridge).await?;
    w.write_u64_le(sk).await?;
    w.write_u64_le(uk).await?;
    Ok(())
}

pub async fn write_tcp_established<W: AsyncWrite + Unpin>(
    w: &mut W,
    client_sk: u64,
    client_uk: u64,
    server_sk: u64,
) -> Result<(), WireError> {
    w.write_u8(OpCode::TcpEstablished as u8).await?;
    w.write_u64_le(client_sk).await?;
    w.write_u64_le(client_uk).await?;
    w.write_u64_le(server_sk).await?;
    Ok(())
}

pub async fn write_tcp_disconnected<W: AsyncWrite + Unpin>(
    w: &mut W,
    sk: u64,
    uk: u64,
) -> Result<(), WireError> {
    w.write_u8(OpCode::TcpDisconnected as u8).await?;
    w.write_u64_le(sk).await?;
    w.write_u64_le(uk).await?;
    Ok(())
}

pub async fn write_tcp_timeout<W: AsyncWrite + Unpin>(w: &mut W) -> Result<(), WireError> {
    w.write_u8(OpCode::TcpTimeout as u8).await?;
    Ok(())
}

/// Writes a sub-connection `MESSAGE` header into the tail of a
/// [`TCP_MESSAGE_HEADER_SIZE`]-byte region, returning the offset the caller
/// should start sending from (the header is right-aligned so the same
/// reservation also fits the shorter UDP-bypass header).
pub fn encode_sub_message_header(region: &mut [u8; TCP_MESSAGE_HEADER_SIZE], sk: u64, uk: u64, len: u32) -> usize {
    const BODY_LEN: usize = 1 + 8 + 8 + 4;
    let offset = TCP_MESSAGE_HEADER_SIZE - BODY_LEN;
    let h = &mut region[offset..];
    h[0] = OpCode::Message as u8;
    h[1..9].copy_from_slice(&sk.to_le_bytes());
    h[9..17].copy_from_slice(&uk.to_le_bytes());
    h[17..21].copy_from_slice(&len.to_le_bytes());
    offset
}

/// Writes the UDP-bypass `MESSAGE` header (travels on `proto-TCP`).
pub fn encode_udp_bypass_header(region: &mut [u8; TCP_MESSAGE_HEADER_SIZE], bridge: u16, len: u32) -> usize {
    const BODY_LEN: usize = 1 + 1 + 2 + 4;
    let offset = TCP_MESSAGE_HEADER_SIZE - BODY_LEN;
    let h = &mut region[offset..];
    h[0] = OpCode::Message as u8;
    h[1] = Protocol::Udp as u8;
    h[2..4].copy_from_slice(&bridge.to_le_bytes());
    h[4..8].copy_from_slice(&len.to_le_bytes());
    offset
}

/// Writes the direct `proto-UDP` `MESSAGE` header.
pub fn encode_udp_message_header(region: &mut [u8; UDP_MESSAGE_HEADER_SIZE], bridge: u16, len: u32) -> usize {
    const BODY_LEN: usize = 1 + 2 + 4;
    let offset = UDP_MESSAGE_HEADER_SIZE - BODY_LEN;
    let h = &mut region[offset..];
    h[0] = OpCode::Message as u8;
    h[1..3].copy_from_slice(&bridge.to_le_bytes());
    h[3..7].copy_from_slice(&len.to_le_bytes());
    offset
}

pub fn new_message_buffer() -> BytesMut {
    BytesMut::with_capacity(MESSAGE_BUFFER_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rallonge::bridge::BridgeProtocol;

    #[tokio::test]
    async fn nop_roundtrip() {
        let mut buf = Vec::new();
        write_nop(&mut buf).await.unwrap();
        let mut cur = &buf[..];
        assert_eq!(read_tcp_frame(&mut cur, false).await.unwrap(), TcpFrame::Nop);
    }

    #[tokio::test]
    async fn config_roundtrip() {
        let mut buf = Vec::new();
        write_config(&mut buf, BridgeProtocol::Udp, 25565, "example.internal")
            .await
            .unwrap();
        let mut cur = &buf[..];
        let frame = read_tcp_frame(&mut cur, false).await.unwrap();
        assert_eq!(
            frame,
            TcpFrame::Config {
                proto: BridgeProtocol::Udp,
                dst_port: 25565,
                host: "example.internal".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn message_roundtrip_non_bypass() {
        let mut buf = Vec::new();
        buf.push(OpCode::Message as u8);
        buf.extend_from_slice(&42u64.to_le_bytes());
        buf.extend_from_slice(&7u64.to_le_bytes());
        let payload = b"hello world";
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);

        let mut cur = &buf[..];
        let frame = read_tcp_frame(&mut cur, false).await.unwrap();
        assert_eq!(
            frame,
            TcpFrame::Message {
                sk: 42,
                uk: 7,
                payload: Bytes::from_static(payload),
            }
        );
    }

    #[tokio::test]
    async fn message_roundtrip_via_header_helper() {
        let mut region = [0u8; TCP_MESSAGE_HEADER_SIZE];
        let payload = b"abc";
        let offset = encode_sub_message_header(&mut region, 9, 100, payload.len() as u32);

        let mut wire = Vec::new();
        wire.extend_from_slice(&region[offset..]);
        wire.extend_from_slice(payload);

        let mut cur = &wire[..];
        let frame = read_tcp_frame(&mut cur, false).await.unwrap();
        assert_eq!(
            frame,
            TcpFrame::Message {
                sk: 9,
                uk: 100,
                payload: Bytes::from_static(payload),
            }
        );
    }

    #[tokio::test]
    async fn udp_bypass_message_roundtrip() {
        let mut region = [0u8; TCP_MESSAGE_HEADER_SIZE];
        let payload = b"ping";
        let offset = encode_udp_bypass_header(&mut region, 3, payload.len() as u32);

        let mut wire = Vec::new();
        wire.extend_from_slice(&region[offset..]);
        wire.extend_from_slice(payload);

        let mut cur = &wire[..];
        let frame = read_tcp_frame(&mut cur, true).await.unwrap();
        assert_eq!(
            frame,
            TcpFrame::UdpBypassMessage {
                bridge: 3,
                payload: Bytes::from_static(payload),
            }
        );
    }

    #[test]
    fn udp_message_roundtrip() {
        let mut region = [0u8; UDP_MESSAGE_HEADER_SIZE];
        let payload = b"datagram";
        let offset = encode_udp_message_header(&mut region, 1, payload.len() as u32);

        let mut datagram = Vec::new();
        datagram.extend_from_slice(&region[offset..]);
        datagram.extend_from_slice(payload);

        let frame = decode_udp_frame(&datagram).unwrap();
        assert_eq!(
            frame,
            UdpFrame::Message {
                bridge: 1,
                payload: Bytes::from_static(payload),
            }
        );
    }

    #[test]
    fn udp_connected_roundtrip() {
        let datagram = [OpCode::UdpConnected as u8];
        assert_eq!(decode_udp_frame(&datagram).unwrap(), UdpFrame::UdpConnected);
    }

    #[tokio::test]
    async fn unknown_opcode_is_an_error() {
        let buf = [200u8];
        let mut cur = &buf[..];
        let err = read_tcp_frame(&mut cur, false).await.unwrap_err();
        assert!(matches!(err, WireError::UnknownOpCode(200)));
    }

    #[tokio::test]
    async fn udp_connected_on_tcp_is_a_protocol_error() {
        let buf = [OpCode::UdpConnected as u8];
        let mut cur = &buf[..];
        let err = read_tcp_frame(&mut cur, false).await.unwrap_err();
        assert!(matches!(err, WireError::WrongChannel(OpCode::UdpConnected)));
    }

    #[test]
    fn config_on_udp_is_a_protocol_error() {
        let datagram = [OpCode::Config as u8];
        let err = decode_udp_frame(&datagram).unwrap_err();
        assert!(matches!(err, WireError::WrongChannel(OpCode::Config)));
    }

    #[tokio::test]
    async fn message_over_max_payload_is_rejected_before_reading_body() {
        let mut buf = Vec::new();
        buf.push(OpCode::Message as u8);
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&((MAX_MESSAGE_PAYLOAD as u32) + 1).to_le_bytes());
        // No payload bytes follow -- a correct implementation must reject the
        // declared length before attempting to read them.

        let mut cur = &buf[..];
        let err = read_tcp_frame(&mut cur, false).await.unwrap_err();
        assert!(matches!(err, WireError::Malformed(_)));
    }

    #[tokio::test]
    async fn message_of_exactly_max_payload_is_accepted() {
        let mut buf = Vec::new();
        buf.push(OpCode::Message as u8);
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&(MAX_MESSAGE_PAYLOAD as u32).to_le_bytes());
        buf.extend(std::iter::repeat(0xABu8).take(MAX_MESSAGE_PAYLOAD));

        let mut cur = &buf[..];
        let frame = read_tcp_frame(&mut cur, false).await.unwrap();
        match frame {
            TcpFrame::Message { payload, .. } => assert_eq!(payload.len(), MAX_MESSAGE_PAYLOAD),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
