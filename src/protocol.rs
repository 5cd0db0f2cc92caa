//! Control-channel wire protocol.
//!
//! Every command travels as one self-delimiting frame:
//! `[len: u32 BE][tag: u8][payload]`, where `len` covers the tag byte plus
//! the payload and the payload is the bincode encoding of the tag-specific
//! tuple. Frames may be split or coalesced arbitrarily by the transport; the
//! [`FrameDecoder`] buffers partial input across reads.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const TAG_CONNECT: u8 = 0;
pub const TAG_ASSIGN: u8 = 1;
pub const TAG_PING: u8 = 2;
pub const TAG_PONG: u8 = 3;
pub const TAG_TUNNEL_REQ: u8 = 4;
pub const TAG_TUNNEL_RES: u8 = 5;

pub const TUNNEL_TYPE_TCP: u8 = 0;
pub const TUNNEL_TYPE_UDP: u8 = 1;

/// Upper bound on a single frame. Control commands are tiny; anything near
/// this size means the stream is corrupt.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("empty frame")]
    EmptyFrame,
    #[error("unknown command tag {0:#04x}")]
    UnknownTag(u8),
    #[error("unknown tunnel type {0:#04x}")]
    UnknownTunnelType(u8),
    #[error("payload: {0}")]
    Payload(#[from] bincode::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelType {
    Tcp,
    Udp,
}

impl TunnelType {
    pub fn as_u8(self) -> u8 {
        match self {
            TunnelType::Tcp => TUNNEL_TYPE_TCP,
            TunnelType::Udp => TUNNEL_TYPE_UDP,
        }
    }
}

impl TryFrom<u8> for TunnelType {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, ProtocolError> {
        match v {
            TUNNEL_TYPE_TCP => Ok(TunnelType::Tcp),
            TUNNEL_TYPE_UDP => Ok(TunnelType::Udp),
            other => Err(ProtocolError::UnknownTunnelType(other)),
        }
    }
}

/// A decoded control command with its payload fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Connect {
        site_name: String,
    },
    Assign {
        session_id: u64,
    },
    Ping {
        message: String,
    },
    Pong {
        message: String,
    },
    TunnelReq {
        server_host: String,
        server_port: u16,
        client_host: String,
        client_port: u16,
        tunnel_type: u8,
        tunnel_id: u64,
    },
    // Defined on the wire but not driven by either role yet.
    TunnelRes {
        tunnel_id: u64,
        success: bool,
        message: String,
    },
}

impl Command {
    pub fn tag(&self) -> u8 {
        match self {
            Command::Connect { .. } => TAG_CONNECT,
            Command::Assign { .. } => TAG_ASSIGN,
            Command::Ping { .. } => TAG_PING,
            Command::Pong { .. } => TAG_PONG,
            Command::TunnelReq { .. } => TAG_TUNNEL_REQ,
            Command::TunnelRes { .. } => TAG_TUNNEL_RES,
        }
    }

    /// Serialize into one complete frame.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let body = match self {
            Command::Connect { site_name } => bincode::serialize(&(site_name,))?,
            Command::Assign { session_id } => bincode::serialize(&(session_id,))?,
            Command::Ping { message } => bincode::serialize(&(message,))?,
            Command::Pong { message } => bincode::serialize(&(message,))?,
            Command::TunnelReq {
                server_host,
                server_port,
                client_host,
                client_port,
                tunnel_type,
                tunnel_id,
            } => bincode::serialize(&(
                server_host,
                server_port,
                client_host,
                client_port,
                tunnel_type,
                tunnel_id,
            ))?,
            Command::TunnelRes {
                tunnel_id,
                success,
                message,
            } => bincode::serialize(&(tunnel_id, success, message))?,
        };

        let n = body.len() + 1;
        if n > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge(n));
        }

        let mut buf = BytesMut::with_capacity(4 + n);
        buf.put_u32(n as u32);
        buf.put_u8(self.tag());
        buf.extend_from_slice(&body);
        Ok(buf.freeze())
    }

    /// Decode the payload of a framed command.
    ///
    /// A mismatched payload (or unknown tag) only poisons this one frame; the
    /// decoder has already consumed it, so the caller can log and move on.
    pub fn decode(frame: &RawFrame) -> Result<Command, ProtocolError> {
        match frame.tag {
            TAG_CONNECT => {
                let (site_name,): (String,) = bincode::deserialize(&frame.body)?;
                Ok(Command::Connect { site_name })
            }
            TAG_ASSIGN => {
                let (session_id,): (u64,) = bincode::deserialize(&frame.body)?;
                Ok(Command::Assign { session_id })
            }
            TAG_PING => {
                let (message,): (String,) = bincode::deserialize(&frame.body)?;
                Ok(Command::Ping { message })
            }
            TAG_PONG => {
                let (message,): (String,) = bincode::deserialize(&frame.body)?;
                Ok(Command::Pong { message })
            }
            TAG_TUNNEL_REQ => {
                let (server_host, server_port, client_host, client_port, tunnel_type, tunnel_id): (
                    String,
                    u16,
                    String,
                    u16,
                    u8,
                    u64,
                ) = bincode::deserialize(&frame.body)?;
                Ok(Command::TunnelReq {
                    server_host,
                    server_port,
                    client_host,
                    client_port,
                    tunnel_type,
                    tunnel_id,
                })
            }
            TAG_TUNNEL_RES => {
                let (tunnel_id, success, message): (u64, bool, String) =
                    bincode::deserialize(&frame.body)?;
                Ok(Command::TunnelRes {
                    tunnel_id,
                    success,
                    message,
                })
            }
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

/// A framed command before payload decoding.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub tag: u8,
    pub body: Bytes,
}

/// Incremental frame extractor.
///
/// The internal buffer survives across reads: feed it whatever chunk the
/// socket produced and drain complete frames until `Ok(None)`.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Extract the next complete frame, if the buffer holds one.
    ///
    /// Errors here mean the framing layer itself is corrupt and the stream
    /// cannot be resynchronized.
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>, ProtocolError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&self.buf[..4]);
        let n = u32::from_be_bytes(len_bytes) as usize;

        if n == 0 {
            return Err(ProtocolError::EmptyFrame);
        }
        if n > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge(n));
        }
        if self.buf.len() < 4 + n {
            return Ok(None);
        }

        let _ = self.buf.split_to(4);
        let mut body = self.buf.split_to(n);
        let tag = body[0];
        let body = body.split_off(1).freeze();
        Ok(Some(RawFrame { tag, body }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_commands() -> Vec<Command> {
        vec![
            Command::Connect {
                site_name: "site-a".into(),
            },
            Command::Assign {
                session_id: 0xDEAD_BEEF_CAFE_F00D,
            },
            Command::Ping {
                message: "PING".into(),
            },
            Command::Pong {
                message: "PONG".into(),
            },
            Command::TunnelReq {
                server_host: "10.1.1.47".into(),
                server_port: 51234,
                client_host: "127.0.0.1".into(),
                client_port: 22,
                tunnel_type: TUNNEL_TYPE_TCP,
                tunnel_id: 42,
            },
            Command::TunnelRes {
                tunnel_id: 42,
                success: true,
                message: "ok".into(),
            },
        ]
    }

    fn decode_all(decoder: &mut FrameDecoder) -> Vec<Command> {
        let mut out = Vec::new();
        while let Some(raw) = decoder.next_frame().unwrap() {
            out.push(Command::decode(&raw).unwrap());
        }
        out
    }

    #[test]
    fn roundtrip_whole_frames() {
        let mut decoder = FrameDecoder::new();
        for cmd in sample_commands() {
            decoder.extend(&cmd.encode().unwrap());
            let got = decode_all(&mut decoder);
            assert_eq!(got, vec![cmd]);
        }
    }

    #[test]
    fn decoding_is_chunk_boundary_invariant() {
        let cmds = sample_commands();
        let mut wire = Vec::new();
        for cmd in &cmds {
            wire.extend_from_slice(&cmd.encode().unwrap());
        }

        for chunk_size in [1usize, 2, 3, 7, 16, wire.len()] {
            let mut decoder = FrameDecoder::new();
            let mut got = Vec::new();
            for chunk in wire.chunks(chunk_size) {
                decoder.extend(chunk);
                got.extend(decode_all(&mut decoder));
            }
            assert_eq!(got, cmds, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn multiple_frames_in_one_read() {
        let mut decoder = FrameDecoder::new();
        let ping = Command::Ping {
            message: "hi".into(),
        };
        let pong = Command::Pong {
            message: "PONG".into(),
        };
        let mut wire = ping.encode().unwrap().to_vec();
        wire.extend_from_slice(&pong.encode().unwrap());
        decoder.extend(&wire);
        assert_eq!(decode_all(&mut decoder), vec![ping, pong]);
    }

    #[test]
    fn incomplete_frame_yields_nothing() {
        let wire = Command::Connect {
            site_name: "partial".into(),
        }
        .encode()
        .unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.extend(&wire[..wire.len() - 1]);
        assert!(decoder.next_frame().unwrap().is_none());

        decoder.extend(&wire[wire.len() - 1..]);
        assert!(decoder.next_frame().unwrap().is_some());
    }

    #[test]
    fn oversized_frame_is_fatal() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&((MAX_FRAME_BYTES as u32 + 1).to_be_bytes()));
        match decoder.next_frame() {
            Err(ProtocolError::FrameTooLarge(n)) => assert!(n > MAX_FRAME_BYTES),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_rejected_per_frame() {
        let raw = RawFrame {
            tag: 0xEE,
            body: Bytes::new(),
        };
        match Command::decode(&raw) {
            Err(ProtocolError::UnknownTag(0xEE)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn mismatched_payload_is_rejected_per_frame() {
        // ASSIGN expects a (u64,) payload; an empty body cannot satisfy it.
        let raw = RawFrame {
            tag: TAG_ASSIGN,
            body: Bytes::new(),
        };
        assert!(matches!(
            Command::decode(&raw),
            Err(ProtocolError::Payload(_))
        ));
    }

    #[test]
    fn tunnel_type_conversion() {
        assert_eq!(TunnelType::try_from(0).unwrap(), TunnelType::Tcp);
        assert_eq!(TunnelType::try_from(1).unwrap(), TunnelType::Udp);
        assert!(matches!(
            TunnelType::try_from(7),
            Err(ProtocolError::UnknownTunnelType(7))
        ));
    }
}
