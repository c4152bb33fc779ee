//! gmcast wire format — every frame exchanged between mesh peers.
//!
//! These definitions ARE the protocol. A fixed 19-byte header (version,
//! type, flags, 16-byte source uuid) precedes every frame. Protocol
//! messages carry length-prefixed payloads after the header; user frames
//! carry application bytes untouched. All multi-byte integers are
//! big-endian; strings are u16-length-prefixed UTF-8; uuids are 16 bytes
//! in canonical order. Changing anything here is a wire-breaking change.

use bytes::{Buf, BufMut, BytesMut};
use static_assertions::const_assert_eq;
use thiserror::Error;
use uuid::Uuid;

use crate::addr::Addr;
use crate::link::LinkMap;

/// Current wire format version.
pub const WIRE_VERSION: u8 = 0;

/// Fixed header length: version + type + flags + source uuid.
pub const HEADER_LEN: usize = 3 + 16;

// Compile-time guard: receivers slice user payloads at this offset.
const_assert_eq!(HEADER_LEN, 19);

// ── Frame types ───────────────────────────────────────────────────────────────

/// Sent by the accepting side of a fresh connection.
pub const T_HANDSHAKE: u8 = 1;
/// Identity reply; sent by the dialer, then terminally by the acceptor.
pub const T_HANDSHAKE_RESPONSE: u8 = 2;
/// The sender's current set of established links.
pub const T_TOPOLOGY_CHANGE: u8 = 3;
/// Types at or above this carry opaque user payload after the header.
pub const T_USER_BASE: u8 = 0xFE;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("frame truncated: {needed} more bytes needed")]
    Truncated { needed: usize },
    #[error("unknown wire version: {0}")]
    Version(u8),
    #[error("unknown frame type: 0x{0:02x}")]
    Type(u8),
    #[error("malformed utf-8 in string field")]
    Utf8,
    #[error("malformed address field: '{0}'")]
    Addr(String),
}

// ── Header ────────────────────────────────────────────────────────────────────

/// The fixed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub frame_type: u8,
    pub flags: u8,
    pub source: Uuid,
}

impl Header {
    pub fn new(frame_type: u8, source: Uuid) -> Self {
        Self {
            version: WIRE_VERSION,
            frame_type,
            flags: 0,
            source,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.frame_type);
        buf.put_u8(self.flags);
        buf.put_slice(self.source.as_bytes());
    }

    /// Parse just the fixed header, advancing `buf` past it. User frames
    /// are routed on the header alone; the payload is never copied.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        if buf.remaining() < HEADER_LEN {
            return Err(WireError::Truncated {
                needed: HEADER_LEN - buf.remaining(),
            });
        }
        let version = buf.get_u8();
        if version != WIRE_VERSION {
            return Err(WireError::Version(version));
        }
        let frame_type = buf.get_u8();
        let flags = buf.get_u8();
        Ok(Header {
            version,
            frame_type,
            flags,
            source: get_uuid(buf)?,
        })
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// Payload shared by HANDSHAKE and HANDSHAKE_RESPONSE.
///
/// `handshake_uuid` names the connection itself: the acceptor mints it, the
/// dialer echoes it back, and duplicate connections are arbitrated by
/// comparing these on both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeBody {
    pub handshake_uuid: Uuid,
    pub group: String,
    pub listen_addr: Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Handshake {
        source: Uuid,
        body: HandshakeBody,
    },
    HandshakeResponse {
        source: Uuid,
        body: HandshakeBody,
    },
    TopologyChange {
        source: Uuid,
        links: LinkMap,
    },
    /// Header only; the application payload follows the header verbatim
    /// and is not inspected at this layer.
    User {
        source: Uuid,
    },
}

impl Message {
    pub fn source(&self) -> Uuid {
        match self {
            Message::Handshake { source, .. }
            | Message::HandshakeResponse { source, .. }
            | Message::TopologyChange { source, .. }
            | Message::User { source } => *source,
        }
    }

    pub fn frame_type(&self) -> u8 {
        match self {
            Message::Handshake { .. } => T_HANDSHAKE,
            Message::HandshakeResponse { .. } => T_HANDSHAKE_RESPONSE,
            Message::TopologyChange { .. } => T_TOPOLOGY_CHANGE,
            Message::User { .. } => T_USER_BASE,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Handshake { .. } => "HANDSHAKE",
            Message::HandshakeResponse { .. } => "HANDSHAKE_RESPONSE",
            Message::TopologyChange { .. } => "TOPOLOGY_CHANGE",
            Message::User { .. } => "USER",
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        Header::new(self.frame_type(), self.source()).encode(buf);
        match self {
            Message::Handshake { body, .. } | Message::HandshakeResponse { body, .. } => {
                put_str(buf, &body.group);
                put_str(buf, &body.listen_addr.to_string());
                buf.put_slice(body.handshake_uuid.as_bytes());
            }
            Message::TopologyChange { links, .. } => {
                debug_assert!(links.len() <= u16::MAX as usize);
                buf.put_u16(links.len() as u16);
                for (uuid, addr) in links {
                    buf.put_slice(uuid.as_bytes());
                    put_str(buf, &addr.to_string());
                }
            }
            Message::User { .. } => {}
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        let header = Header::decode(buf)?;
        let source = header.source;
        match header.frame_type {
            T_HANDSHAKE | T_HANDSHAKE_RESPONSE => {
                let group = get_str(buf)?;
                let listen_raw = get_str(buf)?;
                let listen_addr = listen_raw
                    .parse::<Addr>()
                    .map_err(|_| WireError::Addr(listen_raw))?;
                let handshake_uuid = get_uuid(buf)?;
                let body = HandshakeBody {
                    handshake_uuid,
                    group,
                    listen_addr,
                };
                if header.frame_type == T_HANDSHAKE {
                    Ok(Message::Handshake { source, body })
                } else {
                    Ok(Message::HandshakeResponse { source, body })
                }
            }
            T_TOPOLOGY_CHANGE => {
                if buf.remaining() < 2 {
                    return Err(WireError::Truncated {
                        needed: 2 - buf.remaining(),
                    });
                }
                let count = buf.get_u16() as usize;
                let mut links = LinkMap::new();
                for _ in 0..count {
                    let uuid = get_uuid(buf)?;
                    let addr_raw = get_str(buf)?;
                    let addr = addr_raw
                        .parse::<Addr>()
                        .map_err(|_| WireError::Addr(addr_raw))?;
                    links.insert(uuid, addr);
                }
                Ok(Message::TopologyChange { source, links })
            }
            t if t >= T_USER_BASE => Ok(Message::User { source }),
            t => Err(WireError::Type(t)),
        }
    }
}

// ── Field helpers ─────────────────────────────────────────────────────────────

fn put_str(buf: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= u16::MAX as usize);
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_str(buf: &mut impl Buf) -> Result<String, WireError> {
    if buf.remaining() < 2 {
        return Err(WireError::Truncated {
            needed: 2 - buf.remaining(),
        });
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated {
            needed: len - buf.remaining(),
        });
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| WireError::Utf8)
}

fn get_uuid(buf: &mut impl Buf) -> Result<Uuid, WireError> {
    if buf.remaining() < 16 {
        return Err(WireError::Truncated {
            needed: 16 - buf.remaining(),
        });
    }
    let mut raw = [0u8; 16];
    buf.copy_to_slice(&mut raw);
    Ok(Uuid::from_bytes(raw))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn body() -> HandshakeBody {
        HandshakeBody {
            handshake_uuid: Uuid::new_v4(),
            group: "galaxy".to_string(),
            listen_addr: "tcp://10.0.0.1:4567".parse().unwrap(),
        }
    }

    fn round_trip(msg: &Message) -> Message {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        let mut frame = buf.freeze();
        Message::decode(&mut frame).expect("decode failed")
    }

    #[test]
    fn handshake_round_trip() {
        let msg = Message::Handshake {
            source: Uuid::new_v4(),
            body: body(),
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn handshake_response_round_trip() {
        let msg = Message::HandshakeResponse {
            source: Uuid::new_v4(),
            body: body(),
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn topology_change_round_trip() {
        let mut links = LinkMap::new();
        links.insert(Uuid::new_v4(), "tcp://10.0.0.1:4567".parse().unwrap());
        links.insert(Uuid::new_v4(), "tcp://[::1]:9999".parse().unwrap());
        let msg = Message::TopologyChange {
            source: Uuid::new_v4(),
            links,
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn empty_topology_round_trip() {
        let msg = Message::TopologyChange {
            source: Uuid::new_v4(),
            links: LinkMap::new(),
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn user_frame_is_header_only() {
        let source = Uuid::new_v4();
        let mut buf = BytesMut::new();
        Message::User { source }.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);

        // Payload after the header must not confuse the decoder.
        buf.put_slice(b"application bytes");
        let mut frame = buf.freeze();
        let decoded = Message::decode(&mut frame).unwrap();
        assert_eq!(decoded, Message::User { source });
        assert_eq!(&frame[..], b"application bytes");
    }

    #[test]
    fn rejects_unknown_version() {
        let mut buf = BytesMut::new();
        Message::User {
            source: Uuid::new_v4(),
        }
        .encode(&mut buf);
        buf[0] = WIRE_VERSION.wrapping_add(1);
        let mut frame = buf.freeze();
        assert!(matches!(
            Message::decode(&mut frame),
            Err(WireError::Version(_))
        ));
    }

    #[test]
    fn rejects_unknown_type() {
        let mut buf = BytesMut::new();
        Message::User {
            source: Uuid::new_v4(),
        }
        .encode(&mut buf);
        buf[1] = 0x42;
        let mut frame = buf.freeze();
        assert_eq!(Message::decode(&mut frame), Err(WireError::Type(0x42)));
    }

    #[test]
    fn rejects_truncated_header() {
        let mut buf = BytesMut::new();
        Message::User {
            source: Uuid::new_v4(),
        }
        .encode(&mut buf);
        let mut frame = buf.freeze().slice(..HEADER_LEN - 4);
        assert!(matches!(
            Message::decode(&mut frame),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_truncated_handshake_body() {
        let msg = Message::Handshake {
            source: Uuid::new_v4(),
            body: body(),
        };
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        let full = buf.freeze();
        let mut frame = full.slice(..full.len() - 1);
        assert!(matches!(
            Message::decode(&mut frame),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_bad_utf8_group() {
        let msg = Message::Handshake {
            source: Uuid::new_v4(),
            body: body(),
        };
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        // First group byte sits right after the header and the u16 length.
        buf[HEADER_LEN + 2] = 0xFF;
        let mut frame = buf.freeze();
        assert_eq!(Message::decode(&mut frame), Err(WireError::Utf8));
    }

    #[test]
    fn rejects_unparsable_listen_addr() {
        let source = Uuid::new_v4();
        let mut buf = BytesMut::new();
        Header::new(T_HANDSHAKE, source).encode(&mut buf);
        put_str(&mut buf, "galaxy");
        put_str(&mut buf, "not-an-address");
        buf.put_slice(Uuid::new_v4().as_bytes());
        let mut frame = buf.freeze();
        assert!(matches!(
            Message::decode(&mut frame),
            Err(WireError::Addr(_))
        ));
    }

    #[test]
    fn header_source_survives() {
        let source = Uuid::new_v4();
        let mut buf = BytesMut::new();
        Message::User { source }.encode(&mut buf);
        let mut frame = buf.freeze();
        let header = Header::decode(&mut frame).unwrap();
        assert_eq!(header.source, source);
        assert_eq!(header.frame_type, T_USER_BASE);
        assert_eq!(header.flags, 0);
    }
}
