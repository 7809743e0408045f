//! Length-prefixed control frames on the TLS channel.
//!
//! Each frame is `u16 type` ∥ `u32 length` ∥ `length` payload bytes, all
//! big-endian. `UDPTunnel` frames carry a raw voice datagram as their
//! payload; every other type carries a protobuf message body.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Size of the type + length prefix.
pub const FRAME_HEADER_LEN: usize = 6;

/// Maximum accepted payload size: 8 MiB, enough for texture blobs.
pub const MAX_PAYLOAD_LEN: usize = 8 * 1024 * 1024;

/// Control message types, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    Version = 0,
    UdpTunnel = 1,
    Authenticate = 2,
    Ping = 3,
    Reject = 4,
    ServerSync = 5,
    ChannelRemove = 6,
    ChannelState = 7,
    UserRemove = 8,
    UserState = 9,
    BanList = 10,
    TextMessage = 11,
    PermissionDenied = 12,
    Acl = 13,
    QueryUsers = 14,
    CryptSetup = 15,
    ContextActionModify = 16,
    ContextAction = 17,
    UserList = 18,
    VoiceTarget = 19,
    PermissionQuery = 20,
    CodecVersion = 21,
    UserStats = 22,
    RequestBlob = 23,
    ServerConfig = 24,
}

impl MessageKind {
    pub fn from_wire(raw: u16) -> Option<Self> {
        use MessageKind::*;
        Some(match raw {
            0 => Version,
            1 => UdpTunnel,
            2 => Authenticate,
            3 => Ping,
            4 => Reject,
            5 => ServerSync,
            6 => ChannelRemove,
            7 => ChannelState,
            8 => UserRemove,
            9 => UserState,
            10 => BanList,
            11 => TextMessage,
            12 => PermissionDenied,
            13 => Acl,
            14 => QueryUsers,
            15 => CryptSetup,
            16 => ContextActionModify,
            17 => ContextAction,
            18 => UserList,
            19 => VoiceTarget,
            20 => PermissionQuery,
            21 => CodecVersion,
            22 => UserStats,
            23 => RequestBlob,
            24 => ServerConfig,
            _ => return None,
        })
    }
}

/// Frame a payload for transmission.
pub fn encode_frame(kind: MessageKind, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u16(kind as u16);
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Attempt to extract one complete frame from the accumulator.
///
/// Returns `Ok(Some((type, payload)))` when a full frame is buffered,
/// `Ok(None)` when more bytes are needed, or an error when the advertised
/// length exceeds the cap (framing corruption — the connection must close).
///
/// Advances the buffer past the consumed frame. The raw type is returned
/// untranslated so unknown kinds can be logged and skipped by the caller.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<(u16, Bytes)>, ProtocolError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    let kind = u16::from_be_bytes([buf[0], buf[1]]);
    let length = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;

    if length > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge(length));
    }

    if buf.len() < FRAME_HEADER_LEN + length {
        return Ok(None);
    }

    buf.advance(FRAME_HEADER_LEN);
    let payload = buf.split_to(length).freeze();
    Ok(Some((kind, payload)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let encoded = encode_frame(MessageKind::Ping, b"abc").unwrap();
        let mut buf = BytesMut::from(&encoded[..]);
        let (kind, payload) = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(kind, MessageKind::Ping as u16);
        assert_eq!(&payload[..], b"abc");
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits() {
        let encoded = encode_frame(MessageKind::UserState, &[7u8; 32]).unwrap();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&encoded[..4]);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[4..10]);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[10..]);
        assert!(try_decode_frame(&mut buf).unwrap().is_some());
    }

    #[test]
    fn frames_preserve_order_and_bytes() {
        let payloads: Vec<Vec<u8>> = (0u8..10).map(|i| vec![i; i as usize * 3]).collect();
        let mut buf = BytesMut::new();
        for (i, p) in payloads.iter().enumerate() {
            let kind = if i % 2 == 0 {
                MessageKind::TextMessage
            } else {
                MessageKind::UserState
            };
            buf.extend_from_slice(&encode_frame(kind, p).unwrap());
        }

        for (i, expected) in payloads.iter().enumerate() {
            let (_, payload) = try_decode_frame(&mut buf).unwrap().unwrap();
            assert_eq!(&payload[..], &expected[..], "frame {i}");
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_length_is_fatal() {
        let mut buf = BytesMut::new();
        buf.put_u16(MessageKind::UserState as u16);
        buf.put_u32((MAX_PAYLOAD_LEN + 1) as u32);
        assert!(matches!(
            try_decode_frame(&mut buf),
            Err(ProtocolError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn unknown_kind_passes_through_raw() {
        let mut buf = BytesMut::new();
        buf.put_u16(0x7777);
        buf.put_u32(1);
        buf.put_u8(0xAA);
        let (kind, payload) = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(kind, 0x7777);
        assert_eq!(MessageKind::from_wire(kind), None);
        assert_eq!(&payload[..], &[0xAA]);
    }
}
