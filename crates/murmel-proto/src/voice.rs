//! Voice datagrams carried over the encrypted UDP channel (or tunneled).
//!
//! Layout: one header byte (high 3 bits message type, low 5 bits target),
//! then a varint sequence number, then the codec payload, then an optional
//! 12-byte positional tail. Ping datagrams are the exception: header `0x20`
//! followed by an 8-byte big-endian timestamp to be echoed.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::{BufMut, Bytes};

use crate::error::ProtocolError;
use crate::varint::{read_varint, write_varint};

/// Header byte of a UDP ping datagram (type 1, target 0).
pub const UDP_PING_HEADER: u8 = 0x20;

/// Target value for ordinary speech to the current channel.
pub const TARGET_NORMAL: u8 = 0;
/// Target value for server loopback.
pub const TARGET_LOOPBACK: u8 = 1;
/// Target value for direct (server-addressed) speech.
pub const TARGET_DIRECT: u8 = 31;

/// Voice message types from the header's high 3 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VoiceKind {
    CeltAlpha = 0,
    Ping = 1,
    Speex = 2,
    CeltBeta = 3,
    Opus = 4,
}

impl VoiceKind {
    pub fn from_wire(raw: u8) -> Result<Self, ProtocolError> {
        match raw {
            0 => Ok(Self::CeltAlpha),
            1 => Ok(Self::Ping),
            2 => Ok(Self::Speex),
            3 => Ok(Self::CeltBeta),
            4 => Ok(Self::Opus),
            other => Err(ProtocolError::UnknownVoiceType(other)),
        }
    }
}

/// Codec payload of a voice datagram.
///
/// CELT and Speex carry a chain of frames, each prefixed by a byte whose low
/// 7 bits are the frame length and whose high bit means "more follow". Opus
/// carries a single frame behind a varint header: low 13 bits length, bit 13
/// the end-of-utterance terminator.
#[derive(Debug, Clone, PartialEq)]
pub enum VoicePayload {
    CeltAlpha(Vec<Bytes>),
    Speex(Vec<Bytes>),
    CeltBeta(Vec<Bytes>),
    Opus { frame: Bytes, terminator: bool },
}

impl VoicePayload {
    pub fn kind(&self) -> VoiceKind {
        match self {
            Self::CeltAlpha(_) => VoiceKind::CeltAlpha,
            Self::Speex(_) => VoiceKind::Speex,
            Self::CeltBeta(_) => VoiceKind::CeltBeta,
            Self::Opus { .. } => VoiceKind::Opus,
        }
    }

    /// Whether this payload closes the utterance.
    pub fn is_terminator(&self) -> bool {
        match self {
            Self::Opus { terminator, .. } => *terminator,
            // CELT/Speex end an utterance with an empty trailing frame.
            Self::CeltAlpha(frames) | Self::CeltBeta(frames) | Self::Speex(frames) => {
                frames.last().is_some_and(|f| f.is_empty())
            }
        }
    }
}

/// A parsed voice datagram.
///
/// `session` is present on clientbound datagrams only; the server knows the
/// sender of serverbound traffic from the crypto channel.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceDatagram {
    pub target: u8,
    pub session: Option<u32>,
    pub sequence: u64,
    pub payload: VoicePayload,
    pub position: Option<[f32; 3]>,
}

/// Anything that can arrive on the UDP channel after decryption.
#[derive(Debug, Clone, PartialEq)]
pub enum UdpPacket {
    Ping { timestamp: u64 },
    Voice(VoiceDatagram),
}

/// Encode a UDP ping datagram.
pub fn encode_ping(timestamp: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9);
    buf.put_u8(UDP_PING_HEADER);
    buf.put_u64(timestamp);
    buf
}

/// Encode a voice datagram. The session field is written only when present
/// (i.e. when re-encoding clientbound traffic, which tests do).
pub fn encode_voice(datagram: &VoiceDatagram) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.put_u8((datagram.payload.kind() as u8) << 5 | (datagram.target & 0x1F));
    if let Some(session) = datagram.session {
        write_varint(&mut buf, u64::from(session));
    }
    write_varint(&mut buf, datagram.sequence);

    match &datagram.payload {
        VoicePayload::Opus { frame, terminator } => {
            let mut header = frame.len() as u64 & 0x1FFF;
            if *terminator {
                header |= 0x2000;
            }
            write_varint(&mut buf, header);
            buf.put_slice(frame);
        }
        VoicePayload::CeltAlpha(frames)
        | VoicePayload::CeltBeta(frames)
        | VoicePayload::Speex(frames) => {
            for (i, frame) in frames.iter().enumerate() {
                let more = if i + 1 < frames.len() { 0x80 } else { 0x00 };
                buf.put_u8(more | (frame.len() as u8 & 0x7F));
                buf.put_slice(frame);
            }
        }
    }

    if let Some(pos) = datagram.position {
        for component in pos {
            let _ = buf.write_f32::<BigEndian>(component);
        }
    }
    buf
}

/// Decode a decrypted UDP datagram. `clientbound` selects whether a session
/// varint precedes the sequence number.
pub fn decode(data: &[u8], clientbound: bool) -> Result<UdpPacket, ProtocolError> {
    let mut cursor = Cursor::new(data);
    let header = cursor.read_u8()?;
    let kind = VoiceKind::from_wire(header >> 5)?;
    let target = header & 0x1F;

    if kind == VoiceKind::Ping {
        let timestamp = cursor.read_u64::<BigEndian>()?;
        return Ok(UdpPacket::Ping { timestamp });
    }

    let session = if clientbound {
        Some(read_varint(&mut cursor)? as u32)
    } else {
        None
    };
    let sequence = read_varint(&mut cursor)?;

    let payload = match kind {
        VoiceKind::Opus => {
            let opus_header = read_varint(&mut cursor)?;
            let terminator = opus_header & 0x2000 != 0;
            let len = (opus_header & 0x1FFF) as usize;
            let frame = take(&mut cursor, data, len)?;
            VoicePayload::Opus { frame, terminator }
        }
        VoiceKind::CeltAlpha | VoiceKind::CeltBeta | VoiceKind::Speex => {
            let mut frames = Vec::new();
            loop {
                let prefix = cursor.read_u8()?;
                let len = (prefix & 0x7F) as usize;
                frames.push(take(&mut cursor, data, len)?);
                if prefix & 0x80 == 0 {
                    break;
                }
            }
            match kind {
                VoiceKind::CeltAlpha => VoicePayload::CeltAlpha(frames),
                VoiceKind::CeltBeta => VoicePayload::CeltBeta(frames),
                _ => VoicePayload::Speex(frames),
            }
        }
        VoiceKind::Ping => unreachable!(),
    };

    let remaining = data.len() - cursor.position() as usize;
    let position = if remaining >= 12 {
        let mut pos = [0.0f32; 3];
        for component in &mut pos {
            *component = cursor.read_f32::<BigEndian>()?;
        }
        Some(pos)
    } else {
        None
    };

    Ok(UdpPacket::Voice(VoiceDatagram {
        target,
        session,
        sequence,
        payload,
        position,
    }))
}

/// Slice `len` bytes out of the underlying buffer at the cursor position.
fn take(cursor: &mut Cursor<&[u8]>, data: &[u8], len: usize) -> Result<Bytes, ProtocolError> {
    let start = cursor.position() as usize;
    let end = start
        .checked_add(len)
        .filter(|&e| e <= data.len())
        .ok_or(ProtocolError::Truncated)?;
    cursor.set_position(end as u64);
    Ok(Bytes::copy_from_slice(&data[start..end]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_roundtrip() {
        let encoded = encode_ping(0x0123_4567_89AB_CDEF);
        assert_eq!(encoded[0], UDP_PING_HEADER);
        assert_eq!(encoded.len(), 9);
        match decode(&encoded, true).unwrap() {
            UdpPacket::Ping { timestamp } => assert_eq!(timestamp, 0x0123_4567_89AB_CDEF),
            other => panic!("expected ping, got {other:?}"),
        }
    }

    #[test]
    fn opus_serverbound_roundtrip() {
        let datagram = VoiceDatagram {
            target: TARGET_NORMAL,
            session: None,
            sequence: 64,
            payload: VoicePayload::Opus {
                frame: Bytes::from_static(&[1, 2, 3, 4, 5]),
                terminator: false,
            },
            position: None,
        };
        let encoded = encode_voice(&datagram);
        match decode(&encoded, false).unwrap() {
            UdpPacket::Voice(d) => assert_eq!(d, datagram),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn opus_clientbound_carries_session() {
        let datagram = VoiceDatagram {
            target: 2,
            session: Some(42),
            sequence: 1000,
            payload: VoicePayload::Opus {
                frame: Bytes::from_static(&[9; 40]),
                terminator: true,
            },
            position: None,
        };
        let encoded = encode_voice(&datagram);
        match decode(&encoded, true).unwrap() {
            UdpPacket::Voice(d) => {
                assert_eq!(d.session, Some(42));
                assert_eq!(d.target, 2);
                assert!(d.payload.is_terminator());
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn celt_frame_chain_roundtrip() {
        let datagram = VoiceDatagram {
            target: TARGET_NORMAL,
            session: Some(7),
            sequence: 2,
            payload: VoicePayload::CeltBeta(vec![
                Bytes::from_static(&[0xAA; 38]),
                Bytes::from_static(&[0xBB; 40]),
            ]),
            position: None,
        };
        let encoded = encode_voice(&datagram);
        match decode(&encoded, true).unwrap() {
            UdpPacket::Voice(d) => assert_eq!(d, datagram),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn celt_empty_trailing_frame_terminates() {
        let payload = VoicePayload::CeltAlpha(vec![
            Bytes::from_static(&[1; 10]),
            Bytes::new(),
        ]);
        assert!(payload.is_terminator());
    }

    #[test]
    fn positional_tail_roundtrip() {
        let datagram = VoiceDatagram {
            target: TARGET_NORMAL,
            session: None,
            sequence: 5,
            payload: VoicePayload::Opus {
                frame: Bytes::from_static(&[7; 12]),
                terminator: false,
            },
            position: Some([1.0, -2.5, 0.25]),
        };
        let encoded = encode_voice(&datagram);
        match decode(&encoded, false).unwrap() {
            UdpPacket::Voice(d) => assert_eq!(d.position, Some([1.0, -2.5, 0.25])),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn truncated_opus_frame_fails() {
        let datagram = VoiceDatagram {
            target: TARGET_NORMAL,
            session: None,
            sequence: 0,
            payload: VoicePayload::Opus {
                frame: Bytes::from_static(&[1; 30]),
                terminator: false,
            },
            position: None,
        };
        let encoded = encode_voice(&datagram);
        assert!(decode(&encoded[..encoded.len() - 5], false).is_err());
    }

    #[test]
    fn unknown_voice_kind_fails() {
        // High 3 bits = 7 is not assigned.
        let data = [0xE0u8, 0x00, 0x00];
        assert!(matches!(
            decode(&data, false),
            Err(ProtocolError::UnknownVoiceType(7))
        ));
    }
}
