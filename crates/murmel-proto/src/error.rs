use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame payload too large: {0} bytes (max {max})", max = crate::framing::MAX_PAYLOAD_LEN)]
    PayloadTooLarge(usize),

    #[error("unknown control message type: {0}")]
    UnknownMessageType(u16),

    #[error("unknown voice message type: {0}")]
    UnknownVoiceType(u8),

    #[error("datagram truncated")]
    Truncated,

    #[error("message decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_display() {
        let e = ProtocolError::UnknownMessageType(99);
        assert!(e.to_string().contains("99"));
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let e: ProtocolError = io_err.into();
        assert!(e.to_string().contains("eof"));
    }
}
