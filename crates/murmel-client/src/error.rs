use murmel_crypto::CryptError;
use murmel_proto::control::RejectKind;
use murmel_proto::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("server certificate was not trusted")]
    TrustFailure,

    #[error("server rejected the connection: {reason}")]
    Rejected { kind: RejectKind, reason: String },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("crypto error: {0}")]
    Crypt(#[from] CryptError),

    #[error("invalid server name {0:?}")]
    InvalidServerName(String),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("{0} is not valid in the current connection state")]
    InvalidState(&'static str),

    #[error("connection is closed")]
    Closed,
}
