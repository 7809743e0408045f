//! Wire formats of the voice protocol: control-channel framing and
//! messages, the varint form, and UDP voice datagrams.

pub mod control;
pub mod error;
pub mod framing;
pub mod varint;
pub mod version;
pub mod voice;

pub use error::ProtocolError;
pub use framing::MessageKind;
