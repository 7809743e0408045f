//! Client core for the Mumble voice protocol: TLS control channel,
//! OCB2-encrypted UDP voice, a replicated server model with ordered
//! observer callbacks, and the audio pipeline glue.

pub mod audio;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod model;
pub mod stats;
mod router;
mod verify;

pub use audio::AudioBridge;
pub use config::{ClientIdentity, ConnectConfig};
pub use connection::{Connection, ConnectionState};
pub use error::ClientError;
pub use events::{ModelObserver, TextMessageEvent, UserGone};
pub use model::{ServerModel, ModelState};

pub use murmel_audio::config::AudioConfig;
pub use murmel_proto::control::ControlMessage;
