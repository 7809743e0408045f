//! Authenticated encryption for the UDP voice channel.

mod crypt;
mod ocb2;

pub use crypt::{CryptError, CryptState, CryptStats, HEADER_SIZE, KEY_SIZE};
