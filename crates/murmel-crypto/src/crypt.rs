//! The keyed state of the UDP channel.
//!
//! Datagrams go out as `nonce[0]` ∥ `tag[0..3]` ∥ ciphertext. The 16-byte
//! nonces count as little-endian bignums, one step per datagram; the
//! receive side reconstructs the sender's full nonce from the single low
//! byte on the wire and a 256-entry history guards against replays.

use aes::cipher::KeyInit;
use aes::Aes128;
use rand::RngCore;
use thiserror::Error;

use crate::ocb2;

/// Key and nonce length.
pub const KEY_SIZE: usize = 16;

/// Bytes of overhead per datagram: nonce low byte plus truncated tag.
pub const HEADER_SIZE: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptError {
    #[error("channel is not keyed")]
    NotKeyed,

    #[error("datagram shorter than the crypt header")]
    TooShort,

    #[error("nonce already seen (replay)")]
    Replay,

    #[error("authentication tag mismatch")]
    TagMismatch,

    #[error("weak plaintext block refused")]
    WeakPlaintext,
}

/// Packet counters, local and as last reported by the peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CryptStats {
    pub good: u32,
    pub late: u32,
    pub lost: u32,
    pub resync: u32,
    pub remote_good: u32,
    pub remote_late: u32,
    pub remote_lost: u32,
    pub remote_resync: u32,
}

pub struct CryptState {
    cipher: Option<Aes128>,
    raw_key: [u8; KEY_SIZE],
    encrypt_nonce: [u8; KEY_SIZE],
    decrypt_nonce: [u8; KEY_SIZE],
    /// Low nonce byte → the high byte it was last accepted with.
    decrypt_history: [u8; 256],
    stats: CryptStats,
}

impl Default for CryptState {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptState {
    /// An unkeyed state; every operation fails until `set_key`.
    pub fn new() -> Self {
        Self {
            cipher: None,
            raw_key: [0u8; KEY_SIZE],
            encrypt_nonce: [0u8; KEY_SIZE],
            decrypt_nonce: [0u8; KEY_SIZE],
            decrypt_history: [0u8; 256],
            stats: CryptStats::default(),
        }
    }

    pub fn is_keyed(&self) -> bool {
        self.cipher.is_some()
    }

    /// Install key material, usually from a CryptSetup message.
    pub fn set_key(
        &mut self,
        key: [u8; KEY_SIZE],
        encrypt_nonce: [u8; KEY_SIZE],
        decrypt_nonce: [u8; KEY_SIZE],
    ) {
        self.cipher = Some(Aes128::new(&key.into()));
        self.raw_key = key;
        self.encrypt_nonce = encrypt_nonce;
        self.decrypt_nonce = decrypt_nonce;
        self.decrypt_history = [0u8; 256];
    }

    /// Fill key and nonces with secure random bytes.
    pub fn generate_key(&mut self) {
        let mut key = [0u8; KEY_SIZE];
        let mut encrypt_nonce = [0u8; KEY_SIZE];
        let mut decrypt_nonce = [0u8; KEY_SIZE];
        let mut rng = rand::rngs::OsRng;
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut encrypt_nonce);
        rng.fill_bytes(&mut decrypt_nonce);
        self.set_key(key, encrypt_nonce, decrypt_nonce);
    }

    /// Forcibly resynchronize the receive nonce (server-driven resync).
    pub fn set_decrypt_nonce(&mut self, nonce: [u8; KEY_SIZE]) {
        self.decrypt_nonce = nonce;
        self.stats.resync += 1;
    }

    pub fn set_encrypt_nonce(&mut self, nonce: [u8; KEY_SIZE]) {
        self.encrypt_nonce = nonce;
    }

    /// The current send nonce, for CryptSetup resync replies.
    pub fn encrypt_nonce(&self) -> [u8; KEY_SIZE] {
        self.encrypt_nonce
    }

    pub fn stats(&self) -> &CryptStats {
        &self.stats
    }

    /// Record the counters the peer reported in its last Ping.
    pub fn set_remote_stats(&mut self, good: u32, late: u32, lost: u32, resync: u32) {
        self.stats.remote_good = good;
        self.stats.remote_late = late;
        self.stats.remote_lost = lost;
        self.stats.remote_resync = resync;
    }

    /// Encrypt one datagram. The nonce advances only when the operation
    /// succeeds.
    pub fn encrypt(&mut self, plain: &[u8]) -> Result<Vec<u8>, CryptError> {
        let cipher = self.cipher.as_ref().ok_or(CryptError::NotKeyed)?;

        let mut nonce = self.encrypt_nonce;
        increment(&mut nonce);

        let (ciphertext, tag) = ocb2::encrypt(cipher, &nonce, plain, true)
            .map_err(|_| CryptError::WeakPlaintext)?;
        self.encrypt_nonce = nonce;

        let mut out = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
        out.push(nonce[0]);
        out.extend_from_slice(&tag[..3]);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt one datagram.
    ///
    /// Reconstructs the sender nonce from the wire byte: a forward step
    /// within 128 advances (counting skipped packets as lost), a backward
    /// step within 128 is accepted as late using the historical high bytes,
    /// and anything the history has already seen is a replay. On any
    /// failure the nonce state is left exactly as it was.
    pub fn decrypt(&mut self, source: &[u8]) -> Result<Vec<u8>, CryptError> {
        if source.len() < HEADER_SIZE {
            return Err(CryptError::TooShort);
        }
        let cipher = self.cipher.as_ref().ok_or(CryptError::NotKeyed)?;

        let ivbyte = source[0];
        let saved = self.decrypt_nonce;
        let last = self.decrypt_nonce[0];
        let forward = ivbyte.wrapping_sub(last);
        let mut late = false;
        let mut lost_gap = 0u32;

        if forward == 0 {
            // Same low byte as the newest accepted datagram.
            self.stats.lost += 1;
            return Err(CryptError::Replay);
        } else if forward < 0x80 {
            // Monotonic forward, possibly skipping lost packets.
            lost_gap = u32::from(forward) - 1;
            if ivbyte < last {
                increment_high(&mut self.decrypt_nonce);
            }
            self.decrypt_nonce[0] = ivbyte;
        } else {
            // Out of order within the window: replay the history.
            late = true;
            if ivbyte > last {
                // The packet belongs to the previous 256-run.
                decrement_high(&mut self.decrypt_nonce);
            }
            self.decrypt_nonce[0] = ivbyte;
            if self.decrypt_history[ivbyte as usize] == self.decrypt_nonce[1] {
                self.decrypt_nonce = saved;
                self.stats.lost += 1;
                return Err(CryptError::Replay);
            }
        }

        let nonce = self.decrypt_nonce;
        let (plain, tag) = match ocb2::decrypt(cipher, &nonce, &source[HEADER_SIZE..]) {
            Ok(result) => result,
            Err(_) => {
                self.decrypt_nonce = saved;
                return Err(CryptError::WeakPlaintext);
            }
        };

        if tag[..3] != source[1..HEADER_SIZE] {
            self.decrypt_nonce = saved;
            return Err(CryptError::TagMismatch);
        }

        self.decrypt_history[nonce[0] as usize] = nonce[1];
        if late {
            // Keep the newest nonce; this packet only filled a gap.
            self.decrypt_nonce = saved;
            self.stats.late += 1;
            self.stats.lost = self.stats.lost.saturating_sub(1);
        }
        self.stats.lost += lost_gap;
        self.stats.good += 1;
        Ok(plain)
    }
}

/// Step the little-endian bignum nonce.
fn increment(nonce: &mut [u8; KEY_SIZE]) {
    for byte in nonce.iter_mut() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

/// Carry an increment into bytes 1.. (byte 0 is set from the wire).
fn increment_high(nonce: &mut [u8; KEY_SIZE]) {
    for byte in nonce.iter_mut().skip(1) {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

/// Borrow a decrement through bytes 1..
fn decrement_high(nonce: &mut [u8; KEY_SIZE]) {
    for byte in nonce.iter_mut().skip(1) {
        *byte = byte.wrapping_sub(1);
        if *byte != 0xFF {
            break;
        }
    }
}
