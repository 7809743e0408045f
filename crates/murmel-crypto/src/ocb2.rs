//! OCB2 mode over an AES-128 block cipher.
//!
//! Ciphertext is the same length as the plaintext; the 128-bit tag is
//! truncated by the caller for the wire. Both directions screen for the
//! all-zero penultimate block that enables the known OCB2 forgery: such
//! inputs are reported as weak and the operation is refused.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt};
use aes::Aes128;

pub(crate) const BLOCK_SIZE: usize = 16;

pub(crate) type Block = [u8; BLOCK_SIZE];

/// Marker for a refused weak-plaintext operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WeakBlock;

fn encrypt_block(cipher: &Aes128, block: &mut Block) {
    cipher.encrypt_block(GenericArray::from_mut_slice(block));
}

fn decrypt_block(cipher: &Aes128, block: &mut Block) {
    cipher.decrypt_block(GenericArray::from_mut_slice(block));
}

fn xor_assign(dst: &mut Block, src: &Block) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// Multiply by x in GF(2^128): shift the 128-bit big-endian value left one
/// bit, folding the carry back with the field polynomial 0x87.
fn double(block: &mut Block) {
    let carry = block[0] >> 7;
    for i in 0..BLOCK_SIZE - 1 {
        block[i] = (block[i] << 1) | (block[i + 1] >> 7);
    }
    block[BLOCK_SIZE - 1] = (block[BLOCK_SIZE - 1] << 1) ^ (carry * 0x87);
}

/// Multiply by x+1: `triple(b) == b ^ double(b)`.
fn triple(block: &mut Block) {
    let mut doubled = *block;
    double(&mut doubled);
    xor_assign(block, &doubled);
}

/// Whether a penultimate block has the shape the forgery needs: all zero up
/// to the last byte.
fn is_weak(block: &[u8]) -> bool {
    block[..BLOCK_SIZE - 1].iter().all(|&b| b == 0)
}

/// OCB2 encryption. Returns ciphertext and the full 16-byte tag.
///
/// With `refuse_weak` set, a weak penultimate plaintext block aborts the
/// operation. Tests disable the check to produce inputs for the decrypt-side
/// detection.
pub(crate) fn encrypt(
    cipher: &Aes128,
    nonce: &Block,
    plain: &[u8],
    refuse_weak: bool,
) -> Result<(Vec<u8>, Block), WeakBlock> {
    let mut delta = *nonce;
    encrypt_block(cipher, &mut delta);
    let mut checksum = [0u8; BLOCK_SIZE];
    let mut out = Vec::with_capacity(plain.len());

    let mut rest = plain;
    while rest.len() > BLOCK_SIZE {
        let (head, tail) = rest.split_at(BLOCK_SIZE);
        if refuse_weak && tail.len() <= BLOCK_SIZE && is_weak(head) {
            return Err(WeakBlock);
        }
        let block: Block = head.try_into().expect("exact block");
        double(&mut delta);
        let mut tmp = block;
        xor_assign(&mut tmp, &delta);
        encrypt_block(cipher, &mut tmp);
        xor_assign(&mut tmp, &delta);
        out.extend_from_slice(&tmp);
        xor_assign(&mut checksum, &block);
        rest = tail;
    }

    // Final (possibly short) block: XOR against a pad derived from the
    // bit length, folding the pad tail into the checksum.
    double(&mut delta);
    let len = rest.len();
    let mut pad = [0u8; BLOCK_SIZE];
    pad[BLOCK_SIZE - 4..].copy_from_slice(&((len as u32) * 8).to_be_bytes());
    xor_assign(&mut pad, &delta);
    encrypt_block(cipher, &mut pad);

    let mut last = [0u8; BLOCK_SIZE];
    last[..len].copy_from_slice(rest);
    last[len..].copy_from_slice(&pad[len..]);
    xor_assign(&mut checksum, &last);
    xor_assign(&mut last, &pad);
    out.extend_from_slice(&last[..len]);

    let mut tag = delta;
    triple(&mut tag);
    xor_assign(&mut tag, &checksum);
    encrypt_block(cipher, &mut tag);

    Ok((out, tag))
}

/// OCB2 decryption. Returns plaintext and the computed tag; the caller is
/// responsible for comparing it against the received (truncated) tag.
///
/// A decrypted weak penultimate block means the ciphertext could be part of
/// the forgery and is always refused.
pub(crate) fn decrypt(
    cipher: &Aes128,
    nonce: &Block,
    encrypted: &[u8],
) -> Result<(Vec<u8>, Block), WeakBlock> {
    let mut delta = *nonce;
    encrypt_block(cipher, &mut delta);
    let mut checksum = [0u8; BLOCK_SIZE];
    let mut out = Vec::with_capacity(encrypted.len());
    let mut weak = false;

    let mut rest = encrypted;
    while rest.len() > BLOCK_SIZE {
        let (head, tail) = rest.split_at(BLOCK_SIZE);
        double(&mut delta);
        let mut tmp: Block = head.try_into().expect("exact block");
        xor_assign(&mut tmp, &delta);
        decrypt_block(cipher, &mut tmp);
        xor_assign(&mut tmp, &delta);
        if tail.len() <= BLOCK_SIZE && is_weak(&tmp) {
            weak = true;
        }
        xor_assign(&mut checksum, &tmp);
        out.extend_from_slice(&tmp);
        rest = tail;
    }

    double(&mut delta);
    let len = rest.len();
    let mut pad = [0u8; BLOCK_SIZE];
    pad[BLOCK_SIZE - 4..].copy_from_slice(&((len as u32) * 8).to_be_bytes());
    xor_assign(&mut pad, &delta);
    encrypt_block(cipher, &mut pad);

    let mut last = [0u8; BLOCK_SIZE];
    last[..len].copy_from_slice(rest);
    xor_assign(&mut last, &pad);
    xor_assign(&mut checksum, &last);
    out.extend_from_slice(&last[..len]);

    let mut tag = delta;
    triple(&mut tag);
    xor_assign(&mut tag, &checksum);
    encrypt_block(cipher, &mut tag);

    if weak {
        return Err(WeakBlock);
    }
    Ok((out, tag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::KeyInit;

    fn cipher() -> Aes128 {
        Aes128::new(&[0x42u8; 16].into())
    }

    #[test]
    fn double_matches_field_polynomial() {
        let mut block = [0u8; 16];
        block[0] = 0x80;
        double(&mut block);
        let mut expected = [0u8; 16];
        expected[15] = 0x87;
        assert_eq!(block, expected);

        let mut block = [0u8; 16];
        block[15] = 0x01;
        double(&mut block);
        let mut expected = [0u8; 16];
        expected[15] = 0x02;
        assert_eq!(block, expected);
    }

    #[test]
    fn triple_is_double_xor_identity() {
        let mut a = *b"0123456789abcdef";
        let mut b = a;
        triple(&mut a);
        let orig = b;
        double(&mut b);
        xor_assign(&mut b, &orig);
        assert_eq!(a, b);
    }

    #[test]
    fn roundtrip_various_lengths() {
        let cipher = cipher();
        let nonce = [0x11u8; 16];
        for len in [1usize, 15, 16, 17, 31, 32, 33, 480, 1021] {
            let plain: Vec<u8> = (0..len).map(|i| (i % 251 + 1) as u8).collect();
            let (ct, tag) = encrypt(&cipher, &nonce, &plain, true).unwrap();
            assert_eq!(ct.len(), plain.len());
            let (decrypted, tag2) = decrypt(&cipher, &nonce, &ct).unwrap();
            assert_eq!(decrypted, plain, "len {len}");
            assert_eq!(tag, tag2, "len {len}");
        }
    }

    #[test]
    fn ciphertext_differs_from_plaintext() {
        let cipher = cipher();
        let plain = [0x55u8; 64];
        let (ct, _) = encrypt(&cipher, &[0u8; 16], &plain, true).unwrap();
        assert_ne!(&ct[..], &plain[..]);
    }

    #[test]
    fn tag_depends_on_nonce() {
        let cipher = cipher();
        let plain = [0x55u8; 20];
        let (_, tag_a) = encrypt(&cipher, &[0u8; 16], &plain, true).unwrap();
        let (_, tag_b) = encrypt(&cipher, &[1u8; 16], &plain, true).unwrap();
        assert_ne!(tag_a, tag_b);
    }

    #[test]
    fn weak_plaintext_refused_on_encrypt() {
        let cipher = cipher();
        let mut plain = vec![0u8; 24];
        plain[16..].fill(7);
        assert_eq!(
            encrypt(&cipher, &[0u8; 16], &plain, true),
            Err(WeakBlock)
        );
        // The same shape with the check disabled goes through.
        assert!(encrypt(&cipher, &[0u8; 16], &plain, false).is_ok());
    }

    #[test]
    fn weak_plaintext_detected_on_decrypt() {
        let cipher = cipher();
        let mut plain = vec![0u8; 24];
        plain[15] = 1;
        plain[16..].fill(9);
        let (ct, _) = encrypt(&cipher, &[0u8; 16], &plain, false).unwrap();
        assert_eq!(decrypt(&cipher, &[0u8; 16], &ct), Err(WeakBlock));
    }

    #[test]
    fn nonweak_first_block_passes() {
        let cipher = cipher();
        let mut plain = vec![0u8; 24];
        plain[3] = 1; // non-zero before the last byte
        plain[16..].fill(7);
        assert!(encrypt(&cipher, &[0u8; 16], &plain, true).is_ok());
    }
}
