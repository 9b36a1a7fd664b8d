//! VNC password authentication.
//!
//! The challenge/response scheme encrypts a 16-byte server challenge with DES
//! in ECB mode. The key is the first 8 bytes of the password, zero-padded, and
//! the bit order within each key byte is reversed. The reversal is a quirk of
//! the original VNC implementation that every compatible server expects; a
//! straight DES key produces a response real servers reject.

use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;

/// Encrypts a 16-byte VNC authentication challenge with the given password.
pub fn encrypt_challenge(password: &str, challenge: &[u8; 16]) -> [u8; 16] {
    let key = GenericArray::from(vnc_key(password));
    let cipher = Des::new(&key);

    let mut response = [0u8; 16];
    for (plain, out) in challenge.chunks(8).zip(response.chunks_mut(8)) {
        let mut block = GenericArray::clone_from_slice(plain);
        cipher.encrypt_block(&mut block);
        out.copy_from_slice(&block);
    }
    response
}

fn vnc_key(password: &str) -> [u8; 8] {
    let mut key = [0u8; 8];
    for (slot, byte) in key.iter_mut().zip(password.bytes()) {
        *slot = byte.reverse_bits();
    }
    key
}
