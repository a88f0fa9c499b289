//! Opaque payload sealing (XChaCha20-Poly1305, nonce prepended).
//!
//! The coordination engine treats this as an opaque capability: the store
//! seals message content at rest with it and never inspects the result.  Key
//! agreement and per-session encryption are owned by clients and are out of
//! scope here.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use thiserror::Error;

use crate::constants::NONCE_SIZE;

pub type SealKey = [u8; 32];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SealError {
    #[error("sealing failed")]
    SealFailed,

    #[error("opening failed: invalid ciphertext or wrong key")]
    OpenFailed,
}

pub fn generate_key() -> SealKey {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
pub fn seal(key: &SealKey, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| SealError::SealFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn open(key: &SealKey, data: &[u8]) -> Result<Vec<u8>, SealError> {
    if data.len() < NONCE_SIZE {
        return Err(SealError::OpenFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| SealError::OpenFailed)
}
