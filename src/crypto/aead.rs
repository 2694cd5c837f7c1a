//! Per-fragment AEAD: ChaCha20-Poly1305 keyed by the session key, nonce
//! derived from `(block_index, fragment_index)` so every fragment in the
//! channel's lifetime uses a unique nonce without needing to persist state
//! across restarts beyond the session key itself.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::error::ChannelError;
use crate::wire::data_nonce_bytes;

/// Expand the wire's 8-byte nonce to the 12-byte nonce the IETF construction
/// requires, left-padding with zeros.
fn expand_nonce(block_index: u64, fragment_index: u8) -> Nonce {
    let short = data_nonce_bytes(block_index, fragment_index);
    let mut full = [0u8; 12];
    full[4..].copy_from_slice(&short);
    Nonce::clone_from_slice(&full)
}

/// Encrypt one fragment's plaintext, authenticating `aad` alongside it.
pub fn encrypt_fragment(
    session_key: &[u8; 32],
    block_index: u64,
    fragment_index: u8,
    aad: &[u8],
    plaintext: &[u8],
) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(session_key));
    let nonce = expand_nonce(block_index, fragment_index);
    cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .expect("chacha20poly1305 encryption is infallible for valid key/nonce lengths")
}

/// Decrypt and authenticate one fragment. Returns
/// [`ChannelError::DecryptFailed`] on tag mismatch, which callers treat as a
/// transient per-fragment loss rather than a protocol violation.
pub fn decrypt_fragment(
    session_key: &[u8; 32],
    block_index: u64,
    fragment_index: u8,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, ChannelError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(session_key));
    let nonce = expand_nonce(block_index, fragment_index);
    cipher
        .decrypt(&nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| ChannelError::DecryptFailed {
            block_index,
            fragment_index,
        })
}
