//! Cryptographic primitives for the secure FEC channel: session-key sealing
//! (Curve25519 + XSalsa20-Poly1305) and per-fragment AEAD (ChaCha20-Poly1305).

pub mod aead;
pub mod session;

pub use session::KeyMaterial;
