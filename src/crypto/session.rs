//! Long-lived keypair management and sealed-box framing for `SESSION`
//! packets. The TX side seals a [`SessionDescriptor`] to the RX side's public
//! key; the RX side unseals it with its own secret key and the TX side's
//! public key, which together authenticate the sender the way an anonymous
//! sealed box cannot.

use anyhow::{ensure, Context, Result};
use crypto_box::aead::{Aead, AeadCore, OsRng};
use crypto_box::{PublicKey, SalsaBox, SecretKey};

use crate::error::ChannelError;
use crate::wire::{SessionDescriptor, SESSION_NONCE_LEN};

/// A long-lived Curve25519 keypair plus the single remote peer's public key
/// this crate expects to talk to. Ground-station links are point-to-point,
/// so there is exactly one remote key, not a keyring.
pub struct KeyMaterial {
    pub own_secret: SecretKey,
    pub remote_public: PublicKey,
}

impl KeyMaterial {
    /// Load a 64-byte key file: first 32 bytes are this side's secret key,
    /// next 32 are the remote side's public key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() == 64,
            "key file must be exactly 64 bytes (32 secret + 32 remote public), got {}",
            bytes.len()
        );
        let mut secret_bytes = [0u8; 32];
        secret_bytes.copy_from_slice(&bytes[0..32]);
        let mut public_bytes = [0u8; 32];
        public_bytes.copy_from_slice(&bytes[32..64]);
        Ok(KeyMaterial {
            own_secret: SecretKey::from(secret_bytes),
            remote_public: PublicKey::from(public_bytes),
        })
    }

    pub fn generate_keypair() -> (SecretKey, PublicKey) {
        let secret = SecretKey::generate(&mut OsRng);
        let public = secret.public_key();
        (secret, public)
    }

    fn salsa_box(&self) -> SalsaBox {
        SalsaBox::new(&self.remote_public, &self.own_secret)
    }

    /// Seal a session descriptor for the remote peer. Returns the random
    /// nonce alongside the ciphertext, both of which go on the wire.
    pub fn seal(&self, descriptor: &SessionDescriptor) -> ([u8; SESSION_NONCE_LEN], Vec<u8>) {
        let salsa_box = self.salsa_box();
        let nonce = SalsaBox::generate_nonce(&mut OsRng);
        let ciphertext = salsa_box
            .encrypt(&nonce, descriptor.encode().as_slice())
            .expect("crypto_box sealing is infallible for a well-formed plaintext");
        let mut nonce_bytes = [0u8; SESSION_NONCE_LEN];
        nonce_bytes.copy_from_slice(nonce.as_slice());
        (nonce_bytes, ciphertext)
    }

    /// Unseal a session descriptor received from the remote peer.
    pub fn unseal(
        &self,
        nonce: &[u8; SESSION_NONCE_LEN],
        sealed: &[u8],
    ) -> Result<SessionDescriptor, ChannelError> {
        let salsa_box = self.salsa_box();
        let nonce = crypto_box::Nonce::clone_from_slice(nonce);
        let plaintext = salsa_box
            .decrypt(&nonce, sealed)
            .map_err(|_| ChannelError::SessionUnsealFailed)?;
        SessionDescriptor::decode(&plaintext)
    }
}

/// Generate a fresh keypair and return the 32-byte secret and public halves,
/// for the `keygen` CLI subcommand to write out.
pub fn generate_keypair_bytes() -> ([u8; 32], [u8; 32]) {
    let (secret, public) = KeyMaterial::generate_keypair();
    let mut secret_bytes = [0u8; 32];
    secret_bytes.copy_from_slice(secret.to_bytes().as_slice());
    let mut public_bytes = [0u8; 32];
    public_bytes.copy_from_slice(public.as_bytes());
    (secret_bytes, public_bytes)
}

/// Assemble the 64-byte key file contents from this side's secret key and
/// the remote side's public key.
pub fn build_key_file(own_secret: &[u8; 32], remote_public: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(own_secret);
    out.extend_from_slice(remote_public);
    out
}

pub fn load_key_material(path: &std::path::Path) -> Result<KeyMaterial> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("reading key file {}", path.display()))?;
    KeyMaterial::from_bytes(&bytes)
}
