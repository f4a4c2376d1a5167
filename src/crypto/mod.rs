//! Cryptographic primitives backing the handshake and cipher pipe.
//!
//! The handshake performs an X25519 Diffie-Hellman exchange authenticated by
//! Ed25519 signatures over the transcript, then derives two directional
//! ChaCha20-Poly1305 keys via HKDF-SHA256. The session never re-derives keys;
//! `SessionKeys` lives for the lifetime of the connection.

pub mod identity;

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand_core::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::error::HandshakeError;

type HmacSha256 = Hmac<Sha256>;

/// Shared-secret key exchange abstraction so the handshake driver can be
/// exercised against a loopback/test double without touching real RNG.
pub trait KeyExchange {
    fn public_key(&self) -> [u8; 32];
    fn diffie_hellman(self, peer_public: &[u8; 32]) -> [u8; 32];
}

/// X25519-backed Diffie-Hellman exchange; the default `KeyExchange` impl.
pub struct X25519KeyExchange {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl X25519KeyExchange {
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }
}

impl Default for X25519KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyExchange for X25519KeyExchange {
    fn public_key(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    fn diffie_hellman(self, peer_public: &[u8; 32]) -> [u8; 32] {
        let peer = PublicKey::from(*peer_public);
        self.secret.diffie_hellman(&peer).to_bytes()
    }
}

/// Directional AEAD keys derived for a single session. `device_to_broker` is
/// used by the device to encrypt and the broker to decrypt, and vice versa
/// for `broker_to_device`; naming the direction rather than tx/rx keeps the
/// two sides from ever mixing them up.
#[derive(Clone)]
pub struct SessionKeys {
    pub device_to_broker: [u8; 32],
    pub broker_to_device: [u8; 32],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

/// Derives the two directional session keys from the raw ECDH shared secret
/// and the handshake transcript (used as HKDF `info` so keys are bound to the
/// exact messages exchanged).
pub fn derive_session_keys(shared_secret: &[u8; 32], transcript: &[u8]) -> SessionKeys {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut device_to_broker = [0u8; 32];
    let mut broker_to_device = [0u8; 32];
    hk.expand_multi_info(&[transcript, b"d2b"], &mut device_to_broker)
        .expect("32 bytes is a valid HKDF output length");
    hk.expand_multi_info(&[transcript, b"b2d"], &mut broker_to_device)
        .expect("32 bytes is a valid HKDF output length");
    SessionKeys {
        device_to_broker,
        broker_to_device,
    }
}

/// Computes an HMAC-SHA256 digest over `transcript` keyed by `shared_secret`,
/// used by both handshake parties to confirm they derived the same keys
/// without revealing the keys themselves.
pub fn handshake_confirmation(shared_secret: &[u8; 32], transcript: &[u8]) -> Vec<u8> {
    let mut mac =
        HmacSha256::new_from_slice(shared_secret).expect("HMAC accepts keys of any length");
    mac.update(transcript);
    mac.finalize().into_bytes().to_vec()
}

/// Verifies a confirmation digest produced by `handshake_confirmation`.
pub fn verify_confirmation(
    shared_secret: &[u8; 32],
    transcript: &[u8],
    tag: &[u8],
) -> Result<(), HandshakeError> {
    let mut mac =
        HmacSha256::new_from_slice(shared_secret).expect("HMAC accepts keys of any length");
    mac.update(transcript);
    mac.verify_slice(tag)
        .map_err(|_| HandshakeError::Authentication("handshake confirmation mismatch".into()))
}
