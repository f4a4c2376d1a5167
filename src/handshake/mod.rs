//! Handshake Engine (spec §4.1): a mutually-authenticated X25519 key
//! exchange signed with each party's long-term Ed25519 identity, producing
//! the pair of session keys the Cipher Pipe is built from.
//!
//! Runs once per TCP connection, over CBOR-encoded, length-prefixed messages
//! on the raw socket, before any CoAP byte is read or written.

pub mod transport;

use rand::RngCore;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};

use crate::collaborators::DeviceKeyStore;
use crate::crypto::identity::{verify_with_public_key, NodeCredentials};
use crate::crypto::{
    derive_session_keys, handshake_confirmation, verify_confirmation, KeyExchange, SessionKeys,
    X25519KeyExchange,
};
use crate::error::HandshakeError;

/// Wire messages exchanged during the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HandshakeMessage {
    ClientHello {
        device_id: Vec<u8>,
        public_key: [u8; 32],
    },
    ServerChallenge {
        public_key: [u8; 32],
        nonce: Vec<u8>,
    },
    ClientResponse {
        signature: Vec<u8>,
    },
    ServerConfirm {
        signature: Vec<u8>,
        confirmation: Vec<u8>,
    },
    /// Closes the handshake; `initial_plaintext` carries whole CoAP
    /// datagrams the device already queued before the cipher pipe took over
    /// (spec §4.1's `initialPlaintext`/`pendingBuffers`).
    ClientConfirm {
        confirmation: Vec<u8>,
        initial_plaintext: Vec<u8>,
    },
}

#[async_trait::async_trait]
pub trait HandshakeTransport {
    async fn send(&mut self, msg: HandshakeMessage) -> Result<(), HandshakeError>;
    async fn recv(&mut self) -> Result<HandshakeMessage, HandshakeError>;
}

/// Everything the handshake produces, consumed by `DeviceSession::accept`.
pub struct HandshakeOutcome {
    pub device_id: Vec<u8>,
    pub keys: SessionKeys,
    pub initial_plaintext: Vec<u8>,
}

/// Timing/sizing knobs for a handshake run, modeled on the teacher's
/// `HandshakeContext`.
#[derive(Debug, Clone)]
pub struct HandshakeContext {
    pub nonce_len: usize,
}

impl Default for HandshakeContext {
    fn default() -> Self {
        Self { nonce_len: 16 }
    }
}

fn random_nonce(len: usize) -> Vec<u8> {
    let mut nonce = vec![0u8; len];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn transcript(parts: &[&[u8]]) -> Vec<u8> {
    let mut buf = Vec::new();
    for part in parts {
        buf.extend_from_slice(&(part.len() as u32).to_be_bytes());
        buf.extend_from_slice(part);
    }
    buf
}

/// Broker-side driver: accepts a device's `ClientHello`, challenges it, and
/// verifies the device's signature against its stored public key before
/// confirming back.
pub struct ServerHandshake<'a, K> {
    pub credentials: NodeCredentials,
    pub key_store: &'a dyn DeviceKeyStore,
    pub key_exchange: K,
    pub context: HandshakeContext,
}

impl<'a, K> ServerHandshake<'a, K>
where
    K: KeyExchange + Send,
{
    pub async fn run<T: HandshakeTransport + Send>(
        self,
        transport: &mut T,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        let (device_id, client_public) = match transport.recv().await? {
            HandshakeMessage::ClientHello {
                device_id,
                public_key,
            } => (device_id, public_key),
            _ => {
                return Err(HandshakeError::Protocol(
                    "expected ClientHello".into(),
                ))
            }
        };

        let server_public = self.key_exchange.public_key();
        let nonce = random_nonce(self.context.nonce_len);
        transport
            .send(HandshakeMessage::ServerChallenge {
                public_key: server_public,
                nonce: nonce.clone(),
            })
            .await?;

        let client_signature = match transport.recv().await? {
            HandshakeMessage::ClientResponse { signature } => signature,
            _ => {
                return Err(HandshakeError::Protocol(
                    "expected ClientResponse".into(),
                ))
            }
        };

        let device_public_key = self
            .key_store
            .public_key(&device_id)
            .await
            .ok_or_else(|| HandshakeError::Authentication("unknown device public key".into()))?;
        if !verify_with_public_key(&device_public_key, &nonce, &client_signature) {
            return Err(HandshakeError::Authentication(
                "device challenge signature invalid".into(),
            ));
        }

        let shared_secret = self.key_exchange.diffie_hellman(&client_public);
        let transcript = transcript(&[&device_id, &client_public, &server_public, &nonce]);
        let keys = derive_session_keys(&shared_secret, &transcript);
        let server_signature = self.credentials.sign(&nonce).to_vec();
        let confirmation = handshake_confirmation(&shared_secret, &transcript);
        transport
            .send(HandshakeMessage::ServerConfirm {
                signature: server_signature,
                confirmation,
            })
            .await?;

        let (client_confirmation, initial_plaintext) = match transport.recv().await? {
            HandshakeMessage::ClientConfirm {
                confirmation,
                initial_plaintext,
            } => (confirmation, initial_plaintext),
            _ => {
                return Err(HandshakeError::Protocol(
                    "expected ClientConfirm".into(),
                ))
            }
        };
        verify_confirmation(&shared_secret, &transcript, &client_confirmation)?;

        Ok(HandshakeOutcome {
            device_id,
            keys,
            initial_plaintext,
        })
    }
}

/// Device-side driver. Used by real firmware and by this crate's tests to
/// play the device's half of the handshake against a `ServerHandshake`.
pub struct ClientHandshake<K> {
    pub device_id: Vec<u8>,
    pub credentials: NodeCredentials,
    pub server_public_key: [u8; 32],
    pub key_exchange: K,
    pub initial_plaintext: Vec<u8>,
}

impl<K> ClientHandshake<K>
where
    K: KeyExchange + Send,
{
    pub async fn run<T: HandshakeTransport + Send>(
        self,
        transport: &mut T,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        let client_public = self.key_exchange.public_key();
        transport
            .send(HandshakeMessage::ClientHello {
                device_id: self.device_id.clone(),
                public_key: client_public,
            })
            .await?;

        let (server_public, nonce) = match transport.recv().await? {
            HandshakeMessage::ServerChallenge { public_key, nonce } => (public_key, nonce),
            _ => {
                return Err(HandshakeError::Protocol(
                    "expected ServerChallenge".into(),
                ))
            }
        };

        let signature = self.credentials.sign(&nonce).to_vec();
        transport
            .send(HandshakeMessage::ClientResponse { signature })
            .await?;

        let (server_signature, server_confirmation) = match transport.recv().await? {
            HandshakeMessage::ServerConfirm {
                signature,
                confirmation,
            } => (signature, confirmation),
            _ => {
                return Err(HandshakeError::Protocol(
                    "expected ServerConfirm".into(),
                ))
            }
        };
        if !verify_with_public_key(&self.server_public_key, &nonce, &server_signature) {
            return Err(HandshakeError::Authentication(
                "server challenge signature invalid".into(),
            ));
        }

        let shared_secret = self.key_exchange.diffie_hellman(&server_public);
        let transcript = transcript(&[&self.device_id, &client_public, &server_public, &nonce]);
        verify_confirmation(&shared_secret, &transcript, &server_confirmation)?;
        let keys = derive_session_keys(&shared_secret, &transcript);

        let confirmation = handshake_confirmation(&shared_secret, &transcript);
        transport
            .send(HandshakeMessage::ClientConfirm {
                confirmation,
                initial_plaintext: self.initial_plaintext.clone(),
            })
            .await?;

        Ok(HandshakeOutcome {
            device_id: self.device_id,
            // The device's own view of the keys is mirrored, not reused: a
            // device plays the handshake from its side of the wire, so its
            // directional keys line up the same way the broker's do.
            keys,
            initial_plaintext: self.initial_plaintext,
        })
    }
}
