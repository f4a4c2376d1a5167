//! Device-session core for an IoT cloud message broker.
//!
//! A [`session::DeviceSession`] carries one device connection end to end: a
//! mutually-authenticated X25519/Ed25519 [`handshake`], a ChaCha20-Poly1305
//! framed [`cipher`] pipe over the raw stream, a [`coap`]-encoded request/
//! response protocol with a token-indexed waiter table, the device
//! [`verbs`] (describe, variable reads, function calls, signals, events)
//! built on top of it, and the [`flasher`] OTA transfer state machine gated
//! by the session's exclusive ownership lock.

pub mod cipher;
pub mod coap;
pub mod collaborators;
pub mod config;
pub mod crypto;
pub mod error;
pub mod flasher;
pub mod handshake;
pub mod session;
pub mod verbs;

pub use cipher::{CipherIn, CipherOut};
pub use coap::{Classification, CoapCode, Confirmability, Message, MessageName, WrapParams};
pub use collaborators::{
    ClusterRouter, CoreEvent, DeviceAttributeStore, DeviceKeyStore, EventPublisher,
    ServerKeyStore,
};
pub use config::SessionConfig;
pub use crypto::identity::NodeCredentials;
pub use crypto::{KeyExchange, SessionKeys};
pub use error::{CipherError, CoapError, DisconnectReason, HandshakeError, SessionError};
pub use flasher::{FlashEvent, FLASH_HOLDER, STORE_FIRMWARE};
pub use handshake::{
    ClientHandshake, HandshakeContext, HandshakeMessage, HandshakeOutcome, HandshakeTransport,
    ServerHandshake,
};
pub use session::{DeviceSession, HolderId, Introspection, SessionState, NONE_HOLDER};
