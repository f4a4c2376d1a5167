use thiserror::Error;

/// Errors raised while running the handshake to completion.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("handshake protocol error: {0}")]
    Protocol(String),
    #[error("handshake authentication failed: {0}")]
    Authentication(String),
}

/// Errors surfaced by CoAP framing (wrap/unwrap/classify).
#[derive(Debug, Error)]
pub enum CoapError {
    #[error("unknown message name: {0}")]
    UnknownMessage(String),
    #[error("payload codec error: {0}")]
    Codec(String),
    #[error("malformed frame")]
    Malformed,
}

/// Errors returned from `DeviceSession` send/receive/verb operations.
///
/// These map directly to the error kinds in the spec's error-handling design:
/// most are soft failures the caller can retry or ignore; only the variants
/// documented as fatal cause the session to disconnect.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session locked during flashing")]
    LockedDuringFlashing,
    #[error("request timed out")]
    RequestTimedOut,
    #[error("no device state!")]
    NoDeviceState,
    #[error("variable not found")]
    VariableNotFound,
    #[error("unknown function")]
    UnknownFunction,
    #[error("cipher pipe not ready")]
    NotReady,
    #[error("token table exhausted")]
    TokenTableExhausted,
    #[error("duplicate token allocation: {0:02x}")]
    TokenCollision(u8),
    #[error("coap error: {0}")]
    Coap(#[from] CoapError),
    #[error("cipher pipe error: {0}")]
    Cipher(#[from] CipherError),
    #[error("update failed: {0}")]
    UpdateFailed(String),
    #[error("session already disconnected")]
    Disconnected,
}

/// Errors from the framed AEAD cipher pipe layered on the raw socket.
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("AEAD seal/open failure")]
    Crypto,
    #[error("nonce space exhausted")]
    NonceExhausted,
}

/// Fatal reasons a session is torn down; carried as the `Disconnect` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    BadCounter,
    GotAnIgnore,
    HandshakeFailed(String),
    SocketError(String),
    Requested(String),
    /// A token allocation landed on a slot still occupied by a live request
    /// (spec §3: "duplicate allocation to a live key is a protocol-violation
    /// error"; spec §7 classifies it as a fatal programmer error).
    TokenCollision(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::BadCounter => write!(f, "Bad Counter"),
            DisconnectReason::GotAnIgnore => write!(f, "Got an Ignore"),
            DisconnectReason::HandshakeFailed(reason) => write!(f, "handshake failed: {reason}"),
            DisconnectReason::SocketError(reason) => write!(f, "socket error: {reason}"),
            DisconnectReason::Requested(reason) => write!(f, "{reason}"),
            DisconnectReason::TokenCollision(reason) => write!(f, "token collision: {reason}"),
        }
    }
}
