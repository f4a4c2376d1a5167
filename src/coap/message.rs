use std::time::{SystemTime, UNIX_EPOCH};

/// One inbound or outbound CoAP datagram, decoupled from the wire encoding.
///
/// Mirrors spec §3's `Message` value: everything a verb or the state machine
/// needs to route and classify a datagram, independent of how it was framed
/// on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub code: CoapCode,
    pub message_id: u16,
    /// 0-8 raw token bytes; this core always uses exactly one byte when it
    /// allocates a token (spec §4.4), but inbound tokens are preserved as-is.
    pub token: Vec<u8>,
    pub uri_path: String,
    pub uri_query: String,
    pub payload: Vec<u8>,
    pub max_age: Option<u32>,
    pub timestamp: u64,
    pub confirmability: Confirmability,
}

impl Message {
    pub fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    pub fn is_empty_payload(&self) -> bool {
        self.payload.is_empty() && self.uri_path.is_empty()
    }

    pub fn token_key(&self) -> Option<u8> {
        self.token.first().copied()
    }
}

/// The CoAP code a message carries, split into the three shapes the state
/// machine cares about: empty (pings/acks), requests, and responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoapCode {
    Empty,
    Get,
    Post,
    Put,
    Delete,
    Success(u8),
    ClientError(u8),
    ServerError(u8),
}

impl CoapCode {
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            CoapCode::Get | CoapCode::Post | CoapCode::Put | CoapCode::Delete
        )
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            CoapCode::Success(_) | CoapCode::ClientError(_) | CoapCode::ServerError(_)
        )
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, CoapCode::Empty)
    }
}

/// Whether a CoAP datagram must be acknowledged by the receiver (reuses the
/// inbound message id on the ack).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmability {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    /// The peer rejected a message id it didn't recognize (CoAP RST). The
    /// state machine treats this as the "Ignored" case from spec §4.4 step 5.
    Reset,
}
