//! The Device Session (spec §3, §4.4): per-connection state machine sitting
//! on top of the Cipher Pipe, owning the send/receive counters, the token
//! table, the ownership lock, and the listener registry. One instance per
//! accepted TCP connection.

pub mod lock;
pub mod listener;
pub mod state;
pub mod tokens;

use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, Chain, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;

use crate::cipher::{CipherIn, CipherOut};
use crate::coap::{self, Confirmability, Message, MessageName};
use crate::collaborators::{ClusterRouter, CoreEvent, DeviceKeyStore, EventPublisher};
use crate::config::SessionConfig;
use crate::crypto::identity::NodeCredentials;
use crate::crypto::KeyExchange;
use crate::error::{DisconnectReason, SessionError};
use crate::handshake::transport::CborStreamTransport;
use crate::handshake::{HandshakeContext, HandshakeError, ServerHandshake};

pub use lock::{HolderId, NONE_HOLDER};
pub use state::SessionState;

use lock::OwnershipLock;
use listener::ListenerRegistry;
use tokens::TokenTable;

/// Device-provided self-description, split into system info and application
/// (function/variable) state (spec §3's `introspection`, §4.5's `describe`).
#[derive(Debug, Clone, Default)]
pub struct Introspection {
    pub system_information: serde_json::Value,
    pub function_state: serde_json::Value,
}

impl Introspection {
    /// True once both halves of a describe exchange are present — the
    /// condition the describe race in `verbs::describe` checks to decide
    /// whether the second `DescribeReturn` is still needed (spec §4.5).
    pub fn is_complete(&self) -> bool {
        self.function_state.get("f").is_some() && self.function_state.get("v").is_some()
    }
}

struct Inner<S> {
    id: Vec<u8>,
    connection_key: String,
    config: SessionConfig,
    product_id: Mutex<Option<u16>>,
    firmware_version: Mutex<Option<u16>>,
    platform_id: Mutex<Option<u16>>,
    send_counter: Mutex<u16>,
    receive_counter: Mutex<u16>,
    tokens: Mutex<TokenTable>,
    cipher_out: AsyncMutex<Option<CipherOut<WriteHalf<S>>>>,
    lock: OwnershipLock,
    introspection: Mutex<Option<Introspection>>,
    listeners: ListenerRegistry,
    last_ping: Mutex<Instant>,
    connection_start: Instant,
    /// Device-reported OTA capability limits (spec §4.6 step 2), learned
    /// from the `spark/hardware/ota_chunk_size`/`spark/hardware/max_binary`
    /// system events if the device publishes them before a flash starts.
    ota_chunk_size_limit: Mutex<Option<usize>>,
    ota_max_binary_limit: Mutex<Option<usize>>,
    disconnect_counter: AtomicU64,
    state: Mutex<SessionState>,
    event_publisher: Arc<dyn EventPublisher>,
}

/// A single device connection, cheap to clone (an `Arc` handle) so both the
/// frame-reading loop and verb callers can hold it concurrently.
pub struct DeviceSession<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for DeviceSession<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn parse_hello_payload(payload: &[u8]) -> Option<(u16, u16, u16)> {
    if payload.len() < 6 {
        return None;
    }
    let product_id = u16::from_be_bytes([payload[0], payload[1]]);
    let firmware_version = u16::from_be_bytes([payload[2], payload[3]]);
    let platform_id = u16::from_be_bytes([payload[4], payload[5]]);
    Some((product_id, firmware_version, platform_id))
}

impl<S> DeviceSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Runs the broker side of the handshake over `stream`, then returns the
    /// live session plus the inbound half of the cipher pipe — the caller is
    /// expected to drive it with `run`.
    #[allow(clippy::too_many_arguments)]
    pub async fn accept<K>(
        stream: S,
        connection_key: String,
        config: SessionConfig,
        credentials: NodeCredentials,
        key_store: &dyn DeviceKeyStore,
        key_exchange: K,
        context: HandshakeContext,
        max_handshake_frame: usize,
        event_publisher: Arc<dyn EventPublisher>,
        cluster_router: Option<(Arc<dyn ClusterRouter>, String)>,
    ) -> Result<(Self, CipherIn<Chain<Cursor<Vec<u8>>, ReadHalf<S>>>), HandshakeError>
    where
        K: KeyExchange + Send,
    {
        let mut transport = CborStreamTransport::new(stream, max_handshake_frame);
        let handshake = ServerHandshake {
            credentials,
            key_store,
            key_exchange,
            context,
        };
        let outcome = handshake.run(&mut transport).await?;
        let (stream, leftover) = transport.into_leftover();
        let (read_half, write_half) = split(stream);
        let reader = Cursor::new(leftover).chain(read_half);
        let cipher_in = CipherIn::new(reader, &outcome.keys.device_to_broker);
        let cipher_out = CipherOut::new(write_half, &outcome.keys.broker_to_device);

        let session = Self {
            inner: Arc::new(Inner {
                id: outcome.device_id,
                connection_key,
                config,
                product_id: Mutex::new(None),
                firmware_version: Mutex::new(None),
                platform_id: Mutex::new(None),
                send_counter: Mutex::new(rand::random::<u16>()),
                receive_counter: Mutex::new(0),
                tokens: Mutex::new(TokenTable::new()),
                cipher_out: AsyncMutex::new(Some(cipher_out)),
                lock: OwnershipLock::new(),
                introspection: Mutex::new(None),
                listeners: ListenerRegistry::new(),
                last_ping: Mutex::new(Instant::now()),
                connection_start: Instant::now(),
                ota_chunk_size_limit: Mutex::new(None),
                ota_max_binary_limit: Mutex::new(None),
                disconnect_counter: AtomicU64::new(0),
                state: Mutex::new(SessionState::Ready {
                    since: Instant::now(),
                }),
                event_publisher,
            }),
        };

        if let Some(message) = coap::unwrap(&outcome.initial_plaintext) {
            if let Some((product_id, firmware_version, platform_id)) =
                parse_hello_payload(&message.payload)
            {
                session.set_hello_fields(product_id, firmware_version, platform_id);
            }
        }

        // Cluster routing sidechannel (spec §6): fire-and-forget, never
        // blocks Ready on the external registry's response.
        if let Some((router, server_id)) = cluster_router {
            let device_id = session.inner.id.clone();
            tokio::spawn(async move {
                router.announce(&device_id, &server_id).await;
            });
        }

        Ok((session, cipher_in))
    }

    /// Drives the receive path until the peer disconnects or a fatal
    /// protocol error occurs; returns the reason teardown was triggered.
    pub async fn run<R>(&self, mut cipher_in: CipherIn<R>) -> DisconnectReason
    where
        R: AsyncRead + Unpin + Send,
    {
        loop {
            tokio::select! {
                frame = cipher_in.recv() => {
                    match frame {
                        Ok(Some(bytes)) => {
                            if let Err(reason) = self.handle_inbound(bytes).await {
                                self.disconnect(reason.clone()).await;
                                return reason;
                            }
                        }
                        Ok(None) => {
                            let reason = DisconnectReason::SocketError("peer closed connection".into());
                            self.disconnect(reason.clone()).await;
                            return reason;
                        }
                        Err(err) => {
                            let reason = DisconnectReason::SocketError(err.to_string());
                            self.disconnect(reason.clone()).await;
                            return reason;
                        }
                    }
                }
                _ = tokio::time::sleep(self.inner.config.socket_timeout) => {
                    let reason = DisconnectReason::SocketError("idle timeout".into());
                    self.disconnect(reason.clone()).await;
                    return reason;
                }
            }
        }
    }

    fn bump_receive_counter(&self) -> u16 {
        let mut counter = self.inner.receive_counter.lock();
        *counter = counter.wrapping_add(1);
        *counter
    }

    fn next_send_counter(&self) -> u16 {
        let mut counter = self.inner.send_counter.lock();
        *counter = counter.wrapping_add(1);
        *counter
    }

    /// Receive path (spec §4.4): unwrap, classify, route to listeners or
    /// disconnect on a counter violation.
    async fn handle_inbound(&self, bytes: Vec<u8>) -> Result<(), DisconnectReason> {
        let Some(message) = coap::unwrap(&bytes) else {
            tracing::debug!(
                connection_key = %self.inner.connection_key,
                "dropping malformed frame"
            );
            return Ok(());
        };

        let classification = {
            let tokens = self.inner.tokens.lock();
            coap::classify(&message, |key| tokens.resolve(key))
        };

        if let coap::Classification::Ack { name } = classification {
            // `DescribeReturn` may legitimately arrive twice under the same
            // token (spec §4.5's describe race): a second `DescribeReturn`
            // answers the same `Describe` request when the first response
            // didn't carry both `f` and `v`. Releasing the slot after the
            // first arrival would make `classify` blind to the token on the
            // second one, so `describe` releases it explicitly once both
            // halves (or the single self-contained response) are in.
            if let (Some(name), Some(token)) = (name, message.token_key()) {
                if name != MessageName::DescribeReturn {
                    self.inner.tokens.lock().release(token);
                }
            }
            let event_name = name.map(|n| n.as_str()).unwrap_or("PingAck");
            self.inner.listeners.dispatch(event_name, &message);
            return Ok(());
        }

        self.bump_receive_counter();

        if message.is_empty_payload() && matches!(message.confirmability, Confirmability::Confirmable)
        {
            *self.inner.last_ping.lock() = Instant::now();
            let _ = self
                .reply(
                    MessageName::PingAck,
                    Some(message.message_id),
                    message.token.first().copied(),
                    Vec::new(),
                    NONE_HOLDER,
                )
                .await;
            return Ok(());
        }

        let expected = *self.inner.receive_counter.lock();
        if message.message_id != expected {
            return Err(if matches!(message.confirmability, Confirmability::Reset) {
                DisconnectReason::GotAnIgnore
            } else {
                DisconnectReason::BadCounter
            });
        }

        if let coap::Classification::Request {
            name: Some(MessageName::EventPublish),
        } = classification
        {
            self.handle_device_event(&message).await;
            return Ok(());
        }

        if let coap::Classification::Request {
            name: Some(MessageName::GetTime),
        } = classification
        {
            let _ = self
                .send_message(
                    MessageName::GetTimeReturn,
                    coap::WrapParams::None,
                    Message::now().to_be_bytes().to_vec(),
                    NONE_HOLDER,
                )
                .await;
            return Ok(());
        }

        let name = match classification {
            coap::Classification::Request { name } => name,
            coap::Classification::Response { name } => {
                if name.is_some() {
                    if let Some(token) = message.token_key() {
                        self.inner.tokens.lock().release(token);
                    }
                }
                name
            }
            _ => None,
        };

        match name {
            Some(name) => self.inner.listeners.dispatch(name.as_str(), &message),
            None => tracing::debug!(
                connection_key = %self.inner.connection_key,
                uri = %message.uri_path,
                "unrouted inbound message"
            ),
        }

        Ok(())
    }

    /// Publish/subscribe event bridge, inbound half (spec §4.5, §6): acks
    /// every device-published event, then fans it out through the external
    /// publisher unless its name is a `spark/`-prefixed system event, which
    /// is consumed internally and never forwarded (spec §6).
    async fn handle_device_event(&self, message: &Message) {
        let _ = self
            .reply(
                MessageName::EventAck,
                Some(message.message_id),
                message.token_key(),
                Vec::new(),
                NONE_HOLDER,
            )
            .await;

        let event_name = message.uri_path.strip_prefix("e/").unwrap_or(&message.uri_path);
        if event_name.starts_with("spark/") {
            self.capture_ota_capability(event_name, &message.payload);
            return;
        }

        let data = if message.payload.is_empty() {
            None
        } else {
            Some(message.payload.clone())
        };
        self.inner
            .event_publisher
            .publish(
                &self.inner.id,
                CoreEvent {
                    name: event_name.to_string(),
                    is_public: true,
                    ttl: message.max_age,
                    published_at: Some(message.timestamp),
                    data,
                },
            )
            .await;
    }

    /// Send path (spec §4.4): ownership gate, counter/token bookkeeping,
    /// wrap, write. Returns the allocated token (0 if the message name is
    /// not token-bearing).
    pub async fn send_message(
        &self,
        name: MessageName,
        params: coap::WrapParams,
        payload: Vec<u8>,
        holder: HolderId,
    ) -> Result<u8, SessionError> {
        if self.inner.lock.blocks(holder) {
            return Err(SessionError::LockedDuringFlashing);
        }
        let message_id = self.next_send_counter();
        let token = if coap::is_token_bearing(name) {
            let allocated = self.inner.tokens.lock().allocate(name);
            match allocated {
                Ok(token) => Some(token),
                Err(err) => {
                    // Spec §7: a duplicate allocation to a still-live key is
                    // a fatal programmer error, not a retryable one — surface
                    // it to the caller and tear the session down.
                    self.disconnect(DisconnectReason::TokenCollision(err.to_string()))
                        .await;
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        let bytes = match coap::wrap(name, message_id, token, params, payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                if let Some(token) = token {
                    self.inner.tokens.lock().release(token);
                }
                return Err(err.into());
            }
        };

        self.write_frame(&bytes, token).await?;
        Ok(token.unwrap_or(0))
    }

    /// Reply path (spec §4.4): answers a confirmable message, reusing its id
    /// for ack parity unless `id` is `None`, in which case a fresh
    /// `sendCounter`-based id is allocated.
    pub async fn reply(
        &self,
        name: MessageName,
        id: Option<u16>,
        token: Option<u8>,
        payload: Vec<u8>,
        holder: HolderId,
    ) -> Result<(), SessionError> {
        if self.inner.lock.blocks(holder) {
            return Err(SessionError::LockedDuringFlashing);
        }
        let message_id = id.unwrap_or_else(|| self.next_send_counter());
        let bytes = coap::wrap(name, message_id, token, coap::WrapParams::None, payload)?;
        self.write_frame(&bytes, None).await?;
        Ok(())
    }

    async fn write_frame(&self, bytes: &[u8], token_on_failure: Option<u8>) -> Result<(), SessionError> {
        let mut guard = self.inner.cipher_out.lock().await;
        let Some(cipher_out) = guard.as_mut() else {
            drop(guard);
            if let Some(token) = token_on_failure {
                self.inner.tokens.lock().release(token);
            }
            return Err(SessionError::NotReady);
        };
        if let Err(err) = cipher_out.send(bytes).await {
            drop(guard);
            if let Some(token) = token_on_failure {
                self.inner.tokens.lock().release(token);
            }
            self.disconnect(DisconnectReason::SocketError(err.to_string()))
                .await;
            return Err(SessionError::Disconnected);
        }
        Ok(())
    }

    /// Listener/Waiter Facility (spec §4.4): `awaitEvent` keyed by event
    /// name, optional URI prefix, and optional token.
    pub async fn listen_for(
        &self,
        event_name: impl Into<String>,
        uri_prefix: Option<String>,
        token: Option<u8>,
    ) -> Result<Message, SessionError> {
        self.inner
            .listeners
            .await_event(event_name, uri_prefix, token, self.inner.config.listener_timeout)
            .await
    }

    /// Awaits a response keyed by `token`, releasing the slot if the wait
    /// comes back an error (timeout or disconnect). The success path is
    /// already released by `handle_inbound` as the response is dispatched
    /// (spec §3: a token is live only "until its response has been routed");
    /// without this, a request whose response never arrives leaks its slot
    /// forever instead of being freed the moment its caller gives up on it.
    pub(crate) async fn listen_for_token(
        &self,
        event_name: impl Into<String>,
        token: u8,
    ) -> Result<Message, SessionError> {
        match self.listen_for(event_name, None, Some(token)).await {
            Ok(message) => Ok(message),
            Err(err) => {
                self.inner.tokens.lock().release(token);
                Err(err)
            }
        }
    }

    /// Explicitly frees a token slot. Used by verbs whose response may
    /// legitimately arrive more than once under the same token (describe's
    /// two-`DescribeReturn` exchange), which `handle_inbound` otherwise
    /// leaves allocated so the second response can still be resolved.
    pub(crate) fn release_token(&self, token: u8) {
        self.inner.tokens.lock().release(token);
    }

    /// Device-reported OTA capability limits (spec §4.6 step 2), learned
    /// from `spark/hardware/ota_chunk_size`/`spark/hardware/max_binary`
    /// system events if the device published them before a flash started.
    /// Falls back to the static `SessionConfig` bound when the device never
    /// reported one, and never relaxes the configured bound past it.
    pub(crate) fn ota_chunk_size(&self) -> usize {
        let configured = self.inner.config.ota_chunk_size;
        match *self.inner.ota_chunk_size_limit.lock() {
            Some(reported) => configured.min(reported),
            None => configured,
        }
    }

    pub(crate) fn ota_max_binary_size(&self) -> usize {
        let configured = self.inner.config.ota_max_binary_size;
        match *self.inner.ota_max_binary_limit.lock() {
            Some(reported) => configured.min(reported),
            None => configured,
        }
    }

    /// Parses the two device-reported OTA capability system events (spec
    /// §4.6 step 2) and stashes whichever one `event_name` names. The
    /// payload is the decimal ASCII rendering of the limit, matching how the
    /// device publishes other numeric system events.
    fn capture_ota_capability(&self, event_name: &str, payload: &[u8]) {
        let Ok(text) = std::str::from_utf8(payload) else {
            return;
        };
        let Ok(value) = text.trim().parse::<usize>() else {
            return;
        };
        match event_name {
            "spark/hardware/max_binary" => {
                *self.inner.ota_max_binary_limit.lock() = Some(value);
            }
            "spark/hardware/ota_chunk_size" => {
                *self.inner.ota_chunk_size_limit.lock() = Some(value);
            }
            _ => {}
        }
    }

    pub fn take_ownership(&self, holder: HolderId) -> bool {
        self.inner.lock.take(holder)
    }

    pub fn release_ownership(&self, holder: HolderId) {
        self.inner.lock.release(holder);
    }

    pub fn is_locked_for(&self, holder: HolderId) -> bool {
        self.inner.lock.blocks(holder)
    }

    pub fn introspection(&self) -> Option<Introspection> {
        self.inner.introspection.lock().clone()
    }

    pub fn set_introspection(&self, introspection: Introspection) {
        *self.inner.introspection.lock() = Some(introspection);
    }

    pub fn id(&self) -> &[u8] {
        &self.inner.id
    }

    pub fn connection_key(&self) -> &str {
        &self.inner.connection_key
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn hello_fields(&self) -> Option<(u16, u16, u16)> {
        let product_id = (*self.inner.product_id.lock())?;
        let firmware_version = (*self.inner.firmware_version.lock())?;
        let platform_id = (*self.inner.platform_id.lock())?;
        Some((product_id, firmware_version, platform_id))
    }

    fn set_hello_fields(&self, product_id: u16, firmware_version: u16, platform_id: u16) {
        *self.inner.product_id.lock() = Some(product_id);
        *self.inner.firmware_version.lock() = Some(firmware_version);
        *self.inner.platform_id.lock() = Some(platform_id);
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn mark_active(&self) {
        let mut state = self.inner.state.lock();
        if let Ok(next) = state.transition(SessionState::Active {
            since: Instant::now(),
        }) {
            *state = next;
        }
    }

    /// Enters `Flashing` (spec §3's lifecycle); called by the flasher once
    /// it has taken the ownership lock, from either `Ready` or `Active`.
    pub fn mark_flashing(&self) {
        let mut state = self.inner.state.lock();
        if let Ok(next) = state.transition(SessionState::Flashing {
            since: Instant::now(),
        }) {
            *state = next;
        }
    }

    /// Leaves `Flashing` back to `Ready` once the OTA transfer ends,
    /// win or lose (spec §7: "session remains live" after a flash failure).
    pub fn mark_flash_done(&self) {
        let mut state = self.inner.state.lock();
        if let Ok(next) = state.transition(SessionState::Ready {
            since: Instant::now(),
        }) {
            *state = next;
        }
    }

    /// Idempotent teardown (spec §4.7): the first call logs, closes the
    /// cipher-out half, transitions to `Disconnected`, and rejects every
    /// outstanding listener; later calls are no-ops.
    pub async fn disconnect(&self, reason: DisconnectReason) -> DisconnectReason {
        if self.inner.disconnect_counter.fetch_add(1, Ordering::SeqCst) > 0 {
            return reason;
        }

        let duration = self.inner.connection_start.elapsed();
        tracing::info!(
            connection_key = %self.inner.connection_key,
            device_id = ?self.inner.id,
            duration_ms = duration.as_millis() as u64,
            %reason,
            "session disconnected"
        );

        {
            let mut guard = self.inner.cipher_out.lock().await;
            if let Some(mut cipher_out) = guard.take() {
                if let Err(err) = cipher_out.close().await {
                    tracing::warn!(error = %err, "error closing cipher-out half");
                }
            }
        }

        *self.inner.state.lock() = SessionState::Disconnected;
        self.inner.listeners.reject_all();
        reason
    }
}
