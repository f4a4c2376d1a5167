//! Shared test harness: runs both halves of the handshake over an in-memory
//! duplex stream and hands back a live server-side `DeviceSession` paired
//! with raw cipher halves the test can drive as the simulated device.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use rand_core::OsRng;
use tokio::io::{split, AsyncReadExt, DuplexStream};
use tokio::sync::Mutex as AsyncMutex;

use devsession::collaborators::{CoreEvent, DeviceKeyStore, EventPublisher};
use devsession::crypto::identity::NodeCredentials;
use devsession::crypto::{KeyExchange, X25519KeyExchange};
use devsession::handshake::transport::CborStreamTransport;
use devsession::handshake::{ClientHandshake, HandshakeContext};
use devsession::{CipherIn, CipherOut, DeviceSession, SessionConfig};

pub const MAX_HANDSHAKE_FRAME: usize = 16 * 1024;

pub struct FakeKeyStore {
    device_id: Vec<u8>,
    public_key: [u8; 32],
}

impl FakeKeyStore {
    pub fn new(device_id: Vec<u8>, public_key: [u8; 32]) -> Self {
        Self {
            device_id,
            public_key,
        }
    }
}

#[async_trait]
impl DeviceKeyStore for FakeKeyStore {
    async fn public_key(&self, device_id: &[u8]) -> Option<[u8; 32]> {
        (device_id == self.device_id.as_slice()).then_some(self.public_key)
    }

    async fn store_public_key(&self, _device_id: &[u8], _public_key: [u8; 32]) {}
}

/// Records every event the session forwards from a device publish.
#[derive(Default)]
pub struct RecordingPublisher {
    pub events: AsyncMutex<Vec<(Vec<u8>, CoreEvent)>>,
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, device_id: &[u8], event: CoreEvent) {
        self.events.lock().await.push((device_id.to_vec(), event));
    }
}

pub struct DevicePeer {
    pub cipher_in: CipherIn<tokio::io::Chain<std::io::Cursor<Vec<u8>>, tokio::io::ReadHalf<DuplexStream>>>,
    pub cipher_out: CipherOut<tokio::io::WriteHalf<DuplexStream>>,
    pub device_id: Vec<u8>,
}

/// Runs a full mutually-authenticated handshake over an in-memory duplex
/// pair, returning the broker-side `DeviceSession` (with its `CipherIn`
/// ready to be driven by `session.run(..)`) and a `DevicePeer` the test can
/// use to write/read raw CoAP datagrams as if it were the device.
pub async fn handshake_pair(
    device_id: Vec<u8>,
    initial_plaintext: Vec<u8>,
    publisher: Arc<dyn EventPublisher>,
) -> (
    DeviceSession<DuplexStream>,
    CipherIn<tokio::io::Chain<std::io::Cursor<Vec<u8>>, tokio::io::ReadHalf<DuplexStream>>>,
    DevicePeer,
) {
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);

    let device_credentials = NodeCredentials::generate(&mut OsRng);
    let server_credentials = NodeCredentials::generate(&mut OsRng);
    let key_store = FakeKeyStore::new(device_id.clone(), device_credentials.public_key_bytes());

    let device_kex = X25519KeyExchange::new();
    let server_kex = X25519KeyExchange::new();
    let server_public = server_kex.public_key();

    let client_device_id = device_id.clone();
    let client_task = tokio::spawn(async move {
        let mut transport = CborStreamTransport::new(client_stream, MAX_HANDSHAKE_FRAME);
        let client = ClientHandshake {
            device_id: client_device_id,
            credentials: device_credentials,
            server_public_key: server_public,
            key_exchange: device_kex,
            initial_plaintext,
        };
        let outcome = client.run(&mut transport).await.expect("client handshake");
        let (stream, leftover) = transport.into_leftover();
        (outcome, stream, leftover)
    });

    let (session, cipher_in) = DeviceSession::accept(
        server_stream,
        "test-connection".to_string(),
        SessionConfig::default(),
        server_credentials,
        &key_store,
        server_kex,
        HandshakeContext::default(),
        MAX_HANDSHAKE_FRAME,
        publisher,
        None,
    )
    .await
    .expect("server handshake");

    let (outcome, client_stream, leftover) = client_task.await.expect("client task");

    let (read_half, write_half) = split(client_stream);
    let reader = std::io::Cursor::new(leftover).chain(read_half);
    let device_cipher_in = CipherIn::new(reader, &outcome.keys.broker_to_device);
    let device_cipher_out = CipherOut::new(write_half, &outcome.keys.device_to_broker);

    (
        session,
        cipher_in,
        DevicePeer {
            cipher_in: device_cipher_in,
            cipher_out: device_cipher_out,
            device_id: outcome.device_id,
        },
    )
}

/// Drives the device side of a conversation: reads inbound frames and, for
/// each one the caller's `handler` recognizes, writes back the bytes it
/// returns. Runs until the cipher pipe closes or a read error occurs.
pub async fn device_respond_loop(
    mut device: DevicePeer,
    mut handler: impl FnMut(&devsession::Message) -> Option<Vec<u8>> + Send + 'static,
) {
    loop {
        match device.cipher_in.recv().await {
            Ok(Some(bytes)) => {
                let Some(message) = devsession::coap::unwrap(&bytes) else {
                    continue;
                };
                if let Some(reply) = handler(&message) {
                    if device.cipher_out.send(&reply).await.is_err() {
                        break;
                    }
                }
            }
            _ => break,
        }
    }
}
