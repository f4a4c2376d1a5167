use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time;

use super::{HandshakeMessage, HandshakeTransport};
use crate::error::HandshakeError;

/// Length-prefixed CBOR transport for handshake messages, read directly off
/// the raw socket. Reads are buffered by hand rather than through a generic
/// framed codec so that bytes arriving after the last handshake message —
/// already ciphertext belonging to the cipher pipe — can be recovered via
/// `into_leftover` instead of being silently consumed by an internal codec
/// buffer (spec §4.1's `pendingBuffers`).
pub struct CborStreamTransport<S> {
    stream: S,
    buf: Vec<u8>,
    max_size: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> CborStreamTransport<S> {
    pub fn new(stream: S, max_size: usize) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            max_size,
        }
    }

    /// Hands back the raw stream and any bytes already read past the last
    /// handshake frame, so the cipher pipe can replay them as the first
    /// ciphertext it decrypts.
    pub fn into_leftover(self) -> (S, Vec<u8>) {
        (self.stream, self.buf)
    }

    async fn fill(&mut self, want: usize) -> Result<(), HandshakeError> {
        while self.buf.len() < want {
            let mut chunk = [0u8; 4096];
            let n = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(|e| HandshakeError::Transport(e.to_string()))?;
            if n == 0 {
                return Err(HandshakeError::Transport(
                    "connection closed during handshake".into(),
                ));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> HandshakeTransport for CborStreamTransport<S> {
    async fn send(&mut self, msg: HandshakeMessage) -> Result<(), HandshakeError> {
        let body = serde_cbor::to_vec(&msg)
            .map_err(|e| HandshakeError::Protocol(format!("encode: {e}")))?;
        if body.len() > self.max_size {
            return Err(HandshakeError::Protocol("handshake message too large".into()));
        }
        let mut framed = Vec::with_capacity(4 + body.len());
        framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
        framed.extend_from_slice(&body);
        self.stream
            .write_all(&framed)
            .await
            .map_err(|e| HandshakeError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<HandshakeMessage, HandshakeError> {
        self.fill(4).await?;
        let len = u32::from_be_bytes(self.buf[0..4].try_into().unwrap()) as usize;
        if len > self.max_size {
            return Err(HandshakeError::Protocol("handshake frame too large".into()));
        }
        self.fill(4 + len).await?;
        let frame: Vec<u8> = self.buf.drain(0..4 + len).collect();
        serde_cbor::from_slice(&frame[4..])
            .map_err(|e| HandshakeError::Protocol(format!("decode: {e}")))
    }
}

/// Wrapper that enforces a per-message timeout on recv, as the handshake
/// must not hang forever on a device that stalls mid-exchange.
pub struct TimeoutTransport<T> {
    inner: T,
    recv_timeout: Duration,
}

impl<T> TimeoutTransport<T> {
    pub fn new(inner: T, recv_timeout: Duration) -> Self {
        Self {
            inner,
            recv_timeout,
        }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[async_trait::async_trait]
impl<T> HandshakeTransport for TimeoutTransport<T>
where
    T: HandshakeTransport + Send,
{
    async fn send(&mut self, msg: HandshakeMessage) -> Result<(), HandshakeError> {
        self.inner.send(msg).await
    }

    async fn recv(&mut self) -> Result<HandshakeMessage, HandshakeError> {
        match time::timeout(self.recv_timeout, self.inner.recv()).await {
            Ok(res) => res,
            Err(_) => Err(HandshakeError::Transport("handshake recv timeout".into())),
        }
    }
}
