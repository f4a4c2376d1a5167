//! Cipher Pipe (spec §4.2): two framed streams layered over a raw
//! byte-oriented duplex, delivering whole plaintext CoAP datagrams to the
//! rest of the core. Boundary detection is a length-delimited frame; the
//! payload of each frame is one ChaCha20-Poly1305-sealed CoAP message.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::bytes::Bytes;
use futures_util::{SinkExt, StreamExt};

use crate::error::CipherError;

fn nonce_for(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_be_bytes());
    Nonce::clone_from_slice(&bytes)
}

/// Outbound half of the cipher pipe: seals plaintext CoAP datagrams and
/// writes them as length-delimited frames.
pub struct CipherOut<W> {
    sink: FramedWrite<W, LengthDelimitedCodec>,
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl<W: AsyncWrite + Unpin> CipherOut<W> {
    pub fn new(writer: W, key: &[u8; 32]) -> Self {
        Self {
            sink: FramedWrite::new(writer, LengthDelimitedCodec::new()),
            cipher: ChaCha20Poly1305::new(key.into()),
            counter: 0,
        }
    }

    /// Seals and writes one whole CoAP datagram. Returns once the frame has
    /// been handed to the OS (not necessarily flushed to the peer).
    pub async fn send(&mut self, plaintext: &[u8]) -> Result<(), CipherError> {
        let nonce = nonce_for(self.counter);
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(CipherError::NonceExhausted)?;
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CipherError::Crypto)?;
        self.sink
            .send(Bytes::from(ciphertext))
            .await
            .map_err(CipherError::Io)?;
        Ok(())
    }

    /// Idempotent-safe shutdown of the underlying writer half.
    pub async fn close(&mut self) -> Result<(), CipherError> {
        self.sink.get_mut().shutdown().await.map_err(CipherError::Io)
    }
}

/// Inbound half of the cipher pipe: reads length-delimited frames and opens
/// each one into a plaintext CoAP datagram.
pub struct CipherIn<R> {
    stream: FramedRead<R, LengthDelimitedCodec>,
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl<R: AsyncRead + Unpin> CipherIn<R> {
    pub fn new(reader: R, key: &[u8; 32]) -> Self {
        Self {
            stream: FramedRead::new(reader, LengthDelimitedCodec::new()),
            cipher: ChaCha20Poly1305::new(key.into()),
            counter: 0,
        }
    }

    /// Reads and opens the next frame. `Ok(None)` means the peer closed the
    /// connection cleanly.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, CipherError> {
        let frame = match self.stream.next().await {
            Some(frame) => frame.map_err(CipherError::Io)?,
            None => return Ok(None),
        };
        let nonce = nonce_for(self.counter);
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(CipherError::NonceExhausted)?;
        let plaintext = self
            .cipher
            .decrypt(&nonce, frame.as_ref())
            .map_err(|_| CipherError::Crypto)?;
        Ok(Some(plaintext))
    }
}
