//! OTA Flasher (spec §4.6): the chunked firmware transfer state machine —
//! Prepare -> Ready -> stream chunks with CRC -> Done — gated by the
//! session's exclusive ownership lock so no other verb can interleave sends
//! with a binary in flight.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::coap::{MessageName, WrapParams};
use crate::error::SessionError;
use crate::session::{DeviceSession, HolderId};

/// The only holder id this module ever uses; the lock's single-slot CAS
/// already guarantees at most one flash runs at a time per session, so
/// distinguishing multiple flasher instances isn't needed.
pub const FLASH_HOLDER: HolderId = 1;

pub const STORE_FIRMWARE: u8 = 0;

/// Observer notifications emitted around a flash attempt (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashEvent {
    Started,
    Success,
    Failed,
}

impl<S> DeviceSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Flashes firmware at the default store and address `0x0`.
    pub async fn flash_firmware(
        &self,
        binary: Vec<u8>,
        on_event: impl FnMut(FlashEvent),
    ) -> Result<(), SessionError> {
        self.flash(binary, STORE_FIRMWARE, "0x0".to_string(), on_event).await
    }

    /// Runs the full OTA protocol against `binary`. Fails immediately if the
    /// ownership lock is already held by another flasher.
    pub async fn flash(
        &self,
        binary: Vec<u8>,
        store: u8,
        address: String,
        mut on_event: impl FnMut(FlashEvent),
    ) -> Result<(), SessionError> {
        if !self.take_ownership(FLASH_HOLDER) {
            return Err(SessionError::LockedDuringFlashing);
        }
        self.mark_flashing();

        let result = self.run_flash(&binary, store, &address, &mut on_event).await;
        match &result {
            Ok(()) => on_event(FlashEvent::Success),
            Err(_) => on_event(FlashEvent::Failed),
        }
        self.release_ownership(FLASH_HOLDER);
        self.mark_flash_done();
        result
    }

    async fn run_flash(
        &self,
        binary: &[u8],
        store: u8,
        address: &str,
        on_event: &mut impl FnMut(FlashEvent),
    ) -> Result<(), SessionError> {
        on_event(FlashEvent::Started);

        if binary.len() > self.ota_max_binary_size() {
            return Err(SessionError::UpdateFailed(
                "binary exceeds max binary size".into(),
            ));
        }
        let chunk_size = self.ota_chunk_size().max(1);
        let max_retries = self.config().ota_max_retries;

        let begin_token = self
            .send_message(
                MessageName::UpdateBegin,
                WrapParams::UpdateBegin {
                    store,
                    address: address.to_string(),
                    size: binary.len() as u32,
                },
                Vec::new(),
                FLASH_HOLDER,
            )
            .await
            .map_err(update_failed)?;
        self.listen_for_token("UpdateReady", begin_token)
            .await
            .map_err(update_failed)?;

        for (index, chunk) in binary.chunks(chunk_size).enumerate() {
            let index = index as u32;
            let crc = crc32fast::hash(chunk);
            let mut attempt: u8 = 0;
            loop {
                let token = self
                    .send_message(
                        MessageName::Chunk,
                        WrapParams::Chunk { index, crc },
                        chunk.to_vec(),
                        FLASH_HOLDER,
                    )
                    .await
                    .map_err(update_failed)?;
                let ack = self
                    .listen_for_token("ChunkReceived", token)
                    .await
                    .map_err(update_failed)?;
                let device_crc = ack
                    .payload
                    .get(0..4)
                    .and_then(|bytes| bytes.try_into().ok())
                    .map(u32::from_be_bytes)
                    .unwrap_or(0);
                if device_crc == crc {
                    break;
                }
                attempt += 1;
                if attempt > max_retries {
                    return Err(SessionError::UpdateFailed(format!(
                        "chunk {index} CRC mismatch after {max_retries} retries"
                    )));
                }
            }
        }

        let done_token = self
            .send_message(MessageName::UpdateDone, WrapParams::None, Vec::new(), FLASH_HOLDER)
            .await
            .map_err(update_failed)?;
        self.listen_for_token("UpdateDoneAck", done_token)
            .await
            .map_err(update_failed)?;

        Ok(())
    }
}

fn update_failed(err: SessionError) -> SessionError {
    match err {
        SessionError::UpdateFailed(_) => err,
        other => SessionError::UpdateFailed(other.to_string()),
    }
}
