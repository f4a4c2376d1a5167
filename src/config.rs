use std::time::Duration;

/// Ambient configuration for a `DeviceSession`, modeled on the teacher's
/// `HandshakeContext`: one struct threading the timing/size knobs the spec
/// calls out by name (keepalive, listener timeout, OTA bounds) instead of
/// scattering constants through the session code.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// OS-level keepalive interval; firing updates `last_ping` on receipt of
    /// an empty confirmable message and triggers disconnect if the peer goes
    /// quiet for longer than `socket_timeout`.
    pub keepalive: Duration,
    /// Idle timeout after which the session is disconnected if no bytes
    /// arrive at all.
    pub socket_timeout: Duration,
    /// Default timeout for a single `listen_for` waiter (spec §4.4).
    pub listener_timeout: Duration,
    /// Default OTA chunk size in bytes, capped by the device's reported
    /// `OtaChunkSize` once known.
    pub ota_chunk_size: usize,
    /// Max firmware binary size accepted, capped by the device's reported
    /// `MaxBinarySize` once known.
    pub ota_max_binary_size: usize,
    /// Number of retransmit attempts allowed per OTA chunk before the
    /// transfer is failed.
    pub ota_max_retries: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(15),
            socket_timeout: Duration::from_secs(30),
            listener_timeout: Duration::from_secs(15),
            ota_chunk_size: 512,
            ota_max_binary_size: 128 * 1024,
            ota_max_retries: 3,
        }
    }
}
