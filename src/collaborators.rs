//! Out-of-scope external interfaces (spec §6), expressed as traits so a
//! `DeviceSession` can be driven in tests without a real registry, key
//! repository, or publisher. Production callers supply their own
//! implementations backed by whatever store/bus they already run.

use async_trait::async_trait;

use crate::crypto::identity::NodeCredentials;

/// Looks up and records device public keys. Implementations back this with
/// whatever persistent repository the broker already runs; this core only
/// ever reads a key before verifying a handshake signature and writes one on
/// first claim.
#[async_trait]
pub trait DeviceKeyStore: Send + Sync {
    async fn public_key(&self, device_id: &[u8]) -> Option<[u8; 32]>;
    async fn store_public_key(&self, device_id: &[u8], public_key: [u8; 32]);
}

/// Supplies the broker's own long-term signing identity.
#[async_trait]
pub trait ServerKeyStore: Send + Sync {
    async fn server_credentials(&self) -> NodeCredentials;
}

/// Persists the free-form attribute map associated with a device (e.g. last
/// IP, last reset reason, claim code) updated as system events arrive.
#[async_trait]
pub trait DeviceAttributeStore: Send + Sync {
    async fn load(&self, device_id: &[u8]) -> std::collections::HashMap<String, String>;
    async fn save(&self, device_id: &[u8], attributes: std::collections::HashMap<String, String>);
}

/// One event crossing the publish/subscribe bridge between a device session
/// and the rest of the fleet (spec §4.5's `onCoreEvent`, §6's system events).
#[derive(Debug, Clone)]
pub struct CoreEvent {
    pub name: String,
    pub is_public: bool,
    pub ttl: Option<u32>,
    pub published_at: Option<u64>,
    pub data: Option<Vec<u8>>,
}

/// Cross-process fan-out for device-published events, and the bridge back
/// from external publishers to a session's own `PublicEvent`/`PrivateEvent`
/// sends.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, device_id: &[u8], event: CoreEvent);
}

/// Out-of-band load-balancing sidechannel. The session emits on `Ready`;
/// failure here is never fatal (spec §6).
#[async_trait]
pub trait ClusterRouter: Send + Sync {
    async fn announce(&self, device_id: &[u8], server_id: &str);
}
