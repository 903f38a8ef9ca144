//! `EndpointChannelManager`: endpoint-id → current channel, with atomic
//! replacement that preserves the encryption context (spec §4.2).

use crate::channel::{DisconnectReason, EndpointChannel};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct EndpointChannelManager {
    slots: Mutex<HashMap<String, Arc<EndpointChannel>>>,
}

impl EndpointChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `channel` as the current channel for `endpoint_id`. A prior
    /// slot, if any, is closed with `Replaced` and dropped; the encryption
    /// context is not carried forward (spec §4.2).
    pub fn register(&self, endpoint_id: &str, channel: Arc<EndpointChannel>) {
        let mut slots = self.slots.lock();
        if let Some(previous) = slots.remove(endpoint_id) {
            previous.close(DisconnectReason::Replaced);
        }
        slots.insert(endpoint_id.to_string(), channel);
    }

    /// Atomically swaps in `new_channel`, moving the prior encryption
    /// context onto it (unless `enable_encryption` is false). The prior
    /// channel is left open: BWU still needs to drain
    /// `LastWriteToPriorChannel`/`SafeToClosePriorChannel` over it, and only
    /// closes it itself once that handshake completes (spec §4.2, §4.6
    /// steps 5-7).
    pub fn replace(
        &self,
        endpoint_id: &str,
        new_channel: Arc<EndpointChannel>,
        enable_encryption: bool,
    ) {
        let mut slots = self.slots.lock();
        if let Some(previous) = slots.get(endpoint_id) {
            if enable_encryption {
                if let Some(ctx) = previous.encryption_context() {
                    new_channel.set_encryption_context(ctx);
                }
            }
        }
        slots.insert(endpoint_id.to_string(), new_channel);
    }

    /// Returns a shared reference to the current channel; the reference
    /// remains valid for the duration of a read/write even across a
    /// concurrent `replace`, since the old `Arc` is simply dropped once the
    /// last holder releases it (spec §4.2).
    pub fn get(&self, endpoint_id: &str) -> Option<Arc<EndpointChannel>> {
        self.slots.lock().get(endpoint_id).cloned()
    }

    pub fn unregister(&self, endpoint_id: &str, reason: DisconnectReason) {
        if let Some(channel) = self.slots.lock().remove(endpoint_id) {
            channel.close(reason);
        }
    }

    pub fn registered_endpoints(&self) -> Vec<String> {
        self.slots.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{EncryptionContext as Ctx, InMemoryChannel};
    use bytes::Bytes;
    use nc_codec::frame::Medium;
    use nc_connections_core::error::ChannelError;

    struct IdentityContext;
    impl Ctx for IdentityContext {
        fn seal(&self, plaintext: &[u8], _send_counter: u64) -> Result<Bytes, ChannelError> {
            Ok(Bytes::copy_from_slice(plaintext))
        }
        fn open(&self, ciphertext: &[u8], _recv_counter: u64) -> Result<Bytes, ChannelError> {
            Ok(Bytes::copy_from_slice(ciphertext))
        }
    }

    #[test]
    fn register_closes_prior_slot() {
        let manager = EndpointChannelManager::new();
        let (a, _a_peer) = InMemoryChannel::pair(Medium::Bluetooth);
        let (b, _b_peer) = InMemoryChannel::pair(Medium::Bluetooth);
        let first = Arc::new(EndpointChannel::new(a));
        manager.register("ABCD", first.clone());
        let second = Arc::new(EndpointChannel::new(b));
        manager.register("ABCD", second.clone());
        assert_eq!(first.close_reason(), Some(DisconnectReason::Replaced));
        assert!(Arc::ptr_eq(&manager.get("ABCD").unwrap(), &second));
    }

    #[test]
    fn replace_carries_forward_encryption_context() {
        let manager = EndpointChannelManager::new();
        let (a, _a_peer) = InMemoryChannel::pair(Medium::Bluetooth);
        let (b, _b_peer) = InMemoryChannel::pair(Medium::WifiLan);
        let first = Arc::new(EndpointChannel::new(a));
        first.set_encryption_context(Arc::new(IdentityContext));
        manager.register("ABCD", first.clone());
        let second = Arc::new(EndpointChannel::new(b));
        manager.replace("ABCD", second.clone(), true);
        assert_eq!(first.close_reason(), None);
        assert!(second.encryption_context().is_some());
        assert!(Arc::ptr_eq(&manager.get("ABCD").unwrap(), &second));
    }

    #[test]
    fn replace_without_encryption_leaves_new_channel_plaintext() {
        let manager = EndpointChannelManager::new();
        let (a, _a_peer) = InMemoryChannel::pair(Medium::Bluetooth);
        let (b, _b_peer) = InMemoryChannel::pair(Medium::WifiLan);
        let first = Arc::new(EndpointChannel::new(a));
        first.set_encryption_context(Arc::new(IdentityContext));
        manager.register("ABCD", first);
        let second = Arc::new(EndpointChannel::new(b));
        manager.replace("ABCD", second.clone(), false);
        assert!(second.encryption_context().is_none());
    }
}
