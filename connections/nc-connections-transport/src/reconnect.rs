//! `ReconnectManager`: resumes a channel for an endpoint whose negotiated
//! capabilities include safe-to-disconnect and auto-reconnect, instead of
//! repeating the full connection-request handshake (spec §4.9).

use crate::channel::{DisconnectReason, EncryptionContext, EndpointChannel, RawChannel};
use crate::channel_manager::EndpointChannelManager;
use crate::endpoint_manager::{EndpointManager, FrameCategory, FrameProcessor};
use nc_codec::frame::{AutoReconnectFrame, OfflineFrame, ReconnectPhase};
use nc_connections_core::ControllerConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
struct ReconnectDeps {
    config: Arc<ControllerConfig>,
    channels: Arc<EndpointChannelManager>,
    endpoints: Arc<EndpointManager>,
    in_flight: Arc<Mutex<HashMap<String, crossbeam_channel::Sender<()>>>>,
}

pub struct ReconnectManager {
    deps: ReconnectDeps,
}

impl ReconnectManager {
    pub fn new(config: Arc<ControllerConfig>, channels: Arc<EndpointChannelManager>, endpoints: Arc<EndpointManager>) -> Arc<Self> {
        let deps = ReconnectDeps {
            config,
            channels,
            endpoints: endpoints.clone(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        };
        let manager = Arc::new(Self { deps });
        endpoints.register_processor(FrameCategory::Reconnect, manager.clone());
        manager
    }

    /// `AttemptReconnect` (spec §4.9): used both by the side whose reader
    /// observed a transport error and wants to resume, and by the side whose
    /// medium driver hands it a fresh inbound channel for an endpoint it
    /// already knows. `prior_encryption`, when the caller still holds it
    /// from before the old channel was torn down, is installed directly
    /// rather than attempted through `EndpointChannelManager::replace` —
    /// by the time this runs the old slot is normally already gone, unlike
    /// the BWU upgrade path where the old channel is still registered.
    ///
    /// Blocks up to `config.reconnect_timeout` waiting for the peer's side
    /// of the `Intro`/`IntroAck` exchange; returns whether it completed.
    /// On timeout the endpoint is torn down via the normal disconnect path,
    /// so `on_disconnected` still fires exactly once either way.
    pub fn attempt_reconnect(
        &self,
        endpoint_id: &str,
        new_channel: Arc<dyn RawChannel>,
        prior_encryption: Option<Arc<dyn EncryptionContext>>,
    ) -> bool {
        let channel = Arc::new(EndpointChannel::new(new_channel));
        if let Some(ctx) = prior_encryption {
            channel.set_encryption_context(ctx);
        }
        self.deps.channels.replace(endpoint_id, channel.clone(), false);
        self.deps.endpoints.restart_endpoint(endpoint_id, channel.clone());

        let (tx, rx) = crossbeam_channel::bounded(1);
        self.deps.in_flight.lock().insert(endpoint_id.to_string(), tx);

        let intro = OfflineFrame::AutoReconnect(AutoReconnectFrame {
            endpoint_id: endpoint_id.to_string(),
            phase: ReconnectPhase::Intro,
        });
        if channel.write(&intro.encode()).is_err() {
            self.deps.in_flight.lock().remove(endpoint_id);
            self.deps.endpoints.remove_endpoint(endpoint_id, true, DisconnectReason::Error);
            return false;
        }

        let completed = rx.recv_timeout(self.deps.config.reconnect_timeout).is_ok();
        self.deps.in_flight.lock().remove(endpoint_id);
        if !completed {
            tracing::warn!(endpoint_id, "reconnect attempt timed out, falling back to normal disconnection");
            self.deps.endpoints.remove_endpoint(endpoint_id, true, DisconnectReason::Error);
        }
        completed
    }

    /// Tears down a reconnect attempt the local side is abandoning,
    /// notifying the peer so it doesn't keep waiting for an `IntroAck`.
    pub fn abandon(&self, endpoint_id: &str) {
        let disconnect = OfflineFrame::AutoReconnect(AutoReconnectFrame {
            endpoint_id: endpoint_id.to_string(),
            phase: ReconnectPhase::Disconnect,
        });
        let _ = self.deps.endpoints.send(endpoint_id, &disconnect);
        self.deps.in_flight.lock().remove(endpoint_id);
    }

    fn signal_complete(&self, endpoint_id: &str) {
        if let Some(tx) = self.deps.in_flight.lock().get(endpoint_id) {
            let _ = tx.send(());
        }
    }
}

impl FrameProcessor for ReconnectManager {
    fn process(&self, endpoint_id: &str, frame: OfflineFrame) {
        let OfflineFrame::AutoReconnect(frame) = frame else {
            return;
        };
        match frame.phase {
            ReconnectPhase::Intro => {
                let ack = OfflineFrame::AutoReconnect(AutoReconnectFrame {
                    endpoint_id: frame.endpoint_id,
                    phase: ReconnectPhase::IntroAck,
                });
                let _ = self.deps.endpoints.send(endpoint_id, &ack);
                self.signal_complete(endpoint_id);
            }
            ReconnectPhase::IntroAck => self.signal_complete(endpoint_id),
            ReconnectPhase::Disconnect => {
                self.deps.in_flight.lock().remove(endpoint_id);
                self.deps.endpoints.remove_endpoint(endpoint_id, true, DisconnectReason::Remote);
            }
        }
    }

    fn on_endpoint_disconnected(&self, endpoint_id: &str, _notify: bool) {
        self.deps.in_flight.lock().remove(endpoint_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InMemoryChannel;
    use nc_codec::frame::Medium;
    use std::time::Duration;

    #[test]
    fn both_sides_converge_on_intro_exchange() {
        let config = Arc::new(ControllerConfig::default());

        let channels_a = Arc::new(EndpointChannelManager::new());
        let endpoints_a = EndpointManager::new(config.clone(), channels_a.clone());
        let manager_a = ReconnectManager::new(config.clone(), channels_a.clone(), endpoints_a.clone());

        let channels_b = Arc::new(EndpointChannelManager::new());
        let endpoints_b = EndpointManager::new(config.clone(), channels_b.clone());
        let manager_b = ReconnectManager::new(config, channels_b.clone(), endpoints_b.clone());

        let (a, b) = InMemoryChannel::pair(Medium::Bluetooth);

        let handle_a = std::thread::spawn(move || manager_a.attempt_reconnect("PEER", a, None));
        let handle_b = std::thread::spawn(move || manager_b.attempt_reconnect("LOCAL", b, None));

        assert!(handle_a.join().unwrap());
        assert!(handle_b.join().unwrap());
    }

    #[test]
    fn reconnect_times_out_without_a_peer() {
        let mut config = ControllerConfig::default();
        config.reconnect_timeout = Duration::from_millis(50);
        let config = Arc::new(config);
        let channels = Arc::new(EndpointChannelManager::new());
        let endpoints = EndpointManager::new(config.clone(), channels.clone());
        let manager = ReconnectManager::new(config, channels, endpoints);

        let (a, _b) = InMemoryChannel::pair(Medium::Bluetooth);
        assert!(!manager.attempt_reconnect("GHOST", a, None));
    }
}
