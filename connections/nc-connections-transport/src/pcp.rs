//! `BasePcpHandler` and the three concrete PCP variants (spec §4.3):
//! Cluster, Star, PointToPoint. Owns the single-threaded "PCP thread" that
//! serializes every mutation of discovered-endpoint state, pending
//! connections and accept/reject arbitration.

use crate::channel::{DisconnectReason, EndpointChannel, RawChannel};
use crate::channel_manager::EndpointChannelManager;
use crate::endpoint_manager::{EndpointManager, FrameCategory, FrameProcessor};
use crate::executor::SerialExecutor;
use crate::handshake::{run_handshake, EncryptionRunnerResult, X25519Ukey2Cipher};
use bytes::Bytes;
use nc_codec::frame::{
    ConnectionRequestFrame, ConnectionResponseFrame, ConnectionResponseStatus, DisconnectionFrame,
    Medium, OfflineFrame, OsInfo, MAX_ENDPOINT_INFO_LEN,
};
use nc_connections_core::client::{compute_connection_token, ClientProxy};
use nc_connections_core::connection::{
    Connection, ConnectionListener, ConnectionOptions, ConnectionStatus, Direction,
    PayloadListener, PendingConnection,
};
use nc_connections_core::endpoint::{DiscoveredEndpoint, DiscoveredEndpointBook, EndpointId};
use nc_connections_core::{ControllerConfig, Status};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// The three PCP topologies (spec §4.3.6). Role limits are expressed in
/// terms of the calling client's current connection count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PcpVariant {
    Cluster,
    Star { is_advertiser: bool },
    PointToPoint,
}

impl PcpVariant {
    fn can_send_outgoing(self, connection_count: usize) -> bool {
        match self {
            PcpVariant::Cluster => true,
            PcpVariant::Star { is_advertiser: true } => false,
            PcpVariant::Star { is_advertiser: false } => connection_count == 0,
            PcpVariant::PointToPoint => connection_count == 0,
        }
    }

    fn can_receive_incoming(self, connection_count: usize) -> bool {
        match self {
            PcpVariant::Cluster => true,
            PcpVariant::Star { is_advertiser } => is_advertiser,
            PcpVariant::PointToPoint => connection_count == 0,
        }
    }
}

/// Obtains a raw channel to a discovered endpoint. This is the seam a real
/// BLE/Bluetooth-Classic/Wi-Fi-LAN driver would implement; the crate ships
/// only the in-memory test double below (spec §4.14).
pub trait MediumConnector: Send + Sync {
    fn connect(&self, endpoint: &DiscoveredEndpoint) -> Result<Arc<dyn RawChannel>, Status>;
}

/// The seam a real medium driver (Bluetooth-Classic discoverability, a BLE
/// advertiser, an mDNS responder...) implements to start/stop advertising on
/// one medium (spec §4.3.1, mirrors `BwuHandler`'s role for BWU). `start`
/// returns the `Status` to surface to the caller when it can't start (e.g.
/// `Status::BluetoothError`); `stop` is infallible, matching the platform
/// APIs this wraps.
pub trait AdvertisingMediumHandler: Send + Sync {
    fn medium(&self) -> Medium;
    fn start(&self, service_id: &str, endpoint_info: &Bytes) -> Result<(), Status>;
    fn stop(&self);
}

/// Always-succeeds advertising handler backed by an `AtomicBool` marking
/// whether it is currently "advertising", standing in for a real medium
/// driver in tests (spec §4.14).
pub struct InMemoryAdvertisingHandler {
    medium: Medium,
    active: std::sync::atomic::AtomicBool,
}

impl InMemoryAdvertisingHandler {
    pub fn new(medium: Medium) -> Arc<Self> {
        Arc::new(Self { medium, active: std::sync::atomic::AtomicBool::new(false) })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl AdvertisingMediumHandler for InMemoryAdvertisingHandler {
    fn medium(&self) -> Medium {
        self.medium
    }

    fn start(&self, _service_id: &str, _endpoint_info: &Bytes) -> Result<(), Status> {
        self.active.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.active.store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Looks up a pre-wired in-memory channel half by endpoint id, standing in
/// for a medium driver in tests (spec §4.14, mirrors `fake_bwu_handler.h`'s
/// role for BWU).
#[derive(Default)]
pub struct InMemoryConnector {
    channels: Mutex<HashMap<String, Arc<dyn RawChannel>>>,
}

impl InMemoryConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, endpoint_id: &str, channel: Arc<dyn RawChannel>) {
        self.channels.lock().insert(endpoint_id.to_string(), channel);
    }
}

impl MediumConnector for InMemoryConnector {
    fn connect(&self, endpoint: &DiscoveredEndpoint) -> Result<Arc<dyn RawChannel>, Status> {
        self.channels
            .lock()
            .get(endpoint.endpoint().endpoint_id.as_str())
            .cloned()
            .ok_or(Status::EndpointUnknown)
    }
}

struct PcpState {
    discovered: DiscoveredEndpointBook,
    pending: HashMap<String, PendingConnection>,
    statuses: HashMap<String, ConnectionStatus>,
    payload_listeners: HashMap<String, Arc<dyn PayloadListener>>,
    finalized: HashSet<String>,
    listener: Option<Arc<dyn ConnectionListener>>,
    local_service_id: Option<String>,
    /// Mediums a prior `start_advertising` actually started, so
    /// `stop_advertising` only tears down what it started.
    advertising_mediums: Vec<Medium>,
}

impl Default for PcpState {
    fn default() -> Self {
        Self {
            discovered: DiscoveredEndpointBook::new(),
            pending: HashMap::new(),
            statuses: HashMap::new(),
            payload_listeners: HashMap::new(),
            finalized: HashSet::new(),
            listener: None,
            local_service_id: None,
            advertising_mediums: Vec::new(),
        }
    }
}

/// One client's PCP state machine (spec §4.3). Every method that touches
/// `state` or `client` reposts onto `executor` so all such mutations observe
/// a total order, matching §5's "runs on PCP thread" contract.
pub struct BasePcpHandler {
    variant: PcpVariant,
    config: Arc<ControllerConfig>,
    executor: SerialExecutor,
    state: Arc<Mutex<PcpState>>,
    client: Arc<Mutex<ClientProxy>>,
    channels: Arc<EndpointChannelManager>,
    endpoints: Arc<EndpointManager>,
    connector: Arc<dyn MediumConnector>,
    advertising_handlers: Mutex<HashMap<Medium, Arc<dyn AdvertisingMediumHandler>>>,
    /// Test-only override for the next tie-break nonce drawn by either
    /// `request_connection` or `on_incoming_connection`, so a test can force
    /// the simultaneous-connect race in spec §4.3.6 instead of depending on
    /// `rand` to land a particular way.
    forced_nonce: Arc<Mutex<Option<u32>>>,
}

impl BasePcpHandler {
    pub fn new(
        variant: PcpVariant,
        config: Arc<ControllerConfig>,
        client_id: u64,
        channels: Arc<EndpointChannelManager>,
        endpoints: Arc<EndpointManager>,
        connector: Arc<dyn MediumConnector>,
    ) -> Arc<Self> {
        let handler = Arc::new(Self {
            variant,
            config,
            executor: SerialExecutor::new("pcp-thread"),
            state: Arc::new(Mutex::new(PcpState::default())),
            client: Arc::new(Mutex::new(ClientProxy::new(client_id))),
            channels,
            endpoints,
            connector,
            advertising_handlers: Mutex::new(HashMap::new()),
            forced_nonce: Arc::new(Mutex::new(None)),
        });
        handler
            .endpoints
            .register_processor(FrameCategory::ConnectionControl, handler.clone());
        handler
    }

    #[cfg(test)]
    pub(crate) fn queue_nonce(&self, nonce: u32) {
        *self.forced_nonce.lock() = Some(nonce);
    }

    pub fn set_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.state.lock().listener = Some(listener);
    }

    pub fn local_endpoint_id(&self) -> EndpointId {
        self.client.lock().local_endpoint_id().clone()
    }

    /// Registers a medium's advertising driver (spec §4.14). `start_advertising`
    /// only starts mediums with a registered handler; an unregistered medium
    /// is treated the same as one whose driver failed to start.
    pub fn register_advertising_handler(&self, handler: Arc<dyn AdvertisingMediumHandler>) {
        self.advertising_handlers.lock().insert(handler.medium(), handler);
    }

    /// The mediums the most recent `start_advertising` actually started.
    pub fn advertising_mediums(&self) -> Vec<Medium> {
        self.state.lock().advertising_mediums.clone()
    }

    /// Spec §4.3.1: starts every registered advertising medium (in
    /// `config.medium_priority_order`), records the service_id, and flips
    /// the advertising role on. Returns the mediums that actually started;
    /// `Status::BluetoothError` if none did, matching the "return
    /// BluetoothError if none started" contract. `endpoint_info` is stored
    /// on `ClientProxy` so the incoming-handshake path (§4.3.4) can reply
    /// with it instead of an empty blob.
    pub fn start_advertising(&self, service_id: &str, endpoint_info: Bytes) -> Status {
        if endpoint_info.len() > MAX_ENDPOINT_INFO_LEN {
            return Status::Error;
        }
        let state = self.state.clone();
        let client = self.client.clone();
        let config = self.config.clone();
        let handlers = self.advertising_handlers.lock().clone();
        let service_id_owned = service_id.to_string();
        self.executor
            .submit_and_wait(move || {
                use nc_connections_core::client::Role;
                {
                    let mut client = client.lock();
                    if !client.can_start(Role::Advertising) {
                        return Status::OutOfOrderApiCall;
                    }
                }

                let mut started = Vec::new();
                for medium in &config.medium_priority_order {
                    if let Some(handler) = handlers.get(medium) {
                        if handler.start(&service_id_owned, &endpoint_info).is_ok() {
                            started.push(*medium);
                        }
                    }
                }
                if started.is_empty() {
                    return Status::BluetoothError;
                }

                let mut client = client.lock();
                client.start_advertising_session();
                client.local_endpoint_info = endpoint_info;
                let mut state = state.lock();
                state.local_service_id = Some(service_id_owned);
                state.advertising_mediums = started;
                Status::Success
            })
            .unwrap_or(Status::Error)
    }

    pub fn stop_advertising(&self) {
        let client = self.client.clone();
        let state = self.state.clone();
        let handlers = self.advertising_handlers.lock().clone();
        let _ = self.executor.submit_and_wait(move || {
            use nc_connections_core::client::Role;
            let started = std::mem::take(&mut state.lock().advertising_mediums);
            for medium in started {
                if let Some(handler) = handlers.get(&medium) {
                    handler.stop();
                }
            }
            let mut client = client.lock();
            client.stop_advertising_session();
            client.set_role_active(Role::Advertising, false);
        });
    }

    pub fn start_discovery(&self) -> Status {
        let client = self.client.clone();
        self.executor
            .submit_and_wait(move || {
                use nc_connections_core::client::Role;
                let mut client = client.lock();
                if !client.can_start(Role::Discovering) {
                    return Status::OutOfOrderApiCall;
                }
                client.set_role_active(Role::Discovering, true);
                Status::Success
            })
            .unwrap_or(Status::Error)
    }

    pub fn stop_discovery(&self) {
        let client = self.client.clone();
        let _ = self.executor.submit_and_wait(move || {
            use nc_connections_core::client::Role;
            client.lock().set_role_active(Role::Discovering, false);
        });
    }

    pub fn start_listening_for_incoming_connections(&self) -> Status {
        let client = self.client.clone();
        self.executor
            .submit_and_wait(move || {
                use nc_connections_core::client::Role;
                let mut client = client.lock();
                if !client.can_start(Role::ListeningForIncoming) {
                    return Status::OutOfOrderApiCall;
                }
                client.set_role_active(Role::ListeningForIncoming, true);
                Status::Success
            })
            .unwrap_or(Status::Error)
    }

    pub fn stop_listening_for_incoming_connections(&self) {
        let client = self.client.clone();
        let _ = self.executor.submit_and_wait(move || {
            use nc_connections_core::client::Role;
            client.lock().set_role_active(Role::ListeningForIncoming, false);
        });
    }

    /// Out-of-band endpoint injection (spec §6.3 `InjectEndpoint`) and the
    /// normal medium-driver `OnEndpointFound` path share this entry point.
    pub fn on_endpoint_found(&self, discovered: DiscoveredEndpoint) {
        let state = self.state.clone();
        let _ = self.executor.submit_and_wait(move || {
            state.lock().discovered.insert(discovered);
        });
    }

    pub fn on_endpoint_lost(&self, endpoint_id: &str, medium: Medium) {
        let state = self.state.clone();
        let endpoint_id = endpoint_id.to_string();
        let _ = self
            .executor
            .submit_and_wait(move || state.lock().discovered.remove_medium(&endpoint_id, medium));
    }

    fn request_frame(&self, nonce: u32, local_endpoint_id: &EndpointId, info: &Bytes) -> ConnectionRequestFrame {
        ConnectionRequestFrame {
            endpoint_id: local_endpoint_id.as_str().to_string(),
            endpoint_info: info.clone(),
            nonce,
            supported_mediums: self.config.medium_priority_order.clone(),
            wifi: None,
            keep_alive_interval_millis: self.config.keep_alive_interval.as_millis() as u32,
            keep_alive_timeout_millis: self.config.keep_alive_timeout.as_millis() as u32,
            os_info: OsInfo::Linux,
            safe_to_disconnect_version: self.config.safe_to_disconnect_minimum_version,
            multiplex_socket_bitmask: 0,
        }
    }

    /// Outgoing connection handshake (spec §4.3.3). Returns once the channel
    /// is registered and `on_initiated` has fired; final accept/reject
    /// arrives later via `ConnectionListener` callbacks, not by blocking
    /// this call (Open Question resolution, see DESIGN.md). The medium
    /// connect and key-exchange handshake run on the calling thread rather
    /// than `executor`, so a slow peer only stalls this one attempt (spec
    /// §4.3.6, §5); only the short state reservation/finalization steps
    /// repost onto `executor` to keep those mutations totally ordered.
    pub fn request_connection(self: &Arc<Self>, endpoint_id: &str, info: Bytes, options: ConnectionOptions) -> Status {
        self.request_connection_on_thread(endpoint_id, info, options)
    }

    fn executor_submit(self: &Arc<Self>, f: impl FnOnce(&BasePcpHandler) -> Status + Send + 'static) -> Status {
        let this = self.clone();
        self.executor
            .submit_and_wait(move || f(&this))
            .unwrap_or(Status::Error)
    }

    fn request_connection_on_thread(&self, endpoint_id: &str, info: Bytes, options: ConnectionOptions) -> Status {
        let (discovered, local_nonce) = {
            let state = self.state.clone();
            let client = self.client.clone();
            let variant = self.variant;
            let endpoint_id = endpoint_id.to_string();
            let forced_nonce = self.forced_nonce.clone();
            let result = self.executor.submit_and_wait(move || {
                let connection_count = client.lock().connection_count();
                if !variant.can_send_outgoing(connection_count) {
                    return Err(Status::OutOfOrderApiCall);
                }
                let discovered = {
                    let state = state.lock();
                    match state.discovered.best(&endpoint_id, DiscoveredEndpoint::default_medium_priority) {
                        Some(found) => found.clone(),
                        None => return Err(Status::EndpointUnknown),
                    }
                };
                let local_nonce: u32 = forced_nonce.lock().take().unwrap_or_else(|| rand::rng().random());
                let mut state = state.lock();
                state.pending.insert(
                    endpoint_id.clone(),
                    PendingConnection::new(EndpointId::new(&endpoint_id), Direction::Outgoing, local_nonce),
                );
                state.statuses.insert(endpoint_id.clone(), ConnectionStatus::pending());
                Ok((discovered, local_nonce))
            });
            match result {
                Some(Ok(pair)) => pair,
                Some(Err(status)) => return status,
                None => return Status::Error,
            }
        };

        let raw = match self.connector.connect(&discovered) {
            Ok(raw) => raw,
            Err(status) => {
                self.clear_pending(endpoint_id);
                return status;
            }
        };
        let channel = EndpointChannel::new(raw);
        let local_id = self.local_endpoint_id();
        let outgoing = self.request_frame(local_nonce, &local_id, &info);
        if channel
            .write(&OfflineFrame::ConnectionRequest(outgoing).encode())
            .is_err()
        {
            self.clear_pending(endpoint_id);
            return Status::EndpointIoError;
        }
        let incoming = match channel.read_timeout(self.config.connection_request_read_timeout) {
            Ok(bytes) => bytes,
            Err(_) => {
                self.clear_pending(endpoint_id);
                return Status::EndpointIoError;
            }
        };
        let remote = match OfflineFrame::decode(&incoming) {
            Ok(OfflineFrame::ConnectionRequest(frame)) => frame,
            _ => {
                self.clear_pending(endpoint_id);
                return Status::AuthenticationError;
            }
        };

        match run_handshake(&channel, X25519Ukey2Cipher::initiator()) {
            EncryptionRunnerResult::Success { context, auth_token, .. } => {
                channel.set_encryption_context(context);
                let channel = Arc::new(channel);
                self.channels.register(endpoint_id, channel.clone());
                self.endpoints.start_endpoint(endpoint_id.to_string(), channel);
                let token = compute_connection_token(local_nonce, remote.nonce);

                let state = self.state.clone();
                let client = self.client.clone();
                let endpoint_id = endpoint_id.to_string();
                self.executor
                    .submit_and_wait(move || {
                        let mut connection = Connection::new(EndpointId::new(&endpoint_id), Direction::Outgoing, token);
                        connection.options = options;
                        client.lock().insert_connection(connection);
                        if let Some(listener) = state.lock().listener.clone() {
                            listener.on_initiated(&EndpointId::new(&endpoint_id), &auth_token, false);
                        }
                        Status::Success
                    })
                    .unwrap_or(Status::Error)
            }
            EncryptionRunnerResult::Failure(_) => {
                self.clear_pending(endpoint_id);
                Status::AuthenticationError
            }
        }
    }

    /// Removes a reserved pending slot after a failed outgoing/incoming
    /// attempt; run on `executor` so the removal stays ordered with respect
    /// to a concurrent tie-break check for the same endpoint.
    fn clear_pending(&self, endpoint_id: &str) {
        let state = self.state.clone();
        let endpoint_id = endpoint_id.to_string();
        let _ = self.executor.submit_and_wait(move || {
            state.lock().pending.remove(&endpoint_id);
        });
    }

    /// Incoming connection handshake (spec §4.3.4), including tie-break
    /// against a racing local outgoing attempt (§4.3.6). Like
    /// [`Self::request_connection`], only the tie-break/reservation check
    /// and the final bookkeeping run on `executor`; the read, write and
    /// handshake run on the calling thread so concurrent incoming attempts
    /// from different peers don't queue behind one another.
    pub fn on_incoming_connection(self: &Arc<Self>, raw: Arc<dyn RawChannel>) -> Status {
        self.on_incoming_connection_on_thread(raw)
    }

    fn on_incoming_connection_on_thread(&self, raw: Arc<dyn RawChannel>) -> Status {
        let channel = EndpointChannel::new(raw);
        let bytes = match channel.read_timeout(self.config.connection_request_read_timeout) {
            Ok(bytes) => bytes,
            Err(_) => return Status::EndpointIoError,
        };
        let request = match OfflineFrame::decode(&bytes) {
            Ok(OfflineFrame::ConnectionRequest(frame)) => frame,
            _ => return Status::AuthenticationError,
        };
        let endpoint_id = request.endpoint_id.clone();

        let local_nonce: u32 = {
            let state = self.state.clone();
            let client = self.client.clone();
            let variant = self.variant;
            let endpoint_id_owned = endpoint_id.clone();
            let remote_nonce = request.nonce;
            let result = self.executor.submit_and_wait(move || {
                {
                    let mut state = state.lock();
                    if let Some(outgoing) = state.pending.get(&endpoint_id_owned) {
                        if outgoing.direction == Direction::Outgoing {
                            let local_nonce = outgoing.nonce;
                            if PendingConnection::wins_tie_break(local_nonce, remote_nonce) {
                                return Err(Status::AlreadyConnected);
                            }
                            if local_nonce == remote_nonce {
                                state.pending.remove(&endpoint_id_owned);
                                return Err(Status::Error);
                            }
                            state.pending.remove(&endpoint_id_owned);
                            if let Some(listener) = state.listener.clone() {
                                listener.on_rejected(&EndpointId::new(&endpoint_id_owned), Status::ConnectionRejected);
                            }
                        }
                    }
                }

                let connection_count = client.lock().connection_count();
                if !variant.can_receive_incoming(connection_count) {
                    return Err(Status::OutOfOrderApiCall);
                }

                let local_nonce: u32 = rand::rng().random();
                let mut state = state.lock();
                state.pending.insert(
                    endpoint_id_owned.clone(),
                    PendingConnection::new(EndpointId::new(&endpoint_id_owned), Direction::Incoming, remote_nonce),
                );
                state.statuses.insert(endpoint_id_owned, ConnectionStatus::pending());
                Ok(local_nonce)
            });
            match result {
                Some(Ok(nonce)) => nonce,
                Some(Err(status)) => {
                    channel.close(DisconnectReason::Local);
                    return status;
                }
                None => return Status::Error,
            }
        };

        let local_id = self.local_endpoint_id();
        let local_info = self.client.lock().local_endpoint_info.clone();
        let reply = self.request_frame(local_nonce, &local_id, &local_info);
        if channel
            .write(&OfflineFrame::ConnectionRequest(reply).encode())
            .is_err()
        {
            self.clear_pending(&endpoint_id);
            return Status::EndpointIoError;
        }

        match run_handshake(&channel, X25519Ukey2Cipher::responder()) {
            EncryptionRunnerResult::Success { context, auth_token, .. } => {
                channel.set_encryption_context(context);
                let channel = Arc::new(channel);
                self.channels.register(&endpoint_id, channel.clone());
                self.endpoints.start_endpoint(endpoint_id.clone(), channel);
                let token = compute_connection_token(request.nonce, local_nonce);

                let state = self.state.clone();
                let client = self.client.clone();
                let endpoint_id = endpoint_id.clone();
                self.executor
                    .submit_and_wait(move || {
                        let connection = Connection::new(EndpointId::new(&endpoint_id), Direction::Incoming, token);
                        client.lock().insert_connection(connection);
                        if let Some(listener) = state.lock().listener.clone() {
                            listener.on_initiated(&EndpointId::new(&endpoint_id), &auth_token, true);
                        }
                        Status::Success
                    })
                    .unwrap_or(Status::Error)
            }
            EncryptionRunnerResult::Failure(_) => {
                self.clear_pending(&endpoint_id);
                Status::AuthenticationError
            }
        }
    }

    pub fn accept_connection(self: &Arc<Self>, endpoint_id: &str, payload_listener: Arc<dyn PayloadListener>) -> Status {
        let endpoint_id = endpoint_id.to_string();
        self.executor_submit(move |handler| {
            {
                let mut state = handler.state.lock();
                let status = state.statuses.entry(endpoint_id.clone()).or_default();
                status.accept_local();
                state.payload_listeners.insert(endpoint_id.clone(), payload_listener.clone());
            }
            let frame = ConnectionResponseFrame {
                status: ConnectionResponseStatus::Accept,
                os_info: OsInfo::Linux,
                safe_to_disconnect_version: handler.config.safe_to_disconnect_minimum_version,
                multiplex_socket_bitmask: 0,
            };
            handler.endpoints.send(&endpoint_id, &OfflineFrame::ConnectionResponse(frame));
            handler.evaluate_connection_result(&endpoint_id);
            Status::Success
        })
    }

    pub fn reject_connection(self: &Arc<Self>, endpoint_id: &str) -> Status {
        let endpoint_id = endpoint_id.to_string();
        self.executor_submit(move |handler| {
            handler
                .state
                .lock()
                .statuses
                .entry(endpoint_id.clone())
                .or_default()
                .reject_local();
            let frame = ConnectionResponseFrame {
                status: ConnectionResponseStatus::Reject,
                os_info: OsInfo::Linux,
                safe_to_disconnect_version: handler.config.safe_to_disconnect_minimum_version,
                multiplex_socket_bitmask: 0,
            };
            handler.endpoints.send(&endpoint_id, &OfflineFrame::ConnectionResponse(frame));
            handler.evaluate_connection_result(&endpoint_id);
            Status::Success
        })
    }

    pub fn disconnect_from_endpoint(self: &Arc<Self>, endpoint_id: &str) {
        let endpoint_id = endpoint_id.to_string();
        let _ = self.executor_submit(move |handler| {
            let frame = DisconnectionFrame {
                request_safe_to_disconnect: false,
                ack_safe_to_disconnect: false,
            };
            handler.endpoints.send(&endpoint_id, &OfflineFrame::Disconnection(frame));
            handler.teardown_connection(&endpoint_id, false, DisconnectReason::Local);
            Status::Success
        });
    }

    /// Spec §4.3.5: promotes to CONNECTED once both sides accept, or fires
    /// the rejected path and schedules the delayed close otherwise. Runs
    /// only from inside a closure already executing on the PCP thread.
    fn evaluate_connection_result(&self, endpoint_id: &str) {
        let mut state = self.state.lock();
        if state.finalized.contains(endpoint_id) {
            return;
        }
        let status = state.statuses.get(endpoint_id).copied().unwrap_or_default();
        if status.is_connected() {
            state.finalized.insert(endpoint_id.to_string());
            if let Some(connection) = self.client.lock().connection_mut(endpoint_id) {
                connection.status = status;
            }
            state.pending.remove(endpoint_id);
            if let Some(listener) = state.listener.clone() {
                listener.on_accepted(&EndpointId::new(endpoint_id));
            }
        } else if status.is_rejected() {
            state.finalized.insert(endpoint_id.to_string());
            if let Some(listener) = state.listener.clone() {
                listener.on_rejected(&EndpointId::new(endpoint_id), Status::ConnectionRejected);
            }
            let endpoints = self.endpoints.clone();
            let endpoint_id = endpoint_id.to_string();
            let delay = self.config.rejected_connection_close_delay;
            std::thread::spawn(move || {
                std::thread::sleep(delay);
                endpoints.remove_endpoint(&endpoint_id, false, DisconnectReason::Local);
            });
        }
    }

    fn teardown_connection(&self, endpoint_id: &str, notify: bool, reason: DisconnectReason) {
        let mut state = self.state.lock();
        state.pending.remove(endpoint_id);
        state.statuses.remove(endpoint_id);
        state.payload_listeners.remove(endpoint_id);
        state.finalized.remove(endpoint_id);
        self.client.lock().remove_connection(endpoint_id);
        if notify {
            if let Some(listener) = state.listener.clone() {
                listener.on_disconnected(&EndpointId::new(endpoint_id));
            }
        }
        self.endpoints.remove_endpoint(endpoint_id, false, reason);
    }
}

impl FrameProcessor for BasePcpHandler {
    fn process(&self, endpoint_id: &str, frame: OfflineFrame) {
        match frame {
            OfflineFrame::ConnectionResponse(response) => {
                let mut state = self.state.lock();
                let status = state.statuses.entry(endpoint_id.to_string()).or_default();
                match response.status {
                    ConnectionResponseStatus::Accept => status.accept_remote(),
                    ConnectionResponseStatus::Reject => status.reject_remote(),
                }
                drop(state);
                self.evaluate_connection_result(endpoint_id);
            }
            OfflineFrame::Disconnection(_) => {
                self.teardown_connection(endpoint_id, true, DisconnectReason::Remote);
            }
            other => {
                tracing::warn!(endpoint_id, ?other, "unexpected frame in connection-control dispatch");
            }
        }
    }

    fn on_endpoint_disconnected(&self, endpoint_id: &str, notify: bool) {
        let mut state = self.state.lock();
        state.pending.remove(endpoint_id);
        state.statuses.remove(endpoint_id);
        state.payload_listeners.remove(endpoint_id);
        state.finalized.remove(endpoint_id);
        self.client.lock().remove_connection(endpoint_id);
        if notify {
            if let Some(listener) = state.listener.clone() {
                listener.on_disconnected(&EndpointId::new(endpoint_id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InMemoryChannel;
    use nc_connections_core::endpoint::{Endpoint, WebRtcReachability};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct RecordingListener {
        initiated: Arc<AtomicUsize>,
        accepted: Arc<StdMutex<Vec<String>>>,
    }

    impl ConnectionListener for RecordingListener {
        fn on_initiated(&self, _endpoint_id: &EndpointId, _token: &str, _is_incoming: bool) {
            self.initiated.fetch_add(1, Ordering::SeqCst);
        }
        fn on_accepted(&self, endpoint_id: &EndpointId) {
            self.accepted.lock().unwrap().push(endpoint_id.as_str().to_string());
        }
        fn on_rejected(&self, _endpoint_id: &EndpointId, _status: Status) {}
        fn on_disconnected(&self, _endpoint_id: &EndpointId) {}
    }

    struct NullPayloadListener;
    impl PayloadListener for NullPayloadListener {
        fn on_payload_received(&self, _endpoint_id: &EndpointId, _payload: nc_connections_core::payload::Payload) {}
        fn on_payload_progress(&self, _endpoint_id: &EndpointId, _progress: nc_connections_core::payload::PayloadProgress) {}
    }

    fn build_handler(client_id: u64, connector: Arc<InMemoryConnector>) -> Arc<BasePcpHandler> {
        let config = Arc::new(ControllerConfig::default());
        let channels = Arc::new(EndpointChannelManager::new());
        let endpoints = EndpointManager::new(config.clone(), channels.clone());
        BasePcpHandler::new(PcpVariant::Cluster, config, client_id, channels, endpoints, connector)
    }

    #[test]
    fn start_advertising_with_no_registered_medium_fails_with_bluetooth_error() {
        let handler = build_handler(1, InMemoryConnector::new());
        assert_eq!(handler.start_advertising("svc", Bytes::new()), Status::BluetoothError);
        assert!(handler.advertising_mediums().is_empty());
    }

    #[test]
    fn start_advertising_rejects_endpoint_info_over_the_wire_limit() {
        let handler = build_handler(1, InMemoryConnector::new());
        let bluetooth = InMemoryAdvertisingHandler::new(Medium::Bluetooth);
        handler.register_advertising_handler(bluetooth.clone());
        let oversized = Bytes::from(vec![0u8; MAX_ENDPOINT_INFO_LEN + 1]);
        assert_eq!(handler.start_advertising("svc", oversized), Status::Error);
        assert!(!bluetooth.is_active());
        assert!(handler.advertising_mediums().is_empty());
    }

    #[test]
    fn start_advertising_starts_every_registered_medium_and_records_it() {
        let handler = build_handler(1, InMemoryConnector::new());
        let bluetooth = InMemoryAdvertisingHandler::new(Medium::Bluetooth);
        let wifi_lan = InMemoryAdvertisingHandler::new(Medium::WifiLan);
        handler.register_advertising_handler(bluetooth.clone());
        handler.register_advertising_handler(wifi_lan.clone());

        assert_eq!(handler.start_advertising("svc", Bytes::new()), Status::Success);
        assert!(bluetooth.is_active());
        assert!(wifi_lan.is_active());
        let mut started = handler.advertising_mediums();
        started.sort_by_key(|m| format!("{m:?}"));
        let mut expected = vec![Medium::Bluetooth, Medium::WifiLan];
        expected.sort_by_key(|m| format!("{m:?}"));
        assert_eq!(started, expected);

        handler.stop_advertising();
        assert!(!bluetooth.is_active());
        assert!(!wifi_lan.is_active());
        assert!(handler.advertising_mediums().is_empty());
    }

    #[test]
    fn outgoing_and_incoming_handshake_connects_and_accepts() {
        let (a, b) = InMemoryChannel::pair(Medium::Bluetooth);
        let connector_a = InMemoryConnector::new();
        connector_a.register("BBBB", a);
        let handler_a = build_handler(1, connector_a);
        let handler_b = build_handler(2, InMemoryConnector::new());

        let initiated_a = Arc::new(AtomicUsize::new(0));
        let accepted_a = Arc::new(StdMutex::new(Vec::new()));
        handler_a.set_connection_listener(Arc::new(RecordingListener {
            initiated: initiated_a.clone(),
            accepted: accepted_a.clone(),
        }));
        let initiated_b = Arc::new(AtomicUsize::new(0));
        let accepted_b = Arc::new(StdMutex::new(Vec::new()));
        handler_b.set_connection_listener(Arc::new(RecordingListener {
            initiated: initiated_b.clone(),
            accepted: accepted_b.clone(),
        }));

        handler_a.on_endpoint_found(DiscoveredEndpoint::Bluetooth {
            endpoint: Endpoint {
                endpoint_id: EndpointId::new("BBBB"),
                endpoint_info: Bytes::new(),
                service_id: "svc".to_string(),
                medium: Medium::Bluetooth,
                webrtc_reachability: WebRtcReachability::Undefined,
            },
            remote_bluetooth_mac_address: [0; 6],
        });

        let incoming_side = std::thread::spawn(move || handler_b.on_incoming_connection(b));
        let outgoing_status = handler_a.request_connection("BBBB", Bytes::new(), ConnectionOptions::default());
        let incoming_status = incoming_side.join().unwrap();

        assert_eq!(outgoing_status, Status::Success);
        assert_eq!(incoming_status, Status::Success);
        assert_eq!(initiated_a.load(Ordering::SeqCst), 1);
        assert_eq!(initiated_b.load(Ordering::SeqCst), 1);

        let accept_a = handler_a.accept_connection("BBBB", Arc::new(NullPayloadListener));
        assert_eq!(accept_a, Status::Success);

        for _ in 0..200 {
            if !accepted_a.lock().unwrap().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(accepted_a.lock().unwrap().as_slice(), &["BBBB".to_string()]);
    }

    struct RejectionRecordingListener {
        rejected: Arc<StdMutex<Vec<String>>>,
    }
    impl ConnectionListener for RejectionRecordingListener {
        fn on_initiated(&self, _endpoint_id: &EndpointId, _token: &str, _is_incoming: bool) {}
        fn on_accepted(&self, _endpoint_id: &EndpointId) {}
        fn on_rejected(&self, endpoint_id: &EndpointId, _status: Status) {
            self.rejected.lock().unwrap().push(endpoint_id.as_str().to_string());
        }
        fn on_disconnected(&self, _endpoint_id: &EndpointId) {}
    }

    #[test]
    fn rejected_connection_closes_channel_after_configured_delay() {
        let mut config = ControllerConfig::default();
        config.rejected_connection_close_delay = Duration::from_millis(30);
        let config = Arc::new(config);

        let connector_a = InMemoryConnector::new();
        let channels_a = Arc::new(EndpointChannelManager::new());
        let endpoints_a = EndpointManager::new(config.clone(), channels_a.clone());
        let handler_a =
            BasePcpHandler::new(PcpVariant::Cluster, config.clone(), 1, channels_a.clone(), endpoints_a, connector_a.clone());

        let channels_b = Arc::new(EndpointChannelManager::new());
        let endpoints_b = EndpointManager::new(config.clone(), channels_b.clone());
        let handler_b = BasePcpHandler::new(PcpVariant::Cluster, config, 2, channels_b, endpoints_b, InMemoryConnector::new());

        let (a, b) = InMemoryChannel::pair(Medium::Bluetooth);
        connector_a.register("BBBB", a);

        let rejected_a = Arc::new(StdMutex::new(Vec::new()));
        handler_a.set_connection_listener(Arc::new(RejectionRecordingListener { rejected: rejected_a.clone() }));

        let incoming = std::thread::spawn(move || handler_b.on_incoming_connection(b));
        let outgoing_status = handler_a.request_connection("BBBB", Bytes::new(), ConnectionOptions::default());
        assert_eq!(incoming.join().unwrap(), Status::Success);
        assert_eq!(outgoing_status, Status::Success);

        assert_eq!(handler_a.reject_connection("BBBB"), Status::Success);

        for _ in 0..200 {
            if !rejected_a.lock().unwrap().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(rejected_a.lock().unwrap().as_slice(), &["BBBB".to_string()]);

        for _ in 0..200 {
            if !channels_a.registered_endpoints().contains(&"BBBB".to_string()) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!channels_a.registered_endpoints().contains(&"BBBB".to_string()));
    }

    #[test]
    fn request_connection_to_unconnected_medium_fails_with_endpoint_unknown() {
        let connector = InMemoryConnector::new();
        let config = Arc::new(ControllerConfig::default());
        let channels = Arc::new(EndpointChannelManager::new());
        let endpoints = EndpointManager::new(config.clone(), channels.clone());
        let handler = BasePcpHandler::new(PcpVariant::PointToPoint, config, 1, channels, endpoints, connector);
        handler.on_endpoint_found(DiscoveredEndpoint::Bluetooth {
            endpoint: Endpoint {
                endpoint_id: EndpointId::new("ZZZZ"),
                endpoint_info: Bytes::new(),
                service_id: "svc".to_string(),
                medium: Medium::Bluetooth,
                webrtc_reachability: WebRtcReachability::Undefined,
            },
            remote_bluetooth_mac_address: [0; 6],
        });
        // No connector registration for ZZZZ, so the connector itself fails
        // the connect attempt with EndpointUnknown.
        let status = handler.request_connection("ZZZZ", Bytes::new(), ConnectionOptions::default());
        assert_eq!(status, Status::EndpointUnknown);
    }

    struct TieBreakListener {
        initiated_incoming: Arc<AtomicUsize>,
        initiated_outgoing: Arc<AtomicUsize>,
        rejected: Arc<StdMutex<Vec<String>>>,
    }
    impl ConnectionListener for TieBreakListener {
        fn on_initiated(&self, _endpoint_id: &EndpointId, _token: &str, is_incoming: bool) {
            if is_incoming {
                self.initiated_incoming.fetch_add(1, Ordering::SeqCst);
            } else {
                self.initiated_outgoing.fetch_add(1, Ordering::SeqCst);
            }
        }
        fn on_accepted(&self, _endpoint_id: &EndpointId) {}
        fn on_rejected(&self, endpoint_id: &EndpointId, _status: Status) {
            self.rejected.lock().unwrap().push(endpoint_id.as_str().to_string());
        }
        fn on_disconnected(&self, _endpoint_id: &EndpointId) {}
    }

    /// Drives two `BasePcpHandler`s through a genuine simultaneous mutual
    /// connection attempt (spec §4.3.6, §8). Nonces are pinned via
    /// `queue_nonce` so the higher-nonce side (`handler_h`) deterministically
    /// wins: its own outgoing attempt completes while it preemptively rejects
    /// the peer's incoming one; the lower-nonce side (`handler_p`) tears down
    /// its own outgoing attempt and instead completes the handshake as the
    /// incoming side.
    #[test]
    fn simultaneous_mutual_connect_resolves_via_tie_break() {
        let mut config = ControllerConfig::default();
        config.connection_request_read_timeout = Duration::from_millis(200);
        let config = Arc::new(config);

        let connector_h = InMemoryConnector::new();
        let channels_h = Arc::new(EndpointChannelManager::new());
        let endpoints_h = EndpointManager::new(config.clone(), channels_h.clone());
        let handler_h = BasePcpHandler::new(PcpVariant::Cluster, config.clone(), 1, channels_h, endpoints_h, connector_h.clone());

        let connector_p = InMemoryConnector::new();
        let channels_p = Arc::new(EndpointChannelManager::new());
        let endpoints_p = EndpointManager::new(config.clone(), channels_p.clone());
        let handler_p = BasePcpHandler::new(PcpVariant::Cluster, config, 2, channels_p, endpoints_p, connector_p.clone());

        let id_h = handler_h.local_endpoint_id().as_str().to_string();
        let id_p = handler_p.local_endpoint_id().as_str().to_string();

        // Two independent channel pairs: one per direction, exactly as two
        // real sockets opened by each side toward the other would look.
        let (h_out, p_in) = InMemoryChannel::pair(Medium::Bluetooth);
        connector_h.register(&id_p, h_out);
        let (p_out, h_in) = InMemoryChannel::pair(Medium::Bluetooth);
        connector_p.register(&id_h, p_out);

        handler_h.on_endpoint_found(DiscoveredEndpoint::Bluetooth {
            endpoint: Endpoint {
                endpoint_id: EndpointId::new(&id_p),
                endpoint_info: Bytes::new(),
                service_id: "svc".to_string(),
                medium: Medium::Bluetooth,
                webrtc_reachability: WebRtcReachability::Undefined,
            },
            remote_bluetooth_mac_address: [0; 6],
        });
        handler_p.on_endpoint_found(DiscoveredEndpoint::Bluetooth {
            endpoint: Endpoint {
                endpoint_id: EndpointId::new(&id_h),
                endpoint_info: Bytes::new(),
                service_id: "svc".to_string(),
                medium: Medium::Bluetooth,
                webrtc_reachability: WebRtcReachability::Undefined,
            },
            remote_bluetooth_mac_address: [0; 6],
        });

        let listener_h = Arc::new(TieBreakListener {
            initiated_incoming: Arc::new(AtomicUsize::new(0)),
            initiated_outgoing: Arc::new(AtomicUsize::new(0)),
            rejected: Arc::new(StdMutex::new(Vec::new())),
        });
        let listener_p = Arc::new(TieBreakListener {
            initiated_incoming: Arc::new(AtomicUsize::new(0)),
            initiated_outgoing: Arc::new(AtomicUsize::new(0)),
            rejected: Arc::new(StdMutex::new(Vec::new())),
        });
        handler_h.set_connection_listener(listener_h.clone());
        handler_p.set_connection_listener(listener_p.clone());

        // H's nonce beats P's, so H wins the race.
        handler_h.queue_nonce(100);
        handler_p.queue_nonce(10);

        let h_incoming = std::thread::spawn({
            let handler_h = handler_h.clone();
            move || handler_h.on_incoming_connection(h_in)
        });
        let p_incoming = std::thread::spawn({
            let handler_p = handler_p.clone();
            move || handler_p.on_incoming_connection(p_in)
        });
        let h_outgoing = std::thread::spawn({
            let handler_h = handler_h.clone();
            let id_p = id_p.clone();
            move || handler_h.request_connection(&id_p, Bytes::new(), ConnectionOptions::default())
        });
        let p_outgoing = std::thread::spawn({
            let handler_p = handler_p.clone();
            let id_h = id_h.clone();
            move || handler_p.request_connection(&id_h, Bytes::new(), ConnectionOptions::default())
        });

        assert_eq!(h_outgoing.join().unwrap(), Status::Success);
        assert_eq!(p_incoming.join().unwrap(), Status::Success);
        assert_eq!(h_incoming.join().unwrap(), Status::AlreadyConnected);
        assert_eq!(p_outgoing.join().unwrap(), Status::EndpointIoError);

        assert_eq!(listener_h.initiated_outgoing.load(Ordering::SeqCst), 1);
        assert_eq!(listener_h.initiated_incoming.load(Ordering::SeqCst), 0);
        assert!(listener_h.rejected.lock().unwrap().is_empty());

        assert_eq!(listener_p.initiated_incoming.load(Ordering::SeqCst), 1);
        assert_eq!(listener_p.initiated_outgoing.load(Ordering::SeqCst), 0);
        assert_eq!(listener_p.rejected.lock().unwrap().as_slice(), &[id_h]);
    }
}
