//! Connection state machine data (spec §3 "Connection", §4.3.5).

use crate::endpoint::EndpointId;
use crate::status::Status;
use bitflags::bitflags;
use bytes::Bytes;
use nc_codec::frame::{Medium, OsInfo, WifiCapability};
use std::time::Instant;

bitflags! {
    /// The 5-bit connection status (spec §3). `CONNECTED` is not a stored
    /// bit; it is derived by [`ConnectionStatus::is_connected`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct ConnectionStatus: u8 {
        const PENDING          = 0b0000_0001;
        const LOCAL_ACCEPTED    = 0b0000_0010;
        const LOCAL_REJECTED    = 0b0000_0100;
        const REMOTE_ACCEPTED   = 0b0000_1000;
        const REMOTE_REJECTED   = 0b0001_0000;
    }
}

impl ConnectionStatus {
    pub fn pending() -> Self {
        ConnectionStatus::PENDING
    }

    pub fn is_connected(self) -> bool {
        self.contains(Self::LOCAL_ACCEPTED)
            && self.contains(Self::REMOTE_ACCEPTED)
            && !self.intersects(Self::LOCAL_REJECTED | Self::REMOTE_REJECTED)
    }

    pub fn is_rejected(self) -> bool {
        self.intersects(Self::LOCAL_REJECTED | Self::REMOTE_REJECTED)
    }

    pub fn accept_local(&mut self) {
        self.remove(Self::PENDING | Self::LOCAL_REJECTED);
        self.insert(Self::LOCAL_ACCEPTED);
    }

    pub fn reject_local(&mut self) {
        self.remove(Self::PENDING | Self::LOCAL_ACCEPTED);
        self.insert(Self::LOCAL_REJECTED);
    }

    pub fn accept_remote(&mut self) {
        self.remove(Self::REMOTE_REJECTED);
        self.insert(Self::REMOTE_ACCEPTED);
    }

    pub fn reject_remote(&mut self) {
        self.remove(Self::REMOTE_ACCEPTED);
        self.insert(Self::REMOTE_REJECTED);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Negotiated per-connection parameters (spec §3 "Connection").
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionOptions {
    pub keep_alive_interval_millis: u32,
    pub keep_alive_timeout_millis: u32,
    pub allowed_mediums: Vec<Medium>,
    pub wifi_capability: Option<WifiCapability>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            keep_alive_interval_millis: 5_000,
            keep_alive_timeout_millis: 30_000,
            allowed_mediums: Vec::new(),
            wifi_capability: None,
        }
    }
}

/// The remote's negotiated capability bits, exchanged inside
/// `ConnectionResponseFrame` (spec §4.8).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RemoteCapabilities {
    pub os_info: Option<OsInfo>,
    pub safe_to_disconnect_version: u32,
    pub multiplex_socket_bitmask: u32,
}

impl RemoteCapabilities {
    pub fn supports_safe_to_disconnect(&self, local_minimum_version: u32) -> bool {
        self.safe_to_disconnect_version >= local_minimum_version
    }
}

/// A fully negotiated connection, promoted from a [`PendingConnection`] once
/// both sides accept (spec §4.3.5).
#[derive(Debug)]
pub struct Connection {
    pub endpoint_id: EndpointId,
    pub direction: Direction,
    pub status: ConnectionStatus,
    pub options: ConnectionOptions,
    pub connection_token: String,
    pub remote: RemoteCapabilities,
}

impl Connection {
    pub fn new(endpoint_id: EndpointId, direction: Direction, connection_token: String) -> Self {
        Self {
            endpoint_id,
            direction,
            status: ConnectionStatus::pending(),
            options: ConnectionOptions::default(),
            connection_token,
            remote: RemoteCapabilities::default(),
        }
    }
}

/// An in-flight, not-yet-`CONNECTED` endpoint (spec §3 "PendingConnection").
/// The raw and encrypted channel handles themselves live in
/// `nc-connections-transport`; this struct carries the handshake
/// bookkeeping that is medium- and transport-agnostic.
#[derive(Debug)]
pub struct PendingConnection {
    pub endpoint_id: EndpointId,
    pub direction: Direction,
    pub nonce: u32,
    pub started_at: Instant,
    pub advertised_mediums: Vec<Medium>,
}

impl PendingConnection {
    pub fn new(endpoint_id: EndpointId, direction: Direction, nonce: u32) -> Self {
        Self {
            endpoint_id,
            direction,
            nonce,
            started_at: Instant::now(),
            advertised_mediums: Vec::new(),
        }
    }

    /// Tie-break per spec §4.3.4: when both sides simultaneously open a
    /// connection, the side with the numerically larger nonce wins and
    /// continues as the incoming side; the loser closes its channel.
    pub fn wins_tie_break(local_nonce: u32, remote_nonce: u32) -> bool {
        local_nonce > remote_nonce
    }
}

/// Callback surface a client registers for a single connection attempt
/// (spec §3 "Connection").
pub trait ConnectionListener: Send + Sync {
    fn on_initiated(&self, endpoint_id: &EndpointId, authentication_token: &str, is_incoming: bool);
    fn on_accepted(&self, endpoint_id: &EndpointId);
    fn on_rejected(&self, endpoint_id: &EndpointId, status: Status);
    fn on_disconnected(&self, endpoint_id: &EndpointId);
    fn on_bandwidth_changed(&self, _endpoint_id: &EndpointId, _medium: Medium) {}
}

/// Callback surface for payload traffic, attached only after local accept
/// (spec §3 "Connection").
pub trait PayloadListener: Send + Sync {
    fn on_payload_received(&self, endpoint_id: &EndpointId, payload: crate::payload::Payload);
    fn on_payload_progress(&self, endpoint_id: &EndpointId, progress: crate::payload::PayloadProgress);
}

/// Callback surface for `StartDiscovery` (spec §6.3
/// `listener{endpoint_found_cb, endpoint_lost_cb, endpoint_distance_changed_cb}`).
pub trait DiscoveryListener: Send + Sync {
    fn on_endpoint_found(&self, endpoint_id: &EndpointId, endpoint_info: &Bytes, service_id: &str);
    fn on_endpoint_lost(&self, endpoint_id: &EndpointId);
    fn on_endpoint_distance_changed(&self, _endpoint_id: &EndpointId) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_requires_both_accepts_and_no_rejects() {
        let mut status = ConnectionStatus::pending();
        assert!(!status.is_connected());
        status.accept_local();
        assert!(!status.is_connected());
        status.accept_remote();
        assert!(status.is_connected());
    }

    #[test]
    fn local_reject_clears_connected() {
        let mut status = ConnectionStatus::pending();
        status.accept_local();
        status.accept_remote();
        assert!(status.is_connected());
        status.reject_remote();
        assert!(!status.is_connected());
        assert!(status.is_rejected());
    }

    #[test]
    fn tie_break_favors_larger_nonce() {
        assert!(PendingConnection::wins_tie_break(10, 3));
        assert!(!PendingConnection::wins_tie_break(3, 10));
    }
}
