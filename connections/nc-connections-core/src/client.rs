//! Per-client session state (spec §3 "Client session (ClientProxy)", §4.8).
//! This module owns the *data*; the threads and serial executors that act
//! on it live in `nc-connections-transport::client_proxy`.

use crate::connection::Connection;
use crate::endpoint::EndpointId;
use bytes::Bytes;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const ENDPOINT_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const HELD_ENDPOINT_ID_DURATION: Duration = Duration::from_secs(30);

/// Generates a fresh 4-uppercase-ASCII-character endpoint id (spec §4.8).
pub fn generate_endpoint_id() -> EndpointId {
    let mut rng = rand::rng();
    let id: String = (0..4)
        .map(|_| ENDPOINT_ID_ALPHABET[rng.random_range(0..ENDPOINT_ID_ALPHABET.len())] as char)
        .collect();
    EndpointId::new(id)
}

/// Tracks whether the previous advertising session's endpoint id should be
/// reused instead of rotated, per the high-visibility / stable-endpoint-id
/// hold windows in spec §4.8.
#[derive(Debug, Default)]
pub struct EndpointIdHold {
    held_until: Option<Instant>,
}

impl EndpointIdHold {
    pub fn extend(&mut self) {
        self.held_until = Some(Instant::now() + HELD_ENDPOINT_ID_DURATION);
    }

    pub fn is_active(&self) -> bool {
        self.held_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }
}

/// A single endpoint's cancellation flag, raised by `CancelEndpoint` and
/// polled by long-running medium operations (spec §4.8).
#[derive(Debug, Default)]
pub struct CancellationFlag {
    raised: AtomicBool,
}

impl CancellationFlag {
    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Advertising,
    Discovering,
    ListeningForIncoming,
}

/// Process-wide state for one calling client (spec §3).
pub struct ClientProxy {
    pub client_id: u64,
    local_endpoint_id: EndpointId,
    pub local_endpoint_info: Bytes,
    endpoint_id_hold: EndpointIdHold,
    pub high_visibility_mode: bool,
    pub stable_endpoint_id_mode: bool,
    active_roles: Vec<Role>,
    connections: HashMap<String, Connection>,
    cancellation_flags: HashMap<String, Arc<CancellationFlag>>,
}

impl ClientProxy {
    pub fn new(client_id: u64) -> Self {
        Self {
            client_id,
            local_endpoint_id: generate_endpoint_id(),
            local_endpoint_info: Bytes::new(),
            endpoint_id_hold: EndpointIdHold::default(),
            high_visibility_mode: false,
            stable_endpoint_id_mode: false,
            active_roles: Vec::new(),
            connections: HashMap::new(),
            cancellation_flags: HashMap::new(),
        }
    }

    pub fn local_endpoint_id(&self) -> &EndpointId {
        &self.local_endpoint_id
    }

    /// Rotates the local endpoint id unless a hold window from
    /// high-visibility or stable-endpoint-id mode is still active (spec
    /// §4.8).
    pub fn start_advertising_session(&mut self) {
        if !self.endpoint_id_hold.is_active()
            && !self.high_visibility_mode
            && !self.stable_endpoint_id_mode
        {
            self.local_endpoint_id = generate_endpoint_id();
        }
        self.active_roles.retain(|r| *r != Role::Advertising);
        self.active_roles.push(Role::Advertising);
    }

    pub fn stop_advertising_session(&mut self) {
        if self.high_visibility_mode || self.stable_endpoint_id_mode {
            self.endpoint_id_hold.extend();
        }
        self.active_roles.retain(|r| *r != Role::Advertising);
    }

    pub fn is_role_active(&self, role: Role) -> bool {
        self.active_roles.contains(&role)
    }

    pub fn set_role_active(&mut self, role: Role, active: bool) {
        self.active_roles.retain(|r| *r != role);
        if active {
            self.active_roles.push(role);
        }
    }

    /// Invariant (spec §3): for any service_id, at most one of
    /// {advertising, listening-for-incoming} may be active per client.
    pub fn can_start(&self, role: Role) -> bool {
        match role {
            Role::Advertising => !self.is_role_active(Role::ListeningForIncoming),
            Role::ListeningForIncoming => !self.is_role_active(Role::Advertising),
            Role::Discovering => true,
        }
    }

    pub fn connection(&self, endpoint_id: &str) -> Option<&Connection> {
        self.connections.get(endpoint_id)
    }

    pub fn connection_mut(&mut self, endpoint_id: &str) -> Option<&mut Connection> {
        self.connections.get_mut(endpoint_id)
    }

    pub fn insert_connection(&mut self, connection: Connection) {
        self.connections
            .insert(connection.endpoint_id.as_str().to_string(), connection);
    }

    pub fn remove_connection(&mut self, endpoint_id: &str) -> Option<Connection> {
        self.connections.remove(endpoint_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn cancellation_flag(&mut self, endpoint_id: &str) -> Arc<CancellationFlag> {
        self.cancellation_flags
            .entry(endpoint_id.to_string())
            .or_insert_with(|| Arc::new(CancellationFlag::default()))
            .clone()
    }

    /// Raising cancellation is permanent for the current flag; a freshly
    /// issued endpoint_id installs a new one (spec §5 "Cancellation").
    pub fn cancel_endpoint(&mut self, endpoint_id: &str) {
        if let Some(flag) = self.cancellation_flags.get(endpoint_id) {
            flag.raise();
        }
    }

    pub fn reset_cancellation(&mut self, endpoint_id: &str) {
        self.cancellation_flags
            .insert(endpoint_id.to_string(), Arc::new(CancellationFlag::default()));
    }
}

/// The first 8 hex characters of a SHA-256 hash over the concatenation of
/// both nonces, big-endian (spec §4.8).
pub fn compute_connection_token(local_nonce: u32, remote_nonce: u32) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(local_nonce.to_be_bytes());
    hasher.update(remote_nonce.to_be_bytes());
    let digest = hasher.finalize();
    digest[..4].iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_endpoint_id_is_four_uppercase_ascii_chars() {
        let id = generate_endpoint_id();
        assert_eq!(id.as_str().len(), 4);
        assert!(id.as_str().chars().all(|c| c.is_ascii_uppercase()));
    }

    #[test]
    fn connection_token_is_eight_hex_chars_and_order_sensitive() {
        let token = compute_connection_token(1, 2);
        assert_eq!(token.len(), 8);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, compute_connection_token(2, 1));
    }

    #[test]
    fn advertising_and_listening_are_mutually_exclusive() {
        let mut client = ClientProxy::new(1);
        client.set_role_active(Role::Advertising, true);
        assert!(!client.can_start(Role::ListeningForIncoming));
        client.set_role_active(Role::Advertising, false);
        assert!(client.can_start(Role::ListeningForIncoming));
    }

    #[test]
    fn endpoint_id_rotates_unless_held() {
        let mut client = ClientProxy::new(1);
        let first = client.local_endpoint_id().clone();
        client.start_advertising_session();
        // Not guaranteed different (4-char alphabet collision is possible but
        // astronomically unlikely over a single rotation check); assert the
        // hold-mode path instead, which is deterministic.
        let _ = first;
        client.high_visibility_mode = true;
        client.stop_advertising_session();
        let held = client.local_endpoint_id().clone();
        client.start_advertising_session();
        assert_eq!(held, *client.local_endpoint_id());
    }
}
