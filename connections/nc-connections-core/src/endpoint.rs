//! Endpoint identity and the discovered-endpoint book (spec §3).

use bytes::Bytes;
use nc_codec::frame::Medium;

/// WebRTC reachability hint carried alongside a discovered endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WebRtcReachability {
    Undefined,
    Connectable,
    Unconnectable,
}

impl Default for WebRtcReachability {
    fn default() -> Self {
        WebRtcReachability::Undefined
    }
}

/// A 4-character ASCII identifier, unique within one client's discovered
/// set (spec §3 "Endpoint").
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        debug_assert_eq!(id.len(), 4, "endpoint_id must be 4 ASCII characters");
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::borrow::Borrow<str> for EndpointId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// One discoverable peer, as known by a single client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub endpoint_id: EndpointId,
    pub endpoint_info: Bytes,
    pub service_id: String,
    pub medium: Medium,
    pub webrtc_reachability: WebRtcReachability,
}

/// A handle identifying the physical peer behind a discovered endpoint;
/// opaque beyond what each medium driver needs to reconnect to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscoveredEndpoint {
    Bluetooth {
        endpoint: Endpoint,
        remote_bluetooth_mac_address: [u8; 6],
    },
    Ble {
        endpoint: Endpoint,
        peripheral_handle: Bytes,
    },
    BleV2 {
        endpoint: Endpoint,
        peripheral_id: Bytes,
    },
    WifiLan {
        endpoint: Endpoint,
        service_name: String,
        ip_address: Bytes,
        port: u16,
    },
    WebRtc {
        endpoint: Endpoint,
        peer_id: String,
    },
}

impl DiscoveredEndpoint {
    pub fn endpoint(&self) -> &Endpoint {
        match self {
            DiscoveredEndpoint::Bluetooth { endpoint, .. }
            | DiscoveredEndpoint::Ble { endpoint, .. }
            | DiscoveredEndpoint::BleV2 { endpoint, .. }
            | DiscoveredEndpoint::WifiLan { endpoint, .. }
            | DiscoveredEndpoint::WebRtc { endpoint, .. } => endpoint,
        }
    }

    pub fn medium(&self) -> Medium {
        self.endpoint().medium
    }

    /// Relative preference used by `IsPreferred` (spec §4.3.2). Higher wins.
    /// The concrete ordering is PCP-specific; this is the shared fallback a
    /// PCP variant may override.
    pub fn default_medium_priority(medium: Medium) -> u8 {
        match medium {
            Medium::WifiLan => 5,
            Medium::WifiDirect => 4,
            Medium::WifiHotspot => 3,
            Medium::WebRtc => 2,
            Medium::Bluetooth => 1,
            Medium::Ble | Medium::BleV2 => 0,
            Medium::Unknown => 0,
        }
    }
}

/// `endpoint_id → sequence<DiscoveredEndpoint>`: one endpoint may be
/// reachable over several mediums at once.
#[derive(Clone, Debug, Default)]
pub struct DiscoveredEndpointBook {
    by_endpoint_id: std::collections::HashMap<String, Vec<DiscoveredEndpoint>>,
}

impl DiscoveredEndpointBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a freshly discovered endpoint, replacing any existing entry
    /// for the same `(endpoint_id, medium)` pair — the newer arrival always
    /// wins a same-medium tie (spec §4.3.2).
    pub fn insert(&mut self, discovered: DiscoveredEndpoint) {
        let id = discovered.endpoint().endpoint_id.as_str().to_string();
        let entries = self.by_endpoint_id.entry(id).or_default();
        entries.retain(|existing| existing.medium() != discovered.medium());
        entries.push(discovered);
    }

    pub fn remove_medium(&mut self, endpoint_id: &str, medium: Medium) {
        if let Some(entries) = self.by_endpoint_id.get_mut(endpoint_id) {
            entries.retain(|existing| existing.medium() != medium);
            if entries.is_empty() {
                self.by_endpoint_id.remove(endpoint_id);
            }
        }
    }

    pub fn remove_all(&mut self, endpoint_id: &str) -> Option<Vec<DiscoveredEndpoint>> {
        self.by_endpoint_id.remove(endpoint_id)
    }

    pub fn entries(&self, endpoint_id: &str) -> &[DiscoveredEndpoint] {
        self.by_endpoint_id
            .get(endpoint_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The best `DiscoveredEndpoint` for `endpoint_id` by medium priority,
    /// newest-arrival-wins on a tie (spec §4.3.2); `priority` is supplied by
    /// the PCP variant so Cluster/Star/PointToPoint can each rank mediums
    /// differently.
    pub fn best(
        &self,
        endpoint_id: &str,
        priority: impl Fn(Medium) -> u8,
    ) -> Option<&DiscoveredEndpoint> {
        self.by_endpoint_id
            .get(endpoint_id)?
            .iter()
            .rev()
            .max_by_key(|candidate| priority(candidate.medium()))
    }

    pub fn is_empty(&self) -> bool {
        self.by_endpoint_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(medium: Medium) -> Endpoint {
        Endpoint {
            endpoint_id: EndpointId::new("ABCD"),
            endpoint_info: Bytes::from_static(b"info"),
            service_id: "com.example.app".to_string(),
            medium,
            webrtc_reachability: WebRtcReachability::Undefined,
        }
    }

    #[test]
    fn best_prefers_higher_priority_medium() {
        let mut book = DiscoveredEndpointBook::new();
        book.insert(DiscoveredEndpoint::Bluetooth {
            endpoint: endpoint(Medium::Bluetooth),
            remote_bluetooth_mac_address: [0; 6],
        });
        book.insert(DiscoveredEndpoint::WifiLan {
            endpoint: endpoint(Medium::WifiLan),
            service_name: "svc".to_string(),
            ip_address: Bytes::from_static(&[192, 168, 1, 2]),
            port: 9000,
        });
        let best = book
            .best("ABCD", DiscoveredEndpoint::default_medium_priority)
            .unwrap();
        assert_eq!(best.medium(), Medium::WifiLan);
    }

    #[test]
    fn insert_replaces_same_medium_entry() {
        let mut book = DiscoveredEndpointBook::new();
        book.insert(DiscoveredEndpoint::Bluetooth {
            endpoint: endpoint(Medium::Bluetooth),
            remote_bluetooth_mac_address: [1; 6],
        });
        book.insert(DiscoveredEndpoint::Bluetooth {
            endpoint: endpoint(Medium::Bluetooth),
            remote_bluetooth_mac_address: [2; 6],
        });
        assert_eq!(book.entries("ABCD").len(), 1);
    }
}
