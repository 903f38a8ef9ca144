//! Aggregates every tunable named in spec §5, with defaults matching the
//! constants given there (spec §4.13).

use nc_codec::frame::Medium;
use std::time::Duration;

/// Top-level tunables shared by every manager; constructed once by the
/// controller and handed by reference to each manager instead of each one
/// carrying its own config struct.
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// `kConnectionRequestReadTimeout` (spec §5): 2 s.
    pub connection_request_read_timeout: Duration,
    /// `kRejectedConnectionCloseDelay` (spec §5): 2 s.
    pub rejected_connection_close_delay: Duration,
    /// `kReadClientIntroductionFrameTimeout` (spec §4.6): 5 s.
    pub bwu_client_introduction_read_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub keep_alive_timeout: Duration,
    /// Endpoint disconnect barrier (spec §5): 2000 ms.
    pub endpoint_disconnect_barrier_timeout: Duration,
    pub bandwidth_upgrade_retry_delay: Duration,
    pub bandwidth_upgrade_retry_max_delay: Duration,
    /// `kReconnectTimeout` (spec §4.9): 5 s.
    pub reconnect_timeout: Duration,
    /// Highest-priority medium first; used both to order
    /// `supported_mediums` on outgoing `CONNECTION_REQUEST` frames and to
    /// pick the BWU upgrade target (spec §4.6).
    pub medium_priority_order: Vec<Medium>,
    /// Mediums BWU is permitted to upgrade to.
    pub allow_upgrade_to: Vec<Medium>,
    /// Minimum `safe_to_disconnect_version` required on both sides to
    /// enable safe-to-disconnect / auto-reconnect / payload-received-ack
    /// (spec §4.8).
    pub safe_to_disconnect_minimum_version: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            connection_request_read_timeout: Duration::from_secs(2),
            rejected_connection_close_delay: Duration::from_secs(2),
            bwu_client_introduction_read_timeout: Duration::from_secs(5),
            keep_alive_interval: Duration::from_millis(5_000),
            keep_alive_timeout: Duration::from_millis(30_000),
            endpoint_disconnect_barrier_timeout: Duration::from_millis(2_000),
            bandwidth_upgrade_retry_delay: Duration::from_secs(1),
            bandwidth_upgrade_retry_max_delay: Duration::from_secs(30),
            reconnect_timeout: Duration::from_secs(5),
            medium_priority_order: vec![
                Medium::WifiLan,
                Medium::WifiDirect,
                Medium::WifiHotspot,
                Medium::WebRtc,
                Medium::Bluetooth,
                Medium::Ble,
            ],
            allow_upgrade_to: vec![Medium::WifiLan, Medium::WifiDirect, Medium::WifiHotspot],
            safe_to_disconnect_minimum_version: 1,
        }
    }
}

impl ControllerConfig {
    pub fn medium_priority(&self, medium: Medium) -> usize {
        self.medium_priority_order
            .iter()
            .position(|m| *m == medium)
            .unwrap_or(self.medium_priority_order.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let config = ControllerConfig::default();
        assert_eq!(config.connection_request_read_timeout, Duration::from_secs(2));
        assert_eq!(config.keep_alive_interval, Duration::from_millis(5_000));
        assert_eq!(config.keep_alive_timeout, Duration::from_millis(30_000));
        assert_eq!(config.reconnect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn higher_priority_medium_sorts_first() {
        let config = ControllerConfig::default();
        assert!(config.medium_priority(Medium::WifiLan) < config.medium_priority(Medium::Bluetooth));
    }
}
