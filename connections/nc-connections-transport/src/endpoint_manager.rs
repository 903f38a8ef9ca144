//! `EndpointManager`: per-endpoint reader/keep-alive threads plus frame-type
//! dispatch to the registered managers (spec §4.4).

use crate::channel::{DisconnectReason, EndpointChannel};
use crate::channel_manager::EndpointChannelManager;
use nc_codec::frame::OfflineFrame;
use nc_connections_core::error::ChannelError;
use nc_connections_core::ControllerConfig;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// The frame-type groups `EndpointManager` dispatches on (spec §4.4): PCP
/// handles connection control frames directly, the other three correspond
/// one-to-one with a manager crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameCategory {
    ConnectionControl,
    BandwidthUpgrade,
    Payload,
    Reconnect,
}

fn category_of(frame: &OfflineFrame) -> FrameCategory {
    match frame {
        OfflineFrame::ConnectionRequest(_)
        | OfflineFrame::ConnectionResponse(_)
        | OfflineFrame::Disconnection(_) => FrameCategory::ConnectionControl,
        OfflineFrame::PayloadTransfer(_) | OfflineFrame::KeepAlive => FrameCategory::Payload,
        OfflineFrame::BandwidthUpgradeNegotiation(_) => FrameCategory::BandwidthUpgrade,
        OfflineFrame::AutoReconnect(_) => FrameCategory::Reconnect,
    }
}

/// Registered once per `FrameCategory`; receives every decoded frame routed
/// to that category plus the disconnection notification (spec §4.4).
pub trait FrameProcessor: Send + Sync {
    fn process(&self, endpoint_id: &str, frame: OfflineFrame);
    fn on_endpoint_disconnected(&self, endpoint_id: &str, notify: bool);
}

struct StopSignal {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            stopped: Mutex::new(false),
            condvar: Condvar::new(),
        })
    }

    fn raise(&self) {
        *self.stopped.lock() = true;
        self.condvar.notify_all();
    }

    fn is_raised(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleeps up to `timeout` but wakes immediately if raised.
    fn wait_timeout(&self, timeout: Duration) {
        let mut guard = self.stopped.lock();
        if !*guard {
            self.condvar.wait_for(&mut guard, timeout);
        }
    }
}

struct EndpointWorkers {
    stop: Arc<StopSignal>,
    reader: Option<JoinHandle<()>>,
    keep_alive: Option<JoinHandle<()>>,
}

pub struct EndpointManager {
    config: Arc<ControllerConfig>,
    channels: Arc<EndpointChannelManager>,
    processors: Mutex<HashMap<FrameCategory, Arc<dyn FrameProcessor>>>,
    workers: Mutex<HashMap<String, EndpointWorkers>>,
    shutting_down: AtomicBool,
}

impl EndpointManager {
    pub fn new(config: Arc<ControllerConfig>, channels: Arc<EndpointChannelManager>) -> Arc<Self> {
        Arc::new(Self {
            config,
            channels,
            processors: Mutex::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn register_processor(&self, category: FrameCategory, processor: Arc<dyn FrameProcessor>) {
        self.processors.lock().insert(category, processor);
    }

    /// Starts the reader and keep-alive threads for a freshly registered
    /// endpoint (spec §4.4). `channel` must already be installed in the
    /// `EndpointChannelManager` under `endpoint_id`.
    pub fn start_endpoint(self: &Arc<Self>, endpoint_id: String, channel: Arc<EndpointChannel>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let stop = StopSignal::new();

        let reader = {
            let manager = self.clone();
            let channel = channel.clone();
            let endpoint_id = endpoint_id.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name(format!("endpoint-reader-{endpoint_id}"))
                .spawn(move || manager.run_reader(endpoint_id, channel, stop))
                .expect("failed to spawn endpoint reader thread")
        };

        let keep_alive = {
            let manager = self.clone();
            let channel = channel.clone();
            let endpoint_id = endpoint_id.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name(format!("endpoint-keepalive-{endpoint_id}"))
                .spawn(move || manager.run_keep_alive(endpoint_id, channel, stop))
                .expect("failed to spawn endpoint keep-alive thread")
        };

        self.workers.lock().insert(
            endpoint_id,
            EndpointWorkers {
                stop,
                reader: Some(reader),
                keep_alive: Some(keep_alive),
            },
        );
    }

    fn run_reader(self: Arc<Self>, endpoint_id: String, channel: Arc<EndpointChannel>, stop: Arc<StopSignal>) {
        loop {
            if stop.is_raised() {
                return;
            }
            match channel.read() {
                Ok(bytes) => match OfflineFrame::decode(&bytes) {
                    Ok(frame) => {
                        let category = category_of(&frame);
                        tracing::debug!(endpoint_id = %endpoint_id, ?category, "dispatching frame");
                        if let Some(processor) = self.processors.lock().get(&category).cloned() {
                            processor.process(&endpoint_id, frame);
                        }
                    }
                    Err(error) => {
                        tracing::warn!(endpoint_id = %endpoint_id, %error, "invalid frame, tearing down endpoint");
                        break;
                    }
                },
                Err(ChannelError::Timeout) => {
                    // The channel is paused (BWU drains the old channel
                    // while the new one sits paused until safe-to-close),
                    // not closed; back off briefly and keep polling.
                    stop.wait_timeout(Duration::from_millis(20));
                }
                Err(_) => {
                    if !stop.is_raised() {
                        tracing::debug!(endpoint_id = %endpoint_id, "reader observed closed channel");
                    }
                    break;
                }
            }
        }
        self.remove_endpoint(&endpoint_id, true, DisconnectReason::Remote);
    }

    fn run_keep_alive(self: Arc<Self>, endpoint_id: String, channel: Arc<EndpointChannel>, stop: Arc<StopSignal>) {
        let tick = Duration::from_millis(250).min(self.config.keep_alive_interval);
        loop {
            stop.wait_timeout(tick);
            if stop.is_raised() {
                return;
            }
            let now = Instant::now();
            if let Some(last_read) = channel.last_read_time() {
                if now.duration_since(last_read) > self.config.keep_alive_timeout {
                    tracing::warn!(endpoint_id = %endpoint_id, "keep-alive timeout, tearing down endpoint");
                    self.remove_endpoint(&endpoint_id, true, DisconnectReason::KeepAliveTimeout);
                    return;
                }
            }
            let should_write = channel
                .last_write_time()
                .map(|last| now.duration_since(last) > self.config.keep_alive_interval)
                .unwrap_or(true);
            if should_write && channel.write(&OfflineFrame::KeepAlive.encode()).is_err() {
                self.remove_endpoint(&endpoint_id, true, DisconnectReason::Error);
                return;
            }
        }
    }

    /// Idempotent: only the first caller (reader or keep-alive thread, or an
    /// external disconnect request) performs the teardown. `reason` is
    /// carried through to `EndpointChannelManager::unregister` so the closed
    /// channel reports why (spec §4.4/§5).
    pub fn remove_endpoint(&self, endpoint_id: &str, notify: bool, reason: DisconnectReason) {
        let workers = self.workers.lock().remove(endpoint_id);
        let Some(workers) = workers else {
            return;
        };
        workers.stop.raise();
        for processor in self.processors.lock().values() {
            processor.on_endpoint_disconnected(endpoint_id, notify);
        }
        self.channels.unregister(endpoint_id, reason);
        if let Some(handle) = workers.reader {
            let _ = handle.join();
        }
        if let Some(handle) = workers.keep_alive {
            let _ = handle.join();
        }
    }

    /// Swaps in a freshly upgraded channel for an endpoint that is already
    /// registered (spec §4.6 BWU). The caller is responsible for having
    /// already moved the channel slot itself via `EndpointChannelManager`;
    /// this only restarts the reader/keep-alive threads. The old reader is
    /// raised-and-detached rather than joined: its blocking read only
    /// returns once the prior raw channel closes, which happens as the last
    /// step of the BWU handshake, so joining here could stall the upgrade
    /// on a slow-to-close old channel.
    pub fn restart_endpoint(self: &Arc<Self>, endpoint_id: &str, new_channel: Arc<EndpointChannel>) {
        if let Some(workers) = self.workers.lock().remove(endpoint_id) {
            workers.stop.raise();
            if let Some(handle) = workers.reader {
                std::thread::spawn(move || {
                    let _ = handle.join();
                });
            }
            if let Some(handle) = workers.keep_alive {
                std::thread::spawn(move || {
                    let _ = handle.join();
                });
            }
        }
        self.start_endpoint(endpoint_id.to_string(), new_channel);
    }

    pub fn send(&self, endpoint_id: &str, frame: &OfflineFrame) -> bool {
        match self.channels.get(endpoint_id) {
            Some(channel) => channel.write(&frame.encode()).is_ok(),
            None => false,
        }
    }

    /// Writes `frame` to every endpoint in `endpoint_ids`, returning the
    /// subset that failed (spec §4.4 `SendPayloadChunk`/`SendControlMessage`).
    pub fn send_to_many(&self, endpoint_ids: &[String], frame: &OfflineFrame) -> Vec<String> {
        let encoded = frame.encode();
        endpoint_ids
            .iter()
            .filter(|endpoint_id| match self.channels.get(endpoint_id) {
                Some(channel) => channel.write(&encoded).is_err(),
                None => true,
            })
            .cloned()
            .collect()
    }

    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let endpoint_ids: Vec<String> = self.workers.lock().keys().cloned().collect();
        for endpoint_id in endpoint_ids {
            self.remove_endpoint(&endpoint_id, false, DisconnectReason::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InMemoryChannel;
    use bytes::Bytes;
    use nc_codec::frame::{ConnectionRequestFrame, Medium, OsInfo};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    struct RecordingProcessor {
        received: Arc<StdMutex<Vec<String>>>,
        disconnects: Arc<AtomicUsize>,
    }

    impl FrameProcessor for RecordingProcessor {
        fn process(&self, endpoint_id: &str, _frame: OfflineFrame) {
            self.received.lock().unwrap().push(endpoint_id.to_string());
        }

        fn on_endpoint_disconnected(&self, _endpoint_id: &str, _notify: bool) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn request_frame() -> OfflineFrame {
        OfflineFrame::ConnectionRequest(ConnectionRequestFrame {
            endpoint_id: "ABCD".to_string(),
            endpoint_info: Bytes::new(),
            nonce: 1,
            supported_mediums: vec![Medium::Bluetooth],
            wifi: None,
            keep_alive_interval_millis: 5_000,
            keep_alive_timeout_millis: 30_000,
            os_info: OsInfo::Linux,
            safe_to_disconnect_version: 1,
            multiplex_socket_bitmask: 0,
        })
    }

    #[test]
    fn dispatches_connection_control_frames_to_registered_processor() {
        let config = Arc::new(ControllerConfig::default());
        let channels = Arc::new(EndpointChannelManager::new());
        let manager = EndpointManager::new(config, channels.clone());

        let received = Arc::new(StdMutex::new(Vec::new()));
        let disconnects = Arc::new(AtomicUsize::new(0));
        manager.register_processor(
            FrameCategory::ConnectionControl,
            Arc::new(RecordingProcessor {
                received: received.clone(),
                disconnects: disconnects.clone(),
            }),
        );

        let (a, b) = InMemoryChannel::pair(Medium::Bluetooth);
        let channel_a = Arc::new(EndpointChannel::new(a));
        channels.register("ABCD", channel_a.clone());
        manager.start_endpoint("ABCD".to_string(), channel_a);

        let channel_b = EndpointChannel::new(b);
        channel_b.write(&request_frame().encode()).unwrap();

        for _ in 0..200 {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(received.lock().unwrap().as_slice(), &["ABCD".to_string()]);

        drop(channel_b);
        for _ in 0..200 {
            if disconnects.load(Ordering::SeqCst) > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(disconnects.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn keep_alive_timeout_tears_down_silent_endpoint() {
        let mut config = ControllerConfig::default();
        config.keep_alive_timeout = Duration::from_millis(60);
        config.keep_alive_interval = Duration::from_millis(500);
        let config = Arc::new(config);
        let channels = Arc::new(EndpointChannelManager::new());
        let manager = EndpointManager::new(config, channels.clone());

        let disconnects = Arc::new(AtomicUsize::new(0));
        manager.register_processor(
            FrameCategory::ConnectionControl,
            Arc::new(RecordingProcessor {
                received: Arc::new(StdMutex::new(Vec::new())),
                disconnects: disconnects.clone(),
            }),
        );

        let (a, b) = InMemoryChannel::pair(Medium::Bluetooth);
        let channel_a = Arc::new(EndpointChannel::new(a));
        channels.register("ABCD", channel_a.clone());
        manager.start_endpoint("ABCD".to_string(), channel_a.clone());

        // One frame establishes `last_read_time`; the endpoint then goes
        // silent past `keep_alive_timeout` without the peer's channel ever
        // closing, so teardown can only come from the keep-alive thread.
        let channel_b = EndpointChannel::new(b);
        channel_b.write(&OfflineFrame::KeepAlive.encode()).unwrap();

        for _ in 0..300 {
            if disconnects.load(Ordering::SeqCst) > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(disconnects.load(Ordering::SeqCst) > 0);
        assert!(channels.get("ABCD").is_none());
        assert_eq!(channel_a.close_reason(), Some(DisconnectReason::KeepAliveTimeout));
        drop(channel_b);
    }

    #[test]
    fn shutdown_closes_every_channel_with_shutdown_reason() {
        let config = Arc::new(ControllerConfig::default());
        let channels = Arc::new(EndpointChannelManager::new());
        let manager = EndpointManager::new(config, channels.clone());

        let (a, _b) = InMemoryChannel::pair(Medium::Bluetooth);
        let channel_a = Arc::new(EndpointChannel::new(a));
        channels.register("ABCD", channel_a.clone());
        manager.start_endpoint("ABCD".to_string(), channel_a.clone());

        manager.shutdown();

        assert_eq!(channel_a.close_reason(), Some(DisconnectReason::Shutdown));
        assert!(channels.get("ABCD").is_none());
    }
}
