//! `PayloadManager`: fragmentation, reassembly and flow control for payload
//! transfers (spec §4.7). Three dedicated writer threads (Bytes/Stream/File)
//! keep slow file I/O from blocking small messages; a fourth serial executor
//! delivers progress callbacks in order.

use crate::channel_manager::EndpointChannelManager;
use crate::endpoint_manager::{EndpointManager, FrameCategory, FrameProcessor};
use crate::executor::SerialExecutor;
use bytes::Bytes;
use nc_codec::frame::{
    OfflineFrame, PayloadBody as WireBody, PayloadChunk, PayloadControl, PayloadControlEvent,
    PayloadHeader, PayloadTransferFrame, PayloadType, PAYLOAD_CHUNK_FLAG_LAST,
};
use nc_connections_core::connection::PayloadListener;
use nc_connections_core::endpoint::EndpointId;
use nc_connections_core::payload::{Payload, PayloadBody as CorePayloadBody, PayloadId, PayloadProgress, PayloadState};
use nc_connections_core::{ControllerConfig, PayloadError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct IncomingPayload {
    header: PayloadHeader,
    buffer: Vec<u8>,
    next_offset: i64,
}

#[derive(Clone)]
struct PayloadDeps {
    config: Arc<ControllerConfig>,
    channels: Arc<EndpointChannelManager>,
    endpoints: Arc<EndpointManager>,
    progress_executor: Arc<SerialExecutor>,
    listeners: Arc<Mutex<HashMap<String, Arc<dyn PayloadListener>>>>,
    incoming: Arc<Mutex<HashMap<(String, i64), IncomingPayload>>>,
    outgoing: Arc<Mutex<HashMap<i64, Arc<AtomicBool>>>>,
}

pub struct PayloadManager {
    deps: PayloadDeps,
    writer_bytes: Arc<SerialExecutor>,
    writer_stream: Arc<SerialExecutor>,
    writer_file: Arc<SerialExecutor>,
}

impl PayloadManager {
    pub fn new(config: Arc<ControllerConfig>, channels: Arc<EndpointChannelManager>, endpoints: Arc<EndpointManager>) -> Arc<Self> {
        let deps = PayloadDeps {
            config,
            channels,
            endpoints: endpoints.clone(),
            progress_executor: Arc::new(SerialExecutor::new("payload-progress")),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            incoming: Arc::new(Mutex::new(HashMap::new())),
            outgoing: Arc::new(Mutex::new(HashMap::new())),
        };
        let manager = Arc::new(Self {
            deps,
            writer_bytes: Arc::new(SerialExecutor::new("payload-writer-bytes")),
            writer_stream: Arc::new(SerialExecutor::new("payload-writer-stream")),
            writer_file: Arc::new(SerialExecutor::new("payload-writer-file")),
        });
        endpoints.register_processor(FrameCategory::Payload, manager.clone());
        manager
    }

    pub fn set_payload_listener(&self, endpoint_id: &str, listener: Arc<dyn PayloadListener>) {
        self.deps.listeners.lock().insert(endpoint_id.to_string(), listener);
    }

    fn writer_for(&self, payload_type: PayloadType) -> &Arc<SerialExecutor> {
        match payload_type {
            PayloadType::Bytes => &self.writer_bytes,
            PayloadType::Stream => &self.writer_stream,
            PayloadType::File => &self.writer_file,
        }
    }

    /// `SendPayload` (spec §6.3): dispatched onto the writer thread matching
    /// the payload's type, fragmented and sent to every endpoint in
    /// `endpoint_ids` as chunks arrive off the source.
    pub fn send(&self, payload: Payload, endpoint_ids: Vec<String>) {
        let canceled = Arc::new(AtomicBool::new(false));
        self.deps.outgoing.lock().insert(payload.id.0, canceled.clone());
        let deps = self.deps.clone();
        self.writer_for(payload.r#type).submit(move || run_send(deps, payload, endpoint_ids, canceled));
    }

    /// `CancelPayload` (spec §4.7): the writer thread observes this on its
    /// next chunk boundary and emits `PAYLOAD_CANCELED` to every endpoint
    /// still holding the transfer.
    pub fn cancel(&self, payload_id: PayloadId) -> Result<(), PayloadError> {
        match self.deps.outgoing.lock().get(&payload_id.0) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
            None => Err(PayloadError::UnknownPayload),
        }
    }
}

fn read_chunk(source: &mut dyn Read, size: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        match source.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

fn control_frame(header: &PayloadHeader, event: PayloadControlEvent, offset: i64) -> OfflineFrame {
    OfflineFrame::PayloadTransfer(PayloadTransferFrame {
        header: header.clone(),
        body: WireBody::Control(PayloadControl { event, offset }),
    })
}

fn report(deps: &PayloadDeps, endpoint_id: &str, progress: PayloadProgress) {
    let listeners = deps.listeners.clone();
    let endpoint_id = endpoint_id.to_string();
    deps.progress_executor.submit(move || {
        if let Some(listener) = listeners.lock().get(&endpoint_id).cloned() {
            listener.on_payload_progress(&EndpointId::new(&endpoint_id), progress);
        }
    });
}

fn report_all(deps: &PayloadDeps, header: &PayloadHeader, status: PayloadState, bytes_transferred: i64, targets: &[String]) {
    for endpoint_id in targets {
        report(
            deps,
            endpoint_id,
            PayloadProgress {
                payload_id: PayloadId(header.id),
                status,
                bytes_transferred,
                total: header.total_size,
            },
        );
    }
}

/// Spec §4.7 step 1: `min(channel.max_transmit_packet_size, 32 KiB)` across
/// the target endpoint set; an endpoint with no registered channel yet just
/// doesn't constrain the chunk size.
fn chunk_size_for(deps: &PayloadDeps, endpoint_ids: &[String]) -> usize {
    const DEFAULT_MAX: usize = 32 * 1024;
    endpoint_ids
        .iter()
        .filter_map(|id| deps.channels.get(id))
        .map(|channel| channel.max_transmit_packet_size())
        .min()
        .unwrap_or(DEFAULT_MAX)
        .min(DEFAULT_MAX)
        .max(1)
}

fn run_send(deps: PayloadDeps, payload: Payload, endpoint_ids: Vec<String>, canceled: Arc<AtomicBool>) {
    let chunk_size = chunk_size_for(&deps, &endpoint_ids);
    let payload_id = payload.id;

    let (total, mut source): (Option<i64>, Box<dyn Read + Send>) = match payload.body {
        CorePayloadBody::Bytes(bytes) => {
            let len = bytes.len() as i64;
            (Some(len), Box::new(std::io::Cursor::new(bytes)))
        }
        CorePayloadBody::Stream(reader) => (None, reader),
        CorePayloadBody::File { path, total_size } => match std::fs::File::open(&path) {
            Ok(file) => (Some(total_size), Box::new(file)),
            Err(error) => {
                tracing::warn!(payload_id = payload_id.0, %error, "failed to open payload source file");
                let header = PayloadHeader {
                    id: payload_id.0,
                    r#type: payload.r#type,
                    total_size: -1,
                    parent_folder: None,
                    file_name: None,
                };
                report_all(&deps, &header, PayloadState::Failure, 0, &endpoint_ids);
                deps.outgoing.lock().remove(&payload_id.0);
                return;
            }
        },
    };

    let header = PayloadHeader {
        id: payload_id.0,
        r#type: payload.r#type,
        total_size: total.unwrap_or(-1),
        parent_folder: None,
        file_name: None,
    };

    let mut offset: i64 = 0;
    let mut current = match read_chunk(source.as_mut(), chunk_size) {
        Ok(chunk) => chunk,
        Err(error) => {
            tracing::warn!(payload_id = payload_id.0, %error, "payload source read failed");
            report_all(&deps, &header, PayloadState::Failure, 0, &endpoint_ids);
            deps.outgoing.lock().remove(&payload_id.0);
            return;
        }
    };

    loop {
        if canceled.load(Ordering::SeqCst) {
            deps.endpoints
                .send_to_many(&endpoint_ids, &control_frame(&header, PayloadControlEvent::Cancel, offset));
            report_all(&deps, &header, PayloadState::Canceled, offset, &endpoint_ids);
            deps.outgoing.lock().remove(&header.id);
            return;
        }

        let next = match read_chunk(source.as_mut(), chunk_size) {
            Ok(chunk) => chunk,
            Err(error) => {
                tracing::warn!(payload_id = payload_id.0, %error, "payload source read failed mid-transfer");
                report_all(&deps, &header, PayloadState::Failure, offset, &endpoint_ids);
                deps.outgoing.lock().remove(&header.id);
                return;
            }
        };
        let is_last = next.is_empty();
        let len = current.len() as i64;
        let flags = if is_last { PAYLOAD_CHUNK_FLAG_LAST } else { 0 };
        let frame = OfflineFrame::PayloadTransfer(PayloadTransferFrame {
            header: header.clone(),
            body: WireBody::Chunk(PayloadChunk {
                offset,
                flags,
                body: Bytes::from(current),
            }),
        });
        let failed = deps.endpoints.send_to_many(&endpoint_ids, &frame);
        offset += len;
        if !failed.is_empty() {
            tracing::debug!(payload_id = payload_id.0, ?failed, "payload chunk write failed for some endpoints");
        }
        let status = if is_last { PayloadState::Success } else { PayloadState::InProgress };
        report_all(&deps, &header, status, offset, &endpoint_ids);

        if is_last {
            deps.outgoing.lock().remove(&header.id);
            return;
        }
        current = next;
    }
}

fn finalize_incoming(deps: &PayloadDeps, endpoint_id: &str, incoming: IncomingPayload) {
    let payload = Payload {
        id: PayloadId(incoming.header.id),
        r#type: incoming.header.r#type,
        body: CorePayloadBody::Bytes(Bytes::from(incoming.buffer)),
    };
    // File payloads are additionally persisted under their declared name;
    // real path sandboxing/collision handling is a platform-integration
    // concern the in-memory transport doesn't need to solve.
    if incoming.header.r#type == PayloadType::File {
        if let Some(name) = &incoming.header.file_name {
            if let CorePayloadBody::Bytes(bytes) = &payload.body {
                if let Err(error) = std::fs::write(name, bytes) {
                    tracing::warn!(%error, file = name, "failed to persist received payload file");
                }
            }
        }
    }
    if let Some(listener) = deps.listeners.lock().get(endpoint_id).cloned() {
        listener.on_payload_received(&EndpointId::new(endpoint_id), payload);
    }
}

fn handle_transfer(deps: &PayloadDeps, endpoint_id: &str, frame: PayloadTransferFrame) {
    let key = (endpoint_id.to_string(), frame.header.id);
    match frame.body {
        WireBody::Chunk(chunk) => {
            let mut incoming = deps.incoming.lock();
            let entry = incoming.entry(key.clone()).or_insert_with(|| IncomingPayload {
                header: frame.header.clone(),
                buffer: Vec::new(),
                next_offset: 0,
            });
            if chunk.offset != entry.next_offset {
                tracing::warn!(endpoint_id, payload_id = frame.header.id, "out-of-order payload chunk, failing transfer");
                incoming.remove(&key);
                drop(incoming);
                report_all(deps, &frame.header, PayloadState::Failure, chunk.offset, std::slice::from_ref(&key.0));
                return;
            }
            entry.buffer.extend_from_slice(&chunk.body);
            entry.next_offset += chunk.body.len() as i64;
            let bytes_so_far = entry.next_offset;
            let is_last = chunk.is_last();
            if is_last {
                let finished = incoming.remove(&key).expect("entry was just inserted/updated above");
                drop(incoming);
                report_all(deps, &frame.header, PayloadState::Success, bytes_so_far, std::slice::from_ref(&key.0));
                finalize_incoming(deps, endpoint_id, finished);
            } else {
                drop(incoming);
                report_all(deps, &frame.header, PayloadState::InProgress, bytes_so_far, std::slice::from_ref(&key.0));
            }
        }
        WireBody::Control(control) => match control.event {
            PayloadControlEvent::Cancel => {
                deps.incoming.lock().remove(&key);
                if let Some(flag) = deps.outgoing.lock().get(&key.1) {
                    flag.store(true, Ordering::SeqCst);
                }
                report_all(deps, &frame.header, PayloadState::Canceled, control.offset, std::slice::from_ref(&key.0));
            }
            PayloadControlEvent::Error => {
                deps.incoming.lock().remove(&key);
                report_all(deps, &frame.header, PayloadState::Failure, control.offset, std::slice::from_ref(&key.0));
            }
            PayloadControlEvent::ReceivedAck => {
                // Bounds sender-side memory during long streaming transfers
                // in the original system; this transport keeps the whole
                // chunk history implicitly via the writer thread's
                // sequential read, so there is nothing to trim here.
            }
            PayloadControlEvent::Pause | PayloadControlEvent::Resume | PayloadControlEvent::Data => {
                tracing::debug!(endpoint_id, event = ?control.event, "unhandled payload control event");
            }
        },
    }
}

impl FrameProcessor for PayloadManager {
    fn process(&self, endpoint_id: &str, frame: OfflineFrame) {
        match frame {
            OfflineFrame::PayloadTransfer(transfer) => handle_transfer(&self.deps, endpoint_id, transfer),
            OfflineFrame::KeepAlive => {}
            other => tracing::warn!(endpoint_id, ?other, "unexpected frame in payload dispatch"),
        }
    }

    /// Endpoint disconnection fails every payload still being reassembled
    /// from that endpoint (spec §4.7). In-flight outgoing sends need no
    /// extra bookkeeping: `EndpointManager::send_to_many` already reports the
    /// endpoint as failed once its channel is gone.
    fn on_endpoint_disconnected(&self, endpoint_id: &str, _notify: bool) {
        let mut incoming = self.deps.incoming.lock();
        let stale: Vec<(String, i64)> = incoming.keys().filter(|(id, _)| id == endpoint_id).cloned().collect();
        for key in stale {
            if let Some(entry) = incoming.remove(&key) {
                let bytes_transferred = entry.next_offset;
                report_all(&self.deps, &entry.header, PayloadState::Failure, bytes_transferred, std::slice::from_ref(&key.0));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{EndpointChannel, InMemoryChannel};
    use nc_codec::frame::Medium;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct RecordingListener {
        received: Arc<StdMutex<Vec<Bytes>>>,
        progress_calls: Arc<AtomicUsize>,
    }
    impl PayloadListener for RecordingListener {
        fn on_payload_received(&self, _endpoint_id: &EndpointId, payload: Payload) {
            if let CorePayloadBody::Bytes(bytes) = payload.body {
                self.received.lock().unwrap().push(bytes);
            }
        }
        fn on_payload_progress(&self, _endpoint_id: &EndpointId, _progress: PayloadProgress) {
            self.progress_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup() -> (Arc<PayloadManager>, Arc<EndpointChannelManager>, Arc<EndpointManager>, Arc<PayloadManager>) {
        let config = Arc::new(ControllerConfig::default());
        let channels_a = Arc::new(EndpointChannelManager::new());
        let endpoints_a = EndpointManager::new(config.clone(), channels_a.clone());
        let payload_a = PayloadManager::new(config.clone(), channels_a.clone(), endpoints_a.clone());

        let channels_b = Arc::new(EndpointChannelManager::new());
        let endpoints_b = EndpointManager::new(config.clone(), channels_b.clone());
        let payload_b = PayloadManager::new(config, channels_b.clone(), endpoints_b.clone());

        let (a, b) = InMemoryChannel::pair(Medium::Bluetooth);
        let channel_a = Arc::new(EndpointChannel::new(a));
        channels_a.register("PEER", channel_a.clone());
        endpoints_a.start_endpoint("PEER".to_string(), channel_a);
        let channel_b = Arc::new(EndpointChannel::new(b));
        channels_b.register("LOCAL", channel_b.clone());
        endpoints_b.start_endpoint("LOCAL".to_string(), channel_b);

        (payload_a, channels_a, endpoints_a, payload_b)
    }

    #[test]
    fn small_bytes_payload_arrives_whole() {
        let (payload_a, _channels_a, _endpoints_a, payload_b) = setup();
        let received = Arc::new(StdMutex::new(Vec::new()));
        let progress_calls = Arc::new(AtomicUsize::new(0));
        payload_b.set_payload_listener(
            "LOCAL",
            Arc::new(RecordingListener { received: received.clone(), progress_calls: progress_calls.clone() }),
        );

        payload_a.send(Payload::bytes(PayloadId(1), Bytes::from_static(b"hello payload")), vec!["PEER".to_string()]);

        for _ in 0..300 {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(received.lock().unwrap().as_slice(), &[Bytes::from_static(b"hello payload")]);
        assert!(progress_calls.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn large_payload_is_chunked_and_reassembled() {
        let (payload_a, channels_a, _endpoints_a, payload_b) = setup();
        let received = Arc::new(StdMutex::new(Vec::new()));
        payload_b.set_payload_listener(
            "LOCAL",
            Arc::new(RecordingListener { received: received.clone(), progress_calls: Arc::new(AtomicUsize::new(0)) }),
        );

        let data = Bytes::from(vec![7u8; 80 * 1024]);
        let chunk_size = chunk_size_for(&payload_a.deps, &["PEER".to_string()]);
        assert!(chunk_size < data.len());
        let _ = channels_a;

        payload_a.send(Payload::bytes(PayloadId(2), data.clone()), vec!["PEER".to_string()]);

        for _ in 0..500 {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(received.lock().unwrap().as_slice(), &[data]);
    }

    #[test]
    fn cancel_stops_further_chunks() {
        let (payload_a, _channels_a, _endpoints_a, payload_b) = setup();
        let received = Arc::new(StdMutex::new(Vec::new()));
        payload_b.set_payload_listener(
            "LOCAL",
            Arc::new(RecordingListener { received: received.clone(), progress_calls: Arc::new(AtomicUsize::new(0)) }),
        );

        payload_a.send(Payload::bytes(PayloadId(3), Bytes::from(vec![1u8; 200 * 1024])), vec!["PEER".to_string()]);
        assert!(payload_a.cancel(PayloadId(3)).is_ok());

        std::thread::sleep(Duration::from_millis(200));
        assert!(received.lock().unwrap().is_empty());
        assert!(payload_a.deps.outgoing.lock().get(&3).is_none());
    }

    #[test]
    fn cancel_unknown_payload_id_reports_unknown() {
        let (payload_a, _channels_a, _endpoints_a, _payload_b) = setup();
        assert_eq!(payload_a.cancel(PayloadId(999)), Err(PayloadError::UnknownPayload));
    }
}
