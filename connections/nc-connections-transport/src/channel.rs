//! `EndpointChannel`: a reliable, frame-delimited byte transport, optionally
//! wrapped in an authenticated-encryption context (spec §4.1).

use bytes::Bytes;
use nc_codec::frame::Medium;
use nc_connections_core::error::ChannelError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a channel was closed; carried so the peer-facing disposition can
/// distinguish "the user hung up" from "we're upgrading" from "shutdown".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    Replaced,
    Upgraded,
    Shutdown,
    Local,
    Remote,
    Error,
    /// No frame observed within `keep_alive_timeout_millis` (spec §4.4,
    /// end-to-end scenario 5).
    KeepAliveTimeout,
}

/// The medium-specific transport a channel is built on: exactly one read
/// call returns exactly one length-delimited frame or an error.
pub trait RawChannel: Send + Sync {
    fn read_frame(&self) -> Result<Bytes, ChannelError>;
    /// Bounded read, used by the PCP/BWU/reconnect handshakes (spec §4.3.3,
    /// §4.6, §4.9). The default blocks forever, ignoring `timeout`; mediums
    /// backed by a socket with a real deadline override this.
    fn read_frame_timeout(&self, timeout: Duration) -> Result<Bytes, ChannelError> {
        let _ = timeout;
        self.read_frame()
    }
    fn write_frame(&self, bytes: &[u8]) -> Result<(), ChannelError>;
    fn medium(&self) -> Medium;
    /// Largest frame this medium can carry in one write (spec §4.7). The
    /// default is generous; real BLE/Bluetooth-Classic drivers override it
    /// with their MTU.
    fn max_transmit_packet_size(&self) -> usize {
        32 * 1024
    }
}

/// A symmetric AEAD context derived from a completed UKEY2-style handshake
/// (spec §4.1, §4.5). `seal`/`open` each take the monotonic per-direction
/// counter as an explicit nonce input; counters are never reused and reset
/// only by installing a new context via channel replacement.
pub trait EncryptionContext: Send + Sync {
    fn seal(&self, plaintext: &[u8], send_counter: u64) -> Result<Bytes, ChannelError>;
    fn open(&self, ciphertext: &[u8], recv_counter: u64) -> Result<Bytes, ChannelError>;
}

/// A reliable bidirectional byte transport, polymorphic over the medium
/// (spec §3 "Channel", §4.1).
pub struct EndpointChannel {
    raw: Arc<dyn RawChannel>,
    encryption: Mutex<Option<Arc<dyn EncryptionContext>>>,
    send_counter: AtomicU64,
    recv_counter: AtomicU64,
    paused: AtomicBool,
    closed_reason: Mutex<Option<DisconnectReason>>,
    last_read: Mutex<Option<Instant>>,
    last_write: Mutex<Option<Instant>>,
}

impl EndpointChannel {
    pub fn new(raw: Arc<dyn RawChannel>) -> Self {
        Self {
            raw,
            encryption: Mutex::new(None),
            send_counter: AtomicU64::new(0),
            recv_counter: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            closed_reason: Mutex::new(None),
            last_read: Mutex::new(None),
            last_write: Mutex::new(None),
        }
    }

    pub fn medium(&self) -> Medium {
        self.raw.medium()
    }

    pub fn max_transmit_packet_size(&self) -> usize {
        self.raw.max_transmit_packet_size()
    }

    pub fn set_encryption_context(&self, ctx: Arc<dyn EncryptionContext>) {
        *self.encryption.lock() = Some(ctx);
    }

    pub fn encryption_context(&self) -> Option<Arc<dyn EncryptionContext>> {
        self.encryption.lock().clone()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn last_read_time(&self) -> Option<Instant> {
        *self.last_read.lock()
    }

    pub fn last_write_time(&self) -> Option<Instant> {
        *self.last_write.lock()
    }

    pub fn close(&self, reason: DisconnectReason) {
        *self.closed_reason.lock() = Some(reason);
    }

    pub fn close_reason(&self) -> Option<DisconnectReason> {
        *self.closed_reason.lock()
    }

    /// Blocks until one frame is available. Reads are never serviced while
    /// paused; a closed channel always returns `EndOfStream` (spec §4.1).
    pub fn read(&self) -> Result<Bytes, ChannelError> {
        if self.closed_reason.lock().is_some() {
            return Err(ChannelError::EndOfStream);
        }
        if self.is_paused() {
            return Err(ChannelError::Timeout);
        }
        let bytes = self.raw.read_frame()?;
        *self.last_read.lock() = Some(Instant::now());
        let plaintext = match self.encryption_context() {
            Some(ctx) => {
                let counter = self.recv_counter.fetch_add(1, Ordering::SeqCst);
                ctx.open(&bytes, counter)?
            }
            None => bytes,
        };
        Ok(plaintext)
    }

    /// Bounded variant of [`EndpointChannel::read`], used wherever the spec
    /// names an explicit read deadline (connection request, BWU client
    /// introduction, reconnect).
    pub fn read_timeout(&self, timeout: Duration) -> Result<Bytes, ChannelError> {
        if self.closed_reason.lock().is_some() {
            return Err(ChannelError::EndOfStream);
        }
        if self.is_paused() {
            return Err(ChannelError::Timeout);
        }
        let bytes = self.raw.read_frame_timeout(timeout)?;
        *self.last_read.lock() = Some(Instant::now());
        let plaintext = match self.encryption_context() {
            Some(ctx) => {
                let counter = self.recv_counter.fetch_add(1, Ordering::SeqCst);
                ctx.open(&bytes, counter)?
            }
            None => bytes,
        };
        Ok(plaintext)
    }

    /// Writes are accepted even while paused (spec §4.1: "the write path
    /// remains open"), used by BWU to drain final messages on the old
    /// channel.
    pub fn write(&self, frame: &[u8]) -> Result<(), ChannelError> {
        if self.closed_reason.lock().is_some() {
            return Err(ChannelError::Closed);
        }
        let out = match self.encryption_context() {
            Some(ctx) => {
                let counter = self.send_counter.fetch_add(1, Ordering::SeqCst);
                ctx.seal(frame, counter)?
            }
            None => Bytes::copy_from_slice(frame),
        };
        self.raw.write_frame(&out)?;
        *self.last_write.lock() = Some(Instant::now());
        Ok(())
    }
}

/// An in-memory duplex pair standing in for a socket (spec §4.14), used
/// across the transport/facade test suites.
pub struct InMemoryChannel {
    medium: Medium,
    outbound: crossbeam_channel::Sender<Bytes>,
    inbound: crossbeam_channel::Receiver<Bytes>,
}

impl InMemoryChannel {
    /// Builds a connected pair: writes on one side arrive as reads on the
    /// other.
    pub fn pair(medium: Medium) -> (Arc<Self>, Arc<Self>) {
        let (tx_a, rx_a) = crossbeam_channel::unbounded();
        let (tx_b, rx_b) = crossbeam_channel::unbounded();
        (
            Arc::new(Self {
                medium,
                outbound: tx_a,
                inbound: rx_b,
            }),
            Arc::new(Self {
                medium,
                outbound: tx_b,
                inbound: rx_a,
            }),
        )
    }
}

impl RawChannel for InMemoryChannel {
    fn read_frame(&self) -> Result<Bytes, ChannelError> {
        self.inbound.recv().map_err(|_| ChannelError::EndOfStream)
    }

    fn read_frame_timeout(&self, timeout: Duration) -> Result<Bytes, ChannelError> {
        match self.inbound.recv_timeout(timeout) {
            Ok(bytes) => Ok(bytes),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(ChannelError::Timeout),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(ChannelError::EndOfStream),
        }
    }

    fn write_frame(&self, bytes: &[u8]) -> Result<(), ChannelError> {
        self.outbound
            .send(Bytes::copy_from_slice(bytes))
            .map_err(|_| ChannelError::Io)
    }

    fn medium(&self) -> Medium {
        self.medium
    }
}
