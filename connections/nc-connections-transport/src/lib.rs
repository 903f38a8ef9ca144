//! Transport-facing managers layered on top of `nc-connections-core`'s data
//! model: framed/encrypted channels, the endpoint reader/keep-alive threads,
//! the PCP handshake state machine and the bandwidth-upgrade protocol
//! (spec §4).

pub mod bwu;
pub mod channel;
pub mod channel_manager;
pub mod endpoint_manager;
pub mod executor;
pub mod handshake;
pub mod payload_manager;
pub mod pcp;
pub mod reconnect;

pub use bwu::{BwuHandler, BwuManager, InMemoryBwuHandler};
pub use channel::{DisconnectReason, EncryptionContext, EndpointChannel, InMemoryChannel, RawChannel};
pub use channel_manager::EndpointChannelManager;
pub use endpoint_manager::{EndpointManager, FrameCategory, FrameProcessor};
pub use executor::SerialExecutor;
pub use handshake::{run_handshake, EncryptionRunnerResult, HandshakeCipher, NullCipher, X25519Ukey2Cipher};
pub use payload_manager::PayloadManager;
pub use pcp::{AdvertisingMediumHandler, BasePcpHandler, InMemoryAdvertisingHandler, InMemoryConnector, MediumConnector, PcpVariant};
pub use reconnect::ReconnectManager;
