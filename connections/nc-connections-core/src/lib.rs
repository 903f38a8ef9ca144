//! Data model, error taxonomy, and configuration shared by the endpoint,
//! channel, PCP, BWU, payload and reconnect managers built on top of this
//! crate in `nc-connections-transport`.

pub mod client;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod payload;
pub mod status;

pub use config::ControllerConfig;
pub use connection::{
    Connection, ConnectionListener, ConnectionOptions, ConnectionStatus, DiscoveryListener, Direction,
    PayloadListener,
};
pub use endpoint::{DiscoveredEndpoint, DiscoveredEndpointBook, Endpoint, EndpointId, WebRtcReachability};
pub use error::{BwuError, ChannelError, FrameCodecError, HandshakeError, PayloadError};
pub use payload::{Payload, PayloadId, PayloadProgress, PayloadState};
pub use status::Status;

pub use nc_codec::frame::{Medium, OsInfo};
