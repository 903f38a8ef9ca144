/// The synchronous, policy-facing result of a controller operation (spec
/// §6.3). Subsystem errors (`ChannelError`, `HandshakeError`, ...) convert
/// into this at the controller boundary; see [`crate::error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Status {
    Success,
    Error,
    OutOfOrderApiCall,
    AlreadyAdvertising,
    AlreadyDiscovering,
    EndpointIoError,
    EndpointUnknown,
    ConnectionRejected,
    AlreadyConnected,
    NotConnected,
    AuthenticationError,
    BluetoothError,
    BleError,
    WifiLanError,
    PayloadUnknown,
}

impl Status {
    pub fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}
