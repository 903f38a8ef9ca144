//! Per-component error taxonomy (spec §4.12 / §7). Each enum models one
//! subsystem's failure modes; `From` impls collapse them into [`Status`] at
//! the controller boundary, splitting a wire-level error from a
//! connection-level disposition.

use crate::status::Status;
use nc_codec::DecoderError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ChannelError {
    #[error("channel reached end of stream")]
    EndOfStream,
    #[error("channel i/o error")]
    Io,
    #[error("channel read timed out")]
    Timeout,
    #[error("invalid payload on channel")]
    InvalidPayload,
    #[error("channel is closed")]
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum FrameCodecError {
    #[error(transparent)]
    Decode(#[from] DecoderError),
    #[error("unexpected frame variant for this context")]
    UnexpectedVariant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum HandshakeError {
    #[error("handshake i/o error")]
    Io,
    #[error("handshake step received out of order")]
    OutOfOrder,
    #[error("peer failed key confirmation")]
    KeyConfirmationFailed,
    #[error("handshake timed out")]
    Timeout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum BwuError {
    #[error("no eligible upgrade medium in the allowed set")]
    NoEligibleMedium,
    #[error("upgrade medium listener setup failed")]
    ListenerSetupFailed,
    #[error("client introduction frame not received in time")]
    IntroductionTimeout,
    #[error("remote reported upgrade failure")]
    RemoteUpgradeFailure,
    #[error("upgrade i/o error")]
    Io,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum PayloadError {
    #[error("payload id is not known to this endpoint")]
    UnknownPayload,
    #[error("payload chunks arrived out of order")]
    OutOfOrderChunk,
    #[error("payload sink/source i/o error")]
    Io,
    #[error("payload was canceled")]
    Canceled,
}

impl From<ChannelError> for Status {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::EndOfStream | ChannelError::Io | ChannelError::Closed => {
                Status::EndpointIoError
            }
            ChannelError::Timeout => Status::EndpointIoError,
            ChannelError::InvalidPayload => Status::EndpointIoError,
        }
    }
}

impl From<FrameCodecError> for Status {
    fn from(_err: FrameCodecError) -> Self {
        Status::EndpointIoError
    }
}

impl From<HandshakeError> for Status {
    fn from(_err: HandshakeError) -> Self {
        Status::AuthenticationError
    }
}

impl From<BwuError> for Status {
    fn from(_err: BwuError) -> Self {
        Status::Error
    }
}

impl From<PayloadError> for Status {
    fn from(err: PayloadError) -> Self {
        match err {
            PayloadError::UnknownPayload => Status::PayloadUnknown,
            PayloadError::OutOfOrderChunk | PayloadError::Io | PayloadError::Canceled => {
                Status::Error
            }
        }
    }
}
