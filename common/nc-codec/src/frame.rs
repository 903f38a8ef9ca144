//! The `OfflineFrame` tagged union (spec §6.1). Every variant round-trips
//! through `encode`/`decode`; unknown `frame_type` tags are a hard parse
//! error (`DecoderError::UnknownFrameType`), matching the "unknown frame_type
//! terminates the reader with InvalidFrame" rule.

use crate::decoder::DecoderBuffer;
use crate::encoder::EncoderBuffer;
use crate::error::DecoderError;
use crate::VERSION_V1;
use bytes::Bytes;

/// One physical transport. Ordered here only for `Debug`/`Eq`; priority
/// between mediums is a BwuManager policy concern, not a codec concern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Medium {
    Unknown,
    Bluetooth,
    Ble,
    BleV2,
    WifiLan,
    WifiDirect,
    WifiHotspot,
    WebRtc,
}

impl Medium {
    fn tag(self) -> u8 {
        match self {
            Medium::Unknown => 0,
            Medium::Bluetooth => 1,
            Medium::Ble => 2,
            Medium::BleV2 => 3,
            Medium::WifiLan => 4,
            Medium::WifiDirect => 5,
            Medium::WifiHotspot => 6,
            Medium::WebRtc => 7,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, DecoderError> {
        Ok(match tag {
            0 => Medium::Unknown,
            1 => Medium::Bluetooth,
            2 => Medium::Ble,
            3 => Medium::BleV2,
            4 => Medium::WifiLan,
            5 => Medium::WifiDirect,
            6 => Medium::WifiHotspot,
            7 => Medium::WebRtc,
            other => {
                return Err(DecoderError::UnknownEnumValue {
                    field: "medium",
                    tag: other as u32,
                })
            }
        })
    }

    fn encode(self, out: &mut EncoderBuffer) {
        out.write_u8(self.tag());
    }

    fn decode(buffer: DecoderBuffer<'_>) -> Result<(Self, DecoderBuffer<'_>), DecoderError> {
        let (tag, rest) = buffer.decode_u8()?;
        Ok((Self::from_tag(tag)?, rest))
    }
}

/// Coarse platform hint carried for capability negotiation; the wire
/// encoding of `os_info` is left unspecified beyond "exchanged", so this is
/// a small closed enum rather than an open string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OsInfo {
    Unknown,
    Android,
    Ios,
    Windows,
    Linux,
    ChromeOs,
}

impl OsInfo {
    fn tag(self) -> u8 {
        match self {
            OsInfo::Unknown => 0,
            OsInfo::Android => 1,
            OsInfo::Ios => 2,
            OsInfo::Windows => 3,
            OsInfo::Linux => 4,
            OsInfo::ChromeOs => 5,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, DecoderError> {
        Ok(match tag {
            0 => OsInfo::Unknown,
            1 => OsInfo::Android,
            2 => OsInfo::Ios,
            3 => OsInfo::Windows,
            4 => OsInfo::Linux,
            5 => OsInfo::ChromeOs,
            other => {
                return Err(DecoderError::UnknownEnumValue {
                    field: "os_info",
                    tag: other as u32,
                })
            }
        })
    }

    fn encode(self, out: &mut EncoderBuffer) {
        out.write_u8(self.tag());
    }

    fn decode(buffer: DecoderBuffer<'_>) -> Result<(Self, DecoderBuffer<'_>), DecoderError> {
        let (tag, rest) = buffer.decode_u8()?;
        Ok((Self::from_tag(tag)?, rest))
    }
}

fn encode_medium_list(out: &mut EncoderBuffer, mediums: &[Medium]) {
    assert!(mediums.len() <= u8::MAX as usize);
    out.write_u8(mediums.len() as u8);
    for medium in mediums {
        medium.encode(out);
    }
}

fn decode_medium_list(
    mut buffer: DecoderBuffer<'_>,
) -> Result<(Vec<Medium>, DecoderBuffer<'_>), DecoderError> {
    let (count, rest) = buffer.decode_u8()?;
    buffer = rest;
    let mut mediums = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (medium, rest) = Medium::decode(buffer)?;
        mediums.push(medium);
        buffer = rest;
    }
    Ok((mediums, buffer))
}

/// IPv4 or IPv6 address, used in `WifiCapability`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IpAddress {
    V4([u8; 4]),
    V6([u8; 16]),
}

impl IpAddress {
    fn encode(&self, out: &mut EncoderBuffer) {
        match self {
            IpAddress::V4(bytes) => out.write_u8_len_bytes(bytes),
            IpAddress::V6(bytes) => out.write_u8_len_bytes(bytes),
        }
    }

    fn decode(buffer: DecoderBuffer<'_>) -> Result<(Self, DecoderBuffer<'_>), DecoderError> {
        let (slice, rest) = buffer.decode_u8_len_bytes()?;
        let value = match slice.len() {
            4 => IpAddress::V4(slice.try_into().unwrap()),
            16 => IpAddress::V6(slice.try_into().unwrap()),
            _ => {
                return Err(DecoderError::FieldTooLong {
                    field: "wifi.ip_address",
                    max: 16,
                })
            }
        };
        Ok((value, rest))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WifiCapability {
    pub supports_5ghz: bool,
    pub bssid: String,
    pub ap_frequency: i32,
    pub ip_address: Option<IpAddress>,
}

impl WifiCapability {
    fn encode(&self, out: &mut EncoderBuffer) {
        out.write_bool(self.supports_5ghz);
        out.write_u8_len_str(&self.bssid);
        out.write_u32(self.ap_frequency as u32);
        out.write_bool(self.ip_address.is_some());
        if let Some(addr) = &self.ip_address {
            addr.encode(out);
        }
    }

    fn decode(buffer: DecoderBuffer<'_>) -> Result<(Self, DecoderBuffer<'_>), DecoderError> {
        let (supports_5ghz, buffer) = buffer.decode_bool()?;
        let (bssid, buffer) = buffer.decode_u8_len_utf8("wifi.bssid")?;
        let (ap_frequency, buffer) = buffer.decode_u32()?;
        let (has_ip, buffer) = buffer.decode_bool()?;
        let (ip_address, buffer) = if has_ip {
            let (addr, rest) = IpAddress::decode(buffer)?;
            (Some(addr), rest)
        } else {
            (None, buffer)
        };
        Ok((
            Self {
                supports_5ghz,
                bssid: bssid.to_string(),
                ap_frequency: ap_frequency as i32,
                ip_address,
            },
            buffer,
        ))
    }
}

pub const MAX_ENDPOINT_INFO_LEN: usize = 131;
pub const MAX_FAST_ENDPOINT_INFO_LEN: usize = 17;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionRequestFrame {
    pub endpoint_id: String,
    pub endpoint_info: Bytes,
    pub nonce: u32,
    pub supported_mediums: Vec<Medium>,
    pub wifi: Option<WifiCapability>,
    pub keep_alive_interval_millis: u32,
    pub keep_alive_timeout_millis: u32,
    pub os_info: OsInfo,
    pub safe_to_disconnect_version: u32,
    pub multiplex_socket_bitmask: u32,
}

impl ConnectionRequestFrame {
    fn encode(&self, out: &mut EncoderBuffer) {
        out.write_u8_len_str(&self.endpoint_id);
        out.write_u8_len_bytes(&self.endpoint_info);
        out.write_u32(self.nonce);
        encode_medium_list(out, &self.supported_mediums);
        out.write_bool(self.wifi.is_some());
        if let Some(wifi) = &self.wifi {
            wifi.encode(out);
        }
        out.write_u32(self.keep_alive_interval_millis);
        out.write_u32(self.keep_alive_timeout_millis);
        self.os_info.encode(out);
        out.write_u32(self.safe_to_disconnect_version);
        out.write_u32(self.multiplex_socket_bitmask);
    }

    fn decode(buffer: DecoderBuffer<'_>) -> Result<(Self, DecoderBuffer<'_>), DecoderError> {
        let (endpoint_id, buffer) = buffer.decode_u8_len_utf8("endpoint_id")?;
        let (endpoint_info, buffer) = buffer.decode_u8_len_bytes()?;
        if endpoint_info.len() > MAX_ENDPOINT_INFO_LEN {
            return Err(DecoderError::FieldTooLong {
                field: "endpoint_info",
                max: MAX_ENDPOINT_INFO_LEN,
            });
        }
        let (nonce, buffer) = buffer.decode_u32()?;
        let (supported_mediums, buffer) = decode_medium_list(buffer)?;
        let (has_wifi, buffer) = buffer.decode_bool()?;
        let (wifi, buffer) = if has_wifi {
            let (wifi, rest) = WifiCapability::decode(buffer)?;
            (Some(wifi), rest)
        } else {
            (None, buffer)
        };
        let (keep_alive_interval_millis, buffer) = buffer.decode_u32()?;
        let (keep_alive_timeout_millis, buffer) = buffer.decode_u32()?;
        let (os_info, buffer) = OsInfo::decode(buffer)?;
        let (safe_to_disconnect_version, buffer) = buffer.decode_u32()?;
        let (multiplex_socket_bitmask, buffer) = buffer.decode_u32()?;
        // A request with no advertised mediums defaults to the medium it
        // arrived over; the codec can't know that medium, so it leaves the
        // list empty and defers the default to the PCP handler (spec §8
        // boundary behavior: "ConnectionRequest with missing mediums list
        // defaults to {advertising-medium}").
        Ok((
            Self {
                endpoint_id: endpoint_id.to_string(),
                endpoint_info: Bytes::copy_from_slice(endpoint_info),
                nonce,
                supported_mediums,
                wifi,
                keep_alive_interval_millis,
                keep_alive_timeout_millis,
                os_info,
                safe_to_disconnect_version,
                multiplex_socket_bitmask,
            },
            buffer,
        ))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionResponseStatus {
    Accept,
    Reject,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionResponseFrame {
    pub status: ConnectionResponseStatus,
    pub os_info: OsInfo,
    pub safe_to_disconnect_version: u32,
    pub multiplex_socket_bitmask: u32,
}

impl ConnectionResponseFrame {
    fn encode(&self, out: &mut EncoderBuffer) {
        out.write_u8(match self.status {
            ConnectionResponseStatus::Accept => 1,
            ConnectionResponseStatus::Reject => 0,
        });
        self.os_info.encode(out);
        out.write_u32(self.safe_to_disconnect_version);
        out.write_u32(self.multiplex_socket_bitmask);
    }

    fn decode(buffer: DecoderBuffer<'_>) -> Result<(Self, DecoderBuffer<'_>), DecoderError> {
        let (status_tag, buffer) = buffer.decode_u8()?;
        let status = match status_tag {
            1 => ConnectionResponseStatus::Accept,
            0 => ConnectionResponseStatus::Reject,
            other => {
                return Err(DecoderError::UnknownEnumValue {
                    field: "connection_response.status",
                    tag: other as u32,
                })
            }
        };
        let (os_info, buffer) = OsInfo::decode(buffer)?;
        let (safe_to_disconnect_version, buffer) = buffer.decode_u32()?;
        let (multiplex_socket_bitmask, buffer) = buffer.decode_u32()?;
        Ok((
            Self {
                status,
                os_info,
                safe_to_disconnect_version,
                multiplex_socket_bitmask,
            },
            buffer,
        ))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisconnectionFrame {
    pub request_safe_to_disconnect: bool,
    pub ack_safe_to_disconnect: bool,
}

impl DisconnectionFrame {
    fn encode(&self, out: &mut EncoderBuffer) {
        out.write_bool(self.request_safe_to_disconnect);
        out.write_bool(self.ack_safe_to_disconnect);
    }

    fn decode(buffer: DecoderBuffer<'_>) -> Result<(Self, DecoderBuffer<'_>), DecoderError> {
        let (request_safe_to_disconnect, buffer) = buffer.decode_bool()?;
        let (ack_safe_to_disconnect, buffer) = buffer.decode_bool()?;
        Ok((
            Self {
                request_safe_to_disconnect,
                ack_safe_to_disconnect,
            },
            buffer,
        ))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadType {
    Bytes,
    File,
    Stream,
}

impl PayloadType {
    fn tag(self) -> u8 {
        match self {
            PayloadType::Bytes => 1,
            PayloadType::File => 2,
            PayloadType::Stream => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, DecoderError> {
        Ok(match tag {
            1 => PayloadType::Bytes,
            2 => PayloadType::File,
            3 => PayloadType::Stream,
            other => {
                return Err(DecoderError::UnknownEnumValue {
                    field: "payload.type",
                    tag: other as u32,
                })
            }
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayloadHeader {
    pub id: i64,
    pub r#type: PayloadType,
    pub total_size: i64,
    pub parent_folder: Option<String>,
    pub file_name: Option<String>,
}

impl PayloadHeader {
    fn encode(&self, out: &mut EncoderBuffer) {
        out.write_i64(self.id);
        out.write_u8(self.r#type.tag());
        out.write_i64(self.total_size);
        out.write_bool(self.parent_folder.is_some());
        if let Some(folder) = &self.parent_folder {
            out.write_u16_len_str(folder);
        }
        out.write_bool(self.file_name.is_some());
        if let Some(name) = &self.file_name {
            out.write_u16_len_str(name);
        }
    }

    fn decode(buffer: DecoderBuffer<'_>) -> Result<(Self, DecoderBuffer<'_>), DecoderError> {
        let (id, buffer) = buffer.decode_i64()?;
        let (type_tag, buffer) = buffer.decode_u8()?;
        let r#type = PayloadType::from_tag(type_tag)?;
        let (total_size, buffer) = buffer.decode_i64()?;
        let (has_folder, buffer) = buffer.decode_bool()?;
        let (parent_folder, buffer) = if has_folder {
            let (s, rest) = buffer.decode_u16_len_utf8("payload.parent_folder")?;
            (Some(s.to_string()), rest)
        } else {
            (None, buffer)
        };
        let (has_name, buffer) = buffer.decode_bool()?;
        let (file_name, buffer) = if has_name {
            let (s, rest) = buffer.decode_u16_len_utf8("payload.file_name")?;
            (Some(s.to_string()), rest)
        } else {
            (None, buffer)
        };
        Ok((
            Self {
                id,
                r#type,
                total_size,
                parent_folder,
                file_name,
            },
            buffer,
        ))
    }
}

pub const PAYLOAD_CHUNK_FLAG_LAST: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayloadChunk {
    pub offset: i64,
    pub flags: u32,
    pub body: Bytes,
}

impl PayloadChunk {
    pub fn is_last(&self) -> bool {
        self.flags & PAYLOAD_CHUNK_FLAG_LAST != 0
    }

    fn encode(&self, out: &mut EncoderBuffer) {
        out.write_i64(self.offset);
        out.write_u32(self.flags);
        out.write_u32_len_bytes(&self.body);
    }

    fn decode(buffer: DecoderBuffer<'_>) -> Result<(Self, DecoderBuffer<'_>), DecoderError> {
        let (offset, buffer) = buffer.decode_i64()?;
        let (flags, buffer) = buffer.decode_u32()?;
        let (body, buffer) = buffer.decode_u32_len_bytes()?;
        Ok((
            Self {
                offset,
                flags,
                body: Bytes::copy_from_slice(body),
            },
            buffer,
        ))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadControlEvent {
    Data,
    Cancel,
    Pause,
    Resume,
    ReceivedAck,
    Error,
}

impl PayloadControlEvent {
    fn tag(self) -> u8 {
        match self {
            PayloadControlEvent::Data => 0,
            PayloadControlEvent::Cancel => 1,
            PayloadControlEvent::Pause => 2,
            PayloadControlEvent::Resume => 3,
            PayloadControlEvent::ReceivedAck => 4,
            PayloadControlEvent::Error => 5,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, DecoderError> {
        Ok(match tag {
            0 => PayloadControlEvent::Data,
            1 => PayloadControlEvent::Cancel,
            2 => PayloadControlEvent::Pause,
            3 => PayloadControlEvent::Resume,
            4 => PayloadControlEvent::ReceivedAck,
            5 => PayloadControlEvent::Error,
            other => {
                return Err(DecoderError::UnknownEnumValue {
                    field: "payload_control.event",
                    tag: other as u32,
                })
            }
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayloadControl {
    pub event: PayloadControlEvent,
    pub offset: i64,
}

impl PayloadControl {
    fn encode(&self, out: &mut EncoderBuffer) {
        out.write_u8(self.event.tag());
        out.write_i64(self.offset);
    }

    fn decode(buffer: DecoderBuffer<'_>) -> Result<(Self, DecoderBuffer<'_>), DecoderError> {
        let (tag, buffer) = buffer.decode_u8()?;
        let (offset, buffer) = buffer.decode_i64()?;
        Ok((
            Self {
                event: PayloadControlEvent::from_tag(tag)?,
                offset,
            },
            buffer,
        ))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PayloadBody {
    Chunk(PayloadChunk),
    Control(PayloadControl),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayloadTransferFrame {
    pub header: PayloadHeader,
    pub body: PayloadBody,
}

impl PayloadTransferFrame {
    fn encode(&self, out: &mut EncoderBuffer) {
        self.header.encode(out);
        match &self.body {
            PayloadBody::Chunk(chunk) => {
                out.write_u8(0);
                chunk.encode(out);
            }
            PayloadBody::Control(control) => {
                out.write_u8(1);
                control.encode(out);
            }
        }
    }

    fn decode(buffer: DecoderBuffer<'_>) -> Result<(Self, DecoderBuffer<'_>), DecoderError> {
        let (header, buffer) = PayloadHeader::decode(buffer)?;
        let (body_tag, buffer) = buffer.decode_u8()?;
        let (body, buffer) = match body_tag {
            0 => {
                let (chunk, rest) = PayloadChunk::decode(buffer)?;
                (PayloadBody::Chunk(chunk), rest)
            }
            1 => {
                let (control, rest) = PayloadControl::decode(buffer)?;
                (PayloadBody::Control(control), rest)
            }
            other => {
                return Err(DecoderError::UnknownEnumValue {
                    field: "payload_transfer.body",
                    tag: other as u32,
                })
            }
        };
        Ok((Self { header, body }, buffer))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BwuEvent {
    UpgradePathAvailable,
    ClientIntroduction,
    ClientIntroductionAck,
    LastWriteToPriorChannel,
    SafeToClosePriorChannel,
    UpgradeFailure,
}

impl BwuEvent {
    fn tag(self) -> u8 {
        match self {
            BwuEvent::UpgradePathAvailable => 1,
            BwuEvent::ClientIntroduction => 2,
            BwuEvent::ClientIntroductionAck => 3,
            BwuEvent::LastWriteToPriorChannel => 4,
            BwuEvent::SafeToClosePriorChannel => 5,
            BwuEvent::UpgradeFailure => 6,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, DecoderError> {
        Ok(match tag {
            1 => BwuEvent::UpgradePathAvailable,
            2 => BwuEvent::ClientIntroduction,
            3 => BwuEvent::ClientIntroductionAck,
            4 => BwuEvent::LastWriteToPriorChannel,
            5 => BwuEvent::SafeToClosePriorChannel,
            6 => BwuEvent::UpgradeFailure,
            other => {
                return Err(DecoderError::UnknownEnumValue {
                    field: "bwu.event",
                    tag: other as u32,
                })
            }
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpgradePathInfo {
    pub medium: Medium,
    /// Per-medium connection credentials (address:port, PSK, peer id, ...).
    /// The exact shape is a platform-driver concern; the core only needs to
    /// carry it opaquely between the two sides.
    pub credentials: Bytes,
    pub supports_disabling_encryption: bool,
}

impl UpgradePathInfo {
    fn encode(&self, out: &mut EncoderBuffer) {
        self.medium.encode(out);
        out.write_u16_len_bytes(&self.credentials);
        out.write_bool(self.supports_disabling_encryption);
    }

    fn decode(buffer: DecoderBuffer<'_>) -> Result<(Self, DecoderBuffer<'_>), DecoderError> {
        let (medium, buffer) = Medium::decode(buffer)?;
        let (credentials, buffer) = buffer.decode_u16_len_bytes()?;
        let (supports_disabling_encryption, buffer) = buffer.decode_bool()?;
        Ok((
            Self {
                medium,
                credentials: Bytes::copy_from_slice(credentials),
                supports_disabling_encryption,
            },
            buffer,
        ))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientIntroduction {
    pub endpoint_id: String,
    pub supports_disabling_encryption: bool,
    /// Asks the initiator to write `CLIENT_INTRODUCTION_ACK` back on the new
    /// channel before the responder proceeds (spec §4.6 step 4).
    pub wants_introduction_ack: bool,
}

impl ClientIntroduction {
    fn encode(&self, out: &mut EncoderBuffer) {
        out.write_u8_len_str(&self.endpoint_id);
        out.write_bool(self.supports_disabling_encryption);
        out.write_bool(self.wants_introduction_ack);
    }

    fn decode(buffer: DecoderBuffer<'_>) -> Result<(Self, DecoderBuffer<'_>), DecoderError> {
        let (endpoint_id, buffer) = buffer.decode_u8_len_utf8("bwu.client_introduction.endpoint_id")?;
        let (supports_disabling_encryption, buffer) = buffer.decode_bool()?;
        let (wants_introduction_ack, buffer) = buffer.decode_bool()?;
        Ok((
            Self {
                endpoint_id: endpoint_id.to_string(),
                supports_disabling_encryption,
                wants_introduction_ack,
            },
            buffer,
        ))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BandwidthUpgradeNegotiationFrame {
    pub event: BwuEvent,
    pub upgrade_path_info: Option<UpgradePathInfo>,
    pub client_introduction: Option<ClientIntroduction>,
}

impl BandwidthUpgradeNegotiationFrame {
    fn encode(&self, out: &mut EncoderBuffer) {
        out.write_u8(self.event.tag());
        out.write_bool(self.upgrade_path_info.is_some());
        if let Some(info) = &self.upgrade_path_info {
            info.encode(out);
        }
        out.write_bool(self.client_introduction.is_some());
        if let Some(intro) = &self.client_introduction {
            intro.encode(out);
        }
    }

    fn decode(buffer: DecoderBuffer<'_>) -> Result<(Self, DecoderBuffer<'_>), DecoderError> {
        let (tag, buffer) = buffer.decode_u8()?;
        let event = BwuEvent::from_tag(tag)?;
        let (has_path_info, buffer) = buffer.decode_bool()?;
        let (upgrade_path_info, buffer) = if has_path_info {
            let (info, rest) = UpgradePathInfo::decode(buffer)?;
            (Some(info), rest)
        } else {
            (None, buffer)
        };
        let (has_intro, buffer) = buffer.decode_bool()?;
        let (client_introduction, buffer) = if has_intro {
            let (intro, rest) = ClientIntroduction::decode(buffer)?;
            (Some(intro), rest)
        } else {
            (None, buffer)
        };
        Ok((
            Self {
                event,
                upgrade_path_info,
                client_introduction,
            },
            buffer,
        ))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectPhase {
    Intro,
    IntroAck,
    Disconnect,
}

impl ReconnectPhase {
    fn tag(self) -> u8 {
        match self {
            ReconnectPhase::Intro => 0,
            ReconnectPhase::IntroAck => 1,
            ReconnectPhase::Disconnect => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, DecoderError> {
        Ok(match tag {
            0 => ReconnectPhase::Intro,
            1 => ReconnectPhase::IntroAck,
            2 => ReconnectPhase::Disconnect,
            other => {
                return Err(DecoderError::UnknownEnumValue {
                    field: "auto_reconnect.phase",
                    tag: other as u32,
                })
            }
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AutoReconnectFrame {
    pub endpoint_id: String,
    pub phase: ReconnectPhase,
}

impl AutoReconnectFrame {
    fn encode(&self, out: &mut EncoderBuffer) {
        out.write_u8_len_str(&self.endpoint_id);
        out.write_u8(self.phase.tag());
    }

    fn decode(buffer: DecoderBuffer<'_>) -> Result<(Self, DecoderBuffer<'_>), DecoderError> {
        let (endpoint_id, buffer) = buffer.decode_u8_len_utf8("auto_reconnect.endpoint_id")?;
        let (tag, buffer) = buffer.decode_u8()?;
        Ok((
            Self {
                endpoint_id: endpoint_id.to_string(),
                phase: ReconnectPhase::from_tag(tag)?,
            },
            buffer,
        ))
    }
}

/// The v1 `OfflineFrame` sub-union, tagged by `frame_type` (spec §6.1).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OfflineFrame {
    ConnectionRequest(ConnectionRequestFrame),
    ConnectionResponse(ConnectionResponseFrame),
    Disconnection(DisconnectionFrame),
    PayloadTransfer(PayloadTransferFrame),
    KeepAlive,
    BandwidthUpgradeNegotiation(BandwidthUpgradeNegotiationFrame),
    AutoReconnect(AutoReconnectFrame),
}

impl OfflineFrame {
    fn tag(&self) -> u8 {
        match self {
            OfflineFrame::ConnectionRequest(_) => 1,
            OfflineFrame::ConnectionResponse(_) => 2,
            OfflineFrame::Disconnection(_) => 3,
            OfflineFrame::PayloadTransfer(_) => 4,
            OfflineFrame::KeepAlive => 5,
            OfflineFrame::BandwidthUpgradeNegotiation(_) => 6,
            OfflineFrame::AutoReconnect(_) => 7,
        }
    }

    /// Encodes the frame, including the leading version byte, but *not* the
    /// outer length prefix; `EndpointChannel::write` is responsible for that
    /// (spec §4.1).
    pub fn encode(&self) -> Bytes {
        let mut out = EncoderBuffer::with_capacity(64);
        out.write_u8(VERSION_V1);
        out.write_u8(self.tag());
        match self {
            OfflineFrame::ConnectionRequest(frame) => frame.encode(&mut out),
            OfflineFrame::ConnectionResponse(frame) => frame.encode(&mut out),
            OfflineFrame::Disconnection(frame) => frame.encode(&mut out),
            OfflineFrame::PayloadTransfer(frame) => frame.encode(&mut out),
            OfflineFrame::KeepAlive => {}
            OfflineFrame::BandwidthUpgradeNegotiation(frame) => frame.encode(&mut out),
            OfflineFrame::AutoReconnect(frame) => frame.encode(&mut out),
        }
        out.freeze()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecoderError> {
        let buffer = DecoderBuffer::new(bytes);
        let (version, buffer) = buffer.decode_u8()?;
        if version != VERSION_V1 {
            return Err(DecoderError::UnsupportedVersion(version));
        }
        let (tag, buffer) = buffer.decode_u8()?;
        let (frame, buffer) = match tag {
            1 => {
                let (f, rest) = ConnectionRequestFrame::decode(buffer)?;
                (OfflineFrame::ConnectionRequest(f), rest)
            }
            2 => {
                let (f, rest) = ConnectionResponseFrame::decode(buffer)?;
                (OfflineFrame::ConnectionResponse(f), rest)
            }
            3 => {
                let (f, rest) = DisconnectionFrame::decode(buffer)?;
                (OfflineFrame::Disconnection(f), rest)
            }
            4 => {
                let (f, rest) = PayloadTransferFrame::decode(buffer)?;
                (OfflineFrame::PayloadTransfer(f), rest)
            }
            5 => (OfflineFrame::KeepAlive, buffer),
            6 => {
                let (f, rest) = BandwidthUpgradeNegotiationFrame::decode(buffer)?;
                (OfflineFrame::BandwidthUpgradeNegotiation(f), rest)
            }
            7 => {
                let (f, rest) = AutoReconnectFrame::decode(buffer)?;
                (OfflineFrame::AutoReconnect(f), rest)
            }
            other => return Err(DecoderError::UnknownFrameType(other)),
        };
        buffer.ensure_empty()?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: OfflineFrame) {
        let encoded = frame.encode();
        let decoded = OfflineFrame::decode(&encoded).expect("decode");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn connection_request_roundtrips() {
        roundtrip(OfflineFrame::ConnectionRequest(ConnectionRequestFrame {
            endpoint_id: "ABCD".to_string(),
            endpoint_info: Bytes::from_static(b"endpoint_name"),
            nonce: 0xdead_beef,
            supported_mediums: vec![Medium::Bluetooth, Medium::WifiLan],
            wifi: Some(WifiCapability {
                supports_5ghz: true,
                bssid: "aa:bb:cc:dd:ee:ff".to_string(),
                ap_frequency: 5180,
                ip_address: Some(IpAddress::V4([192, 168, 1, 1])),
            }),
            keep_alive_interval_millis: 5000,
            keep_alive_timeout_millis: 30000,
            os_info: OsInfo::Linux,
            safe_to_disconnect_version: 1,
            multiplex_socket_bitmask: 0,
        }));
    }

    #[test]
    fn connection_response_roundtrips() {
        roundtrip(OfflineFrame::ConnectionResponse(ConnectionResponseFrame {
            status: ConnectionResponseStatus::Accept,
            os_info: OsInfo::Android,
            safe_to_disconnect_version: 2,
            multiplex_socket_bitmask: 0b101,
        }));
    }

    #[test]
    fn disconnection_roundtrips() {
        roundtrip(OfflineFrame::Disconnection(DisconnectionFrame {
            request_safe_to_disconnect: true,
            ack_safe_to_disconnect: false,
        }));
    }

    #[test]
    fn payload_chunk_roundtrips() {
        roundtrip(OfflineFrame::PayloadTransfer(PayloadTransferFrame {
            header: PayloadHeader {
                id: 42,
                r#type: PayloadType::Bytes,
                total_size: 5,
                parent_folder: None,
                file_name: None,
            },
            body: PayloadBody::Chunk(PayloadChunk {
                offset: 0,
                flags: PAYLOAD_CHUNK_FLAG_LAST,
                body: Bytes::from_static(b"hello"),
            }),
        }));
    }

    #[test]
    fn payload_control_roundtrips() {
        roundtrip(OfflineFrame::PayloadTransfer(PayloadTransferFrame {
            header: PayloadHeader {
                id: 42,
                r#type: PayloadType::File,
                total_size: 100,
                parent_folder: Some("downloads".to_string()),
                file_name: Some("photo.jpg".to_string()),
            },
            body: PayloadBody::Control(PayloadControl {
                event: PayloadControlEvent::Cancel,
                offset: 10,
            }),
        }));
    }

    #[test]
    fn keep_alive_roundtrips() {
        roundtrip(OfflineFrame::KeepAlive);
    }

    #[test]
    fn bwu_frame_roundtrips() {
        roundtrip(OfflineFrame::BandwidthUpgradeNegotiation(
            BandwidthUpgradeNegotiationFrame {
                event: BwuEvent::UpgradePathAvailable,
                upgrade_path_info: Some(UpgradePathInfo {
                    medium: Medium::WifiLan,
                    credentials: Bytes::from_static(b"10.0.0.5:1234"),
                    supports_disabling_encryption: false,
                }),
                client_introduction: None,
            },
        ));
        roundtrip(OfflineFrame::BandwidthUpgradeNegotiation(
            BandwidthUpgradeNegotiationFrame {
                event: BwuEvent::ClientIntroduction,
                upgrade_path_info: None,
                client_introduction: Some(ClientIntroduction {
                    endpoint_id: "WXYZ".to_string(),
                    supports_disabling_encryption: true,
                    wants_introduction_ack: true,
                }),
            },
        ));
    }

    #[test]
    fn auto_reconnect_roundtrips() {
        roundtrip(OfflineFrame::AutoReconnect(AutoReconnectFrame {
            endpoint_id: "ABCD".to_string(),
            phase: ReconnectPhase::IntroAck,
        }));
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let mut out = EncoderBuffer::new();
        out.write_u8(VERSION_V1);
        out.write_u8(99);
        let encoded = out.freeze();
        assert_eq!(
            OfflineFrame::decode(&encoded),
            Err(DecoderError::UnknownFrameType(99))
        );
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut out = EncoderBuffer::new();
        out.write_u8(2);
        out.write_u8(5);
        let encoded = out.freeze();
        assert_eq!(
            OfflineFrame::decode(&encoded),
            Err(DecoderError::UnsupportedVersion(2))
        );
    }

    #[test]
    fn endpoint_info_over_limit_is_rejected() {
        let frame = ConnectionRequestFrame {
            endpoint_id: "ABCD".to_string(),
            endpoint_info: Bytes::from(vec![0u8; MAX_ENDPOINT_INFO_LEN]),
            nonce: 1,
            supported_mediums: vec![],
            wifi: None,
            keep_alive_interval_millis: 5000,
            keep_alive_timeout_millis: 30000,
            os_info: OsInfo::Unknown,
            safe_to_disconnect_version: 0,
            multiplex_socket_bitmask: 0,
        };
        roundtrip(OfflineFrame::ConnectionRequest(frame));

        // A length-131 endpoint_info parses; writing a 132-byte payload by
        // hand (bypassing the builder, the way a malicious/buggy peer
        // would) is rejected at decode.
        let mut out = EncoderBuffer::new();
        out.write_u8(VERSION_V1);
        out.write_u8(1);
        out.write_u8_len_str("ABCD");
        out.write_u8_len_bytes(&vec![0u8; MAX_ENDPOINT_INFO_LEN + 1]);
        out.write_u32(1);
        out.write_u8(0); // no mediums
        out.write_bool(false); // no wifi
        out.write_u32(5000);
        out.write_u32(30000);
        out.write_u8(OsInfo::Unknown.tag());
        out.write_u32(0);
        out.write_u32(0);
        let encoded = out.freeze();
        assert_eq!(
            OfflineFrame::decode(&encoded),
            Err(DecoderError::FieldTooLong {
                field: "endpoint_info",
                max: MAX_ENDPOINT_INFO_LEN
            })
        );
    }
}
