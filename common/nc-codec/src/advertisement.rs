//! Bit-exact medium advertisement payloads (spec §6.2 / §4.10): the BLE
//! normal/fast advertisement, the Bluetooth Classic device name payload, and
//! the Wi-Fi LAN mDNS TXT-record payload. These are the bytes a PCP handler
//! puts on the air for discovery, not frame-channel traffic.

use crate::error::DecoderError;
use crate::VERSION_V1;
use bytes::Bytes;
use std::collections::BTreeMap;

pub const MAX_ENDPOINT_INFO_LEN: usize = 131;
pub const MAX_FAST_ENDPOINT_INFO_LEN: usize = 17;
pub const MIN_DEVICE_NAME_LEN: usize = 16;

const EXTRA_BIT_WEBRTC_CONNECTABLE: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pcp {
    P2pCluster,
    P2pStar,
    P2pPointToPoint,
}

impl Pcp {
    fn tag(self) -> u8 {
        match self {
            Pcp::P2pCluster => 1,
            Pcp::P2pStar => 2,
            Pcp::P2pPointToPoint => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, DecoderError> {
        Ok(match tag {
            1 => Pcp::P2pCluster,
            2 => Pcp::P2pStar,
            3 => Pcp::P2pPointToPoint,
            other => {
                return Err(DecoderError::UnknownEnumValue {
                    field: "advertisement.pcp",
                    tag: other as u32,
                })
            }
        })
    }
}

fn pack_version_pcp(pcp: Pcp) -> u8 {
    (VERSION_V1 << 5) | (pcp.tag() & 0b0001_1111)
}

fn unpack_version_pcp(byte: u8) -> Result<Pcp, DecoderError> {
    let version = byte >> 5;
    if version != VERSION_V1 {
        return Err(DecoderError::UnsupportedVersion(version));
    }
    Pcp::from_tag(byte & 0b0001_1111)
}

fn webrtc_connectable_to_extra(webrtc_connectable: bool) -> u8 {
    if webrtc_connectable {
        EXTRA_BIT_WEBRTC_CONNECTABLE
    } else {
        0
    }
}

fn take(bytes: &[u8], count: usize) -> Result<(&[u8], &[u8]), DecoderError> {
    if bytes.len() < count {
        return Err(DecoderError::UnexpectedEof {
            wanted: count,
            available: bytes.len(),
        });
    }
    Ok(bytes.split_at(count))
}

fn take_array<const N: usize>(bytes: &[u8]) -> Result<([u8; N], &[u8]), DecoderError> {
    let (head, tail) = take(bytes, N)?;
    Ok((head.try_into().unwrap(), tail))
}

/// A normal (non-fast) BLE advertisement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BleAdvertisement {
    pub pcp: Pcp,
    pub service_id_hash: [u8; 3],
    pub endpoint_id: String,
    pub endpoint_info: Bytes,
    pub bluetooth_mac: [u8; 6],
    pub uwb_address: Bytes,
    pub webrtc_connectable: bool,
}

impl BleAdvertisement {
    pub fn encode(&self) -> Result<Bytes, DecoderError> {
        if self.endpoint_info.len() > MAX_ENDPOINT_INFO_LEN {
            return Err(DecoderError::FieldTooLong {
                field: "ble.endpoint_info",
                max: MAX_ENDPOINT_INFO_LEN,
            });
        }
        if self.endpoint_id.len() != 4 {
            return Err(DecoderError::FieldTooLong {
                field: "ble.endpoint_id",
                max: 4,
            });
        }
        if self.uwb_address.len() > u8::MAX as usize {
            return Err(DecoderError::FieldTooLong {
                field: "ble.uwb_address",
                max: u8::MAX as usize,
            });
        }
        let mut out = Vec::with_capacity(
            1 + 3 + 4 + 1 + self.endpoint_info.len() + 6 + 1 + self.uwb_address.len() + 1,
        );
        out.push(pack_version_pcp(self.pcp));
        out.extend_from_slice(&self.service_id_hash);
        out.extend_from_slice(self.endpoint_id.as_bytes());
        out.push(self.endpoint_info.len() as u8);
        out.extend_from_slice(&self.endpoint_info);
        out.extend_from_slice(&self.bluetooth_mac);
        out.push(self.uwb_address.len() as u8);
        out.extend_from_slice(&self.uwb_address);
        out.push(webrtc_connectable_to_extra(self.webrtc_connectable));
        Ok(out.into())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecoderError> {
        let (version_pcp, rest) = take(bytes, 1)?;
        let pcp = unpack_version_pcp(version_pcp[0])?;
        let (service_id_hash, rest) = take_array::<3>(rest)?;
        let (endpoint_id, rest) = take(rest, 4)?;
        let endpoint_id = std::str::from_utf8(endpoint_id)
            .map_err(|_| DecoderError::InvalidUtf8("ble.endpoint_id"))?
            .to_string();
        let (info_len, rest) = take(rest, 1)?;
        let info_len = info_len[0] as usize;
        if info_len > MAX_ENDPOINT_INFO_LEN {
            return Err(DecoderError::FieldTooLong {
                field: "ble.endpoint_info",
                max: MAX_ENDPOINT_INFO_LEN,
            });
        }
        let (endpoint_info, rest) = take(rest, info_len)?;
        let (bluetooth_mac, rest) = take_array::<6>(rest)?;
        let (uwb_len, rest) = take(rest, 1)?;
        let (uwb_address, rest) = take(rest, uwb_len[0] as usize)?;
        let (extra, rest) = take(rest, 1)?;
        rest_must_be_empty(rest, "ble")?;
        Ok(Self {
            pcp,
            service_id_hash,
            endpoint_id,
            endpoint_info: Bytes::copy_from_slice(endpoint_info),
            bluetooth_mac,
            uwb_address: Bytes::copy_from_slice(uwb_address),
            webrtc_connectable: extra[0] & EXTRA_BIT_WEBRTC_CONNECTABLE != 0,
        })
    }
}

/// A fast BLE advertisement: omits `service_id_hash` and `bluetooth_mac`,
/// and caps `endpoint_info` at 17 bytes (spec §6.2).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FastBleAdvertisement {
    pub pcp: Pcp,
    pub endpoint_id: String,
    pub endpoint_info: Bytes,
    pub uwb_address: Bytes,
    pub webrtc_connectable: bool,
}

impl FastBleAdvertisement {
    pub fn encode(&self) -> Result<Bytes, DecoderError> {
        if self.endpoint_info.len() > MAX_FAST_ENDPOINT_INFO_LEN {
            return Err(DecoderError::FieldTooLong {
                field: "fast_ble.endpoint_info",
                max: MAX_FAST_ENDPOINT_INFO_LEN,
            });
        }
        if self.endpoint_id.len() != 4 {
            return Err(DecoderError::FieldTooLong {
                field: "fast_ble.endpoint_id",
                max: 4,
            });
        }
        let mut out =
            Vec::with_capacity(1 + 4 + 1 + self.endpoint_info.len() + 1 + self.uwb_address.len() + 1);
        out.push(pack_version_pcp(self.pcp));
        out.extend_from_slice(self.endpoint_id.as_bytes());
        out.push(self.endpoint_info.len() as u8);
        out.extend_from_slice(&self.endpoint_info);
        out.push(self.uwb_address.len() as u8);
        out.extend_from_slice(&self.uwb_address);
        out.push(webrtc_connectable_to_extra(self.webrtc_connectable));
        Ok(out.into())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecoderError> {
        let (version_pcp, rest) = take(bytes, 1)?;
        let pcp = unpack_version_pcp(version_pcp[0])?;
        let (endpoint_id, rest) = take(rest, 4)?;
        let endpoint_id = std::str::from_utf8(endpoint_id)
            .map_err(|_| DecoderError::InvalidUtf8("fast_ble.endpoint_id"))?
            .to_string();
        let (info_len, rest) = take(rest, 1)?;
        let info_len = info_len[0] as usize;
        if info_len > MAX_FAST_ENDPOINT_INFO_LEN {
            return Err(DecoderError::FieldTooLong {
                field: "fast_ble.endpoint_info",
                max: MAX_FAST_ENDPOINT_INFO_LEN,
            });
        }
        let (endpoint_info, rest) = take(rest, info_len)?;
        let (uwb_len, rest) = take(rest, 1)?;
        let (uwb_address, rest) = take(rest, uwb_len[0] as usize)?;
        let (extra, rest) = take(rest, 1)?;
        rest_must_be_empty(rest, "fast_ble")?;
        Ok(Self {
            pcp,
            endpoint_id,
            endpoint_info: Bytes::copy_from_slice(endpoint_info),
            uwb_address: Bytes::copy_from_slice(uwb_address),
            webrtc_connectable: extra[0] & EXTRA_BIT_WEBRTC_CONNECTABLE != 0,
        })
    }
}

/// A Bluetooth Classic device-name advertisement. `[version|pcp][endpoint_id:4B]
/// [service_id_hash:3B][endpoint_info_size:1B][endpoint_info][uwb_address_size:1B]
/// [uwb_address][extra:1B]` followed by 6 reserved bytes (spec §6.2); minimum
/// total length 16.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BluetoothDeviceName {
    pub pcp: Pcp,
    pub endpoint_id: String,
    pub service_id_hash: [u8; 3],
    pub endpoint_info: Bytes,
    pub uwb_address: Bytes,
    pub webrtc_connectable: bool,
}

const DEVICE_NAME_RESERVED: [u8; 6] = [0; 6];

impl BluetoothDeviceName {
    pub fn encode(&self) -> Result<Bytes, DecoderError> {
        if self.endpoint_info.len() > MAX_ENDPOINT_INFO_LEN {
            return Err(DecoderError::FieldTooLong {
                field: "device_name.endpoint_info",
                max: MAX_ENDPOINT_INFO_LEN,
            });
        }
        if self.endpoint_id.len() != 4 {
            return Err(DecoderError::FieldTooLong {
                field: "device_name.endpoint_id",
                max: 4,
            });
        }
        let mut out = Vec::with_capacity(
            1 + 4 + 3 + 1 + self.endpoint_info.len() + 1 + self.uwb_address.len() + 1 + 6,
        );
        out.push(pack_version_pcp(self.pcp));
        out.extend_from_slice(self.endpoint_id.as_bytes());
        out.extend_from_slice(&self.service_id_hash);
        out.push(self.endpoint_info.len() as u8);
        out.extend_from_slice(&self.endpoint_info);
        out.push(self.uwb_address.len() as u8);
        out.extend_from_slice(&self.uwb_address);
        out.push(webrtc_connectable_to_extra(self.webrtc_connectable));
        out.extend_from_slice(&DEVICE_NAME_RESERVED);
        if out.len() < MIN_DEVICE_NAME_LEN {
            return Err(DecoderError::FieldTooLong {
                field: "device_name",
                max: MIN_DEVICE_NAME_LEN,
            });
        }
        Ok(out.into())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecoderError> {
        if bytes.len() < MIN_DEVICE_NAME_LEN {
            return Err(DecoderError::UnexpectedEof {
                wanted: MIN_DEVICE_NAME_LEN,
                available: bytes.len(),
            });
        }
        let (version_pcp, rest) = take(bytes, 1)?;
        let pcp = unpack_version_pcp(version_pcp[0])?;
        let (endpoint_id, rest) = take(rest, 4)?;
        let endpoint_id = std::str::from_utf8(endpoint_id)
            .map_err(|_| DecoderError::InvalidUtf8("device_name.endpoint_id"))?
            .to_string();
        let (service_id_hash, rest) = take_array::<3>(rest)?;
        let (info_len, rest) = take(rest, 1)?;
        let info_len = info_len[0] as usize;
        if info_len > MAX_ENDPOINT_INFO_LEN {
            return Err(DecoderError::FieldTooLong {
                field: "device_name.endpoint_info",
                max: MAX_ENDPOINT_INFO_LEN,
            });
        }
        let (endpoint_info, rest) = take(rest, info_len)?;
        let (uwb_len, rest) = take(rest, 1)?;
        let (uwb_address, rest) = take(rest, uwb_len[0] as usize)?;
        let (extra, rest) = take(rest, 1)?;
        let (_reserved, rest) = take(rest, 6)?;
        rest_must_be_empty(rest, "device_name")?;
        Ok(Self {
            pcp,
            endpoint_id,
            service_id_hash,
            endpoint_info: Bytes::copy_from_slice(endpoint_info),
            uwb_address: Bytes::copy_from_slice(uwb_address),
            webrtc_connectable: extra[0] & EXTRA_BIT_WEBRTC_CONNECTABLE != 0,
        })
    }
}

/// A Wi-Fi LAN mDNS advertisement: a TXT record (carrying the base64
/// `"n"` key) plus a binary payload shaped like the BLE form but without
/// the Bluetooth MAC block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WifiLanServiceInfo {
    pub pcp: Pcp,
    pub service_id_hash: [u8; 3],
    pub endpoint_id: String,
    pub endpoint_info: Bytes,
    pub uwb_address: Bytes,
    pub webrtc_connectable: bool,
}

const TXT_ENDPOINT_INFO_KEY: &str = "n";

impl WifiLanServiceInfo {
    fn encode_binary(&self) -> Result<Bytes, DecoderError> {
        if self.endpoint_info.len() > MAX_ENDPOINT_INFO_LEN {
            return Err(DecoderError::FieldTooLong {
                field: "wifi_lan.endpoint_info",
                max: MAX_ENDPOINT_INFO_LEN,
            });
        }
        if self.endpoint_id.len() != 4 {
            return Err(DecoderError::FieldTooLong {
                field: "wifi_lan.endpoint_id",
                max: 4,
            });
        }
        let mut out = Vec::with_capacity(
            1 + 3 + 4 + 1 + self.endpoint_info.len() + 1 + self.uwb_address.len() + 1,
        );
        out.push(pack_version_pcp(self.pcp));
        out.extend_from_slice(&self.service_id_hash);
        out.extend_from_slice(self.endpoint_id.as_bytes());
        out.push(self.endpoint_info.len() as u8);
        out.extend_from_slice(&self.endpoint_info);
        out.push(self.uwb_address.len() as u8);
        out.extend_from_slice(&self.uwb_address);
        out.push(webrtc_connectable_to_extra(self.webrtc_connectable));
        Ok(out.into())
    }

    /// Produces the TXT record map this service would be advertised with,
    /// keyed the way mDNS readers expect (`"n"` → base64 endpoint_info).
    pub fn encode_txt_record(&self) -> Result<BTreeMap<String, String>, DecoderError> {
        use base64::Engine;
        let binary = self.encode_binary()?;
        let mut record = BTreeMap::new();
        record.insert(
            TXT_ENDPOINT_INFO_KEY.to_string(),
            base64::engine::general_purpose::STANDARD.encode(&self.endpoint_info),
        );
        record.insert(
            "b".to_string(),
            base64::engine::general_purpose::STANDARD.encode(&binary),
        );
        Ok(record)
    }

    pub fn decode_txt_record(record: &BTreeMap<String, String>) -> Result<Self, DecoderError> {
        use base64::Engine;
        let binary_b64 = record
            .get("b")
            .ok_or(DecoderError::InvalidBase64("wifi_lan.b"))?;
        let binary = base64::engine::general_purpose::STANDARD
            .decode(binary_b64)
            .map_err(|_| DecoderError::InvalidBase64("wifi_lan.b"))?;
        let parsed = Self::decode_binary(&binary)?;

        let info_b64 = record
            .get(TXT_ENDPOINT_INFO_KEY)
            .ok_or(DecoderError::InvalidBase64("wifi_lan.n"))?;
        let endpoint_info = base64::engine::general_purpose::STANDARD
            .decode(info_b64)
            .map_err(|_| DecoderError::InvalidBase64("wifi_lan.n"))?;
        if endpoint_info != parsed.endpoint_info {
            return Err(DecoderError::InvalidBase64("wifi_lan.n"));
        }
        Ok(parsed)
    }

    fn decode_binary(bytes: &[u8]) -> Result<Self, DecoderError> {
        let (version_pcp, rest) = take(bytes, 1)?;
        let pcp = unpack_version_pcp(version_pcp[0])?;
        let (service_id_hash, rest) = take_array::<3>(rest)?;
        let (endpoint_id, rest) = take(rest, 4)?;
        let endpoint_id = std::str::from_utf8(endpoint_id)
            .map_err(|_| DecoderError::InvalidUtf8("wifi_lan.endpoint_id"))?
            .to_string();
        let (info_len, rest) = take(rest, 1)?;
        let info_len = info_len[0] as usize;
        if info_len > MAX_ENDPOINT_INFO_LEN {
            return Err(DecoderError::FieldTooLong {
                field: "wifi_lan.endpoint_info",
                max: MAX_ENDPOINT_INFO_LEN,
            });
        }
        let (endpoint_info, rest) = take(rest, info_len)?;
        let (uwb_len, rest) = take(rest, 1)?;
        let (uwb_address, rest) = take(rest, uwb_len[0] as usize)?;
        let (extra, rest) = take(rest, 1)?;
        rest_must_be_empty(rest, "wifi_lan")?;
        Ok(Self {
            pcp,
            service_id_hash,
            endpoint_id,
            endpoint_info: Bytes::copy_from_slice(endpoint_info),
            uwb_address: Bytes::copy_from_slice(uwb_address),
            webrtc_connectable: extra[0] & EXTRA_BIT_WEBRTC_CONNECTABLE != 0,
        })
    }
}

fn rest_must_be_empty(rest: &[u8], _field: &'static str) -> Result<(), DecoderError> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(DecoderError::TrailingBytes { extra: rest.len() })
    }
}
