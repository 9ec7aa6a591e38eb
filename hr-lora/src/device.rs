//! Device-info protobuf carried by the local whitelist and device
//! characteristics: `{ bytes mac = 1; string name = 2; }`.
//!
//! The whitelist characteristic encodes just the paired address (empty
//! `mac` or an empty payload means "no pairing"); the device characteristic
//! carries the last discovered monitor with its name truncated to
//! [`wire::MAX_NAME_LEN`] bytes.

use alloc::string::String;
use alloc::vec::Vec;

use prost::Message;

use crate::wire::{Addr, MAX_NAME_LEN};

#[derive(Clone, PartialEq, Message)]
pub struct DeviceInfo {
    #[prost(bytes = "vec", tag = "1")]
    pub mac: Vec<u8>,
    #[prost(string, tag = "2")]
    pub name: String,
}

/// Encodes the current pairing for the whitelist characteristic.
pub fn encode_paired(addr: Option<&Addr>) -> Vec<u8> {
    DeviceInfo {
        mac: addr.map(|a| a.to_vec()).unwrap_or_default(),
        name: String::new(),
    }
    .encode_to_vec()
}

/// Decodes a whitelist write into a pairing request.
///
/// Returns `None` for payloads that are not a device-info message or whose
/// `mac` is not a BLE address; `Some(None)` is an explicit unpair (empty
/// payload or empty `mac`).
pub fn decode_paired(data: &[u8]) -> Option<Option<Addr>> {
    if data.is_empty() {
        return Some(None);
    }
    let info = DeviceInfo::decode(data).ok()?;
    if info.mac.is_empty() {
        return Some(None);
    }
    let addr: Addr = info.mac.as_slice().try_into().ok()?;
    Some(Some(addr))
}

/// Encodes the discovered monitor for the device characteristic. A missing
/// monitor encodes as an empty message, like an unpaired whitelist.
pub fn encode_device(device: Option<(&Addr, &str)>) -> Vec<u8> {
    let info = match device {
        Some((addr, name)) => DeviceInfo {
            mac: addr.to_vec(),
            name: truncate_name(name).into(),
        },
        None => DeviceInfo::default(),
    };
    info.encode_to_vec()
}

/// Longest prefix of `name` that fits the 31-byte cap without splitting a
/// UTF-8 sequence.
pub fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: Addr = [0xde, 0xad, 0xbe, 0xef, 0x00, 0x01];

    #[test]
    fn paired_address_round_trips() {
        let encoded = encode_paired(Some(&ADDR));
        assert_eq!(decode_paired(&encoded), Some(Some(ADDR)));
    }

    #[test]
    fn empty_payload_means_unpair() {
        assert_eq!(decode_paired(&[]), Some(None));
        let encoded = encode_paired(None);
        assert_eq!(decode_paired(&encoded), Some(None));
    }

    #[test]
    fn malformed_payload_is_rejected() {
        assert!(decode_paired(&[0x00, 0x01]).is_none());
        // Well-formed message, wrong address length.
        let encoded = DeviceInfo {
            mac: alloc::vec![1, 2, 3],
            name: String::new(),
        }
        .encode_to_vec();
        assert!(decode_paired(&encoded).is_none());
    }

    #[test]
    fn device_info_round_trips() {
        let encoded = encode_device(Some((&ADDR, "Polar H10")));
        let info = DeviceInfo::decode(encoded.as_slice()).unwrap();
        assert_eq!(info.mac, ADDR.to_vec());
        assert_eq!(info.name, "Polar H10");
    }

    #[test]
    fn missing_device_encodes_empty() {
        let encoded = encode_device(None);
        assert!(encoded.is_empty());
        let info = DeviceInfo::decode(encoded.as_slice()).unwrap();
        assert!(info.mac.is_empty());
        assert!(info.name.is_empty());
    }

    #[test]
    fn long_names_are_truncated() {
        let name = "0123456789012345678901234567890123456789";
        assert_eq!(truncate_name(name).len(), MAX_NAME_LEN);
        let encoded = encode_device(Some((&ADDR, name)));
        let info = DeviceInfo::decode(encoded.as_slice()).unwrap();
        assert_eq!(info.name.len(), MAX_NAME_LEN);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // 16 two-byte characters: 32 bytes, cut must land on byte 30.
        let name = "éééééééééééééééé";
        let cut = truncate_name(name);
        assert_eq!(cut.len(), 30);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
