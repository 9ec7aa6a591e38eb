//! Binary codec for the LoRa frames exchanged between repeaters and the
//! upstream collector.
//!
//! Every frame starts with a one-byte magic that identifies the variant;
//! readers dispatch on byte 0. Integers are little-endian, device names are
//! length-prefixed UTF-8 capped at [`MAX_NAME_LEN`] bytes. The codec does no
//! I/O and never allocates.

use heapless::String;

/// Length of a BLE device address.
pub const BLE_ADDR_LEN: usize = 6;

/// A raw BLE device address as handed out by the BLE stack.
pub type Addr = [u8; BLE_ADDR_LEN];

/// Address used in [`QueryDeviceByMac`] to address every repeater in range.
pub const BROADCAST_ADDR: Addr = [0xff; BLE_ADDR_LEN];

/// Maximum encoded length of a device name, in bytes.
pub const MAX_NAME_LEN: usize = 31;

/// Largest frame the codec can produce ([`QueryDeviceByMacResponse`] with a
/// full-length name); receive buffers should be at least this big.
pub const MAX_FRAME_LEN: usize =
    QueryDeviceByMacResponse::BASE_SIZE + 1 + BLE_ADDR_LEN + MAX_NAME_LEN;

/// Frame magics, one per variant.
pub mod magic {
    pub const HR_DATA: u8 = 0x63;
    pub const QUERY_DEVICE_BY_MAC: u8 = 0x64;
    pub const QUERY_DEVICE_BY_MAC_RESPONSE: u8 = 0x65;
    pub const SET_NAME_MAP_KEY: u8 = 0x66;
}

/// A single heart-rate sample relayed from the paired monitor.
///
/// `key` is the opaque name-map key the collector uses to resolve the
/// monitor's name; `hr` is the measured rate clamped to `u8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HrData {
    pub key: u8,
    pub hr: u8,
}

impl HrData {
    pub const SIZE: usize = 3;

    pub fn marshal(&self, buf: &mut [u8]) -> Option<usize> {
        if buf.len() < Self::SIZE {
            return None;
        }
        buf[0] = magic::HR_DATA;
        buf[1] = self.key;
        buf[2] = self.hr;
        Some(Self::SIZE)
    }

    pub fn unmarshal(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE || buf[0] != magic::HR_DATA {
            return None;
        }
        Some(Self {
            key: buf[1],
            hr: buf[2],
        })
    }
}

/// Asks the addressed repeater (or every repeater, when the address is
/// [`BROADCAST_ADDR`]) to report its paired monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryDeviceByMac {
    pub addr: Addr,
}

impl QueryDeviceByMac {
    pub const SIZE: usize = 1 + BLE_ADDR_LEN;

    pub fn marshal(&self, buf: &mut [u8]) -> Option<usize> {
        if buf.len() < Self::SIZE {
            return None;
        }
        buf[0] = magic::QUERY_DEVICE_BY_MAC;
        buf[1..Self::SIZE].copy_from_slice(&self.addr);
        Some(Self::SIZE)
    }

    pub fn unmarshal(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE || buf[0] != magic::QUERY_DEVICE_BY_MAC {
            return None;
        }
        let mut addr = Addr::default();
        addr.copy_from_slice(&buf[1..Self::SIZE]);
        Some(Self { addr })
    }
}

/// The paired monitor as reported in a [`QueryDeviceByMacResponse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HrDevice {
    pub addr: Addr,
    pub name: String<MAX_NAME_LEN>,
}

/// Reply to [`QueryDeviceByMac`].
///
/// Layout: magic, 6 repeater address bytes, the name-map key, then a device
/// block prefixed with its length (`6 + name length`, or a single zero byte
/// when no monitor is paired).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDeviceByMacResponse {
    pub repeater_addr: Addr,
    pub key: u8,
    pub device: Option<HrDevice>,
}

impl QueryDeviceByMacResponse {
    /// Magic, repeater address and key; the device-block length byte and the
    /// block itself follow.
    pub const BASE_SIZE: usize = 1 + BLE_ADDR_LEN + 1;

    pub fn size_needed(&self) -> usize {
        let device = match &self.device {
            Some(d) => BLE_ADDR_LEN + d.name.len(),
            None => 0,
        };
        Self::BASE_SIZE + 1 + device
    }

    pub fn marshal(&self, buf: &mut [u8]) -> Option<usize> {
        let size = self.size_needed();
        if buf.len() < size {
            return None;
        }
        buf[0] = magic::QUERY_DEVICE_BY_MAC_RESPONSE;
        buf[1..7].copy_from_slice(&self.repeater_addr);
        buf[7] = self.key;
        match &self.device {
            Some(d) => {
                buf[8] = (BLE_ADDR_LEN + d.name.len()) as u8;
                buf[9..15].copy_from_slice(&d.addr);
                buf[15..15 + d.name.len()].copy_from_slice(d.name.as_bytes());
            }
            None => buf[8] = 0,
        }
        Some(size)
    }

    pub fn unmarshal(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::BASE_SIZE + 1 || buf[0] != magic::QUERY_DEVICE_BY_MAC_RESPONSE {
            return None;
        }
        let mut repeater_addr = Addr::default();
        repeater_addr.copy_from_slice(&buf[1..7]);
        let key = buf[7];
        let block_len = buf[8] as usize;
        let device = if block_len == 0 {
            None
        } else {
            if block_len < BLE_ADDR_LEN || buf.len() < 9 + block_len {
                return None;
            }
            let name_len = block_len - BLE_ADDR_LEN;
            if name_len > MAX_NAME_LEN {
                return None;
            }
            let mut addr = Addr::default();
            addr.copy_from_slice(&buf[9..15]);
            let name = core::str::from_utf8(&buf[15..15 + name_len]).ok()?;
            Some(HrDevice {
                addr,
                name: name.try_into().ok()?,
            })
        };
        Some(Self {
            repeater_addr,
            key,
            device,
        })
    }
}

/// Assigns this repeater a new name-map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetNameMapKey {
    pub key: u8,
}

impl SetNameMapKey {
    pub const SIZE: usize = 2;

    pub fn marshal(&self, buf: &mut [u8]) -> Option<usize> {
        if buf.len() < Self::SIZE {
            return None;
        }
        buf[0] = magic::SET_NAME_MAP_KEY;
        buf[1] = self.key;
        Some(Self::SIZE)
    }

    pub fn unmarshal(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE || buf[0] != magic::SET_NAME_MAP_KEY {
            return None;
        }
        Some(Self { key: buf[1] })
    }
}

/// Union of all LoRa frame variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    HrData(HrData),
    QueryDeviceByMac(QueryDeviceByMac),
    QueryDeviceByMacResponse(QueryDeviceByMacResponse),
    SetNameMapKey(SetNameMapKey),
}

impl Frame {
    pub fn magic(&self) -> u8 {
        match self {
            Frame::HrData(_) => magic::HR_DATA,
            Frame::QueryDeviceByMac(_) => magic::QUERY_DEVICE_BY_MAC,
            Frame::QueryDeviceByMacResponse(_) => magic::QUERY_DEVICE_BY_MAC_RESPONSE,
            Frame::SetNameMapKey(_) => magic::SET_NAME_MAP_KEY,
        }
    }

    pub fn marshal(&self, buf: &mut [u8]) -> Option<usize> {
        match self {
            Frame::HrData(m) => m.marshal(buf),
            Frame::QueryDeviceByMac(m) => m.marshal(buf),
            Frame::QueryDeviceByMacResponse(m) => m.marshal(buf),
            Frame::SetNameMapKey(m) => m.marshal(buf),
        }
    }

    /// Dispatches on the magic in byte 0; unknown magic or a malformed body
    /// decodes to `None`.
    pub fn unmarshal(buf: &[u8]) -> Option<Self> {
        match buf.first()? {
            &magic::HR_DATA => HrData::unmarshal(buf).map(Frame::HrData),
            &magic::QUERY_DEVICE_BY_MAC => {
                QueryDeviceByMac::unmarshal(buf).map(Frame::QueryDeviceByMac)
            }
            &magic::QUERY_DEVICE_BY_MAC_RESPONSE => {
                QueryDeviceByMacResponse::unmarshal(buf).map(Frame::QueryDeviceByMacResponse)
            }
            &magic::SET_NAME_MAP_KEY => SetNameMapKey::unmarshal(buf).map(Frame::SetNameMapKey),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with_device() -> QueryDeviceByMacResponse {
        QueryDeviceByMacResponse {
            repeater_addr: [0x11, 0x22, 0x33, 0x44, 0x55, 0x66],
            key: 7,
            device: Some(HrDevice {
                addr: [0xa0, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5],
                name: "Polar H10 12345678".try_into().unwrap(),
            }),
        }
    }

    #[test]
    fn hr_data_frame_layout() {
        let msg = HrData { key: 5, hr: 72 };
        let mut buf = [0u8; 8];
        let len = msg.marshal(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[0x63, 0x05, 0x48]);
        assert_eq!(HrData::unmarshal(&buf[..len]).unwrap(), msg);
    }

    #[test]
    fn set_name_map_key_frame_layout() {
        let msg = SetNameMapKey { key: 9 };
        let mut buf = [0u8; 8];
        let len = msg.marshal(&mut buf).unwrap();
        assert_eq!(len, 2);
        assert_eq!(buf[1], 0x09);
        assert_eq!(SetNameMapKey::unmarshal(&buf[..len]).unwrap(), msg);
    }

    #[test]
    fn query_round_trips_broadcast() {
        let msg = QueryDeviceByMac {
            addr: BROADCAST_ADDR,
        };
        let mut buf = [0u8; 16];
        let len = msg.marshal(&mut buf).unwrap();
        assert_eq!(len, 7);
        assert_eq!(QueryDeviceByMac::unmarshal(&buf[..len]).unwrap(), msg);
    }

    #[test]
    fn response_round_trips_with_device() {
        let msg = response_with_device();
        let mut buf = [0u8; MAX_FRAME_LEN];
        let len = msg.marshal(&mut buf).unwrap();
        assert_eq!(len, msg.size_needed());
        assert_eq!(
            QueryDeviceByMacResponse::unmarshal(&buf[..len]).unwrap(),
            msg
        );
    }

    #[test]
    fn response_round_trips_without_device() {
        let msg = QueryDeviceByMacResponse {
            repeater_addr: [1, 2, 3, 4, 5, 6],
            key: 0,
            device: None,
        };
        let mut buf = [0u8; MAX_FRAME_LEN];
        let len = msg.marshal(&mut buf).unwrap();
        assert_eq!(len, 9);
        assert_eq!(buf[8], 0);
        assert_eq!(
            QueryDeviceByMacResponse::unmarshal(&buf[..len]).unwrap(),
            msg
        );
    }

    #[test]
    fn marshal_rejects_short_buffers() {
        let mut buf = [0u8; 2];
        assert!(HrData { key: 1, hr: 2 }.marshal(&mut buf).is_none());
        assert!(
            QueryDeviceByMac {
                addr: BROADCAST_ADDR
            }
            .marshal(&mut buf)
            .is_none()
        );
        assert!(response_with_device().marshal(&mut buf).is_none());
        assert!(SetNameMapKey { key: 1 }.marshal(&mut buf[..1]).is_none());
    }

    #[test]
    fn unmarshal_rejects_short_input() {
        let msg = response_with_device();
        let mut buf = [0u8; MAX_FRAME_LEN];
        let len = msg.marshal(&mut buf).unwrap();
        for cut in 0..len {
            assert!(QueryDeviceByMacResponse::unmarshal(&buf[..cut]).is_none());
        }
        assert!(HrData::unmarshal(&[0x63, 0x05]).is_none());
        assert!(QueryDeviceByMac::unmarshal(&[0x64, 1, 2, 3]).is_none());
    }

    #[test]
    fn unmarshal_rejects_wrong_magic() {
        assert!(HrData::unmarshal(&[0x64, 0x05, 0x48]).is_none());
        assert!(SetNameMapKey::unmarshal(&[0x63, 0x09]).is_none());
    }

    #[test]
    fn frame_dispatches_on_magic() {
        let msg = HrData { key: 5, hr: 72 };
        let mut buf = [0u8; 8];
        let len = msg.marshal(&mut buf).unwrap();
        assert_eq!(Frame::unmarshal(&buf[..len]), Some(Frame::HrData(msg)));
        assert!(Frame::unmarshal(&[0x00, 0x05, 0x48]).is_none());
        assert!(Frame::unmarshal(&[]).is_none());
    }

    #[test]
    fn frame_marshal_matches_variant() {
        let frame = Frame::SetNameMapKey(SetNameMapKey { key: 42 });
        let mut buf = [0u8; 8];
        let len = frame.marshal(&mut buf).unwrap();
        assert_eq!(buf[0], frame.magic());
        assert_eq!(Frame::unmarshal(&buf[..len]).unwrap(), frame);
    }

    #[test]
    fn response_rejects_bogus_device_block() {
        // Block length shorter than an address.
        let buf = [0x65, 1, 2, 3, 4, 5, 6, 0, 3, 0xaa, 0xbb, 0xcc];
        assert!(QueryDeviceByMacResponse::unmarshal(&buf).is_none());
    }
}
