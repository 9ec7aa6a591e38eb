//! Deployment constants for the repeater board (ESP32-C3 + LLCC68).

use embassy_time::Duration;

/// Local name advertised by the GATT server.
pub const BLE_NAME: &str = "LoRA-Adapter";

/// Static random address of this node. Doubles as the repeater address in
/// query responses, so it must be stable across reboots.
pub const BLE_ADDRESS: [u8; 6] = [0xff, 0x9e, 0x0a, 0x3c, 0x51, 0xd2];

/// LoRa modulation. Every parameter must match the peers exactly; a
/// mismatch silently yields no traffic.
pub mod lora {
    /// 434 MHz ISM band.
    pub const FREQUENCY_HZ: u32 = 434_000_000;
    pub const TX_POWER_DBM: i32 = 22;
    pub const PREAMBLE_LEN: u16 = 8;
}

/// Scan cadence for reacquiring the paired monitor: a 750 ms active window
/// in every 1 s interval, leaving the stack a 250 ms breather for its other
/// radio activity.
pub mod scan {
    use super::Duration;

    pub const WINDOW: Duration = Duration::from_millis(750);
    pub const INTERVAL: Duration = Duration::from_millis(1000);
}

// Transceiver wiring (SPI + control). DIO2 (GPIO2) is routed on the board
// but unused by this firmware.
//
//   SCK=8  MOSI=9  MISO=10  CS=3  BUSY=19  RST=18  DIO1=1
//
// The concrete pin singletons are claimed in `main` and handed to
// `radio::begin` as a `RadioPins` bundle.
