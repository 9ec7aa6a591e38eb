//! Protocol definitions for the BLE-to-LoRa heart-rate repeater.
//!
//! This crate holds everything that crosses a wire or an air interface and
//! can therefore be tested on the host:
//!
//! - the binary LoRa frame codec ([`wire`]),
//! - the GATT Heart Rate Measurement parser ([`hr`]),
//! - the device-info protobuf used by the local configuration
//!   characteristics ([`device`]).

#![no_std]

extern crate alloc;

pub mod device;
pub mod hr;
pub mod wire;
