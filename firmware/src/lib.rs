//! Firmware for a battery-powered BLE-to-LoRa heart-rate repeater.
//!
//! The node pairs with a single BLE heart-rate monitor, relays every
//! measurement over a LoRa link to an upstream collector, and exposes a
//! local GATT service through which a configuration client pairs/unpairs
//! the monitor and observes live readings.

#![no_std]

extern crate alloc;

pub mod ble;
pub mod config;
pub mod fmt;
pub mod persist;
pub mod radio;
pub mod relay;
pub mod scan;
