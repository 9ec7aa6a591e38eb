//! Relay orchestrator: the single task that owns the LoRa radio and the
//! persistent config store.
//!
//! It multiplexes three sources — received LoRa packets, heart-rate
//! samples from the scan manager, and commands from the GATT handlers —
//! and serializes every radio access through its own loop, which is what
//! upholds the half-duplex invariant.

use core::sync::atomic::{AtomicU8, Ordering};

use embassy_futures::select::{select3, Either3};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Receiver, Sender};
use log::{error, info, warn};

use hr_lora::hr::Measurement;
use hr_lora::wire::{
    Frame, HrData, HrDevice, QueryDeviceByMacResponse, BROADCAST_ADDR, MAX_FRAME_LEN,
};

use crate::config;
use crate::fmt::Hex;
use crate::persist::ConfigStore;
use crate::radio::{Radio, RX_BUFFER_LEN};
use crate::scan::{HrPayload, HrSample, ScanControl};

/// The name-map key currently in force. Mirrors the persisted value; a
/// failed persist keeps the requested value here (best-effort storage).
pub static NAME_MAP_KEY: AtomicU8 = AtomicU8::new(0);

/// Work handed to the relay task by the GATT handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayCommand {
    /// Write the new pairing through to the config store.
    PersistTarget(Option<hr_lora::wire::Addr>),
}

pub type RelayCommandSender = Sender<'static, CriticalSectionRawMutex, RelayCommand, 4>;
pub type RelayCommandReceiver = Receiver<'static, CriticalSectionRawMutex, RelayCommand, 4>;
pub type EchoSender = Sender<'static, CriticalSectionRawMutex, HrPayload, 4>;
pub type EchoReceiver = Receiver<'static, CriticalSectionRawMutex, HrPayload, 4>;
pub type SampleReceiver = Receiver<'static, CriticalSectionRawMutex, HrSample, 4>;

#[embassy_executor::task]
pub async fn relay_task(
    mut radio: Radio,
    mut store: ConfigStore,
    control: ScanControl,
    samples: SampleReceiver,
    commands: RelayCommandReceiver,
    echoes: EchoSender,
) {
    info!("relay task starting...");
    if let Err(e) = radio.start_receive().await {
        error!("failed to arm receive: {:?}", e);
    }

    let mut rx_buf = [0u8; RX_BUFFER_LEN];
    loop {
        match select3(radio.receive(&mut rx_buf), samples.receive(), commands.receive()).await {
            Either3::First(Ok(len)) => {
                if len == 0 {
                    warn!("empty receive");
                    continue;
                }
                handle_frame(&rx_buf[..len], &mut radio, &mut store, control).await;
            }
            Either3::First(Err(e)) => {
                warn!("receive failed: {:?}", e);
                let _ = radio.start_receive().await;
            }
            Either3::Second(sample) => handle_sample(sample, &mut radio, &echoes).await,
            Either3::Third(command) => handle_command(command, &mut store).await,
        }
    }
}

/// Dispatches one received LoRa frame on its magic byte.
async fn handle_frame(frame: &[u8], radio: &mut Radio, store: &mut ConfigStore, control: ScanControl) {
    info!("recv={}", Hex(frame));
    match Frame::unmarshal(frame) {
        Some(Frame::QueryDeviceByMac(req)) => {
            let mine = req.addr == BROADCAST_ADDR || req.addr == config::BLE_ADDRESS;
            if !mine {
                info!("query for {} is not for me", Hex(&req.addr));
                return;
            }
            let response = QueryDeviceByMacResponse {
                repeater_addr: config::BLE_ADDRESS,
                key: NAME_MAP_KEY.load(Ordering::Relaxed),
                device: control.get_device().map(|d| HrDevice {
                    addr: d.addr,
                    name: d.name,
                }),
            };
            let mut buf = [0u8; MAX_FRAME_LEN];
            match response.marshal(&mut buf) {
                Some(len) => transmit(radio, &buf[..len]).await,
                None => error!("failed to marshal query response"),
            }
        }
        Some(Frame::SetNameMapKey(req)) => {
            NAME_MAP_KEY.store(req.key, Ordering::Relaxed);
            info!("name map key={}", req.key);
            if let Err(e) = store.set_name_map_key(req.key).await {
                warn!("failed to persist name map key: {:?}", e);
            }
        }
        // Originated by a peer repeater; not ours to answer.
        Some(Frame::HrData(_)) | Some(Frame::QueryDeviceByMacResponse(_)) => {}
        None => warn!("dropping frame, magic={:#04x}", frame[0]),
    }
}

/// Relays one heart-rate notification: `HrData` over the air, the raw
/// payload to the local measurement characteristic.
async fn handle_sample(sample: HrSample, radio: &mut Radio, echoes: &EchoSender) {
    info!("hr data={}", Hex(&sample.raw));
    let Some(measurement) = Measurement::parse(&sample.raw) else {
        warn!("bad hr payload size: {}", sample.raw.len());
        return;
    };
    if measurement.overflows_relay() {
        warn!("hr {} overflows u8; clamping to 255", measurement.bpm);
    }
    let frame = HrData {
        key: NAME_MAP_KEY.load(Ordering::Relaxed),
        hr: measurement.relayed_bpm(),
    };
    let mut buf = [0u8; HrData::SIZE];
    match frame.marshal(&mut buf) {
        Some(len) => transmit(radio, &buf[..len]).await,
        None => error!("failed to marshal hr data"),
    }
    // Best-effort: with no configuration client connected nobody drains
    // the echo channel.
    let _ = echoes.try_send(sample.raw);
}

async fn handle_command(command: RelayCommand, store: &mut ConfigStore) {
    match command {
        RelayCommand::PersistTarget(Some(addr)) => {
            if let Err(e) = store.set_paired_addr(&addr).await {
                warn!("failed to persist paired addr: {:?}", e);
            }
        }
        RelayCommand::PersistTarget(None) => {
            if let Err(e) = store.clear_paired_addr().await {
                warn!("failed to clear paired addr: {:?}", e);
            }
        }
    }
}

async fn transmit(radio: &mut Radio, frame: &[u8]) {
    match radio.try_transmit(frame).await {
        Ok(()) => info!("tx={} ({})", Hex(frame), frame.len()),
        // Lost frame only; the radio is already listening again.
        Err(e) => warn!("failed to transmit: {:?}", e),
    }
}
