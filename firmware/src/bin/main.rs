//! ESP32-C3 firmware for the BLE-to-LoRa heart-rate repeater.
//!
//! Boot order: restore the persisted pairing and name-map key, bring the
//! LoRa transceiver up (reboot after a second if it refuses), start the
//! BLE stack, then hand everything to two long-lived tasks: the BLE task
//! (GATT server + monitor scanner) and the relay task (radio + config
//! store).

#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]

use core::sync::atomic::Ordering;

use embassy_executor::Spawner;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Timer};
use esp_hal::clock::CpuClock;
use esp_hal::timer::timg::TimerGroup;
use log::{error, info};
use static_cell::StaticCell;

use ble_lora_adapter::ble;
use ble_lora_adapter::fmt::Hex;
use ble_lora_adapter::persist::ConfigStore;
use ble_lora_adapter::radio::{self, RadioPins};
use ble_lora_adapter::relay::{self, RelayCommand};
use ble_lora_adapter::scan::{self, DiscoveredDevice, HrSample};
use hr_lora::wire::Addr;

#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    loop {}
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
esp_bootloader_esp_idf::esp_app_desc!();

static RETARGETS: StaticCell<Channel<CriticalSectionRawMutex, Option<Addr>, 4>> = StaticCell::new();
static SAMPLES: StaticCell<Channel<CriticalSectionRawMutex, HrSample, 4>> = StaticCell::new();
static ECHOES: StaticCell<Channel<CriticalSectionRawMutex, scan::HrPayload, 4>> = StaticCell::new();
static DEVICE_EVENTS: StaticCell<Channel<CriticalSectionRawMutex, Option<DiscoveredDevice>, 2>> =
    StaticCell::new();
static RELAY_COMMANDS: StaticCell<Channel<CriticalSectionRawMutex, RelayCommand, 4>> =
    StaticCell::new();
static BLE_RADIO: StaticCell<esp_radio::Controller<'static>> = StaticCell::new();

#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(size: 72 * 1024);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);
    esp_println::logger::init_logger_from_env();
    info!("boot");

    // Restore persisted state; a virgin store yields the defaults.
    let mut store = ConfigStore::init()
        .await
        .expect("failed to initialize config store");
    let paired_addr = match store.paired_addr().await {
        Ok(Some(addr)) => {
            info!("paired addr={}", Hex(&addr));
            Some(addr)
        }
        Ok(None) => {
            info!("no paired addr stored");
            None
        }
        Err(e) => {
            error!("failed to read paired addr: {:?}; starting unpaired", e);
            None
        }
    };
    let name_map_key = match store.name_map_key().await {
        Ok(Some(key)) => {
            info!("name map key={}", key);
            key
        }
        Ok(None) => {
            info!("no name map key stored; using 0");
            0
        }
        Err(e) => {
            error!("failed to read name map key: {:?}; using 0", e);
            0
        }
    };
    relay::NAME_MAP_KEY.store(name_map_key, Ordering::Relaxed);

    let pins = RadioPins {
        sck: peripherals.GPIO8,
        mosi: peripherals.GPIO9,
        miso: peripherals.GPIO10,
        cs: peripherals.GPIO3,
        rst: peripherals.GPIO18,
        busy: peripherals.GPIO19,
        dio1: peripherals.GPIO1,
    };
    let lora_radio = match radio::begin(peripherals.SPI2, pins).await {
        Ok(radio) => radio,
        Err(e) => {
            error!("radio init failed: {:?}; rebooting", e);
            Timer::after(Duration::from_secs(1)).await;
            esp_hal::system::software_reset();
        }
    };

    let radio_init = esp_radio::init().expect("Failed to initialize Wi-Fi/BLE controller");
    let ble_radio = BLE_RADIO.init(radio_init);

    let retargets = RETARGETS.init(Channel::new());
    let samples = SAMPLES.init(Channel::new());
    let echoes = ECHOES.init(Channel::new());
    let device_events = DEVICE_EVENTS.init(Channel::new());
    let relay_commands = RELAY_COMMANDS.init(Channel::new());

    let control = scan::init(paired_addr, retargets.sender(), device_events.sender());

    spawner
        .spawn(ble::ble_task(
            ble_radio,
            peripherals.BT,
            control,
            retargets.receiver(),
            samples.sender(),
            device_events.receiver(),
            echoes.receiver(),
            relay_commands.sender(),
        ))
        .unwrap();
    spawner
        .spawn(relay::relay_task(
            lora_radio,
            store,
            control,
            samples.receiver(),
            relay_commands.receiver(),
            echoes.sender(),
        ))
        .unwrap();

    loop {
        Timer::after(Duration::from_secs(1)).await;
    }
}
