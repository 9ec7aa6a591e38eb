//! BLE task: GATT server for the configuration client, plus the central
//! role that chases the paired monitor.
//!
//! The task owns the whole trouble-host stack and runs three loops side by
//! side: the host runner, the advertise/serve loop for the local Heart
//! Rate service, and the scan manager ([`crate::scan::run`]).

use bt_hci::controller::ExternalController;
use embassy_futures::join::join3;
use embassy_futures::select::{select3, Either3};
use esp_radio::ble::controller::BleConnector;
use esp_radio::Controller;
use log::{info, warn};
use trouble_host::prelude::*;

use hr_lora::device;

use crate::config;
use crate::fmt::Hex;
use crate::relay::{EchoReceiver, RelayCommand, RelayCommandSender};
use crate::scan::{
    self, DeviceReceiver, DiscoveredDevice, HrPayload, RetargetReceiver, SampleSender,
    ScanControl,
};

/// One configuration client plus the link to the monitor.
const CONNECTIONS_MAX: usize = 2;
const L2CAP_CHANNELS_MAX: usize = 2;

const HR_VALUE_LEN: usize = scan::HR_PAYLOAD_LEN;
const INFO_VALUE_LEN: usize = 64;

// GATT server definition
/// Standard Heart Rate service (`180d`) carrying the measurement echo plus
/// the two custom configuration characteristics.
#[gatt_server]
struct Server {
    hr_service: HeartRateService,
}

#[gatt_service(uuid = "180d")]
struct HeartRateService {
    /// Echo of the paired monitor's most recent raw measurement payload.
    #[characteristic(uuid = "2a37", read, notify, value = [0u8; 20])]
    measurement: [u8; HR_VALUE_LEN],
    /// Pairing control; value is the device-info protobuf of the current
    /// whitelist entry (empty when unpaired). Writes retarget the scanner.
    #[characteristic(uuid = "048b8928-d0a5-43e2-ada9-b925ec62ba27", read, write, notify, value = [0u8; 64])]
    whitelist: [u8; INFO_VALUE_LEN],
    /// Last discovered monitor as a device-info protobuf; empty while no
    /// monitor is subscribed.
    #[characteristic(uuid = "12a481f0-9384-413d-b002-f8660566d3b0", read, notify, value = [0u8; 64])]
    device: [u8; INFO_VALUE_LEN],
}

#[embassy_executor::task]
/// Brings the BLE stack up and serves both roles until reboot.
#[allow(clippy::too_many_arguments)]
pub async fn ble_task(
    radio: &'static Controller<'static>,
    bt_peripheral: esp_hal::peripherals::BT<'static>,
    control: ScanControl,
    retargets: RetargetReceiver,
    samples: SampleSender,
    devices: DeviceReceiver,
    echoes: EchoReceiver,
    relay_commands: RelayCommandSender,
) {
    info!("BLE task starting...");

    let transport = BleConnector::new(radio, bt_peripheral, Default::default()).unwrap();
    let controller = ExternalController::<_, 20>::new(transport);
    let address: Address = Address::random(config::BLE_ADDRESS);
    let mut resources: HostResources<DefaultPacketPool, CONNECTIONS_MAX, L2CAP_CHANNELS_MAX> =
        HostResources::new();
    let stack = trouble_host::new(controller, &mut resources).set_random_address(address);
    let Host {
        mut peripheral,
        mut central,
        runner,
        ..
    } = stack.build();

    let server = Server::new_with_config(GapConfig::Peripheral(PeripheralConfig {
        name: config::BLE_NAME,
        appearance: &appearance::heart_rate_sensor::GENERIC_HEART_RATE_SENSOR,
    }))
    .unwrap();
    // Serve whitelist reads from the restored pairing right away.
    set_info_value(
        &server,
        &server.hr_service.whitelist,
        &device::encode_paired(control.get_target_addr().as_ref()),
    );

    let mut adv_data = [0; 31];
    let adv_data_len = AdStructure::encode_slice(
        &[
            AdStructure::Flags(LE_GENERAL_DISCOVERABLE | BR_EDR_NOT_SUPPORTED),
            AdStructure::ServiceUuids16(&[[0x0d, 0x18]]),
            AdStructure::CompleteLocalName(config::BLE_NAME.as_bytes()),
        ],
        &mut adv_data[..],
    )
    .unwrap();

    let mut scan_data = [0; 31];
    let scan_data_len = AdStructure::encode_slice(
        &[AdStructure::CompleteLocalName(config::BLE_NAME.as_bytes())],
        &mut scan_data[..],
    )
    .unwrap();

    join3(
        ble_runner(runner),
        scan::run(&mut central, &stack, control, retargets, samples),
        async {
            loop {
                info!("starting BLE advertising...");
                let acceptor = peripheral
                    .advertise(
                        &Default::default(),
                        Advertisement::ConnectableScannableUndirected {
                            adv_data: &adv_data[..adv_data_len],
                            scan_data: &scan_data[..scan_data_len],
                        },
                    )
                    .await
                    .unwrap();
                let conn = acceptor
                    .accept()
                    .await
                    .unwrap()
                    .with_attribute_server(&server)
                    .unwrap();
                info!("configuration client connected");

                gatt_events_task(&server, &conn, control, &devices, &echoes, &relay_commands)
                    .await;
                warn!("configuration client disconnected, restarting advertising");
            }
        },
    )
    .await;
}

/// Background task that runs the BLE stack's event loop.
async fn ble_runner(
    runner: Runner<'_, ExternalController<BleConnector<'static>, 20>, DefaultPacketPool>,
) {
    let mut runner = runner;
    runner.run().await.unwrap();
}

/// Serves one configuration client: GATT reads/writes multiplexed with the
/// measurement echoes and device events coming from the other tasks.
async fn gatt_events_task(
    server: &Server<'_>,
    conn: &GattConnection<'_, '_, DefaultPacketPool>,
    control: ScanControl,
    devices: &DeviceReceiver,
    echoes: &EchoReceiver,
    relay_commands: &RelayCommandSender,
) {
    loop {
        match select3(conn.next(), echoes.receive(), devices.receive()).await {
            Either3::First(event) => match event {
                GattConnectionEvent::Disconnected { .. } => break,
                GattConnectionEvent::Gatt { event } => match &event {
                    GattEvent::Write(event)
                        if event.handle() == server.hr_service.whitelist.handle =>
                    {
                        handle_whitelist_write(server, conn, event.data(), control, relay_commands)
                            .await;
                    }
                    GattEvent::Read(event)
                        if event.handle() == server.hr_service.whitelist.handle =>
                    {
                        info!("whitelist read");
                    }
                    _ => {}
                },
                _ => {}
            },
            Either3::Second(echo) => notify_measurement(server, conn, &echo).await,
            Either3::Third(device) => notify_device(server, conn, &device).await,
        }
    }
}

/// Applies a whitelist write: retargets the scanner and queues the new
/// pairing for persistence. Bad payloads are ignored.
async fn handle_whitelist_write(
    server: &Server<'_>,
    conn: &GattConnection<'_, '_, DefaultPacketPool>,
    data: &[u8],
    control: ScanControl,
    relay_commands: &RelayCommandSender,
) {
    let Some(target) = device::decode_paired(data) else {
        warn!("bad whitelist write ({} bytes)", data.len());
        return;
    };
    if !control.set_target_addr(target) {
        return;
    }
    match target {
        Some(addr) => info!("paired target set to {}", Hex(&addr)),
        None => info!("paired target cleared"),
    }
    relay_commands
        .send(RelayCommand::PersistTarget(target))
        .await;

    let encoded = device::encode_paired(target.as_ref());
    let value = set_info_value(server, &server.hr_service.whitelist, &encoded);
    if server
        .hr_service
        .whitelist
        .notify(conn, &value)
        .await
        .is_err()
    {
        warn!("whitelist notify failed");
    }
}

async fn notify_measurement(
    server: &Server<'_>,
    conn: &GattConnection<'_, '_, DefaultPacketPool>,
    raw: &HrPayload,
) {
    let mut value = [0u8; HR_VALUE_LEN];
    value[..raw.len()].copy_from_slice(raw);
    let _ = server.set(&server.hr_service.measurement, &value);
    if server
        .hr_service
        .measurement
        .notify(conn, &value)
        .await
        .is_err()
    {
        warn!("measurement notify failed");
    }
}

async fn notify_device(
    server: &Server<'_>,
    conn: &GattConnection<'_, '_, DefaultPacketPool>,
    device: &Option<DiscoveredDevice>,
) {
    let encoded =
        device::encode_device(device.as_ref().map(|d| (&d.addr, d.name.as_str())));
    let value = set_info_value(server, &server.hr_service.device, &encoded);
    if server
        .hr_service
        .device
        .notify(conn, &value)
        .await
        .is_err()
    {
        warn!("device notify failed");
    }
}

/// Copies a protobuf payload into a fixed characteristic value and stores
/// it for reads. The 31-byte name cap keeps every payload within the value
/// length.
fn set_info_value(
    server: &Server<'_>,
    characteristic: &Characteristic<[u8; INFO_VALUE_LEN]>,
    payload: &[u8],
) -> [u8; INFO_VALUE_LEN] {
    let mut value = [0u8; INFO_VALUE_LEN];
    let len = payload.len().min(INFO_VALUE_LEN);
    value[..len].copy_from_slice(&payload[..len]);
    let _ = server.set(characteristic, &value);
    value
}
