//! Central-role manager for the paired heart-rate monitor.
//!
//! Per target the manager walks `NoTarget -> Scanning -> Connecting ->
//! Subscribed`, falling back to `Scanning` on any failure or disconnect.
//! Target changes arrive on a command channel from the GATT write handler;
//! [`ScanControl`] filters no-op retargets there so an established
//! connection is never torn down by a write of the current address.

use core::cell::RefCell;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::channel::{Receiver, Sender};
use embassy_time::{Duration, Timer};
use heapless::String;
use log::{info, warn};
use static_cell::StaticCell;
use trouble_host::prelude::*;

use hr_lora::device::truncate_name;
use hr_lora::wire::{Addr, MAX_NAME_LEN};

use crate::config;
use crate::fmt::Hex;

/// Raw Heart Rate Measurement payload in flight between tasks. Sized for
/// the default ATT MTU, which every real monitor fits.
pub const HR_PAYLOAD_LEN: usize = 20;
pub type HrPayload = heapless::Vec<u8, HR_PAYLOAD_LEN>;

/// One notification from the subscribed monitor, as received on the air.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HrSample {
    pub raw: HrPayload,
}

/// The monitor we are currently subscribed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub addr: Addr,
    pub name: String<MAX_NAME_LEN>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NoTarget,
    Scanning,
    Connecting,
    Subscribed,
}

struct ScanState {
    target: Option<Addr>,
    device: Option<DiscoveredDevice>,
    phase: Phase,
}

pub type RetargetSender = Sender<'static, CriticalSectionRawMutex, Option<Addr>, 4>;
pub type RetargetReceiver = Receiver<'static, CriticalSectionRawMutex, Option<Addr>, 4>;
pub type SampleSender = Sender<'static, CriticalSectionRawMutex, HrSample, 4>;
pub type SampleReceiver = Receiver<'static, CriticalSectionRawMutex, HrSample, 4>;
pub type DeviceSender = Sender<'static, CriticalSectionRawMutex, Option<DiscoveredDevice>, 2>;
pub type DeviceReceiver = Receiver<'static, CriticalSectionRawMutex, Option<DiscoveredDevice>, 2>;

/// Handle over the scan manager's shared state, cheap to copy into the
/// GATT handlers and the relay task.
///
/// Every change to the discovered device is mirrored onto the device-event
/// channel, so the device characteristic tracks the same state the LoRa
/// query responses report.
#[derive(Clone, Copy)]
pub struct ScanControl {
    state: &'static BlockingMutex<CriticalSectionRawMutex, RefCell<ScanState>>,
    retargets: RetargetSender,
    devices: DeviceSender,
}

static STATE: StaticCell<BlockingMutex<CriticalSectionRawMutex, RefCell<ScanState>>> =
    StaticCell::new();

/// Builds the shared state, seeded with the target restored from flash.
pub fn init(
    initial_target: Option<Addr>,
    retargets: RetargetSender,
    devices: DeviceSender,
) -> ScanControl {
    let phase = match initial_target {
        Some(_) => Phase::Scanning,
        None => Phase::NoTarget,
    };
    let state = STATE.init(BlockingMutex::new(RefCell::new(ScanState {
        target: initial_target,
        device: None,
        phase,
    })));
    ScanControl {
        state,
        retargets,
        devices,
    }
}

impl ScanControl {
    /// Points the manager at a new target, or at nothing.
    ///
    /// Idempotent: a request equal to the current target is a no-op and
    /// must not disturb a live connection. Returns whether anything
    /// changed.
    pub fn set_target_addr(&self, addr: Option<Addr>) -> bool {
        let (changed, had_device) = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            if s.target == addr {
                (false, false)
            } else {
                s.target = addr;
                (true, s.device.take().is_some())
            }
        });
        if changed {
            if self.retargets.try_send(addr).is_err() {
                warn!("retarget queue full; command dropped");
            }
            if had_device {
                self.publish_device(None);
            }
        }
        changed
    }

    pub fn get_target_addr(&self) -> Option<Addr> {
        self.state.lock(|s| s.borrow().target)
    }

    pub fn get_device(&self) -> Option<DiscoveredDevice> {
        self.state.lock(|s| s.borrow().device.clone())
    }

    fn set_device(&self, device: DiscoveredDevice) {
        self.state
            .lock(|s| s.borrow_mut().device = Some(device.clone()));
        self.publish_device(Some(device));
    }

    fn clear_device(&self) {
        let had_device = self.state.lock(|s| s.borrow_mut().device.take().is_some());
        if had_device {
            self.publish_device(None);
        }
    }

    fn publish_device(&self, device: Option<DiscoveredDevice>) {
        if self.devices.try_send(device).is_err() {
            warn!("device event dropped");
        }
    }

    fn enter(&self, phase: Phase) {
        self.state.lock(|s| s.borrow_mut().phase = phase);
        info!("scan: {:?}", phase);
    }
}

/// Drives the state machine. Runs forever, joined into the BLE task next
/// to the host runner and the GATT server loop.
pub async fn run<C: Controller, P: PacketPool>(
    central: &mut Central<'_, C, P>,
    stack: &Stack<'_, C, P>,
    control: ScanControl,
    retargets: RetargetReceiver,
    samples: SampleSender,
) -> ! {
    loop {
        let Some(target) = control.get_target_addr() else {
            control.enter(Phase::NoTarget);
            // Parked until a configuration client pairs a monitor.
            retargets.receive().await;
            continue;
        };
        match select(
            attend_target(central, stack, target, control, samples),
            stale_free_retarget(retargets, target),
        )
        .await
        {
            Either::First(()) => {
                control.clear_device();
                Timer::after(Duration::from_millis(250)).await;
            }
            Either::Second(()) => {
                // Target changed under us; the connection future is gone
                // and the next iteration reads the new target.
                control.clear_device();
            }
        }
    }
}

/// Resolves once a retarget command actually differs from `current`.
/// `set_target_addr` already filters no-ops, so anything else here is a
/// command that raced the state update; equal ones must not drop the link.
async fn stale_free_retarget(retargets: RetargetReceiver, current: Addr) {
    loop {
        if retargets.receive().await != Some(current) {
            return;
        }
    }
}

/// One full connect/subscribe/relay session against `target`. Returns when
/// the link drops or cannot be established.
async fn attend_target<C: Controller, P: PacketPool>(
    central: &mut Central<'_, C, P>,
    stack: &Stack<'_, C, P>,
    target: Addr,
    control: ScanControl,
    samples: SampleSender,
) {
    control.enter(Phase::Scanning);
    info!("scanning for {}", Hex(&target));

    let peer = BdAddr::new(target);
    let connect_config = ConnectConfig {
        connect_params: Default::default(),
        scan_config: ScanConfig {
            active: true,
            filter_accept_list: &[(AddrKind::PUBLIC, &peer)],
            interval: config::scan::INTERVAL,
            window: config::scan::WINDOW,
            ..Default::default()
        },
    };

    let conn = match central.connect(&connect_config).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!("connect to {} failed: {:?}", Hex(&target), e);
            Timer::after(Duration::from_millis(500)).await;
            return;
        }
    };
    control.enter(Phase::Connecting);

    let client = match GattClient::<C, P, 8>::new(stack, &conn).await {
        Ok(client) => client,
        Err(e) => {
            warn!("gatt client setup failed: {:?}", e);
            return;
        }
    };

    match select(
        client.task(),
        subscribe_measurements(&client, target, control, samples),
    )
    .await
    {
        Either::First(_) => info!("monitor {} disconnected", Hex(&target)),
        Either::Second(Ok(())) => {}
        Either::Second(Err(e)) => warn!("subscription to {} failed: {:?}", Hex(&target), e),
    }
}

/// Discovers the Heart Rate service, subscribes to the measurement
/// characteristic, and forwards every notification until the link drops
/// (which resolves the client task and cancels this future).
async fn subscribe_measurements<C: Controller, P: PacketPool>(
    client: &GattClient<'_, C, P, 8>,
    target: Addr,
    control: ScanControl,
    samples: SampleSender,
) -> Result<(), BleHostError<C::Error>> {
    let services = client.services_by_uuid(&Uuid::new_short(0x180d)).await?;
    let Some(service) = services.first().cloned() else {
        warn!("{} exposes no heart rate service", Hex(&target));
        return Ok(());
    };
    let measurement: Characteristic<u8> = client
        .characteristic_by_uuid(&service, &Uuid::new_short(0x2a37))
        .await?;
    let mut listener = client.subscribe(&measurement, false).await?;

    let name = read_device_name(client).await.unwrap_or_default();
    let device = DiscoveredDevice { addr: target, name };
    info!("subscribed to {} ({})", Hex(&target), device.name);
    control.set_device(device);
    control.enter(Phase::Subscribed);

    loop {
        let notification = listener.next().await;
        let data = notification.as_ref();
        let mut raw = HrPayload::new();
        let take = data.len().min(HR_PAYLOAD_LEN);
        // Infallible: `take` fits the vec's capacity.
        let _ = raw.extend_from_slice(&data[..take]);
        samples.send(HrSample { raw }).await;
    }
}

/// Reads the peer's GAP device name, truncated to the 31-byte cap.
async fn read_device_name<C: Controller, P: PacketPool>(
    client: &GattClient<'_, C, P, 8>,
) -> Option<String<MAX_NAME_LEN>> {
    let services = client.services_by_uuid(&Uuid::new_short(0x1800)).await.ok()?;
    let service = services.first()?.clone();
    let name_char: Characteristic<u8> = client
        .characteristic_by_uuid(&service, &Uuid::new_short(0x2a00))
        .await
        .ok()?;
    let mut buf = [0u8; 48];
    let len = client.read_characteristic(&name_char, &mut buf).await.ok()?;
    let full = core::str::from_utf8(&buf[..len]).ok()?;
    let cut = truncate_name(full);
    if cut.len() < full.len() {
        warn!("device name truncated to {} bytes", cut.len());
    }
    cut.try_into().ok()
}
