//! Controller for the half-duplex LoRa transceiver.
//!
//! Exactly one task (the relay task) owns the [`Radio`] value, so TX and RX
//! are serialized by construction and no lock is needed. The transceiver's
//! DIO1 packet interrupt completes the pending receive future; TX/RX
//! transitions pass through standby inside the driver's prepare calls.

use embassy_embedded_hal::shared_bus::asynch::spi::SpiDevice;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::Delay;
use esp_hal::gpio::{Input, InputConfig, Level, Output, OutputConfig};
use esp_hal::time::Rate;
use esp_hal::Async;
use log::info;
use lora_phy::iv::GenericSx126xInterfaceVariant;
use lora_phy::mod_params::{Bandwidth, CodingRate, ModulationParams, PacketParams, RadioError, SpreadingFactor};
use lora_phy::sx126x::{self, Sx1262, Sx126x, TcxoCtrlVoltage};
use lora_phy::{LoRa, RxMode};
use static_cell::StaticCell;

use crate::config;

/// Largest packet accepted from the air; comfortably above the biggest
/// frame the codec produces.
pub const RX_BUFFER_LEN: usize = 255;

/// Transceiver wiring: SPI plus the SX126x control lines.
pub struct RadioPins<'a> {
    pub sck: esp_hal::peripherals::GPIO8<'a>,
    pub mosi: esp_hal::peripherals::GPIO9<'a>,
    pub miso: esp_hal::peripherals::GPIO10<'a>,
    pub cs: esp_hal::peripherals::GPIO3<'a>,
    pub rst: esp_hal::peripherals::GPIO18<'a>,
    pub busy: esp_hal::peripherals::GPIO19<'a>,
    pub dio1: esp_hal::peripherals::GPIO1<'a>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Idle,
    Receiving,
    Transmitting,
}

#[derive(Debug)]
pub enum RadioBeginError {
    Spi,
    Radio(RadioError),
}

pub type LoraRadio = LoRa<
    Sx126x<
        SpiDevice<
            'static,
            CriticalSectionRawMutex,
            esp_hal::spi::master::Spi<'static, Async>,
            Output<'static>,
        >,
        GenericSx126xInterfaceVariant<Output<'static>, Input<'static>>,
        Sx1262,
    >,
    Delay,
>;

pub struct Radio {
    lora: LoraRadio,
    state: RadioState,
    modulation: ModulationParams,
    tx_params: PacketParams,
    rx_params: PacketParams,
}

/// Brings the transceiver up with the deployment's fixed modulation:
/// 434 MHz, 500 kHz bandwidth, SF7, CR 4/7, private sync word, +22 dBm,
/// 8-symbol preamble, TCXO supervised by the chip.
pub async fn begin(
    spi_peripheral: esp_hal::peripherals::SPI2<'static>,
    pins: RadioPins<'static>,
) -> Result<Radio, RadioBeginError> {
    let spi = esp_hal::spi::master::Spi::new(
        spi_peripheral,
        esp_hal::spi::master::Config::default().with_frequency(Rate::from_mhz(1)),
    )
    .map_err(|_| RadioBeginError::Spi)?
    .with_sck(pins.sck)
    .with_mosi(pins.mosi)
    .with_miso(pins.miso)
    .into_async();

    let spi_bus = SPI_BUS.init(Mutex::new(spi));
    let cs = Output::new(pins.cs, Level::High, OutputConfig::default());
    let spi_device = SpiDevice::new(spi_bus, cs);

    let reset = Output::new(pins.rst, Level::High, OutputConfig::default());
    let dio1 = Input::new(pins.dio1, InputConfig::default());
    let busy = Input::new(pins.busy, InputConfig::default());

    let sx_config = sx126x::Config {
        chip: Sx1262,
        tcxo_ctrl: Some(TcxoCtrlVoltage::Ctrl1V7),
        use_dcdc: true,
        rx_boost: false,
    };
    let iv = GenericSx126xInterfaceVariant::new(reset, dio1, busy, None, None)
        .map_err(RadioBeginError::Radio)?;

    let mut lora = LoRa::new(Sx126x::new(spi_device, iv, sx_config), false, Delay)
        .await
        .map_err(RadioBeginError::Radio)?;
    lora.init().await.map_err(RadioBeginError::Radio)?;

    let modulation = lora
        .create_modulation_params(
            SpreadingFactor::_7,
            Bandwidth::_500KHz,
            CodingRate::_4_7,
            config::lora::FREQUENCY_HZ,
        )
        .map_err(RadioBeginError::Radio)?;
    let tx_params = lora
        .create_tx_packet_params(config::lora::PREAMBLE_LEN, false, true, false, &modulation)
        .map_err(RadioBeginError::Radio)?;
    let rx_params = lora
        .create_rx_packet_params(
            config::lora::PREAMBLE_LEN,
            false,
            RX_BUFFER_LEN as u8,
            true,
            false,
            &modulation,
        )
        .map_err(RadioBeginError::Radio)?;

    info!("radio up at {} Hz", config::lora::FREQUENCY_HZ);
    Ok(Radio {
        lora,
        state: RadioState::Idle,
        modulation,
        tx_params,
        rx_params,
    })
}

impl Radio {
    /// Arms continuous receive and the packet interrupt.
    pub async fn start_receive(&mut self) -> Result<(), RadioError> {
        self.lora
            .prepare_for_rx(RxMode::Continuous, &self.modulation, &self.rx_params)
            .await?;
        self.state = RadioState::Receiving;
        Ok(())
    }

    /// Resolves with the next packet's length once the packet interrupt
    /// fires. Re-arms receive first if a transmission left the radio idle.
    pub async fn receive(&mut self, buf: &mut [u8]) -> Result<usize, RadioError> {
        if self.state != RadioState::Receiving {
            self.start_receive().await?;
        }
        let (len, _status) = self.lora.rx(&self.rx_params, buf).await?;
        Ok(len as usize)
    }

    /// Transmits `data` and returns the radio to continuous receive.
    ///
    /// Blocks until the transceiver reports completion or the driver-level
    /// TX timeout fires; either way the receive side is re-armed before
    /// returning, so a lost transmission costs nothing but the frame.
    pub async fn try_transmit(&mut self, data: &[u8]) -> Result<(), RadioError> {
        self.state = RadioState::Idle;
        let prepared = self
            .lora
            .prepare_for_tx(
                &self.modulation,
                &mut self.tx_params,
                config::lora::TX_POWER_DBM,
                data,
            )
            .await;
        let sent = match prepared {
            Ok(()) => {
                self.state = RadioState::Transmitting;
                self.lora.tx().await
            }
            Err(e) => Err(e),
        };
        self.state = RadioState::Idle;
        let rearmed = self.start_receive().await;
        sent.and(rearmed)
    }
}

static SPI_BUS: StaticCell<
    Mutex<CriticalSectionRawMutex, esp_hal::spi::master::Spi<'static, Async>>,
> = StaticCell::new();
