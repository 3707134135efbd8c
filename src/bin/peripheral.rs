//! sensorlink peripheral firmware for nRF52840.
//!
//! Samples three analog inputs (P0.02, P0.03, P0.04), averages them and
//! serves the result as text frames on a UART-like GATT service:
//!
//! - **TX** `6E400003-…` (read, notify): latest frame, clipped to one
//!   notification.
//! - **RX** `6E400002-…` (write): accepted and logged.
//!
//! Up to [`MAX_CENTRALS`] centrals are served at once; advertising
//! resumes whenever a slot is free.

#![no_std]
#![no_main]

use core::cell::{Cell, RefCell};
use core::mem;

use defmt::{info, unwrap, warn};
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_futures::select::select;
use embassy_nrf::interrupt::{InterruptExt, Priority};
use embassy_nrf::saadc::{self, ChannelConfig, Gain, Reference, Resolution, Saadc};
use embassy_nrf::{bind_interrupts, interrupt, Peripheral};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::pubsub::PubSubChannel;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Ticker, Timer};
use heapless::Vec;
use nrf_softdevice::ble::{gatt_server, peripheral, Connection};
use nrf_softdevice::{raw, Softdevice};
use panic_probe as _;
use static_cell::StaticCell;

use sensorlink::ble::adv_builder::AdvertisingPayload;
use sensorlink::ble::SENSOR_SERVICE_UUID;
use sensorlink::config::{
    ADC_CHANNELS, ADC_SAMPLES, ADV_INTERVAL_MS, DEVICE_NAME, MAINTENANCE_INTERVAL_MS,
    MAX_CENTRALS, NOTIFY_MAX_LEN, SAMPLE_INTERVAL_MS,
};
use sensorlink::sensor::adc::Sampler;
use sensorlink::sensor::format_uptime;
use sensorlink::sensor::frame::{self, Frame};
use sensorlink::sensor::link::Centrals;

bind_interrupts!(struct Irqs {
    SAADC => saadc::InterruptHandler;
});

#[nrf_softdevice::gatt_service(uuid = "6E400000-B5A3-F393-E0A9-E50E24DCCA9E")]
pub struct SensorService {
    #[characteristic(uuid = "6E400002-B5A3-F393-E0A9-E50E24DCCA9E", write, write_without_response)]
    rx: Vec<u8, NOTIFY_MAX_LEN>,

    #[characteristic(uuid = "6E400003-B5A3-F393-E0A9-E50E24DCCA9E", read, notify)]
    tx: Vec<u8, NOTIFY_MAX_LEN>,
}

#[nrf_softdevice::gatt_server]
pub struct Server {
    sensor: SensorService,
}

/// Latest frames, fanned out to every connection task.
static FRAMES: PubSubChannel<CriticalSectionRawMutex, Frame, 2, MAX_CENTRALS, 1> =
    PubSubChannel::new();

static CENTRALS: Mutex<CriticalSectionRawMutex, RefCell<Centrals<MAX_CENTRALS>>> =
    Mutex::new(RefCell::new(Centrals::new()));

/// Raised when a central leaves, so advertising can resume.
static SLOT_FREED: Signal<CriticalSectionRawMutex, ()> = Signal::new();

#[embassy_executor::task]
async fn softdevice_task(sd: &'static Softdevice) -> ! {
    sd.run().await
}

#[embassy_executor::task]
async fn sampler_task(mut adc: Saadc<'static, ADC_CHANNELS>) -> ! {
    adc.calibrate().await;

    let publisher = FRAMES.immediate_publisher();
    let mut sampler: Sampler<ADC_CHANNELS, ADC_SAMPLES> = Sampler::new();
    let mut ticker = Ticker::every(Duration::from_millis(SAMPLE_INTERVAL_MS));
    let mut last_report = Instant::now();

    loop {
        let mut raw = [0i16; ADC_CHANNELS];
        adc.sample(&mut raw).await;
        if sampler.push(&raw) < ADC_CHANNELS {
            warn!("Discarded out-of-range samples: {}", raw);
        }

        let frame = frame::format_frame(&sampler.readings());
        publisher.publish_immediate(frame.clone());

        if last_report.elapsed() >= Duration::from_millis(MAINTENANCE_INTERVAL_MS) {
            last_report = Instant::now();
            let centrals = CENTRALS.lock(|c| c.borrow().handles().len());
            info!(
                "Uptime {} | centrals {}/{} | {}",
                format_uptime(Instant::now().as_secs()).as_str(),
                centrals,
                MAX_CENTRALS,
                frame.as_str()
            );
        }

        ticker.next().await;
    }
}

#[embassy_executor::task(pool_size = MAX_CENTRALS)]
async fn connection_task(server: &'static Server, conn: Connection) {
    let handle = conn.handle().unwrap_or(u16::MAX);
    if !CENTRALS.lock(|c| c.borrow_mut().on_connect(handle)) {
        return;
    }

    match FRAMES.subscriber() {
        Ok(mut frames) => {
            let notifying = Cell::new(false);

            let gatt = gatt_server::run(&conn, server, |e| match e {
                ServerEvent::Sensor(SensorServiceEvent::TxCccdWrite { notifications }) => {
                    info!("Central {}: notifications {}", handle, notifications);
                    notifying.set(notifications);
                }
                ServerEvent::Sensor(SensorServiceEvent::RxWrite(data)) => {
                    info!("Central {}: received {} bytes", handle, data.len());
                }
            });

            let publish = async {
                loop {
                    let frame = frames.next_message_pure().await;
                    let mut value = Vec::new();
                    let _ = value.extend_from_slice(frame::notification_chunk(&frame));
                    if server.sensor.tx_set(&value).is_err() {
                        warn!("TX value not updated");
                    }
                    if notifying.get() && server.sensor.tx_notify(&conn, &value).is_err() {
                        warn!("Notify to central {} failed", handle);
                    }
                }
            };

            select(gatt, publish).await;
        }
        Err(_) => warn!("No frame subscriber left for central {}", handle),
    }

    CENTRALS.lock(|c| c.borrow_mut().on_disconnect(handle));
    SLOT_FREED.signal(());
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("sensorlink peripheral starting");

    // SoftDevice reserves priorities 0, 1 and 4.
    let mut config = embassy_nrf::config::Config::default();
    config.gpiote_interrupt_priority = Priority::P2;
    config.time_interrupt_priority = Priority::P2;
    let p = embassy_nrf::init(config);

    let sd = enable_softdevice();
    static SERVER: StaticCell<Server> = StaticCell::new();
    let server: &'static Server = SERVER.init(unwrap!(Server::new(sd)));
    spawner.must_spawn(softdevice_task(sd));

    interrupt::SAADC.set_priority(Priority::P3);
    let mut adc_config = saadc::Config::default();
    adc_config.resolution = Resolution::_12BIT;
    let adc = Saadc::new(
        p.SAADC,
        Irqs,
        adc_config,
        [channel(p.P0_02), channel(p.P0_03), channel(p.P0_04)],
    );
    spawner.must_spawn(sampler_task(adc));

    let (adv_data, scan_data) = unwrap!(advertising_payloads());
    let adv_config = peripheral::Config {
        // 0.625 ms units
        interval: ADV_INTERVAL_MS * 1000 / 625,
        ..Default::default()
    };

    loop {
        while !CENTRALS.lock(|c| c.borrow().should_advertise()) {
            SLOT_FREED.wait().await;
        }

        let adv = peripheral::ConnectableAdvertisement::ScannableUndirected {
            adv_data: adv_data.as_bytes(),
            scan_data: scan_data.as_bytes(),
        };
        match peripheral::advertise_connectable(sd, adv, &adv_config).await {
            Ok(conn) => {
                if spawner.spawn(connection_task(server, conn)).is_err() {
                    warn!("No free connection task, dropping link");
                }
            }
            Err(e) => {
                warn!("Advertising failed: {:?}", e);
                Timer::after_secs(1).await;
            }
        }
    }
}

/// Single-ended input over 0..VDD (VDD/4 reference, 1/4 gain).
fn channel<'d>(pin: impl Peripheral<P = impl saadc::Input> + 'd) -> ChannelConfig<'d> {
    let mut ch = ChannelConfig::single_ended(pin);
    ch.reference = Reference::VDD1_4;
    ch.gain = Gain::GAIN1_4;
    ch
}

/// Flags and service UUID in the advertisement, name in the scan response.
fn advertising_payloads(
) -> Result<(AdvertisingPayload, AdvertisingPayload), sensorlink::error::Error> {
    let mut adv = AdvertisingPayload::advertising()?;
    adv.services(&[SENSOR_SERVICE_UUID])?;
    let mut scan = AdvertisingPayload::scan_response();
    scan.name(DEVICE_NAME)?;
    Ok((adv, scan))
}

fn enable_softdevice() -> &'static mut Softdevice {
    let config = nrf_softdevice::Config {
        clock: Some(raw::nrf_clock_lf_cfg_t {
            source: raw::NRF_CLOCK_LF_SRC_RC as u8,
            rc_ctiv: 16,
            rc_temp_ctiv: 2,
            accuracy: raw::NRF_CLOCK_LF_ACCURACY_500_PPM as u8,
        }),
        conn_gap: Some(raw::ble_gap_conn_cfg_t {
            conn_count: MAX_CENTRALS as u8,
            event_length: 24,
        }),
        conn_gatt: Some(raw::ble_gatt_conn_cfg_t { att_mtu: 23 }),
        gatts_attr_tab_size: Some(raw::ble_gatts_cfg_attr_tab_size_t {
            attr_tab_size: raw::BLE_GATTS_ATTR_TAB_SIZE_DEFAULT,
        }),
        gap_role_count: Some(raw::ble_gap_cfg_role_count_t {
            adv_set_count: 1,
            periph_role_count: MAX_CENTRALS as u8,
            central_role_count: 0,
            central_sec_count: 0,
            _bitfield_1: raw::ble_gap_cfg_role_count_t::new_bitfield_1(0),
        }),
        gap_device_name: Some(raw::ble_gap_cfg_device_name_t {
            p_value: DEVICE_NAME.as_ptr() as _,
            current_len: DEVICE_NAME.len() as u16,
            max_len: DEVICE_NAME.len() as u16,
            write_perm: unsafe { mem::zeroed() },
            _bitfield_1: raw::ble_gap_cfg_device_name_t::new_bitfield_1(
                raw::BLE_GATTS_VLOC_STACK as u8,
            ),
        }),
        ..Default::default()
    };

    Softdevice::enable(&config)
}
