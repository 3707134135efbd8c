//! sensorlink central firmware for nRF52840.
//!
//! Scans for the sensor peripheral, connects, subscribes to its TX
//! characteristic and reads it periodically.
//!
//! Architecture:
//! ```text
//!   ┌────────────┐  COMMANDS   ┌────────────┐
//!   │ main loop  │────────────►│ radio_task │◄──► SoftDevice S140
//!   │ Client +   │◄────────────│            │
//!   │ Driver     │   EVENTS    └────────────┘
//!   └────────────┘
//! ```
//!
//! The main loop owns the client and handles one radio event at a time,
//! ticking the driver on every event and every [`POLL_INTERVAL_MS`].

#![no_std]
#![no_main]

mod radio;

use core::mem;

use defmt::{error, info};
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_futures::select::{select, Either};
use embassy_nrf::interrupt::Priority;
use embassy_time::{Delay, Instant, Timer};
use nrf_softdevice::{raw, Softdevice};
use panic_probe as _;

use sensorlink::ble::client::Client;
use sensorlink::ble::matcher::Target;
use sensorlink::ble::SENSOR_SERVICE_UUID;
use sensorlink::config::{Config, DEVICE_NAME, POLL_INTERVAL_MS};
use sensorlink::driver::Driver;
use sensorlink::health::Headroom;

use crate::radio::{radio_task, SoftdeviceStack, EVENTS};

const CENTRAL_NAME: &str = "sensorlink";

extern "C" {
    /// End of statically allocated RAM (provided by cortex-m-rt).
    static __sheap: u8;
}

/// Free RAM between the end of static data and the current stack pointer.
struct StackHeadroom;

impl Headroom for StackHeadroom {
    fn free(&mut self) -> usize {
        let sp = cortex_m::register::msp::read() as usize;
        let heap_start = unsafe { core::ptr::addr_of!(__sheap) as usize };
        sp.saturating_sub(heap_start)
    }

    // Nothing is heap-allocated, so there is nothing to give back.
    fn reclaim(&mut self) {}
}

fn now_ms() -> u64 {
    Instant::now().as_millis()
}

#[embassy_executor::task]
async fn softdevice_task(sd: &'static Softdevice) -> ! {
    sd.run().await
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("sensorlink central starting");

    // SoftDevice reserves priorities 0, 1 and 4.
    let mut config = embassy_nrf::config::Config::default();
    config.gpiote_interrupt_priority = Priority::P2;
    config.time_interrupt_priority = Priority::P2;
    let _p = embassy_nrf::init(config);

    let sd = enable_softdevice();
    spawner.must_spawn(softdevice_task(sd));
    spawner.must_spawn(radio_task(sd));

    let target = Target::new()
        .with_name(DEVICE_NAME)
        .with_service(SENSOR_SERVICE_UUID);
    // Blocking delay: the radio reset pause stalls the executor, which is
    // fine while the radio is down and nothing else has work to do.
    let mut client = Client::new(
        SoftdeviceStack,
        StackHeadroom,
        Delay,
        Config::default(),
        target,
    );

    if let Err(e) = client.init(now_ms()) {
        error!("Client init failed: {:?}", e);
        restart();
    }

    let mut driver = Driver::new();
    loop {
        let tick = Timer::after_millis(POLL_INTERVAL_MS);
        if let Either::First(event) = select(EVENTS.receive(), tick).await {
            client.handle_event(&event.as_event(), now_ms());
        }

        driver.step(&mut client, now_ms());

        if client.restart_required() {
            error!("Radio recovery failed, restarting");
            restart();
        }
    }
}

fn restart() -> ! {
    cortex_m::peripheral::SCB::sys_reset()
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
            conn_count: 1,
            event_length: 24,
        }),
        conn_gatt: Some(raw::ble_gatt_conn_cfg_t { att_mtu: 23 }),
        gatts_attr_tab_size: Some(raw::ble_gatts_cfg_attr_tab_size_t {
            attr_tab_size: raw::BLE_GATTS_ATTR_TAB_SIZE_DEFAULT,
        }),
        gap_role_count: Some(raw::ble_gap_cfg_role_count_t {
            adv_set_count: 1,
            periph_role_count: 0,
            central_role_count: 1,
            central_sec_count: 0,
            _bitfield_1: raw::ble_gap_cfg_role_count_t::new_bitfield_1(0),
        }),
        gap_device_name: Some(raw::ble_gap_cfg_device_name_t {
            p_value: CENTRAL_NAME.as_ptr() as _,
            current_len: CENTRAL_NAME.len() as u16,
            max_len: CENTRAL_NAME.len() as u16,
            write_perm: unsafe { mem::zeroed() },
            _bitfield_1: raw::ble_gap_cfg_device_name_t::new_bitfield_1(
                raw::BLE_GATTS_VLOC_STACK as u8,
            ),
        }),
        ..Default::default()
    };

    Softdevice::enable(&config)
}
