//! Integration tests for sensorlink host-testable logic.
//!
//! A central [`Client`] runs against a simulated peripheral that
//! advertises with [`AdvertisingPayload`] and serves frames built by
//! the peripheral-side sensor code, so both halves meet on the wire.

use embedded_hal::delay::DelayNs;
use sensorlink::ble::adv_builder::AdvertisingPayload;
use sensorlink::ble::client::Client;
use sensorlink::ble::matcher::Target;
use sensorlink::ble::state::ConnectionState;
use sensorlink::ble::{
    Address, AddressKind, BleStack, BleUuid, Event, CCCD_UUID, NOTIFY_ENABLE,
    SENSOR_RX_CHAR_UUID, SENSOR_SERVICE_UUID, SENSOR_TX_CHAR_UUID,
};
use sensorlink::config::{Config, DEVICE_NAME, READ_INTERVAL_MS};
use sensorlink::driver::{Driver, Phase};
use sensorlink::error::StackError;
use sensorlink::health::Headroom;
use sensorlink::sensor::adc::Sampler;
use sensorlink::sensor::frame::{format_frame, notification_chunk, parse_frame, Field};

const PERIPHERAL: Address =
    Address::new(AddressKind::RandomStatic, [0xC0, 0x5D, 0x89, 0xB1, 0x1E, 0xAA]);
const NO_CONN: u16 = 0xFFFF;

// Attribute table of the simulated sensor service.
const SERVICE: (u16, u16) = (0x0010, 0x0016);
const TX_VALUE: u16 = 0x0012;
const TX_CCCD: u16 = 0x0013;
const RX_VALUE: u16 = 0x0015;

// ═══════════════════════════════════════════════════════════════════════════
// Simulated radio
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
enum Cmd {
    Power(bool),
    Scan,
    StopScan,
    Connect(Address),
    Disconnect(u16),
    Services(u16),
    Characteristics(u16, u16, u16),
    Descriptors(u16, u16, u16),
    Read(u16, u16),
    Write(u16, u16, Vec<u8>),
}

/// Queues commands until the test pumps them into the peripheral.
#[derive(Default)]
struct Radio {
    queued: Vec<Cmd>,
}

impl Radio {
    fn push(&mut self, cmd: Cmd) -> Result<(), StackError> {
        self.queued.push(cmd);
        Ok(())
    }
}

impl BleStack for Radio {
    fn set_active(&mut self, active: bool) -> Result<(), StackError> {
        self.push(Cmd::Power(active))
    }

    fn attach_events(&mut self) -> Result<(), StackError> {
        Ok(())
    }

    fn start_scan(&mut self, _duration_ms: u32) -> Result<(), StackError> {
        self.push(Cmd::Scan)
    }

    fn stop_scan(&mut self) -> Result<(), StackError> {
        self.push(Cmd::StopScan)
    }

    fn connect(&mut self, address: &Address) -> Result<(), StackError> {
        self.push(Cmd::Connect(*address))
    }

    fn disconnect(&mut self, conn: u16) -> Result<(), StackError> {
        self.push(Cmd::Disconnect(conn))
    }

    fn discover_services(&mut self, conn: u16, _uuid: &BleUuid) -> Result<(), StackError> {
        self.push(Cmd::Services(conn))
    }

    fn discover_characteristics(
        &mut self,
        conn: u16,
        start: u16,
        end: u16,
        _uuid: &BleUuid,
    ) -> Result<(), StackError> {
        self.push(Cmd::Characteristics(conn, start, end))
    }

    fn discover_descriptors(&mut self, conn: u16, start: u16, end: u16) -> Result<(), StackError> {
        self.push(Cmd::Descriptors(conn, start, end))
    }

    fn read(&mut self, conn: u16, handle: u16) -> Result<(), StackError> {
        self.push(Cmd::Read(conn, handle))
    }

    fn write_descriptor(&mut self, conn: u16, handle: u16, data: &[u8]) -> Result<(), StackError> {
        self.push(Cmd::Write(conn, handle, data.to_vec()))
    }

    fn write_characteristic(
        &mut self,
        conn: u16,
        handle: u16,
        data: &[u8],
    ) -> Result<(), StackError> {
        self.push(Cmd::Write(conn, handle, data.to_vec()))
    }
}

/// Owned stack event, replayed into the client as [`Event`].
#[derive(Debug, Clone)]
enum Reply {
    Report(Vec<u8>),
    ScanDone,
    Connected(u16),
    Disconnected(u16),
    Service(u16),
    ServiceDone(u16),
    Characteristic(u16, u16, BleUuid),
    CharacteristicDone(u16),
    Descriptor(u16, u16, BleUuid),
    DescriptorDone(u16),
    ReadResult(u16, u16, Vec<u8>),
    ReadDone(u16, u16),
    WriteDone(u16, u16),
    Notify(u16, u16, Vec<u8>),
}

impl Reply {
    fn event(&self) -> Event<'_> {
        match self {
            Reply::Report(data) => Event::ScanResult {
                address: PERIPHERAL,
                rssi: -55,
                data,
            },
            Reply::ScanDone => Event::ScanDone,
            Reply::Connected(conn) => Event::Connected {
                conn: *conn,
                address: PERIPHERAL,
            },
            Reply::Disconnected(conn) => Event::Disconnected {
                conn: *conn,
                address: PERIPHERAL,
            },
            Reply::Service(conn) => Event::ServiceFound {
                conn: *conn,
                start: SERVICE.0,
                end: SERVICE.1,
                uuid: SENSOR_SERVICE_UUID,
            },
            Reply::ServiceDone(conn) => Event::ServiceDone { conn: *conn },
            Reply::Characteristic(conn, value, uuid) => Event::CharacteristicFound {
                conn: *conn,
                end: SERVICE.1,
                value: *value,
                properties: 0x12,
                uuid: *uuid,
            },
            Reply::CharacteristicDone(conn) => Event::CharacteristicDone { conn: *conn },
            Reply::Descriptor(conn, handle, uuid) => Event::DescriptorFound {
                conn: *conn,
                handle: *handle,
                uuid: *uuid,
            },
            Reply::DescriptorDone(conn) => Event::DescriptorDone { conn: *conn },
            Reply::ReadResult(conn, handle, data) => Event::ReadResult {
                conn: *conn,
                handle: *handle,
                data,
            },
            Reply::ReadDone(conn, handle) => Event::ReadDone {
                conn: *conn,
                handle: *handle,
                status: 0,
            },
            Reply::WriteDone(conn, handle) => Event::WriteDone {
                conn: *conn,
                handle: *handle,
                status: 0,
            },
            Reply::Notify(conn, handle, data) => Event::Notify {
                conn: *conn,
                handle: *handle,
                data,
            },
        }
    }
}

/// The sensor peripheral as seen over the air.
struct Peripheral {
    adv_data: AdvertisingPayload,
    scan_data: AdvertisingPayload,
    advertising: bool,
    link: Option<u16>,
    next_conn: u16,
    notifying: bool,
    tx_value: Vec<u8>,
    rx_writes: Vec<Vec<u8>>,
}

impl Peripheral {
    fn new() -> Self {
        let mut adv_data = AdvertisingPayload::advertising().unwrap();
        adv_data.services(&[SENSOR_SERVICE_UUID]).unwrap();
        let mut scan_data = AdvertisingPayload::scan_response();
        scan_data.name(DEVICE_NAME).unwrap();
        Self {
            adv_data,
            scan_data,
            advertising: true,
            link: None,
            next_conn: 1,
            notifying: false,
            tx_value: b"ADC:".to_vec(),
            rx_writes: Vec::new(),
        }
    }

    /// Publish a new frame: update the TX value and notify when subscribed.
    fn publish(&mut self, frame: &str) -> Vec<Reply> {
        self.tx_value = notification_chunk(frame).to_vec();
        match self.link {
            Some(conn) if self.notifying => {
                vec![Reply::Notify(conn, TX_VALUE, self.tx_value.clone())]
            }
            _ => Vec::new(),
        }
    }

    /// The peripheral drops the link on its own.
    fn drop_link(&mut self) -> Vec<Reply> {
        self.notifying = false;
        self.link.take().map(Reply::Disconnected).into_iter().collect()
    }

    fn respond(&mut self, cmd: Cmd) -> Vec<Reply> {
        match cmd {
            Cmd::Power(_) => Vec::new(),
            Cmd::Scan if self.advertising => vec![
                Reply::Report(self.adv_data.as_bytes().to_vec()),
                Reply::Report(self.scan_data.as_bytes().to_vec()),
                Reply::ScanDone,
            ],
            Cmd::Scan | Cmd::StopScan => vec![Reply::ScanDone],
            Cmd::Connect(address) if address == PERIPHERAL && self.advertising => {
                let conn = self.next_conn;
                self.next_conn += 1;
                self.link = Some(conn);
                vec![Reply::Connected(conn)]
            }
            Cmd::Connect(_) => vec![Reply::Disconnected(NO_CONN)],
            Cmd::Disconnect(conn) if self.link == Some(conn) => self.drop_link(),
            Cmd::Disconnect(_) => Vec::new(),
            Cmd::Services(conn) => vec![Reply::Service(conn), Reply::ServiceDone(conn)],
            Cmd::Characteristics(conn, start, end) => {
                let mut replies: Vec<Reply> = [
                    (TX_VALUE, SENSOR_TX_CHAR_UUID),
                    (RX_VALUE, SENSOR_RX_CHAR_UUID),
                ]
                .into_iter()
                .filter(|(value, _)| (start..=end).contains(value))
                .map(|(value, uuid)| Reply::Characteristic(conn, value, uuid))
                .collect();
                replies.push(Reply::CharacteristicDone(conn));
                replies
            }
            Cmd::Descriptors(conn, start, end) => {
                let mut replies = Vec::new();
                if (start..=end).contains(&TX_CCCD) {
                    replies.push(Reply::Descriptor(conn, TX_CCCD, CCCD_UUID));
                }
                replies.push(Reply::DescriptorDone(conn));
                replies
            }
            Cmd::Read(conn, handle) => vec![
                Reply::ReadResult(conn, handle, self.tx_value.clone()),
                Reply::ReadDone(conn, handle),
            ],
            Cmd::Write(conn, handle, data) => {
                if handle == TX_CCCD {
                    self.notifying = data == NOTIFY_ENABLE;
                } else {
                    self.rx_writes.push(data);
                }
                vec![Reply::WriteDone(conn, handle)]
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Harness
// ═══════════════════════════════════════════════════════════════════════════

struct Plenty;

impl Headroom for Plenty {
    fn free(&mut self) -> usize {
        200_000
    }

    fn reclaim(&mut self) {}
}

struct NoDelay;

impl DelayNs for NoDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

type Central = Client<Radio, Plenty, NoDelay>;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn central(target: Target) -> Central {
    init_logger();
    let mut client = Client::new(Radio::default(), Plenty, NoDelay, Config::default(), target);
    client.init(0).unwrap();
    client
}

/// Deliver replies, then keep exchanging commands until the radio is idle.
fn pump(client: &mut Central, peripheral: &mut Peripheral, mut replies: Vec<Reply>, now: u64) {
    loop {
        for reply in replies.drain(..) {
            client.handle_event(&reply.event(), now);
        }
        let queued = std::mem::take(&mut client.stack_mut().queued);
        if queued.is_empty() {
            return;
        }
        for cmd in queued {
            replies.extend(peripheral.respond(cmd));
        }
    }
}

fn step(driver: &mut Driver, client: &mut Central, peripheral: &mut Peripheral, now: u64) {
    driver.step(client, now);
    pump(client, peripheral, Vec::new(), now);
}

fn connected_pair() -> (Driver, Central, Peripheral) {
    let mut client = central(Target::new().with_service(SENSOR_SERVICE_UUID));
    let mut peripheral = Peripheral::new();
    let mut driver = Driver::new();
    step(&mut driver, &mut client, &mut peripheral, 0);
    step(&mut driver, &mut client, &mut peripheral, 100);
    (driver, client, peripheral)
}

// ═══════════════════════════════════════════════════════════════════════════
// Scenarios
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn central_finds_and_subscribes_to_peripheral() {
    let (driver, mut client, peripheral) = connected_pair();

    assert_eq!(client.state(), ConnectionState::Ready);
    assert!(matches!(driver.phase(), Phase::Operating { .. }));
    assert!(client.notifications_enabled());
    assert!(peripheral.notifying);

    let status = client.status();
    assert!(status.target_found);
    assert_eq!(status.device.as_deref(), Some("c0:5d:89:b1:1e:aa"));
    assert_eq!(status.stats.connections, 1);
}

#[test]
fn name_only_target_matches_scan_response() {
    let mut client = central(Target::new().with_name("ADC"));
    let mut peripheral = Peripheral::new();
    let mut driver = Driver::new();
    step(&mut driver, &mut client, &mut peripheral, 0);

    assert!(client.is_ready());
    let device = client.device().unwrap();
    assert_eq!(device.name.as_deref(), Some(DEVICE_NAME));
    // The advertisement was seen first and did not match.
    assert_eq!(client.stats().devices_scanned, 2);
}

#[test]
fn sampled_voltages_arrive_as_notifications() {
    let (_, mut client, mut peripheral) = connected_pair();

    let mut sampler: Sampler<3, 5> = Sampler::new();
    sampler.push(&[1551, 2854, 1054]);
    let frame = format_frame(&sampler.readings());
    assert_eq!(frame.as_str(), "ADC:C1=1.25V;C2=2.30V;C3=0.85V;");

    let replies = peripheral.publish(&frame);
    pump(&mut client, &mut peripheral, replies, 200);

    assert_eq!(client.stats().notifications, 1);
    let fields = parse_frame(client.last_payload()).unwrap();
    // One notification carries 20 bytes; the clipped third field is dropped.
    assert_eq!(fields.as_slice(), &[Field { channel: 1, millivolts: 1250 }]);
}

#[test]
fn driver_reads_on_schedule() {
    let (mut driver, mut client, mut peripheral) = connected_pair();
    peripheral.publish("ADC:C1=3.30V;");

    step(&mut driver, &mut client, &mut peripheral, 200);
    assert_eq!(driver.operations(), 1);
    assert_eq!(client.stats().reads, 1);
    assert_eq!(client.last_payload(), b"ADC:C1=3.30V;");

    step(&mut driver, &mut client, &mut peripheral, 300);
    assert_eq!(client.stats().reads, 1);

    step(&mut driver, &mut client, &mut peripheral, 200 + u64::from(READ_INTERVAL_MS));
    assert_eq!(client.stats().reads, 2);
}

#[test]
fn writes_reach_the_peripheral() {
    let (_, mut client, mut peripheral) = connected_pair();
    client.write(b"PING").unwrap();
    pump(&mut client, &mut peripheral, Vec::new(), 200);
    assert_eq!(peripheral.rx_writes, vec![b"PING".to_vec()]);
    assert_eq!(client.error_count(), 0);
}

#[test]
fn link_loss_is_recovered_by_reconnecting() {
    let (mut driver, mut client, mut peripheral) = connected_pair();

    let replies = peripheral.drop_link();
    pump(&mut client, &mut peripheral, replies, 1_000);
    assert_eq!(client.state(), ConnectionState::Reconnecting);
    assert_eq!(client.retry_count(), 1);

    step(&mut driver, &mut client, &mut peripheral, 1_100);
    assert_eq!(client.state(), ConnectionState::Reconnecting);

    let later = 1_000 + u64::from(Config::default().retry_delay_ms);
    step(&mut driver, &mut client, &mut peripheral, later);
    assert_eq!(client.state(), ConnectionState::Ready);
    assert_eq!(client.retry_count(), 0);
    assert!(peripheral.notifying);

    let stats = client.stats();
    assert_eq!(stats.connections, 2);
    assert_eq!(stats.disconnections, 1);
    assert!(matches!(driver.phase(), Phase::Operating { .. }));
}

#[test]
fn vanished_peripheral_exhausts_retries() {
    let (mut driver, mut client, mut peripheral) = connected_pair();
    peripheral.advertising = false;

    let replies = peripheral.drop_link();
    let mut now = 1_000;
    pump(&mut client, &mut peripheral, replies, now);

    let delay = u64::from(Config::default().retry_delay_ms);
    for _ in 0..Config::default().max_retries {
        now += delay;
        step(&mut driver, &mut client, &mut peripheral, now);
    }
    assert_eq!(client.state(), ConnectionState::Idle);
    assert_eq!(client.retry_count(), Config::default().max_retries);

    step(&mut driver, &mut client, &mut peripheral, now + 1);
    assert_eq!(driver.phase(), Phase::Backoff { since: now + 1 });
}

#[test]
fn explicit_disconnect_does_not_reconnect() {
    let (_, mut client, mut peripheral) = connected_pair();
    client.disconnect().unwrap();
    pump(&mut client, &mut peripheral, Vec::new(), 500);

    assert_eq!(client.state(), ConnectionState::Idle);
    assert!(peripheral.link.is_none());
    assert!(!client.config().auto_reconnect);
}
