//! SoftDevice glue for the central firmware.
//!
//! [`SoftdeviceStack`] is the [`BleStack`] handed to the client: every
//! command is queued into [`COMMANDS`] and returns immediately. The
//! [`radio_task`] executes them against the SoftDevice and reports the
//! outcome as [`RadioEvent`]s on [`EVENTS`], which the main loop feeds
//! back into the client one at a time.
//!
//! The SoftDevice discovers a whole service in one call, so the results
//! are cached per link and replayed as discrete found/done events when
//! the client asks for characteristics and descriptors.

use core::sync::atomic::{AtomicBool, Ordering};

use defmt::{debug, info, warn};
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{with_timeout, Duration};
use heapless::Vec;
use nrf_softdevice::ble::gatt_client::{self, Characteristic, Descriptor, DiscoverError, HvxType};
use nrf_softdevice::ble::{central, Address as SdAddress, AddressType, Connection, Uuid};
use nrf_softdevice::raw;
use nrf_softdevice::Softdevice;

use sensorlink::ble::{
    Address, AddressKind, BleStack, BleUuid, Event, GattProfile, CCCD_UUID, SENSOR_RX_CHAR_UUID,
};
use sensorlink::config::{CONNECTION_TIMEOUT_MS, MAX_WRITE_LEN};
use sensorlink::error::StackError;

/// Connection handle reported for a connection attempt that never completed.
const NO_CONN: u16 = 0xFFFF;

/// ATT "Unlikely Error", reported when a read or write fails locally.
const ATT_UNLIKELY_ERROR: u16 = 0x000E;

/// Longest legacy advertising / scan response payload.
const ADV_MAX_LEN: usize = 31;

type Payload = Vec<u8, MAX_WRITE_LEN>;

/// Commands queued by [`SoftdeviceStack`].
#[derive(defmt::Format)]
pub enum Command {
    /// Radio powered down; drop any link.
    Deactivate,
    StartScan(u32),
    Connect(Address),
    Disconnect(u16),
    DiscoverServices(u16),
    DiscoverCharacteristics { conn: u16, start: u16, end: u16 },
    DiscoverDescriptors { conn: u16, start: u16, end: u16 },
    Read { conn: u16, handle: u16 },
    Write { conn: u16, handle: u16, data: Payload },
}

/// Owned counterpart of [`Event`], so it can cross the channel.
#[derive(Clone, defmt::Format)]
pub enum RadioEvent {
    ScanResult {
        address: Address,
        rssi: i8,
        data: Vec<u8, ADV_MAX_LEN>,
    },
    ScanDone,
    Connected { conn: u16, address: Address },
    Disconnected { conn: u16, address: Address },
    ServiceFound { conn: u16, start: u16, end: u16, uuid: BleUuid },
    ServiceDone { conn: u16 },
    CharacteristicFound { conn: u16, end: u16, value: u16, uuid: BleUuid },
    CharacteristicDone { conn: u16 },
    DescriptorFound { conn: u16, handle: u16, uuid: BleUuid },
    DescriptorDone { conn: u16 },
    ReadResult { conn: u16, handle: u16, data: Payload },
    ReadDone { conn: u16, handle: u16, status: u16 },
    WriteDone { conn: u16, handle: u16, status: u16 },
    Notify { conn: u16, handle: u16, data: Payload },
}

impl RadioEvent {
    pub fn as_event(&self) -> Event<'_> {
        match self {
            RadioEvent::ScanResult {
                address,
                rssi,
                data,
            } => Event::ScanResult {
                address: *address,
                rssi: *rssi,
                data,
            },
            RadioEvent::ScanDone => Event::ScanDone,
            RadioEvent::Connected { conn, address } => Event::Connected {
                conn: *conn,
                address: *address,
            },
            RadioEvent::Disconnected { conn, address } => Event::Disconnected {
                conn: *conn,
                address: *address,
            },
            RadioEvent::ServiceFound {
                conn,
                start,
                end,
                uuid,
            } => Event::ServiceFound {
                conn: *conn,
                start: *start,
                end: *end,
                uuid: *uuid,
            },
            RadioEvent::ServiceDone { conn } => Event::ServiceDone { conn: *conn },
            RadioEvent::CharacteristicFound {
                conn,
                end,
                value,
                uuid,
            } => Event::CharacteristicFound {
                conn: *conn,
                end: *end,
                value: *value,
                // Not needed by the client.
                properties: 0,
                uuid: *uuid,
            },
            RadioEvent::CharacteristicDone { conn } => Event::CharacteristicDone { conn: *conn },
            RadioEvent::DescriptorFound { conn, handle, uuid } => Event::DescriptorFound {
                conn: *conn,
                handle: *handle,
                uuid: *uuid,
            },
            RadioEvent::DescriptorDone { conn } => Event::DescriptorDone { conn: *conn },
            RadioEvent::ReadResult { conn, handle, data } => Event::ReadResult {
                conn: *conn,
                handle: *handle,
                data,
            },
            RadioEvent::ReadDone {
                conn,
                handle,
                status,
            } => Event::ReadDone {
                conn: *conn,
                handle: *handle,
                status: *status,
            },
            RadioEvent::WriteDone {
                conn,
                handle,
                status,
            } => Event::WriteDone {
                conn: *conn,
                handle: *handle,
                status: *status,
            },
            RadioEvent::Notify { conn, handle, data } => Event::Notify {
                conn: *conn,
                handle: *handle,
                data,
            },
        }
    }
}

pub static COMMANDS: Channel<CriticalSectionRawMutex, Command, 8> = Channel::new();
pub static EVENTS: Channel<CriticalSectionRawMutex, RadioEvent, 16> = Channel::new();

/// Radio enabled; commands are refused while cleared.
static ACTIVE: AtomicBool = AtomicBool::new(false);

/// Set to end the running scan at the next advertisement.
static SCAN_STOP: AtomicBool = AtomicBool::new(false);

// ═══════════════════════════════════════════════════════════════════════════
// Stack facade
// ═══════════════════════════════════════════════════════════════════════════

pub struct SoftdeviceStack;

impl SoftdeviceStack {
    fn queue(&mut self, command: Command) -> Result<(), StackError> {
        if !ACTIVE.load(Ordering::Acquire) {
            return Err(StackError::NotActive);
        }
        COMMANDS.try_send(command).map_err(|_| StackError::Busy)
    }
}

impl BleStack for SoftdeviceStack {
    fn set_active(&mut self, active: bool) -> Result<(), StackError> {
        ACTIVE.store(active, Ordering::Release);
        if !active {
            SCAN_STOP.store(true, Ordering::Release);
            COMMANDS
                .try_send(Command::Deactivate)
                .map_err(|_| StackError::Busy)?;
        }
        Ok(())
    }

    fn attach_events(&mut self) -> Result<(), StackError> {
        EVENTS.clear();
        Ok(())
    }

    fn start_scan(&mut self, duration_ms: u32) -> Result<(), StackError> {
        SCAN_STOP.store(false, Ordering::Release);
        self.queue(Command::StartScan(duration_ms))
    }

    fn stop_scan(&mut self) -> Result<(), StackError> {
        SCAN_STOP.store(true, Ordering::Release);
        Ok(())
    }

    fn connect(&mut self, address: &Address) -> Result<(), StackError> {
        self.queue(Command::Connect(*address))
    }

    fn disconnect(&mut self, conn: u16) -> Result<(), StackError> {
        self.queue(Command::Disconnect(conn))
    }

    fn discover_services(&mut self, conn: u16, _uuid: &BleUuid) -> Result<(), StackError> {
        self.queue(Command::DiscoverServices(conn))
    }

    fn discover_characteristics(
        &mut self,
        conn: u16,
        start: u16,
        end: u16,
        _uuid: &BleUuid,
    ) -> Result<(), StackError> {
        self.queue(Command::DiscoverCharacteristics { conn, start, end })
    }

    fn discover_descriptors(&mut self, conn: u16, start: u16, end: u16) -> Result<(), StackError> {
        self.queue(Command::DiscoverDescriptors { conn, start, end })
    }

    fn read(&mut self, conn: u16, handle: u16) -> Result<(), StackError> {
        self.queue(Command::Read { conn, handle })
    }

    fn write_descriptor(&mut self, conn: u16, handle: u16, data: &[u8]) -> Result<(), StackError> {
        self.write_characteristic(conn, handle, data)
    }

    fn write_characteristic(
        &mut self,
        conn: u16,
        handle: u16,
        data: &[u8],
    ) -> Result<(), StackError> {
        let data =
            Payload::from_slice(data).map_err(|_| StackError::Raw(raw::NRF_ERROR_DATA_SIZE))?;
        self.queue(Command::Write { conn, handle, data })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════

fn from_sd_address(addr: &SdAddress) -> Address {
    let mut bytes = addr.bytes();
    bytes.reverse();
    Address::new(AddressKind::from_raw(addr.address_type() as u8), bytes)
}

fn to_sd_address(addr: &Address) -> SdAddress {
    let kind = match addr.kind {
        AddressKind::Public => AddressType::Public,
        AddressKind::RandomStatic => AddressType::RandomStatic,
        AddressKind::RandomPrivateResolvable => AddressType::RandomPrivateResolvable,
        AddressKind::RandomPrivateNonResolvable => AddressType::RandomPrivateNonResolvable,
    };
    let mut bytes = addr.bytes;
    bytes.reverse();
    SdAddress::new(kind, bytes)
}

fn to_sd_uuid(uuid: &BleUuid) -> Uuid {
    match uuid {
        BleUuid::Uuid16(v) => Uuid::new_16(*v),
        BleUuid::Uuid128(_) => Uuid::new_128(&uuid.to_le_bytes()),
    }
}

fn emit(event: RadioEvent) {
    if EVENTS.try_send(event).is_err() {
        warn!("Event queue full, dropping event");
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// GATT client
// ═══════════════════════════════════════════════════════════════════════════

/// Discovery cache of the sensor service, doubling as the notification sink.
struct LinkClient {
    /// Lowest and highest attribute handle seen.
    span: Option<(u16, u16)>,
    characteristics: Vec<(u16, BleUuid), 4>,
    descriptors: Vec<(u16, BleUuid), 4>,
}

struct Notification {
    handle: u16,
    data: Payload,
}

impl LinkClient {
    fn widen(&mut self, handle: u16) {
        self.span = Some(match self.span {
            Some((lo, hi)) => (lo.min(handle), hi.max(handle)),
            None => (handle, handle),
        });
    }

    /// Service declaration precedes the first characteristic declaration.
    fn service_range(&self) -> Option<(u16, u16)> {
        self.span.map(|(lo, hi)| (lo.saturating_sub(1).max(1), hi))
    }
}

impl gatt_client::Client for LinkClient {
    type Event = Notification;

    fn on_hvx(
        &self,
        _conn: &Connection,
        type_: HvxType,
        handle: u16,
        data: &[u8],
    ) -> Option<Self::Event> {
        if !matches!(type_, HvxType::Notification) {
            return None;
        }
        let mut payload = Payload::new();
        let len = data.len().min(MAX_WRITE_LEN);
        let _ = payload.extend_from_slice(&data[..len]);
        Some(Notification {
            handle,
            data: payload,
        })
    }

    fn uuid() -> Uuid {
        to_sd_uuid(&GattProfile::default().service)
    }

    fn new_undiscovered(_conn: Connection) -> Self {
        Self {
            span: None,
            characteristics: Vec::new(),
            descriptors: Vec::new(),
        }
    }

    fn discovered_characteristic(
        &mut self,
        characteristic: &Characteristic,
        descriptors: &[Descriptor],
    ) {
        self.widen(characteristic.handle_decl);
        self.widen(characteristic.handle_value);
        for d in descriptors {
            self.widen(d.handle);
        }

        let profile = GattProfile::default();
        let known = [profile.characteristic, SENSOR_RX_CHAR_UUID];
        let Some(uuid) = characteristic
            .uuid
            .and_then(|u| known.iter().find(|k| to_sd_uuid(k) == u).copied())
        else {
            return;
        };
        let _ = self.characteristics.push((characteristic.handle_value, uuid));

        if uuid == profile.characteristic {
            let cccd = to_sd_uuid(&CCCD_UUID);
            for d in descriptors.iter().filter(|d| d.uuid == Some(cccd)) {
                let _ = self.descriptors.push((d.handle, CCCD_UUID));
            }
        }
    }

    fn discovery_complete(&mut self) -> Result<(), DiscoverError> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Radio task
// ═══════════════════════════════════════════════════════════════════════════

#[embassy_executor::task]
pub async fn radio_task(sd: &'static Softdevice) -> ! {
    loop {
        match COMMANDS.receive().await {
            Command::StartScan(duration_ms) => scan(sd, duration_ms).await,
            Command::Connect(address) => match connect(sd, &address).await {
                Some(conn) => serve_link(conn, address).await,
                None => emit(RadioEvent::Disconnected {
                    conn: NO_CONN,
                    address,
                }),
            },
            other => debug!("Ignoring {} without a link", other),
        }
    }
}

async fn scan(sd: &Softdevice, duration_ms: u32) {
    info!("BLE scan starting ({} ms window)", duration_ms);

    let config = central::ScanConfig {
        // Active scan to retrieve scan-response data (device names).
        active: true,
        ..Default::default()
    };

    let scanning = central::scan(sd, &config, |params| {
        if SCAN_STOP.load(Ordering::Acquire) {
            return Some(());
        }
        let data =
            unsafe { core::slice::from_raw_parts(params.data.p_data, params.data.len as usize) };
        let mut adv = Vec::new();
        let _ = adv.extend_from_slice(&data[..data.len().min(ADV_MAX_LEN)]);
        emit(RadioEvent::ScanResult {
            address: from_sd_address(&SdAddress::from_raw(params.peer_addr)),
            rssi: params.rssi,
            data: adv,
        });
        None
    });

    match with_timeout(Duration::from_millis(u64::from(duration_ms)), scanning).await {
        Ok(Err(e)) => warn!("BLE scan ended with error: {:?}", e),
        Ok(Ok(())) => debug!("BLE scan stopped"),
        Err(_) => debug!("BLE scan window elapsed"),
    }
    emit(RadioEvent::ScanDone);
}

async fn connect(sd: &Softdevice, address: &Address) -> Option<Connection> {
    let target = to_sd_address(address);
    let whitelist = [&target];
    let config = central::ConnectConfig {
        scan_config: central::ScanConfig {
            whitelist: Some(&whitelist),
            ..Default::default()
        },
        conn_params: raw::ble_gap_conn_params_t {
            min_conn_interval: 24,
            max_conn_interval: 40,
            slave_latency: 0,
            conn_sup_timeout: 400,
        },
        ..Default::default()
    };

    let timeout = Duration::from_millis(u64::from(CONNECTION_TIMEOUT_MS));
    match with_timeout(timeout, central::connect(sd, &config)).await {
        Ok(Ok(conn)) => Some(conn),
        Ok(Err(e)) => {
            warn!("Connect failed: {:?}", e);
            None
        }
        Err(_) => {
            warn!("Connect timed out");
            None
        }
    }
}

/// Serve one link until it drops or the client disconnects it.
async fn serve_link(conn: Connection, address: Address) {
    let handle = conn.handle().unwrap_or(NO_CONN);
    EVENTS.send(RadioEvent::Connected { conn: handle, address }).await;

    let sink = LinkClient::new_undiscovered(conn.clone());
    let notifications = gatt_client::run(&conn, &sink, |n: Notification| {
        emit(RadioEvent::Notify {
            conn: handle,
            handle: n.handle,
            data: n.data,
        })
    });

    match select(notifications, serve_commands(&conn, handle)).await {
        Either::First(_) => info!("Link {} dropped", handle),
        Either::Second(()) => info!("Link {} closed", handle),
    }
    EVENTS.send(RadioEvent::Disconnected { conn: handle, address }).await;
}

async fn serve_commands(conn: &Connection, handle: u16) {
    let mut cache: Option<LinkClient> = None;

    loop {
        match COMMANDS.receive().await {
            Command::Deactivate => {
                let _ = conn.disconnect();
                return;
            }
            Command::Disconnect(c) if c == handle => {
                let _ = conn.disconnect();
                return;
            }
            Command::DiscoverServices(c) if c == handle => {
                cache = match gatt_client::discover::<LinkClient>(conn).await {
                    Ok(client) => Some(client),
                    Err(e) => {
                        warn!("Service discovery failed: {:?}", e);
                        None
                    }
                };
                if let Some((start, end)) = cache.as_ref().and_then(LinkClient::service_range) {
                    EVENTS
                        .send(RadioEvent::ServiceFound {
                            conn: handle,
                            start,
                            end,
                            uuid: GattProfile::default().service,
                        })
                        .await;
                }
                EVENTS.send(RadioEvent::ServiceDone { conn: handle }).await;
            }
            Command::DiscoverCharacteristics { conn: c, start, end } if c == handle => {
                if let Some(client) = cache.as_ref() {
                    for (value, uuid) in client
                        .characteristics
                        .iter()
                        .filter(|(v, _)| (start..=end).contains(v))
                    {
                        EVENTS
                            .send(RadioEvent::CharacteristicFound {
                                conn: handle,
                                end,
                                value: *value,
                                uuid: *uuid,
                            })
                            .await;
                    }
                }
                EVENTS.send(RadioEvent::CharacteristicDone { conn: handle }).await;
            }
            Command::DiscoverDescriptors { conn: c, start, end } if c == handle => {
                if let Some(client) = cache.as_ref() {
                    for (d, uuid) in client
                        .descriptors
                        .iter()
                        .filter(|(d, _)| (start..=end).contains(d))
                    {
                        EVENTS
                            .send(RadioEvent::DescriptorFound {
                                conn: handle,
                                handle: *d,
                                uuid: *uuid,
                            })
                            .await;
                    }
                }
                EVENTS.send(RadioEvent::DescriptorDone { conn: handle }).await;
            }
            Command::Read { conn: c, handle: attr } if c == handle => {
                let mut buf = [0u8; MAX_WRITE_LEN];
                let status = match gatt_client::read(conn, attr, &mut buf).await {
                    Ok(len) => {
                        let mut data = Payload::new();
                        let _ = data.extend_from_slice(&buf[..len.min(MAX_WRITE_LEN)]);
                        EVENTS
                            .send(RadioEvent::ReadResult {
                                conn: handle,
                                handle: attr,
                                data,
                            })
                            .await;
                        0
                    }
                    Err(e) => {
                        warn!("Read of {} failed: {:?}", attr, e);
                        ATT_UNLIKELY_ERROR
                    }
                };
                EVENTS
                    .send(RadioEvent::ReadDone {
                        conn: handle,
                        handle: attr,
                        status,
                    })
                    .await;
            }
            Command::Write {
                conn: c,
                handle: attr,
                data,
            } if c == handle => {
                let status = match gatt_client::write(conn, attr, &data).await {
                    Ok(()) => 0,
                    Err(e) => {
                        warn!("Write to {} failed: {:?}", attr, e);
                        ATT_UNLIKELY_ERROR
                    }
                };
                EVENTS
                    .send(RadioEvent::WriteDone {
                        conn: handle,
                        handle: attr,
                        status,
                    })
                    .await;
            }
            other => debug!("Ignoring {} on link {}", other, handle),
        }
    }
}
