//! Bluetooth Low Energy subsystem.
//!
//! The central side is a single-threaded, event-driven client:
//!
//! 1. **Advertisement parser / matcher** - decodes advertising data and
//!    decides whether a scanned peripheral is the configured target.
//! 2. **Client** - owns the connection state machine, reacts to stack
//!    events and issues the next stack command.
//! 3. **Discovery** - walks service -> characteristic -> descriptor and
//!    enables notifications on the target characteristic.
//!
//! The radio itself sits behind [`BleStack`] (commands) and [`Event`]
//! (results), so everything here runs unchanged on the host.

pub mod adv_builder;
pub mod adv_parser;
pub mod client;
pub mod discovery;
pub mod matcher;
pub mod state;


use core::fmt::{self, Write};

use heapless::String;
use uuid::Uuid;

use crate::error::StackError;

/// Bluetooth base UUID (`00000000-0000-1000-8000-00805F9B34FB`).
const BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;

/// Client Characteristic Configuration Descriptor.
pub const CCCD_UUID: BleUuid = BleUuid::from_u16(0x2902);

/// CCCD value that enables notifications (little-endian 1).
pub const NOTIFY_ENABLE: [u8; 2] = 1u16.to_le_bytes();

/// UART-like sensor service exposed by the peripheral.
pub const SENSOR_SERVICE_UUID: BleUuid = BleUuid::from_u128(0x6E400000_B5A3_F393_E0A9_E50E24DCCA9E);

/// Sensor RX characteristic (central -> peripheral writes).
pub const SENSOR_RX_CHAR_UUID: BleUuid = BleUuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);

/// Sensor TX characteristic (peripheral -> central reads/notifications).
pub const SENSOR_TX_CHAR_UUID: BleUuid = BleUuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

/// Colon-separated lowercase hex address, e.g. `c0:5d:89:b1:1e:aa`.
pub type AddressString = String<17>;

// ═══════════════════════════════════════════════════════════════════════════
// UUIDs
// ═══════════════════════════════════════════════════════════════════════════

/// A GATT UUID in either its 16-bit or full 128-bit form.
///
/// Equality compares the expanded 128-bit value, so a 16-bit UUID equals
/// its base-UUID expansion.
#[derive(Clone, Copy, Debug)]
pub enum BleUuid {
    Uuid16(u16),
    Uuid128(Uuid),
}

impl BleUuid {
    pub const fn from_u16(value: u16) -> Self {
        BleUuid::Uuid16(value)
    }

    pub const fn from_u128(value: u128) -> Self {
        BleUuid::Uuid128(Uuid::from_u128(value))
    }

    /// Build from 16 bytes in on-air (little-endian) order.
    pub fn from_le_bytes(bytes: [u8; 16]) -> Self {
        Self::from_u128(u128::from_le_bytes(bytes))
    }

    /// Expanded 128-bit value.
    pub const fn as_u128(&self) -> u128 {
        match self {
            BleUuid::Uuid16(v) => BASE_UUID | ((*v as u128) << 96),
            BleUuid::Uuid128(u) => u.as_u128(),
        }
    }

    /// 128-bit value in on-air (little-endian) order.
    pub const fn to_le_bytes(&self) -> [u8; 16] {
        self.as_u128().to_le_bytes()
    }
}

impl PartialEq for BleUuid {
    fn eq(&self, other: &Self) -> bool {
        self.as_u128() == other.as_u128()
    }
}

impl Eq for BleUuid {}

impl fmt::Display for BleUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BleUuid::Uuid16(v) => write!(f, "0x{:04x}", v),
            BleUuid::Uuid128(u) => write!(f, "{}", u),
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for BleUuid {
    fn format(&self, f: defmt::Formatter) {
        match self {
            BleUuid::Uuid16(v) => defmt::write!(f, "0x{=u16:04x}", v),
            BleUuid::Uuid128(u) => defmt::write!(f, "{=u128:032x}", u.as_u128()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Addresses & devices
// ═══════════════════════════════════════════════════════════════════════════

/// Address type as reported by the stack (Bluetooth Core, Vol 6, Part B, 1.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddressKind {
    Public,
    RandomStatic,
    RandomPrivateResolvable,
    RandomPrivateNonResolvable,
}

impl AddressKind {
    /// Unknown codes are treated as random static.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => AddressKind::Public,
            2 => AddressKind::RandomPrivateResolvable,
            3 => AddressKind::RandomPrivateNonResolvable,
            _ => AddressKind::RandomStatic,
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            AddressKind::Public => 0,
            AddressKind::RandomStatic => 1,
            AddressKind::RandomPrivateResolvable => 2,
            AddressKind::RandomPrivateNonResolvable => 3,
        }
    }
}

/// BLE device address. `bytes` are in display order (most significant first).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Address {
    pub kind: AddressKind,
    pub bytes: [u8; 6],
}

impl Address {
    pub const fn new(kind: AddressKind, bytes: [u8; 6]) -> Self {
        Self { kind, bytes }
    }

    /// Format as `aa:bb:cc:dd:ee:ff`.
    pub fn to_hex_string(&self) -> AddressString {
        let mut s = AddressString::new();
        for (i, b) in self.bytes.iter().enumerate() {
            if i > 0 {
                let _ = s.push(':');
            }
            let _ = write!(s, "{:02x}", b);
        }
        s
    }
}

/// The one peripheral retained from a successful scan match.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DiscoveredDevice {
    pub address: Address,
    /// Received Signal Strength Indicator (dBm).
    pub rssi: i8,
    /// Advertised name (truncated to 32 bytes for `heapless::String`).
    pub name: Option<String<32>>,
    pub address_str: AddressString,
}

/// Service and characteristic walked during GATT discovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GattProfile {
    pub service: BleUuid,
    pub characteristic: BleUuid,
}

impl Default for GattProfile {
    fn default() -> Self {
        Self {
            service: SENSOR_SERVICE_UUID,
            characteristic: SENSOR_TX_CHAR_UUID,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Stack interface
// ═══════════════════════════════════════════════════════════════════════════

/// Events delivered by the radio stack, one at a time, in arrival order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event<'a> {
    ScanResult {
        address: Address,
        rssi: i8,
        data: &'a [u8],
    },
    ScanDone,
    Connected {
        conn: u16,
        address: Address,
    },
    Disconnected {
        conn: u16,
        address: Address,
    },
    ServiceFound {
        conn: u16,
        start: u16,
        end: u16,
        uuid: BleUuid,
    },
    ServiceDone {
        conn: u16,
    },
    CharacteristicFound {
        conn: u16,
        end: u16,
        value: u16,
        properties: u8,
        uuid: BleUuid,
    },
    CharacteristicDone {
        conn: u16,
    },
    DescriptorFound {
        conn: u16,
        handle: u16,
        uuid: BleUuid,
    },
    DescriptorDone {
        conn: u16,
    },
    ReadResult {
        conn: u16,
        handle: u16,
        data: &'a [u8],
    },
    ReadDone {
        conn: u16,
        handle: u16,
        status: u16,
    },
    WriteDone {
        conn: u16,
        handle: u16,
        status: u16,
    },
    Notify {
        conn: u16,
        handle: u16,
        data: &'a [u8],
    },
}

impl Event<'_> {
    /// Connection handle carried by GATT-level events.
    pub fn gatt_conn(&self) -> Option<u16> {
        match self {
            Event::ServiceFound { conn, .. }
            | Event::ServiceDone { conn }
            | Event::CharacteristicFound { conn, .. }
            | Event::CharacteristicDone { conn }
            | Event::DescriptorFound { conn, .. }
            | Event::DescriptorDone { conn }
            | Event::ReadResult { conn, .. }
            | Event::ReadDone { conn, .. }
            | Event::WriteDone { conn, .. }
            | Event::Notify { conn, .. } => Some(*conn),
            Event::ScanResult { .. }
            | Event::ScanDone
            | Event::Connected { .. }
            | Event::Disconnected { .. } => None,
        }
    }
}

/// Command surface of the radio stack.
///
/// Every command is fire-and-forget: `Ok` means the stack accepted it,
/// and the outcome arrives later as an [`Event`].
pub trait BleStack {
    /// Power the radio up or down.
    fn set_active(&mut self, active: bool) -> Result<(), StackError>;

    /// (Re)attach event delivery to the client.
    fn attach_events(&mut self) -> Result<(), StackError>;

    fn start_scan(&mut self, duration_ms: u32) -> Result<(), StackError>;

    fn stop_scan(&mut self) -> Result<(), StackError>;

    fn connect(&mut self, address: &Address) -> Result<(), StackError>;

    fn disconnect(&mut self, conn: u16) -> Result<(), StackError>;

    fn discover_services(&mut self, conn: u16, uuid: &BleUuid) -> Result<(), StackError>;

    fn discover_characteristics(
        &mut self,
        conn: u16,
        start: u16,
        end: u16,
        uuid: &BleUuid,
    ) -> Result<(), StackError>;

    fn discover_descriptors(&mut self, conn: u16, start: u16, end: u16) -> Result<(), StackError>;

    fn read(&mut self, conn: u16, handle: u16) -> Result<(), StackError>;

    fn write_descriptor(&mut self, conn: u16, handle: u16, data: &[u8]) -> Result<(), StackError>;

    fn write_characteristic(&mut self, conn: u16, handle: u16, data: &[u8])
        -> Result<(), StackError>;
}
