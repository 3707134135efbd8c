//! GATT discovery sequencer.
//!
//! Walks one service -> one characteristic -> its CCCD, strictly in that
//! order. Each stage streams zero or more `*Found` events and ends with
//! exactly one `*Done` event; a stage commits only on its `Done`.
//!
//! ```text
//! start ──► Services ──done(found)──► Characteristics ──done(found)──► Descriptors
//!              │                            │                              │
//!         done(absent)                 done(absent)                CCCD / done
//!              ▼                            ▼                              ▼
//!            Failed                       Failed                         Ready
//! ```

use crate::ble::{BleStack, BleUuid, GattProfile, CCCD_UUID, NOTIFY_ENABLE};
use crate::error::StackError;

/// Handles found so far. Each is only meaningful once the previous one is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GattHandles {
    /// Service start/end handle range.
    pub service: Option<(u16, u16)>,
    /// Characteristic value handle.
    pub value: Option<u16>,
    /// Client Characteristic Configuration Descriptor handle.
    pub cccd: Option<u16>,
}

/// Why discovery ended without reaching Ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Failure {
    ServiceNotFound,
    CharacteristicNotFound,
    Stack(StackError),
}

/// Result of feeding one discovery event to the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    /// More events expected.
    Pending,
    /// The characteristic is usable.
    Ready { notifications: bool },
    Failed(Failure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Services,
    Characteristics,
    Descriptors,
    Complete,
}

pub struct Discovery {
    profile: GattProfile,
    stage: Stage,
    handles: GattHandles,
    notifications: bool,
}

impl Discovery {
    pub fn new(profile: GattProfile) -> Self {
        Self {
            profile,
            stage: Stage::Idle,
            handles: GattHandles::default(),
            notifications: false,
        }
    }

    pub fn handles(&self) -> GattHandles {
        self.handles
    }

    pub fn value_handle(&self) -> Option<u16> {
        self.handles.value
    }

    pub fn notifications(&self) -> bool {
        self.notifications
    }

    /// Notifications were rejected after the fact (CCCD write failed).
    pub fn notifications_rejected(&mut self) {
        self.notifications = false;
    }

    pub fn in_progress(&self) -> bool {
        !matches!(self.stage, Stage::Idle | Stage::Complete)
    }

    /// Forget every handle. Called on disconnect and reset.
    pub fn clear(&mut self) {
        self.stage = Stage::Idle;
        self.handles = GattHandles::default();
        self.notifications = false;
    }

    /// Discover the target service over the full handle range.
    pub fn start<S: BleStack>(&mut self, stack: &mut S, conn: u16) -> Result<(), StackError> {
        self.clear();
        stack.discover_services(conn, &self.profile.service)?;
        self.stage = Stage::Services;
        debug!("Discovering services");
        Ok(())
    }

    pub fn on_service_found(&mut self, uuid: &BleUuid, start: u16, end: u16) {
        if self.stage != Stage::Services || self.handles.service.is_some() {
            return;
        }
        if *uuid == self.profile.service {
            info!("Found service: {}-{}", start, end);
            self.handles.service = Some((start, end));
        }
    }

    pub fn on_service_done<S: BleStack>(&mut self, stack: &mut S, conn: u16) -> Outcome {
        if self.stage != Stage::Services {
            return Outcome::Pending;
        }
        let Some((start, end)) = self.handles.service else {
            self.stage = Stage::Complete;
            error!("Target service not found");
            return Outcome::Failed(Failure::ServiceNotFound);
        };
        if let Err(e) = stack.discover_characteristics(conn, start, end, &self.profile.characteristic) {
            self.stage = Stage::Complete;
            return Outcome::Failed(Failure::Stack(e));
        }
        self.stage = Stage::Characteristics;
        Outcome::Pending
    }

    pub fn on_characteristic_found(&mut self, uuid: &BleUuid, value: u16) {
        if self.stage != Stage::Characteristics || self.handles.value.is_some() {
            return;
        }
        if *uuid == self.profile.characteristic {
            info!("Found characteristic: handle {}", value);
            self.handles.value = Some(value);
        }
    }

    pub fn on_characteristic_done<S: BleStack>(&mut self, stack: &mut S, conn: u16) -> Outcome {
        if self.stage != Stage::Characteristics {
            return Outcome::Pending;
        }
        let Some(value) = self.handles.value else {
            self.stage = Stage::Complete;
            error!("Target characteristic not found");
            return Outcome::Failed(Failure::CharacteristicNotFound);
        };
        // The CCCD sits right after the value handle.
        let Some(end) = value.checked_add(2) else {
            warn!("No room for descriptors after handle {}", value);
            return self.finish(false);
        };
        match stack.discover_descriptors(conn, value, end) {
            Ok(()) => {
                self.stage = Stage::Descriptors;
                Outcome::Pending
            }
            Err(e) => {
                warn!("Descriptor discovery failed: {:?}", e);
                self.finish(false)
            }
        }
    }

    pub fn on_descriptor_found<S: BleStack>(
        &mut self,
        stack: &mut S,
        conn: u16,
        handle: u16,
        uuid: &BleUuid,
    ) -> Outcome {
        if self.stage != Stage::Descriptors || *uuid != CCCD_UUID {
            return Outcome::Pending;
        }
        info!("Found CCCD: handle {}", handle);
        self.handles.cccd = Some(handle);
        match stack.write_descriptor(conn, handle, &NOTIFY_ENABLE) {
            Ok(()) => self.finish(true),
            Err(e) => {
                warn!("Enabling notifications failed: {:?}", e);
                self.finish(false)
            }
        }
    }

    pub fn on_descriptor_done(&mut self) -> Outcome {
        if self.stage != Stage::Descriptors {
            return Outcome::Pending;
        }
        self.finish(false)
    }

    fn finish(&mut self, notifications: bool) -> Outcome {
        self.stage = Stage::Complete;
        self.notifications = notifications;
        Outcome::Ready { notifications }
    }
}
