//! Host-side fakes for the radio stack, memory metric and delay.

use std::collections::VecDeque;
use std::vec::Vec;

use embedded_hal::delay::DelayNs;

use crate::ble::{Address, BleStack, BleUuid};
use crate::error::StackError;
use crate::health::Headroom;

/// One command as received by [`FakeStack`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetActive(bool),
    AttachEvents,
    StartScan(u32),
    StopScan,
    Connect(Address),
    Disconnect(u16),
    DiscoverServices(u16, BleUuid),
    DiscoverCharacteristics(u16, u16, u16, BleUuid),
    DiscoverDescriptors(u16, u16, u16),
    Read(u16, u16),
    WriteDescriptor(u16, u16, Vec<u8>),
    WriteCharacteristic(u16, u16, Vec<u8>),
}

/// Records every command; fails the ones it was told to.
#[derive(Debug, Default)]
pub struct FakeStack {
    pub commands: Vec<Command>,
    failures: Vec<Command>,
}

impl FakeStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next occurrence of `cmd` with `StackError::Raw(1)`.
    pub fn fail_next(&mut self, cmd: Command) {
        self.failures.push(cmd);
    }

    pub fn last(&self) -> Option<&Command> {
        self.commands.last()
    }

    pub fn count(&self, pred: impl Fn(&Command) -> bool) -> usize {
        self.commands.iter().filter(|c| pred(c)).count()
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    fn issue(&mut self, cmd: Command) -> Result<(), StackError> {
        let failed = match self.failures.iter().position(|f| *f == cmd) {
            Some(i) => {
                self.failures.remove(i);
                true
            }
            None => false,
        };
        self.commands.push(cmd);
        if failed {
            Err(StackError::Raw(1))
        } else {
            Ok(())
        }
    }
}

impl BleStack for FakeStack {
    fn set_active(&mut self, active: bool) -> Result<(), StackError> {
        self.issue(Command::SetActive(active))
    }

    fn attach_events(&mut self) -> Result<(), StackError> {
        self.issue(Command::AttachEvents)
    }

    fn start_scan(&mut self, duration_ms: u32) -> Result<(), StackError> {
        self.issue(Command::StartScan(duration_ms))
    }

    fn stop_scan(&mut self) -> Result<(), StackError> {
        self.issue(Command::StopScan)
    }

    fn connect(&mut self, address: &Address) -> Result<(), StackError> {
        self.issue(Command::Connect(*address))
    }

    fn disconnect(&mut self, conn: u16) -> Result<(), StackError> {
        self.issue(Command::Disconnect(conn))
    }

    fn discover_services(&mut self, conn: u16, uuid: &BleUuid) -> Result<(), StackError> {
        self.issue(Command::DiscoverServices(conn, *uuid))
    }

    fn discover_characteristics(
        &mut self,
        conn: u16,
        start: u16,
        end: u16,
        uuid: &BleUuid,
    ) -> Result<(), StackError> {
        self.issue(Command::DiscoverCharacteristics(conn, start, end, *uuid))
    }

    fn discover_descriptors(&mut self, conn: u16, start: u16, end: u16) -> Result<(), StackError> {
        self.issue(Command::DiscoverDescriptors(conn, start, end))
    }

    fn read(&mut self, conn: u16, handle: u16) -> Result<(), StackError> {
        self.issue(Command::Read(conn, handle))
    }

    fn write_descriptor(&mut self, conn: u16, handle: u16, data: &[u8]) -> Result<(), StackError> {
        self.issue(Command::WriteDescriptor(conn, handle, data.to_vec()))
    }

    fn write_characteristic(
        &mut self,
        conn: u16,
        handle: u16,
        data: &[u8],
    ) -> Result<(), StackError> {
        self.issue(Command::WriteCharacteristic(conn, handle, data.to_vec()))
    }
}

/// Scripted headroom readings. The last reading repeats forever.
#[derive(Debug)]
pub struct FakeMemory {
    readings: VecDeque<usize>,
    pub reclaims: u32,
}

impl FakeMemory {
    pub fn new(readings: &[usize]) -> Self {
        Self {
            readings: readings.iter().copied().collect(),
            reclaims: 0,
        }
    }

    /// Always reports `free` bytes.
    pub fn steady(free: usize) -> Self {
        Self::new(&[free])
    }
}

impl Headroom for FakeMemory {
    fn free(&mut self) -> usize {
        if self.readings.len() > 1 {
            self.readings.pop_front().unwrap_or(0)
        } else {
            self.readings.front().copied().unwrap_or(0)
        }
    }

    fn reclaim(&mut self) {
        self.reclaims += 1;
    }
}

/// Records requested pauses instead of sleeping.
#[derive(Debug, Default)]
pub struct FakeDelay {
    pub pauses_ms: Vec<u32>,
    pub total_ns: u64,
}

impl DelayNs for FakeDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.total_ns += u64::from(ns);
    }

    fn delay_ms(&mut self, ms: u32) {
        self.pauses_ms.push(ms);
        self.total_ns += u64::from(ms) * 1_000_000;
    }
}
