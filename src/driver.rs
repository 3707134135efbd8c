//! Application driver: scan, wait for the link, then read periodically.
//!
//! ```text
//!   Start ──scan──► AwaitReady ──ready──► Operating ──read every 2 s──┐
//!     ▲                 │                     │  ▲                    │
//!     │            not found /            abandoned│ reconnecting ────┘
//!     │            timed out                  │
//!     └──── Backoff (5 s) ◄───────────────────┘
//! ```
//!
//! [`Driver::step`] is called from the main loop after every event and
//! on every poll tick. It never blocks.

use embedded_hal::delay::DelayNs;

use crate::ble::client::Client;
use crate::ble::state::ConnectionState;
use crate::ble::BleStack;
use crate::config::{READ_INTERVAL_MS, RESCAN_DELAY_MS, SCAN_GRACE_MS, STATUS_EVERY_OPS};
use crate::health::Headroom;
use crate::sensor::frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    Start,
    AwaitReady { since: u64 },
    Operating { last_read: Option<u64> },
    Backoff { since: u64 },
}

pub struct Driver {
    phase: Phase,
    operations: u32,
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver {
    pub const fn new() -> Self {
        Self {
            phase: Phase::Start,
            operations: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Reads issued so far.
    pub fn operations(&self) -> u32 {
        self.operations
    }

    pub fn step<S, M, D>(&mut self, client: &mut Client<S, M, D>, now_ms: u64)
    where
        S: BleStack,
        M: Headroom,
        D: DelayNs,
    {
        client.poll(now_ms);

        self.phase = match self.phase {
            Phase::Start => match client.scan(now_ms) {
                Ok(()) => Phase::AwaitReady { since: now_ms },
                Err(e) => {
                    warn!("Scan not started: {:?}", e);
                    Phase::Backoff { since: now_ms }
                }
            },

            Phase::AwaitReady { since } => {
                let deadline =
                    u64::from(client.config().scan_duration_ms) + u64::from(SCAN_GRACE_MS);
                if client.is_ready() {
                    self.report_ready(client);
                    Phase::Operating { last_read: None }
                } else if matches!(
                    client.state(),
                    ConnectionState::Idle | ConnectionState::Error
                ) {
                    warn!(
                        "Target not found ({} devices scanned)",
                        client.stats().devices_scanned
                    );
                    Phase::Backoff { since: now_ms }
                } else if now_ms.saturating_sub(since) > deadline {
                    warn!("Target not ready in time");
                    client.reset(now_ms);
                    Phase::Backoff { since: now_ms }
                } else {
                    self.phase
                }
            }

            Phase::Operating { last_read } => {
                if client.is_ready() {
                    let due = last_read
                        .map_or(true, |t| now_ms.saturating_sub(t) >= u64::from(READ_INTERVAL_MS));
                    if due {
                        self.operate(client, now_ms);
                        Phase::Operating {
                            last_read: Some(now_ms),
                        }
                    } else {
                        self.phase
                    }
                } else {
                    match client.state() {
                        ConnectionState::Idle | ConnectionState::Error => {
                            warn!("Link lost, rescanning in {} ms", RESCAN_DELAY_MS);
                            Phase::Backoff { since: now_ms }
                        }
                        // Automatic reconnection in progress.
                        _ => self.phase,
                    }
                }
            }

            Phase::Backoff { since } => {
                if now_ms.saturating_sub(since) >= u64::from(RESCAN_DELAY_MS) {
                    Phase::Start
                } else {
                    self.phase
                }
            }
        };
    }

    fn operate<S, M, D>(&mut self, client: &mut Client<S, M, D>, now_ms: u64)
    where
        S: BleStack,
        M: Headroom,
        D: DelayNs,
    {
        self.operations = self.operations.wrapping_add(1);

        if let Some(fields) = frame::parse_frame(client.last_payload()) {
            for f in fields.iter() {
                info!("C{} = {} mV", f.channel, f.millivolts);
            }
        } else if let Some(value) = client.last_value() {
            info!("Last value: {}", value);
        }

        if self.operations % STATUS_EVERY_OPS == 0 {
            let status = client.status();
            info!(
                "Free: {} | Notifications: {} | Errors: {}",
                status.health.free,
                status.stats.notifications,
                status.stats.errors
            );
        }

        if let Err(e) = client.read(now_ms) {
            warn!("Read failed: {:?}", e);
        }
    }

    fn report_ready<S, M, D>(&self, client: &mut Client<S, M, D>)
    where
        S: BleStack,
        M: Headroom,
        D: DelayNs,
    {
        let status = client.status();
        info!(
            "Client ready: {:?} | free {} | {} devices scanned",
            status.device.as_deref(),
            status.health.free,
            status.stats.devices_scanned
        );
    }
}
