//! Library interface for sensorlink.
//!
//! Holds everything that does not touch hardware, so it runs and is
//! tested on the host:
//!
//! - [`ble`]: advertisement parsing and building, target matching, the
//!   central client state machine and GATT discovery.
//! - [`health`]: headroom monitoring and periodic housekeeping.
//! - [`driver`]: the scan / connect / read loop run by the central.
//! - [`sensor`]: ADC averaging, text frames and central bookkeeping for
//!   the peripheral.
//!
//! Usage: `cargo test --lib`
//!
//! Note: the firmware binaries (`src/main.rs`, `src/bin/peripheral.rs`)
//! are `#![no_std]` + `#![no_main]` and need `--features embedded`.

#![cfg_attr(not(test), no_std)]

// Must come first so the logging macros are visible to every module.
mod fmt;

pub mod ble;
pub mod config;
pub mod driver;
pub mod error;
pub mod health;
pub mod sensor;

#[cfg(test)]
mod testing;
