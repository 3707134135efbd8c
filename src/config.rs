//! Application-wide constants and runtime configuration.
//!
//! Protocol timing, retry policy and peripheral sampling parameters
//! live here so they can be tuned in one place.

// BLE central

/// Duration of a BLE scan window (ms).
pub const SCAN_DURATION_MS: u32 = 25_000;

/// Extra time the driver waits for readiness after the scan window (ms).
pub const SCAN_GRACE_MS: u32 = 8_000;

/// Time allowed for a connection attempt to complete (ms).
pub const CONNECTION_TIMEOUT_MS: u32 = 8_000;

/// Time allowed for the whole GATT discovery walk (ms).
pub const DISCOVERY_TIMEOUT_MS: u32 = 6_000;

/// Time allowed for a read to complete (ms).
pub const READ_TIMEOUT_MS: u32 = 4_000;

/// Consecutive reconnection attempts before giving up.
pub const MAX_RETRIES: u8 = 5;

/// Delay before each reconnection attempt (ms).
pub const RETRY_DELAY_MS: u32 = 1_500;

/// Advertisements weaker than this are ignored (dBm).
pub const RSSI_THRESHOLD: i8 = -85;

/// Largest payload accepted by a single GATT write (default ATT MTU - 3).
pub const MAX_WRITE_LEN: usize = 20;

/// Handler errors tolerated before the radio is reset.
pub const ERROR_CEILING: u32 = 15;

/// Pause between radio deactivation and reactivation during a reset (ms).
pub const RESET_PAUSE_MS: u32 = 1_000;

// Resource housekeeping

/// Minimum free headroom required to bring the radio up (bytes).
pub const MEMORY_THRESHOLD: usize = 40_000;

/// Reclaim every N processed events.
pub const RECLAIM_INTERVAL_OPS: u32 = 8;

/// Reclaim at least this often regardless of event count (ms).
pub const RECLAIM_PERIOD_MS: u64 = 10_000;

/// Reclaim passes performed when headroom stays below threshold.
pub const EMERGENCY_PASSES: u8 = 3;

/// Pause between emergency reclaim passes (ms).
pub const EMERGENCY_PAUSE_MS: u32 = 10;

// Application driver

/// Interval between periodic characteristic reads (ms).
pub const READ_INTERVAL_MS: u32 = 2_000;

/// Log a status line every N driver operations.
pub const STATUS_EVERY_OPS: u32 = 5;

/// Wait before scanning again after a failed session (ms).
pub const RESCAN_DELAY_MS: u32 = 5_000;

/// Main loop tick when no radio event arrives (ms).
pub const POLL_INTERVAL_MS: u64 = 100;

// Peripheral

/// Advertised device name.
pub const DEVICE_NAME: &str = "ADC-Server";

/// Advertising interval (ms).
pub const ADV_INTERVAL_MS: u32 = 500;

/// Number of sampled analog channels.
pub const ADC_CHANNELS: usize = 3;

/// Samples per channel in the moving average.
pub const ADC_SAMPLES: usize = 5;

/// Sampling period (ms).
pub const SAMPLE_INTERVAL_MS: u64 = 100;

/// Maintenance / status log period (ms).
pub const MAINTENANCE_INTERVAL_MS: u64 = 5_000;

/// ADC resolution in bits. 12 bits -> 0..=4095.
pub const ADC_RESOLUTION_BITS: u32 = 12;

/// Largest raw ADC reading.
pub const ADC_MAX_RAW: u16 = (1 << ADC_RESOLUTION_BITS) - 1;

/// Full-scale reference voltage (mV).
pub const ADC_REFERENCE_MV: u16 = 3_300;

/// Longest formatted frame (bytes).
pub const FRAME_MAX_LEN: usize = 100;

/// Longest single notification payload (bytes).
pub const NOTIFY_MAX_LEN: usize = 20;

/// Centrals served concurrently by the peripheral.
pub const MAX_CENTRALS: usize = 2;

/// Runtime options supplied to the central client at construction.
///
/// Read-only afterwards, except `auto_reconnect` which
/// [`Client::disconnect`](crate::ble::client::Client::disconnect) clears.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    pub scan_duration_ms: u32,
    pub connection_timeout_ms: u32,
    pub discovery_timeout_ms: u32,
    pub read_timeout_ms: u32,
    pub max_retries: u8,
    pub retry_delay_ms: u32,
    pub rssi_threshold: i8,
    pub auto_reconnect: bool,
    /// Minimum free headroom (bytes).
    pub memory_threshold: usize,
    /// Housekeeping interval in processed events. 0 disables the count trigger.
    pub reclaim_interval: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scan_duration_ms: SCAN_DURATION_MS,
            connection_timeout_ms: CONNECTION_TIMEOUT_MS,
            discovery_timeout_ms: DISCOVERY_TIMEOUT_MS,
            read_timeout_ms: READ_TIMEOUT_MS,
            max_retries: MAX_RETRIES,
            retry_delay_ms: RETRY_DELAY_MS,
            rssi_threshold: RSSI_THRESHOLD,
            auto_reconnect: true,
            memory_threshold: MEMORY_THRESHOLD,
            reclaim_interval: RECLAIM_INTERVAL_OPS,
        }
    }
}
