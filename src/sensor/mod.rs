//! Peripheral-side sensor logic: analog sampling, text frames and the
//! set of connected centrals.

pub mod adc;
pub mod frame;
pub mod link;

use core::fmt::Write;

use heapless::String;

/// Format an uptime as `1h 23m 45s`, `2m 5s` or `9s`.
pub fn format_uptime(total_secs: u64) -> String<32> {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    let mut s = String::new();
    let _ = if hours > 0 {
        write!(s, "{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        write!(s, "{}m {}s", minutes, secs)
    } else {
        write!(s, "{}s", secs)
    };
    s
}
