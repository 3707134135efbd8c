//! Text frames carrying channel voltages.
//!
//! Format: `ADC:C1=1.25V;C2=2.30V;C3=0.85V;`. Voltages use two decimals.
//! A frame is capped at [`FRAME_MAX_LEN`] bytes and each notification
//! carries at most [`NOTIFY_MAX_LEN`] of them, so the receiving side must
//! cope with a clipped last field.

use core::fmt::Write;

use heapless::{String, Vec};

use crate::config::{FRAME_MAX_LEN, NOTIFY_MAX_LEN};
use crate::sensor::adc::Reading;

const PREFIX: &str = "ADC:";

/// Most channel fields decoded from one frame.
pub const MAX_FIELDS: usize = 8;

pub type Frame = String<FRAME_MAX_LEN>;

/// Build a frame; fields that no longer fit are left out whole.
pub fn format_frame(readings: &[Reading]) -> Frame {
    let mut frame = Frame::new();
    let _ = frame.push_str(PREFIX);
    for r in readings {
        let mut field: String<24> = String::new();
        let centivolts = (u32::from(r.millivolts) + 5) / 10;
        let _ = write!(
            field,
            "C{}={}.{:02}V;",
            r.channel,
            centivolts / 100,
            centivolts % 100
        );
        if frame.push_str(&field).is_err() {
            break;
        }
    }
    frame
}

/// The part of a frame sent in one notification.
pub fn notification_chunk(frame: &str) -> &[u8] {
    let bytes = frame.as_bytes();
    &bytes[..bytes.len().min(NOTIFY_MAX_LEN)]
}

/// Decoded `(channel, millivolts)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Field {
    pub channel: u8,
    pub millivolts: u16,
}

/// Decode a (possibly clipped) frame. Returns `None` without the prefix.
///
/// Only complete `C<n>=<v>V;` fields are returned.
pub fn parse_frame(data: &[u8]) -> Option<Vec<Field, MAX_FIELDS>> {
    let text = core::str::from_utf8(data).ok()?;
    let body = text.strip_prefix(PREFIX)?;
    let mut fields = Vec::new();
    let mut parts = body.split(';').peekable();
    while let Some(part) = parts.next() {
        // The last piece has no terminator: either empty or clipped.
        if parts.peek().is_none() {
            break;
        }
        if let Some(field) = parse_field(part) {
            if fields.push(field).is_err() {
                break;
            }
        }
    }
    Some(fields)
}

fn parse_field(s: &str) -> Option<Field> {
    let (ch, volts) = s.strip_prefix('C')?.split_once('=')?;
    let channel = ch.parse().ok()?;
    let volts = volts.strip_suffix('V')?;
    let (whole, frac) = volts.split_once('.').unwrap_or((volts, "0"));
    if frac.is_empty() || frac.len() > 3 {
        return None;
    }
    let whole: u32 = whole.parse().ok()?;
    let mut milli: u32 = frac.parse().ok()?;
    for _ in frac.len()..3 {
        milli *= 10;
    }
    let millivolts = u16::try_from(whole.checked_mul(1000)?.checked_add(milli)?).ok()?;
    Some(Field {
        channel,
        millivolts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(channel: u8, millivolts: u16) -> Reading {
        Reading {
            channel,
            raw: 0,
            millivolts,
        }
    }

    #[test]
    fn formats_three_channels() {
        let f = format_frame(&[reading(1, 1250), reading(2, 2300), reading(3, 849)]);
        assert_eq!(f.as_str(), "ADC:C1=1.25V;C2=2.30V;C3=0.85V;");
    }

    #[test]
    fn empty_frame_is_prefix_only() {
        assert_eq!(format_frame(&[]).as_str(), "ADC:");
    }

    #[test]
    fn frame_is_capped() {
        let many: [Reading; 12] = core::array::from_fn(|i| reading(i as u8 + 1, 3300));
        let f = format_frame(&many);
        assert!(f.len() <= FRAME_MAX_LEN);
        assert!(f.ends_with(';'));
    }

    #[test]
    fn notification_is_clipped() {
        let f = "ADC:C1=1.25V;C2=2.30V;C3=0.85V;";
        assert_eq!(notification_chunk(f), b"ADC:C1=1.25V;C2=2.30");
        assert_eq!(notification_chunk("ADC:"), b"ADC:");
    }

    #[test]
    fn parses_full_frame() {
        let fields = parse_frame(b"ADC:C1=1.25V;C2=2.30V;C3=0.85V;").unwrap();
        assert_eq!(
            fields.as_slice(),
            &[
                Field { channel: 1, millivolts: 1250 },
                Field { channel: 2, millivolts: 2300 },
                Field { channel: 3, millivolts: 850 },
            ]
        );
    }

    #[test]
    fn clipped_trailing_field_is_dropped() {
        let fields = parse_frame(b"ADC:C1=1.25V;C2=2.3").unwrap();
        assert_eq!(fields.as_slice(), &[Field { channel: 1, millivolts: 1250 }]);
    }

    #[test]
    fn foreign_payload_is_rejected() {
        assert!(parse_frame(b"\x34\x12").is_none());
        assert!(parse_frame(b"TEMP:21").is_none());
    }

    #[test]
    fn malformed_fields_are_skipped() {
        let fields = parse_frame(b"ADC:Cx=1.0V;C2=1V;C3=.5V;").unwrap();
        assert_eq!(fields.as_slice(), &[Field { channel: 2, millivolts: 1000 }]);
    }
}
