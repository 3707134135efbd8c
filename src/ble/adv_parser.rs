//! Advertising data parser.
//!
//! Advertising payloads are a sequence of `[len][type][value; len - 1]`
//! records. Parsing stops at a zero length or at a record that would run
//! past the end of the buffer; whatever was decoded up to that point is
//! kept.

use heapless::{String, Vec};

use crate::ble::BleUuid;

/// Incomplete list of 16-bit service UUIDs.
pub const AD_UUID16_INCOMPLETE: u8 = 0x02;
/// Complete list of 16-bit service UUIDs.
pub const AD_UUID16_COMPLETE: u8 = 0x03;
/// Incomplete list of 128-bit service UUIDs.
pub const AD_UUID128_INCOMPLETE: u8 = 0x06;
/// Complete list of 128-bit service UUIDs.
pub const AD_UUID128_COMPLETE: u8 = 0x07;
/// Shortened local name.
pub const AD_NAME_SHORT: u8 = 0x08;
/// Complete local name.
pub const AD_NAME_COMPLETE: u8 = 0x09;

/// Most service UUIDs kept from one advertisement.
pub const MAX_SERVICE_UUIDS: usize = 16;

/// Decoded contents of one advertising payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Advertisement {
    /// First well-formed shortened/complete local name.
    pub name: Option<String<32>>,
    /// Every advertised service UUID, in encounter order.
    pub services: Vec<BleUuid, MAX_SERVICE_UUIDS>,
}

/// Iterator over the well-formed `(type, value)` records of a payload.
struct Records<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for Records<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.pos;
        if i + 1 >= self.data.len() {
            return None;
        }
        let len = self.data[i] as usize;
        if len == 0 || i + len >= self.data.len() {
            // Stop for good on a malformed record.
            self.pos = self.data.len();
            return None;
        }
        self.pos = i + 1 + len;
        Some((self.data[i + 1], &self.data[i + 2..i + 1 + len]))
    }
}

fn records(data: &[u8]) -> Records<'_> {
    Records { data, pos: 0 }
}

/// Decode the name and service UUIDs in a single pass.
pub fn parse(data: &[u8]) -> Advertisement {
    let mut adv = Advertisement::default();
    for (ad_type, value) in records(data) {
        match ad_type {
            AD_NAME_SHORT | AD_NAME_COMPLETE => {
                if adv.name.is_none() {
                    adv.name = decode_name(value);
                }
            }
            AD_UUID16_INCOMPLETE | AD_UUID16_COMPLETE => {
                for chunk in value.chunks_exact(2) {
                    let uuid = u16::from_le_bytes([chunk[0], chunk[1]]);
                    let _ = adv.services.push(BleUuid::from_u16(uuid));
                }
            }
            AD_UUID128_INCOMPLETE | AD_UUID128_COMPLETE => {
                for chunk in value.chunks_exact(16) {
                    let mut bytes = [0u8; 16];
                    bytes.copy_from_slice(chunk);
                    let _ = adv.services.push(BleUuid::from_le_bytes(bytes));
                }
            }
            _ => {}
        }
    }
    adv
}

/// Extract complete/shortened local name from advertisement data.
pub fn extract_device_name(data: &[u8]) -> Option<String<32>> {
    records(data)
        .filter(|(ad_type, _)| *ad_type == AD_NAME_SHORT || *ad_type == AD_NAME_COMPLETE)
        .find_map(|(_, value)| decode_name(value))
}

/// Extract every advertised 16-bit and 128-bit service UUID.
pub fn extract_service_uuids(data: &[u8]) -> Vec<BleUuid, MAX_SERVICE_UUIDS> {
    parse(data).services
}

/// Check if advertisement data lists `uuid` as a service.
pub fn contains_service_uuid(data: &[u8], uuid: &BleUuid) -> bool {
    parse(data).services.iter().any(|u| u == uuid)
}

/// UTF-8 decode, truncating to the `String<32>` capacity on a char boundary.
fn decode_name(bytes: &[u8]) -> Option<String<32>> {
    let text = core::str::from_utf8(bytes).ok()?;
    let mut name = String::new();
    for c in text.chars() {
        if name.push(c).is_err() {
            break;
        }
    }
    Some(name)
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests (run on host, not embedded)
// ═══════════════════════════════════════════════════════════════════════════
