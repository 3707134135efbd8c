//! Target selection during scanning.

use heapless::String;

use crate::ble::BleUuid;

/// Selection criteria for the one peripheral the client connects to.
///
/// Each criterion is optional and checked independently; the first one
/// satisfied wins. A target with no criteria never matches.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Target {
    pub address: Option<String<32>>,
    pub name: Option<String<32>>,
    pub service: Option<BleUuid>,
}

impl Target {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match on the formatted address (`aa:bb:cc:dd:ee:ff`, any case).
    pub fn with_address(mut self, address: &str) -> Self {
        self.address = Some(truncated(address));
        self
    }

    /// Match when `name` appears anywhere in the advertised name, ignoring case.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(truncated(name));
        self
    }

    /// Match when `uuid` is among the advertised service UUIDs.
    pub fn with_service(mut self, uuid: BleUuid) -> Self {
        self.service = Some(uuid);
        self
    }

    pub fn has_criteria(&self) -> bool {
        self.address.is_some() || self.name.is_some() || self.service.is_some()
    }

    /// Decide whether a scanned candidate is the target.
    ///
    /// The RSSI floor is applied by the caller beforehand.
    pub fn matches(&self, address: &str, name: Option<&str>, services: &[BleUuid]) -> bool {
        if let Some(target) = &self.address {
            if address.eq_ignore_ascii_case(target) {
                debug!("Target matched by address {}", address);
                return true;
            }
        }

        if let (Some(target), Some(name)) = (&self.name, name) {
            if contains_ignore_ascii_case(name, target) {
                debug!("Target matched by name {}", name);
                return true;
            }
        }

        if let Some(target) = &self.service {
            if services.contains(target) {
                debug!("Target matched by service UUID");
                return true;
            }
        }

        false
    }
}

/// Copy `s` into a `String<32>`, dropping whatever does not fit.
fn truncated(s: &str) -> String<32> {
    let mut out = String::new();
    for c in s.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

fn contains_ignore_ascii_case(haystack: &str, needle: &str) -> bool {
    let (h, n) = (haystack.as_bytes(), needle.as_bytes());
    if n.is_empty() {
        return true;
    }
    h.windows(n.len()).any(|w| w.eq_ignore_ascii_case(n))
}
