//! Advertising payload assembly for the peripheral role.

use heapless::Vec;

use crate::ble::adv_parser::{AD_NAME_COMPLETE, AD_UUID128_COMPLETE, AD_UUID16_COMPLETE};
use crate::ble::BleUuid;
use crate::error::Error;

/// Flags AD type.
pub const AD_FLAGS: u8 = 0x01;
/// LE General Discoverable Mode.
pub const FLAG_GENERAL_DISCOVERABLE: u8 = 0x02;
/// BR/EDR Not Supported.
pub const FLAG_BR_EDR_UNSUPPORTED: u8 = 0x04;

/// Legacy advertising PDU payload limit.
pub const MAX_ADV_LEN: usize = 31;

/// LTV-encoded advertising or scan response data.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AdvertisingPayload {
    buf: Vec<u8, MAX_ADV_LEN>,
}

impl AdvertisingPayload {
    /// Advertising data, starting with the flags record.
    pub fn advertising() -> Result<Self, Error> {
        let mut p = Self::default();
        p.push(AD_FLAGS, &[FLAG_GENERAL_DISCOVERABLE | FLAG_BR_EDR_UNSUPPORTED])?;
        Ok(p)
    }

    /// Scan response data, which carries no flags.
    pub fn scan_response() -> Self {
        Self::default()
    }

    /// Append one `[len][type][value]` record.
    pub fn push(&mut self, ad_type: u8, value: &[u8]) -> Result<&mut Self, Error> {
        let len = value.len() + 1;
        if len > u8::MAX as usize || self.buf.len() + 1 + len > MAX_ADV_LEN {
            return Err(Error::AdvertisingOverflow);
        }
        // Capacity was checked above.
        let _ = self.buf.push(len as u8);
        let _ = self.buf.push(ad_type);
        let _ = self.buf.extend_from_slice(value);
        Ok(self)
    }

    /// Complete local name.
    pub fn name(&mut self, name: &str) -> Result<&mut Self, Error> {
        self.push(AD_NAME_COMPLETE, name.as_bytes())
    }

    /// Complete service lists, one record per UUID width.
    pub fn services(&mut self, uuids: &[BleUuid]) -> Result<&mut Self, Error> {
        let mut short: Vec<u8, MAX_ADV_LEN> = Vec::new();
        let mut long: Vec<u8, MAX_ADV_LEN> = Vec::new();
        for uuid in uuids {
            let res = match uuid {
                BleUuid::Uuid16(v) => short.extend_from_slice(&v.to_le_bytes()),
                BleUuid::Uuid128(_) => long.extend_from_slice(&uuid.to_le_bytes()),
            };
            res.map_err(|_| Error::AdvertisingOverflow)?;
        }
        if !short.is_empty() {
            self.push(AD_UUID16_COMPLETE, &short)?;
        }
        if !long.is_empty() {
            self.push(AD_UUID128_COMPLETE, &long)?;
        }
        Ok(self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
