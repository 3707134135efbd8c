//! Moving-average sampler for the peripheral's analog inputs.

use crate::config::{ADC_MAX_RAW, ADC_REFERENCE_MV};

/// Accept a raw conversion only if it lies within the ADC range.
///
/// The SAADC reports signed values and can dip slightly below zero on a
/// grounded input.
pub fn validate(raw: i16) -> Option<u16> {
    u16::try_from(raw).ok().filter(|v| *v <= ADC_MAX_RAW)
}

/// Convert an averaged raw value to millivolts against the reference.
pub fn to_millivolts(raw: u16) -> u16 {
    let raw = u32::from(raw.min(ADC_MAX_RAW));
    (raw * u32::from(ADC_REFERENCE_MV) / u32::from(ADC_MAX_RAW)) as u16
}

/// One averaged channel reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Reading {
    /// 1-based channel number.
    pub channel: u8,
    pub raw: u16,
    pub millivolts: u16,
}

/// Circular buffer of the last `N` samples for each of `CH` channels.
pub struct Sampler<const CH: usize, const N: usize> {
    samples: [[u16; N]; CH],
    filled: [usize; CH],
    next: [usize; CH],
}

impl<const CH: usize, const N: usize> Default for Sampler<CH, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CH: usize, const N: usize> Sampler<CH, N> {
    pub const fn new() -> Self {
        Self {
            samples: [[0; N]; CH],
            filled: [0; CH],
            next: [0; CH],
        }
    }

    /// Record one conversion per channel. Out-of-range values are dropped
    /// and leave that channel's window unchanged. Returns how many were kept.
    pub fn push(&mut self, raw: &[i16; CH]) -> usize {
        let mut kept = 0;
        for (ch, value) in raw.iter().enumerate() {
            let Some(v) = validate(*value) else {
                debug!("Channel {} out of range: {}", ch + 1, value);
                continue;
            };
            self.samples[ch][self.next[ch]] = v;
            self.next[ch] = (self.next[ch] + 1) % N;
            self.filled[ch] = (self.filled[ch] + 1).min(N);
            kept += 1;
        }
        kept
    }

    /// Average over the samples collected so far (up to `N`).
    pub fn average(&self, ch: usize) -> Option<u16> {
        let filled = *self.filled.get(ch)?;
        if filled == 0 {
            return None;
        }
        let sum: u32 = self.samples[ch][..filled].iter().map(|v| u32::from(*v)).sum();
        Some((sum / filled as u32) as u16)
    }

    /// Averaged readings for every channel that has samples.
    pub fn readings(&self) -> heapless::Vec<Reading, CH> {
        let mut out = heapless::Vec::new();
        for ch in 0..CH {
            if let Some(raw) = self.average(ch) {
                let _ = out.push(Reading {
                    channel: ch as u8 + 1,
                    raw,
                    millivolts: to_millivolts(raw),
                });
            }
        }
        out
    }
}
