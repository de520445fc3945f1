//! Cross-clock alignment of device and host timestamps onto one wall-clock timeline.
//!
//! Every device (and the host, under [`HOST_DEVICE_ID`]) carries a
//! [`CalibrationRecord`] captured at collection start: the host monotonic-raw
//! clock, the device cycle counter and the wall clock sampled at the same instant,
//! plus the device counter frequency. [`align`] is a pure function of a raw
//! timestamp and that record.

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;
use thiserror::Error;

/// Device id under which the host calibration is registered.
pub const HOST_DEVICE_ID: u32 = 64;

const PICOS_PER_NANO: u128 = 1_000;
const PICOS_PER_SECOND: u128 = 1_000_000_000_000;

/// Errors raised while resolving or building calibration data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClockError {
    #[error("no calibration record for device {device_id}")]
    CalibrationMissing { device_id: u32 },

    #[error("device {device_id}: invalid counter frequency {freq_mhz} MHz")]
    InvalidFrequency { device_id: u32, freq_mhz: String },
}

/// Which clock a raw timestamp was sampled from.
///
/// The conversion factor is fixed per domain: device cycle counters tick at the
/// calibrated frequency, host monotonic-raw timestamps are already nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockDomain {
    /// Device system counter, converted with `cpu_freq_mhz`.
    DeviceCycles,
    /// Host `CLOCK_MONOTONIC_RAW` nanoseconds.
    HostMonotonic,
}

/// Per-device calibration sampled once at collection start. Immutable.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CalibrationRecord {
    pub device_id: u32,
    /// Host monotonic-raw clock at the calibration instant (ns).
    pub host_monotonic_ns: u64,
    /// Device cycle counter at the calibration instant (ticks).
    pub device_monotonic_cycles: u64,
    /// Wall clock at the calibration instant (ns since the Unix epoch).
    pub wall_clock_ns: u64,
    /// Device counter frequency in MHz.
    pub cpu_freq_mhz: f64,
    /// Integer frequency derived from `cpu_freq_mhz`, filled by [`CalibrationRecord::validated`].
    #[serde(skip)]
    freq_hz: u64,
}

impl CalibrationRecord {
    /// Creates a validated calibration record.
    pub fn new(
        device_id: u32,
        host_monotonic_ns: u64,
        device_monotonic_cycles: u64,
        wall_clock_ns: u64,
        cpu_freq_mhz: f64,
    ) -> Result<Self, ClockError> {
        Self {
            device_id,
            host_monotonic_ns,
            device_monotonic_cycles,
            wall_clock_ns,
            cpu_freq_mhz,
            freq_hz: 0,
        }
        .validated()
    }

    /// Checks the frequency and fixes it as an integer Hz value so every later
    /// conversion is exact integer arithmetic.
    pub fn validated(mut self) -> Result<Self, ClockError> {
        let hz = self.cpu_freq_mhz * 1_000_000.0;
        if !hz.is_finite() || hz < 1.0 || hz > u64::MAX as f64 {
            return Err(ClockError::InvalidFrequency {
                device_id: self.device_id,
                freq_mhz: self.cpu_freq_mhz.to_string(),
            });
        }
        self.freq_hz = hz.round() as u64;
        Ok(self)
    }

    /// Counter frequency in Hz.
    pub fn freq_hz(&self) -> u64 {
        self.freq_hz
    }
}

/// Wall-clock instant in picoseconds since the Unix epoch.
///
/// Sub-nanosecond remainders from cycle division are kept until the final
/// display conversion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HpTime(u128);

impl HpTime {
    pub const ZERO: Self = Self(0);

    pub const fn from_picos(picos: u128) -> Self {
        Self(picos)
    }

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos as u128 * PICOS_PER_NANO)
    }

    pub const fn as_picos(self) -> u128 {
        self.0
    }

    /// Whole nanoseconds, truncating the sub-nanosecond remainder.
    pub const fn as_nanos(self) -> u128 {
        self.0 / PICOS_PER_NANO
    }

    /// Whole nanoseconds saturated into `u64` for storage columns.
    pub fn as_nanos_u64(self) -> u64 {
        u64::try_from(self.as_nanos()).unwrap_or(u64::MAX)
    }

    /// Nanosecond distance to a later instant, zero if `later` is earlier.
    pub fn nanos_until(self, later: HpTime) -> u128 {
        later.0.saturating_sub(self.0) / PICOS_PER_NANO
    }

    /// Display transform: microseconds with nanosecond decimals, e.g.
    /// `1719621074669030.430`.
    pub fn to_micros_string(self) -> String {
        micros_string(self.as_nanos())
    }
}

impl fmt::Display for HpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_micros_string())
    }
}

/// Formats a nanosecond quantity as microseconds with three decimals.
pub fn micros_string(nanos: u128) -> String {
    format!("{}.{:03}", nanos / 1_000, nanos % 1_000)
}

/// Converts a raw timestamp into wall-clock time.
///
/// The offset from the domain baseline is signed, so samples taken before the
/// calibration instant land before its wall time. Device counters are read
/// modulo 2^64: a delta past half the range counts as negative, which keeps a
/// counter that wrapped once since calibration correct. Results before the
/// Unix epoch saturate at zero.
pub fn align(raw: u64, domain: ClockDomain, calib: &CalibrationRecord) -> HpTime {
    let offset_ps: i128 = match domain {
        ClockDomain::DeviceCycles => {
            let ticks = signed_ticks(raw, calib.device_monotonic_cycles);
            (ticks * PICOS_PER_SECOND as i128).div_euclid(i128::from(calib.freq_hz.max(1)))
        }
        ClockDomain::HostMonotonic => {
            (i128::from(raw) - i128::from(calib.host_monotonic_ns)) * PICOS_PER_NANO as i128
        }
    };

    let wall_ps = i128::from(calib.wall_clock_ns) * PICOS_PER_NANO as i128;
    match u128::try_from(wall_ps + offset_ps) {
        Ok(ps) => HpTime(ps),
        Err(_) => {
            tracing::warn!(
                device_id = calib.device_id,
                raw,
                "aligned timestamp before the Unix epoch, clamping to zero",
            );
            HpTime::ZERO
        }
    }
}

/// Counter distance from `baseline` to `raw` modulo 2^64, as a signed value.
fn signed_ticks(raw: u64, baseline: u64) -> i128 {
    let forward = raw.wrapping_sub(baseline);
    if forward > u64::MAX / 2 {
        -i128::from(baseline.wrapping_sub(raw))
    } else {
        i128::from(forward)
    }
}

/// Calibration records for every device in a session, built once before any
/// parallel phase and read-only afterwards.
#[derive(Debug, Default, Clone)]
pub struct CalibrationTable {
    records: HashMap<u32, CalibrationRecord>,
}

impl CalibrationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a record, replacing any previous one for the same device.
    pub fn insert(&mut self, record: CalibrationRecord) {
        self.records.insert(record.device_id, record);
    }

    pub fn get(&self, device_id: u32) -> Result<&CalibrationRecord, ClockError> {
        self.records
            .get(&device_id)
            .ok_or(ClockError::CalibrationMissing { device_id })
    }

    /// Returns a converter bound to one device and clock domain.
    pub fn aligner(&self, device_id: u32, domain: ClockDomain) -> Result<ClockAligner, ClockError> {
        Ok(ClockAligner {
            calib: self.get(device_id)?.clone(),
            domain,
        })
    }

    pub fn devices(&self) -> impl Iterator<Item = u32> + '_ {
        self.records.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// [`align`] bound to an owned calibration record, handed to worker tasks.
#[derive(Debug, Clone)]
pub struct ClockAligner {
    calib: CalibrationRecord,
    domain: ClockDomain,
}

impl ClockAligner {
    pub fn new(calib: CalibrationRecord, domain: ClockDomain) -> Self {
        Self { calib, domain }
    }

    pub fn align(&self, raw: u64) -> HpTime {
        align(raw, self.domain, &self.calib)
    }

    pub fn device_id(&self) -> u32 {
        self.calib.device_id
    }
}
