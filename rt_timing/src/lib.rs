//! # RT Timing
//!
//! Exact fixed-point time values (seconds + nanoseconds) and monotonic clock
//! access for the real-time task harness. A [`Timespec`] is used both as an
//! absolute instant on `CLOCK_MONOTONIC` and as a relative duration; all
//! arithmetic is integer-only.

pub mod clock;
pub mod measurements;

pub use clock::{now, resolution, sleep_until};

use core::fmt::{Display, Formatter};
use core::ops::{Add, AddAssign, Mul};
use core::str::FromStr;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::error::Error;

pub const NANOS_PER_SEC: u32 = 1_000_000_000;

/// Failure of a time computation or conversion
#[derive(Copy, Clone, PartialEq, Hash, Debug, Eq)]
pub enum TimeError {
    /// A subtraction would produce a negative value
    Underflow,
    /// The result does not fit the target representation
    Overflow,
    /// A string is not a `seconds.nanoseconds` value
    Parse(&'static str),
}

impl Display for TimeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            TimeError::Underflow => write!(f, "time subtraction underflow"),
            TimeError::Overflow => write!(f, "time value overflow"),
            TimeError::Parse(reason) => write!(f, "invalid time value: {}", reason),
        }
    }
}

impl Error for TimeError {}

/// An instant or a duration with nanosecond resolution.
///
/// Invariant: `nsec < NANOS_PER_SEC`. Every constructor normalizes, so the
/// derived ordering (seconds first, then nanoseconds) is the numeric one.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Timespec {
    sec: u64,
    nsec: u32,
}

impl Timespec {
    pub const ZERO: Timespec = Timespec { sec: 0, nsec: 0 };
    pub const MAX: Timespec = Timespec {
        sec: u64::MAX,
        nsec: NANOS_PER_SEC - 1,
    };

    /// Creates a value, carrying excess nanoseconds into the seconds.
    pub const fn new(sec: u64, nsec: u32) -> Self {
        let carry = (nsec / NANOS_PER_SEC) as u64;
        Timespec {
            sec: sec.saturating_add(carry),
            nsec: nsec % NANOS_PER_SEC,
        }
    }

    pub const fn from_secs(sec: u64) -> Self {
        Timespec { sec, nsec: 0 }
    }

    pub const fn from_millis(ms: u64) -> Self {
        Self::from_nanos_u128(ms as u128 * 1_000_000)
    }

    pub const fn from_micros(us: u64) -> Self {
        Self::from_nanos_u128(us as u128 * 1_000)
    }

    pub const fn from_nanos(ns: u64) -> Self {
        Self::from_nanos_u128(ns as u128)
    }

    const fn from_nanos_u128(ns: u128) -> Self {
        let sec = ns / NANOS_PER_SEC as u128;
        if sec > u64::MAX as u128 {
            return Self::MAX;
        }
        Timespec {
            sec: sec as u64,
            nsec: (ns % NANOS_PER_SEC as u128) as u32,
        }
    }

    /// Converts a nanosecond count, failing instead of saturating.
    pub fn try_from_nanos(ns: u128) -> Result<Self, TimeError> {
        let sec = u64::try_from(ns / NANOS_PER_SEC as u128).map_err(|_| TimeError::Overflow)?;
        Ok(Timespec {
            sec,
            nsec: (ns % NANOS_PER_SEC as u128) as u32,
        })
    }

    pub const fn secs(&self) -> u64 {
        self.sec
    }

    pub const fn subsec_nanos(&self) -> u32 {
        self.nsec
    }

    pub const fn is_zero(&self) -> bool {
        self.sec == 0 && self.nsec == 0
    }

    pub const fn as_nanos(&self) -> u128 {
        self.sec as u128 * NANOS_PER_SEC as u128 + self.nsec as u128
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.sec as f64 + self.nsec as f64 / NANOS_PER_SEC as f64
    }

    pub fn checked_add(self, rhs: Timespec) -> Result<Timespec, TimeError> {
        let mut sec = self.sec.checked_add(rhs.sec).ok_or(TimeError::Overflow)?;
        let mut nsec = self.nsec + rhs.nsec;
        if nsec >= NANOS_PER_SEC {
            nsec -= NANOS_PER_SEC;
            sec = sec.checked_add(1).ok_or(TimeError::Overflow)?;
        }
        Ok(Timespec { sec, nsec })
    }

    /// `self - rhs`, or [`TimeError::Underflow`] when `rhs > self`.
    pub fn checked_sub(self, rhs: Timespec) -> Result<Timespec, TimeError> {
        if rhs > self {
            return Err(TimeError::Underflow);
        }
        let (sec, nsec) = if self.nsec >= rhs.nsec {
            (self.sec - rhs.sec, self.nsec - rhs.nsec)
        } else {
            (self.sec - rhs.sec - 1, self.nsec + NANOS_PER_SEC - rhs.nsec)
        };
        Ok(Timespec { sec, nsec })
    }

    pub fn saturating_sub(self, rhs: Timespec) -> Timespec {
        self.checked_sub(rhs).unwrap_or(Timespec::ZERO)
    }

    pub fn abs_diff(self, rhs: Timespec) -> Timespec {
        if self >= rhs {
            self.saturating_sub(rhs)
        } else {
            rhs.saturating_sub(self)
        }
    }

    pub fn checked_mul(self, factor: u64) -> Result<Timespec, TimeError> {
        Self::try_from_nanos(
            self.as_nanos()
                .checked_mul(factor as u128)
                .ok_or(TimeError::Overflow)?,
        )
    }

    /// Seconds and nanoseconds as the 32-bit pair used by log headers.
    pub fn to_u32_pair(self) -> Result<(u32, u32), TimeError> {
        let sec = u32::try_from(self.sec).map_err(|_| TimeError::Overflow)?;
        Ok((sec, self.nsec))
    }

    pub fn from_u32_pair(sec: u32, nsec: u32) -> Result<Timespec, TimeError> {
        if nsec >= NANOS_PER_SEC {
            return Err(TimeError::Parse("nanoseconds out of range"));
        }
        Ok(Timespec {
            sec: sec as u64,
            nsec,
        })
    }
}

impl Add for Timespec {
    type Output = Timespec;
    fn add(self, rhs: Self) -> Self::Output {
        self.checked_add(rhs).unwrap_or(Timespec::MAX)
    }
}

impl AddAssign for Timespec {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Mul<u64> for Timespec {
    type Output = Timespec;
    fn mul(self, rhs: u64) -> Self::Output {
        self.checked_mul(rhs).unwrap_or(Timespec::MAX)
    }
}

impl From<std::time::Duration> for Timespec {
    fn from(value: std::time::Duration) -> Self {
        Timespec {
            sec: value.as_secs(),
            nsec: value.subsec_nanos(),
        }
    }
}

impl From<Timespec> for std::time::Duration {
    fn from(value: Timespec) -> Self {
        std::time::Duration::new(value.sec, value.nsec)
    }
}

impl TryFrom<libc::timespec> for Timespec {
    type Error = TimeError;

    fn try_from(value: libc::timespec) -> Result<Self, Self::Error> {
        if value.tv_sec < 0 || value.tv_nsec < 0 {
            return Err(TimeError::Underflow);
        }
        if value.tv_nsec >= NANOS_PER_SEC as libc::c_long {
            return Err(TimeError::Overflow);
        }
        Ok(Timespec {
            sec: value.tv_sec as u64,
            nsec: value.tv_nsec as u32,
        })
    }
}

impl TryFrom<Timespec> for libc::timespec {
    type Error = TimeError;

    fn try_from(value: Timespec) -> Result<Self, Self::Error> {
        // SAFETY: timespec is plain old data; zero is a valid value.
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        ts.tv_sec = libc::time_t::try_from(value.sec).map_err(|_| TimeError::Overflow)?;
        ts.tv_nsec = value.nsec as libc::c_long;
        Ok(ts)
    }
}

impl Display for Timespec {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

impl FromStr for Timespec {
    type Err = TimeError;

    /// Parses `seconds[.fraction]` with at most nine fractional digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (sec_str, frac_str) = s.split_once('.').unwrap_or((s, ""));
        if sec_str.is_empty() || !sec_str.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TimeError::Parse("seconds must be decimal digits"));
        }
        if frac_str.len() > 9 || !frac_str.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TimeError::Parse("at most nine fractional digits"));
        }
        let sec = sec_str.parse::<u64>().map_err(|_| TimeError::Overflow)?;
        let mut nsec = 0u32;
        for (i, b) in frac_str.bytes().enumerate() {
            nsec += (b - b'0') as u32 * 10u32.pow(8 - i as u32);
        }
        Ok(Timespec { sec, nsec })
    }
}

impl Serialize for Timespec {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            (self.sec, self.nsec).serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Timespec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        } else {
            let (sec, nsec) = <(u64, u32)>::deserialize(deserializer)?;
            if nsec >= NANOS_PER_SEC {
                return Err(serde::de::Error::custom("nanoseconds out of range"));
            }
            Ok(Timespec { sec, nsec })
        }
    }
}
