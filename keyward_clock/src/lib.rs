//! Utilities for telling and faking time
//!
//! Token expiries and refresh deadlines across the `keyward` crates are
//! expressed in whole seconds since the Unix epoch. The [`Clock`] trait
//! allows swapping the system clock for a [`TestClock`] when exercising
//! time-dependent logic.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_must_use
)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

use std::{
    ops,
    time::{Duration, SystemTime},
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Unix time
///
/// Unix time as represented by the number of seconds elapsed since the
/// beginning of the Unix epoch on 1970/01/01 at 00:00:00 UTC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[repr(transparent)]
pub struct UnixTime(pub u64);

/// A duration measured in whole seconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[repr(transparent)]
pub struct DurationSecs(pub u64);

impl From<SystemTime> for UnixTime {
    #[inline]
    fn from(t: SystemTime) -> Self {
        // Times before the epoch are clamped rather than rejected.
        let time = t
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        UnixTime(time)
    }
}

impl From<DurationSecs> for Duration {
    #[inline]
    fn from(d: DurationSecs) -> Self {
        Duration::from_secs(d.0)
    }
}

impl From<Duration> for DurationSecs {
    #[inline]
    fn from(d: Duration) -> Self {
        DurationSecs(d.as_secs())
    }
}

impl ops::Add<DurationSecs> for UnixTime {
    type Output = UnixTime;

    #[inline]
    fn add(self, rhs: DurationSecs) -> Self::Output {
        UnixTime(self.0.saturating_add(rhs.0))
    }
}

impl ops::Sub<DurationSecs> for UnixTime {
    type Output = UnixTime;

    #[inline]
    fn sub(self, rhs: DurationSecs) -> Self::Output {
        UnixTime(self.0.saturating_sub(rhs.0))
    }
}

/// The distance between two times, saturating at zero when `rhs` is later
impl ops::Sub<UnixTime> for UnixTime {
    type Output = DurationSecs;

    #[inline]
    fn sub(self, rhs: UnixTime) -> Self::Output {
        DurationSecs(self.0.saturating_sub(rhs.0))
    }
}

impl ops::Add for DurationSecs {
    type Output = DurationSecs;

    #[inline]
    fn add(self, rhs: DurationSecs) -> Self::Output {
        DurationSecs(self.0.saturating_add(rhs.0))
    }
}

#[cfg(feature = "serde")]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl Serialize for UnixTime {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[cfg(feature = "serde")]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl<'de> Deserialize<'de> for UnixTime {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = u64::deserialize(deserializer)?;
        Ok(Self(s))
    }
}

#[cfg(feature = "serde")]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl Serialize for DurationSecs {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[cfg(feature = "serde")]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl<'de> Deserialize<'de> for DurationSecs {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = u64::deserialize(deserializer)?;
        Ok(Self(s))
    }
}

/// Represents a clock, which can tell the current time
pub trait Clock {
    /// Gets the current time according to this clock
    fn now(&self) -> UnixTime;
}

impl<C: Clock + ?Sized> Clock for &C {
    #[inline]
    fn now(&self) -> UnixTime {
        (**self).now()
    }
}

/// The system clock as provided by `std::time::SystemTime`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct System;

impl Clock for System {
    #[inline]
    fn now(&self) -> UnixTime {
        UnixTime::from(SystemTime::now())
    }
}

/// A test clock which maintains the current time as internal state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TestClock(UnixTime);

impl Clock for TestClock {
    #[inline]
    fn now(&self) -> UnixTime {
        self.0
    }
}

impl TestClock {
    /// Creates a new test clock with the specified time
    #[inline]
    pub const fn new(time: UnixTime) -> Self {
        Self(time)
    }

    /// Updates the clock's current time to `val`
    pub fn set(&mut self, val: UnixTime) {
        self.0 = val;
    }

    /// Advances the clock by `inc` seconds
    pub fn advance(&mut self, inc: DurationSecs) {
        self.0 = self.0 + inc;
    }
}
