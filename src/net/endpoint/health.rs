/*
 * Copyright 2024 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Health state tracked on every [`Host`][super::Host].

use std::fmt;

use strum::IntoEnumIterator;

/// An independent health bit on a host. Several flags may be set at once,
/// the host's [`Health`] is derived from the full set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::EnumIter, strum_macros::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum HealthFlag {
    /// The host is currently failing active health checks.
    FailedActiveHc = 0x01,
    /// The host is currently considered an outlier and has been ejected.
    FailedOutlierCheck = 0x02,
    /// The host is currently marked as unhealthy by discovery.
    FailedEdsHealth = 0x04,
    /// The host is currently marked as degraded through active health checking.
    DegradedActiveHc = 0x08,
    /// The host is currently marked as degraded by discovery.
    DegradedEdsHealth = 0x10,
    /// The host has been removed from discovery but is kept around while
    /// active health checking still considers it healthy.
    PendingDynamicRemoval = 0x20,
    /// The host is pending its initial active health check.
    PendingActiveHc = 0x40,
    /// The host failed a health check immediately and should be excluded
    /// from load balancing calculations.
    ExcludedViaImmediateHcFail = 0x80,
}

impl HealthFlag {
    const UNHEALTHY: u32 = Self::FailedActiveHc.bit()
        | Self::FailedOutlierCheck.bit()
        | Self::FailedEdsHealth.bit();
    const DEGRADED: u32 = Self::DegradedActiveHc.bit() | Self::DegradedEdsHealth.bit();
    const EXCLUDED: u32 = Self::PendingActiveHc.bit() | Self::ExcludedViaImmediateHcFail.bit();

    pub const fn bit(self) -> u32 {
        self as u32
    }
}

/// A set of [`HealthFlag`]s.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct HealthFlags(u32);

impl HealthFlags {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, flag: HealthFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    pub fn insert(&mut self, flag: HealthFlag) {
        self.0 |= flag.bit();
    }

    pub fn remove(&mut self, flag: HealthFlag) {
        self.0 &= !flag.bit();
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates over the flags present in the set.
    pub fn iter(self) -> impl Iterator<Item = HealthFlag> {
        HealthFlag::iter().filter(move |flag| self.contains(*flag))
    }

    /// The coarse health implied by the set of flags.
    pub const fn health(self) -> Health {
        if self.0 & HealthFlag::UNHEALTHY != 0 {
            Health::Unhealthy
        } else if self.0 & HealthFlag::DEGRADED != 0 {
            Health::Degraded
        } else {
            Health::Healthy
        }
    }

    /// Whether the flags exclude a host from load balancing weight
    /// calculations.
    pub const fn is_excluded(self) -> bool {
        self.0 & HealthFlag::EXCLUDED != 0
    }
}

impl From<HealthFlag> for HealthFlags {
    fn from(flag: HealthFlag) -> Self {
        Self(flag.bit())
    }
}

impl FromIterator<HealthFlag> for HealthFlags {
    fn from_iter<T: IntoIterator<Item = HealthFlag>>(iter: T) -> Self {
        let mut flags = Self::empty();
        for flag in iter {
            flags.insert(flag);
        }
        flags
    }
}

impl fmt::Debug for HealthFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for HealthFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for flag in self.iter() {
            if !first {
                f.write_str("|")?;
            }
            first = false;
            fmt::Display::fmt(&flag, f)?;
        }

        if first {
            f.write_str("NONE")?;
        }

        Ok(())
    }
}

/// The coarse health of a host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum Health {
    /// Not able to serve traffic.
    Unhealthy,
    /// Able to serve traffic, but non-degraded hosts should be preferred.
    Degraded,
    Healthy,
}

/// The most recent reason a host failed an active health check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ActiveHealthFailureType {
    #[default]
    Unknown = 0,
    /// The host responded that it is unhealthy.
    Unhealthy = 1,
    /// The host timed out.
    Timeout = 2,
}

impl ActiveHealthFailureType {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Unhealthy,
            2 => Self::Timeout,
            _ => Self::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coarse_health() {
        let mut flags = HealthFlags::empty();
        assert_eq!(Health::Healthy, flags.health());

        flags.insert(HealthFlag::DegradedEdsHealth);
        assert_eq!(Health::Degraded, flags.health());

        flags.insert(HealthFlag::FailedOutlierCheck);
        assert_eq!(Health::Unhealthy, flags.health());

        flags.remove(HealthFlag::FailedOutlierCheck);
        flags.remove(HealthFlag::DegradedEdsHealth);
        flags.insert(HealthFlag::PendingDynamicRemoval);
        assert_eq!(Health::Healthy, flags.health());
    }

    #[test]
    fn exclusion() {
        assert!(!HealthFlags::from(HealthFlag::FailedActiveHc).is_excluded());
        assert!(HealthFlags::from(HealthFlag::PendingActiveHc).is_excluded());
        assert!(HealthFlags::from(HealthFlag::ExcludedViaImmediateHcFail).is_excluded());
    }

    #[test]
    fn display() {
        let flags: HealthFlags = [HealthFlag::FailedActiveHc, HealthFlag::PendingActiveHc]
            .into_iter()
            .collect();
        assert_eq!("FAILED_ACTIVE_HC|PENDING_ACTIVE_HC", flags.to_string());
        assert_eq!("NONE", HealthFlags::empty().to_string());
    }
}
