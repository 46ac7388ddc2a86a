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

//! Upstream hosts: a network endpoint plus the mutable health, weight and
//! usage state accumulated while it is part of a cluster.

pub(crate) mod address;
pub mod health;
pub mod load_metrics;
pub(crate) mod locality;
pub mod metadata;

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwap;

use crate::config::endpoints::{HealthStatus, LbEndpoint, LocalityLbEndpoints};

pub use self::{
    address::{AddressKind, EndpointAddress, ParseError},
    health::{ActiveHealthFailureType, Health, HealthFlag, HealthFlags},
    load_metrics::{LoadMetricStat, LoadMetricStats},
    locality::Locality,
    metadata::Metadata,
};

/// The smallest load balancing weight a host can carry.
pub const MIN_WEIGHT: u32 = 1;
/// The largest load balancing weight a host can carry.
pub const MAX_WEIGHT: u32 = 128;

/// Hosts are shared between every host set generation, health checkers and
/// in-flight connections. A host is dropped with its last reference.
pub type SharedHost = Arc<Host>;
/// An ordered sequence of hosts.
pub type HostVector = Vec<SharedHost>;

/// A single upstream host. The description (address, locality,
/// health-check settings) is fixed at creation, everything else may be
/// updated in place from the control thread while workers read it.
pub struct Host {
    address: EndpointAddress,
    health_check_address: EndpointAddress,
    hostname: String,
    health_checks_hostname: String,
    locality: Locality,
    disable_active_health_check: bool,
    metadata: ArcSwap<Metadata>,
    canary: AtomicBool,
    priority: AtomicU32,
    health_flags: AtomicU32,
    weight: AtomicU32,
    used: AtomicBool,
    active_health_failure_type: AtomicU8,
    load_metric_stats: LoadMetricStats,
}

impl Host {
    /// Creates a builder for a host at `address`.
    pub fn builder(address: impl Into<EndpointAddress>) -> HostBuilder {
        HostBuilder::new(address.into())
    }

    /// Creates a host from a discovered endpoint and the group it was
    /// delivered in.
    pub fn from_lb_endpoint(group: &LocalityLbEndpoints, endpoint: &LbEndpoint) -> SharedHost {
        Self::builder(endpoint.address.clone())
            .hostname(endpoint.hostname.clone())
            .health_check_address(endpoint.health_check_address())
            .health_checks_hostname(endpoint.health_check.hostname.clone())
            .locality(group.locality.clone())
            .priority(group.priority)
            .weight(endpoint.weight())
            .metadata(endpoint.metadata.clone())
            .health_status(endpoint.health_status)
            .disable_active_health_check(endpoint.disable_active_health_check)
            .build()
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    pub fn health_check_address(&self) -> &EndpointAddress {
        &self.health_check_address
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The hostname used by health checks, falling back to [`Self::hostname`].
    pub fn health_checks_hostname(&self) -> &str {
        if self.health_checks_hostname.is_empty() {
            &self.hostname
        } else {
            &self.health_checks_hostname
        }
    }

    pub fn locality(&self) -> &Locality {
        &self.locality
    }

    pub fn disable_active_health_check(&self) -> bool {
        self.disable_active_health_check
    }

    pub fn metadata(&self) -> Arc<Metadata> {
        self.metadata.load_full()
    }

    /// Replaces the metadata. The canary flag is not re-derived, callers
    /// update it alongside with [`Self::set_canary`].
    pub fn set_metadata(&self, metadata: Arc<Metadata>) {
        self.metadata.store(metadata);
    }

    pub fn canary(&self) -> bool {
        self.canary.load(Ordering::Relaxed)
    }

    pub fn set_canary(&self, canary: bool) {
        self.canary.store(canary, Ordering::Relaxed);
    }

    pub fn priority(&self) -> u32 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: u32) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub fn health_flags(&self) -> HealthFlags {
        HealthFlags::from_bits(self.health_flags.load(Ordering::Acquire))
    }

    pub fn health_flag_get(&self, flag: HealthFlag) -> bool {
        self.health_flags().contains(flag)
    }

    pub fn health_flag_set(&self, flag: HealthFlag) {
        self.health_flags.fetch_or(flag.bit(), Ordering::AcqRel);
    }

    pub fn health_flag_clear(&self, flag: HealthFlag) {
        self.health_flags.fetch_and(!flag.bit(), Ordering::AcqRel);
    }

    /// The coarse health derived from the current flags.
    pub fn health(&self) -> Health {
        self.health_flags().health()
    }

    /// Whether the host is left out of load balancing weight calculations.
    pub fn excluded(&self) -> bool {
        self.health_flags().is_excluded()
    }

    /// Applies the health reported by discovery.
    pub fn set_eds_health_flag(&self, health_status: HealthStatus) {
        match health_status {
            HealthStatus::Unhealthy | HealthStatus::Draining | HealthStatus::Timeout => {
                self.health_flag_set(HealthFlag::FailedEdsHealth)
            }
            HealthStatus::Degraded => self.health_flag_set(HealthFlag::DegradedEdsHealth),
            HealthStatus::Unknown | HealthStatus::Healthy => {}
        }
    }

    pub fn active_health_failure_type(&self) -> ActiveHealthFailureType {
        ActiveHealthFailureType::from_u8(self.active_health_failure_type.load(Ordering::Relaxed))
    }

    pub fn set_active_health_failure_type(&self, failure_type: ActiveHealthFailureType) {
        self.active_health_failure_type
            .store(failure_type as u8, Ordering::Relaxed);
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    /// Sets the weight, clamped to `[MIN_WEIGHT, MAX_WEIGHT]`.
    pub fn set_weight(&self, weight: u32) {
        self.weight
            .store(weight.clamp(MIN_WEIGHT, MAX_WEIGHT), Ordering::Relaxed);
    }

    pub fn used(&self) -> bool {
        self.used.load(Ordering::Relaxed)
    }

    pub fn set_used(&self, used: bool) {
        self.used.store(used, Ordering::Relaxed);
    }

    pub fn load_metric_stats(&self) -> &LoadMetricStats {
        &self.load_metric_stats
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("address", &self.address.to_string())
            .field("locality", &self.locality)
            .field("priority", &self.priority())
            .field("weight", &self.weight())
            .field("health_flags", &self.health_flags())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.address, f)
    }
}

/// Builds a [`Host`].
#[derive(Debug)]
#[must_use]
pub struct HostBuilder {
    address: EndpointAddress,
    health_check_address: Option<EndpointAddress>,
    hostname: String,
    health_checks_hostname: String,
    locality: Locality,
    priority: u32,
    weight: u32,
    metadata: Metadata,
    health_status: HealthStatus,
    disable_active_health_check: bool,
}

impl HostBuilder {
    fn new(address: EndpointAddress) -> Self {
        Self {
            address,
            health_check_address: None,
            hostname: String::new(),
            health_checks_hostname: String::new(),
            locality: Locality::default(),
            priority: 0,
            weight: MIN_WEIGHT,
            metadata: Metadata::default(),
            health_status: HealthStatus::default(),
            disable_active_health_check: false,
        }
    }

    pub fn health_check_address(mut self, address: impl Into<EndpointAddress>) -> Self {
        self.health_check_address = Some(address.into());
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn health_checks_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.health_checks_hostname = hostname.into();
        self
    }

    pub fn locality(mut self, locality: Locality) -> Self {
        self.locality = locality;
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn health_status(mut self, health_status: HealthStatus) -> Self {
        self.health_status = health_status;
        self
    }

    pub fn disable_active_health_check(mut self, disable: bool) -> Self {
        self.disable_active_health_check = disable;
        self
    }

    pub fn build(self) -> SharedHost {
        let host = Host {
            health_check_address: self
                .health_check_address
                .unwrap_or_else(|| self.address.clone()),
            address: self.address,
            hostname: self.hostname,
            health_checks_hostname: self.health_checks_hostname,
            locality: self.locality,
            disable_active_health_check: self.disable_active_health_check,
            canary: AtomicBool::new(self.metadata.canary()),
            metadata: ArcSwap::from_pointee(self.metadata),
            priority: AtomicU32::new(self.priority),
            health_flags: AtomicU32::new(0),
            weight: AtomicU32::new(self.weight.clamp(MIN_WEIGHT, MAX_WEIGHT)),
            used: AtomicBool::new(false),
            active_health_failure_type: AtomicU8::new(ActiveHealthFailureType::Unknown as u8),
            load_metric_stats: LoadMetricStats::default(),
        };
        host.set_eds_health_flag(self.health_status);

        Arc::new(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_is_clamped() {
        let host = Host::builder(([127, 0, 0, 1], 80)).weight(0).build();
        assert_eq!(MIN_WEIGHT, host.weight());

        host.set_weight(1000);
        assert_eq!(MAX_WEIGHT, host.weight());

        host.set_weight(42);
        assert_eq!(42, host.weight());
    }

    #[test]
    fn eds_health_status() {
        for (status, expected) in [
            (HealthStatus::Unknown, Health::Healthy),
            (HealthStatus::Healthy, Health::Healthy),
            (HealthStatus::Unhealthy, Health::Unhealthy),
            (HealthStatus::Draining, Health::Unhealthy),
            (HealthStatus::Timeout, Health::Unhealthy),
            (HealthStatus::Degraded, Health::Degraded),
        ] {
            let host = Host::builder(([127, 0, 0, 1], 80))
                .health_status(status)
                .build();
            assert_eq!(expected, host.health(), "{status:?}");
        }
    }

    #[test]
    fn canary_and_locality() {
        let mut metadata = Metadata::default();
        metadata.insert(metadata::LB_KEY, metadata::CANARY_KEY, true);

        let host = Host::builder(([10, 0, 0, 1], 80))
            .locality(Locality::region("us-west").zone("b"))
            .metadata(metadata)
            .build();

        assert!(host.canary());
        assert_eq!("b", host.locality().zone);
        assert_eq!(host.address(), host.health_check_address());
    }

    #[test]
    fn from_lb_endpoint() {
        let group = LocalityLbEndpoints::new(2, Locality::region("eu"));
        let mut endpoint = LbEndpoint::new(([10, 0, 0, 1], 80)).with_weight(7);
        endpoint.hostname = "backend-1".into();
        endpoint.health_check.port = 9000;
        endpoint.health_check.hostname = "hc.backend-1".into();

        let host = Host::from_lb_endpoint(&group, &endpoint);

        assert_eq!(2, host.priority());
        assert_eq!(7, host.weight());
        assert_eq!("backend-1", host.hostname());
        assert_eq!("hc.backend-1", host.health_checks_hostname());
        assert_eq!(9000, host.health_check_address().port());
        assert_eq!(&Locality::region("eu"), host.locality());
    }

    #[test]
    fn flags_and_usage() {
        let host = Host::builder(([10, 0, 0, 1], 80)).build();
        assert!(!host.used());
        host.set_used(true);
        assert!(host.used());

        host.health_flag_set(HealthFlag::PendingActiveHc);
        assert!(host.excluded());
        assert_eq!(Health::Healthy, host.health());
        host.health_flag_clear(HealthFlag::PendingActiveHc);
        assert!(!host.excluded());

        host.set_active_health_failure_type(ActiveHealthFailureType::Timeout);
        assert_eq!(
            ActiveHealthFailureType::Timeout,
            host.active_health_failure_type()
        );
    }
}
