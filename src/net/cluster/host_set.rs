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

//! One priority level of a cluster: its host collections and the locality
//! schedulers load balancers draw from.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use super::{
    callbacks::{CallbackHandle, CallbackList, PriorityUpdateCb},
    hosts_per_locality::{HostsPerLocality, SharedHostsPerLocality},
    scheduler::EdfScheduler,
};
use crate::net::endpoint::{Health, Host, HostVector, SharedHost};

/// The overprovisioning factor used when none is configured, in percent.
pub const DEFAULT_OVERPROVISIONING_FACTOR: u32 = 140;

pub type SharedHostVector = Arc<HostVector>;
/// Load balancing weights, index aligned with a [`HostsPerLocality`].
pub type LocalityWeights = Vec<u32>;
pub type SharedLocalityWeights = Arc<LocalityWeights>;

/// The eight collections installed together by [`HostSet::update_hosts`].
#[derive(Clone, Debug)]
pub struct UpdateHostsParams {
    pub hosts: SharedHostVector,
    pub healthy_hosts: SharedHostVector,
    pub degraded_hosts: SharedHostVector,
    pub excluded_hosts: SharedHostVector,
    pub hosts_per_locality: SharedHostsPerLocality,
    pub healthy_hosts_per_locality: SharedHostsPerLocality,
    pub degraded_hosts_per_locality: SharedHostsPerLocality,
    pub excluded_hosts_per_locality: SharedHostsPerLocality,
}

impl Default for UpdateHostsParams {
    fn default() -> Self {
        let empty = SharedHostVector::default();
        Self {
            hosts: empty.clone(),
            healthy_hosts: empty.clone(),
            degraded_hosts: empty.clone(),
            excluded_hosts: empty,
            hosts_per_locality: HostsPerLocality::empty(),
            healthy_hosts_per_locality: HostsPerLocality::empty(),
            degraded_hosts_per_locality: HostsPerLocality::empty(),
            excluded_hosts_per_locality: HostsPerLocality::empty(),
        }
    }
}

/// Splits `hosts` into its healthy, degraded and excluded subsets.
pub fn partition_host_list(
    hosts: &[SharedHost],
) -> (SharedHostVector, SharedHostVector, SharedHostVector) {
    let mut healthy = HostVector::new();
    let mut degraded = HostVector::new();
    let mut excluded = HostVector::new();

    for host in hosts {
        match host.health() {
            Health::Healthy => healthy.push(host.clone()),
            Health::Degraded => degraded.push(host.clone()),
            Health::Unhealthy => {}
        }

        if host.excluded() {
            excluded.push(host.clone());
        }
    }

    (Arc::new(healthy), Arc::new(degraded), Arc::new(excluded))
}

/// The per-locality counterpart of [`partition_host_list`].
pub fn partition_hosts_per_locality(
    hosts_per_locality: &HostsPerLocality,
) -> (
    SharedHostsPerLocality,
    SharedHostsPerLocality,
    SharedHostsPerLocality,
) {
    let healthy = |host: &Host| host.health() == Health::Healthy;
    let degraded = |host: &Host| host.health() == Health::Degraded;
    let excluded = |host: &Host| host.excluded();

    let mut filtered = hosts_per_locality
        .filter(&[&healthy, &degraded, &excluded])
        .into_iter();
    let mut next = || filtered.next().unwrap_or_else(HostsPerLocality::empty);

    (next(), next(), next())
}

/// Partitions `hosts` into a complete set of update parameters.
pub fn partition_hosts(
    hosts: SharedHostVector,
    hosts_per_locality: SharedHostsPerLocality,
) -> UpdateHostsParams {
    let (healthy_hosts, degraded_hosts, excluded_hosts) = partition_host_list(&hosts);
    let (healthy_hosts_per_locality, degraded_hosts_per_locality, excluded_hosts_per_locality) =
        partition_hosts_per_locality(&hosts_per_locality);

    UpdateHostsParams {
        hosts,
        healthy_hosts,
        degraded_hosts,
        excluded_hosts,
        hosts_per_locality,
        healthy_hosts_per_locality,
        degraded_hosts_per_locality,
        excluded_hosts_per_locality,
    }
}

/// The update parameters matching the collections currently installed in
/// `host_set`.
pub fn update_hosts_params(host_set: &HostSet) -> UpdateHostsParams {
    host_set.snapshot().params.clone()
}

/// The weight a locality is scheduled with: its configured weight scaled by
/// the share of its non-excluded hosts that are eligible, amplified by the
/// overprovisioning factor and capped at the configured weight.
pub fn effective_locality_weight(
    index: usize,
    eligible_hosts_per_locality: &HostsPerLocality,
    excluded_hosts_per_locality: &HostsPerLocality,
    all_hosts_per_locality: &HostsPerLocality,
    locality_weights: &[u32],
    overprovisioning_factor: u32,
) -> f64 {
    let group_len =
        |grouping: &HostsPerLocality| grouping.get().get(index).map_or(0, |hosts| hosts.len());

    let excluded_count = group_len(excluded_hosts_per_locality);
    let host_count = group_len(all_hosts_per_locality).saturating_sub(excluded_count);
    if host_count == 0 {
        return 0.0;
    }

    let availability_ratio = group_len(eligible_hosts_per_locality) as f64 / host_count as f64;
    let effective_availability =
        (f64::from(overprovisioning_factor) / 100.0 * availability_ratio).min(1.0);
    let weight = locality_weights.get(index).copied().unwrap_or_default();

    f64::from(weight) * effective_availability
}

/// Builds the scheduler over locality indices, or `None` when there is
/// nothing to schedule.
pub fn rebuild_locality_scheduler(
    eligible_hosts_per_locality: &HostsPerLocality,
    eligible_hosts: &[SharedHost],
    all_hosts_per_locality: &HostsPerLocality,
    excluded_hosts_per_locality: &HostsPerLocality,
    locality_weights: Option<&[u32]>,
    overprovisioning_factor: u32,
) -> Option<EdfScheduler<usize>> {
    let locality_weights = locality_weights.filter(|weights| !weights.is_empty())?;
    if eligible_hosts.is_empty() {
        return None;
    }

    let mut scheduler = EdfScheduler::new();
    for index in 0..all_hosts_per_locality.len() {
        let weight = effective_locality_weight(
            index,
            eligible_hosts_per_locality,
            excluded_hosts_per_locality,
            all_hosts_per_locality,
            locality_weights,
            overprovisioning_factor,
        );

        if weight > 0.0 {
            tracing::trace!(locality = index, weight, "scheduling locality");
            scheduler.add(weight, index);
        }
    }

    (!scheduler.is_empty()).then_some(scheduler)
}

/// An immutable generation of a [`HostSet`]. Readers load one snapshot per
/// logical operation so every collection they look at is consistent.
#[derive(Debug)]
pub struct HostSetSnapshot {
    params: UpdateHostsParams,
    locality_weights: Option<SharedLocalityWeights>,
    overprovisioning_factor: u32,
    healthy_locality_scheduler: Mutex<Option<EdfScheduler<usize>>>,
    degraded_locality_scheduler: Mutex<Option<EdfScheduler<usize>>>,
}

impl HostSetSnapshot {
    fn new(
        params: UpdateHostsParams,
        locality_weights: Option<SharedLocalityWeights>,
        overprovisioning_factor: u32,
    ) -> Self {
        let weights = locality_weights.as_deref().map(Vec::as_slice);
        let healthy_locality_scheduler = rebuild_locality_scheduler(
            &params.healthy_hosts_per_locality,
            &params.healthy_hosts,
            &params.hosts_per_locality,
            &params.excluded_hosts_per_locality,
            weights,
            overprovisioning_factor,
        );
        let degraded_locality_scheduler = rebuild_locality_scheduler(
            &params.degraded_hosts_per_locality,
            &params.degraded_hosts,
            &params.hosts_per_locality,
            &params.excluded_hosts_per_locality,
            weights,
            overprovisioning_factor,
        );

        Self {
            params,
            locality_weights,
            overprovisioning_factor,
            healthy_locality_scheduler: Mutex::new(healthy_locality_scheduler),
            degraded_locality_scheduler: Mutex::new(degraded_locality_scheduler),
        }
    }

    pub fn hosts(&self) -> &SharedHostVector {
        &self.params.hosts
    }

    pub fn healthy_hosts(&self) -> &SharedHostVector {
        &self.params.healthy_hosts
    }

    pub fn degraded_hosts(&self) -> &SharedHostVector {
        &self.params.degraded_hosts
    }

    pub fn excluded_hosts(&self) -> &SharedHostVector {
        &self.params.excluded_hosts
    }

    pub fn hosts_per_locality(&self) -> &SharedHostsPerLocality {
        &self.params.hosts_per_locality
    }

    pub fn healthy_hosts_per_locality(&self) -> &SharedHostsPerLocality {
        &self.params.healthy_hosts_per_locality
    }

    pub fn degraded_hosts_per_locality(&self) -> &SharedHostsPerLocality {
        &self.params.degraded_hosts_per_locality
    }

    pub fn excluded_hosts_per_locality(&self) -> &SharedHostsPerLocality {
        &self.params.excluded_hosts_per_locality
    }

    pub fn locality_weights(&self) -> Option<&SharedLocalityWeights> {
        self.locality_weights.as_ref()
    }

    pub fn overprovisioning_factor(&self) -> u32 {
        self.overprovisioning_factor
    }

    pub fn params(&self) -> &UpdateHostsParams {
        &self.params
    }

    /// Picks the next locality to draw a healthy host from.
    pub fn choose_healthy_locality(&self) -> Option<usize> {
        choose_locality(&self.healthy_locality_scheduler)
    }

    /// Picks the next locality to draw a degraded host from.
    pub fn choose_degraded_locality(&self) -> Option<usize> {
        choose_locality(&self.degraded_locality_scheduler)
    }
}

fn choose_locality(scheduler: &Mutex<Option<EdfScheduler<usize>>>) -> Option<usize> {
    let mut scheduler = scheduler.lock();
    let picked = scheduler.as_mut()?.pick_and_add();
    assert!(
        matches!(picked, Some((_, weight)) if weight > 0.0),
        "locality schedulers never hold zero weight entries"
    );

    picked.map(|(locality, _)| locality)
}

/// The hosts of one priority level of a cluster.
pub struct HostSet {
    priority: u32,
    snapshot: ArcSwap<HostSetSnapshot>,
    callbacks: CallbackList<PriorityUpdateCb>,
}

impl HostSet {
    /// # Panics
    /// If `overprovisioning_factor` is `Some(0)`.
    pub fn new(priority: u32, overprovisioning_factor: Option<u32>) -> Self {
        let overprovisioning_factor =
            checked_overprovisioning_factor(overprovisioning_factor)
                .unwrap_or(DEFAULT_OVERPROVISIONING_FACTOR);

        Self {
            priority,
            snapshot: ArcSwap::from_pointee(HostSetSnapshot::new(
                UpdateHostsParams::default(),
                None,
                overprovisioning_factor,
            )),
            callbacks: CallbackList::new(),
        }
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// The current generation.
    pub fn snapshot(&self) -> Arc<HostSetSnapshot> {
        self.snapshot.load_full()
    }

    pub fn hosts(&self) -> SharedHostVector {
        self.snapshot.load().hosts().clone()
    }

    pub fn healthy_hosts(&self) -> SharedHostVector {
        self.snapshot.load().healthy_hosts().clone()
    }

    pub fn degraded_hosts(&self) -> SharedHostVector {
        self.snapshot.load().degraded_hosts().clone()
    }

    pub fn excluded_hosts(&self) -> SharedHostVector {
        self.snapshot.load().excluded_hosts().clone()
    }

    pub fn hosts_per_locality(&self) -> SharedHostsPerLocality {
        self.snapshot.load().hosts_per_locality().clone()
    }

    pub fn healthy_hosts_per_locality(&self) -> SharedHostsPerLocality {
        self.snapshot.load().healthy_hosts_per_locality().clone()
    }

    pub fn degraded_hosts_per_locality(&self) -> SharedHostsPerLocality {
        self.snapshot.load().degraded_hosts_per_locality().clone()
    }

    pub fn excluded_hosts_per_locality(&self) -> SharedHostsPerLocality {
        self.snapshot.load().excluded_hosts_per_locality().clone()
    }

    pub fn locality_weights(&self) -> Option<SharedLocalityWeights> {
        self.snapshot.load().locality_weights().cloned()
    }

    pub fn overprovisioning_factor(&self) -> u32 {
        self.snapshot.load().overprovisioning_factor()
    }

    pub fn choose_healthy_locality(&self) -> Option<usize> {
        self.snapshot.load().choose_healthy_locality()
    }

    pub fn choose_degraded_locality(&self) -> Option<usize> {
        self.snapshot.load().choose_degraded_locality()
    }

    /// Registers a callback fired after every update of this host set.
    pub fn add_priority_update_cb(
        &self,
        callback: impl Fn(u32, &[SharedHost], &[SharedHost]) + Send + Sync + 'static,
    ) -> CallbackHandle {
        self.callbacks.add(Arc::new(callback))
    }

    /// Installs a new generation of hosts, rebuilds both locality schedulers
    /// and notifies this host set's callbacks with `hosts_added` and
    /// `hosts_removed`.
    ///
    /// # Panics
    /// If `overprovisioning_factor` is `Some(0)`.
    pub fn update_hosts(
        &self,
        params: UpdateHostsParams,
        locality_weights: Option<SharedLocalityWeights>,
        hosts_added: &[SharedHost],
        hosts_removed: &[SharedHost],
        overprovisioning_factor: Option<u32>,
    ) {
        let overprovisioning_factor = checked_overprovisioning_factor(overprovisioning_factor)
            .unwrap_or_else(|| self.overprovisioning_factor());

        tracing::trace!(
            priority = self.priority,
            hosts = params.hosts.len(),
            healthy = params.healthy_hosts.len(),
            degraded = params.degraded_hosts.len(),
            excluded = params.excluded_hosts.len(),
            "installing host set"
        );

        self.snapshot.store(Arc::new(HostSetSnapshot::new(
            params,
            locality_weights,
            overprovisioning_factor,
        )));

        for callback in self.callbacks.snapshot() {
            callback(self.priority, hosts_added, hosts_removed);
        }
    }
}

impl std::fmt::Debug for HostSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSet")
            .field("priority", &self.priority)
            .field("snapshot", &self.snapshot.load())
            .finish()
    }
}

fn checked_overprovisioning_factor(factor: Option<u32>) -> Option<u32> {
    if let Some(factor) = factor {
        assert!(factor > 0, "the overprovisioning factor must be positive");
    }

    factor
}
