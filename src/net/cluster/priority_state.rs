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

//! Accumulates the hosts of a resolution result per priority and installs
//! them grouped by locality.

use std::{collections::BTreeMap, sync::Arc};

use super::{
    host_set::{partition_hosts, SharedHostVector},
    hosts_per_locality::HostsPerLocality,
    priority_set::{HostUpdate, PrioritySet},
    ClusterInfo,
};
use crate::{
    config::endpoints::LocalityLbEndpoints,
    net::endpoint::{HealthFlag, HostVector, Locality, SharedHost},
};

/// Configured load balancing weight of each locality of one priority.
pub type LocalityWeightsMap = BTreeMap<Locality, u32>;

/// The hosts and locality weights registered for one priority.
#[derive(Clone, Debug, Default)]
pub struct PriorityState {
    pub hosts: Option<HostVector>,
    pub locality_weights: LocalityWeightsMap,
}

/// Builds per-priority host lists, then installs them into a priority set,
/// or into a batch update scope when one is supplied.
pub struct PriorityStateManager<'a> {
    priority_set: &'a PrioritySet,
    info: &'a ClusterInfo,
    update_cb: Option<&'a mut dyn HostUpdate>,
    priority_state: Vec<PriorityState>,
}

impl<'a> PriorityStateManager<'a> {
    pub fn new(
        priority_set: &'a PrioritySet,
        info: &'a ClusterInfo,
        update_cb: Option<&'a mut dyn HostUpdate>,
    ) -> Self {
        Self {
            priority_set,
            info,
            update_cb,
            priority_state: Vec::new(),
        }
    }

    /// Makes room for the priority of `group` and records its locality
    /// weight, if it has one.
    pub fn initialize_priority_for(&mut self, group: &LocalityLbEndpoints) {
        let state = self.state_mut(group.priority);
        state.hosts.get_or_insert_with(HostVector::new);

        if let Some(weight) = group.load_balancing_weight {
            if !group.locality.is_empty() {
                state.locality_weights.insert(group.locality.clone(), weight);
            }
        }
    }

    /// Registers `host` under the priority of `group`.
    pub fn register_host_for_priority(&mut self, host: SharedHost, group: &LocalityLbEndpoints) {
        self.state_mut(group.priority)
            .hosts
            .get_or_insert_with(HostVector::new)
            .push(host);
    }

    /// Everything registered so far, indexed by priority.
    pub fn priority_state(&self) -> &[PriorityState] {
        &self.priority_state
    }

    /// Groups `hosts` by locality and installs them at `priority`.
    ///
    /// The local locality, when configured and present, comes first, the
    /// remaining localities follow in lexicographic order. When
    /// `hosts_added` is `None` every host is reported as added.
    /// `health_checker_flag` is set on every host that has not disabled
    /// active health checking.
    pub fn update_cluster_priority_set(
        &mut self,
        priority: u32,
        hosts: SharedHostVector,
        hosts_added: Option<&[SharedHost]>,
        hosts_removed: Option<&[SharedHost]>,
        health_checker_flag: Option<HealthFlag>,
        overprovisioning_factor: Option<u32>,
    ) {
        let config = self.info.config();
        let empty_weights = LocalityWeightsMap::new();
        let weights_map = self
            .priority_state
            .get(priority as usize)
            .map_or(&empty_weights, |state| &state.locality_weights);

        let mut grouped: BTreeMap<&Locality, HostVector> = BTreeMap::new();
        for host in hosts.iter() {
            if let Some(flag) = health_checker_flag {
                if !host.disable_active_health_check() {
                    host.health_flag_set(flag);
                }
            }

            grouped
                .entry(host.locality())
                .or_default()
                .push(host.clone());
        }

        let local_locality = config
            .local_locality
            .as_ref()
            .filter(|locality| grouped.contains_key(locality));
        let weight_of = |locality: &Locality| weights_map.get(locality).copied().unwrap_or(0);

        let mut per_locality = Vec::with_capacity(grouped.len());
        let mut weights = Vec::with_capacity(grouped.len());
        if let Some(local) = local_locality {
            if let Some(local_hosts) = grouped.remove(local) {
                per_locality.push(local_hosts);
                weights.push(weight_of(local));
            }
        }

        for (locality, locality_hosts) in grouped {
            per_locality.push(locality_hosts);
            weights.push(weight_of(locality));
        }

        let locality_weights = config.locality_weighted_lb.then(|| Arc::new(weights));
        let per_locality = Arc::new(HostsPerLocality::new(
            per_locality,
            local_locality.is_some(),
        ));

        tracing::trace!(
            cluster = %config.name,
            priority,
            hosts = hosts.len(),
            localities = per_locality.len(),
            "updating priority"
        );

        let hosts_added = hosts_added.unwrap_or(&hosts);
        let hosts_removed = hosts_removed.unwrap_or_default();
        let params = partition_hosts(hosts.clone(), per_locality);

        match &mut self.update_cb {
            Some(update_cb) => update_cb.update_hosts(
                priority,
                params,
                locality_weights,
                hosts_added,
                hosts_removed,
                overprovisioning_factor,
            ),
            None => self.priority_set.update_hosts(
                priority,
                params,
                locality_weights,
                hosts_added,
                hosts_removed,
                overprovisioning_factor,
            ),
        }
    }

    fn state_mut(&mut self, priority: u32) -> &mut PriorityState {
        let index = priority as usize;
        if self.priority_state.len() <= index {
            self.priority_state
                .resize_with(index + 1, PriorityState::default);
        }

        &mut self.priority_state[index]
    }
}
