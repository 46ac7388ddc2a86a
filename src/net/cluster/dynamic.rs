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

//! Clusters whose membership is driven by an external discovery source.

use std::{collections::HashSet, sync::Arc};

use parking_lot::Mutex;

use super::{
    host_map::HostMap, priority_set::HostUpdate, priority_state::LocalityWeightsMap, Cluster,
    ClusterType, PriorityStateManager,
};
use crate::{
    config::ClusterLoadAssignment,
    net::endpoint::{HealthFlag, Host, HostVector, SharedHost},
};

/// The outcome of diffing a priority's hosts against a discovery update.
#[derive(Debug, Default)]
pub struct HostListDiff {
    /// New hosts, and existing hosts that moved into this priority.
    pub hosts_added: HostVector,
    /// Hosts that left this priority.
    pub hosts_removed: HostVector,
    /// Whether the priority must be reinstalled: its membership changed, or
    /// an existing host changed weight, coarse health or metadata.
    pub hosts_changed: bool,
}

/// Copies `flag` from `updated` to `existing`, returning whether that
/// changed the coarse health of `existing`.
fn update_health_flag(updated: &Host, existing: &Host, flag: HealthFlag) -> bool {
    if existing.health_flag_get(flag) == updated.health_flag_get(flag) {
        return false;
    }

    let previous_health = existing.health();
    if updated.health_flag_get(flag) {
        existing.health_flag_set(flag);
    } else {
        existing.health_flag_clear(flag);
    }

    previous_health != existing.health()
}

impl Cluster {
    /// Diffs `new_hosts` against `current_priority_hosts`, the hosts of one
    /// priority, leaving the hosts the priority should now contain in
    /// `current_priority_hosts`.
    ///
    /// Hosts are matched by address against `all_hosts`, the hosts of every
    /// priority. A matched host is updated in place and kept, unless its
    /// locality, health check address or active health checking setting
    /// changed, in which case the new host replaces it. With a health checker
    /// and without `ignore_health_on_host_removal`, a removed host that still
    /// passes its checks stays as pending dynamic removal, unless
    /// `all_new_hosts` shows another priority taking it over.
    pub fn update_dynamic_host_list(
        &self,
        new_hosts: &[SharedHost],
        current_priority_hosts: &mut HostVector,
        all_hosts: &HostMap,
        all_new_hosts: &HashSet<String>,
    ) -> HostListDiff {
        let config = self.info().config();
        let has_health_checker = self.health_checker().is_some();

        let mut diff = HostListDiff::default();
        let mut max_host_weight = 1;

        let mut existing_hosts_for_current_priority = HashSet::new();
        let mut new_hosts_for_current_priority = HashSet::new();
        let mut hosts_with_updated_locality = HashSet::new();
        let mut hosts_with_active_health_check_flag_changed = HashSet::new();
        let mut final_hosts = HostVector::with_capacity(new_hosts.len());

        for host in new_hosts {
            let address = host.address().to_string();
            let existing = all_hosts.get(&address);

            if let Some(existing) = existing {
                existing.health_flag_clear(HealthFlag::PendingDynamicRemoval);
            }

            let (health_check_address_changed, locality_changed, active_health_check_flag_changed) =
                existing.map_or((false, false, false), |existing| {
                    (
                        has_health_checker
                            && existing.health_check_address() != host.health_check_address(),
                        existing.locality() != host.locality(),
                        has_health_checker
                            && existing.disable_active_health_check()
                                != host.disable_active_health_check(),
                    )
                });

            if locality_changed {
                hosts_with_updated_locality.insert(address.clone());
            }
            if active_health_check_flag_changed {
                hosts_with_active_health_check_flag_changed.insert(address.clone());
            }

            let skip_inplace_host_update =
                health_check_address_changed || locality_changed || active_health_check_flag_changed;

            match existing {
                Some(existing) if !skip_inplace_host_update => {
                    existing_hosts_for_current_priority.insert(address);
                    max_host_weight = max_host_weight.max(host.weight());

                    if existing.weight() != host.weight() {
                        existing.set_weight(host.weight());
                        diff.hosts_changed = true;
                    }

                    diff.hosts_changed |=
                        update_health_flag(host, existing, HealthFlag::FailedEdsHealth);
                    diff.hosts_changed |=
                        update_health_flag(host, existing, HealthFlag::DegradedEdsHealth);

                    if *existing.metadata() != *host.metadata() {
                        existing.set_metadata(host.metadata());
                        existing.set_canary(host.canary());
                        diff.hosts_changed = true;
                    }

                    if existing.priority() != host.priority() {
                        existing.set_priority(host.priority());
                        diff.hosts_added.push(existing.clone());
                    }

                    final_hosts.push(existing.clone());
                }
                _ => {
                    if existing.is_some() {
                        tracing::debug!(
                            cluster = %config.name,
                            %address,
                            locality_changed,
                            health_check_address_changed,
                            active_health_check_flag_changed,
                            "replacing host instead of updating it in place"
                        );
                    }

                    new_hosts_for_current_priority.insert(address);
                    max_host_weight = max_host_weight.max(host.weight());

                    if has_health_checker && !host.disable_active_health_check() {
                        host.health_flag_set(HealthFlag::FailedActiveHc);
                        if config.ignore_new_hosts_until_first_hc {
                            host.health_flag_set(HealthFlag::PendingActiveHc);
                        }
                    }

                    final_hosts.push(host.clone());
                    diff.hosts_added.push(host.clone());
                }
            }
        }

        current_priority_hosts
            .retain(|host| !existing_hosts_for_current_priority.remove(&host.address().to_string()));

        // Matched hosts that were not in this priority moved here from another one.
        if !existing_hosts_for_current_priority.is_empty() {
            diff.hosts_changed = true;
        }

        let dont_remove_healthy_hosts =
            has_health_checker && !config.ignore_health_on_host_removal;
        if !current_priority_hosts.is_empty() && dont_remove_healthy_hosts {
            current_priority_hosts.retain(|host| {
                let address = host.address().to_string();
                if hosts_with_updated_locality.contains(&address)
                    || hosts_with_active_health_check_flag_changed.contains(&address)
                {
                    return true;
                }

                // Another priority reuses this host, so it leaves this one now.
                if all_new_hosts.contains(&address)
                    && !new_hosts_for_current_priority.contains(&address)
                {
                    return true;
                }

                let failing = host.health_flag_get(HealthFlag::FailedActiveHc)
                    || host.health_flag_get(HealthFlag::FailedEdsHealth);
                if failing || host.disable_active_health_check() {
                    return true;
                }

                tracing::debug!(
                    cluster = %config.name,
                    %address,
                    "keeping removed host until it fails health checks"
                );
                max_host_weight = max_host_weight.max(host.weight());
                host.health_flag_set(HealthFlag::PendingDynamicRemoval);
                final_hosts.push(host.clone());
                false
            });
        }

        self.info()
            .stats()
            .max_host_weight
            .set(i64::from(max_host_weight));

        if !diff.hosts_added.is_empty() || !current_priority_hosts.is_empty() {
            diff.hosts_removed = std::mem::take(current_priority_hosts);
            diff.hosts_changed = true;
        }

        *current_priority_hosts = final_hosts;
        diff
    }
}

/// A cluster fed with load assignments by an external discovery source.
pub struct DynamicCluster {
    cluster: Arc<Cluster>,
    locality_weights_map: Mutex<Vec<LocalityWeightsMap>>,
}

impl DynamicCluster {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self {
            cluster,
            locality_weights_map: Mutex::default(),
        }
    }

    /// Applies a discovery update to every priority in one batch. Priorities
    /// that exist but are absent from `assignment` are emptied.
    pub fn on_load_assignment(&self, assignment: &ClusterLoadAssignment) -> crate::Result<()> {
        let cluster = &self.cluster;
        let info = cluster.info();
        info.config().validate_load_assignment(assignment)?;
        for group in &assignment.endpoints {
            cluster.validate_endpoints_for_zone_aware_routing(group)?;
        }

        let overprovisioning_factor = assignment
            .overprovisioning_factor
            .unwrap_or(info.config().overprovisioning_factor);
        let all_hosts = cluster.priority_set().cross_priority_host_map();

        let cluster_rebuilt = cluster.priority_set().batch_host_update(|scope| {
            let priority_set = scope.priority_set();
            let mut manager = PriorityStateManager::new(priority_set, info, Some(scope as &mut dyn HostUpdate));
            let mut all_new_hosts = HashSet::new();

            for group in &assignment.endpoints {
                manager.initialize_priority_for(group);
                for endpoint in &group.lb_endpoints {
                    all_new_hosts.insert(endpoint.address.to_string());
                    manager.register_host_for_priority(Host::from_lb_endpoint(group, endpoint), group);
                }
            }

            let priority_state = manager.priority_state().to_vec();
            let existing_priorities = priority_set.host_sets_per_priority().len();
            let mut cluster_rebuilt = false;

            for priority in 0..priority_state.len().max(existing_priorities) {
                let (new_hosts, new_locality_weights) = priority_state
                    .get(priority)
                    .map(|state| {
                        (
                            state.hosts.clone().unwrap_or_default(),
                            state.locality_weights.clone(),
                        )
                    })
                    .unwrap_or_default();

                cluster_rebuilt |= self.update_hosts_per_locality(
                    priority as u32,
                    overprovisioning_factor,
                    &new_hosts,
                    new_locality_weights,
                    &mut manager,
                    &all_hosts,
                    &all_new_hosts,
                );
            }

            cluster_rebuilt
        });

        if !cluster_rebuilt {
            info.stats().update_no_rebuild.inc();
        }

        cluster.on_pre_init_complete();
        Ok(())
    }

    /// Handles a discovery update that carried no load assignment at all.
    pub fn on_empty_update(&self) {
        tracing::debug!(
            cluster = %self.cluster.info().name(),
            "discovery update without a load assignment"
        );
        self.cluster.info().stats().update_empty.inc();
        self.cluster.on_pre_init_complete();
    }

    #[allow(clippy::too_many_arguments)]
    fn update_hosts_per_locality(
        &self,
        priority: u32,
        overprovisioning_factor: u32,
        new_hosts: &[SharedHost],
        new_locality_weights: LocalityWeightsMap,
        manager: &mut PriorityStateManager<'_>,
        all_hosts: &HostMap,
        all_new_hosts: &HashSet<String>,
    ) -> bool {
        let host_set = self
            .cluster
            .priority_set()
            .get_or_create_host_set(priority, Some(overprovisioning_factor));
        let mut current_hosts = HostVector::clone(&host_set.hosts());

        let diff = self.cluster.update_dynamic_host_list(
            new_hosts,
            &mut current_hosts,
            all_hosts,
            all_new_hosts,
        );

        let mut locality_weights_map = self.locality_weights_map.lock();
        let index = priority as usize;
        if locality_weights_map.len() <= index {
            locality_weights_map.resize_with(index + 1, LocalityWeightsMap::new);
        }

        if !diff.hosts_changed
            && host_set.overprovisioning_factor() == overprovisioning_factor
            && locality_weights_map[index] == new_locality_weights
        {
            return false;
        }

        debug_assert!(current_hosts.iter().all(|host| host.priority() == priority));
        locality_weights_map[index] = new_locality_weights;
        drop(locality_weights_map);

        tracing::debug!(
            cluster = %self.cluster.info().name(),
            priority,
            hosts = current_hosts.len(),
            hosts_added = diff.hosts_added.len(),
            hosts_removed = diff.hosts_removed.len(),
            "hosts or locality weights changed"
        );

        manager.update_cluster_priority_set(
            priority,
            Arc::new(current_hosts),
            Some(diff.hosts_added.as_slice()),
            Some(diff.hosts_removed.as_slice()),
            None,
            Some(overprovisioning_factor),
        );

        true
    }
}

impl ClusterType for DynamicCluster {
    fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Membership arrives through [`DynamicCluster::on_load_assignment`],
    /// which completes pre-initialization on the first update.
    fn start_pre_init(&self) -> crate::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::ClusterConfig,
        net::{
            cluster::ClusterInfo,
            endpoint::{Health, Locality, Metadata},
        },
        test::{host_at, ManualHealthChecker},
    };

    fn cluster(config: ClusterConfig) -> Arc<Cluster> {
        let info = ClusterInfo::new(
            ClusterConfig {
                name: "dynamic".into(),
                ..config
            },
            &prometheus::Registry::new(),
        )
        .unwrap();

        Cluster::new(info)
    }

    fn map_of(hosts: &[SharedHost]) -> HostMap {
        hosts
            .iter()
            .map(|host| (host.address().to_string(), host.clone()))
            .collect()
    }

    fn addresses(hosts: &[SharedHost]) -> Vec<String> {
        hosts.iter().map(|host| host.address().to_string()).collect()
    }

    #[test]
    fn in_place_weight_update_keeps_identity() {
        let cluster = cluster(<_>::default());
        let original = Host::builder(([10, 0, 0, 1], 80)).weight(5).build();
        let mut current = vec![original.clone()];

        let new_hosts = vec![Host::builder(([10, 0, 0, 1], 80)).weight(7).build()];
        let diff = cluster.update_dynamic_host_list(
            &new_hosts,
            &mut current,
            &map_of(&[original.clone()]),
            &HashSet::from(["10.0.0.1:80".to_owned()]),
        );

        assert!(diff.hosts_changed);
        assert!(diff.hosts_added.is_empty());
        assert!(diff.hosts_removed.is_empty());
        assert!(Arc::ptr_eq(&original, &current[0]));
        assert_eq!(7, original.weight());
        assert_eq!(7, cluster.info().stats().max_host_weight.get());
    }

    #[test]
    fn locality_change_replaces_host() {
        let cluster = cluster(<_>::default());
        let original = Host::builder(([10, 0, 0, 1], 80))
            .locality(Locality::region("a"))
            .build();
        let mut current = vec![original.clone()];

        let replacement = Host::builder(([10, 0, 0, 1], 80))
            .locality(Locality::region("b"))
            .build();
        let diff = cluster.update_dynamic_host_list(
            &[replacement.clone()],
            &mut current,
            &map_of(&[original.clone()]),
            &HashSet::from(["10.0.0.1:80".to_owned()]),
        );

        assert!(diff.hosts_changed);
        assert!(Arc::ptr_eq(&replacement, &current[0]));
        assert!(!Arc::ptr_eq(&original, &current[0]));
        assert!(Arc::ptr_eq(&replacement, &diff.hosts_added[0]));
        assert!(Arc::ptr_eq(&original, &diff.hosts_removed[0]));
    }

    #[test]
    fn unchanged_update_is_not_a_change() {
        let cluster = cluster(<_>::default());
        let original = host_at(1);
        let mut current = vec![original.clone()];

        let diff = cluster.update_dynamic_host_list(
            &[host_at(1)],
            &mut current,
            &map_of(&[original.clone()]),
            &HashSet::from(["10.0.0.1:80".to_owned()]),
        );

        assert!(!diff.hosts_changed);
        assert!(Arc::ptr_eq(&original, &current[0]));
    }

    #[test]
    fn eds_health_and_metadata_changes() {
        let cluster = cluster(<_>::default());
        let original = host_at(1);
        let mut current = vec![original.clone()];
        let all_hosts = map_of(&[original.clone()]);
        let all_new_hosts = HashSet::from(["10.0.0.1:80".to_owned()]);

        let unhealthy = host_at(1);
        unhealthy.health_flag_set(HealthFlag::FailedEdsHealth);
        let diff =
            cluster.update_dynamic_host_list(&[unhealthy], &mut current, &all_hosts, &all_new_hosts);
        assert!(diff.hosts_changed);
        assert_eq!(Health::Unhealthy, original.health());

        // Degraded while unhealthy does not change the coarse health.
        let degraded = host_at(1);
        degraded.health_flag_set(HealthFlag::FailedEdsHealth);
        degraded.health_flag_set(HealthFlag::DegradedEdsHealth);
        let diff =
            cluster.update_dynamic_host_list(&[degraded], &mut current, &all_hosts, &all_new_hosts);
        assert!(!diff.hosts_changed);
        assert!(original.health_flag_get(HealthFlag::DegradedEdsHealth));

        let mut metadata = Metadata::default();
        metadata.insert("envoy.lb", "canary", true);
        let canary = Host::builder(([10, 0, 0, 1], 80)).metadata(metadata).build();
        canary.health_flag_set(HealthFlag::FailedEdsHealth);
        canary.health_flag_set(HealthFlag::DegradedEdsHealth);
        let diff =
            cluster.update_dynamic_host_list(&[canary], &mut current, &all_hosts, &all_new_hosts);
        assert!(diff.hosts_changed);
        assert!(original.canary());
    }

    #[test]
    fn priority_move_is_an_addition() {
        let cluster = cluster(<_>::default());
        let original = host_at(1);
        let moved = Host::builder(([10, 0, 0, 1], 80)).priority(1).build();
        let mut current = HostVector::new();

        let diff = cluster.update_dynamic_host_list(
            &[moved],
            &mut current,
            &map_of(&[original.clone()]),
            &HashSet::from(["10.0.0.1:80".to_owned()]),
        );

        assert!(diff.hosts_changed);
        assert_eq!(1, original.priority());
        assert!(Arc::ptr_eq(&original, &diff.hosts_added[0]));
        assert!(diff.hosts_removed.is_empty());
    }

    #[test]
    fn new_hosts_start_failing_active_health_checks() {
        let cluster = cluster(ClusterConfig {
            ignore_new_hosts_until_first_hc: true,
            ..<_>::default()
        });
        cluster.set_health_checker(Arc::new(ManualHealthChecker::default()));

        let checked = host_at(1);
        let unchecked = Host::builder(([10, 0, 0, 2], 80))
            .disable_active_health_check(true)
            .build();
        let mut current = HostVector::new();

        let diff = cluster.update_dynamic_host_list(
            &[checked.clone(), unchecked.clone()],
            &mut current,
            &HostMap::new(),
            &HashSet::new(),
        );

        assert_eq!(2, diff.hosts_added.len());
        assert!(checked.health_flag_get(HealthFlag::FailedActiveHc));
        assert!(checked.excluded());
        assert_eq!(Health::Healthy, unchecked.health());
    }

    #[test]
    fn healthy_removed_hosts_drain_with_health_checker() {
        let cluster = cluster(<_>::default());
        cluster.set_health_checker(Arc::new(ManualHealthChecker::default()));

        let healthy = host_at(1);
        let failing = host_at(2);
        failing.health_flag_set(HealthFlag::FailedActiveHc);
        let unchecked = Host::builder(([10, 0, 0, 3], 80))
            .disable_active_health_check(true)
            .build();
        let moving = host_at(4);
        let kept = host_at(5);

        let existing = vec![
            healthy.clone(),
            failing.clone(),
            unchecked.clone(),
            moving.clone(),
            kept.clone(),
        ];
        let mut current = existing.clone();

        let diff = cluster.update_dynamic_host_list(
            &[host_at(5)],
            &mut current,
            &map_of(&existing),
            &HashSet::from(["10.0.0.4:80".to_owned(), "10.0.0.5:80".to_owned()]),
        );

        assert!(diff.hosts_changed);
        assert_eq!(addresses(&[kept.clone(), healthy.clone()]), addresses(&current));
        assert!(healthy.health_flag_get(HealthFlag::PendingDynamicRemoval));
        assert_eq!(
            addresses(&[failing, unchecked, moving]),
            addresses(&diff.hosts_removed)
        );
    }

    #[test]
    fn drain_on_removal_drops_healthy_hosts() {
        let cluster = cluster(ClusterConfig {
            ignore_health_on_host_removal: true,
            ..<_>::default()
        });
        cluster.set_health_checker(Arc::new(ManualHealthChecker::default()));

        let healthy = host_at(1);
        let mut current = vec![healthy.clone()];

        let diff = cluster.update_dynamic_host_list(
            &[],
            &mut current,
            &map_of(&[healthy.clone()]),
            &HashSet::new(),
        );

        assert!(diff.hosts_changed);
        assert!(current.is_empty());
        assert!(Arc::ptr_eq(&healthy, &diff.hosts_removed[0]));
        assert!(!healthy.health_flag_get(HealthFlag::PendingDynamicRemoval));
    }

    #[test]
    fn returning_host_clears_pending_removal() {
        let cluster = cluster(<_>::default());
        let host = host_at(1);
        host.health_flag_set(HealthFlag::PendingDynamicRemoval);
        let mut current = vec![host.clone()];

        let diff = cluster.update_dynamic_host_list(
            &[host_at(1)],
            &mut current,
            &map_of(&[host.clone()]),
            &HashSet::from(["10.0.0.1:80".to_owned()]),
        );

        assert!(!diff.hosts_changed);
        assert!(!host.health_flag_get(HealthFlag::PendingDynamicRemoval));
    }

    #[test]
    fn health_check_address_change_retains_checked_host() {
        let cluster = cluster(<_>::default());
        cluster.set_health_checker(Arc::new(ManualHealthChecker::default()));

        let original = host_at(1);
        let mut current = vec![original.clone()];

        let replacement = Host::builder(([10, 0, 0, 1], 80))
            .health_check_address(([10, 0, 0, 1], 9000))
            .build();
        let diff = cluster.update_dynamic_host_list(
            &[replacement.clone()],
            &mut current,
            &map_of(&[original.clone()]),
            &HashSet::from(["10.0.0.1:80".to_owned()]),
        );

        assert!(diff.hosts_changed);
        assert!(Arc::ptr_eq(&replacement, &diff.hosts_added[0]));
        assert!(diff.hosts_removed.is_empty());
        assert_eq!(2, current.len());
        assert!(Arc::ptr_eq(&original, &current[1]));
        assert!(original.health_flag_get(HealthFlag::PendingDynamicRemoval));
        assert!(replacement.health_flag_get(HealthFlag::FailedActiveHc));
    }
}
