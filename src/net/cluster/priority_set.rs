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

//! Every priority level of a cluster, with change notification and batched
//! multi-priority updates.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use super::{
    callbacks::{CallbackHandle, CallbackList, MemberUpdateCb, PriorityUpdateCb},
    host_map::{empty_host_map, CrossPriorityHostMap, SharedHostMap},
    host_set::{HostSet, SharedLocalityWeights, UpdateHostsParams},
};
use crate::net::endpoint::{Host, HostVector, SharedHost};

/// A destination for per-priority host updates, either a [`PrioritySet`]
/// directly or a [`BatchUpdateScope`] collecting several priorities.
pub trait HostUpdate {
    fn update_hosts(
        &mut self,
        priority: u32,
        params: UpdateHostsParams,
        locality_weights: Option<SharedLocalityWeights>,
        hosts_added: &[SharedHost],
        hosts_removed: &[SharedHost],
        overprovisioning_factor: Option<u32>,
    );
}

/// The host sets of a cluster, one per priority from zero up to the highest
/// priority seen so far.
pub struct PrioritySet {
    host_sets: ArcSwap<Vec<Arc<HostSet>>>,
    // Keeps every host set forwarding to `priority_update_cbs`.
    host_set_handles: Mutex<Vec<CallbackHandle>>,
    member_update_cbs: CallbackList<MemberUpdateCb>,
    priority_update_cbs: Arc<CallbackList<PriorityUpdateCb>>,
    batch_update: AtomicBool,
    cross_priority_host_map: Option<CrossPriorityHostMap>,
}

impl PrioritySet {
    /// A priority set without a cross priority host map.
    pub fn new() -> Self {
        Self::with_host_map(None)
    }

    /// The priority set owned by a cluster, which also maintains the address
    /// index across all of its priorities.
    pub fn main() -> Self {
        Self::with_host_map(Some(CrossPriorityHostMap::new()))
    }

    fn with_host_map(cross_priority_host_map: Option<CrossPriorityHostMap>) -> Self {
        Self {
            host_sets: ArcSwap::default(),
            host_set_handles: Mutex::default(),
            member_update_cbs: CallbackList::new(),
            priority_update_cbs: Arc::new(CallbackList::new()),
            batch_update: AtomicBool::new(false),
            cross_priority_host_map,
        }
    }

    /// The host sets, indexed by priority.
    pub fn host_sets_per_priority(&self) -> Arc<Vec<Arc<HostSet>>> {
        self.host_sets.load_full()
    }

    pub fn host_set(&self, priority: u32) -> Option<Arc<HostSet>> {
        self.host_sets.load().get(priority as usize).cloned()
    }

    /// Returns the host set at `priority`, creating it and every missing
    /// lower priority first. The host set at `priority` is created with
    /// `overprovisioning_factor`, intermediate ones with the default.
    pub fn get_or_create_host_set(
        &self,
        priority: u32,
        overprovisioning_factor: Option<u32>,
    ) -> Arc<HostSet> {
        let mut handles = self.host_set_handles.lock();
        let current = self.host_sets.load_full();
        if let Some(host_set) = current.get(priority as usize) {
            return host_set.clone();
        }

        let mut host_sets = Vec::clone(&current);
        for index in current.len() as u32..=priority {
            let factor = (index == priority)
                .then_some(overprovisioning_factor)
                .flatten();
            let host_set = Arc::new(HostSet::new(index, factor));

            let priority_update_cbs = self.priority_update_cbs.clone();
            handles.push(host_set.add_priority_update_cb(
                move |priority, hosts_added, hosts_removed| {
                    for callback in priority_update_cbs.snapshot() {
                        callback(priority, hosts_added, hosts_removed);
                    }
                },
            ));

            tracing::trace!(priority = index, "created host set");
            host_sets.push(host_set);
        }

        let host_set = host_sets[priority as usize].clone();
        self.host_sets.store(Arc::new(host_sets));
        host_set
    }

    /// Fired once per logical update with the hosts added to and removed from
    /// the whole priority set.
    pub fn add_member_update_cb(
        &self,
        callback: impl Fn(&[SharedHost], &[SharedHost]) + Send + Sync + 'static,
    ) -> CallbackHandle {
        self.member_update_cbs.add(Arc::new(callback))
    }

    /// Fired after each host set update with its priority and the hosts
    /// added to and removed from that priority.
    pub fn add_priority_update_cb(
        &self,
        callback: impl Fn(u32, &[SharedHost], &[SharedHost]) + Send + Sync + 'static,
    ) -> CallbackHandle {
        self.priority_update_cbs.add(Arc::new(callback))
    }

    /// Installs new hosts at `priority`. Member update callbacks fire
    /// immediately unless a batch update is in progress.
    pub fn update_hosts(
        &self,
        priority: u32,
        params: UpdateHostsParams,
        locality_weights: Option<SharedLocalityWeights>,
        hosts_added: &[SharedHost],
        hosts_removed: &[SharedHost],
        overprovisioning_factor: Option<u32>,
    ) {
        if let Some(host_map) = &self.cross_priority_host_map {
            host_map.update(priority, hosts_added, hosts_removed, |removed| {
                self.surviving_host(priority, &params.hosts, removed)
            });
        }

        self.get_or_create_host_set(priority, overprovisioning_factor)
            .update_hosts(
                params,
                locality_weights,
                hosts_added,
                hosts_removed,
                overprovisioning_factor,
            );

        if !self.batch_update.load(Ordering::Acquire) {
            self.run_update_callbacks(hosts_added, hosts_removed);
        }
    }

    /// Another host still installed at the address of `removed`, looking at
    /// the new hosts of `priority` before the other priorities.
    fn surviving_host(
        &self,
        priority: u32,
        hosts: &[SharedHost],
        removed: &SharedHost,
    ) -> Option<SharedHost> {
        let same_address = |host: &&SharedHost| {
            host.address() == removed.address() && !Arc::ptr_eq(host, removed)
        };

        hosts.iter().find(same_address).cloned().or_else(|| {
            self.host_sets
                .load()
                .iter()
                .filter(|host_set| host_set.priority() != priority)
                .find_map(|host_set| host_set.hosts().iter().find(same_address).cloned())
        })
    }

    /// Runs `callback` with a scope that updates any number of priorities,
    /// each at most once. Member update callbacks fire once afterwards with
    /// the net change, so a host moving between priorities is reported as
    /// neither added nor removed.
    pub fn batch_host_update<R>(&self, callback: impl FnOnce(&mut BatchUpdateScope<'_>) -> R) -> R {
        let mut scope = BatchUpdateScope::new(self);
        let result = callback(&mut scope);

        let net_hosts_added = scope.all_hosts_added.without(&scope.all_hosts_removed);
        let net_hosts_removed = scope.all_hosts_removed.without(&scope.all_hosts_added);
        drop(scope);

        tracing::debug!(
            hosts_added = net_hosts_added.len(),
            hosts_removed = net_hosts_removed.len(),
            "batch host update complete"
        );
        self.run_update_callbacks(&net_hosts_added, &net_hosts_removed);

        result
    }

    /// The address index over every priority, publishing pending changes.
    /// Empty unless this is a [`PrioritySet::main`] set.
    pub fn cross_priority_host_map(&self) -> SharedHostMap {
        self.cross_priority_host_map
            .as_ref()
            .map_or_else(empty_host_map, CrossPriorityHostMap::get)
    }

    fn run_update_callbacks(&self, hosts_added: &[SharedHost], hosts_removed: &[SharedHost]) {
        for callback in self.member_update_cbs.snapshot() {
            callback(hosts_added, hosts_removed);
        }
    }
}

impl Default for PrioritySet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PrioritySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrioritySet")
            .field("host_sets", &self.host_sets.load())
            .field("cross_priority_host_map", &self.cross_priority_host_map)
            .finish_non_exhaustive()
    }
}

impl HostUpdate for &PrioritySet {
    fn update_hosts(
        &mut self,
        priority: u32,
        params: UpdateHostsParams,
        locality_weights: Option<SharedLocalityWeights>,
        hosts_added: &[SharedHost],
        hosts_removed: &[SharedHost],
        overprovisioning_factor: Option<u32>,
    ) {
        PrioritySet::update_hosts(
            *self,
            priority,
            params,
            locality_weights,
            hosts_added,
            hosts_removed,
            overprovisioning_factor,
        );
    }
}

/// Hosts deduplicated by identity, in first-seen order.
#[derive(Default)]
struct HostList {
    hosts: HostVector,
    seen: HashSet<*const Host>,
}

impl HostList {
    fn extend(&mut self, hosts: &[SharedHost]) {
        for host in hosts {
            if self.seen.insert(Arc::as_ptr(host)) {
                self.hosts.push(host.clone());
            }
        }
    }

    fn without(&self, excluded: &HostList) -> HostVector {
        self.hosts
            .iter()
            .filter(|host| !excluded.seen.contains(&Arc::as_ptr(host)))
            .cloned()
            .collect()
    }
}

/// Collects per-priority updates made during
/// [`PrioritySet::batch_host_update`].
pub struct BatchUpdateScope<'a> {
    parent: &'a PrioritySet,
    all_hosts_added: HostList,
    all_hosts_removed: HostList,
    priorities: HashSet<u32>,
}

impl<'a> BatchUpdateScope<'a> {
    fn new(parent: &'a PrioritySet) -> Self {
        parent.batch_update.store(true, Ordering::Release);
        Self {
            parent,
            all_hosts_added: HostList::default(),
            all_hosts_removed: HostList::default(),
            priorities: HashSet::new(),
        }
    }

    pub fn priority_set(&self) -> &'a PrioritySet {
        self.parent
    }
}

impl HostUpdate for BatchUpdateScope<'_> {
    /// # Panics
    /// If `priority` was already updated in this batch.
    fn update_hosts(
        &mut self,
        priority: u32,
        params: UpdateHostsParams,
        locality_weights: Option<SharedLocalityWeights>,
        hosts_added: &[SharedHost],
        hosts_removed: &[SharedHost],
        overprovisioning_factor: Option<u32>,
    ) {
        assert!(
            self.priorities.insert(priority),
            "priority {priority} updated twice in one batch"
        );

        self.all_hosts_added.extend(hosts_added);
        self.all_hosts_removed.extend(hosts_removed);

        self.parent.update_hosts(
            priority,
            params,
            locality_weights,
            hosts_added,
            hosts_removed,
            overprovisioning_factor,
        );
    }
}

impl Drop for BatchUpdateScope<'_> {
    fn drop(&mut self) {
        self.parent.batch_update.store(false, Ordering::Release);
    }
}
