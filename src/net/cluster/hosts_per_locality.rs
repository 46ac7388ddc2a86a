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

use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::net::endpoint::{Host, HostVector};

/// Shared, immutable per-locality grouping.
pub type SharedHostsPerLocality = Arc<HostsPerLocality>;

/// A predicate deciding whether a host is kept by [`HostsPerLocality::filter`].
pub type HostPredicate<'a> = &'a dyn Fn(&Host) -> bool;

/// Hosts grouped by locality. When [`Self::has_local_locality`] is true the
/// first group holds the hosts of the local locality, otherwise no group is
/// local.
#[derive(Clone, Debug, Default)]
pub struct HostsPerLocality {
    local: bool,
    hosts_per_locality: Vec<HostVector>,
}

impl HostsPerLocality {
    /// # Panics
    /// If `has_local_locality` is set without any locality group.
    pub fn new(hosts_per_locality: Vec<HostVector>, has_local_locality: bool) -> Self {
        assert!(
            !has_local_locality || !hosts_per_locality.is_empty(),
            "a local locality requires at least one locality group"
        );

        Self {
            local: has_local_locality,
            hosts_per_locality,
        }
    }

    /// A single locality group holding `hosts`.
    pub fn single(hosts: HostVector, has_local_locality: bool) -> Self {
        Self::new(vec![hosts], has_local_locality)
    }

    /// The shared grouping with no localities.
    pub fn empty() -> SharedHostsPerLocality {
        static EMPTY: Lazy<SharedHostsPerLocality> =
            Lazy::new(|| Arc::new(HostsPerLocality::default()));

        EMPTY.clone()
    }

    pub fn has_local_locality(&self) -> bool {
        self.local
    }

    pub fn get(&self) -> &[HostVector] {
        &self.hosts_per_locality
    }

    /// The number of locality groups.
    pub fn len(&self) -> usize {
        self.hosts_per_locality.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts_per_locality.is_empty()
    }

    /// Applies every predicate in a single pass over the hosts, returning one
    /// grouping per predicate. Each grouping keeps the locality order and
    /// local flag of `self`, and may contain empty groups.
    pub fn filter(&self, predicates: &[HostPredicate<'_>]) -> Vec<SharedHostsPerLocality> {
        let mut filtered: Vec<_> = predicates
            .iter()
            .map(|_| HostsPerLocality {
                local: self.local,
                hosts_per_locality: Vec::with_capacity(self.hosts_per_locality.len()),
            })
            .collect();

        for hosts in &self.hosts_per_locality {
            for grouping in &mut filtered {
                grouping.hosts_per_locality.push(HostVector::new());
            }

            for host in hosts {
                for (predicate, grouping) in predicates.iter().zip(&mut filtered) {
                    if predicate(host) {
                        if let Some(group) = grouping.hosts_per_locality.last_mut() {
                            group.push(host.clone());
                        }
                    }
                }
            }
        }

        filtered.into_iter().map(Arc::new).collect()
    }
}
