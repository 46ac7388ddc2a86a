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

//! Address index spanning every priority of a cluster.

use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::net::endpoint::SharedHost;

/// Hosts keyed by their address string.
pub type HostMap = HashMap<String, SharedHost>;
pub type SharedHostMap = Arc<HostMap>;

/// The shared map with no hosts.
pub fn empty_host_map() -> SharedHostMap {
    static EMPTY: Lazy<SharedHostMap> = Lazy::new(SharedHostMap::default);
    EMPTY.clone()
}

/// A copy on write host map. Structural changes go to a private overlay
/// cloned from the published map, the overlay becomes the published map the
/// next time the map is read.
#[derive(Default)]
pub struct CrossPriorityHostMap {
    published: ArcSwap<HostMap>,
    pending: Mutex<Option<HostMap>>,
}

impl CrossPriorityHostMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies an update of `priority`. Removals happen first, so a host
    /// replaced at the same address ends up mapped to its replacement.
    ///
    /// An entry is only erased while it is the removed host itself and still
    /// belongs to `priority`. A host that moved to another priority or was
    /// replaced at its address stays mapped. Once an entry is erased,
    /// `surviving` may name another installed host at the same address which
    /// is then mapped in its place.
    pub fn update(
        &self,
        priority: u32,
        hosts_added: &[SharedHost],
        hosts_removed: &[SharedHost],
        surviving: impl Fn(&SharedHost) -> Option<SharedHost>,
    ) {
        if hosts_added.is_empty() && hosts_removed.is_empty() {
            return;
        }

        let mut pending = self.pending.lock();
        let map = pending.get_or_insert_with(|| HostMap::clone(&self.published.load()));

        for host in hosts_removed {
            let address = host.address().to_string();
            let owned = map.get(&address).map_or(false, |existing| {
                Arc::ptr_eq(existing, host) && existing.priority() == priority
            });
            if !owned {
                continue;
            }

            match surviving(host) {
                Some(survivor) => {
                    tracing::trace!(%address, "remapping address to surviving host");
                    map.insert(address, survivor);
                }
                None => {
                    map.remove(&address);
                }
            }
        }

        for host in hosts_added {
            map.insert(host.address().to_string(), host.clone());
        }
    }

    /// Publishes pending changes, if any, and returns the current map.
    pub fn get(&self) -> SharedHostMap {
        let mut pending = self.pending.lock();
        if let Some(map) = pending.take() {
            tracing::trace!(hosts = map.len(), "publishing cross priority host map");
            self.published.store(Arc::new(map));
        }

        self.published.load_full()
    }
}

impl std::fmt::Debug for CrossPriorityHostMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossPriorityHostMap")
            .field("published", &self.published.load().len())
            .field("pending", &self.pending.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::endpoint::Host;

    #[test]
    fn copy_on_write() {
        let map = CrossPriorityHostMap::new();
        let first = Host::builder(([10, 0, 0, 1], 80)).build();
        let second = Host::builder(([10, 0, 0, 2], 80)).build();

        map.update(0, &[first.clone()], &[], |_| None);
        let published = map.get();
        assert_eq!(1, published.len());

        map.update(0, &[second.clone()], &[first.clone()], |_| None);
        assert_eq!(1, published.len(), "published maps are never mutated");

        let published = map.get();
        assert_eq!(1, published.len());
        assert!(Arc::ptr_eq(&second, &published["10.0.0.2:80"]));
        assert!(Arc::ptr_eq(&published, &map.get()));
    }

    #[test]
    fn replacement_at_same_address() {
        let map = CrossPriorityHostMap::new();
        let original = Host::builder(([10, 0, 0, 1], 80)).build();
        let replacement = Host::builder(([10, 0, 0, 1], 80)).build();

        map.update(0, &[original.clone()], &[], |_| None);
        map.update(0, &[replacement.clone()], &[original], |_| None);

        assert!(Arc::ptr_eq(&replacement, &map.get()["10.0.0.1:80"]));
    }

    #[test]
    fn moved_host_stays_mapped() {
        let map = CrossPriorityHostMap::new();
        let host = Host::builder(([10, 0, 0, 1], 80)).priority(1).build();
        map.update(1, &[host.clone()], &[], |_| None);

        host.set_priority(0);
        map.update(0, &[host.clone()], &[], |_| None);
        map.update(1, &[], &[host.clone()], |_| None);
        assert!(Arc::ptr_eq(&host, &map.get()["10.0.0.1:80"]));

        map.update(0, &[], &[host], |_| None);
        assert!(map.get().is_empty());
    }

    #[test]
    fn empty_update_is_a_no_op() {
        let map = CrossPriorityHostMap::new();
        let before = map.get();
        map.update(0, &[], &[], |_| None);
        assert!(Arc::ptr_eq(&before, &map.get()));
    }

    #[test]
    fn removing_a_stale_host_keeps_its_replacement() {
        let map = CrossPriorityHostMap::new();
        let original = Host::builder(([10, 0, 0, 1], 80)).build();
        let replacement = Host::builder(([10, 0, 0, 1], 80)).build();

        map.update(0, &[original.clone()], &[], |_| None);
        map.update(0, &[replacement.clone()], &[], |_| None);
        map.update(0, &[], &[original], |_| None);

        assert!(Arc::ptr_eq(&replacement, &map.get()["10.0.0.1:80"]));
    }

    #[test]
    fn removed_replacement_falls_back_to_survivor() {
        let map = CrossPriorityHostMap::new();
        let retained = Host::builder(([10, 0, 0, 1], 80)).build();
        let replacement = Host::builder(([10, 0, 0, 1], 80)).build();

        map.update(0, &[retained.clone()], &[], |_| None);
        map.update(0, &[replacement.clone()], &[], |_| None);
        map.update(0, &[], &[replacement], |_| Some(retained.clone()));

        assert!(Arc::ptr_eq(&retained, &map.get()["10.0.0.1:80"]));
    }
}
