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

use prometheus::{IntCounter, IntGauge, Registry};

use crate::metrics::{opts, Registration};

const SUBSYSTEM: &str = "cluster";

/// Membership statistics of one cluster, labelled with its name.
///
/// Only one live instance per cluster name may exist in a registry; the
/// metrics are unregistered once the instance is dropped.
pub struct EndpointStats {
    pub membership_total: IntGauge,
    pub membership_healthy: IntGauge,
    pub membership_degraded: IntGauge,
    pub membership_excluded: IntGauge,
    pub membership_change: IntCounter,
    pub max_host_weight: IntGauge,
    pub update_no_rebuild: IntCounter,
    pub update_empty: IntCounter,
    _registration: Registration,
}

impl EndpointStats {
    pub fn new(cluster: &str, registry: &Registry) -> prometheus::Result<Self> {
        let registration = std::cell::RefCell::new(Registration::new(registry));
        let gauge = |name: &str, description: &str| -> prometheus::Result<IntGauge> {
            registration.borrow_mut().register(IntGauge::with_opts(
                opts(name, SUBSYSTEM, description).const_label("cluster", cluster),
            )?)
        };
        let counter = |name: &str, description: &str| -> prometheus::Result<IntCounter> {
            registration.borrow_mut().register(IntCounter::with_opts(
                opts(name, SUBSYSTEM, description).const_label("cluster", cluster),
            )?)
        };

        Ok(Self {
            membership_total: gauge("membership_total", "Number of hosts in the cluster.")?,
            membership_healthy: gauge(
                "membership_healthy",
                "Number of healthy hosts in the cluster.",
            )?,
            membership_degraded: gauge(
                "membership_degraded",
                "Number of degraded hosts in the cluster.",
            )?,
            membership_excluded: gauge(
                "membership_excluded",
                "Number of hosts excluded from load balancing weights.",
            )?,
            membership_change: counter(
                "membership_change_total",
                "Number of membership changes of the cluster.",
            )?,
            max_host_weight: gauge(
                "max_host_weight",
                "Largest host weight of the last discovery update.",
            )?,
            update_no_rebuild: counter(
                "update_no_rebuild_total",
                "Number of discovery updates that did not change the cluster.",
            )?,
            update_empty: counter(
                "update_empty_total",
                "Number of discovery updates without any endpoints.",
            )?,
            _registration: registration.into_inner(),
        })
    }
}
