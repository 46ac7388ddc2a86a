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

use pretty_assertions::assert_eq;
use rand::Rng;
use strum::IntoEnumIterator;

use upstream_membership::net::{
    cluster::{partition_hosts, HostSet, HostsPerLocality},
    endpoint::{Health, HealthFlag, Host, HostVector, Locality, SharedHost, MAX_WEIGHT, MIN_WEIGHT},
};

fn random_host(rng: &mut impl Rng, octet: u8, zone: &str) -> SharedHost {
    let host = Host::builder(([10, 0, 0, octet], 80))
        .locality(Locality::region("r").zone(zone))
        .build();

    for flag in HealthFlag::iter() {
        if rng.gen_bool(0.3) {
            host.health_flag_set(flag);
        }
    }

    host
}

fn contains(hosts: &[SharedHost], host: &SharedHost) -> bool {
    hosts.iter().any(|candidate| Arc::ptr_eq(candidate, host))
}

#[test]
fn coarse_health_follows_flags() {
    let mut rng = rand::thread_rng();

    for _ in 0..1_000 {
        let host = random_host(&mut rng, 1, "a");
        let flag = |flag| host.health_flag_get(flag);

        let expected = if flag(HealthFlag::FailedActiveHc)
            || flag(HealthFlag::FailedEdsHealth)
            || flag(HealthFlag::FailedOutlierCheck)
        {
            Health::Unhealthy
        } else if flag(HealthFlag::DegradedActiveHc) || flag(HealthFlag::DegradedEdsHealth) {
            Health::Degraded
        } else {
            Health::Healthy
        };

        assert_eq!(expected, host.health(), "flags: {}", host.health_flags());
        assert_eq!(
            flag(HealthFlag::PendingActiveHc) || flag(HealthFlag::ExcludedViaImmediateHcFail),
            host.excluded(),
        );
    }
}

#[test]
fn weight_always_within_bounds() {
    let mut rng = rand::thread_rng();
    let host = Host::builder(([10, 0, 0, 1], 80)).build();

    for weight in [0, 1, 128, 129, u32::MAX]
        .into_iter()
        .chain((0..1_000).map(|_| rng.gen::<u32>() % 512))
    {
        host.set_weight(weight);
        assert_eq!(weight.clamp(MIN_WEIGHT, MAX_WEIGHT), host.weight());
    }
}

#[test]
fn partitions_are_subsets_of_hosts() {
    let mut rng = rand::thread_rng();

    for _ in 0..100 {
        let zones = ["a", "b", "c"];
        let groups: Vec<HostVector> = zones
            .iter()
            .enumerate()
            .map(|(zone_index, zone)| {
                (0..rng.gen_range(0..6u8))
                    .map(|octet| random_host(&mut rng, zone_index as u8 * 10 + octet, zone))
                    .collect()
            })
            .collect();
        let hosts: HostVector = groups.iter().flatten().cloned().collect();

        let params = partition_hosts(
            Arc::new(hosts.clone()),
            Arc::new(HostsPerLocality::new(groups, false)),
        );

        for host in &hosts {
            assert_eq!(
                host.health() == Health::Healthy,
                contains(&params.healthy_hosts, host)
            );
            assert_eq!(
                host.health() == Health::Degraded,
                contains(&params.degraded_hosts, host)
            );
            assert_eq!(host.excluded(), contains(&params.excluded_hosts, host));
        }

        let grouped: Vec<HostVector> = params.healthy_hosts_per_locality.get().to_vec();
        assert_eq!(zones.len(), grouped.len());
        let flattened: HostVector = grouped.into_iter().flatten().collect();
        assert_eq!(params.healthy_hosts.len(), flattened.len());
        assert!(flattened
            .iter()
            .all(|host| contains(&params.healthy_hosts, host)));
    }
}

#[test]
fn partitioning_keeps_locality_order() {
    let host = |octet: u8, zone: &str, flag: Option<HealthFlag>| {
        let host = Host::builder(([10, 0, 0, octet], 80))
            .locality(Locality::region("r").zone(zone))
            .build();
        if let Some(flag) = flag {
            host.health_flag_set(flag);
        }
        host
    };

    let zone_a = vec![
        host(1, "a", None),
        host(2, "a", Some(HealthFlag::FailedActiveHc)),
    ];
    let zone_b = vec![
        host(3, "b", Some(HealthFlag::DegradedEdsHealth)),
        host(4, "b", None),
    ];
    let hosts: HostVector = zone_a.iter().chain(&zone_b).cloned().collect();
    let params = partition_hosts(
        Arc::new(hosts),
        Arc::new(HostsPerLocality::new(vec![zone_a, zone_b], true)),
    );

    let addresses = |hosts: &HostsPerLocality| -> Vec<Vec<String>> {
        hosts
            .get()
            .iter()
            .map(|group| group.iter().map(|host| host.address().to_string()).collect())
            .collect()
    };

    assert_eq!(
        vec![vec!["10.0.0.1:80".to_owned()], vec!["10.0.0.4:80".to_owned()]],
        addresses(&params.healthy_hosts_per_locality)
    );
    assert_eq!(
        vec![Vec::<String>::new(), vec!["10.0.0.3:80".to_owned()]],
        addresses(&params.degraded_hosts_per_locality)
    );
    assert!(params.healthy_hosts_per_locality.has_local_locality());
    assert!(params.excluded_hosts_per_locality.has_local_locality());
}

#[test]
fn empty_host_set() {
    let host_set = HostSet::new(0, None);

    assert!(host_set.hosts().is_empty());
    assert!(host_set.healthy_hosts_per_locality().is_empty());
    assert_eq!(None, host_set.locality_weights());
    assert_eq!(None, host_set.choose_healthy_locality());
    assert_eq!(None, host_set.choose_degraded_locality());
}
