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

use std::io::Write as _;

use pretty_assertions::assert_eq;

use upstream_membership::{
    net::{endpoint::Health, Cluster, ClusterType, StaticCluster},
    ClusterConfig,
};

const CONFIG: &str = "
name: frontend
locality_weighted_lb: true
load_assignment:
  overprovisioning_factor: 100
  endpoints:
    - locality:
        region: eu-west1
        zone: b
      load_balancing_weight: 2
      lb_endpoints:
        - address: 10.0.1.1:7000
        - address: 10.0.1.2:7000
          health_status: DEGRADED
    - locality:
        region: eu-west1
        zone: a
      load_balancing_weight: 6
      lb_endpoints:
        - address: 10.0.0.1:7000
          load_balancing_weight: 300
    - priority: 1
      lb_endpoints:
        - address: 10.0.2.1:7000
";

#[test]
fn static_cluster_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();

    let config = ClusterConfig::from_path(file.path()).unwrap();
    let cluster = Cluster::from_config(config, &prometheus::Registry::new()).unwrap();
    let cluster = StaticCluster::new(cluster).unwrap();
    cluster.initialize(Box::new(|| {})).unwrap();

    let priority_set = cluster.cluster().priority_set();
    assert_eq!(2, priority_set.host_sets_per_priority().len());

    let primary = priority_set.host_set(0).unwrap();
    assert_eq!(100, primary.overprovisioning_factor());
    assert_eq!(Some(std::sync::Arc::new(vec![6, 2])), primary.locality_weights());

    let per_locality: Vec<Vec<String>> = primary
        .hosts_per_locality()
        .get()
        .iter()
        .map(|hosts| hosts.iter().map(|host| host.address().to_string()).collect())
        .collect();
    assert_eq!(
        vec![
            vec!["10.0.0.1:7000".to_owned()],
            vec!["10.0.1.1:7000".to_owned(), "10.0.1.2:7000".to_owned()],
        ],
        per_locality
    );

    let hosts_per_locality = primary.hosts_per_locality();
    let heavy = &hosts_per_locality.get()[0][0];
    assert_eq!(128, heavy.weight());
    assert_eq!(Health::Degraded, primary.degraded_hosts()[0].health());

    let failover = priority_set.host_set(1).unwrap();
    assert_eq!(1, failover.hosts().len());
    assert_eq!(1, failover.hosts()[0].priority());
    assert_eq!(None, failover.choose_healthy_locality());

    let host_map = priority_set.cross_priority_host_map();
    assert_eq!(4, host_map.len());
    assert!(host_map.contains_key("10.0.2.1:7000"));

    assert_eq!(4, cluster.cluster().info().stats().membership_total.get());
    assert_eq!(1, cluster.cluster().info().stats().membership_degraded.get());
}

#[test]
fn invalid_file_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"name: frontend\noverprovisioning_factor: 0\n")
        .unwrap();

    let error = ClusterConfig::from_path(file.path()).unwrap_err();
    assert!(error.to_string().contains("overprovisioning factor"), "{error}");
}
