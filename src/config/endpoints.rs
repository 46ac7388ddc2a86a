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

//! Endpoint assignments, the shape shared by static configuration and by
//! the results delivered from a discovery source.

use serde::{Deserialize, Serialize};

use crate::net::endpoint::{EndpointAddress, Locality, Metadata};

/// The health of an endpoint as reported by discovery.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    Draining,
    Timeout,
    Degraded,
}

/// Health checking overrides for a single endpoint.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema,
)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckConfig {
    /// Port used for health checking instead of the endpoint's port, `0`
    /// keeps the endpoint's port.
    #[serde(default)]
    pub port: u16,
    /// Hostname sent by health checks instead of the endpoint's hostname.
    #[serde(default)]
    pub hostname: String,
}

/// A single upstream endpoint.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct LbEndpoint {
    pub address: EndpointAddress,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub health_status: HealthStatus,
    /// Relative weight, between 1 and 128.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancing_weight: Option<u32>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    #[serde(default)]
    pub disable_active_health_check: bool,
}

impl LbEndpoint {
    pub fn new(address: impl Into<EndpointAddress>) -> Self {
        Self {
            address: address.into(),
            hostname: String::new(),
            health_check: HealthCheckConfig::default(),
            health_status: HealthStatus::default(),
            load_balancing_weight: None,
            metadata: Metadata::default(),
            disable_active_health_check: false,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.load_balancing_weight = Some(weight);
        self
    }

    pub fn with_health_status(mut self, health_status: HealthStatus) -> Self {
        self.health_status = health_status;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// The effective load balancing weight, `1` when unset.
    pub fn weight(&self) -> u32 {
        self.load_balancing_weight.unwrap_or(1)
    }

    /// The address health checks are sent to.
    pub fn health_check_address(&self) -> EndpointAddress {
        self.address.with_port(self.health_check.port)
    }
}

/// A group of endpoints sharing a locality and priority.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct LocalityLbEndpoints {
    #[serde(default)]
    pub locality: Locality,
    /// Weight of the whole locality when locality weighted load balancing
    /// is enabled. Localities without a weight receive no traffic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancing_weight: Option<u32>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub lb_endpoints: Vec<LbEndpoint>,
}

impl LocalityLbEndpoints {
    pub fn new(priority: u32, locality: Locality) -> Self {
        Self {
            locality,
            priority,
            ..Self::default()
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.load_balancing_weight = Some(weight);
        self
    }

    pub fn with_endpoints(mut self, endpoints: impl IntoIterator<Item = LbEndpoint>) -> Self {
        self.lb_endpoints.extend(endpoints);
        self
    }
}

/// All endpoints of a cluster across every priority.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ClusterLoadAssignment {
    #[serde(default)]
    pub endpoints: Vec<LocalityLbEndpoints>,
    /// Overrides the cluster's overprovisioning factor for this assignment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overprovisioning_factor: Option<u32>,
}

impl ClusterLoadAssignment {
    pub fn new(endpoints: impl IntoIterator<Item = LocalityLbEndpoints>) -> Self {
        Self {
            endpoints: endpoints.into_iter().collect(),
            overprovisioning_factor: None,
        }
    }

    /// Iterates over every endpoint alongside the group it belongs to.
    pub fn lb_endpoints(&self) -> impl Iterator<Item = (&LocalityLbEndpoints, &LbEndpoint)> {
        self.endpoints
            .iter()
            .flat_map(|group| group.lb_endpoints.iter().map(move |lb| (group, lb)))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parse_load_assignment() {
        let yaml = "
overprovisioning_factor: 200
endpoints:
  - locality:
      region: us-east
      zone: a
    load_balancing_weight: 10
    priority: 1
    lb_endpoints:
      - address: 10.0.0.1:80
        load_balancing_weight: 5
        health_status: DEGRADED
        health_check:
          port: 8081
      - address: 10.0.0.2:80
        disable_active_health_check: true
";
        let assignment: ClusterLoadAssignment = serde_yaml::from_str(yaml).unwrap();

        let expected = ClusterLoadAssignment {
            endpoints: vec![LocalityLbEndpoints::new(
                1,
                Locality::region("us-east").zone("a"),
            )
            .with_weight(10)
            .with_endpoints([
                LbEndpoint {
                    health_check: HealthCheckConfig {
                        port: 8081,
                        hostname: String::new(),
                    },
                    ..LbEndpoint::new(([10, 0, 0, 1], 80))
                        .with_weight(5)
                        .with_health_status(HealthStatus::Degraded)
                },
                LbEndpoint {
                    disable_active_health_check: true,
                    ..LbEndpoint::new(([10, 0, 0, 2], 80))
                },
            ])],
            overprovisioning_factor: Some(200),
        };

        assert_eq!(expected, assignment);
        assert_eq!(
            EndpointAddress::from(([10, 0, 0, 1], 8081)),
            assignment.endpoints[0].lb_endpoints[0].health_check_address()
        );
        assert_eq!(2, assignment.lb_endpoints().count());
    }

    #[test]
    fn unknown_fields_rejected() {
        let yaml = "
endpoints:
  - lb_endpoints:
      - address: 10.0.0.1:80
        weight: 5
";
        serde_yaml::from_str::<ClusterLoadAssignment>(yaml).unwrap_err();
    }
}
