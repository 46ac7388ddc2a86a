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

//! Cluster configuration.

use std::{collections::HashSet, io, path::Path};

use serde::{Deserialize, Serialize};

use crate::net::{cluster::DEFAULT_OVERPROVISIONING_FACTOR, endpoint::Locality};

pub mod endpoints;
mod error;

pub use self::{
    endpoints::{
        ClusterLoadAssignment, HealthCheckConfig, HealthStatus, LbEndpoint, LocalityLbEndpoints,
    },
    error::{Error, ValidationError, ValueInvalidArgs},
};

fn default_overprovisioning_factor() -> u32 {
    DEFAULT_OVERPROVISIONING_FACTOR
}

/// The configuration of a single upstream cluster.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub name: String,
    /// Amplifies the weight of partially available localities, in percent.
    #[serde(default = "default_overprovisioning_factor")]
    pub overprovisioning_factor: u32,
    /// Whether locality weights are passed to load balancers.
    #[serde(default)]
    pub locality_weighted_lb: bool,
    /// Drop removed hosts immediately, even if they are still passing health
    /// checks.
    #[serde(default)]
    pub ignore_health_on_host_removal: bool,
    /// Keep new hosts out of load balancing until their first health check
    /// completes.
    #[serde(default)]
    pub ignore_new_hosts_until_first_hc: bool,
    /// The locality this process runs in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_locality: Option<Locality>,
    /// Whether this is the cluster that describes the local deployment,
    /// which may only contain priority zero endpoints.
    #[serde(default)]
    pub local_cluster: bool,
    /// Statically configured endpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_assignment: Option<ClusterLoadAssignment>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            overprovisioning_factor: DEFAULT_OVERPROVISIONING_FACTOR,
            locality_weighted_lb: false,
            ignore_health_on_host_removal: false,
            ignore_new_hosts_until_first_hc: false,
            local_locality: None,
            local_cluster: false,
            load_assignment: None,
        }
    }
}

impl ClusterConfig {
    /// Reads and validates a YAML (or JSON) configuration.
    pub fn from_reader<R: io::Read>(input: R) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_reader(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::from_reader(std::fs::File::open(path)?)
    }

    /// Validates the current configuration.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.overprovisioning_factor == 0 {
            return Err(ValidationError::ZeroOverprovisioningFactor(
                self.name.clone(),
            ));
        }

        if let Some(assignment) = &self.load_assignment {
            self.validate_load_assignment(assignment)?;
        }

        Ok(())
    }

    /// Validates a load assignment delivered for this cluster.
    ///
    /// This is stricter than the host lists it produces: an address listed
    /// twice in the same locality group is rejected with
    /// [`ValidationError::NotUnique`] instead of being collapsed.
    pub fn validate_load_assignment(
        &self,
        assignment: &ClusterLoadAssignment,
    ) -> Result<(), ValidationError> {
        if assignment.overprovisioning_factor == Some(0) {
            return Err(ValidationError::ZeroOverprovisioningFactor(format!(
                "{} load assignment",
                self.name
            )));
        }

        for group in &assignment.endpoints {
            if group.load_balancing_weight == Some(0) {
                return Err(ValueInvalidArgs {
                    field: "load_balancing_weight".into(),
                    clarification: Some(format!(
                        "locality {} must have a positive weight",
                        group.locality
                    )),
                    examples: None,
                }
                .into());
            }

            if self.local_cluster && group.priority != 0 {
                return Err(ValidationError::LocalClusterPriority(
                    self.name.clone(),
                    group.priority,
                ));
            }

            let mut seen = HashSet::new();
            for endpoint in &group.lb_endpoints {
                if endpoint.load_balancing_weight == Some(0) {
                    return Err(ValueInvalidArgs {
                        field: "load_balancing_weight".into(),
                        clarification: Some(format!(
                            "endpoint {} must have a positive weight",
                            endpoint.address
                        )),
                        examples: None,
                    }
                    .into());
                }

                if !seen.insert(&endpoint.address) {
                    return Err(ValidationError::NotUnique(
                        endpoint.address.to_string(),
                        group.locality.to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}
