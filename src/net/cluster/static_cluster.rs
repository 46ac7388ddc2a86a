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

use super::{Cluster, ClusterType, PriorityStateManager};
use crate::net::endpoint::{HealthFlag, Host};

/// A cluster whose hosts come from its configured load assignment.
#[derive(Debug)]
pub struct StaticCluster {
    cluster: Arc<Cluster>,
}

impl StaticCluster {
    /// # Errors
    /// If a configured endpoint is not allowed in this cluster.
    pub fn new(cluster: Arc<Cluster>) -> crate::Result<Self> {
        if let Some(assignment) = &cluster.info().config().load_assignment {
            for group in &assignment.endpoints {
                cluster.validate_endpoints_for_zone_aware_routing(group)?;
            }
        }

        Ok(Self { cluster })
    }
}

impl ClusterType for StaticCluster {
    fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    fn start_pre_init(&self) -> crate::Result<()> {
        let cluster = &self.cluster;
        let config = cluster.info().config();
        let mut manager = PriorityStateManager::new(cluster.priority_set(), cluster.info(), None);

        let mut overprovisioning_factor = config.overprovisioning_factor;
        if let Some(assignment) = &config.load_assignment {
            overprovisioning_factor = assignment
                .overprovisioning_factor
                .unwrap_or(overprovisioning_factor);

            for group in &assignment.endpoints {
                manager.initialize_priority_for(group);
                for endpoint in &group.lb_endpoints {
                    manager.register_host_for_priority(Host::from_lb_endpoint(group, endpoint), group);
                }
            }
        }

        let health_checker_flag = cluster
            .health_checker()
            .map(|_| HealthFlag::FailedActiveHc);
        let priority_state = manager.priority_state().to_vec();
        for (priority, state) in priority_state.into_iter().enumerate() {
            manager.update_cluster_priority_set(
                priority as u32,
                Arc::new(state.hosts.unwrap_or_default()),
                None,
                None,
                health_checker_flag,
                Some(overprovisioning_factor),
            );
        }

        tracing::debug!(cluster = %config.name, "static hosts installed");
        cluster.on_pre_init_complete();
        Ok(())
    }
}
