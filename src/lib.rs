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

//! Upstream cluster membership: the hosts of every priority of a cluster,
//! their health partitioning, locality weighted scheduling and the diffing
//! of discovery updates against the installed hosts.

#![deny(unused_must_use)]

pub mod config;
pub mod metrics;
pub mod net;


pub type Result<T, E = eyre::Error> = std::result::Result<T, E>;

#[doc(inline)]
pub use self::{
    config::ClusterConfig,
    net::{Cluster, ClusterType, DynamicCluster, Host, PrioritySet, StaticCluster},
};
