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

//! Contracts with the health checking and outlier detection subsystems.

use std::sync::Arc;

use crate::net::endpoint::SharedHost;

/// How a completed health check changed its host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum HealthTransition {
    /// The host's health did not change.
    Unchanged,
    /// The host's health changed and the cluster should recompute its sets.
    Changed,
    /// The host is heading towards a change that has not happened yet.
    ChangePending,
}

/// Invoked after every completed active health check of a host.
pub type HostCheckCompleteCb = dyn Fn(&SharedHost, HealthTransition) + Send + Sync;
/// Invoked whenever the outlier detector ejects or restores a host.
pub type ChangedStateCb = dyn Fn(&SharedHost) + Send + Sync;

/// An active health checker. It updates host health flags itself and
/// reports every completed check.
pub trait HealthChecker: Send + Sync {
    fn add_host_check_complete_cb(&self, callback: Arc<HostCheckCompleteCb>);

    /// Starts checking the hosts of the cluster.
    fn start(&self);
}

/// A passive, error rate based, outlier detector.
pub trait OutlierDetector: Send + Sync {
    fn add_changed_state_cb(&self, callback: Arc<ChangedStateCb>);
}
