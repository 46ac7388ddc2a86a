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

//! Upstream clusters: their priority levels, membership bookkeeping and
//! initialization lifecycle.

pub mod callbacks;
mod dynamic;
pub mod health;
pub mod host_map;
pub mod host_set;
pub mod hosts_per_locality;
pub mod metrics;
pub mod priority_set;
pub mod priority_state;
pub mod scheduler;
mod static_cluster;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Weak,
};

use eyre::WrapErr as _;
use parking_lot::Mutex;

use crate::{
    config::{ClusterConfig, LocalityLbEndpoints, ValidationError},
    net::endpoint::SharedHost,
};

pub use self::{
    callbacks::CallbackHandle,
    dynamic::{DynamicCluster, HostListDiff},
    health::{HealthChecker, HealthTransition, OutlierDetector},
    host_map::{HostMap, SharedHostMap},
    host_set::{
        partition_host_list, partition_hosts, partition_hosts_per_locality, update_hosts_params,
        HostSet, HostSetSnapshot, LocalityWeights, SharedHostVector, SharedLocalityWeights,
        UpdateHostsParams, DEFAULT_OVERPROVISIONING_FACTOR,
    },
    hosts_per_locality::{HostsPerLocality, SharedHostsPerLocality},
    metrics::EndpointStats,
    priority_set::{BatchUpdateScope, HostUpdate, PrioritySet},
    priority_state::{LocalityWeightsMap, PriorityState, PriorityStateManager},
    static_cluster::StaticCluster,
};

/// Invoked once a cluster has finished initializing.
pub type InitializeCb = Box<dyn FnOnce() + Send>;

/// The immutable description of a cluster, shared by everything that
/// outlives a single membership update.
pub struct ClusterInfo {
    config: ClusterConfig,
    stats: EndpointStats,
}

impl ClusterInfo {
    /// Validates `config` and registers its statistics with `registry`.
    pub fn new(config: ClusterConfig, registry: &prometheus::Registry) -> crate::Result<Self> {
        config
            .validate()
            .wrap_err_with(|| format!("invalid configuration for cluster `{}`", config.name))?;
        let stats = EndpointStats::new(&config.name, registry)
            .wrap_err_with(|| format!("failed to register stats for cluster `{}`", config.name))?;

        Ok(Self { config, stats })
    }

    /// Like [`Self::new`], registering statistics with
    /// [`crate::metrics::registry`].
    pub fn with_default_registry(config: ClusterConfig) -> crate::Result<Self> {
        Self::new(config, crate::metrics::registry())
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn stats(&self) -> &EndpointStats {
        &self.stats
    }
}

impl std::fmt::Debug for ClusterInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterInfo")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A cluster type, responsible for producing the cluster's first set of
/// hosts.
pub trait ClusterType: Send + Sync {
    fn cluster(&self) -> &Arc<Cluster>;

    /// Starts the work that must complete before the cluster can initialize.
    /// Implementations call [`Cluster::on_pre_init_complete`] once it is done.
    fn start_pre_init(&self) -> crate::Result<()>;

    /// Initializes the cluster, `callback` runs once initialization finishes.
    ///
    /// # Panics
    /// If the cluster has already been initialized.
    fn initialize(&self, callback: InitializeCb) -> crate::Result<()> {
        self.cluster().set_initialize_callback(callback);
        self.start_pre_init()
    }
}

/// The state shared by every cluster type: hosts at every priority, the
/// health collaborators and initialization progress.
pub struct Cluster {
    this: Weak<Cluster>,
    info: Arc<ClusterInfo>,
    priority_set: PrioritySet,
    health_checker: Mutex<Option<Arc<dyn HealthChecker>>>,
    outlier_detector: Mutex<Option<Arc<dyn OutlierDetector>>>,
    initialization_started: AtomicBool,
    initialization_complete_callback: Mutex<Option<InitializeCb>>,
    pending_initialize_health_checks: AtomicU64,
    _membership_stats: CallbackHandle,
}

impl Cluster {
    pub fn new(info: ClusterInfo) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let priority_set = PrioritySet::main();
            priority_set.get_or_create_host_set(0, None);

            let membership_stats = {
                let this = this.clone();
                priority_set.add_priority_update_cb(move |_, hosts_added, hosts_removed| {
                    if let Some(cluster) = this.upgrade() {
                        cluster.update_membership_stats(hosts_added, hosts_removed);
                    }
                })
            };

            Self {
                this: this.clone(),
                info: Arc::new(info),
                priority_set,
                health_checker: Mutex::default(),
                outlier_detector: Mutex::default(),
                initialization_started: AtomicBool::new(false),
                initialization_complete_callback: Mutex::default(),
                pending_initialize_health_checks: AtomicU64::new(0),
                _membership_stats: membership_stats,
            }
        })
    }

    /// Builds a cluster from `config`, registering its statistics with
    /// `registry`.
    pub fn from_config(
        config: ClusterConfig,
        registry: &prometheus::Registry,
    ) -> crate::Result<Arc<Self>> {
        Ok(Self::new(ClusterInfo::new(config, registry)?))
    }

    pub fn info(&self) -> &Arc<ClusterInfo> {
        &self.info
    }

    pub fn priority_set(&self) -> &PrioritySet {
        &self.priority_set
    }

    pub fn health_checker(&self) -> Option<Arc<dyn HealthChecker>> {
        self.health_checker.lock().clone()
    }

    pub fn outlier_detector(&self) -> Option<Arc<dyn OutlierDetector>> {
        self.outlier_detector.lock().clone()
    }

    /// Whether [`Self::on_pre_init_complete`] has run.
    pub fn initialization_started(&self) -> bool {
        self.initialization_started.load(Ordering::Acquire)
    }

    /// Whether an initialization callback is still waiting to run.
    pub fn initialization_pending(&self) -> bool {
        self.initialization_complete_callback.lock().is_some()
    }

    fn set_initialize_callback(&self, callback: InitializeCb) {
        assert!(
            !self.initialization_started(),
            "cluster {} initialized twice",
            self.info.name()
        );

        let mut slot = self.initialization_complete_callback.lock();
        assert!(slot.is_none(), "cluster {} initialized twice", self.info.name());
        *slot = Some(callback);
    }

    /// Marks the end of the cluster type's pre-initialization work. Only the
    /// first call has any effect.
    pub fn on_pre_init_complete(&self) {
        if self.initialization_started.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::debug!(cluster = %self.info.name(), "pre-initialization complete");
        self.on_init_done();
    }

    fn on_init_done(&self) {
        if let Some(health_checker) = self.health_checker() {
            if self.pending_initialize_health_checks.load(Ordering::Acquire) == 0 {
                let pending: u64 = self
                    .priority_set
                    .host_sets_per_priority()
                    .iter()
                    .map(|host_set| {
                        host_set
                            .hosts()
                            .iter()
                            .filter(|host| !host.disable_active_health_check())
                            .count() as u64
                    })
                    .sum();
                self.pending_initialize_health_checks
                    .store(pending, Ordering::Release);

                tracing::debug!(
                    cluster = %self.info.name(),
                    pending,
                    "waiting for initial health checks"
                );

                let this = self.this.clone();
                health_checker.add_host_check_complete_cb(Arc::new(
                    move |_: &SharedHost, _: HealthTransition| {
                        let Some(cluster) = this.upgrade() else {
                            return;
                        };

                        let finished = cluster
                            .pending_initialize_health_checks
                            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                                pending.checked_sub(1)
                            })
                            .map_or(false, |previous| previous == 1);

                        if finished {
                            cluster.finish_initialization();
                        }
                    },
                ));
            }
        }

        if self.pending_initialize_health_checks.load(Ordering::Acquire) == 0 {
            self.finish_initialization();
        }
    }

    fn finish_initialization(&self) {
        debug_assert!(self.initialization_started());
        let callback = self.initialization_complete_callback.lock().take();

        if self.health_checker().is_some() {
            self.reload_healthy_hosts(None);
        }

        tracing::info!(cluster = %self.info.name(), "cluster initialized");
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Starts `health_checker` and recomputes the host sets whenever a
    /// completed check changes a host's health.
    ///
    /// # Panics
    /// If a health checker is already set.
    pub fn set_health_checker(&self, health_checker: Arc<dyn HealthChecker>) {
        {
            let mut slot = self.health_checker.lock();
            assert!(
                slot.is_none(),
                "cluster {} already has a health checker",
                self.info.name()
            );
            *slot = Some(health_checker.clone());
        }

        health_checker.start();

        let this = self.this.clone();
        health_checker.add_host_check_complete_cb(Arc::new(
            move |host: &SharedHost, transition: HealthTransition| {
                if transition != HealthTransition::Changed {
                    return;
                }

                if let Some(cluster) = this.upgrade() {
                    cluster.reload_healthy_hosts(Some(host));
                }
            },
        ));
    }

    /// Recomputes the host sets whenever `outlier_detector` ejects or
    /// restores a host.
    pub fn set_outlier_detector(&self, outlier_detector: Arc<dyn OutlierDetector>) {
        *self.outlier_detector.lock() = Some(outlier_detector.clone());

        let this = self.this.clone();
        outlier_detector.add_changed_state_cb(Arc::new(move |host: &SharedHost| {
            if let Some(cluster) = this.upgrade() {
                cluster.reload_healthy_hosts(Some(host));
            }
        }));
    }

    /// Re-partitions every priority after a health change. Suppressed until
    /// initialization finishes, the sets are computed once at that point.
    pub fn reload_healthy_hosts(&self, host: Option<&SharedHost>) {
        if self.initialization_pending() {
            tracing::debug!(
                cluster = %self.info.name(),
                host = ?host.map(|host| host.address().to_string()),
                "health change ignored during initialization"
            );
            return;
        }

        for host_set in self.priority_set.host_sets_per_priority().iter() {
            let snapshot = host_set.snapshot();
            self.priority_set.update_hosts(
                host_set.priority(),
                partition_hosts(
                    snapshot.hosts().clone(),
                    snapshot.hosts_per_locality().clone(),
                ),
                snapshot.locality_weights().cloned(),
                &[],
                &[],
                None,
            );
        }
    }

    /// Only priority zero endpoints are allowed in the local cluster.
    pub fn validate_endpoints_for_zone_aware_routing(
        &self,
        group: &LocalityLbEndpoints,
    ) -> Result<(), ValidationError> {
        if self.info.config().local_cluster && group.priority > 0 {
            return Err(ValidationError::LocalClusterPriority(
                self.info.name().to_owned(),
                group.priority,
            ));
        }

        Ok(())
    }

    fn update_membership_stats(
        &self,
        hosts_added: &[SharedHost],
        hosts_removed: &[SharedHost],
    ) {
        let stats = self.info.stats();
        if !hosts_added.is_empty() || !hosts_removed.is_empty() {
            stats.membership_change.inc();
        }

        let (mut total, mut healthy, mut degraded, mut excluded) = (0, 0, 0, 0);
        for host_set in self.priority_set.host_sets_per_priority().iter() {
            let snapshot = host_set.snapshot();
            total += snapshot.hosts().len();
            healthy += snapshot.healthy_hosts().len();
            degraded += snapshot.degraded_hosts().len();
            excluded += snapshot.excluded_hosts().len();
        }

        stats.membership_total.set(total as i64);
        stats.membership_healthy.set(healthy as i64);
        stats.membership_degraded.set(degraded as i64);
        stats.membership_excluded.set(excluded as i64);
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.info.name())
            .field("priority_set", &self.priority_set)
            .field("initialization_started", &self.initialization_started())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tracing_test::traced_test;

    use super::*;
    use crate::{
        config::{ClusterLoadAssignment, LbEndpoint},
        net::endpoint::{HealthFlag, Locality},
        test::{ManualHealthChecker, ManualOutlierDetector},
    };

    fn config() -> ClusterConfig {
        ClusterConfig {
            name: "backend".into(),
            load_assignment: Some(ClusterLoadAssignment::new([LocalityLbEndpoints::new(
                0,
                Locality::region("r"),
            )
            .with_endpoints([
                LbEndpoint::new(([10, 0, 0, 1], 80)),
                LbEndpoint::new(([10, 0, 0, 2], 80)),
            ])])),
            ..<_>::default()
        }
    }

    fn static_cluster(config: ClusterConfig) -> StaticCluster {
        StaticCluster::new(Cluster::from_config(config, &prometheus::Registry::new()).unwrap())
            .unwrap()
    }

    fn count_calls() -> (Arc<AtomicUsize>, InitializeCb) {
        let calls = Arc::new(AtomicUsize::new(0));
        let callback: InitializeCb = {
            let calls = calls.clone();
            Box::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };

        (calls, callback)
    }

    #[test]
    #[traced_test]
    fn reload_suppressed_during_initialization() {
        let health_checker = Arc::new(ManualHealthChecker::default());
        let cluster = static_cluster(config());
        cluster.cluster().set_health_checker(health_checker.clone());

        let (calls, callback) = count_calls();
        cluster.initialize(callback).unwrap();

        let host_set = cluster.cluster().priority_set().host_set(0).unwrap();
        let before = host_set.snapshot();
        health_checker.pass(&host_set.hosts()[0]);

        assert!(Arc::ptr_eq(&before, &host_set.snapshot()));
        assert!(logs_contain("health change ignored during initialization"));
        assert_eq!(0, calls.load(Ordering::SeqCst));

        health_checker.pass(&host_set.hosts()[1]);
        assert_eq!(1, calls.load(Ordering::SeqCst));
        assert_eq!(2, host_set.healthy_hosts().len());
        assert!(logs_contain("cluster initialized"));
    }

    #[test]
    fn initialization_without_health_checker_is_immediate() {
        let cluster = static_cluster(config());
        let (calls, callback) = count_calls();

        assert!(!cluster.cluster().initialization_started());
        cluster.initialize(callback).unwrap();

        assert!(cluster.cluster().initialization_started());
        assert!(!cluster.cluster().initialization_pending());
        assert_eq!(1, calls.load(Ordering::SeqCst));

        cluster.cluster().on_pre_init_complete();
        assert_eq!(1, calls.load(Ordering::SeqCst), "only the first call counts");
    }

    #[test]
    #[should_panic(expected = "initialized twice")]
    fn initialize_twice() {
        let cluster = static_cluster(config());
        cluster.initialize(Box::new(|| {})).unwrap();
        let _ = cluster.initialize(Box::new(|| {}));
    }

    #[test]
    #[should_panic(expected = "already has a health checker")]
    fn second_health_checker() {
        let cluster = Cluster::from_config(config(), &prometheus::Registry::new()).unwrap();
        cluster.set_health_checker(Arc::new(ManualHealthChecker::default()));
        cluster.set_health_checker(Arc::new(ManualHealthChecker::default()));
    }

    #[test]
    fn outlier_changes_update_stats() {
        let outlier_detector = Arc::new(ManualOutlierDetector::default());
        let cluster = static_cluster(config());
        cluster.cluster().set_outlier_detector(outlier_detector.clone());
        cluster.initialize(Box::new(|| {})).unwrap();

        let stats = cluster.cluster().info().stats();
        assert_eq!(2, stats.membership_total.get());
        assert_eq!(2, stats.membership_healthy.get());

        let host = cluster.cluster().priority_set().host_set(0).unwrap().hosts()[1].clone();
        host.health_flag_set(HealthFlag::FailedOutlierCheck);
        outlier_detector.change(&host);

        assert_eq!(2, stats.membership_total.get());
        assert_eq!(1, stats.membership_healthy.get());
    }

    #[test]
    fn default_registry() {
        let info = ClusterInfo::with_default_registry(ClusterConfig {
            name: "default-registry".into(),
            ..<_>::default()
        })
        .unwrap();
        info.stats().update_empty.inc();

        let mut buffer = Vec::new();
        prometheus::Encoder::encode(
            &prometheus::TextEncoder::new(),
            &crate::metrics::registry().gather(),
            &mut buffer,
        )
        .unwrap();
        assert!(String::from_utf8(buffer)
            .unwrap()
            .contains(r#"upstream_cluster_update_empty_total{cluster="default-registry"} 1"#));
    }

    #[test]
    fn local_cluster_only_allows_priority_zero() {
        let cluster = Cluster::from_config(
            ClusterConfig {
                local_cluster: true,
                load_assignment: None,
                ..config()
            },
            &prometheus::Registry::new(),
        )
        .unwrap();

        let group = LocalityLbEndpoints::new(1, Locality::region("r"));
        assert_eq!(
            Err(ValidationError::LocalClusterPriority("backend".into(), 1)),
            cluster.validate_endpoints_for_zone_aware_routing(&group)
        );
        assert!(cluster
            .validate_endpoints_for_zone_aware_routing(&LocalityLbEndpoints::new(0, <_>::default()))
            .is_ok());
    }
}
