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

use once_cell::sync::Lazy;
use prometheus::core::Collector;
pub use prometheus::Result;
use prometheus::{Opts, Registry};

/// The namespace every metric of this crate is registered under.
pub const NAMESPACE: &str = "upstream";

/// The registry used when a caller does not supply its own.
pub fn registry() -> &'static Registry {
    static REGISTRY: Lazy<Registry> = Lazy::new(Registry::default);
    &REGISTRY
}

pub fn opts(name: &str, subsystem: &str, description: &str) -> Opts {
    Opts::new(name, description)
        .namespace(NAMESPACE)
        .subsystem(subsystem)
}

/// Collectors registered with one registry, unregistered again when dropped.
///
/// Registering a collector whose descriptor is already present is an error
/// rather than a silent no-op, as a second collector would never be gathered.
pub struct Registration {
    registry: Registry,
    collectors: Vec<Box<dyn Collector>>,
}

impl Registration {
    pub fn new(registry: &Registry) -> Self {
        Self {
            registry: registry.clone(),
            collectors: Vec::new(),
        }
    }

    pub fn register<C: Collector + Clone + 'static>(&mut self, collector: C) -> Result<C> {
        self.registry.register(Box::new(collector.clone()))?;
        self.collectors.push(Box::new(collector.clone()));
        Ok(collector)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        for collector in self.collectors.drain(..) {
            if let Err(error) = self.registry.unregister(collector) {
                tracing::warn!(%error, "failed to unregister collector");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use prometheus::IntCounter;

    use super::*;

    fn counter() -> IntCounter {
        IntCounter::with_opts(opts("registered_total", "test", "test counter")).unwrap()
    }

    fn gather(registry: &Registry) -> String {
        let mut buffer = Vec::new();
        prometheus::Encoder::encode(&prometheus::TextEncoder::new(), &registry.gather(), &mut buffer)
            .unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = Registry::new();
        let mut first = Registration::new(&registry);
        first.register(counter()).unwrap();

        let mut second = Registration::new(&registry);
        assert!(second.register(counter()).is_err());
    }

    #[test]
    fn dropping_releases_collectors() {
        let registry = Registry::new();
        let mut first = Registration::new(&registry);
        first.register(counter()).unwrap().inc();
        assert!(gather(&registry).contains("upstream_test_registered_total 1"));
        drop(first);
        assert!(!gather(&registry).contains("upstream_test_registered_total"));

        let mut second = Registration::new(&registry);
        let counter = second.register(counter()).unwrap();
        counter.inc_by(7);
        assert!(gather(&registry).contains("upstream_test_registered_total 7"));
    }
}
