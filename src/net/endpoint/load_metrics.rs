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

use std::collections::HashMap;

use parking_lot::Mutex;

/// Accumulated value of one named per-request load metric.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LoadMetricStat {
    pub num_requests_with_metric: u64,
    pub total_metric_value: f64,
}

pub type LoadMetricStatMap = HashMap<String, LoadMetricStat>;

/// Per-host load metrics reported by upstream responses. Written from any
/// thread, drained by the load reporter with [`LoadMetricStats::latch`].
#[derive(Debug, Default)]
pub struct LoadMetricStats {
    map: Mutex<Option<LoadMetricStatMap>>,
}

impl LoadMetricStats {
    pub fn add(&self, key: &str, value: f64) {
        let mut map = self.map.lock();
        let stat = map
            .get_or_insert_with(HashMap::new)
            .entry(key.to_owned())
            .or_default();
        stat.num_requests_with_metric += 1;
        stat.total_metric_value += value;
    }

    /// Takes everything accumulated since the previous latch, `None` if
    /// nothing was recorded.
    pub fn latch(&self) -> Option<LoadMetricStatMap> {
        self.map.lock().take()
    }
}
