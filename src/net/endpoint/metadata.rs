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

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The metadata namespace read by load balancing.
pub const LB_KEY: &str = "envoy.lb";
/// Marks a host as a canary inside the [`LB_KEY`] namespace.
pub const CANARY_KEY: &str = "canary";

/// Opaque per-host metadata, grouped by filter namespace. Comparison is
/// structural, two independently decoded blobs with the same content are
/// equal.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(transparent)]
pub struct Metadata {
    pub filter_metadata: BTreeMap<String, serde_json::Map<String, serde_json::Value>>,
}

impl Metadata {
    pub fn is_empty(&self) -> bool {
        self.filter_metadata.is_empty()
    }

    /// Returns the value at `key` in the `filter` namespace.
    pub fn value(&self, filter: &str, key: &str) -> Option<&serde_json::Value> {
        self.filter_metadata.get(filter)?.get(key)
    }

    /// Inserts `value` at `key` in the `filter` namespace.
    pub fn insert(
        &mut self,
        filter: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> &mut Self {
        self.filter_metadata
            .entry(filter.into())
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    /// Whether the metadata marks its host as a canary.
    pub fn canary(&self) -> bool {
        self.value(LB_KEY, CANARY_KEY)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or_default()
    }
}
