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

//! Earliest deadline first scheduling of weighted entries.

use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
};

struct Scheduled<T> {
    deadline: f64,
    // Breaks deadline ties in insertion order.
    order: u64,
    weight: f64,
    entry: T,
}

impl<T> PartialEq for Scheduled<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Scheduled<T> {}

impl<T> PartialOrd for Scheduled<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Scheduled<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .total_cmp(&other.deadline)
            .then(self.order.cmp(&other.order))
    }
}

/// A smooth weighted round robin over entries. Every entry is picked in
/// proportion to its weight over the long run, without bursts of the same
/// entry.
pub struct EdfScheduler<T> {
    queue: BinaryHeap<Reverse<Scheduled<T>>>,
    current_time: f64,
    order_offset: u64,
}

impl<T: Clone> EdfScheduler<T> {
    pub fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            current_time: 0.0,
            order_offset: 0,
        }
    }

    /// Adds `entry` with `weight`, which must be positive.
    pub fn add(&mut self, weight: f64, entry: T) {
        debug_assert!(weight > 0.0, "scheduler weights must be positive");
        let deadline = self.current_time + 1.0 / weight;
        self.push(deadline, weight, entry);
    }

    /// Picks the entry with the earliest deadline and schedules it again one
    /// period later. Returns `None` only if the scheduler is empty.
    pub fn pick_and_add(&mut self) -> Option<(T, f64)> {
        let Reverse(next) = self.queue.pop()?;
        self.current_time = next.deadline;
        let picked = (next.entry.clone(), next.weight);
        self.push(next.deadline + 1.0 / next.weight, next.weight, next.entry);

        Some(picked)
    }

    /// The entry [`Self::pick_and_add`] would return next.
    pub fn peek(&self) -> Option<&T> {
        self.queue.peek().map(|Reverse(next)| &next.entry)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn push(&mut self, deadline: f64, weight: f64, entry: T) {
        let order = self.order_offset;
        self.order_offset += 1;
        self.queue.push(Reverse(Scheduled {
            deadline,
            order,
            weight,
            entry,
        }));
    }
}

impl<T: Clone> Default for EdfScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for EdfScheduler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdfScheduler")
            .field("entries", &self.queue.len())
            .field("current_time", &self.current_time)
            .finish()
    }
}
