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

//! Observer lists with token based unregistration.

use std::{fmt, sync::Arc};

use parking_lot::Mutex;

use crate::net::endpoint::SharedHost;

/// Invoked with the hosts added to and removed from a whole priority set.
pub type MemberUpdateCb = dyn Fn(&[SharedHost], &[SharedHost]) + Send + Sync;
/// Invoked with the priority that changed and the hosts added to and
/// removed from it.
pub type PriorityUpdateCb = dyn Fn(u32, &[SharedHost], &[SharedHost]) + Send + Sync;

struct Entries<F: ?Sized> {
    next_token: u64,
    callbacks: Vec<(u64, Arc<F>)>,
}

/// An ordered list of callbacks. Callbacks are invoked in registration order
/// from a snapshot taken when the list fires, so a callback may add or remove
/// entries (including itself) while running.
pub struct CallbackList<F: ?Sized> {
    entries: Arc<Mutex<Entries<F>>>,
}

impl<F: ?Sized + Send + Sync + 'static> CallbackList<F> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries {
                next_token: 0,
                callbacks: Vec::new(),
            })),
        }
    }

    /// Registers `callback`, it stays registered until the returned handle
    /// is dropped or removed.
    pub fn add(&self, callback: Arc<F>) -> CallbackHandle {
        let token = {
            let mut entries = self.entries.lock();
            let token = entries.next_token;
            entries.next_token += 1;
            entries.callbacks.push((token, callback));
            token
        };

        let entries = Arc::downgrade(&self.entries);
        CallbackHandle::new(move || {
            if let Some(entries) = entries.upgrade() {
                entries
                    .lock()
                    .callbacks
                    .retain(|(registered, _)| *registered != token);
            }
        })
    }

    /// The callbacks currently registered, in registration order.
    pub fn snapshot(&self) -> Vec<Arc<F>> {
        self.entries
            .lock()
            .callbacks
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<F: ?Sized + Send + Sync + 'static> Default for CallbackList<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> fmt::Debug for CallbackList<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackList")
            .field("len", &self.entries.lock().callbacks.len())
            .finish()
    }
}

/// Keeps a callback registered. Dropping the handle unregisters it.
#[must_use = "dropping a callback handle unregisters the callback"]
pub struct CallbackHandle {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    fn new(remove: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            remove: Some(Box::new(remove)),
        }
    }

    /// Unregisters the callback now.
    pub fn remove(mut self) {
        self.run_remove();
    }

    fn run_remove(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        self.run_remove();
    }
}

impl fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackHandle")
            .field("registered", &self.remove.is_some())
            .finish()
    }
}
