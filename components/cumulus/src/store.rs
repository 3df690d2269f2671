/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use crate::config::ProjectConfig;
use crate::error::{info, CumulusError, Result};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

// This module holds the currently-active project config so that decision
// calls can take a snapshot without blocking on anything. Consumers are
// expected to call `set` whenever a new datafile has been parsed; readers
// always see either the previous or the new config, never a mix.

/// Holds the active [`ProjectConfig`] behind a lock that is only ever taken
/// for the duration of a pointer clone or swap. The condvar wakes callers
/// blocked on the very first config (see [`ConfigStore::wait`]).
#[derive(Default)]
pub struct ConfigStore {
    current: Mutex<Option<Arc<ProjectConfig>>>,
    ready: Condvar,
}

impl ConfigStore {
    pub fn new() -> Self {
        Default::default()
    }

    /// Snapshot the active config. Decisions run entirely against the
    /// snapshot they take here.
    pub fn get(&self) -> Result<Arc<ProjectConfig>> {
        self.current
            .lock()
            .unwrap()
            .clone()
            .ok_or(CumulusError::ClientNotReady)
    }

    /// Like [`ConfigStore::get`], but blocks up to `timeout` waiting for the
    /// first config to be published. Used once at client start; later calls
    /// return immediately.
    pub fn wait(&self, timeout: Duration) -> Result<Arc<ProjectConfig>> {
        let guard = self.current.lock().unwrap();
        let (guard, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |current| current.is_none())
            .unwrap();
        guard.clone().ok_or(CumulusError::ClientNotReady)
    }

    /// Publish a new config, atomically replacing the previous one.
    pub fn set(&self, config: Arc<ProjectConfig>) {
        info!(
            "Activating project config with revision {}",
            config.revision
        );
        let mut guard = self.current.lock().unwrap();
        *guard = Some(config);
        self.ready.notify_all();
    }
}
