/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Typed notification topics. Instead of one listener signature fed with
//! loosely-shaped dictionaries, each topic has a dedicated payload struct
//! and its own registration call; listener ids are shared across topics so
//! removal needs no topic argument.

use crate::evaluator::UserAttributes;
use serde_json::{Map, Value};
use std::sync::Mutex;

/// Payload of the legacy `ACTIVATE` topic, kept for callers migrating from
/// the experiment API. New code should listen on `DECISION`.
#[derive(Debug, Clone)]
pub struct ActivatePayload {
    pub experiment_key: String,
    pub user_id: String,
    pub attributes: UserAttributes,
    pub variation_key: String,
}

#[derive(Debug, Clone)]
pub struct DecisionPayload {
    /// What kind of decision this was: "flag", "ab-test", "feature", or
    /// "feature-variable".
    pub decision_type: String,
    pub user_id: String,
    pub attributes: UserAttributes,
    pub decision_info: Value,
}

#[derive(Debug, Clone)]
pub struct TrackPayload {
    pub event_key: String,
    pub user_id: String,
    pub attributes: UserAttributes,
    pub event_tags: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct ConfigUpdatePayload {
    pub revision: String,
}

#[derive(Debug, Clone)]
pub struct LogEventPayload {
    pub url: String,
    pub params: Value,
}

type Listener<T> = Box<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    listeners: Vec<(u64, Listener<T>)>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }
}

impl<T> Registry<T> {
    fn notify(&self, payload: &T) {
        for (_, listener) in &self.listeners {
            listener(payload);
        }
    }

    fn remove(&mut self, id: u64) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    activate: Registry<ActivatePayload>,
    decision: Registry<DecisionPayload>,
    track: Registry<TrackPayload>,
    config_update: Registry<ConfigUpdatePayload>,
    log_event: Registry<LogEventPayload>,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct NotificationCenter {
    inner: Mutex<Inner>,
}

impl NotificationCenter {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_activate_listener(
        &self,
        listener: impl Fn(&ActivatePayload) + Send + Sync + 'static,
    ) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id();
        inner.activate.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn add_decision_listener(
        &self,
        listener: impl Fn(&DecisionPayload) + Send + Sync + 'static,
    ) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id();
        inner.decision.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn add_track_listener(
        &self,
        listener: impl Fn(&TrackPayload) + Send + Sync + 'static,
    ) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id();
        inner.track.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn add_config_update_listener(
        &self,
        listener: impl Fn(&ConfigUpdatePayload) + Send + Sync + 'static,
    ) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id();
        inner.config_update.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn add_log_event_listener(
        &self,
        listener: impl Fn(&LogEventPayload) + Send + Sync + 'static,
    ) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id();
        inner.log_event.listeners.push((id, Box::new(listener)));
        id
    }

    /// Remove a listener by the id its registration returned, whatever its
    /// topic. Returns whether anything was removed.
    pub fn remove_listener(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.activate.remove(id)
            || inner.decision.remove(id)
            || inner.track.remove(id)
            || inner.config_update.remove(id)
            || inner.log_event.remove(id)
    }

    pub fn clear_all_listeners(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = Inner {
            next_id: inner.next_id,
            ..Default::default()
        };
    }

    pub(crate) fn notify_activate(&self, payload: &ActivatePayload) {
        self.inner.lock().unwrap().activate.notify(payload);
    }

    pub(crate) fn notify_decision(&self, payload: &DecisionPayload) {
        self.inner.lock().unwrap().decision.notify(payload);
    }

    pub(crate) fn notify_track(&self, payload: &TrackPayload) {
        self.inner.lock().unwrap().track.notify(payload);
    }

    pub(crate) fn notify_config_update(&self, payload: &ConfigUpdatePayload) {
        self.inner.lock().unwrap().config_update.notify(payload);
    }

    pub(crate) fn notify_log_event(&self, payload: &LogEventPayload) {
        self.inner.lock().unwrap().log_event.notify(payload);
    }
}
