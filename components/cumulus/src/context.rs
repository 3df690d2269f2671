/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! A `UserContext` is the per-interaction mutable holder of everything known
//! about one user: their id, attributes, qualified segments, and any forced
//! decisions. Contexts are cheap and are not shared between users; each
//! decision call works from an immutable [`ContextSnapshot`] of this state
//! plus one config snapshot.

use crate::client::CumulusClient;
use crate::decision::DecideOption;
use crate::error::{warn, Result};
use crate::evaluator::UserAttributes;
use crate::FlagDecision;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Identifies where a forced decision applies: a whole flag (`rule_key` is
/// `None`) or one specific rule of it.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct ForcedDecisionKey {
    pub flag_key: String,
    pub rule_key: Option<String>,
}

impl ForcedDecisionKey {
    pub fn new(flag_key: &str, rule_key: Option<&str>) -> Self {
        Self {
            flag_key: flag_key.to_string(),
            rule_key: rule_key.map(str::to_string),
        }
    }
}

/// The immutable state one decision call works from.
#[derive(Debug, Clone, Default)]
pub struct ContextSnapshot {
    pub user_id: String,
    pub attributes: UserAttributes,
    pub qualified_segments: HashSet<String>,
    pub forced_decisions: HashMap<ForcedDecisionKey, String>,
    // Client-level forced variations (experiment key -> variation key),
    // layered over the datafile whitelist.
    pub forced_variations: HashMap<String, String>,
}

impl ContextSnapshot {
    pub fn new(user_id: &str, attributes: UserAttributes) -> Self {
        Self {
            user_id: user_id.to_string(),
            attributes,
            ..Default::default()
        }
    }

    pub fn forced_decision_for(&self, flag_key: &str, rule_key: Option<&str>) -> Option<&str> {
        self.forced_decisions
            .get(&ForcedDecisionKey::new(flag_key, rule_key))
            .map(String::as_str)
    }
}

pub struct UserContext<'a> {
    client: &'a CumulusClient,
    user_id: String,
    attributes: UserAttributes,
    qualified_segments: HashSet<String>,
    forced_decisions: HashMap<ForcedDecisionKey, String>,
}

impl<'a> UserContext<'a> {
    pub(crate) fn new(
        client: &'a CumulusClient,
        user_id: &str,
        attributes: UserAttributes,
    ) -> Self {
        Self {
            client,
            user_id: user_id.to_string(),
            attributes,
            qualified_segments: Default::default(),
            forced_decisions: Default::default(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn attributes(&self) -> &UserAttributes {
        &self.attributes
    }

    pub fn set_attribute(&mut self, key: &str, value: Value) {
        self.attributes.insert(key.to_string(), value);
    }

    pub fn qualified_segments(&self) -> &HashSet<String> {
        &self.qualified_segments
    }

    pub fn set_qualified_segments(&mut self, segments: impl IntoIterator<Item = String>) {
        self.qualified_segments = segments.into_iter().collect();
    }

    /// Pin the decision for a flag (or one rule of it) to a variation key.
    /// Takes effect on the next `decide` call for that flag.
    pub fn set_forced_decision(
        &mut self,
        flag_key: &str,
        rule_key: Option<&str>,
        variation_key: &str,
    ) {
        self.forced_decisions.insert(
            ForcedDecisionKey::new(flag_key, rule_key),
            variation_key.to_string(),
        );
    }

    pub fn get_forced_decision(&self, flag_key: &str, rule_key: Option<&str>) -> Option<&str> {
        self.forced_decisions
            .get(&ForcedDecisionKey::new(flag_key, rule_key))
            .map(String::as_str)
    }

    pub fn remove_forced_decision(&mut self, flag_key: &str, rule_key: Option<&str>) -> bool {
        self.forced_decisions
            .remove(&ForcedDecisionKey::new(flag_key, rule_key))
            .is_some()
    }

    pub fn remove_all_forced_decisions(&mut self) {
        self.forced_decisions.clear();
    }

    pub fn decide(&self, flag_key: &str, options: &[DecideOption]) -> FlagDecision {
        self.client.decide(&self.snapshot(), flag_key, options)
    }

    pub fn decide_for_keys(
        &self,
        flag_keys: &[&str],
        options: &[DecideOption],
    ) -> HashMap<String, FlagDecision> {
        self.client
            .decide_for_keys(&self.snapshot(), flag_keys, options)
    }

    pub fn decide_all(&self, options: &[DecideOption]) -> HashMap<String, FlagDecision> {
        self.client.decide_all(&self.snapshot(), options)
    }

    pub fn track_event(
        &self,
        event_key: &str,
        event_tags: Option<serde_json::Map<String, Value>>,
    ) {
        self.client
            .track(event_key, &self.user_id, &self.attributes, event_tags)
    }

    /// Ask the configured segment source which qualified segments this user
    /// belongs to, replacing the current set. On failure the set is left
    /// empty, which makes every `qualified` condition evaluate to false.
    pub fn fetch_qualified_segments(&mut self) -> bool {
        match self.client.fetch_qualified_segments(&self.user_id) {
            Ok(segments) => {
                self.qualified_segments = segments.into_iter().collect();
                true
            }
            Err(e) => {
                warn!("Fetching qualified segments failed: {}", e);
                self.qualified_segments.clear();
                false
            }
        }
    }

    /// Forward an event to the customer-data platform, identified by this
    /// user's id.
    pub fn send_odp_event(
        &self,
        event_type: &str,
        action: &str,
        mut identifiers: HashMap<String, String>,
        data: HashMap<String, Value>,
    ) -> Result<()> {
        identifiers
            .entry("user_id".to_string())
            .or_insert_with(|| self.user_id.clone());
        self.client.send_odp_event(event_type, action, &identifiers, &data)
    }

    pub(crate) fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            user_id: self.user_id.clone(),
            attributes: self.attributes.clone(),
            qualified_segments: self.qualified_segments.clone(),
            forced_decisions: self.forced_decisions.clone(),
            forced_variations: self.client.forced_variations_for(&self.user_id),
        }
    }
}
