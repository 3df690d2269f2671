/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The immutable, indexed view of one parsed datafile. A `ProjectConfig` is
//! built once per datafile and then shared behind an `Arc`; decisions always
//! run against a single snapshot and updates replace the whole thing.

use crate::error::{warn, Result};
use crate::evaluator::{Audience, Condition, Gate};
use crate::schema::{
    AudienceData, Datafile, EventData, ExperimentData, FeatureFlag, FeatureVariable, Group,
    GroupPolicy, Variation,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub struct ProjectConfig {
    pub account_id: String,
    pub project_id: String,
    pub revision: String,
    pub version: String,
    pub anonymize_ip: bool,
    pub bot_filtering: Option<bool>,
    pub send_flag_decisions: bool,
    pub sdk_key: Option<String>,
    pub environment_key: Option<String>,

    experiments_by_id: HashMap<String, Arc<ExperimentData>>,
    experiments_by_key: HashMap<String, Arc<ExperimentData>>,
    groups_by_id: HashMap<String, Arc<Group>>,
    // experiment id -> owning group id, for mutually-exclusive bucketing.
    group_of_experiment: HashMap<String, String>,
    audiences_by_id: HashMap<String, Arc<Audience>>,
    attribute_id_by_key: HashMap<String, String>,
    attribute_key_by_id: HashMap<String, String>,
    events_by_key: HashMap<String, Arc<EventData>>,
    flags_by_key: HashMap<String, Arc<FeatureFlag>>,
    // rollout id -> its rules in order, the last being the catch-all.
    rollouts_by_id: HashMap<String, Vec<Arc<ExperimentData>>>,
    // flag id -> holdouts covering it, in datafile order. Holdouts share the
    // experiment structure, so they are carried as experiments here.
    holdouts_by_flag: HashMap<String, Vec<Arc<ExperimentData>>>,
    // flag key -> feature tests in priority order.
    experiments_by_flag: HashMap<String, Vec<Arc<ExperimentData>>>,
    // flag key -> variable key -> variable definition.
    variables_by_flag: HashMap<String, HashMap<String, FeatureVariable>>,
    // audience gate per experiment / rollout rule / holdout id.
    gates_by_rule: HashMap<String, Gate>,
}

impl ProjectConfig {
    pub fn new(datafile: Datafile) -> Result<Self> {
        let mut audiences_by_id = HashMap::new();
        // Legacy audiences first so typed audiences replace them by id.
        for data in datafile.audiences.iter().chain(&datafile.typed_audiences) {
            let audience = build_audience(data);
            audiences_by_id.insert(audience.id.clone(), Arc::new(audience));
        }

        let mut experiments_by_id = HashMap::new();
        let mut experiments_by_key = HashMap::new();
        let mut group_of_experiment = HashMap::new();
        let mut gates_by_rule = HashMap::new();

        fn index_experiment(
            experiment: &ExperimentData,
            gates: &mut HashMap<String, Gate>,
        ) -> Arc<ExperimentData> {
            let experiment = Arc::new(experiment.clone());
            gates.insert(
                experiment.id.clone(),
                Gate::build(
                    experiment.audience_conditions.as_ref(),
                    &experiment.audience_ids,
                ),
            );
            experiment
        }

        for experiment in &datafile.experiments {
            let experiment = index_experiment(experiment, &mut gates_by_rule);
            experiments_by_key.insert(experiment.key.clone(), Arc::clone(&experiment));
            experiments_by_id.insert(experiment.id.clone(), experiment);
        }

        let mut groups_by_id = HashMap::new();
        for group in &datafile.groups {
            for experiment in &group.experiments {
                let experiment = index_experiment(experiment, &mut gates_by_rule);
                group_of_experiment.insert(experiment.id.clone(), group.id.clone());
                experiments_by_key.insert(experiment.key.clone(), Arc::clone(&experiment));
                experiments_by_id.insert(experiment.id.clone(), experiment);
            }
            groups_by_id.insert(group.id.clone(), Arc::new(group.clone()));
        }

        let mut rollouts_by_id = HashMap::new();
        for rollout in &datafile.rollouts {
            // Rollout rules are experiments too; indexing them lets forced
            // decisions name a rule by key.
            let mut rules = Vec::with_capacity(rollout.experiments.len());
            for rule in &rollout.experiments {
                let rule = index_experiment(rule, &mut gates_by_rule);
                experiments_by_key.insert(rule.key.clone(), Arc::clone(&rule));
                experiments_by_id.insert(rule.id.clone(), Arc::clone(&rule));
                rules.push(rule);
            }
            rollouts_by_id.insert(rollout.id.clone(), rules);
        }

        let mut holdouts_by_flag: HashMap<String, Vec<Arc<ExperimentData>>> = HashMap::new();
        for holdout in &datafile.holdouts {
            let rule = Arc::new(ExperimentData {
                id: holdout.id.clone(),
                key: holdout.key.clone(),
                status: holdout.status.clone(),
                layer_id: None,
                audience_ids: holdout.audience_ids.clone(),
                audience_conditions: holdout.audience_conditions.clone(),
                forced_variations: Default::default(),
                traffic_allocation: holdout.traffic_allocation.clone(),
                variations: holdout.variations.clone(),
                cmab: None,
            });
            gates_by_rule.insert(
                rule.id.clone(),
                Gate::build(rule.audience_conditions.as_ref(), &rule.audience_ids),
            );
            if holdout.included_flags.is_empty() {
                for flag in &datafile.feature_flags {
                    if !holdout.excluded_flags.contains(&flag.id) {
                        holdouts_by_flag
                            .entry(flag.id.clone())
                            .or_default()
                            .push(Arc::clone(&rule));
                    }
                }
            } else {
                for flag_id in &holdout.included_flags {
                    holdouts_by_flag
                        .entry(flag_id.clone())
                        .or_default()
                        .push(Arc::clone(&rule));
                }
            }
        }

        let mut flags_by_key = HashMap::new();
        let mut experiments_by_flag = HashMap::new();
        let mut variables_by_flag = HashMap::new();
        for flag in &datafile.feature_flags {
            let feature_tests = flag
                .experiment_ids
                .iter()
                .filter_map(|id| {
                    let experiment = experiments_by_id.get(id).cloned();
                    if experiment.is_none() {
                        warn!(
                            "Feature {} references unknown experiment {}",
                            flag.key, id
                        );
                    }
                    experiment
                })
                .collect::<Vec<_>>();
            experiments_by_flag.insert(flag.key.clone(), feature_tests);
            variables_by_flag.insert(
                flag.key.clone(),
                flag.variables
                    .iter()
                    .map(|v| (v.key.clone(), v.clone()))
                    .collect(),
            );
            flags_by_key.insert(flag.key.clone(), Arc::new(flag.clone()));
        }

        Ok(Self {
            account_id: datafile.account_id.clone(),
            project_id: datafile.project_id.clone(),
            revision: datafile.revision.clone(),
            version: datafile.version.clone(),
            anonymize_ip: datafile.anonymize_ip,
            bot_filtering: datafile.bot_filtering,
            send_flag_decisions: datafile.send_flag_decisions,
            sdk_key: datafile.sdk_key.clone(),
            environment_key: datafile.environment_key.clone(),
            experiments_by_id,
            experiments_by_key,
            groups_by_id,
            group_of_experiment,
            audiences_by_id,
            attribute_id_by_key: datafile
                .attributes
                .iter()
                .map(|a| (a.key.clone(), a.id.clone()))
                .collect(),
            attribute_key_by_id: datafile
                .attributes
                .iter()
                .map(|a| (a.id.clone(), a.key.clone()))
                .collect(),
            events_by_key: datafile
                .events
                .iter()
                .map(|e| (e.key.clone(), Arc::new(e.clone())))
                .collect(),
            flags_by_key,
            rollouts_by_id,
            holdouts_by_flag,
            experiments_by_flag,
            variables_by_flag,
            gates_by_rule,
        })
    }

    pub fn experiment_by_id(&self, id: &str) -> Option<&Arc<ExperimentData>> {
        self.experiments_by_id.get(id)
    }

    pub fn experiment_by_key(&self, key: &str) -> Option<&Arc<ExperimentData>> {
        self.experiments_by_key.get(key)
    }

    pub fn group_by_id(&self, id: &str) -> Option<&Arc<Group>> {
        self.groups_by_id.get(id)
    }

    /// The random group an experiment is mutually exclusive within, if any.
    pub fn random_group_of(&self, experiment_id: &str) -> Option<&Arc<Group>> {
        let group_id = self.group_of_experiment.get(experiment_id)?;
        let group = self.groups_by_id.get(group_id)?;
        matches!(group.policy, GroupPolicy::Random).then_some(group)
    }

    pub fn audiences(&self) -> &HashMap<String, Arc<Audience>> {
        &self.audiences_by_id
    }

    pub fn attribute_id(&self, key: &str) -> Option<&str> {
        self.attribute_id_by_key.get(key).map(String::as_str)
    }

    pub fn attribute_key(&self, id: &str) -> Option<&str> {
        self.attribute_key_by_id.get(id).map(String::as_str)
    }

    pub fn event_by_key(&self, key: &str) -> Option<&Arc<EventData>> {
        self.events_by_key.get(key)
    }

    pub fn flag_by_key(&self, key: &str) -> Option<&Arc<FeatureFlag>> {
        self.flags_by_key.get(key)
    }

    pub fn flag_keys(&self) -> impl Iterator<Item = &String> {
        self.flags_by_key.keys()
    }

    /// The ordered rules of a rollout; the last one is the catch-all.
    pub fn rollout_rules(&self, rollout_id: &str) -> Option<&[Arc<ExperimentData>]> {
        self.rollouts_by_id.get(rollout_id).map(Vec::as_slice)
    }

    /// The holdouts covering a flag, in datafile order, as experiment
    /// structures (audiences + traffic allocation + variations).
    pub fn holdouts_for_flag(&self, flag_id: &str) -> &[Arc<ExperimentData>] {
        self.holdouts_by_flag
            .get(flag_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The feature tests attached to a flag, in priority order.
    pub fn feature_tests(&self, flag_key: &str) -> &[Arc<ExperimentData>] {
        self.experiments_by_flag
            .get(flag_key)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn variable(&self, flag_key: &str, variable_key: &str) -> Option<&FeatureVariable> {
        self.variables_by_flag.get(flag_key)?.get(variable_key)
    }

    pub fn variables(&self, flag_key: &str) -> Option<&HashMap<String, FeatureVariable>> {
        self.variables_by_flag.get(flag_key)
    }

    /// The pre-built audience gate of an experiment, rollout rule, or
    /// holdout. Ids are unique across all three in a well-formed datafile.
    pub fn audience_gate(&self, rule_id: &str) -> &Gate {
        static EVERYONE: Gate = Gate::Everyone;
        self.gates_by_rule.get(rule_id).unwrap_or(&EVERYONE)
    }

    /// The effective value of a variable under a variation: the variation's
    /// override when it carries one, the flag default otherwise.
    pub fn variable_value<'a>(
        &'a self,
        variable: &'a FeatureVariable,
        variation: Option<&'a Variation>,
    ) -> &'a str {
        variation
            .and_then(|v| v.variables.iter().find(|usage| usage.id == variable.id))
            .map(|usage| usage.value.as_str())
            .unwrap_or(&variable.default_value)
    }
}

fn build_audience(data: &AudienceData) -> Audience {
    // Legacy audiences carry their condition tree as a JSON string.
    let tree: Option<Value> = match &data.conditions {
        Value::String(text) => serde_json::from_str(text).ok(),
        other => Some(other.clone()),
    };
    let conditions = tree.as_ref().and_then(Condition::parse);
    if conditions.is_none() {
        warn!("Audience {} has an unparseable condition tree", data.id);
    }
    Audience {
        id: data.id.clone(),
        name: data.name.clone(),
        conditions,
    }
}
