/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The layered decision service. For every call the pipeline below runs in
//! order and the first step that yields a variation wins:
//!
//! forced decision on the user context, then the datafile whitelist, then a
//! sticky user-profile lookup, then the audience gate, then hash bucketing
//! (or the external CMAB source on marked experiments). Flag decisions
//! compose this pipeline over holdouts, feature tests, and finally the
//! rollout's ordered rules.

use crate::config::ProjectConfig;
use crate::context::ContextSnapshot;
use crate::error::{debug, warn, Result};
use crate::evaluator::EvalContext;
use crate::profile::{UserProfile, UserProfileService};
use crate::sampling;
use crate::schema::{
    ExperimentData, FeatureFlag, TrafficAllocation, VariableType, Variation,
};
use crate::sources::CmabClient;
use serde_json::{Map, Value};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::sync::Arc;

/// The options a caller can attach to a `decide` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecideOption {
    DisableDecisionEvent,
    EnabledFlagsOnly,
    IgnoreUserProfileService,
    IncludeReasons,
    ExcludeVariables,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct DecideOptions {
    pub disable_decision_event: bool,
    pub enabled_flags_only: bool,
    pub ignore_user_profile_service: bool,
    pub include_reasons: bool,
    pub exclude_variables: bool,
}

impl DecideOptions {
    pub fn collect(defaults: &[DecideOption], options: &[DecideOption]) -> Self {
        let mut collected = Self::default();
        for option in defaults.iter().chain(options) {
            match option {
                DecideOption::DisableDecisionEvent => collected.disable_decision_event = true,
                DecideOption::EnabledFlagsOnly => collected.enabled_flags_only = true,
                DecideOption::IgnoreUserProfileService => {
                    collected.ignore_user_profile_service = true
                }
                DecideOption::IncludeReasons => collected.include_reasons = true,
                DecideOption::ExcludeVariables => collected.exclude_variables = true,
            }
        }
        collected
    }
}

/// Where a decision came from; also the `rule_type` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    Experiment,
    FeatureTest,
    Rollout,
    Holdout,
}

impl Display for DecisionSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(match self {
            DecisionSource::Experiment => "experiment",
            DecisionSource::FeatureTest => "feature-test",
            DecisionSource::Rollout => "rollout",
            DecisionSource::Holdout => "holdout",
        })
    }
}

/// Collects the human-readable trail of a decision. Error-grade entries are
/// always kept; informational ones only when the caller asked for reasons,
/// though they always reach the debug log.
pub(crate) struct DecisionReasons {
    include: bool,
    items: Vec<String>,
}

impl DecisionReasons {
    pub fn new(include: bool) -> Self {
        Self {
            include,
            items: Vec::new(),
        }
    }

    pub fn error(&mut self, message: String) {
        warn!("{}", message);
        self.items.push(message);
    }

    pub fn info(&mut self, message: String) {
        debug!("{}", message);
        if self.include {
            self.items.push(message);
        }
    }

    pub fn into_vec(self) -> Vec<String> {
        self.items
    }
}

/// The resolved decision for one user × flag or experiment.
#[derive(Debug, Clone)]
pub(crate) struct Decision {
    pub experiment: Option<Arc<ExperimentData>>,
    pub variation: Option<Variation>,
    pub source: DecisionSource,
}

impl Decision {
    pub(crate) fn none(source: DecisionSource) -> Self {
        Self {
            experiment: None,
            variation: None,
            source,
        }
    }

    pub fn enabled(&self) -> bool {
        self.variation
            .as_ref()
            .map(Variation::is_feature_enabled)
            .unwrap_or(false)
    }
}

/// The public result of a `decide` call.
#[derive(Debug, Clone)]
pub struct FlagDecision {
    pub flag_key: String,
    pub enabled: bool,
    pub variation_key: Option<String>,
    pub rule_key: Option<String>,
    pub variables: Map<String, Value>,
    pub reasons: Vec<String>,
    pub user_id: String,
}

pub(crate) struct DecisionService {
    profile_service: Option<Arc<dyn UserProfileService>>,
    cmab: Option<CmabClient>,
}

impl DecisionService {
    pub fn new(
        profile_service: Option<Arc<dyn UserProfileService>>,
        cmab: Option<CmabClient>,
    ) -> Self {
        Self {
            profile_service,
            cmab,
        }
    }

    /// Resolve a variation for a single experiment, running the full
    /// pipeline. Used directly by `activate`/`get_variation` and as the
    /// inner step of feature-test evaluation.
    pub fn get_variation(
        &self,
        config: &ProjectConfig,
        experiment: &Arc<ExperimentData>,
        snapshot: &ContextSnapshot,
        options: DecideOptions,
        reasons: &mut DecisionReasons,
    ) -> Result<Option<Variation>> {
        if !experiment.is_running() {
            reasons.info(format!("Experiment \"{}\" is not running", experiment.key));
            return Ok(None);
        }

        // Client-level forced variations sit on top of the datafile
        // whitelist; an entry naming an unknown variation is ignored.
        if let Some(variation_key) = snapshot.forced_variations.get(&experiment.key) {
            match experiment.get_variation_by_key(variation_key) {
                Some(variation) => {
                    reasons.info(format!(
                        "User \"{}\" is forced into variation \"{}\" of experiment \"{}\"",
                        snapshot.user_id, variation.key, experiment.key
                    ));
                    return Ok(Some(variation.clone()));
                }
                None => reasons.error(format!(
                    "Forced variation \"{}\" is not in experiment \"{}\"",
                    variation_key, experiment.key
                )),
            }
        }

        if let Some(variation) = self.whitelisted_variation(experiment, snapshot, reasons) {
            return Ok(Some(variation));
        }

        let mut profile = None;
        if !options.ignore_user_profile_service {
            if let Some(service) = &self.profile_service {
                profile = lookup_profile(service.as_ref(), &snapshot.user_id);
                if let Some(variation) =
                    sticky_variation(profile.as_ref(), experiment, reasons)
                {
                    return Ok(Some(variation));
                }
            }
        }

        let eval_ctx = EvalContext {
            attributes: &snapshot.attributes,
            qualified_segments: &snapshot.qualified_segments,
            audiences: config.audiences(),
        };
        if !config.audience_gate(&experiment.id).matches(&eval_ctx) {
            reasons.info(format!(
                "User \"{}\" does not meet the audience conditions for experiment \"{}\"",
                snapshot.user_id, experiment.key
            ));
            return Ok(None);
        }
        reasons.info(format!(
            "User \"{}\" meets the audience conditions for experiment \"{}\"",
            snapshot.user_id, experiment.key
        ));

        let bucketing_id = sampling::bucketing_id(&snapshot.user_id, &snapshot.attributes);

        if experiment.cmab.is_some() {
            return self.cmab_variation(config, experiment, snapshot, bucketing_id, reasons);
        }

        let variation = sampling::bucket_experiment(config, experiment, bucketing_id)?.cloned();
        match &variation {
            Some(variation) => reasons.info(format!(
                "User \"{}\" is in variation \"{}\" of experiment \"{}\"",
                snapshot.user_id, variation.key, experiment.key
            )),
            None => reasons.info(format!(
                "User \"{}\" is in no variation of experiment \"{}\"",
                snapshot.user_id, experiment.key
            )),
        }

        if let Some(variation) = &variation {
            if !options.ignore_user_profile_service {
                if let Some(service) = &self.profile_service {
                    let mut profile =
                        profile.unwrap_or_else(|| UserProfile::new(&snapshot.user_id));
                    profile.set_variation(&experiment.id, &variation.id);
                    // Save failures must not fail the decision.
                    if let Err(e) = service.save(profile) {
                        warn!(
                            "Saving user profile for \"{}\" failed: {}",
                            snapshot.user_id, e
                        );
                    }
                }
            }
        }
        Ok(variation)
    }

    /// Resolve a decision for a feature flag: holdouts first, then feature
    /// tests in priority order, then the rollout.
    pub fn decide_flag(
        &self,
        config: &ProjectConfig,
        flag: &Arc<FeatureFlag>,
        snapshot: &ContextSnapshot,
        options: DecideOptions,
        reasons: &mut DecisionReasons,
    ) -> Result<Decision> {
        if let Some(variation) =
            self.validated_forced_decision(config, &flag.key, None, snapshot, reasons)
        {
            return Ok(Decision {
                experiment: None,
                variation: Some(variation),
                source: DecisionSource::FeatureTest,
            });
        }

        for holdout in config.holdouts_for_flag(&flag.id) {
            if let Some(variation) = self.holdout_variation(config, holdout, snapshot, reasons)? {
                return Ok(Decision {
                    experiment: Some(Arc::clone(holdout)),
                    variation: Some(variation),
                    source: DecisionSource::Holdout,
                });
            }
        }

        for experiment in config.feature_tests(&flag.key) {
            if let Some(variation) = self.validated_forced_decision(
                config,
                &flag.key,
                Some(&experiment.key),
                snapshot,
                reasons,
            ) {
                return Ok(Decision {
                    experiment: Some(Arc::clone(experiment)),
                    variation: Some(variation),
                    source: DecisionSource::FeatureTest,
                });
            }
            if let Some(variation) =
                self.get_variation(config, experiment, snapshot, options, reasons)?
            {
                return Ok(Decision {
                    experiment: Some(Arc::clone(experiment)),
                    variation: Some(variation),
                    source: DecisionSource::FeatureTest,
                });
            }
        }

        self.rollout_decision(config, flag, snapshot, reasons)
    }

    /// Walk a rollout's ordered rules. A user failing a targeted rule's
    /// audience moves on to the next rule, but a user who qualifies and
    /// misses the allocation goes straight to the catch-all rule.
    fn rollout_decision(
        &self,
        config: &ProjectConfig,
        flag: &FeatureFlag,
        snapshot: &ContextSnapshot,
        reasons: &mut DecisionReasons,
    ) -> Result<Decision> {
        if flag.rollout_id.is_empty() {
            reasons.info(format!("Feature \"{}\" has no rollout", flag.key));
            return Ok(Decision::none(DecisionSource::Rollout));
        }
        let rules = match config.rollout_rules(&flag.rollout_id) {
            Some(rules) if !rules.is_empty() => rules,
            Some(_) => return Ok(Decision::none(DecisionSource::Rollout)),
            None => {
                reasons.error(format!(
                    "Rollout \"{}\" for feature \"{}\" is not in the datafile",
                    flag.rollout_id, flag.key
                ));
                return Ok(Decision::none(DecisionSource::Rollout));
            }
        };

        let bucketing_id = sampling::bucketing_id(&snapshot.user_id, &snapshot.attributes);
        let eval_ctx = EvalContext {
            attributes: &snapshot.attributes,
            qualified_segments: &snapshot.qualified_segments,
            audiences: config.audiences(),
        };

        let mut index = 0;
        while index < rules.len() {
            let rule = &rules[index];
            let everyone_else = index == rules.len() - 1;

            if let Some(variation) = self.validated_forced_decision(
                config,
                &flag.key,
                Some(&rule.key),
                snapshot,
                reasons,
            ) {
                return Ok(Decision {
                    experiment: Some(Arc::clone(rule)),
                    variation: Some(variation),
                    source: DecisionSource::Rollout,
                });
            }

            if !config.audience_gate(&rule.id).matches(&eval_ctx) {
                reasons.info(format!(
                    "User \"{}\" does not meet the audience conditions for rule \"{}\"",
                    snapshot.user_id, rule.key
                ));
                index += 1;
                continue;
            }
            reasons.info(format!(
                "User \"{}\" meets the audience conditions for rule \"{}\"",
                snapshot.user_id, rule.key
            ));

            match sampling::bucket_experiment(config, rule, bucketing_id)? {
                Some(variation) => {
                    reasons.info(format!(
                        "User \"{}\" is in variation \"{}\" of rule \"{}\"",
                        snapshot.user_id, variation.key, rule.key
                    ));
                    return Ok(Decision {
                        experiment: Some(Arc::clone(rule)),
                        variation: Some(variation.clone()),
                        source: DecisionSource::Rollout,
                    });
                }
                None if everyone_else => {
                    reasons.info(format!(
                        "User \"{}\" is not in the rollout of feature \"{}\"",
                        snapshot.user_id, flag.key
                    ));
                    break;
                }
                None => {
                    reasons.info(format!(
                        "User \"{}\" is not in the traffic of rule \"{}\", skipping to the catch-all rule",
                        snapshot.user_id, rule.key
                    ));
                    index = rules.len() - 1;
                }
            }
        }
        Ok(Decision::none(DecisionSource::Rollout))
    }

    fn holdout_variation(
        &self,
        config: &ProjectConfig,
        holdout: &Arc<ExperimentData>,
        snapshot: &ContextSnapshot,
        reasons: &mut DecisionReasons,
    ) -> Result<Option<Variation>> {
        if !holdout.is_running() {
            return Ok(None);
        }
        let eval_ctx = EvalContext {
            attributes: &snapshot.attributes,
            qualified_segments: &snapshot.qualified_segments,
            audiences: config.audiences(),
        };
        if !config.audience_gate(&holdout.id).matches(&eval_ctx) {
            reasons.info(format!(
                "User \"{}\" does not meet the audience conditions for holdout \"{}\"",
                snapshot.user_id, holdout.key
            ));
            return Ok(None);
        }
        let bucketing_id = sampling::bucketing_id(&snapshot.user_id, &snapshot.attributes);
        let variation = sampling::bucket_experiment(config, holdout, bucketing_id)?.cloned();
        if let Some(variation) = &variation {
            reasons.info(format!(
                "User \"{}\" is held back in \"{}\" of holdout \"{}\"",
                snapshot.user_id, variation.key, holdout.key
            ));
        }
        Ok(variation)
    }

    /// Resolve a forced decision set on the user context for (flag, rule?),
    /// validating that the variation exists somewhere on the flag.
    fn validated_forced_decision(
        &self,
        config: &ProjectConfig,
        flag_key: &str,
        rule_key: Option<&str>,
        snapshot: &ContextSnapshot,
        reasons: &mut DecisionReasons,
    ) -> Option<Variation> {
        let variation_key = snapshot.forced_decision_for(flag_key, rule_key)?;
        match find_flag_variation_by_key(config, flag_key, variation_key) {
            Some(variation) => {
                reasons.info(format!(
                    "Variation \"{}\" is mapped to flag \"{}\"{} by the forced decision of user \"{}\"",
                    variation.key,
                    flag_key,
                    rule_key
                        .map(|r| format!(", rule \"{}\",", r))
                        .unwrap_or_default(),
                    snapshot.user_id
                ));
                Some(variation)
            }
            None => {
                reasons.error(format!(
                    "Forced decision variation \"{}\" is not on flag \"{}\"",
                    variation_key, flag_key
                ));
                None
            }
        }
    }

    fn whitelisted_variation(
        &self,
        experiment: &ExperimentData,
        snapshot: &ContextSnapshot,
        reasons: &mut DecisionReasons,
    ) -> Option<Variation> {
        let variation_key = experiment.forced_variations.get(&snapshot.user_id)?;
        match experiment.get_variation_by_key(variation_key) {
            Some(variation) => {
                reasons.info(format!(
                    "User \"{}\" is whitelisted into variation \"{}\" of experiment \"{}\"",
                    snapshot.user_id, variation.key, experiment.key
                ));
                Some(variation.clone())
            }
            None => {
                reasons.error(format!(
                    "Whitelisted variation \"{}\" is not in experiment \"{}\"",
                    variation_key, experiment.key
                ));
                None
            }
        }
    }

    /// The CMAB replacement for the bucketing step: a share of traffic is
    /// still carved out with the regular hash, then the external source
    /// picks the variation. Failures degrade to no decision.
    fn cmab_variation(
        &self,
        config: &ProjectConfig,
        experiment: &Arc<ExperimentData>,
        snapshot: &ContextSnapshot,
        bucketing_id: &str,
        reasons: &mut DecisionReasons,
    ) -> Result<Option<Variation>> {
        let Some(cmab_config) = &experiment.cmab else {
            return Ok(None);
        };
        let gate = [TrafficAllocation {
            entity_id: "$".into(),
            end_of_range: cmab_config.traffic_allocation,
        }];
        if sampling::find_bucket(bucketing_id, &experiment.id, &gate)?.is_none() {
            reasons.info(format!(
                "User \"{}\" is not in the CMAB traffic of experiment \"{}\"",
                snapshot.user_id, experiment.key
            ));
            return Ok(None);
        }
        let Some(cmab) = &self.cmab else {
            reasons.error(format!(
                "Experiment \"{}\" requires a CMAB source but none is configured",
                experiment.key
            ));
            return Ok(None);
        };
        match cmab.decide(config, experiment, &snapshot.user_id, &snapshot.attributes) {
            Ok(variation_id) => match experiment.get_variation(&variation_id) {
                Some(variation) => {
                    reasons.info(format!(
                        "The CMAB source put user \"{}\" in variation \"{}\" of experiment \"{}\"",
                        snapshot.user_id, variation.key, experiment.key
                    ));
                    Ok(Some(variation.clone()))
                }
                None => {
                    reasons.error(format!(
                        "The CMAB source returned unknown variation \"{}\" for experiment \"{}\"",
                        variation_id, experiment.key
                    ));
                    Ok(None)
                }
            },
            Err(e) => {
                reasons.error(format!(
                    "CMAB decision for experiment \"{}\" failed: {}",
                    experiment.key, e
                ));
                Ok(None)
            }
        }
    }
}

fn lookup_profile(service: &dyn UserProfileService, user_id: &str) -> Option<UserProfile> {
    match service.lookup(user_id) {
        Ok(profile) => profile,
        Err(e) => {
            // The decision continues as if no profile existed.
            warn!("User profile lookup for \"{}\" failed: {}", user_id, e);
            None
        }
    }
}

fn sticky_variation(
    profile: Option<&UserProfile>,
    experiment: &ExperimentData,
    reasons: &mut DecisionReasons,
) -> Option<Variation> {
    let variation_id = profile?.variation_for(&experiment.id)?;
    match experiment.get_variation(variation_id) {
        Some(variation) => {
            reasons.info(format!(
                "Returning previously bucketed variation \"{}\" of experiment \"{}\"",
                variation.key, experiment.key
            ));
            Some(variation.clone())
        }
        None => {
            reasons.info(format!(
                "Previously bucketed variation \"{}\" is no longer in experiment \"{}\"",
                variation_id, experiment.key
            ));
            None
        }
    }
}

/// Find a variation by key anywhere on a flag: its feature tests, its
/// rollout rules, or a holdout covering it.
pub(crate) fn find_flag_variation_by_key(
    config: &ProjectConfig,
    flag_key: &str,
    variation_key: &str,
) -> Option<Variation> {
    let flag = config.flag_by_key(flag_key)?;
    for experiment in config.feature_tests(flag_key) {
        if let Some(variation) = experiment.get_variation_by_key(variation_key) {
            return Some(variation.clone());
        }
    }
    if let Some(rules) = config.rollout_rules(&flag.rollout_id) {
        for rule in rules {
            if let Some(variation) = rule.get_variation_by_key(variation_key) {
                return Some(variation.clone());
            }
        }
    }
    for holdout in config.holdouts_for_flag(&flag.id) {
        if let Some(variation) = holdout.get_variation_by_key(variation_key) {
            return Some(variation.clone());
        }
    }
    None
}

/// Coerce a variable's raw string value into its declared JSON shape.
/// Returns `None` when the stored value does not parse as the declared type.
pub(crate) fn parse_variable_value(variable_type: VariableType, raw: &str) -> Option<Value> {
    match variable_type {
        VariableType::String => Some(Value::String(raw.to_string())),
        VariableType::Integer => raw.parse::<i64>().ok().map(Value::from),
        VariableType::Double => raw
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(Value::from),
        VariableType::Boolean => match raw {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        VariableType::Json => serde_json::from_str(raw).ok(),
    }
}
