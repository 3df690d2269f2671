/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The public face of the SDK. A `CumulusClient` wires the config store,
//! the decision service, the event pipeline, and the notification center
//! together, and exposes the developer-facing decision and tracking calls.
//! Invalid inputs never raise: the offending call logs and returns its
//! sentinel (`None`, `false`, or the defaults).

use crate::config::ProjectConfig;
use crate::context::{ContextSnapshot, UserContext};
use crate::decision::{
    parse_variable_value, DecideOption, DecideOptions, Decision, DecisionReasons,
    DecisionService, DecisionSource, FlagDecision,
};
use crate::error::{info, warn, CumulusError, Result};
use crate::evaluator::UserAttributes;
use crate::events::{build_conversion_event, build_impression_event, UserEvent};
use crate::notifications::{
    ActivatePayload, ConfigUpdatePayload, DecisionPayload, LogEventPayload, NotificationCenter,
    TrackPayload,
};
use crate::processor::{
    BatchConfig, BatchEventProcessor, EventDispatcher, FlushHook, NoopDispatcher,
    DEFAULT_SHUTDOWN_TIMEOUT,
};
use crate::profile::UserProfileService;
use crate::schema::{Datafile, VariableType};
use crate::sources::{CmabClient, CmabService, SegmentClient, SegmentService};
use crate::store::ConfigStore;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DEFAULT_CONFIG_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a client can be built with. All collaborators are optional;
/// the datafile can also arrive later through `update_datafile`.
pub struct ClientOptions {
    pub datafile: Option<String>,
    pub validate_datafile: bool,
    pub dispatcher: Option<Arc<dyn EventDispatcher>>,
    pub profile_service: Option<Arc<dyn UserProfileService>>,
    pub cmab_service: Option<Arc<dyn CmabService>>,
    pub segment_service: Option<Arc<dyn SegmentService>>,
    pub batch: BatchConfig,
    pub config_wait_timeout: Duration,
    pub default_decide_options: Vec<DecideOption>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            datafile: None,
            validate_datafile: false,
            dispatcher: None,
            profile_service: None,
            cmab_service: None,
            segment_service: None,
            batch: Default::default(),
            config_wait_timeout: DEFAULT_CONFIG_WAIT_TIMEOUT,
            default_decide_options: Vec::new(),
        }
    }
}

pub struct CumulusClient {
    store: Arc<ConfigStore>,
    decision_service: DecisionService,
    event_processor: BatchEventProcessor,
    notifications: Arc<NotificationCenter>,
    segments: Option<SegmentClient>,
    // (experiment key, user id) -> variation key, layered over the datafile
    // whitelist by the decision service.
    forced_variations: Mutex<HashMap<(String, String), String>>,
    default_decide_options: Vec<DecideOption>,
    config_wait_timeout: Duration,
    validate_datafile: bool,
}

impl CumulusClient {
    pub fn new(options: ClientOptions) -> Result<Self> {
        let notifications = Arc::new(NotificationCenter::new());
        let store = Arc::new(ConfigStore::new());

        let dispatcher = options
            .dispatcher
            .unwrap_or_else(|| Arc::new(NoopDispatcher));
        let hook_notifications = Arc::clone(&notifications);
        let on_flush: FlushHook = Box::new(move |log_event| {
            let params = serde_json::to_value(&log_event.params).unwrap_or(Value::Null);
            hook_notifications.notify_log_event(&LogEventPayload {
                url: log_event.url.clone(),
                params,
            });
        });
        let event_processor = BatchEventProcessor::new(dispatcher, options.batch, Some(on_flush));

        let client = Self {
            store,
            decision_service: DecisionService::new(
                options.profile_service,
                options.cmab_service.map(CmabClient::new),
            ),
            event_processor,
            notifications,
            segments: options.segment_service.map(SegmentClient::new),
            forced_variations: Default::default(),
            default_decide_options: options.default_decide_options,
            config_wait_timeout: options.config_wait_timeout,
            validate_datafile: options.validate_datafile,
        };
        if let Some(text) = options.datafile {
            client.update_datafile(&text)?;
        }
        Ok(client)
    }

    /// Parse and activate a new datafile. A rejected datafile leaves the
    /// previously-active config in place.
    pub fn update_datafile(&self, text: &str) -> Result<()> {
        let datafile = Datafile::parse_with_validation(text, self.validate_datafile)?;
        let config = Arc::new(ProjectConfig::new(datafile)?);
        let revision = config.revision.clone();
        self.store.set(config);
        self.notifications
            .notify_config_update(&ConfigUpdatePayload { revision });
        Ok(())
    }

    pub fn notifications(&self) -> &NotificationCenter {
        &self.notifications
    }

    pub fn create_user_context(
        &self,
        user_id: &str,
        attributes: UserAttributes,
    ) -> UserContext<'_> {
        UserContext::new(self, user_id, attributes)
    }

    /// Decide the variation for an experiment and emit an impression.
    pub fn activate(
        &self,
        experiment_key: &str,
        user_id: &str,
        attributes: &UserAttributes,
    ) -> Option<String> {
        self.experiment_decision(experiment_key, user_id, attributes, true)
    }

    /// Like [`CumulusClient::activate`], without the impression.
    pub fn get_variation(
        &self,
        experiment_key: &str,
        user_id: &str,
        attributes: &UserAttributes,
    ) -> Option<String> {
        self.experiment_decision(experiment_key, user_id, attributes, false)
    }

    fn experiment_decision(
        &self,
        experiment_key: &str,
        user_id: &str,
        attributes: &UserAttributes,
        send_event: bool,
    ) -> Option<String> {
        let config = self.config()?;
        let Some(experiment) = config.experiment_by_key(experiment_key) else {
            warn!("Experiment \"{}\" is not in the datafile", experiment_key);
            return None;
        };
        let snapshot = self.snapshot_for(user_id, attributes);
        let mut reasons = DecisionReasons::new(false);
        let variation = match self.decision_service.get_variation(
            &config,
            experiment,
            &snapshot,
            DecideOptions::default(),
            &mut reasons,
        ) {
            Ok(variation) => variation,
            Err(e) => {
                warn!("Deciding experiment \"{}\" failed: {}", experiment_key, e);
                None
            }
        };

        self.notifications.notify_decision(&DecisionPayload {
            decision_type: "ab-test".to_string(),
            user_id: user_id.to_string(),
            attributes: attributes.clone(),
            decision_info: json!({
                "experiment_key": experiment_key,
                "variation_key": variation.as_ref().map(|v| v.key.clone()),
            }),
        });

        let variation = variation?;
        if send_event {
            let impression = build_impression_event(
                &config,
                user_id,
                attributes,
                Some(experiment),
                Some(&variation),
                "",
                DecisionSource::Experiment,
                true,
            );
            self.event_processor.process(UserEvent::Impression(impression));
            self.notifications.notify_activate(&ActivatePayload {
                experiment_key: experiment.key.clone(),
                user_id: user_id.to_string(),
                attributes: attributes.clone(),
                variation_key: variation.key.clone(),
            });
        }
        Some(variation.key)
    }

    /// Record a conversion event. Unknown event keys are a no-op.
    pub fn track(
        &self,
        event_key: &str,
        user_id: &str,
        attributes: &UserAttributes,
        event_tags: Option<Map<String, Value>>,
    ) {
        let Some(config) = self.config() else {
            return;
        };
        let Some(event) = config.event_by_key(event_key) else {
            warn!(
                "Event \"{}\" is not in the datafile, not tracking",
                event_key
            );
            return;
        };
        let conversion =
            build_conversion_event(&config, event, user_id, attributes, event_tags.clone());
        self.event_processor
            .process(UserEvent::Conversion(conversion));
        info!("Tracking event \"{}\" for user \"{}\"", event_key, user_id);
        self.notifications.notify_track(&TrackPayload {
            event_key: event_key.to_string(),
            user_id: user_id.to_string(),
            attributes: attributes.clone(),
            event_tags: event_tags.unwrap_or_default(),
        });
    }

    pub fn is_feature_enabled(
        &self,
        flag_key: &str,
        user_id: &str,
        attributes: &UserAttributes,
    ) -> bool {
        let snapshot = self.snapshot_for(user_id, attributes);
        self.decide(&snapshot, flag_key, &[DecideOption::ExcludeVariables])
            .enabled
    }

    pub fn get_enabled_features(&self, user_id: &str, attributes: &UserAttributes) -> Vec<String> {
        let Some(config) = self.config() else {
            return Vec::new();
        };
        let mut keys: Vec<String> = config.flag_keys().cloned().collect();
        keys.sort();
        keys.into_iter()
            .filter(|key| self.is_feature_enabled(key, user_id, attributes))
            .collect()
    }

    pub fn get_feature_variable_string(
        &self,
        flag_key: &str,
        variable_key: &str,
        user_id: &str,
        attributes: &UserAttributes,
    ) -> Option<String> {
        match self.feature_variable(flag_key, variable_key, user_id, attributes, VariableType::String)? {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn get_feature_variable_integer(
        &self,
        flag_key: &str,
        variable_key: &str,
        user_id: &str,
        attributes: &UserAttributes,
    ) -> Option<i64> {
        self.feature_variable(flag_key, variable_key, user_id, attributes, VariableType::Integer)?
            .as_i64()
    }

    pub fn get_feature_variable_double(
        &self,
        flag_key: &str,
        variable_key: &str,
        user_id: &str,
        attributes: &UserAttributes,
    ) -> Option<f64> {
        self.feature_variable(flag_key, variable_key, user_id, attributes, VariableType::Double)?
            .as_f64()
    }

    pub fn get_feature_variable_boolean(
        &self,
        flag_key: &str,
        variable_key: &str,
        user_id: &str,
        attributes: &UserAttributes,
    ) -> Option<bool> {
        self.feature_variable(flag_key, variable_key, user_id, attributes, VariableType::Boolean)?
            .as_bool()
    }

    pub fn get_feature_variable_json(
        &self,
        flag_key: &str,
        variable_key: &str,
        user_id: &str,
        attributes: &UserAttributes,
    ) -> Option<Value> {
        self.feature_variable(flag_key, variable_key, user_id, attributes, VariableType::Json)
    }

    /// The values of all of a flag's variables for this user, each the same
    /// value its typed getter would return.
    pub fn get_all_feature_variables(
        &self,
        flag_key: &str,
        user_id: &str,
        attributes: &UserAttributes,
    ) -> Option<Map<String, Value>> {
        let config = self.config()?;
        let flag = config.flag_by_key(flag_key).cloned().or_else(|| {
            warn!("Feature \"{}\" is not in the datafile", flag_key);
            None
        })?;
        let snapshot = self.snapshot_for(user_id, attributes);
        let mut reasons = DecisionReasons::new(false);
        let decision = self
            .decision_service
            .decide_flag(&config, &flag, &snapshot, DecideOptions::default(), &mut reasons)
            .ok()?;
        let enabled = decision.enabled();
        let variables = self.resolve_variables(&config, flag_key, &decision, enabled, &mut reasons);
        self.notifications.notify_decision(&DecisionPayload {
            decision_type: "all-feature-variables".to_string(),
            user_id: user_id.to_string(),
            attributes: attributes.clone(),
            decision_info: json!({
                "flag_key": flag_key,
                "enabled": enabled,
                "variable_values": variables.clone(),
                "source": decision.source.to_string(),
            }),
        });
        Some(variables)
    }

    /// Shut the client down: drains and flushes the event pipeline within
    /// the timeout and joins its thread.
    pub fn close(&self, timeout: Option<Duration>) {
        self.event_processor
            .close(timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT));
    }

    // --- experiment-level forced variations --------------------------------

    /// Force `user_id` into a variation of an experiment, or clear the
    /// override with `None`. Returns false when the experiment is unknown.
    pub fn set_forced_variation(
        &self,
        experiment_key: &str,
        user_id: &str,
        variation_key: Option<&str>,
    ) -> bool {
        let Some(config) = self.config() else {
            return false;
        };
        if config.experiment_by_key(experiment_key).is_none() {
            warn!("Experiment \"{}\" is not in the datafile", experiment_key);
            return false;
        }
        let mut forced = self.forced_variations.lock().unwrap();
        let map_key = (experiment_key.to_string(), user_id.to_string());
        match variation_key {
            Some(variation_key) => {
                forced.insert(map_key, variation_key.to_string());
            }
            None => {
                forced.remove(&map_key);
            }
        }
        true
    }

    pub fn get_forced_variation(&self, experiment_key: &str, user_id: &str) -> Option<String> {
        self.forced_variations
            .lock()
            .unwrap()
            .get(&(experiment_key.to_string(), user_id.to_string()))
            .cloned()
    }

    pub(crate) fn forced_variations_for(&self, user_id: &str) -> HashMap<String, String> {
        self.forced_variations
            .lock()
            .unwrap()
            .iter()
            .filter(|((_, forced_user), _)| forced_user == user_id)
            .map(|((experiment_key, _), variation_key)| {
                (experiment_key.clone(), variation_key.clone())
            })
            .collect()
    }

    // --- the decide surface -------------------------------------------------

    pub(crate) fn decide(
        &self,
        snapshot: &ContextSnapshot,
        flag_key: &str,
        options: &[DecideOption],
    ) -> FlagDecision {
        let options = DecideOptions::collect(&self.default_decide_options, options);
        let mut reasons = DecisionReasons::new(options.include_reasons);

        let Some(config) = self.config() else {
            reasons.error("The SDK has no datafile yet".to_string());
            return default_decision(flag_key, snapshot, reasons);
        };
        let Some(flag) = config.flag_by_key(flag_key).cloned() else {
            reasons.error(format!("Feature \"{}\" is not in the datafile", flag_key));
            return default_decision(flag_key, snapshot, reasons);
        };

        let decision = match self
            .decision_service
            .decide_flag(&config, &flag, snapshot, options, &mut reasons)
        {
            Ok(decision) => decision,
            Err(e) => {
                reasons.error(format!("Deciding flag \"{}\" failed: {}", flag_key, e));
                Decision::none(DecisionSource::Rollout)
            }
        };
        let enabled = decision.enabled();

        let variables = if options.exclude_variables {
            Map::new()
        } else {
            self.resolve_variables(&config, flag_key, &decision, enabled, &mut reasons)
        };

        let mut decision_event_dispatched = false;
        if !options.disable_decision_event && should_send_impression(&config, decision.source) {
            let impression = build_impression_event(
                &config,
                &snapshot.user_id,
                &snapshot.attributes,
                decision.experiment.as_deref(),
                decision.variation.as_ref(),
                flag_key,
                decision.source,
                enabled,
            );
            self.event_processor.process(UserEvent::Impression(impression));
            decision_event_dispatched = true;
        }

        let variation_key = decision.variation.as_ref().map(|v| v.key.clone());
        let rule_key = decision.experiment.as_ref().map(|e| e.key.clone());
        self.notifications.notify_decision(&DecisionPayload {
            decision_type: "flag".to_string(),
            user_id: snapshot.user_id.clone(),
            attributes: snapshot.attributes.clone(),
            decision_info: json!({
                "flag_key": flag_key,
                "enabled": enabled,
                "variation_key": variation_key.clone(),
                "rule_key": rule_key.clone(),
                "variables": variables.clone(),
                "decision_event_dispatched": decision_event_dispatched,
            }),
        });

        FlagDecision {
            flag_key: flag_key.to_string(),
            enabled,
            variation_key,
            rule_key,
            variables,
            reasons: reasons.into_vec(),
            user_id: snapshot.user_id.clone(),
        }
    }

    pub(crate) fn decide_for_keys(
        &self,
        snapshot: &ContextSnapshot,
        flag_keys: &[&str],
        options: &[DecideOption],
    ) -> HashMap<String, FlagDecision> {
        let collected = DecideOptions::collect(&self.default_decide_options, options);
        let mut decisions = HashMap::new();
        for flag_key in flag_keys {
            let decision = self.decide(snapshot, flag_key, options);
            if collected.enabled_flags_only && !decision.enabled {
                continue;
            }
            decisions.insert((*flag_key).to_string(), decision);
        }
        decisions
    }

    pub(crate) fn decide_all(
        &self,
        snapshot: &ContextSnapshot,
        options: &[DecideOption],
    ) -> HashMap<String, FlagDecision> {
        let Some(config) = self.config() else {
            return HashMap::new();
        };
        let keys: Vec<String> = config.flag_keys().cloned().collect();
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.decide_for_keys(snapshot, &key_refs, options)
    }

    // --- segment & ODP plumbing --------------------------------------------

    pub(crate) fn fetch_qualified_segments(&self, user_id: &str) -> Result<Vec<String>> {
        match &self.segments {
            Some(segments) => segments.fetch_segments(user_id, false),
            None => {
                info!("No segment source configured, user \"{}\" has no qualified segments", user_id);
                Ok(Vec::new())
            }
        }
    }

    pub(crate) fn send_odp_event(
        &self,
        event_type: &str,
        action: &str,
        identifiers: &HashMap<String, String>,
        data: &HashMap<String, Value>,
    ) -> Result<()> {
        match &self.segments {
            Some(segments) => segments.send_event(event_type, action, identifiers, data),
            None => Err(CumulusError::SegmentFetchError(
                "no segment source configured".to_string(),
            )),
        }
    }

    // --- internals ----------------------------------------------------------

    fn config(&self) -> Option<Arc<ProjectConfig>> {
        match self.store.wait(self.config_wait_timeout) {
            Ok(config) => Some(config),
            Err(_) => {
                warn!("No datafile is available yet, returning no decision");
                None
            }
        }
    }

    fn snapshot_for(&self, user_id: &str, attributes: &UserAttributes) -> ContextSnapshot {
        let mut snapshot = ContextSnapshot::new(user_id, attributes.clone());
        snapshot.forced_variations = self.forced_variations_for(user_id);
        snapshot
    }

    fn feature_variable(
        &self,
        flag_key: &str,
        variable_key: &str,
        user_id: &str,
        attributes: &UserAttributes,
        expected: VariableType,
    ) -> Option<Value> {
        let config = self.config()?;
        let Some(flag) = config.flag_by_key(flag_key).cloned() else {
            warn!("Feature \"{}\" is not in the datafile", flag_key);
            return None;
        };
        let Some(variable) = config.variable(flag_key, variable_key) else {
            warn!(
                "Variable \"{}\" is not on feature \"{}\"",
                variable_key, flag_key
            );
            return None;
        };
        if variable.variable_type != expected {
            warn!(
                "{}",
                CumulusError::VariableTypeMismatch(
                    variable_key.to_string(),
                    variable.variable_type.to_string(),
                    expected.to_string()
                )
            );
            return None;
        }

        let snapshot = self.snapshot_for(user_id, attributes);
        let mut reasons = DecisionReasons::new(false);
        let decision = self
            .decision_service
            .decide_flag(&config, &flag, &snapshot, DecideOptions::default(), &mut reasons)
            .ok()?;
        let enabled = decision.enabled();
        let raw = config.variable_value(
            variable,
            if enabled {
                decision.variation.as_ref()
            } else {
                None
            },
        );
        let value = parse_variable_value(variable.variable_type, raw);
        if value.is_none() {
            warn!(
                "Variable \"{}\" of feature \"{}\" has an invalid stored value",
                variable_key, flag_key
            );
        }
        self.notifications.notify_decision(&DecisionPayload {
            decision_type: "feature-variable".to_string(),
            user_id: user_id.to_string(),
            attributes: attributes.clone(),
            decision_info: json!({
                "flag_key": flag_key,
                "variable_key": variable_key,
                "variable_type": variable.variable_type.to_string(),
                "variable_value": value.clone(),
                "enabled": enabled,
                "source": decision.source.to_string(),
            }),
        });
        value
    }

    fn resolve_variables(
        &self,
        config: &ProjectConfig,
        flag_key: &str,
        decision: &Decision,
        enabled: bool,
        reasons: &mut DecisionReasons,
    ) -> Map<String, Value> {
        let mut variables = Map::new();
        if let Some(flag_variables) = config.variables(flag_key) {
            for (key, variable) in flag_variables {
                // Overrides only apply when the served variation has the
                // feature enabled; otherwise everyone gets the defaults.
                let raw = config.variable_value(
                    variable,
                    if enabled {
                        decision.variation.as_ref()
                    } else {
                        None
                    },
                );
                match parse_variable_value(variable.variable_type, raw) {
                    Some(value) => {
                        variables.insert(key.clone(), value);
                    }
                    None => reasons.error(format!(
                        "Variable \"{}\" of feature \"{}\" has an invalid {} value",
                        key, flag_key, variable.variable_type
                    )),
                }
            }
        }
        variables
    }
}

fn should_send_impression(config: &ProjectConfig, source: DecisionSource) -> bool {
    config.send_flag_decisions
        || matches!(
            source,
            DecisionSource::FeatureTest | DecisionSource::Experiment
        )
}

fn default_decision(
    flag_key: &str,
    snapshot: &ContextSnapshot,
    reasons: DecisionReasons,
) -> FlagDecision {
    FlagDecision {
        flag_key: flag_key.to_string(),
        enabled: false,
        variation_key: None,
        rule_key: None,
        variables: Map::new(),
        reasons: reasons.into_vec(),
        user_id: snapshot.user_id.clone(),
    }
}
