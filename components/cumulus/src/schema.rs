/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The wire model of the versioned datafile JSON. Everything in here is a
//! plain serde mapping of the document; `crate::config::ProjectConfig` builds
//! the indexed, immutable model on top of it.

use crate::error::{CumulusError, Result};
use serde_derive::*;
use serde_json::Value;
use std::collections::HashMap;

pub const SUPPORTED_DATAFILE_VERSIONS: &[&str] = &["2", "3", "4"];

/// The maximum bucket value; bucket values live in `[0, 10000)` and
/// traffic allocation ranges end at 10000.
pub const MAX_TRAFFIC_VALUE: u32 = 10000;

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Datafile {
    pub version: String,
    pub account_id: String,
    pub project_id: String,
    pub revision: String,
    #[serde(rename = "anonymizeIP", default)]
    pub anonymize_ip: bool,
    #[serde(default)]
    pub bot_filtering: Option<bool>,
    #[serde(default)]
    pub send_flag_decisions: bool,
    #[serde(default)]
    pub sdk_key: Option<String>,
    #[serde(default)]
    pub environment_key: Option<String>,
    #[serde(default)]
    pub experiments: Vec<ExperimentData>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub events: Vec<EventData>,
    #[serde(default)]
    pub audiences: Vec<AudienceData>,
    // Typed audiences take precedence over legacy audiences with the same id.
    #[serde(default)]
    pub typed_audiences: Vec<AudienceData>,
    #[serde(default)]
    pub attributes: Vec<AttributeData>,
    #[serde(default)]
    pub feature_flags: Vec<FeatureFlag>,
    #[serde(default)]
    pub rollouts: Vec<Rollout>,
    #[serde(default)]
    pub holdouts: Vec<Holdout>,
}

impl Datafile {
    /// Parse a datafile from its JSON text. Fails with
    /// `UnsupportedDatafileVersion` when the `version` key is missing or not
    /// one of the supported values; unknown fields elsewhere are tolerated.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text).map_err(|e| {
            CumulusError::JSONError("cumulus::schema::Datafile::parse".into(), e.to_string())
        })?;
        let version = value
            .get("version")
            .and_then(Value::as_str)
            .ok_or_else(|| CumulusError::UnsupportedDatafileVersion("<missing>".into()))?;
        if !SUPPORTED_DATAFILE_VERSIONS.contains(&version) {
            return Err(CumulusError::UnsupportedDatafileVersion(version.into()));
        }
        serde_json::from_value(value).map_err(|e| {
            CumulusError::InvalidDatafile(format!("malformed datafile: {}", e))
        })
    }

    /// Like [`Datafile::parse`], optionally running the strict structural
    /// checks afterwards. Violations fail with `InvalidDatafile`.
    pub fn parse_with_validation(text: &str, validate: bool) -> Result<Self> {
        let datafile = Self::parse(text)?;
        if validate {
            datafile.validate()?;
        }
        Ok(datafile)
    }

    fn validate(&self) -> Result<()> {
        for experiment in self
            .experiments
            .iter()
            .chain(self.groups.iter().flat_map(|g| g.experiments.iter()))
            .chain(self.rollouts.iter().flat_map(|r| r.experiments.iter()))
        {
            validate_allocations(&experiment.key, &experiment.traffic_allocation)?;
            for entry in &experiment.traffic_allocation {
                if !entry.entity_id.is_empty() && !experiment.has_variation(&entry.entity_id) {
                    return Err(CumulusError::InvalidDatafile(format!(
                        "experiment {} allocates traffic to unknown variation {}",
                        experiment.key, entry.entity_id
                    )));
                }
            }
        }
        for group in &self.groups {
            validate_allocations(&group.id, &group.traffic_allocation)?;
        }
        for holdout in &self.holdouts {
            validate_allocations(&holdout.key, &holdout.traffic_allocation)?;
        }
        Ok(())
    }
}

fn validate_allocations(owner: &str, allocations: &[TrafficAllocation]) -> Result<()> {
    let mut previous_end = 0;
    for entry in allocations {
        if entry.end_of_range > MAX_TRAFFIC_VALUE || entry.end_of_range < previous_end {
            return Err(CumulusError::InvalidDatafile(format!(
                "traffic allocation for {} is not an ascending partition of [0, {}]",
                owner, MAX_TRAFFIC_VALUE
            )));
        }
        previous_end = entry.end_of_range;
    }
    Ok(())
}

// Statuses arrive as display strings; anything unrecognized maps to
// `Unknown` rather than failing the whole datafile.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub enum ExperimentStatus {
    Running,
    NotStarted,
    Paused,
    Archived,
    Unknown,
}

impl Default for ExperimentStatus {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl From<String> for ExperimentStatus {
    fn from(status: String) -> Self {
        match status.as_str() {
            "Running" => Self::Running,
            "Not started" => Self::NotStarted,
            "Paused" => Self::Paused,
            "Archived" => Self::Archived,
            _ => Self::Unknown,
        }
    }
}

impl From<ExperimentStatus> for String {
    fn from(status: ExperimentStatus) -> Self {
        match status {
            ExperimentStatus::Running => "Running",
            ExperimentStatus::NotStarted => "Not started",
            ExperimentStatus::Paused => "Paused",
            ExperimentStatus::Archived => "Archived",
            ExperimentStatus::Unknown => "Unknown",
        }
        .to_string()
    }
}

/// An experiment as it appears in the datafile. The same structure describes
/// plain A/B experiments, feature tests, grouped experiments, and the rules
/// of a rollout.
#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentData {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub status: ExperimentStatus,
    #[serde(default)]
    pub layer_id: Option<String>,
    #[serde(default)]
    pub audience_ids: Vec<String>,
    // When present, this nested tree overrides the legacy `audienceIds`
    // or-list semantics. Kept as a raw value; the evaluator parses it.
    #[serde(default)]
    pub audience_conditions: Option<Value>,
    #[serde(default)]
    pub forced_variations: HashMap<String, String>,
    #[serde(default)]
    pub traffic_allocation: Vec<TrafficAllocation>,
    #[serde(default)]
    pub variations: Vec<Variation>,
    #[serde(default)]
    pub cmab: Option<CmabConfig>,
}

impl ExperimentData {
    pub fn is_running(&self) -> bool {
        matches!(self.status, ExperimentStatus::Running)
    }

    pub fn has_variation(&self, variation_id: &str) -> bool {
        self.variations.iter().any(|v| v.id == variation_id)
    }

    pub fn get_variation(&self, variation_id: &str) -> Option<&Variation> {
        self.variations.iter().find(|v| v.id == variation_id)
    }

    pub fn get_variation_by_key(&self, variation_key: &str) -> Option<&Variation> {
        self.variations.iter().find(|v| v.key == variation_key)
    }
}

/// The marker attaching an experiment to the contextual-bandit decision
/// service: the decision comes from the external source instead of the
/// bucketer, for the share of traffic named here.
#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CmabConfig {
    #[serde(default)]
    pub attribute_ids: Vec<String>,
    pub traffic_allocation: u32,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Variation {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub feature_enabled: Option<bool>,
    #[serde(default)]
    pub variables: Vec<VariableUsage>,
}

impl Variation {
    pub fn is_feature_enabled(&self) -> bool {
        self.feature_enabled.unwrap_or(false)
    }
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VariableUsage {
    pub id: String,
    pub value: String,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrafficAllocation {
    // An empty entity id is an allocated slot with no variation behind it.
    pub entity_id: String,
    pub end_of_range: u32,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AudienceData {
    pub id: String,
    #[serde(default)]
    pub name: String,
    // Either a JSON string (legacy) or a nested array tree.
    pub conditions: Value,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GroupPolicy {
    Random,
    Overlapping,
}

impl Default for GroupPolicy {
    fn default() -> Self {
        Self::Overlapping
    }
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    #[serde(default)]
    pub policy: GroupPolicy,
    #[serde(default)]
    pub traffic_allocation: Vec<TrafficAllocation>,
    #[serde(default)]
    pub experiments: Vec<ExperimentData>,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub rollout_id: String,
    // Feature tests, ordered by priority.
    #[serde(default)]
    pub experiment_ids: Vec<String>,
    #[serde(default)]
    pub variables: Vec<FeatureVariable>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    String,
    Integer,
    Double,
    Boolean,
    Json,
}

impl std::fmt::Display for VariableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            VariableType::String => "string",
            VariableType::Integer => "integer",
            VariableType::Double => "double",
            VariableType::Boolean => "boolean",
            VariableType::Json => "json",
        })
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeatureVariable {
    pub id: String,
    pub key: String,
    #[serde(rename = "type")]
    pub variable_type: VariableType,
    pub default_value: String,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    pub id: String,
    // Ordered rules; the last one is the "everyone else" rule.
    #[serde(default)]
    pub experiments: Vec<ExperimentData>,
}

/// A v4-only population set aside from all feature-test traffic, evaluated
/// before any experiments attached to the flags it covers.
#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Holdout {
    pub id: String,
    pub key: String,
    // Unlike experiments, a holdout without a status is live.
    #[serde(default = "running_status")]
    pub status: ExperimentStatus,
    #[serde(default)]
    pub audience_ids: Vec<String>,
    #[serde(default)]
    pub audience_conditions: Option<Value>,
    #[serde(default)]
    pub traffic_allocation: Vec<TrafficAllocation>,
    #[serde(default)]
    pub variations: Vec<Variation>,
    // With `includedFlags` the holdout covers those flags only; without it,
    // every flag except the `excludedFlags`.
    #[serde(default)]
    pub included_flags: Vec<String>,
    #[serde(default)]
    pub excluded_flags: Vec<String>,
}

fn running_status() -> ExperimentStatus {
    ExperimentStatus::Running
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttributeData {
    pub id: String,
    pub key: String,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub experiment_ids: Vec<String>,
}
