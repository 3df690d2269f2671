/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Builds the wire events that describe decisions (impressions) and
//! `track` calls (conversions), and the batched payload POSTed to the
//! collector. Events are immutable once built; the batch processor only
//! groups them.

use crate::config::ProjectConfig;
use crate::decision::DecisionSource;
use crate::evaluator::UserAttributes;
use crate::schema::{EventData, ExperimentData, Variation};
use chrono::Utc;
use serde_derive::*;
use serde_json::{Map, Value};
use uuid::Uuid;

pub const CLIENT_NAME: &str = "rust-sdk";
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const ACTIVATE_EVENT_KEY: &str = "campaign_activated";
const CUSTOM_ATTRIBUTE_TYPE: &str = "custom";
const BOT_FILTERING_ATTRIBUTE: &str = "$opt_bot_filtering";
const RESERVED_ATTRIBUTE_PREFIX: &str = "$opt_";

const REVENUE_TAG: &str = "revenue";
const VALUE_TAG: &str = "value";

// Numbers beyond ±2^53 are not representable faithfully on the wire.
const ABS_NUMBER_LIMIT: f64 = 9007199254740992.0;

/// The header fields every event inherits from the datafile that was active
/// when it was created. Events with differing contexts never share a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    pub account_id: String,
    pub project_id: String,
    pub revision: String,
    pub anonymize_ip: bool,
}

impl EventContext {
    pub fn new(config: &ProjectConfig) -> Self {
        Self {
            account_id: config.account_id.clone(),
            project_id: config.project_id.clone(),
            revision: config.revision.clone(),
            anonymize_ip: config.anonymize_ip,
        }
    }
}

#[derive(Debug, Clone)]
pub enum UserEvent {
    Impression(ImpressionEvent),
    Conversion(ConversionEvent),
}

impl UserEvent {
    pub fn context(&self) -> &EventContext {
        match self {
            UserEvent::Impression(event) => &event.context,
            UserEvent::Conversion(event) => &event.context,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImpressionEvent {
    pub context: EventContext,
    pub user_id: String,
    pub attributes: Vec<VisitorAttribute>,
    pub campaign_id: String,
    pub experiment_id: String,
    pub variation_id: String,
    pub variation_key: String,
    pub flag_key: String,
    pub rule_key: String,
    pub rule_type: String,
    pub enabled: bool,
    pub timestamp: i64,
    pub uuid: String,
}

#[derive(Debug, Clone)]
pub struct ConversionEvent {
    pub context: EventContext,
    pub user_id: String,
    pub attributes: Vec<VisitorAttribute>,
    pub event_id: String,
    pub event_key: String,
    pub tags: Map<String, Value>,
    pub revenue: Option<i64>,
    pub value: Option<f64>,
    pub timestamp: i64,
    pub uuid: String,
}

/// One decision turned into an impression. `experiment` and `variation` are
/// absent for flag decisions that resolved to nothing but still report.
pub(crate) fn build_impression_event(
    config: &ProjectConfig,
    user_id: &str,
    attributes: &UserAttributes,
    experiment: Option<&ExperimentData>,
    variation: Option<&Variation>,
    flag_key: &str,
    source: DecisionSource,
    enabled: bool,
) -> ImpressionEvent {
    ImpressionEvent {
        context: EventContext::new(config),
        user_id: user_id.to_string(),
        attributes: visitor_attributes(config, attributes),
        campaign_id: experiment
            .and_then(|e| e.layer_id.clone())
            .unwrap_or_default(),
        experiment_id: experiment.map(|e| e.id.clone()).unwrap_or_default(),
        variation_id: variation.map(|v| v.id.clone()).unwrap_or_default(),
        variation_key: variation.map(|v| v.key.clone()).unwrap_or_default(),
        flag_key: flag_key.to_string(),
        rule_key: experiment.map(|e| e.key.clone()).unwrap_or_default(),
        rule_type: source.to_string(),
        enabled,
        timestamp: now_millis(),
        uuid: new_uuid(),
    }
}

pub(crate) fn build_conversion_event(
    config: &ProjectConfig,
    event: &EventData,
    user_id: &str,
    attributes: &UserAttributes,
    tags: Option<Map<String, Value>>,
) -> ConversionEvent {
    let tags = tags.unwrap_or_default();
    ConversionEvent {
        context: EventContext::new(config),
        user_id: user_id.to_string(),
        attributes: visitor_attributes(config, attributes),
        event_id: event.id.clone(),
        event_key: event.key.clone(),
        revenue: revenue_from_tags(&tags),
        value: value_from_tags(&tags),
        tags,
        timestamp: now_millis(),
        uuid: new_uuid(),
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn new_uuid() -> String {
    Uuid::new_v4().to_string()
}

// `revenue` rides along as an integer; a float with a fractional part is
// not a revenue.
fn revenue_from_tags(tags: &Map<String, Value>) -> Option<i64> {
    match tags.get(REVENUE_TAG)? {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        _ => None,
    }
}

fn value_from_tags(tags: &Map<String, Value>) -> Option<f64> {
    match tags.get(VALUE_TAG)? {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn is_valid_attribute_value(value: &Value) -> bool {
    match value {
        Value::String(_) | Value::Bool(_) => true,
        Value::Number(n) => n
            .as_f64()
            .map(|f| f.is_finite() && f.abs() <= ABS_NUMBER_LIMIT)
            .unwrap_or(false),
        _ => false,
    }
}

/// Encode the user's attributes for the wire. Values keep their type;
/// attributes the datafile does not know are forwarded under their own key,
/// and the bot-filtering marker is appended when the datafile asks for it.
pub(crate) fn visitor_attributes(
    config: &ProjectConfig,
    attributes: &UserAttributes,
) -> Vec<VisitorAttribute> {
    let mut keys: Vec<&String> = attributes.keys().collect();
    // Attribute maps are hashed; sort for a stable payload.
    keys.sort();
    let mut encoded = Vec::with_capacity(keys.len() + 1);
    for key in keys {
        let value = &attributes[key];
        if !is_valid_attribute_value(value) {
            continue;
        }
        let entity_id = if key.starts_with(RESERVED_ATTRIBUTE_PREFIX) {
            key.as_str()
        } else {
            config.attribute_id(key).unwrap_or(key.as_str())
        };
        encoded.push(VisitorAttribute {
            entity_id: entity_id.to_string(),
            key: key.clone(),
            attribute_type: CUSTOM_ATTRIBUTE_TYPE.to_string(),
            value: value.clone(),
        });
    }
    if let Some(bot_filtering) = config.bot_filtering {
        encoded.push(VisitorAttribute {
            entity_id: BOT_FILTERING_ATTRIBUTE.to_string(),
            key: BOT_FILTERING_ATTRIBUTE.to_string(),
            attribute_type: CUSTOM_ATTRIBUTE_TYPE.to_string(),
            value: Value::Bool(bot_filtering),
        });
    }
    encoded
}

// --- The POSTed payload ----------------------------------------------------

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct EventBatch {
    pub account_id: String,
    pub project_id: String,
    pub revision: String,
    pub client_name: String,
    pub client_version: String,
    pub anonymize_ip: bool,
    pub enrich_decisions: bool,
    pub visitors: Vec<Visitor>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Visitor {
    pub visitor_id: String,
    pub attributes: Vec<VisitorAttribute>,
    pub snapshots: Vec<Snapshot>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct VisitorAttribute {
    pub entity_id: String,
    pub key: String,
    #[serde(rename = "type")]
    pub attribute_type: String,
    pub value: Value,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Snapshot {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decisions: Vec<SnapshotDecision>,
    pub events: Vec<SnapshotEvent>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct SnapshotDecision {
    pub campaign_id: String,
    pub experiment_id: String,
    pub variation_id: String,
    pub metadata: DecisionMetadata,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct DecisionMetadata {
    pub flag_key: String,
    pub rule_key: String,
    pub rule_type: String,
    pub variation_key: String,
    pub enabled: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct SnapshotEvent {
    pub entity_id: String,
    pub timestamp: i64,
    pub uuid: String,
    pub key: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub tags: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revenue: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

/// Assemble one batch from events sharing a context. Returns `None` for an
/// empty slice.
pub(crate) fn build_batch(events: &[UserEvent]) -> Option<EventBatch> {
    let context = events.first()?.context().clone();
    Some(EventBatch {
        account_id: context.account_id,
        project_id: context.project_id,
        revision: context.revision,
        client_name: CLIENT_NAME.to_string(),
        client_version: CLIENT_VERSION.to_string(),
        anonymize_ip: context.anonymize_ip,
        enrich_decisions: true,
        visitors: events.iter().map(visitor_for).collect(),
    })
}

fn visitor_for(event: &UserEvent) -> Visitor {
    match event {
        UserEvent::Impression(impression) => Visitor {
            visitor_id: impression.user_id.clone(),
            attributes: impression.attributes.clone(),
            snapshots: vec![Snapshot {
                decisions: vec![SnapshotDecision {
                    campaign_id: impression.campaign_id.clone(),
                    experiment_id: impression.experiment_id.clone(),
                    variation_id: impression.variation_id.clone(),
                    metadata: DecisionMetadata {
                        flag_key: impression.flag_key.clone(),
                        rule_key: impression.rule_key.clone(),
                        rule_type: impression.rule_type.clone(),
                        variation_key: impression.variation_key.clone(),
                        enabled: impression.enabled,
                    },
                }],
                events: vec![SnapshotEvent {
                    entity_id: impression.campaign_id.clone(),
                    timestamp: impression.timestamp,
                    uuid: impression.uuid.clone(),
                    key: ACTIVATE_EVENT_KEY.to_string(),
                    event_type: ACTIVATE_EVENT_KEY.to_string(),
                    tags: Map::new(),
                    revenue: None,
                    value: None,
                }],
            }],
        },
        UserEvent::Conversion(conversion) => Visitor {
            visitor_id: conversion.user_id.clone(),
            attributes: conversion.attributes.clone(),
            snapshots: vec![Snapshot {
                decisions: Vec::new(),
                events: vec![SnapshotEvent {
                    entity_id: conversion.event_id.clone(),
                    timestamp: conversion.timestamp,
                    uuid: conversion.uuid.clone(),
                    key: conversion.event_key.clone(),
                    event_type: conversion.event_key.clone(),
                    tags: conversion.tags.clone(),
                    revenue: conversion.revenue,
                    value: conversion.value,
                }],
            }],
        },
    }
}
