/* This Source Code Form is subject to the terms of the Mozilla Public
* License, v. 2.0. If a copy of the MPL was not distributed with this
* file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::config::ProjectConfig;
use crate::context::ContextSnapshot;
use crate::error::Result;
use crate::evaluator::UserAttributes;
use crate::processor::{EventDispatcher, LogEvent};
use crate::schema::Datafile;
use serde_json::{json, Value};
use std::sync::Mutex;

/// The seed project used across the decision tests: one flag with one
/// 50/50 feature test gated on an `adults` audience, and a rollout with a
/// premium-only targeted rule at 50% plus a catch-all rule at 100%.
pub(crate) fn seed_datafile_json() -> Value {
    json!({
        "version": "4",
        "accountId": "12001",
        "projectId": "10001",
        "revision": "42",
        "anonymizeIP": true,
        "botFiltering": false,
        "sendFlagDecisions": true,
        "sdkKey": "sdk-key-1",
        "environmentKey": "production",
        "attributes": [
            {"id": "66601", "key": "age"},
            {"id": "66602", "key": "premium"}
        ],
        "events": [
            {"id": "77701", "key": "purchase", "experimentIds": ["10101"]}
        ],
        "audiences": [
            {
                "id": "13001",
                "name": "adults",
                "conditions": "[\"and\", {\"name\": \"age\", \"type\": \"custom_attribute\", \"match\": \"ge\", \"value\": 18}]"
            }
        ],
        "typedAudiences": [
            {
                "id": "13002",
                "name": "premium_users",
                "conditions": ["and", {"name": "premium", "type": "custom_attribute", "match": "exact", "value": true}]
            }
        ],
        "groups": [],
        "experiments": [
            {
                "id": "10101",
                "key": "exp_1",
                "status": "Running",
                "layerId": "layer_101",
                "audienceIds": ["13001"],
                "forcedVariations": {"wl_user": "b"},
                "trafficAllocation": [
                    {"entityId": "20001", "endOfRange": 5000},
                    {"entityId": "20002", "endOfRange": 10000}
                ],
                "variations": [
                    {
                        "id": "20001",
                        "key": "a",
                        "featureEnabled": true,
                        "variables": [{"id": "55501", "value": "A"}]
                    },
                    {
                        "id": "20002",
                        "key": "b",
                        "featureEnabled": false,
                        "variables": [{"id": "55501", "value": "B"}]
                    }
                ]
            }
        ],
        "featureFlags": [
            {
                "id": "91001",
                "key": "feature_1",
                "rolloutId": "30001",
                "experimentIds": ["10101"],
                "variables": [
                    {"id": "55501", "key": "x", "type": "string", "defaultValue": "X"},
                    {"id": "55502", "key": "limit", "type": "integer", "defaultValue": "10"}
                ]
            }
        ],
        "rollouts": [
            {
                "id": "30001",
                "experiments": [
                    {
                        "id": "10201",
                        "key": "rule_1",
                        "status": "Running",
                        "layerId": "30001",
                        "audienceIds": ["13002"],
                        "trafficAllocation": [{"entityId": "20003", "endOfRange": 5000}],
                        "variations": [
                            {
                                "id": "20003",
                                "key": "c",
                                "featureEnabled": true,
                                "variables": [{"id": "55501", "value": "C"}]
                            }
                        ]
                    },
                    {
                        "id": "10202",
                        "key": "rule_everyone",
                        "status": "Running",
                        "layerId": "30001",
                        "audienceIds": [],
                        "trafficAllocation": [{"entityId": "20004", "endOfRange": 10000}],
                        "variations": [
                            {
                                "id": "20004",
                                "key": "d",
                                "featureEnabled": true,
                                "variables": [{"id": "55501", "value": "D"}]
                            }
                        ]
                    }
                ]
            }
        ]
    })
}

pub(crate) fn seed_config() -> Result<ProjectConfig> {
    let datafile = Datafile::parse(&seed_datafile_json().to_string())?;
    ProjectConfig::new(datafile)
}

/// A seed variant with a 10% holdout covering every flag.
pub(crate) fn seed_config_with_holdout() -> Result<ProjectConfig> {
    let mut json = seed_datafile_json();
    json["holdouts"] = json!([
        {
            "id": "10401",
            "key": "holdout_1",
            "status": "Running",
            "audienceIds": [],
            "trafficAllocation": [{"entityId": "20005", "endOfRange": 1000}],
            "variations": [
                {"id": "20005", "key": "ho_off", "featureEnabled": false, "variables": []}
            ]
        }
    ]);
    let datafile = Datafile::parse(&json.to_string())?;
    ProjectConfig::new(datafile)
}

/// A seed variant whose experiments live in a mutually-exclusive group.
pub(crate) fn seed_config_with_group() -> Result<ProjectConfig> {
    let mut json = seed_datafile_json();
    json["groups"] = json!([
        {
            "id": "44001",
            "policy": "random",
            "trafficAllocation": [
                {"entityId": "10301", "endOfRange": 5000},
                {"entityId": "10302", "endOfRange": 10000}
            ],
            "experiments": [
                {
                    "id": "10301",
                    "key": "g_exp_1",
                    "status": "Running",
                    "layerId": "layer_301",
                    "audienceIds": [],
                    "trafficAllocation": [{"entityId": "21001", "endOfRange": 10000}],
                    "variations": [{"id": "21001", "key": "ga", "featureEnabled": true, "variables": []}]
                },
                {
                    "id": "10302",
                    "key": "g_exp_2",
                    "status": "Running",
                    "layerId": "layer_302",
                    "audienceIds": [],
                    "trafficAllocation": [{"entityId": "21002", "endOfRange": 10000}],
                    "variations": [{"id": "21002", "key": "gb", "featureEnabled": true, "variables": []}]
                }
            ]
        }
    ]);
    let datafile = Datafile::parse(&json.to_string())?;
    ProjectConfig::new(datafile)
}

pub(crate) fn attributes(pairs: &[(&str, Value)]) -> UserAttributes {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

pub(crate) fn snapshot(user_id: &str, attrs: &[(&str, Value)]) -> ContextSnapshot {
    ContextSnapshot::new(user_id, attributes(attrs))
}

/// A dispatcher that remembers every payload it is handed.
#[derive(Default)]
pub(crate) struct CollectingDispatcher {
    pub events: Mutex<Vec<LogEvent>>,
}

impl EventDispatcher for CollectingDispatcher {
    fn dispatch_event(&self, event: LogEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}
