/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

// utilities shared between tests

use cumulus::error::Result;
use cumulus::{
    BatchConfig, ClientOptions, CumulusClient, EventDispatcher, LogEvent, UserProfileService,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Remembers every payload handed to it, in dispatch order.
#[derive(Default)]
pub struct CollectingDispatcher {
    pub events: Mutex<Vec<LogEvent>>,
}

impl CollectingDispatcher {
    #[allow(dead_code)] // work around https://github.com/rust-lang/rust/issues/46379
    pub fn batches(&self) -> Vec<LogEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventDispatcher for CollectingDispatcher {
    fn dispatch_event(&self, event: LogEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

#[allow(dead_code)] // work around https://github.com/rust-lang/rust/issues/46379
pub fn new_test_client() -> Result<(CumulusClient, Arc<CollectingDispatcher>)> {
    new_test_client_with_profiles(None)
}

#[allow(dead_code)] // work around https://github.com/rust-lang/rust/issues/46379
pub fn new_test_client_with_profiles(
    profile_service: Option<Arc<dyn UserProfileService>>,
) -> Result<(CumulusClient, Arc<CollectingDispatcher>)> {
    let _ = env_logger::try_init();
    let dispatcher = Arc::new(CollectingDispatcher::default());
    let client = CumulusClient::new(ClientOptions {
        datafile: Some(seed_datafile()),
        dispatcher: Some(Arc::clone(&dispatcher) as Arc<dyn EventDispatcher>),
        profile_service,
        // Flush every event immediately so tests can observe dispatches
        // deterministically after close().
        batch: BatchConfig {
            batch_size: 1,
            flush_interval: Duration::from_secs(30),
            ..Default::default()
        },
        ..Default::default()
    })?;
    Ok((client, dispatcher))
}

/// The seed project of the end-to-end scenarios: flag `feature_1` with one
/// 50/50 feature test gated on the `adults` audience, and a rollout with a
/// premium-only rule at 50% plus a catch-all at 100%.
#[allow(dead_code)] // work around https://github.com/rust-lang/rust/issues/46379
pub fn seed_datafile() -> String {
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
                "forcedVariations": {},
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
    .to_string()
}
