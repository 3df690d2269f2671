/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

mod common;

use common::new_test_client;
use cumulus::error::Result;
use cumulus::UserAttributes;
use serde_json::{json, Map, Value};

fn attrs(pairs: &[(&str, Value)]) -> UserAttributes {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

#[test]
fn test_track_conversion_with_tags() -> Result<()> {
    let (client, dispatcher) = new_test_client()?;
    let mut tags = Map::new();
    tags.insert("revenue".to_string(), json!(1200));
    tags.insert("value".to_string(), json!(3.5));
    client.track("purchase", "u1", &attrs(&[("age", json!(30))]), Some(tags));
    client.close(None);

    let batches = dispatcher.batches();
    assert_eq!(batches.len(), 1, "exactly one conversion should dispatch");
    let visitor = &batches[0].params.visitors[0];
    assert_eq!(visitor.visitor_id, "u1");
    let event = &visitor.snapshots[0].events[0];
    assert_eq!(event.key, "purchase");
    assert_eq!(event.entity_id, "77701");
    assert_eq!(event.revenue, Some(1200));
    assert_eq!(event.value, Some(3.5));
    assert!(event.timestamp > 0);
    assert_eq!(event.uuid.len(), 36);
    assert_eq!(event.uuid.as_bytes()[14], b'4');
    // The attribute rides along with its datafile entity id.
    assert!(visitor
        .attributes
        .iter()
        .any(|a| a.key == "age" && a.entity_id == "66601"));
    Ok(())
}

#[test]
fn test_track_unknown_event_is_a_noop() -> Result<()> {
    let (client, dispatcher) = new_test_client()?;
    client.track("no_such_event", "u1", &attrs(&[]), None);
    client.close(None);
    assert!(dispatcher.batches().is_empty());
    Ok(())
}

#[test]
fn test_event_conservation_and_ordering() -> Result<()> {
    let (client, dispatcher) = new_test_client()?;
    let ctx = client.create_user_context("u1", attrs(&[("age", json!(30))]));
    // One impression from decide, then two conversions.
    let decision = ctx.decide("feature_1", &[]);
    assert!(decision.enabled);
    ctx.track_event("purchase", None);
    ctx.track_event("purchase", None);
    client.close(None);

    let batches = dispatcher.batches();
    // batch_size=1: every event flushes on its own, in producer order.
    assert_eq!(batches.len(), 3);
    assert_eq!(batches[0].params.visitors[0].snapshots[0].decisions.len(), 1);
    assert!(batches[1].params.visitors[0].snapshots[0].decisions.is_empty());

    // Timestamps never go backwards within one producer.
    let timestamps: Vec<i64> = batches
        .iter()
        .map(|b| b.params.visitors[0].snapshots[0].events[0].timestamp)
        .collect();
    assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
    Ok(())
}

#[test]
fn test_activate_emits_one_impression() -> Result<()> {
    let (client, dispatcher) = new_test_client()?;
    let variation = client.activate("exp_1", "u1", &attrs(&[("age", json!(30))]));
    assert_eq!(variation.as_deref(), Some("a"));

    // get_variation decides without an impression.
    let variation = client.get_variation("exp_1", "u2", &attrs(&[("age", json!(30))]));
    assert_eq!(variation.as_deref(), Some("b"));

    // Unknown experiments and failed audiences yield nothing.
    assert!(client.activate("no_such_exp", "u1", &attrs(&[])).is_none());
    assert!(client
        .activate("exp_1", "u1", &attrs(&[("age", json!(12))]))
        .is_none());

    client.close(None);
    let batches = dispatcher.batches();
    assert_eq!(batches.len(), 1);
    let decision = &batches[0].params.visitors[0].snapshots[0].decisions[0];
    assert_eq!(decision.metadata.rule_type, "experiment");
    assert_eq!(decision.metadata.rule_key, "exp_1");
    assert_eq!(decision.campaign_id, "layer_101");
    Ok(())
}
