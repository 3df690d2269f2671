/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

mod common;

use common::{new_test_client, new_test_client_with_profiles};
use cumulus::error::Result;
use cumulus::{
    DecideOption, InMemoryProfileService, UserAttributes, UserProfile, UserProfileService,
};
use serde_json::json;
use std::sync::Arc;

fn attrs(pairs: &[(&str, serde_json::Value)]) -> UserAttributes {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

#[test]
fn test_decide_feature_test_variation_a() -> Result<()> {
    let (client, dispatcher) = new_test_client()?;
    let ctx = client.create_user_context("u1", attrs(&[("age", json!(30))]));
    let decision = ctx.decide("feature_1", &[]);

    assert_eq!(decision.variation_key.as_deref(), Some("a"));
    assert!(decision.enabled);
    assert_eq!(decision.rule_key.as_deref(), Some("exp_1"));
    assert_eq!(decision.variables["x"], json!("A"));
    assert_eq!(decision.variables["limit"], json!(10));

    client.close(None);
    let batches = dispatcher.batches();
    assert_eq!(batches.len(), 1, "exactly one impression should dispatch");
    let decision_on_wire = &batches[0].params.visitors[0].snapshots[0].decisions[0];
    assert_eq!(decision_on_wire.metadata.rule_type, "feature-test");
    assert_eq!(decision_on_wire.metadata.flag_key, "feature_1");
    assert_eq!(decision_on_wire.metadata.variation_key, "a");
    assert!(decision_on_wire.metadata.enabled);
    assert_eq!(decision_on_wire.campaign_id, "layer_101");
    Ok(())
}

#[test]
fn test_decide_feature_test_variation_b_disabled() -> Result<()> {
    let (client, _dispatcher) = new_test_client()?;
    let ctx = client.create_user_context("u2", attrs(&[("age", json!(30))]));
    let decision = ctx.decide("feature_1", &[]);

    assert_eq!(decision.variation_key.as_deref(), Some("b"));
    assert!(!decision.enabled);
    // The variation has the feature off, so its overrides do not apply.
    assert_eq!(decision.variables["x"], json!("X"));
    client.close(None);
    Ok(())
}

#[test]
fn test_decide_rollout_catch_all_for_minor() -> Result<()> {
    let (client, _dispatcher) = new_test_client()?;
    let ctx = client.create_user_context("u3", attrs(&[("age", json!(12))]));
    let decision = ctx.decide("feature_1", &[DecideOption::IncludeReasons]);

    assert_eq!(decision.variation_key.as_deref(), Some("d"));
    assert!(decision.enabled);
    assert_eq!(decision.rule_key.as_deref(), Some("rule_everyone"));
    assert_eq!(decision.variables["x"], json!("D"));
    client.close(None);
    Ok(())
}

#[test]
fn test_decide_rollout_targeted_and_skip_to_catch_all() -> Result<()> {
    let (client, _dispatcher) = new_test_client()?;

    // alice buckets inside the targeted rule's 50%.
    let ctx = client.create_user_context("alice", attrs(&[("premium", json!(true))]));
    let decision = ctx.decide("feature_1", &[]);
    assert_eq!(decision.variation_key.as_deref(), Some("c"));
    assert_eq!(decision.rule_key.as_deref(), Some("rule_1"));

    // judy qualifies but misses the allocation and must skip straight to
    // the catch-all rule.
    let ctx = client.create_user_context("judy", attrs(&[("premium", json!(true))]));
    let decision = ctx.decide("feature_1", &[]);
    assert_eq!(decision.variation_key.as_deref(), Some("d"));
    assert_eq!(decision.rule_key.as_deref(), Some("rule_everyone"));

    client.close(None);
    Ok(())
}

#[test]
fn test_forced_decision_on_context() -> Result<()> {
    let (client, _dispatcher) = new_test_client()?;
    let mut ctx = client.create_user_context("u1", attrs(&[("age", json!(30))]));
    ctx.set_forced_decision("feature_1", None, "b");

    let decision = ctx.decide("feature_1", &[DecideOption::IncludeReasons]);
    assert_eq!(decision.variation_key.as_deref(), Some("b"));
    assert!(
        decision.reasons.iter().any(|r| r.contains("forced decision")),
        "expected a forced-decision reason in {:?}",
        decision.reasons
    );

    // Removing it restores the bucketed decision.
    assert!(ctx.remove_forced_decision("feature_1", None));
    let decision = ctx.decide("feature_1", &[]);
    assert_eq!(decision.variation_key.as_deref(), Some("a"));

    client.close(None);
    Ok(())
}

#[test]
fn test_decide_is_deterministic() -> Result<()> {
    let (client, _dispatcher) = new_test_client()?;
    let ctx = client.create_user_context("u7", attrs(&[("age", json!(52))]));
    let first = ctx.decide("feature_1", &[]);
    for _ in 0..10 {
        let again = ctx.decide("feature_1", &[]);
        assert_eq!(first.variation_key, again.variation_key);
        assert_eq!(first.enabled, again.enabled);
        assert_eq!(first.variables, again.variables);
        assert_eq!(first.rule_key, again.rule_key);
    }
    client.close(None);
    Ok(())
}

#[test]
fn test_sticky_bucketing_through_profile_service() -> Result<()> {
    let profiles = Arc::new(InMemoryProfileService::new());
    // u1 naturally lands in "a"; a previous session stored "b".
    let mut profile = UserProfile::new("u1");
    profile.set_variation("10101", "20002");
    profiles.save(profile)?;

    let (client, _dispatcher) =
        new_test_client_with_profiles(Some(Arc::clone(&profiles) as Arc<dyn UserProfileService>))?;
    let ctx = client.create_user_context("u1", attrs(&[("age", json!(30))]));
    let decision = ctx.decide("feature_1", &[]);
    assert_eq!(decision.variation_key.as_deref(), Some("b"));

    // Ignoring the profile service restores the hash decision.
    let decision = ctx.decide("feature_1", &[DecideOption::IgnoreUserProfileService]);
    assert_eq!(decision.variation_key.as_deref(), Some("a"));

    client.close(None);
    Ok(())
}

#[test]
fn test_typed_variable_getters_match_get_all() -> Result<()> {
    let (client, _dispatcher) = new_test_client()?;
    let user_attrs = attrs(&[("age", json!(30))]);

    let all = client
        .get_all_feature_variables("feature_1", "u1", &user_attrs)
        .unwrap();
    assert_eq!(
        client.get_feature_variable_string("feature_1", "x", "u1", &user_attrs),
        all["x"].as_str().map(str::to_string)
    );
    assert_eq!(
        client.get_feature_variable_integer("feature_1", "limit", "u1", &user_attrs),
        all["limit"].as_i64()
    );

    // A typed getter with the wrong declared type returns nothing.
    assert_eq!(
        client.get_feature_variable_integer("feature_1", "x", "u1", &user_attrs),
        None
    );
    assert_eq!(
        client.get_feature_variable_boolean("feature_1", "limit", "u1", &user_attrs),
        None
    );

    client.close(None);
    Ok(())
}

#[test]
fn test_is_feature_enabled_and_enabled_features() -> Result<()> {
    let (client, _dispatcher) = new_test_client()?;
    assert!(client.is_feature_enabled("feature_1", "u1", &attrs(&[("age", json!(30))])));
    // u2 gets variation "b" with the feature off.
    assert!(!client.is_feature_enabled("feature_1", "u2", &attrs(&[("age", json!(30))])));
    assert!(!client.is_feature_enabled("no_such_flag", "u1", &attrs(&[])));

    assert_eq!(
        client.get_enabled_features("u1", &attrs(&[("age", json!(30))])),
        vec!["feature_1".to_string()]
    );
    assert!(client
        .get_enabled_features("u2", &attrs(&[("age", json!(30))]))
        .is_empty());
    client.close(None);
    Ok(())
}

#[test]
fn test_decide_all_and_enabled_flags_only() -> Result<()> {
    let (client, _dispatcher) = new_test_client()?;
    let ctx = client.create_user_context("u2", attrs(&[("age", json!(30))]));

    let all = ctx.decide_all(&[]);
    assert_eq!(all.len(), 1);
    assert!(!all["feature_1"].enabled);

    // u2's decision is disabled, so the filter drops it.
    let enabled_only = ctx.decide_all(&[DecideOption::EnabledFlagsOnly]);
    assert!(enabled_only.is_empty());

    client.close(None);
    Ok(())
}

#[test]
fn test_decide_unknown_flag_is_default() -> Result<()> {
    let (client, _dispatcher) = new_test_client()?;
    let ctx = client.create_user_context("u1", attrs(&[]));
    let decision = ctx.decide("no_such_flag", &[DecideOption::IncludeReasons]);
    assert!(!decision.enabled);
    assert!(decision.variation_key.is_none());
    assert!(decision.variables.is_empty());
    assert!(!decision.reasons.is_empty());
    client.close(None);
    Ok(())
}
