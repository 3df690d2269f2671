/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

mod common;

use common::{new_test_client, seed_datafile};
use cumulus::error::Result;
use cumulus::{
    datafile_url, ClientOptions, CumulusClient, CumulusError, UserAttributes,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn attrs(pairs: &[(&str, serde_json::Value)]) -> UserAttributes {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

#[test]
fn test_client_without_datafile_short_circuits() -> Result<()> {
    let client = CumulusClient::new(ClientOptions {
        config_wait_timeout: Duration::from_millis(50),
        ..Default::default()
    })?;
    assert!(!client.is_feature_enabled("feature_1", "u1", &attrs(&[])));
    assert!(client.activate("exp_1", "u1", &attrs(&[])).is_none());
    let ctx = client.create_user_context("u1", attrs(&[]));
    let decision = ctx.decide("feature_1", &[]);
    assert!(!decision.enabled);
    assert!(decision.variation_key.is_none());
    client.close(None);
    Ok(())
}

#[test]
fn test_invalid_datafile_keeps_previous_config() -> Result<()> {
    let (client, _dispatcher) = new_test_client()?;
    // An unsupported version must be rejected...
    let err = client
        .update_datafile(r#"{"version": "9", "accountId": "1", "projectId": "2", "revision": "3"}"#)
        .expect_err("version 9 should be rejected");
    assert!(matches!(err, CumulusError::UnsupportedDatafileVersion(_)));
    // ...while decisions keep working against the previous config.
    assert!(client.is_feature_enabled("feature_1", "u1", &attrs(&[("age", json!(30))])));
    client.close(None);
    Ok(())
}

#[test]
fn test_notifications_fire() -> Result<()> {
    let (client, _dispatcher) = new_test_client()?;

    let decisions = Arc::new(Mutex::new(Vec::new()));
    let tracks = Arc::new(Mutex::new(Vec::new()));
    let log_events = Arc::new(Mutex::new(Vec::new()));
    let config_updates = Arc::new(Mutex::new(Vec::new()));

    let seen = Arc::clone(&decisions);
    client
        .notifications()
        .add_decision_listener(move |payload| {
            seen.lock().unwrap().push(payload.decision_type.clone());
        });
    let seen = Arc::clone(&tracks);
    client.notifications().add_track_listener(move |payload| {
        seen.lock().unwrap().push(payload.event_key.clone());
    });
    let seen = Arc::clone(&log_events);
    client
        .notifications()
        .add_log_event_listener(move |payload| {
            seen.lock().unwrap().push(payload.url.clone());
        });
    let seen = Arc::clone(&config_updates);
    client
        .notifications()
        .add_config_update_listener(move |payload| {
            seen.lock().unwrap().push(payload.revision.clone());
        });

    let ctx = client.create_user_context("u1", attrs(&[("age", json!(30))]));
    ctx.decide("feature_1", &[]);
    ctx.track_event("purchase", None);
    client.update_datafile(&seed_datafile())?;
    client.close(None);

    assert_eq!(decisions.lock().unwrap().as_slice(), ["flag"]);
    assert_eq!(tracks.lock().unwrap().as_slice(), ["purchase"]);
    assert_eq!(config_updates.lock().unwrap().as_slice(), ["42"]);
    // One impression + one conversion, each flushed on its own.
    assert_eq!(log_events.lock().unwrap().len(), 2);
    Ok(())
}

#[test]
fn test_listener_removal() -> Result<()> {
    let (client, _dispatcher) = new_test_client()?;
    let count = Arc::new(Mutex::new(0));
    let seen = Arc::clone(&count);
    let id = client.notifications().add_track_listener(move |_| {
        *seen.lock().unwrap() += 1;
    });

    client.track("purchase", "u1", &attrs(&[]), None);
    assert!(client.notifications().remove_listener(id));
    assert!(!client.notifications().remove_listener(id));
    client.track("purchase", "u1", &attrs(&[]), None);
    client.close(None);

    assert_eq!(*count.lock().unwrap(), 1);
    Ok(())
}

#[test]
fn test_forced_variation_api() -> Result<()> {
    let (client, _dispatcher) = new_test_client()?;
    // u1 naturally buckets into "a".
    assert!(client.set_forced_variation("exp_1", "u1", Some("b")));
    assert_eq!(
        client.get_forced_variation("exp_1", "u1").as_deref(),
        Some("b")
    );
    assert_eq!(
        client
            .get_variation("exp_1", "u1", &attrs(&[("age", json!(30))]))
            .as_deref(),
        Some("b")
    );
    // Clearing restores the hash decision.
    assert!(client.set_forced_variation("exp_1", "u1", None));
    assert_eq!(
        client
            .get_variation("exp_1", "u1", &attrs(&[("age", json!(30))]))
            .as_deref(),
        Some("a")
    );
    assert!(!client.set_forced_variation("no_such_exp", "u1", Some("b")));
    client.close(None);
    Ok(())
}

#[test]
fn test_datafile_url_templates() -> Result<()> {
    assert_eq!(
        datafile_url("my-key", false)?.as_str(),
        "https://cdn.optimizely.com/datafiles/my-key.json"
    );
    assert_eq!(
        datafile_url("my-key", true)?.as_str(),
        "https://config.optimizely.com/datafiles/auth/my-key.json"
    );
    Ok(())
}
