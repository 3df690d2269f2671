/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Sticky bucketing: an external user-profile service remembers which
//! variation a user was given per experiment, so later decisions return the
//! same variation even after the traffic allocation changes.

use crate::error::Result;
use serde_derive::*;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: String,
    #[serde(default)]
    pub experiment_bucket_map: HashMap<String, BucketDecision>,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct BucketDecision {
    pub variation_id: String,
}

impl UserProfile {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            experiment_bucket_map: Default::default(),
        }
    }

    pub fn variation_for(&self, experiment_id: &str) -> Option<&str> {
        self.experiment_bucket_map
            .get(experiment_id)
            .map(|d| d.variation_id.as_str())
    }

    pub fn set_variation(&mut self, experiment_id: &str, variation_id: &str) {
        self.experiment_bucket_map.insert(
            experiment_id.to_string(),
            BucketDecision {
                variation_id: variation_id.to_string(),
            },
        );
    }
}

/// The persistence seam. Implementations must be safe for concurrent use
/// across distinct user ids; the decision service serializes lookup+save per
/// user id within a single call.
pub trait UserProfileService: Send + Sync {
    fn lookup(&self, user_id: &str) -> Result<Option<UserProfile>>;
    fn save(&self, profile: UserProfile) -> Result<()>;
}

/// A map-backed profile service. Useful for tests and short-lived
/// processes; nothing is persisted beyond the life of the struct.
#[derive(Default)]
pub struct InMemoryProfileService {
    profiles: Mutex<HashMap<String, UserProfile>>,
}

impl InMemoryProfileService {
    pub fn new() -> Self {
        Default::default()
    }
}

impl UserProfileService for InMemoryProfileService {
    fn lookup(&self, user_id: &str) -> Result<Option<UserProfile>> {
        Ok(self.profiles.lock().unwrap().get(user_id).cloned())
    }

    fn save(&self, profile: UserProfile) -> Result<()> {
        self.profiles
            .lock()
            .unwrap()
            .insert(profile.user_id.clone(), profile);
        Ok(())
    }
}
