/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! This module implements the bucketing logic required to hash a user into
//! one of 10000 buckets and resolve that bucket against a traffic
//! allocation.
//!
//! The hash is MurmurHash3_x86_32 with seed 1, bit-exact with the canonical
//! implementation so that assignments are stable across SDKs in other
//! languages.

use crate::config::ProjectConfig;
use crate::error::{debug, warn, Result};
use crate::evaluator::UserAttributes;
use crate::schema::{ExperimentData, TrafficAllocation, Variation, MAX_TRAFFIC_VALUE};
use serde_json::Value;
use std::io::Cursor;

const HASH_SEED: u32 = 1;
const MAX_HASH_VALUE: u64 = 1 << 32;

/// A string attribute with this name overrides the user id as the hashed
/// bucketing id.
pub const BUCKETING_ID_ATTRIBUTE: &str = "$opt_bucketing_id";

/// Map a bucketing key to an integer in `[0, MAX_TRAFFIC_VALUE)`.
///
/// The key is hashed with MurmurHash3_x86_32 (seed 1) over its UTF-8 bytes
/// and the 32-bit hash is scaled down with integer math, which is exact
/// because `hash * 10000` fits comfortably in a u64.
pub fn generate_bucket_value(bucketing_key: &str) -> Result<u32> {
    let hash = murmur3::murmur3_32(&mut Cursor::new(bucketing_key.as_bytes()), HASH_SEED)?;
    Ok((u64::from(hash) * u64::from(MAX_TRAFFIC_VALUE) / MAX_HASH_VALUE) as u32)
}

/// Resolve a user against a traffic allocation, salting the hash with the
/// id of the entity that owns the allocation (experiment or group).
///
/// Returns the entity id of the first entry whose `endOfRange` strictly
/// exceeds the bucket value. An entry with an empty entity id is an
/// allocated slot with nothing behind it and resolves to `None`, as does a
/// bucket value beyond the last entry.
pub fn find_bucket<'a>(
    bucketing_id: &str,
    parent_id: &str,
    traffic_allocation: &'a [TrafficAllocation],
) -> Result<Option<&'a str>> {
    let bucketing_key = format!("{}{}", bucketing_id, parent_id);
    let bucket_value = generate_bucket_value(&bucketing_key)?;
    debug!(
        "Assigned bucket {} to bucketing id {}",
        bucket_value, bucketing_key
    );
    for entry in traffic_allocation {
        if entry.end_of_range > bucket_value {
            if entry.entity_id.is_empty() {
                return Ok(None);
            }
            return Ok(Some(&entry.entity_id));
        }
    }
    Ok(None)
}

/// Bucket a user into one of an experiment's variations, honoring
/// mutually-exclusive groups: when the experiment lives in a `random`
/// group, the user is first resolved against the group's allocation (salted
/// with the group id) and is excluded unless that picks this experiment.
pub fn bucket_experiment<'a>(
    config: &ProjectConfig,
    experiment: &'a ExperimentData,
    bucketing_id: &str,
) -> Result<Option<&'a Variation>> {
    if let Some(group) = config.random_group_of(&experiment.id) {
        match find_bucket(bucketing_id, &group.id, &group.traffic_allocation)? {
            Some(entity_id) if entity_id == experiment.id => {
                debug!(
                    "User is in experiment {} of group {}",
                    experiment.key, group.id
                );
            }
            _ => {
                debug!(
                    "User is not in experiment {} of group {}",
                    experiment.key, group.id
                );
                return Ok(None);
            }
        }
    }
    match find_bucket(bucketing_id, &experiment.id, &experiment.traffic_allocation)? {
        Some(variation_id) => Ok(experiment.get_variation(variation_id)),
        None => Ok(None),
    }
}

/// The id hashed for bucketing: the `$opt_bucketing_id` attribute when it is
/// present and a string, the user id otherwise.
pub fn bucketing_id<'a>(user_id: &'a str, attributes: &'a UserAttributes) -> &'a str {
    match attributes.get(BUCKETING_ID_ATTRIBUTE) {
        Some(Value::String(id)) => id,
        Some(_) => {
            warn!("Bucketing id attribute is not a string, falling back to user id");
            user_id
        }
        None => user_id,
    }
}
