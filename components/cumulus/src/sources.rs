/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! External decision sources: the contextual-bandit service that can stand
//! in for the bucketer on marked experiments, and the audience-segment
//! source behind the `qualified` match operator. Both are pluggable traits
//! wrapped in TTL'd LRU caches, and both degrade silently — a failure means
//! "no decision" or "no segments", never an error surfaced to the caller.

use crate::config::ProjectConfig;
use crate::error::Result;
use crate::evaluator::UserAttributes;
use crate::schema::ExperimentData;
use lru::LruCache;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_CMAB_CACHE_SIZE: usize = 1000;
pub const DEFAULT_CMAB_CACHE_TTL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_SEGMENTS_CACHE_SIZE: usize = 10_000;
pub const DEFAULT_SEGMENTS_CACHE_TTL: Duration = Duration::from_secs(600);

/// The contextual-bandit seam: given a user, a marked experiment, and the
/// attribute snapshot, return the id of the variation to serve.
pub trait CmabService: Send + Sync {
    fn get_decision(
        &self,
        user_id: &str,
        experiment_id: &str,
        attributes: &UserAttributes,
    ) -> Result<String>;
}

/// The audience-segment seam, typically backed by a customer-data platform.
pub trait SegmentService: Send + Sync {
    fn fetch_segments(&self, user_id: &str) -> Result<Vec<String>>;

    /// Forward an event to the platform. The default implementation drops
    /// it, for sources that only answer segment queries.
    fn send_event(
        &self,
        event_type: &str,
        action: &str,
        identifiers: &HashMap<String, String>,
        data: &HashMap<String, Value>,
    ) -> Result<()> {
        let _ = (event_type, action, identifiers, data);
        Ok(())
    }
}

struct TtlEntry<T> {
    value: T,
    expires_at: Instant,
}

impl<T: Clone> TtlEntry<T> {
    fn fresh(&self) -> Option<T> {
        (Instant::now() < self.expires_at).then(|| self.value.clone())
    }
}

/// Caching front for a [`CmabService`]. The cache key is a digest over the
/// user id, the experiment id, and the attributes the experiment declares
/// relevant, so an attribute change invalidates the entry naturally.
pub struct CmabClient {
    service: Arc<dyn CmabService>,
    cache: Mutex<LruCache<String, TtlEntry<String>>>,
    ttl: Duration,
}

impl CmabClient {
    pub fn new(service: Arc<dyn CmabService>) -> Self {
        Self::with_cache(service, DEFAULT_CMAB_CACHE_SIZE, DEFAULT_CMAB_CACHE_TTL)
    }

    pub fn with_cache(service: Arc<dyn CmabService>, capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            service,
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn decide(
        &self,
        config: &ProjectConfig,
        experiment: &ExperimentData,
        user_id: &str,
        attributes: &UserAttributes,
    ) -> Result<String> {
        let key = self.cache_key(config, experiment, user_id, attributes);
        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(variation_id) = cache.get(&key).and_then(TtlEntry::fresh) {
                return Ok(variation_id);
            }
        }
        let variation_id = self
            .service
            .get_decision(user_id, &experiment.id, attributes)?;
        self.cache.lock().unwrap().put(
            key,
            TtlEntry {
                value: variation_id.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(variation_id)
    }

    fn cache_key(
        &self,
        config: &ProjectConfig,
        experiment: &ExperimentData,
        user_id: &str,
        attributes: &UserAttributes,
    ) -> String {
        // Only the attributes the experiment marks relevant participate,
        // in a stable order.
        let mut relevant: Vec<(&str, String)> = experiment
            .cmab
            .as_ref()
            .map(|cmab| cmab.attribute_ids.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|id| {
                let key = config.attribute_key(id)?;
                let value = attributes.get(key)?;
                Some((key, value.to_string()))
            })
            .collect();
        relevant.sort();

        let mut hasher = Sha256::new();
        hasher.update(user_id.as_bytes());
        hasher.update(&[0]);
        hasher.update(experiment.id.as_bytes());
        for (key, value) in relevant {
            hasher.update(&[0]);
            hasher.update(key.as_bytes());
            hasher.update(&[0]);
            hasher.update(value.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Caching front for a [`SegmentService`], keyed by user id.
pub struct SegmentClient {
    service: Arc<dyn SegmentService>,
    cache: Mutex<LruCache<String, TtlEntry<Vec<String>>>>,
    ttl: Duration,
}

impl SegmentClient {
    pub fn new(service: Arc<dyn SegmentService>) -> Self {
        Self::with_cache(
            service,
            DEFAULT_SEGMENTS_CACHE_SIZE,
            DEFAULT_SEGMENTS_CACHE_TTL,
        )
    }

    pub fn with_cache(service: Arc<dyn SegmentService>, capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            service,
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn fetch_segments(&self, user_id: &str, ignore_cache: bool) -> Result<Vec<String>> {
        if !ignore_cache {
            let mut cache = self.cache.lock().unwrap();
            if let Some(segments) = cache.get(user_id).and_then(TtlEntry::fresh) {
                return Ok(segments);
            }
        }
        let segments = self.service.fetch_segments(user_id)?;
        self.cache.lock().unwrap().put(
            user_id.to_string(),
            TtlEntry {
                value: segments.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(segments)
    }

    pub fn send_event(
        &self,
        event_type: &str,
        action: &str,
        identifiers: &HashMap<String, String>,
        data: &HashMap<String, Value>,
    ) -> Result<()> {
        self.service.send_event(event_type, action, identifiers, data)
    }
}
