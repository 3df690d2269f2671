// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cumulus is a client-side feature flagging and experimentation SDK.
//!
//! Given a user id and a set of attributes it deterministically decides
//! whether a feature is enabled, which variation of an experiment the user
//! sees, and which typed configuration values they receive, and it reports
//! those decisions (and conversions) to a remote collector in batches.
//!
//! Everything is a pure function of the active datafile, the user id, the
//! attributes, and optionally a persisted user profile; there is no
//! randomness in any decision.

mod client;
mod config;
mod context;
mod decision;
mod evaluator;
mod events;
mod notifications;
mod processor;
mod profile;
mod sampling;
mod schema;
mod sources;
mod store;

pub mod error;
pub mod versioning;

pub use client::{ClientOptions, CumulusClient, DEFAULT_CONFIG_WAIT_TIMEOUT};
pub use config::ProjectConfig;
pub use context::{ContextSnapshot, ForcedDecisionKey, UserContext};
pub use decision::{DecideOption, DecisionSource, FlagDecision};
pub use error::{CumulusError, Result};
pub use evaluator::{Audience, Condition, EvalContext, Gate, MatchCondition, UserAttributes};
pub use events::{
    ConversionEvent, DecisionMetadata, EventBatch, EventContext, ImpressionEvent, Snapshot,
    SnapshotDecision, SnapshotEvent, UserEvent, Visitor, VisitorAttribute, CLIENT_NAME,
    CLIENT_VERSION,
};
pub use notifications::{
    ActivatePayload, ConfigUpdatePayload, DecisionPayload, LogEventPayload, NotificationCenter,
    TrackPayload,
};
pub use processor::{
    BatchConfig, BatchEventProcessor, EventDispatcher, LogEvent, NoopDispatcher,
    DEFAULT_BATCH_SIZE, DEFAULT_EVENTS_URL, DEFAULT_FLUSH_INTERVAL, DEFAULT_QUEUE_CAPACITY,
};
pub use profile::{BucketDecision, InMemoryProfileService, UserProfile, UserProfileService};
pub use sampling::BUCKETING_ID_ATTRIBUTE;
pub use schema::{
    AttributeData, AudienceData, CmabConfig, Datafile, EventData, ExperimentData,
    ExperimentStatus, FeatureFlag, FeatureVariable, Group, GroupPolicy, Holdout, Rollout,
    TrafficAllocation, VariableType, VariableUsage, Variation, MAX_TRAFFIC_VALUE,
    SUPPORTED_DATAFILE_VERSIONS,
};
pub use sources::{CmabService, SegmentService};
pub use store::ConfigStore;

use url::Url;

/// Where an unauthenticated datafile lives for a given SDK key.
pub const DATAFILE_URL_TEMPLATE: &str = "https://cdn.optimizely.com/datafiles/{sdk_key}.json";
/// The authenticated variant, expecting a bearer token on the request.
pub const AUTH_DATAFILE_URL_TEMPLATE: &str =
    "https://config.optimizely.com/datafiles/auth/{sdk_key}.json";

/// Resolve the datafile URL for an SDK key.
pub fn datafile_url(sdk_key: &str, authenticated: bool) -> Result<Url> {
    let template = if authenticated {
        AUTH_DATAFILE_URL_TEMPLATE
    } else {
        DATAFILE_URL_TEMPLATE
    };
    Ok(Url::parse(&template.replace("{sdk_key}", sdk_key))?)
}

#[cfg(test)]
mod tests;
