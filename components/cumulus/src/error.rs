/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/.
 * */

// reexport logging helpers so call sites can do
// `use crate::error::{info, warn};`
pub use log::{debug, error, info, trace, warn};

#[derive(Debug, thiserror::Error)]
pub enum CumulusError {
    #[error("Invalid datafile: {0}")]
    InvalidDatafile(String),
    #[error("Datafile version {0} is not supported")]
    UnsupportedDatafileVersion(String),
    #[error("JSON Error: {0} — {1}")]
    JSONError(String, String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Variable {0} is of type {1}, not {2}")]
    VariableTypeMismatch(String, String, String),
    #[error("The experiment {0} does not exist")]
    NoSuchExperiment(String),
    #[error("The event {0} does not exist")]
    NoSuchEventKey(String),
    #[error("The flag {0} does not exist")]
    NoSuchFlag(String),
    #[error("The variation {0} does not exist for {1}")]
    NoSuchVariation(String, String),
    #[error("No datafile has been set on the client yet")]
    ClientNotReady,
    #[error("Event queue is full, dropping event")]
    QueueFull,
    #[error("Event processor is already shut down")]
    ProcessorShutDown,
    #[error("Dispatch error: {0}")]
    DispatchError(String),
    #[error("Profile service error: {0}")]
    ProfileServiceError(String),
    #[error("CMAB error: {0}")]
    CmabError(String),
    #[error("Segment fetch error: {0}")]
    SegmentFetchError(String),
    #[error("Error parsing a string into a version: {0}")]
    VersionParsingError(String),
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Error parsing URL: {0}")]
    UrlParsingError(#[from] url::ParseError),
    #[error("Internal error: {0}")]
    InternalError(&'static str),
}

#[cfg(test)]
impl From<serde_json::Error> for CumulusError {
    fn from(error: serde_json::Error) -> Self {
        CumulusError::JSONError("test".into(), error.to_string())
    }
}

pub type Result<T, E = CumulusError> = std::result::Result<T, E>;
