/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! ## Cumulus SDK version comparison
//!
//! Audience conditions can match on dotted version strings via the
//! `semver_*` operators. A version is a list of dot separated numeric
//! components with an optional `-prerelease` suffix attached to the last
//! component, e.g. `2.1`, `3.0.0`, `1.2.3-beta`.
//!
//! Comparison is component-wise, and only spans the components the *target*
//! (condition) version names: a user on `2.1.5` is considered equal to the
//! target `2.1`. At the same core, a prerelease version sorts before the
//! release (`3.0.0-beta` < `3.0.0`), and two prereleases compare by their
//! suffix strings.

use std::{cmp::Ordering, convert::TryFrom};

use crate::error::CumulusError;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Version {
    components: Vec<u64>,
    prerelease: Option<String>,
}

impl TryFrom<&'_ str> for Version {
    type Error = CumulusError;

    fn try_from(value: &'_ str) -> Result<Self, Self::Error> {
        if value.is_empty() || value.contains(char::is_whitespace) {
            return Err(CumulusError::VersionParsingError(format!(
                "\"{}\" is not a valid version string",
                value
            )));
        }
        let (core, prerelease) = match value.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_string())),
            Some(_) => {
                return Err(CumulusError::VersionParsingError(format!(
                    "version \"{}\" has an empty prerelease tag",
                    value
                )))
            }
            None => (value, None),
        };
        let components = core
            .split('.')
            .map(|part| {
                part.parse::<u64>().map_err(|_| {
                    CumulusError::VersionParsingError(format!(
                        "version component \"{}\" in \"{}\" is not numeric",
                        part, value
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Version {
            components,
            prerelease,
        })
    }
}

impl TryFrom<String> for Version {
    type Error = CumulusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.as_str().try_into()
    }
}

impl Version {
    /// Compare a user-supplied version against a target version, spanning
    /// only the components the target names. Used by the `semver_*` audience
    /// match operators, where `self` is the user's version and `target` comes
    /// from the condition value.
    pub fn compare_to_target(&self, target: &Version) -> Ordering {
        for (idx, target_component) in target.components.iter().enumerate() {
            let user_component = self.components.get(idx).unwrap_or(&0);
            match user_component.cmp(target_component) {
                Ordering::Equal => (),
                ord => return ord,
            }
        }
        // Core components agree across the target's span; prerelease tags
        // break the tie. No tag sorts after any tag.
        match (&self.prerelease, &target.prerelease) {
            (None, None) => Ordering::Equal,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(user), Some(target)) => user.cmp(target),
        }
    }
}
