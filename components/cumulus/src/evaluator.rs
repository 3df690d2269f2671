/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/.
 */

//! Recursive, tri-valued evaluation of audience condition trees.
//!
//! A condition evaluates to `Some(true)`, `Some(false)`, or `None` (unknown).
//! The distinction between unknown and false matters inside `not` nodes, so
//! the three states are carried explicitly all the way up; only the caller of
//! a top-level gate collapses unknown to "not targeted".

use crate::error::debug;
use crate::versioning::Version;
use serde_derive::*;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::convert::TryFrom;
use std::sync::Arc;

// Numbers outside ±2^53 lose integer precision and never match.
const ABS_NUMBER_LIMIT: f64 = 9007199254740992.0;

pub type UserAttributes = HashMap<String, Value>;

/// An audience from the datafile with its condition tree parsed up front.
/// `conditions` is `None` when the tree failed to parse; such an audience
/// evaluates to unknown.
#[derive(Debug, Clone)]
pub struct Audience {
    pub id: String,
    pub name: String,
    pub conditions: Option<Condition>,
}

/// Everything leaf evaluation needs: the user's attributes, their qualified
/// segments, and the audiences reachable from id references.
pub struct EvalContext<'a> {
    pub attributes: &'a UserAttributes,
    pub qualified_segments: &'a HashSet<String>,
    pub audiences: &'a HashMap<String, Arc<Audience>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Vec<Condition>),
    AudienceId(String),
    Match(MatchCondition),
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq)]
pub struct MatchCondition {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub condition_type: Option<String>,
    #[serde(rename = "match", default)]
    pub match_type: Option<String>,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    /// Parse a condition tree from its JSON form: nested arrays headed by an
    /// `"and"`/`"or"`/`"not"` operator, bare strings as audience-id leaves,
    /// and objects as typed match leaves. A bare array defaults to `or`.
    pub fn parse(value: &Value) -> Option<Condition> {
        match value {
            Value::String(s) => Some(Condition::AudienceId(s.clone())),
            Value::Object(_) => serde_json::from_value(value.clone())
                .ok()
                .map(Condition::Match),
            Value::Array(items) => {
                let (operator, operands) = match items.first().and_then(Value::as_str) {
                    Some("and") => ("and", &items[1..]),
                    Some("or") => ("or", &items[1..]),
                    Some("not") => ("not", &items[1..]),
                    _ => ("or", &items[..]),
                };
                let children = operands
                    .iter()
                    .map(Condition::parse)
                    .collect::<Option<Vec<_>>>()?;
                Some(match operator {
                    "and" => Condition::And(children),
                    "not" => Condition::Not(children),
                    _ => Condition::Or(children),
                })
            }
            _ => None,
        }
    }

    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> Option<bool> {
        match self {
            // false wins over unknown, in either order.
            Condition::And(children) => {
                let mut saw_unknown = false;
                for child in children {
                    match child.evaluate(ctx) {
                        Some(false) => return Some(false),
                        Some(true) => (),
                        None => saw_unknown = true,
                    }
                }
                if saw_unknown {
                    None
                } else {
                    Some(true)
                }
            }
            // true wins over unknown, in either order.
            Condition::Or(children) => {
                let mut saw_unknown = false;
                for child in children {
                    match child.evaluate(ctx) {
                        Some(true) => return Some(true),
                        Some(false) => (),
                        None => saw_unknown = true,
                    }
                }
                if saw_unknown {
                    None
                } else {
                    Some(false)
                }
            }
            Condition::Not(children) => {
                let operand = children.first()?;
                operand.evaluate(ctx).map(|matched| !matched)
            }
            Condition::AudienceId(id) => match ctx.audiences.get(id) {
                Some(audience) => audience.conditions.as_ref()?.evaluate(ctx),
                None => {
                    debug!("Audience {} is not in the datafile", id);
                    None
                }
            },
            Condition::Match(condition) => evaluate_match(condition, ctx),
        }
    }
}

/// The audience gate of an experiment, rollout rule, or holdout: either the
/// explicit `audienceConditions` tree, or the implicit `or` over the legacy
/// audience-id list, or nothing at all (everyone qualifies).
#[derive(Debug, Clone)]
pub enum Gate {
    Everyone,
    Tree(Condition),
    // The datafile carried a tree we could not make sense of.
    Invalid,
}

impl Gate {
    pub fn build(audience_conditions: Option<&Value>, audience_ids: &[String]) -> Gate {
        match audience_conditions {
            Some(value) => {
                if matches!(value, Value::Array(items) if items.is_empty()) {
                    return Gate::Everyone;
                }
                match Condition::parse(value) {
                    Some(condition) => Gate::Tree(condition),
                    None => Gate::Invalid,
                }
            }
            None if audience_ids.is_empty() => Gate::Everyone,
            None => Gate::Tree(Condition::Or(
                audience_ids
                    .iter()
                    .map(|id| Condition::AudienceId(id.clone()))
                    .collect(),
            )),
        }
    }

    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> Option<bool> {
        match self {
            Gate::Everyone => Some(true),
            Gate::Tree(condition) => condition.evaluate(ctx),
            Gate::Invalid => None,
        }
    }

    /// Collapse a top-level evaluation to a plain bool: an unknown gate means
    /// the user does not qualify.
    pub fn matches(&self, ctx: &EvalContext<'_>) -> bool {
        self.evaluate(ctx).unwrap_or(false)
    }
}

fn evaluate_match(condition: &MatchCondition, ctx: &EvalContext<'_>) -> Option<bool> {
    match condition.condition_type.as_deref() {
        Some("custom_attribute") | Some("third_party_dimension") | None => (),
        Some(other) => {
            debug!("Unknown condition type {}, treating as unknown", other);
            return None;
        }
    }
    let user_value = ctx.attributes.get(&condition.name);
    // Missing `match` on a legacy condition means exact.
    match condition.match_type.as_deref().unwrap_or("exact") {
        "exists" => Some(matches!(user_value, Some(v) if !v.is_null())),
        "exact" => exact_match(&condition.value, user_value?),
        "substring" => match (&condition.value, user_value?) {
            (Value::String(needle), Value::String(haystack)) => {
                Some(haystack.contains(needle))
            }
            _ => None,
        },
        "gt" => number_match(&condition.value, user_value?, |ord| ord == Ordering::Greater),
        "ge" => number_match(&condition.value, user_value?, |ord| ord != Ordering::Less),
        "lt" => number_match(&condition.value, user_value?, |ord| ord == Ordering::Less),
        "le" => number_match(&condition.value, user_value?, |ord| ord != Ordering::Greater),
        "semver_eq" => semver_match(&condition.value, user_value?, |ord| ord == Ordering::Equal),
        "semver_gt" => semver_match(&condition.value, user_value?, |ord| ord == Ordering::Greater),
        "semver_ge" => semver_match(&condition.value, user_value?, |ord| ord != Ordering::Less),
        "semver_lt" => semver_match(&condition.value, user_value?, |ord| ord == Ordering::Less),
        "semver_le" => semver_match(&condition.value, user_value?, |ord| ord != Ordering::Greater),
        "qualified" => match &condition.value {
            Value::String(segment) => Some(ctx.qualified_segments.contains(segment)),
            _ => None,
        },
        other => {
            debug!("Unknown match type {}, treating as unknown", other);
            None
        }
    }
}

// A number is usable for matching iff it is finite and within ±2^53.
fn valid_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => {
            let n = n.as_f64()?;
            (n.is_finite() && n.abs() <= ABS_NUMBER_LIMIT).then_some(n)
        }
        _ => None,
    }
}

fn exact_match(condition_value: &Value, user_value: &Value) -> Option<bool> {
    match (condition_value, user_value) {
        (Value::String(c), Value::String(u)) => Some(c == u),
        (Value::Bool(c), Value::Bool(u)) => Some(c == u),
        // Numbers compare by value, so an integer 1 matches a double 1.0.
        (Value::Number(_), Value::Number(_)) => {
            match (valid_number(condition_value), valid_number(user_value)) {
                (Some(c), Some(u)) => Some(c == u),
                _ => None,
            }
        }
        _ => None,
    }
}

fn number_match(
    condition_value: &Value,
    user_value: &Value,
    accept: impl Fn(Ordering) -> bool,
) -> Option<bool> {
    let target = valid_number(condition_value)?;
    let user = valid_number(user_value)?;
    // total_cmp is safe here, both sides are finite.
    Some(accept(user.total_cmp(&target)))
}

fn semver_match(
    condition_value: &Value,
    user_value: &Value,
    accept: impl Fn(Ordering) -> bool,
) -> Option<bool> {
    let target = Version::try_from(condition_value.as_str()?).ok()?;
    let user = Version::try_from(user_value.as_str()?).ok()?;
    Some(accept(user.compare_to_target(&target)))
}
