use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::context::Location;
use crate::rules::{Category, Link};

/// A finalized incident inside a violation. Immutable once placed in a
/// ruleset result.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    #[serde(rename = "fileURI")]
    pub file_uri: String,
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub code_snip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_number: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_location: Option<Location>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub variables: serde_json::Map<String, Value>,
}

/// A matched rule's finding. Zero-effort findings are the same shape filed
/// under a ruleset's insights instead of its violations.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    pub incidents: Vec<Incident>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<u32>,
}

/// Everything a run produced for one ruleset. Every evaluated rule id lands
/// in exactly one of the five buckets.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuleSetResult {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Tags in insertion order of first observation, deduplicated.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub violations: BTreeMap<String, Violation>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub insights: BTreeMap<String, Violation>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unmatched: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
}

impl RuleSetResult {
    pub(crate) fn new(name: &str, description: Option<&String>) -> Self {
        Self {
            name: name.to_string(),
            description: description.cloned(),
            ..Self::default()
        }
    }
}
