use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Chain template key under which providers report the file paths their
/// condition matched, consumed by later siblings via `from`.
pub const TEMPLATE_FILEPATHS: &str = "filepaths";

/// Per-rule evaluation context. Seeded once per run from the scope and the
/// tagging pre-pass, then copied for every dispatched rule so that template
/// mutations during one rule's evaluation never leak into another.
#[derive(Debug, Clone, Default)]
pub struct ConditionContext {
    /// Tags produced by the tagging pre-pass. Written only while the
    /// pre-pass runs on the caller thread; read-only afterwards.
    pub tags: FxHashSet<String>,
    /// Chain templates published by `as` outputs, keyed by name.
    pub template: FxHashMap<String, Value>,
    /// Identifier of the rule currently being evaluated.
    pub rule_id: Option<String>,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
}

impl ConditionContext {
    /// Copy of this context with the rule id set, handed to one dispatch.
    pub(crate) fn for_rule(&self, rule_id: &str) -> Self {
        let mut ctx = self.clone();
        ctx.rule_id = Some(rule_id.to_string());
        ctx
    }
}

/// Result of evaluating one condition node.
#[derive(Debug, Clone, Default)]
pub struct ConditionResponse {
    pub matched: bool,
    pub incidents: Vec<IncidentContext>,
    /// `as` outputs produced by this node (or its matched children), keyed
    /// by the published name.
    pub template_context: FxHashMap<String, Value>,
}

impl ConditionResponse {
    pub(crate) fn unmatched() -> Self {
        Self::default()
    }
}

/// A raw incident as reported by a provider, before post-processing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IncidentContext {
    #[serde(rename = "fileURI")]
    pub file_uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_number: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_location: Option<Location>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub variables: serde_json::Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_snip: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub start: Position,
    pub end: Position,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}
