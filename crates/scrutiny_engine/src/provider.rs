use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;

use crate::context::{ConditionContext, IncidentContext};

/// Context handed to a provider with every capability invocation.
///
/// Providers receive the run's accumulated tags, the chain templates
/// published so far, the evaluating rule's id, and the scope's path
/// restrictions (rule-level include paths take precedence over a provider's
/// own configured includes; exclude paths are additive).
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderContext {
    pub tags: Vec<String>,
    pub template: FxHashMap<String, Value>,
    #[serde(rename = "ruleID")]
    pub rule_id: Option<String>,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
}

impl ProviderContext {
    pub(crate) fn from_condition(ctx: &ConditionContext) -> Self {
        let mut tags: Vec<String> = ctx.tags.iter().cloned().collect();
        tags.sort_unstable();
        Self {
            tags,
            template: ctx.template.clone(),
            rule_id: ctx.rule_id.clone(),
            include_paths: ctx.include_paths.clone(),
            exclude_paths: ctx.exclude_paths.clone(),
        }
    }
}

/// What a provider reports back for one condition evaluation.
#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    pub matched: bool,
    pub incidents: Vec<IncidentContext>,
    /// Named outputs (e.g. `filepaths`) stored under the condition's `as`
    /// name for consumption by later siblings.
    pub template_context: serde_json::Map<String, Value>,
}

/// A pluggable condition evaluator. Implementations may consult local
/// files, subprocesses, or a language server; the engine only sees the
/// capability protocol.
pub trait Provider: Send + Sync {
    /// Capability names this provider can evaluate.
    fn capabilities(&self) -> Vec<String>;

    fn evaluate(
        &self,
        capability: &str,
        condition_info: &serde_yaml::Value,
        ctx: &ProviderContext,
    ) -> anyhow::Result<ProviderResponse>;
}

/// Providers known to an engine, keyed by the name condition leaves use to
/// address them (the `java` of `java.referenced`).
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: FxHashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Provider>> {
        self.providers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}
