use rustc_hash::FxHashMap;
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;
use serde_yaml::Value as YamlValue;

use crate::context::{ConditionContext, ConditionResponse};
use crate::error::EngineError;
use crate::provider::{ProviderContext, ProviderRegistry};

/// Capability that gates a rule on tags produced by the tagging pre-pass.
/// Rules referencing it are ordered after plain tagging rules.
pub const HAS_TAGS_CAPABILITY: &str = "hasTags";

/// The `when` clause of a rule: a recursive tree of boolean composites over
/// provider capability calls and chain references.
///
/// The tree is immutable after parse; evaluation is a left-to-right
/// recursive walk. When several siblings publish the same `as` name, later
/// writers overwrite earlier ones in the walk order.
#[derive(Debug, Clone)]
pub enum Condition {
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
    Provider(ProviderCall),
    Chain(ChainRef),
}

/// Leaf condition dispatching to a provider capability.
#[derive(Debug, Clone)]
pub struct ProviderCall {
    pub provider: String,
    pub capability: String,
    /// YAML payload passed through to the provider untouched.
    pub condition_info: YamlValue,
    /// Name under which the provider's template context is published.
    pub as_name: Option<String>,
    /// Chain template this condition consumes; must have been published by
    /// an earlier sibling.
    pub from: Option<String>,
    /// Treat evaluation failures as "not matched" instead of an error.
    pub ignorable: bool,
}

/// Leaf condition that only gates on a previously published chain template.
#[derive(Debug, Clone)]
pub struct ChainRef {
    pub from: String,
}

impl Condition {
    pub fn evaluate(
        &self,
        providers: &ProviderRegistry,
        ctx: &mut ConditionContext,
    ) -> Result<ConditionResponse, EngineError> {
        match self {
            Condition::And(children) => {
                let mut response = ConditionResponse {
                    matched: true,
                    ..ConditionResponse::default()
                };
                for child in children {
                    let child_response = child.evaluate(providers, ctx)?;
                    if !child_response.matched {
                        // Short-circuit: later siblings are not evaluated,
                        // even ones that would have errored.
                        return Ok(ConditionResponse::unmatched());
                    }
                    publish_chain_outputs(ctx, &child_response);
                    response.incidents.extend(child_response.incidents);
                    response.template_context.extend(child_response.template_context);
                }
                Ok(response)
            }
            Condition::Or(children) => {
                let mut response = ConditionResponse::default();
                for child in children {
                    let child_response = child.evaluate(providers, ctx)?;
                    if child_response.matched {
                        response.matched = true;
                        publish_chain_outputs(ctx, &child_response);
                        response.incidents.extend(child_response.incidents);
                        response.template_context.extend(child_response.template_context);
                    }
                }
                Ok(response)
            }
            Condition::Not(child) => {
                let child_response = child.evaluate(providers, ctx)?;
                Ok(ConditionResponse {
                    matched: !child_response.matched,
                    ..ConditionResponse::default()
                })
            }
            Condition::Provider(call) => call.evaluate(providers, ctx),
            Condition::Chain(chain) => {
                if ctx.template.contains_key(&chain.from) {
                    Ok(ConditionResponse {
                        matched: true,
                        ..ConditionResponse::default()
                    })
                } else {
                    Err(EngineError::ChainMissing(chain.from.clone()))
                }
            }
        }
    }

    /// Does any provider call in this tree reference the given capability?
    pub fn references_capability(&self, capability: &str) -> bool {
        match self {
            Condition::And(children) | Condition::Or(children) => children
                .iter()
                .any(|child| child.references_capability(capability)),
            Condition::Not(child) => child.references_capability(capability),
            Condition::Provider(call) => call.capability == capability,
            Condition::Chain(_) => false,
        }
    }
}

impl ProviderCall {
    fn evaluate(
        &self,
        providers: &ProviderRegistry,
        ctx: &mut ConditionContext,
    ) -> Result<ConditionResponse, EngineError> {
        match self.invoke(providers, ctx) {
            Err(err) if self.ignorable => {
                log::debug!(
                    "ignoring failed condition `{}.{}`: {err}",
                    self.provider,
                    self.capability
                );
                Ok(ConditionResponse::unmatched())
            }
            result => result,
        }
    }

    fn invoke(
        &self,
        providers: &ProviderRegistry,
        ctx: &mut ConditionContext,
    ) -> Result<ConditionResponse, EngineError> {
        if let Some(from) = &self.from {
            if !ctx.template.contains_key(from) {
                return Err(EngineError::ChainMissing(from.clone()));
            }
        }
        let provider = providers
            .get(&self.provider)
            .ok_or_else(|| EngineError::UnknownProvider(self.provider.clone()))?;
        if !provider
            .capabilities()
            .iter()
            .any(|capability| capability == &self.capability)
        {
            return Err(EngineError::UnknownCapability {
                provider: self.provider.clone(),
                capability: self.capability.clone(),
            });
        }
        let provider_ctx = ProviderContext::from_condition(ctx);
        let response = provider
            .evaluate(&self.capability, &self.condition_info, &provider_ctx)
            .map_err(|source| EngineError::Provider {
                provider: self.provider.clone(),
                capability: self.capability.clone(),
                source,
            })?;
        let mut template_context = FxHashMap::default();
        if let Some(as_name) = &self.as_name {
            template_context.insert(as_name.clone(), Value::Object(response.template_context));
        }
        Ok(ConditionResponse {
            matched: response.matched,
            incidents: response.incidents,
            template_context,
        })
    }
}

/// Make a child's `as` outputs visible to subsequent siblings.
fn publish_chain_outputs(ctx: &mut ConditionContext, response: &ConditionResponse) {
    for (name, value) in &response.template_context {
        ctx.template.insert(name.clone(), value.clone());
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = YamlValue::deserialize(deserializer)?;
        condition_from_yaml(&value).map_err(de::Error::custom)
    }
}

/// Convert the YAML `when` shape into a condition tree. Composites use the
/// `and`/`or`/`not` keys; a leaf is a single `<provider>.<capability>` key
/// with optional `as`/`from`/`ignorable` siblings; a mapping with only a
/// `from` key is a chain reference.
fn condition_from_yaml(value: &YamlValue) -> Result<Condition, String> {
    let YamlValue::Mapping(mapping) = value else {
        return Err("condition must be a mapping".to_string());
    };
    if let Some(children) = lookup(mapping, "and") {
        return composite_from_yaml("and", children).map(Condition::And);
    }
    if let Some(children) = lookup(mapping, "or") {
        return composite_from_yaml("or", children).map(Condition::Or);
    }
    if let Some(child) = lookup(mapping, "not") {
        return Ok(Condition::Not(Box::new(condition_from_yaml(child)?)));
    }

    let mut as_name = None;
    let mut from = None;
    let mut ignorable = false;
    let mut capability = None;
    for (key, entry) in mapping {
        let key = key
            .as_str()
            .ok_or_else(|| "condition keys must be strings".to_string())?;
        match key {
            "as" => as_name = Some(string_entry("as", entry)?),
            "from" => from = Some(string_entry("from", entry)?),
            "ignorable" | "ignore" => {
                ignorable = entry
                    .as_bool()
                    .ok_or_else(|| format!("`{key}` must be a boolean"))?;
            }
            _ => {
                if capability.is_some() {
                    return Err(format!(
                        "condition has more than one provider capability (`{key}`)"
                    ));
                }
                capability = Some((key.to_string(), entry.clone()));
            }
        }
    }
    match capability {
        Some((key, condition_info)) => {
            let (provider, capability) = key.split_once('.').ok_or_else(|| {
                format!("capability `{key}` must be qualified as `<provider>.<capability>`")
            })?;
            Ok(Condition::Provider(ProviderCall {
                provider: provider.to_string(),
                capability: capability.to_string(),
                condition_info,
                as_name,
                from,
                ignorable,
            }))
        }
        None => {
            let from = from.ok_or_else(|| {
                "condition has neither a provider capability nor a chain reference".to_string()
            })?;
            Ok(Condition::Chain(ChainRef { from }))
        }
    }
}

fn lookup<'a>(mapping: &'a serde_yaml::Mapping, key: &str) -> Option<&'a YamlValue> {
    mapping
        .iter()
        .find_map(|(entry, value)| (entry.as_str() == Some(key)).then_some(value))
}

fn composite_from_yaml(kind: &str, children: &YamlValue) -> Result<Vec<Condition>, String> {
    let YamlValue::Sequence(children) = children else {
        return Err(format!("`{kind}` must be a sequence of conditions"));
    };
    if children.is_empty() {
        return Err(format!("`{kind}` requires at least one condition"));
    }
    children.iter().map(condition_from_yaml).collect()
}

fn string_entry(key: &str, entry: &YamlValue) -> Result<String, String> {
    entry
        .as_str()
        .map(ToString::to_string)
        .ok_or_else(|| format!("`{key}` must be a string"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::IncidentContext;
    use crate::provider::{Provider, ProviderResponse};
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    /// Provider whose capabilities either match (with one incident) or not,
    /// recording the order they were invoked in.
    struct StubProvider {
        matching: Vec<&'static str>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Provider for StubProvider {
        fn capabilities(&self) -> Vec<String> {
            vec!["yes".to_string(), "no".to_string(), "fails".to_string()]
        }

        fn evaluate(
            &self,
            capability: &str,
            _condition_info: &YamlValue,
            _ctx: &ProviderContext,
        ) -> anyhow::Result<ProviderResponse> {
            self.calls.lock().unwrap().push(capability.to_string());
            if capability == "fails" {
                anyhow::bail!("synthetic failure");
            }
            let matched = self.matching.contains(&capability);
            Ok(ProviderResponse {
                matched,
                incidents: if matched {
                    vec![IncidentContext {
                        file_uri: format!("file:///{capability}.java"),
                        ..IncidentContext::default()
                    }]
                } else {
                    vec![]
                },
                template_context: serde_json::Map::new(),
            })
        }
    }

    fn registry(calls: &Arc<Mutex<Vec<String>>>) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register(
            "stub",
            Arc::new(StubProvider {
                matching: vec!["yes"],
                calls: Arc::clone(calls),
            }),
        );
        registry
    }

    fn leaf(capability: &str) -> Condition {
        Condition::Provider(ProviderCall {
            provider: "stub".to_string(),
            capability: capability.to_string(),
            condition_info: YamlValue::Null,
            as_name: None,
            from: None,
            ignorable: false,
        })
    }

    #[test]
    fn and_short_circuits() {
        let calls = Arc::new(Mutex::new(vec![]));
        let providers = registry(&calls);
        let condition = Condition::And(vec![leaf("no"), leaf("yes")]);
        let response = condition
            .evaluate(&providers, &mut ConditionContext::default())
            .unwrap();
        assert!(!response.matched);
        assert!(response.incidents.is_empty());
        // The second child is never invoked.
        assert_eq!(*calls.lock().unwrap(), vec!["no"]);
    }

    #[test]
    fn and_short_circuit_elides_later_errors() {
        let calls = Arc::new(Mutex::new(vec![]));
        let providers = registry(&calls);
        let condition = Condition::And(vec![leaf("no"), leaf("fails")]);
        let response = condition
            .evaluate(&providers, &mut ConditionContext::default())
            .unwrap();
        assert!(!response.matched);
    }

    #[test]
    fn and_unions_incidents() {
        let calls = Arc::new(Mutex::new(vec![]));
        let mut registry = ProviderRegistry::new();
        registry.register(
            "stub",
            Arc::new(StubProvider {
                matching: vec!["yes", "no"],
                calls: Arc::clone(&calls),
            }),
        );
        let condition = Condition::And(vec![leaf("yes"), leaf("no")]);
        let response = condition
            .evaluate(&registry, &mut ConditionContext::default())
            .unwrap();
        assert!(response.matched);
        assert_eq!(response.incidents.len(), 2);
    }

    #[test]
    fn or_evaluates_all_children_and_unions_matches() {
        let calls = Arc::new(Mutex::new(vec![]));
        let providers = registry(&calls);
        let condition = Condition::Or(vec![leaf("yes"), leaf("no"), leaf("yes")]);
        let response = condition
            .evaluate(&providers, &mut ConditionContext::default())
            .unwrap();
        assert!(response.matched);
        assert_eq!(response.incidents.len(), 2);
        assert_eq!(*calls.lock().unwrap(), vec!["yes", "no", "yes"]);
    }

    #[test]
    fn not_inverts_and_drops_incidents() {
        let calls = Arc::new(Mutex::new(vec![]));
        let providers = registry(&calls);
        let condition = Condition::Not(Box::new(leaf("yes")));
        let response = condition
            .evaluate(&providers, &mut ConditionContext::default())
            .unwrap();
        assert!(!response.matched);
        assert!(response.incidents.is_empty());
    }

    #[test]
    fn provider_failure_propagates_unless_ignorable() {
        let calls = Arc::new(Mutex::new(vec![]));
        let providers = registry(&calls);
        let err = leaf("fails")
            .evaluate(&providers, &mut ConditionContext::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::Provider { .. }));

        let Condition::Provider(mut call) = leaf("fails") else {
            unreachable!()
        };
        call.ignorable = true;
        let response = Condition::Provider(call)
            .evaluate(&providers, &mut ConditionContext::default())
            .unwrap();
        assert!(!response.matched);
    }

    #[test]
    fn unknown_provider_and_capability() {
        let providers = ProviderRegistry::new();
        let err = leaf("yes")
            .evaluate(&providers, &mut ConditionContext::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownProvider(_)));

        let calls = Arc::new(Mutex::new(vec![]));
        let providers = registry(&calls);
        let err = leaf("unheard-of")
            .evaluate(&providers, &mut ConditionContext::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownCapability { .. }));
    }

    #[test]
    fn chain_reference_requires_published_template() {
        let providers = ProviderRegistry::new();
        let chain = Condition::Chain(ChainRef {
            from: "x".to_string(),
        });
        let err = chain
            .evaluate(&providers, &mut ConditionContext::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::ChainMissing(_)));

        let mut ctx = ConditionContext::default();
        ctx.template
            .insert("x".to_string(), serde_json::json!({"filepaths": []}));
        assert!(chain.evaluate(&providers, &mut ctx).unwrap().matched);
    }

    #[test]
    fn deserialize_composite_tree() {
        let condition: Condition = serde_yaml::from_str(
            r#"
and:
  - java.referenced:
      pattern: org.example.*
    as: refs
  - or:
      - builtin.filecontent:
          pattern: import
        from: refs
      - not:
          builtin.hasTags:
            - Spring
"#,
        )
        .unwrap();
        let Condition::And(children) = &condition else {
            panic!("expected `and` root");
        };
        assert_eq!(children.len(), 2);
        let Condition::Provider(call) = &children[0] else {
            panic!("expected provider leaf");
        };
        assert_eq!(call.provider, "java");
        assert_eq!(call.capability, "referenced");
        assert_eq!(call.as_name.as_deref(), Some("refs"));
        assert!(condition.references_capability(HAS_TAGS_CAPABILITY));
    }

    #[test]
    fn deserialize_chain_reference() {
        let condition: Condition = serde_yaml::from_str("from: refs").unwrap();
        assert!(matches!(
            condition,
            Condition::Chain(ChainRef { ref from }) if from == "refs"
        ));
    }

    #[test]
    fn deserialize_rejects_malformed_conditions() {
        for source in [
            "and: []",
            "unqualified: {}",
            "{java.referenced: {}, dotnet.referenced: {}}",
            "[]",
        ] {
            assert!(serde_yaml::from_str::<Condition>(source).is_err(), "{source}");
        }
    }
}
