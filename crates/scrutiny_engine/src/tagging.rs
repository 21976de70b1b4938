use lazy_regex::regex_captures;
use log::warn;
use rustc_hash::FxHashSet;
use serde_json::Value;

use crate::compile::CompiledRule;
use crate::context::ConditionContext;
use crate::incidents::{build_violation, dedup_preserve_order, LINE_NUMBER_VARIABLE};
use crate::provider::ProviderRegistry;
use crate::results::RuleSetResult;
use crate::scope::Scope;
use crate::settings::EngineSettings;
use crate::templating;

/// Evaluate the tagging rules synchronously on the caller thread,
/// materializing the tag set every regular rule will observe.
///
/// Rules gated on `hasTags` are stable-sorted after plain tagging rules so
/// a tag produced by rule X is visible to rule Y that depends on it. That
/// two-tier sort is the only dependency ordering performed: a `hasTags`
/// rule depending on tags produced by another `hasTags` rule is neither
/// detected nor reordered, and such catalogs must be split across runs.
pub(crate) fn run_tagging_rules(
    providers: &ProviderRegistry,
    settings: &EngineSettings,
    scope: Option<&dyn Scope>,
    mut tagging: Vec<CompiledRule>,
    ctx: &mut ConditionContext,
    results: &mut [RuleSetResult],
) {
    tagging.sort_by_key(|compiled| compiled.rule.uses_has_tags());
    let mut seen_tags: Vec<FxHashSet<String>> = vec![FxHashSet::default(); results.len()];

    for CompiledRule { ruleset, rule } in tagging {
        // A tag-with-message rule with positive effort also runs as a
        // cloned regular rule under the same id; the clone owns the rule's
        // unmatched verdict, so the pre-pass never records unmatched for it.
        let has_violation_clone = rule.has_message() && rule.effort() > 0;
        let mut rule_ctx = ctx.for_rule(&rule.rule_id);
        let response = match rule.when.evaluate(providers, &mut rule_ctx) {
            Ok(response) => response,
            Err(err) => {
                results[ruleset]
                    .errors
                    .insert(rule.rule_id.clone(), err.to_string());
                continue;
            }
        };
        if !response.matched || response.incidents.is_empty() {
            if !has_violation_clone {
                results[ruleset].unmatched.push(rule.rule_id.clone());
            }
            continue;
        }
        let Some(mut violation) = build_violation(&rule, &response.incidents, scope, settings)
        else {
            if !has_violation_clone {
                results[ruleset].unmatched.push(rule.rule_id.clone());
            }
            continue;
        };

        let mut tokens = Vec::new();
        for tag in rule.perform.tag.as_deref().unwrap_or_default() {
            if tag.contains("{{") {
                // Templated tags render once per incident, with that
                // incident's variables.
                for incident in &response.incidents {
                    let mut variables = incident.variables.clone();
                    if let Some(line_number) = incident.line_number {
                        variables
                            .insert(LINE_NUMBER_VARIABLE.to_string(), Value::from(line_number));
                    }
                    match templating::render(tag, &variables) {
                        Ok(rendered) => tokens.extend(split_tag_tokens(&rendered)),
                        Err(err) => warn!(
                            "failed to render tag `{tag}` for rule {}: {err}",
                            rule.rule_id
                        ),
                    }
                }
            } else {
                tokens.extend(split_tag_tokens(tag));
            }
        }

        for token in dedup_preserve_order(tokens) {
            ctx.tags.insert(token.clone());
            if seen_tags[ruleset].insert(token.clone()) {
                results[ruleset].tags.push(token.clone());
            }
            violation.labels.push(format!("tag={token}"));
        }
        violation.labels = dedup_preserve_order(violation.labels);

        if rule.effort() > 0 {
            results[ruleset]
                .violations
                .insert(rule.rule_id.clone(), violation);
        } else {
            violation.category = None;
            violation.effort = None;
            results[ruleset]
                .insights
                .insert(rule.rule_id.clone(), violation);
        }
    }
}

/// Split one rendered tag string into its tag tokens: an optional
/// `category=` prefix is dropped, the remainder splits on commas.
fn split_tag_tokens(raw: &str) -> Vec<String> {
    match regex_captures!(r"^(?:[\w ()-]+=)?([\w ()-]+(?:, *[\w (),-]+)*),?$", raw.trim()) {
        Some((_, tokens)) => tokens
            .split(',')
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .collect(),
        None => Vec::new(),
    }
}
