use log::warn;

use crate::results::RuleSetResult;
use crate::rules::{Rule, RuleSelector, RuleSet};

/// A rule ready for evaluation, bound to the ruleset (by index into the
/// run's result list) it reports into.
pub(crate) struct CompiledRule {
    pub ruleset: usize,
    pub rule: Rule,
}

/// Output of catalog compilation: empty-initialized per-ruleset results and
/// the tagging/regular partition of every selected rule.
pub(crate) struct CompiledRules {
    pub results: Vec<RuleSetResult>,
    pub tagging: Vec<CompiledRule>,
    pub regular: Vec<CompiledRule>,
}

/// Flatten rulesets into individual rules: prepend ruleset labels, apply
/// the rule selectors (a selector returning `false` or failing skips the
/// rule), and partition into tagging and regular rules.
///
/// A tagging rule that also carries a message and positive effort is
/// cloned into a regular rule with the tag cleared and `tag=<t>` labels
/// attached, so the violation is produced by the worker pool while the tag
/// still comes from the pre-pass.
pub(crate) fn compile(rule_sets: &[RuleSet], selectors: &[&dyn RuleSelector]) -> CompiledRules {
    let mut results = Vec::with_capacity(rule_sets.len());
    let mut tagging = Vec::new();
    let mut regular = Vec::new();

    for (ruleset, rule_set) in rule_sets.iter().enumerate() {
        let mut result = RuleSetResult::new(&rule_set.name, rule_set.description.as_ref());

        'rules: for rule in &rule_set.rules {
            let mut rule = rule.clone();
            let mut labels = rule_set.labels.clone();
            labels.append(&mut rule.labels);
            rule.labels = labels;

            for selector in selectors {
                match selector.matches(&rule) {
                    Ok(true) => {}
                    Ok(false) => {
                        result.skipped.push(rule.rule_id.clone());
                        continue 'rules;
                    }
                    Err(err) => {
                        warn!("skipping rule {}: selector failed: {err:#}", rule.rule_id);
                        result.skipped.push(rule.rule_id.clone());
                        continue 'rules;
                    }
                }
            }

            if !rule.is_tagging() {
                regular.push(CompiledRule { ruleset, rule });
                continue;
            }
            if let Some(clone) = violation_clone(&rule) {
                regular.push(CompiledRule {
                    ruleset,
                    rule: clone,
                });
            }
            tagging.push(CompiledRule { ruleset, rule });
        }

        results.push(result);
    }

    CompiledRules {
        results,
        tagging,
        regular,
    }
}

/// The regular-rule clone of a tag-with-message rule. Zero-effort tag
/// rules produce only an insight from the pre-pass and are not cloned.
fn violation_clone(rule: &Rule) -> Option<Rule> {
    if !rule.has_message() || rule.effort() == 0 {
        return None;
    }
    let mut clone = rule.clone();
    for tag in clone.perform.tag.take().unwrap_or_default() {
        clone.labels.push(format!("tag={tag}"));
    }
    Some(clone)
}
