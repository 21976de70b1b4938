use std::fmt;
use std::sync::Arc;

use regex::Regex;
use scrutiny_labels::LabelSelector;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::conditions::{Condition, HAS_TAGS_CAPABILITY};
use crate::snippet::CodeSnipper;

/// Severity category of a rule.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Category {
    Mandatory,
    Potential,
    Optional,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub links: Vec<Link>,
}

/// What a matched rule does: emit tags, a templated message, or both.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Perform {
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub tag: Option<Vec<String>>,
}

/// Regex-driven extraction from the matched code snippet, bound to a name
/// usable in the message template.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomVariable {
    pub name: String,
    #[serde(deserialize_with = "regex_from_pattern")]
    pub pattern: Regex,
    #[serde(default)]
    pub name_of_capture_group: Option<String>,
    #[serde(default)]
    pub default_value: Option<String>,
}

fn regex_from_pattern<'de, D>(deserializer: D) -> Result<Regex, D::Error>
where
    D: Deserializer<'de>,
{
    let pattern = String::deserialize(deserializer)?;
    Regex::new(&pattern).map_err(de::Error::custom)
}

/// A single declarative rule.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(rename = "ruleID")]
    pub rule_id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<Category>,
    /// Remediation effort estimate. Absent or zero means a matched rule is
    /// an insight rather than a violation.
    #[serde(default)]
    pub effort: Option<u32>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub when: Condition,
    #[serde(default)]
    pub perform: Perform,
    #[serde(default)]
    pub custom_variables: Vec<CustomVariable>,
    /// Programmatic override for code-snippet extraction.
    #[serde(skip)]
    pub snipper: Option<Arc<dyn CodeSnipper>>,
}

impl Rule {
    /// Whether this rule's condition depends on tags from the tagging
    /// pre-pass.
    pub fn uses_has_tags(&self) -> bool {
        self.when.references_capability(HAS_TAGS_CAPABILITY)
    }

    pub(crate) fn is_tagging(&self) -> bool {
        self.perform.tag.as_ref().is_some_and(|tags| !tags.is_empty())
    }

    pub(crate) fn has_message(&self) -> bool {
        self.perform
            .message
            .as_ref()
            .is_some_and(|message| message.text.is_some())
    }

    pub(crate) fn effort(&self) -> u32 {
        self.effort.unwrap_or(0)
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("rule_id", &self.rule_id)
            .field("category", &self.category)
            .field("effort", &self.effort)
            .field("labels", &self.labels)
            .finish_non_exhaustive()
    }
}

/// A named bundle of rules sharing labels. The bundle's labels are
/// prepended to each member rule when the catalog is compiled.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleSet {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// Decides which rules of a catalog take part in a run. Selectors that
/// return `false` or fail put the rule into the ruleset's `skipped` list.
pub trait RuleSelector: Send + Sync {
    fn matches(&self, rule: &Rule) -> anyhow::Result<bool>;
}

impl RuleSelector for LabelSelector {
    fn matches(&self, rule: &Rule) -> anyhow::Result<bool> {
        Ok(self.matches_labels(&rule.labels)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rule(yaml: &str) -> Rule {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn deserialize_full_rule() {
        let rule = rule(
            r#"
ruleID: spring-to-quarkus-001
description: Replace the Spring artifact
category: mandatory
effort: 3
labels:
  - konveyor.io/source=spring
when:
  java.referenced:
    pattern: org.springframework.*
perform:
  message:
    text: "replace {{artifact}}"
    links:
      - url: https://example.com/migration
        title: Migration guide
customVariables:
  - name: artifact
    pattern: "import ([\\w.]+)"
    defaultValue: unknown
"#,
        );
        assert_eq!(rule.rule_id, "spring-to-quarkus-001");
        assert_eq!(rule.category, Some(Category::Mandatory));
        assert_eq!(rule.effort, Some(3));
        assert!(!rule.uses_has_tags());
        assert!(!rule.is_tagging());
        assert!(rule.has_message());
        assert_eq!(rule.custom_variables.len(), 1);
        assert_eq!(
            rule.custom_variables[0].default_value.as_deref(),
            Some("unknown")
        );
    }

    #[test]
    fn tagging_rule_detection() {
        let rule = rule(
            r#"
ruleID: discover-spring
when:
  builtin.filecontent:
    pattern: springframework
perform:
  tag: ["Spring"]
"#,
        );
        assert!(rule.is_tagging());
        assert_eq!(rule.effort(), 0);
    }

    #[test]
    fn has_tags_rule_detection() {
        let rule = rule(
            r#"
ruleID: needs-spring-tag
when:
  builtin.hasTags:
    - Spring
perform:
  tag: ["SpringDependent"]
"#,
        );
        assert!(rule.uses_has_tags());
    }

    #[test]
    fn invalid_custom_variable_pattern_fails_at_load() {
        let result: Result<Rule, _> = serde_yaml::from_str(
            r#"
ruleID: broken
when:
  builtin.file:
    pattern: "*.xml"
customVariables:
  - name: bad
    pattern: "("
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn category_parses_from_string() {
        assert_eq!("mandatory".parse::<Category>().unwrap(), Category::Mandatory);
        assert_eq!(Category::Potential.to_string(), "potential");
    }

    #[test]
    fn ruleset_defaults() {
        let rule_set: RuleSet = serde_yaml::from_str("name: empty").unwrap();
        assert_eq!(rule_set.name, "empty");
        assert!(rule_set.rules.is_empty());
        assert!(rule_set.labels.is_empty());
    }
}
