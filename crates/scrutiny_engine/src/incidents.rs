use itertools::Itertools;
use lazy_regex::regex_captures;
use log::warn;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

use crate::context::IncidentContext;
use crate::results::{Incident, Violation};
use crate::rules::Rule;
use crate::scope::Scope;
use crate::settings::EngineSettings;
use crate::{snippet, templating};

/// Variable key under which an incident's line number is exposed to message
/// and tag templates.
pub(crate) const LINE_NUMBER_VARIABLE: &str = "lineNumber";

/// Run the matched incidents of one rule through the post-processing
/// pipeline and assemble the violation.
///
/// Per incident, in order: incident-limit early exit, scope filter,
/// location-prefix rewrite, code snippet, custom variables, message
/// rendering, incident selector, deduplication. Failures degrade the
/// incident (empty snippet or message) rather than failing the rule.
/// Returns `None` when no incident survives, which reports the rule as
/// unmatched.
pub(crate) fn build_violation(
    rule: &Rule,
    incidents: &[IncidentContext],
    scope: Option<&dyn Scope>,
    settings: &EngineSettings,
) -> Option<Violation> {
    let mut accepted: Vec<Incident> = Vec::new();
    let mut seen: FxHashSet<(String, String, i64)> = FxHashSet::default();
    let mut snips_per_file: FxHashMap<String, usize> = FxHashMap::default();

    for incident in incidents {
        if settings.incident_limit > 0 && accepted.len() >= settings.incident_limit {
            break;
        }
        if scope.is_some_and(|scope| scope.filter_incident(incident)) {
            continue;
        }
        let mut incident = incident.clone();
        rewrite_location(&mut incident, &settings.location_prefixes);
        let code_snip = attach_snippet(rule, &mut incident, settings, &mut snips_per_file);
        apply_custom_variables(rule, &mut incident);
        let message = render_message(rule, &incident);

        if let Some(selector) = &settings.incident_selector {
            if !selector.matches_collected(&variables_as_labels(&incident)) {
                continue;
            }
        }

        let key = (
            incident.file_uri.clone(),
            message.clone(),
            incident.line_number.map_or(-1, |line| line as i64),
        );
        if !seen.insert(key) {
            continue;
        }

        accepted.push(Incident {
            file_uri: incident.file_uri,
            message,
            code_snip,
            line_number: incident.line_number,
            code_location: incident.code_location,
            variables: incident.variables,
        });
    }

    if accepted.is_empty() {
        return None;
    }
    Some(Violation {
        description: rule.description.clone(),
        category: rule.category,
        labels: dedup_preserve_order(rule.labels.clone()),
        incidents: accepted,
        links: rule
            .perform
            .message
            .as_ref()
            .map(|message| message.links.clone())
            .unwrap_or_default(),
        effort: rule.effort,
    })
}

pub(crate) fn dedup_preserve_order(labels: Vec<String>) -> Vec<String> {
    labels.into_iter().unique().collect()
}

/// Rewrite an incident's location relative to the first matching configured
/// prefix, mirroring the rewrite into the `file` variable when present.
fn rewrite_location(incident: &mut IncidentContext, prefixes: &[String]) {
    if prefixes.is_empty() {
        return;
    }
    let path = incident
        .file_uri
        .strip_prefix("file://")
        .unwrap_or(&incident.file_uri);
    for prefix in prefixes {
        if let Some(relative) = path.strip_prefix(prefix.as_str()) {
            let relative = relative.trim_start_matches('/').to_string();
            if incident.variables.contains_key("file") {
                incident
                    .variables
                    .insert("file".to_string(), Value::String(relative.clone()));
            }
            incident.file_uri = relative;
            return;
        }
    }
}

/// Resolve the incident's snippet: rule snipper override, then a snippet
/// the provider pre-computed, then `file://` extraction. Honors the
/// per-file snippet cap; capped incidents keep an empty snippet.
fn attach_snippet(
    rule: &Rule,
    incident: &mut IncidentContext,
    settings: &EngineSettings,
    snips_per_file: &mut FxHashMap<String, usize>,
) -> String {
    let count = snips_per_file
        .entry(incident.file_uri.clone())
        .or_default();
    if settings.code_snip_limit > 0 && *count >= settings.code_snip_limit {
        incident.code_snip = None;
        return String::new();
    }

    let code_snip = if let Some(snipper) = &rule.snipper {
        match snipper.snip(incident) {
            Ok(code_snip) => Some(code_snip),
            Err(err) => {
                warn!(
                    "custom snipper failed for {} in rule {}: {err:#}",
                    incident.file_uri, rule.rule_id
                );
                None
            }
        }
    } else if incident.code_snip.is_some() {
        incident.code_snip.clone()
    } else {
        match snippet::extract(incident, settings) {
            Ok(code_snip) => code_snip,
            Err(err) => {
                warn!(
                    "failed to extract code snippet for {}: {err:#}",
                    incident.file_uri
                );
                None
            }
        }
    };

    match code_snip {
        Some(code_snip) if !code_snip.is_empty() => {
            *count += 1;
            incident.code_snip = Some(code_snip.clone());
            code_snip
        }
        _ => {
            incident.code_snip = None;
            String::new()
        }
    }
}

/// Extract each custom variable from the snippet line the incident points
/// at: named capture group first, then the first capture group, then the
/// whole match; on no match the default value, if any.
fn apply_custom_variables(rule: &Rule, incident: &mut IncidentContext) {
    if rule.custom_variables.is_empty() {
        return;
    }
    let subject = anchor_line(incident);
    for variable in &rule.custom_variables {
        let value = match variable.pattern.captures(&subject) {
            Some(captures) => {
                let capture = variable
                    .name_of_capture_group
                    .as_deref()
                    .and_then(|name| captures.name(name))
                    .or_else(|| captures.get(1))
                    .or_else(|| captures.get(0));
                capture.map(|capture| capture.as_str().trim().to_string())
            }
            None => variable.default_value.clone(),
        };
        if let Some(value) = value {
            incident
                .variables
                .insert(variable.name.clone(), Value::String(value));
        }
    }
}

/// The snippet line carrying the incident's line number, with the
/// `<number>  ` prefix stripped.
fn anchor_line(incident: &IncidentContext) -> String {
    let (Some(line_number), Some(code_snip)) = (incident.line_number, &incident.code_snip) else {
        return String::new();
    };
    for line in code_snip.lines() {
        let Some((_, prefix, content)) = regex_captures!(r"^(\s*\d+ {2})?(.*)", line) else {
            continue;
        };
        if prefix.trim().parse::<usize>() == Ok(line_number) {
            return content.to_string();
        }
    }
    String::new()
}

fn render_message(rule: &Rule, incident: &IncidentContext) -> String {
    let Some(text) = rule
        .perform
        .message
        .as_ref()
        .and_then(|message| message.text.as_deref())
    else {
        return String::new();
    };
    let mut variables = incident.variables.clone();
    if let Some(line_number) = incident.line_number {
        variables.insert(LINE_NUMBER_VARIABLE.to_string(), Value::from(line_number));
    }
    match templating::render(text, &variables) {
        Ok(message) => message,
        Err(err) => {
            warn!("failed to render message for rule {}: {err}", rule.rule_id);
            String::new()
        }
    }
}

/// An incident's variables viewed as labels for the incident selector:
/// each variable contributes `name=stringified-value`.
fn variables_as_labels(incident: &IncidentContext) -> FxHashMap<String, Vec<String>> {
    incident
        .variables
        .iter()
        .map(|(name, value)| {
            let value = match value {
                Value::String(value) => value.clone(),
                other => other.to_string(),
            };
            (name.clone(), vec![value])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Rule;
    use pretty_assertions::assert_eq;
    use scrutiny_labels::LabelSelector;
    use serde_json::json;

    fn rule(yaml: &str) -> Rule {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn message_rule(text: &str) -> Rule {
        rule(&format!(
            r#"
ruleID: test-rule
effort: 1
when:
  test.match: {{}}
perform:
  message:
    text: "{text}"
"#
        ))
    }

    fn incident(uri: &str, line: Option<usize>) -> IncidentContext {
        IncidentContext {
            file_uri: uri.to_string(),
            line_number: line,
            ..IncidentContext::default()
        }
    }

    #[test]
    fn custom_variables_feed_the_message_template() {
        let rule = rule(
            r#"
ruleID: s4
effort: 1
when:
  test.match: {}
perform:
  message:
    text: "uses {{pkg}} at {{lineNumber}}"
customVariables:
  - name: pkg
    pattern: "import ([\\w.]+)"
"#,
        );
        let mut incident = incident("file:///app/Logger.java", Some(42));
        incident.code_snip = Some("42  import org.apache.Logger;".to_string());
        let violation =
            build_violation(&rule, &[incident], None, &EngineSettings::default()).unwrap();
        assert_eq!(
            violation.incidents[0].message,
            "uses org.apache.Logger at 42"
        );
        assert_eq!(
            violation.incidents[0].variables["pkg"],
            json!("org.apache.Logger")
        );
    }

    #[test]
    fn custom_variable_falls_back_to_default() {
        let rule = rule(
            r#"
ruleID: defaults
effort: 1
when:
  test.match: {}
perform:
  message:
    text: "pkg is {{pkg}}"
customVariables:
  - name: pkg
    pattern: "import ([\\w.]+)"
    defaultValue: unknown
"#,
        );
        let violation = build_violation(
            &rule,
            &[incident("file:///app/Empty.java", None)],
            None,
            &EngineSettings::default(),
        )
        .unwrap();
        assert_eq!(violation.incidents[0].message, "pkg is unknown");
    }

    #[test]
    fn named_capture_group_wins() {
        let rule = rule(
            r#"
ruleID: named
effort: 1
when:
  test.match: {}
customVariables:
  - name: version
    pattern: "(?P<artifact>[\\w-]+):(?P<version>[\\d.]+)"
    nameOfCaptureGroup: version
"#,
        );
        let mut incident = incident("file:///pom.xml", Some(7));
        incident.code_snip = Some("7  spring-core:5.3.2".to_string());
        let violation =
            build_violation(&rule, &[incident], None, &EngineSettings::default()).unwrap();
        assert_eq!(violation.incidents[0].variables["version"], json!("5.3.2"));
    }

    #[test]
    fn incidents_deduplicate_on_uri_message_line() {
        let rule = message_rule("same");
        let incidents = vec![
            incident("file:///a.java", Some(1)),
            incident("file:///a.java", Some(1)),
            incident("file:///a.java", Some(2)),
            incident("file:///a.java", None),
        ];
        let violation =
            build_violation(&rule, &incidents, None, &EngineSettings::default()).unwrap();
        assert_eq!(violation.incidents.len(), 3);
    }

    #[test]
    fn incident_limit_keeps_first_seen() {
        let rule = message_rule("at {{lineNumber}}");
        let incidents: Vec<_> = (1..=5)
            .map(|line| incident("file:///a.java", Some(line)))
            .collect();
        let settings = EngineSettings {
            incident_limit: 2,
            ..EngineSettings::default()
        };
        let violation = build_violation(&rule, &incidents, None, &settings).unwrap();
        assert_eq!(violation.incidents.len(), 2);
        assert_eq!(violation.incidents[0].line_number, Some(1));
        assert_eq!(violation.incidents[1].line_number, Some(2));
    }

    #[test]
    fn incident_selector_drops_non_matching_incidents() {
        let rule = message_rule("m");
        let mut matching = incident("file:///a.java", Some(1));
        matching
            .variables
            .insert("package".to_string(), json!("org.kept"));
        let mut dropped = incident("file:///b.java", Some(1));
        dropped
            .variables
            .insert("package".to_string(), json!("org.dropped"));
        let settings = EngineSettings {
            incident_selector: Some(LabelSelector::new("package=org.kept").unwrap()),
            ..EngineSettings::default()
        };
        let violation = build_violation(&rule, &[matching, dropped], None, &settings).unwrap();
        assert_eq!(violation.incidents.len(), 1);
        assert_eq!(violation.incidents[0].file_uri, "file:///a.java");
    }

    #[test]
    fn all_incidents_filtered_reports_unmatched() {
        let rule = message_rule("m");
        let settings = EngineSettings {
            incident_selector: Some(LabelSelector::new("package=org.kept").unwrap()),
            ..EngineSettings::default()
        };
        assert!(
            build_violation(
                &rule,
                &[incident("file:///a.java", Some(1))],
                None,
                &settings
            )
            .is_none()
        );
    }

    #[test]
    fn location_prefix_rewrites_uri_and_file_variable() {
        let rule = message_rule("m");
        let mut within = incident("file:///opt/app/src/Main.java", Some(1));
        within
            .variables
            .insert("file".to_string(), json!("/opt/app/src/Main.java"));
        let settings = EngineSettings {
            location_prefixes: vec!["/opt/app".to_string()],
            ..EngineSettings::default()
        };
        let violation = build_violation(&rule, &[within], None, &settings).unwrap();
        assert_eq!(violation.incidents[0].file_uri, "src/Main.java");
        assert_eq!(violation.incidents[0].variables["file"], json!("src/Main.java"));
    }

    #[test]
    fn failing_template_emits_incident_with_empty_message() {
        let rule = message_rule("broken {{#each}}");
        let violation = build_violation(
            &rule,
            &[incident("file:///a.java", Some(1))],
            None,
            &EngineSettings::default(),
        )
        .unwrap();
        assert_eq!(violation.incidents[0].message, "");
    }

    #[test]
    fn labels_deduplicate_preserving_first_seen_order() {
        let mut rule = message_rule("m");
        rule.labels = vec![
            "b=2".to_string(),
            "a=1".to_string(),
            "b=2".to_string(),
            "c".to_string(),
            "a=1".to_string(),
        ];
        let violation = build_violation(
            &rule,
            &[incident("file:///a.java", Some(1))],
            None,
            &EngineSettings::default(),
        )
        .unwrap();
        assert_eq!(violation.labels, vec!["b=2", "a=1", "c"]);
    }

    #[test]
    fn precomputed_snippets_honor_the_per_file_cap() {
        let rule = message_rule("at {{lineNumber}}");
        let incidents: Vec<_> = (1..=3)
            .map(|line| {
                let mut incident = incident("file:///a.java", Some(line));
                incident.code_snip = Some(format!("{line}  content"));
                incident
            })
            .collect();
        let settings = EngineSettings {
            code_snip_limit: 2,
            ..EngineSettings::default()
        };
        let violation = build_violation(&rule, &incidents, None, &settings).unwrap();
        assert_eq!(violation.incidents[0].code_snip, "1  content");
        assert_eq!(violation.incidents[1].code_snip, "2  content");
        assert_eq!(violation.incidents[2].code_snip, "");
    }
}
