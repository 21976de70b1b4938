pub mod selector;

pub use selector::{LabelSelector, SelectorSyntaxError};

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use lazy_regex::regex_is_match;
use rustc_hash::FxHashMap;
use thiserror::Error;

/// Key of the override label. A target carrying `konveyor.io/include=always`
/// matches every selector, `konveyor.io/include=never` matches none.
pub const INCLUDE_KEY: &str = "konveyor.io/include";
pub const INCLUDE_ALWAYS: &str = "always";
pub const INCLUDE_NEVER: &str = "never";

/// A parsed label: `key` or `key=value`, where `key` is `segment` or
/// `prefix/segment`.
///
/// The same key may appear on a target any number of times; see
/// [`collect_labels`] for the multimap form used during selector evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Label {
    key: String,
    value: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid label `{0}`")]
pub struct ParseLabelError(pub String);

impl Label {
    pub fn new(key: impl Into<String>, value: Option<String>) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }
}

impl FromStr for Label {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (key, value) = match s.split_once('=') {
            Some((key, value)) => (key, Some(value.to_string())),
            None => (s, None),
        };
        // `prefix` may be empty, `segment` must not be. Spaces are permitted
        // inside segments and values.
        if !regex_is_match!(
            r"^(?:(?:(?:[A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9])?/)?[A-Za-z0-9](?:[- A-Za-z0-9.]*[A-Za-z0-9])?$",
            key
        ) {
            return Err(ParseLabelError(s.to_string()));
        }
        Ok(Label {
            key: key.to_string(),
            value,
        })
    }
}

impl Display for Label {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={value}", self.key),
            None => write!(f, "{}", self.key),
        }
    }
}

/// Parse a list of label strings, collecting duplicate keys into a
/// `key -> [values...]` multimap. A label without a value contributes an empty
/// value string, so bare `key` labels still register key presence.
pub fn collect_labels<'a, I>(labels: I) -> Result<FxHashMap<String, Vec<String>>, ParseLabelError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut collected: FxHashMap<String, Vec<String>> = FxHashMap::default();
    for label in labels {
        let label: Label = label.parse()?;
        collected
            .entry(label.key)
            .or_default()
            .push(label.value.unwrap_or_default());
    }
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("key", "key", None; "bare key")]
    #[test_case("key=value", "key", Some("value"); "key and value")]
    #[test_case("konveyor.io/target=eap8+", "konveyor.io/target", Some("eap8+"); "prefixed with version range")]
    #[test_case("a-b.c=1.2.3", "a-b.c", Some("1.2.3"); "dots and dashes")]
    #[test_case("key=", "key", Some(""); "empty value")]
    #[test_case("key=has spaces", "key", Some("has spaces"); "spaces in value")]
    #[test_case("spaced key=v", "spaced key", Some("v"); "spaces in segment")]
    #[test_case("42=answer", "42", Some("answer"); "numeric key is still a label")]
    fn parse_label(input: &str, key: &str, value: Option<&str>) {
        let label: Label = input.parse().unwrap();
        assert_eq!(label.key(), key);
        assert_eq!(label.value(), value);
    }

    #[test_case(""; "empty")]
    #[test_case("-key"; "leading dash")]
    #[test_case("key-"; "trailing dash")]
    #[test_case("pre/fix/key"; "two slashes")]
    fn parse_label_rejects(input: &str) {
        assert!(input.parse::<Label>().is_err());
    }

    #[test_case("key"; "bare key")]
    #[test_case("key=value"; "key and value")]
    #[test_case("konveyor.io/target=eap8+"; "prefixed with version range")]
    #[test_case("key="; "empty value")]
    fn parse_format_round_trip(input: &str) {
        let label: Label = input.parse().unwrap();
        let reparsed: Label = label.to_string().parse().unwrap();
        assert_eq!(label, reparsed);
    }

    #[test]
    fn duplicate_keys_collect() {
        let collected =
            collect_labels(["target=eap7", "target=eap8", "source"].into_iter()).unwrap();
        assert_eq!(collected["target"], vec!["eap7", "eap8"]);
        assert_eq!(collected["source"], vec![""]);
    }
}
